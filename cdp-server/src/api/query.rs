use std::io::{BufRead, BufReader};

use anyhow::{Context, Error};
use cdp_api_types::{BlockHash, FileListQuery, WireBlock, WireMetadata};
use cdp_datastore::ChunkStore;
use regex::RegexBuilder;

/// Response body for `GET /File/List.json` (§4.9, §6.1).
#[derive(serde::Serialize, serde::Deserialize)]
pub struct FileListResponse {
    pub files: Vec<WireMetadata>,
}

/// `GET /File/List.json?...` (§4.9): filter every host's metadata log by
/// the query parameters, optionally collapsing to the single latest record
/// per path (`latest=true`).
pub fn handle_file_list(store: &ChunkStore, query_string: &str) -> Result<FileListResponse, Error> {
    let query = FileListQuery::from_query_string(query_string)?;
    let path_regex = match &query.path_regex {
        Some(pattern) => Some(
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .with_context(|| format!("invalid filename regex {pattern:?}"))?,
        ),
        None => None,
    };

    let hostnames = match &query.hostname {
        Some(h) => vec![h.clone()],
        None => store.known_hostnames()?,
    };

    let mut matches = Vec::new();
    for hostname in hostnames {
        let file = match store.open_metadata_log(&hostname)? {
            Some(file) => file,
            None => continue,
        };
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let wire = match WireMetadata::from_log_line(&line) {
                Ok(wire) => wire,
                Err(err) => {
                    log::warn!("skipping malformed metadata log line for {hostname}: {err}");
                    continue;
                }
            };
            let mut wire = wire;
            wire.hostname = hostname.clone();
            if matches_query(&wire, &query, path_regex.as_ref()) {
                matches.push(wire);
            }
        }
    }

    if query.latest_only {
        matches = latest_per_path(matches);
    }

    Ok(FileListResponse { files: matches })
}

fn matches_query(wire: &WireMetadata, query: &FileListQuery, path_regex: Option<&regex::Regex>) -> bool {
    if let Some(uid) = query.uid {
        if wire.uid != uid {
            return false;
        }
    }
    if let Some(gid) = query.gid {
        if wire.gid != gid {
            return false;
        }
    }
    if let Some(owner) = &query.owner {
        if &wire.owner != owner {
            return false;
        }
    }
    if let Some(group) = &query.group {
        if &wire.group != group {
            return false;
        }
    }
    if let Some(re) = path_regex {
        if !re.is_match(&wire.name) {
            return false;
        }
    }
    if let Some(exact) = &query.exact_date {
        if parse_timestamp(exact) != Some(wire.mtime) {
            return false;
        }
    }
    if let Some(after) = &query.after_date {
        if let Some(t) = parse_timestamp(after) {
            if wire.mtime < t {
                return false;
            }
        }
    }
    if let Some(before) = &query.before_date {
        if let Some(t) = parse_timestamp(before) {
            if wire.mtime > t {
                return false;
            }
        }
    }
    true
}

/// Date filters are accepted as unix timestamps; this is the simplest
/// unambiguous format that survives the base64 query encoding untouched.
fn parse_timestamp(s: &str) -> Option<i64> {
    s.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdp_api_types::{FileType, Metadata};

    fn entry(path: &str, mtime: i64) -> WireMetadata {
        WireMetadata::from_metadata(&Metadata {
            file_type: FileType::Regular,
            inode: 1,
            mode: 0o644,
            uid: 0,
            gid: 0,
            owner: "root".to_string(),
            group: "root".to_string(),
            atime: mtime,
            ctime: mtime,
            mtime,
            size: 0,
            path: path.to_string(),
            link_target: String::new(),
            block_list: vec![],
            hostname: "host1".to_string(),
            data_already_sent: true,
        })
    }

    #[test]
    fn latest_per_path_keeps_the_newest_mtime_per_path() {
        let entries = vec![entry("/a", 1), entry("/a", 5), entry("/a", 3)];
        let latest = latest_per_path(entries);
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].mtime, 5);
    }

    #[test]
    fn latest_per_path_keeps_distinct_paths_separate() {
        let entries = vec![entry("/a", 1), entry("/b", 2)];
        let latest = latest_per_path(entries);
        assert_eq!(latest.len(), 2);
    }

    #[test]
    fn matches_query_filters_by_uid_and_regex() {
        let mut query = FileListQuery::default();
        query.uid = Some(1000);
        let wire = entry("/home/alice/file", 1);

        assert!(!matches_query(&wire, &query, None));

        let mut wire_matching_uid = entry("/home/alice/file", 1);
        wire_matching_uid.uid = 1000;
        assert!(matches_query(&wire_matching_uid, &query, None));
    }

    #[test]
    fn parse_timestamp_rejects_non_numeric_input() {
        assert_eq!(parse_timestamp("not-a-number"), None);
        assert_eq!(parse_timestamp("42"), Some(42));
    }
}

fn latest_per_path(entries: Vec<WireMetadata>) -> Vec<WireMetadata> {
    use std::collections::HashMap;
    let mut by_path: HashMap<String, WireMetadata> = HashMap::new();
    for entry in entries {
        match by_path.get(&entry.name) {
            Some(existing) if existing.mtime >= entry.mtime => {}
            _ => {
                by_path.insert(entry.name.clone(), entry);
            }
        }
    }
    by_path.into_values().collect()
}

/// `GET /Data/<hash>.json` (§6.1): fetch a single block by its hex hash.
pub fn handle_data_get(store: &ChunkStore, hex_hash: &str) -> Result<WireBlock, Error> {
    let hash = BlockHash::from_hex(hex_hash)?;
    let data = store.read_block(hash)?;
    let block = cdp_api_types::Block::new_uncompressed(data);
    Ok(WireBlock::from_block(&block))
}

/// `GET /Data/Hash_Array.json` + header `X-Get-Hash-Array` (§4.9, §6.1):
/// bulk-fetch several blocks in one round trip, used by the restore CLI's
/// §4.10 fetch phase. `header_value` is a comma-separated list of base64
/// hashes; the response is the blocks' raw bytes concatenated in the same
/// order, so a missing or malformed hash fails the whole request rather
/// than being silently dropped — once bytes are joined there is no way to
/// tell a present block apart from a skipped one.
pub fn handle_data_hash_array(store: &ChunkStore, header_value: &str) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    for raw in header_value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let hash = BlockHash::from_base64(raw)
            .with_context(|| format!("malformed hash {raw:?} in X-Get-Hash-Array"))?;
        let data = store
            .read_block(hash)
            .with_context(|| format!("block {hash} requested but unavailable"))?;
        out.extend_from_slice(&data);
    }
    Ok(out)
}

#[cfg(test)]
mod hash_array_tests {
    use super::*;
    use cdp_api_types::Block;
    use std::sync::atomic::{AtomicU32, Ordering};

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    fn scratch_store() -> ChunkStore {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!("cdp-hash-array-test-{}-{n}", std::process::id()));
        ChunkStore::open(dir, 1).unwrap()
    }

    #[test]
    fn concatenates_blocks_in_header_order() {
        let store = scratch_store();
        let a = Block::new_uncompressed(b"hello ".to_vec());
        let b = Block::new_uncompressed(b"world".to_vec());
        store.write_block(&a).unwrap();
        store.write_block(&b).unwrap();

        let header = format!("{},{}", a.hash.to_base64(), b.hash.to_base64());
        let bytes = handle_data_hash_array(&store, &header).unwrap();
        assert_eq!(bytes, b"hello world");

        let reversed = format!("{},{}", b.hash.to_base64(), a.hash.to_base64());
        let bytes = handle_data_hash_array(&store, &reversed).unwrap();
        assert_eq!(bytes, b"worldhello ");
    }

    #[test]
    fn fails_the_whole_request_on_a_missing_block() {
        let store = scratch_store();
        let present = Block::new_uncompressed(b"present".to_vec());
        store.write_block(&present).unwrap();
        let missing_hash = BlockHash::from_bytes(b"never written");

        let header = format!("{},{}", present.hash.to_base64(), missing_hash.to_base64());
        assert!(handle_data_hash_array(&store, &header).is_err());
    }

    #[test]
    fn fails_on_a_malformed_hash() {
        let store = scratch_store();
        assert!(handle_data_hash_array(&store, "not-valid-base64!!!").is_err());
    }

    #[test]
    fn empty_header_returns_empty_bytes() {
        let store = scratch_store();
        assert_eq!(handle_data_hash_array(&store, "").unwrap(), Vec::<u8>::new());
    }
}
