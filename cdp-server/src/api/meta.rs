use anyhow::{bail, Error};
use cdp_api_types::{
    Block, BlockHash, CompressionTag, HashListRequest, HashListResponse, SuccessResponse,
    WireBlock, WireMetadata,
};
use cdp_datastore::ChunkStore;

/// `POST /Meta.json` (§4.7, §6.1): record the metadata line and answer with
/// the subset of its block-list the store does not already hold.
pub fn handle_meta(store: &ChunkStore, body: &[u8]) -> Result<HashListResponse, Error> {
    let wire: WireMetadata = serde_json::from_slice(body)?;
    let mut block_list = Vec::with_capacity(wire.hash_list.len());
    for raw in &wire.hash_list {
        match BlockHash::from_base64(raw) {
            Ok(hash) => block_list.push(hash),
            Err(err) => log::warn!("dropping malformed hash {raw:?} in Meta request: {err}"),
        }
    }
    let needed = store.needed_hashes(&block_list);
    let hostname = wire.hostname.clone();
    store.append_metadata(&hostname, &wire)?;
    Ok(HashListResponse {
        hash_list: needed.into_iter().map(|h| h.to_base64()).collect(),
    })
}

/// `POST /Hash_Array.json` (§4.7, §6.1): answer which of the given hashes
/// the store still needs, without touching the metadata log. Malformed
/// individual hashes are dropped with a warning rather than failing the
/// whole batch (§7 "Parse failure").
pub fn handle_hash_array(store: &ChunkStore, body: &[u8]) -> Result<HashListResponse, Error> {
    let req: HashListRequest = serde_json::from_slice(body)?;
    let mut hashes = Vec::with_capacity(req.hash_list.len());
    for raw in &req.hash_list {
        match BlockHash::from_base64(raw) {
            Ok(hash) => hashes.push(hash),
            Err(err) => log::warn!("dropping malformed hash {raw:?} in Hash_Array request: {err}"),
        }
    }
    let needed = store.needed_hashes(&hashes);
    Ok(HashListResponse {
        hash_list: needed.into_iter().map(|h| h.to_base64()).collect(),
    })
}

/// `POST /Data.json` (§4.7, §6.1): store one block, after verifying its
/// declared hash actually matches its content (§8 "block integrity").
pub fn handle_data(store: &ChunkStore, body: &[u8]) -> Result<SuccessResponse, Error> {
    let wire: WireBlock = serde_json::from_slice(body)?;
    store_block(store, wire)?;
    Ok(SuccessResponse::ok())
}

/// `POST /Data_Array.json` (§4.7, §6.1): store a batch of blocks.
pub fn handle_data_array(store: &ChunkStore, body: &[u8]) -> Result<SuccessResponse, Error> {
    #[derive(serde::Deserialize)]
    struct DataArray {
        data_array: Vec<WireBlock>,
    }
    let req: DataArray = serde_json::from_slice(body)?;
    for wire in req.data_array {
        store_block(store, wire)?;
    }
    Ok(SuccessResponse::ok())
}

fn store_block(store: &ChunkStore, wire: WireBlock) -> Result<(), Error> {
    let declared_hash = BlockHash::from_base64(&wire.hash)?;
    let payload = base64::decode(&wire.data)?;
    let block = match wire.cmptype {
        CompressionTag::None => Block::new_uncompressed(payload),
        CompressionTag::Deflate => {
            let decompressed = inflate(&payload)?;
            let mut block = Block::new_uncompressed(decompressed);
            block.cmptype = CompressionTag::Deflate;
            block
        }
    };
    if block.hash != declared_hash {
        bail!(
            "block hash mismatch: declared {} computed {}",
            declared_hash,
            block.hash
        );
    }
    store.write_block(&block)
}

fn inflate(data: &[u8]) -> Result<Vec<u8>, Error> {
    use std::io::Read;
    let mut decoder = flate2::read::DeflateDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdp_api_types::{FileType, Metadata};
    use std::sync::atomic::{AtomicU32, Ordering};

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    fn scratch_store() -> ChunkStore {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!("cdp-meta-test-{}-{n}", std::process::id()));
        ChunkStore::open(dir, 1).unwrap()
    }

    fn sample_metadata(path: &str, hashes: Vec<BlockHash>) -> WireMetadata {
        WireMetadata::from_metadata(&Metadata {
            file_type: FileType::Regular,
            inode: 1,
            mode: 0o644,
            uid: 0,
            gid: 0,
            owner: "root".to_string(),
            group: "root".to_string(),
            atime: 1,
            ctime: 1,
            mtime: 1,
            size: 3,
            path: path.to_string(),
            link_target: String::new(),
            block_list: hashes,
            hostname: "host1".to_string(),
            data_already_sent: false,
        })
    }

    #[test]
    fn handle_meta_reports_the_block_it_does_not_have() {
        let store = scratch_store();
        let hash = BlockHash::from_bytes(b"abc");
        let wire = sample_metadata("/tmp/x", vec![hash]);
        let body = serde_json::to_vec(&wire).unwrap();

        let resp = handle_meta(&store, &body).unwrap();
        assert_eq!(resp.hash_list, vec![hash.to_base64()]);
    }

    #[test]
    fn handle_meta_appends_a_log_line_the_query_path_can_read_back() {
        let store = scratch_store();
        let wire = sample_metadata("/tmp/y", vec![]);
        let body = serde_json::to_vec(&wire).unwrap();
        handle_meta(&store, &body).unwrap();

        let hostnames = store.known_hostnames().unwrap();
        assert_eq!(hostnames, vec!["host1".to_string()]);
    }

    #[test]
    fn handle_data_rejects_a_block_whose_hash_does_not_match_its_content() {
        let store = scratch_store();
        let real = Block::new_uncompressed(b"hello".to_vec());
        let mut wire = WireBlock::from_block(&real);
        wire.hash = BlockHash::from_bytes(b"not hello").to_base64();
        let body = serde_json::to_vec(&wire).unwrap();

        assert!(handle_data(&store, &body).is_err());
    }

    #[test]
    fn handle_data_then_hash_array_reports_it_as_no_longer_needed() {
        let store = scratch_store();
        let block = Block::new_uncompressed(b"present".to_vec());
        let wire = WireBlock::from_block(&block);
        let body = serde_json::to_vec(&wire).unwrap();
        handle_data(&store, &body).unwrap();

        let req = HashListRequest {
            hash_list: vec![block.hash.to_base64()],
        };
        let resp = handle_hash_array(&store, &serde_json::to_vec(&req).unwrap()).unwrap();
        assert!(resp.hash_list.is_empty());
    }
}
