use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{bail, format_err, Context, Error};
use cdp_api_types::{Block, BlockHash, WireMetadata};

/// File system based, content-addressed block store plus per-host
/// append-only metadata log (§4.8, §6.2).
///
/// Layout under `root`:
/// - `data/<aa>/<bb>/<hex-hash>` — one file per unique block, `aa`/`bb` the
///   first `dir_level` bytes of the hex digest (2 hex chars each).
/// - `meta/<hostname>` — one append-only text log per client hostname.
/// - `.initialized` — marker written once the `dir_level`-deep directory
///   tree has been pre-created, so later writes never fault on `mkdir`.
pub struct ChunkStore {
    root: PathBuf,
    data_dir: PathBuf,
    meta_dir: PathBuf,
    dir_level: usize,
    /// Serializes metadata-log appends so each hostname has exactly one
    /// appender at a time (§5, "per-host metadata-log single-appender rule").
    append_lock: Mutex<()>,
}

impl ChunkStore {
    pub fn open<P: Into<PathBuf>>(root: P, dir_level: usize) -> Result<Self, Error> {
        let root: PathBuf = root.into();
        if !(1..=5).contains(&dir_level) {
            bail!("dir_level must be between 1 and 5, got {dir_level}");
        }
        let data_dir = root.join("data");
        let meta_dir = root.join("meta");
        fs::create_dir_all(&data_dir)
            .with_context(|| format!("unable to create data dir {data_dir:?}"))?;
        fs::create_dir_all(&meta_dir)
            .with_context(|| format!("unable to create meta dir {meta_dir:?}"))?;

        let store = Self {
            root,
            data_dir,
            meta_dir,
            dir_level,
            append_lock: Mutex::new(()),
        };
        store.ensure_precreated()?;
        Ok(store)
    }

    fn marker_path(&self) -> PathBuf {
        self.root.join(".initialized")
    }

    /// Pre-create the `dir_level`-deep shard directory tree so later writes
    /// never fault on a missing parent directory (§4.8 "Initialization").
    fn ensure_precreated(&self) -> Result<(), Error> {
        if self.marker_path().exists() {
            return Ok(());
        }

        log::info!(
            "pre-creating {}-level shard tree under {:?}",
            self.dir_level,
            self.data_dir
        );
        self.precreate_level(&self.data_dir, self.dir_level)?;

        File::create(self.marker_path())
            .with_context(|| "unable to write chunk store init marker")?;
        Ok(())
    }

    fn precreate_level(&self, base: &Path, levels_remaining: usize) -> Result<(), Error> {
        if levels_remaining == 0 {
            return Ok(());
        }
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut last_percentage = 0;
        for (i, hi) in HEX.iter().enumerate() {
            for lo in HEX.iter() {
                let name = format!("{}{}", *hi as char, *lo as char);
                let path = base.join(name);
                fs::create_dir_all(&path)
                    .with_context(|| format!("unable to create shard dir {path:?}"))?;
                if levels_remaining > 1 {
                    self.precreate_level(&path, levels_remaining - 1)?;
                }
            }
            let percentage = (i * 100) / HEX.len();
            if percentage != last_percentage {
                log::debug!("chunk store create: {percentage}%");
                last_percentage = percentage;
            }
        }
        Ok(())
    }

    /// Resolve the on-disk path for a block's hash, first byte per level.
    pub fn block_path(&self, hash: BlockHash) -> PathBuf {
        let hex = hash.to_hex();
        let mut path = self.data_dir.clone();
        for level in 0..self.dir_level {
            path.push(&hex[level * 2..level * 2 + 2]);
        }
        path.push(&hex);
        path
    }

    pub fn has_block(&self, hash: BlockHash) -> bool {
        self.block_path(hash).is_file()
    }

    /// Write a block if not already present (I5, write-once). A concurrent
    /// writer racing to create the same hash is harmless: both end up with
    /// identical content, so the loser's write is simply redundant.
    pub fn write_block(&self, block: &Block) -> Result<(), Error> {
        let path = self.block_path(block.hash);
        if path.is_file() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp_path)
                .with_context(|| format!("unable to create block file {tmp_path:?}"))?;
            file.write_all(&block.data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &path)
            .with_context(|| format!("unable to finalize block file {path:?}"))?;
        Ok(())
    }

    pub fn read_block(&self, hash: BlockHash) -> Result<Vec<u8>, Error> {
        let path = self.block_path(hash);
        let mut file =
            File::open(&path).with_context(|| format!("unable to open block file {path:?}"))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        Ok(data)
    }

    /// Given a list of hashes, return the subset the store does not
    /// already have (§4.8 "Needed-hash query").
    pub fn needed_hashes(&self, hashes: &[BlockHash]) -> Vec<BlockHash> {
        hashes
            .iter()
            .copied()
            .filter(|h| !self.has_block(*h))
            .collect()
    }

    fn metadata_log_path(&self, hostname: &str) -> PathBuf {
        self.meta_dir.join(hostname)
    }

    /// Append one line to `<root>/meta/<hostname>` (§4.8 "Metadata append").
    pub fn append_metadata(&self, hostname: &str, wire: &WireMetadata) -> Result<(), Error> {
        let _guard = self.append_lock.lock().unwrap();
        let path = self.metadata_log_path(hostname);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("unable to open metadata log {path:?}"))?;
        writeln!(file, "{}", wire.to_log_line())?;
        Ok(())
    }

    /// Open the per-host metadata log for reading, used by the query path.
    pub fn open_metadata_log(&self, hostname: &str) -> Result<Option<File>, Error> {
        let path = self.metadata_log_path(hostname);
        match File::open(&path) {
            Ok(file) => Ok(Some(file)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => {
                Err(format_err!("unable to open metadata log {path:?} - {err}"))
            }
        }
    }

    /// List hostnames that have a metadata log, for the server's query
    /// surface when no hostname filter is given.
    pub fn known_hostnames(&self) -> Result<Vec<String>, Error> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.meta_dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_block_roundtrips() {
        let dir = tempdir();
        let store = ChunkStore::open(dir.path(), 2).unwrap();
        let block = Block::new_uncompressed(b"hello world".to_vec());
        store.write_block(&block).unwrap();
        assert!(store.has_block(block.hash));
        let data = store.read_block(block.hash).unwrap();
        assert_eq!(data, block.data);
    }

    #[test]
    fn write_block_is_idempotent() {
        let dir = tempdir();
        let store = ChunkStore::open(dir.path(), 2).unwrap();
        let block = Block::new_uncompressed(b"dup".to_vec());
        store.write_block(&block).unwrap();
        store.write_block(&block).unwrap();
        assert_eq!(store.read_block(block.hash).unwrap(), block.data);
    }

    #[test]
    fn needed_hashes_filters_present_blocks() {
        let dir = tempdir();
        let store = ChunkStore::open(dir.path(), 2).unwrap();
        let a = Block::new_uncompressed(b"a".to_vec());
        let b = Block::new_uncompressed(b"b".to_vec());
        store.write_block(&a).unwrap();
        let needed = store.needed_hashes(&[a.hash, b.hash]);
        assert_eq!(needed, vec![b.hash]);
    }

    #[test]
    fn metadata_append_and_read_back() {
        let dir = tempdir();
        let store = ChunkStore::open(dir.path(), 1).unwrap();
        let meta = cdp_api_types::Metadata {
            file_type: cdp_api_types::FileType::Regular,
            inode: 1,
            mode: 0o644,
            uid: 0,
            gid: 0,
            owner: "root".to_string(),
            group: "root".to_string(),
            atime: 0,
            ctime: 0,
            mtime: 0,
            size: 0,
            path: "/tmp/x".to_string(),
            link_target: String::new(),
            block_list: vec![],
            hostname: "host1".to_string(),
            data_already_sent: true,
        };
        let wire = WireMetadata::from_metadata(&meta);
        store.append_metadata("host1", &wire).unwrap();
        let mut file = store.open_metadata_log("host1").unwrap().unwrap();
        let mut contents = String::new();
        file.read_to_string(&mut contents).unwrap();
        assert!(contents.contains("/tmp/x"));
    }

    fn tempdir() -> tempfile_like::TempDir {
        tempfile_like::TempDir::new()
    }

    /// Minimal stand-in for `tempfile::TempDir` so tests don't need an
    /// extra dev-dependency: creates a unique directory under the OS temp
    /// dir and removes it on drop.
    mod tempfile_like {
        use std::path::{Path, PathBuf};

        pub struct TempDir(PathBuf);

        impl TempDir {
            pub fn new() -> Self {
                let mut path = std::env::temp_dir();
                let unique = format!(
                    "cdp-datastore-test-{}-{}",
                    std::process::id(),
                    std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .unwrap()
                        .as_nanos()
                );
                path.push(unique);
                std::fs::create_dir_all(&path).unwrap();
                Self(path)
            }

            pub fn path(&self) -> &Path {
                &self.0
            }
        }

        impl Drop for TempDir {
            fn drop(&mut self) {
                let _ = std::fs::remove_dir_all(&self.0);
            }
        }
    }
}
