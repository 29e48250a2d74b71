use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Error};
use cdp_api_types::{Block, BlockHash, FileType, Metadata, WireBlock, WireMetadata};
use cdp_buildcfg::BIG_FILE_THRESHOLD;
use cdp_datastore::{adaptive_sizes, Chunker};

use crate::carver::SaveEvent;
use crate::http_client::{HttpClient, PostOutcome};
use crate::local_cache::LocalCache;
use crate::metadata_extractor::MetadataExtractor;

/// Configuration the Sender needs beyond what it reads from the filesystem
/// (§6.4 `[Client]` section).
pub struct SenderConfig {
    pub adaptive: bool,
    pub fixed_blocksize: usize,
    pub default_buffersize: usize,
}

/// Runs the per-file send protocol of §4.4. One `Sender` is shared by the
/// Saver thread (and, for replay, conceptually by the Reconnector, though
/// that one goes through [`LocalCache::drain_unsent`] instead).
pub struct Sender {
    extractor: MetadataExtractor,
    cache: Arc<LocalCache>,
    http: Arc<HttpClient>,
    config: SenderConfig,
    dir_tx: crossbeam_channel::Sender<std::path::PathBuf>,
}

impl Sender {
    pub fn new(
        extractor: MetadataExtractor,
        cache: Arc<LocalCache>,
        http: Arc<HttpClient>,
        config: SenderConfig,
        dir_tx: crossbeam_channel::Sender<std::path::PathBuf>,
    ) -> Self {
        Self {
            extractor,
            cache,
            http,
            config,
            dir_tx,
        }
    }

    /// Step 1-5 of §4.4, for one event popped off the save-queue.
    pub fn handle_event(&self, event: &SaveEvent) -> Result<(), Error> {
        let meta = match self
            .extractor
            .extract(&event.path)
            .with_context(|| format!("unable to extract metadata for {:?}", event.path))?
        {
            Some(meta) => meta,
            None => return Ok(()), // excluded by regex; already logged
        };

        if self.cache.is_present(&meta)? {
            if meta.file_type == FileType::Directory {
                self.enqueue_recursion(&meta);
            }
            return Ok(());
        }

        if meta.file_type != FileType::Regular {
            self.send_non_regular(meta)?;
            return Ok(());
        }

        if meta.size >= BIG_FILE_THRESHOLD {
            self.send_big_file(meta, &event.path)
        } else {
            self.send_small_file(meta, &event.path)
        }
    }

    fn enqueue_recursion(&self, meta: &Metadata) {
        let _ = self.dir_tx.send(std::path::PathBuf::from(&meta.path));
    }

    /// §4.4 step 3: directories, symlinks and "other" entries carry no
    /// block-list; the server is expected to return an empty needed list.
    fn send_non_regular(&self, meta: Metadata) -> Result<(), Error> {
        let is_dir = meta.file_type == FileType::Directory;
        let wire = WireMetadata::from_metadata(&meta);

        match self.http.post_metadata(&wire) {
            PostOutcome::Accepted(resp) => {
                if !resp.hash_list.is_empty() {
                    log::warn!(
                        "server requested {} blocks for non-regular entry {}",
                        resp.hash_list.len(),
                        meta.path
                    );
                }
            }
            PostOutcome::Failed => {
                self.buffer_metadata(&wire)?;
            }
        }

        self.cache.record_saved(&meta)?;
        if is_dir {
            self.enqueue_recursion(&meta);
        }
        Ok(())
    }

    /// §4.4 step 4: regular file smaller than the big-file threshold.
    fn send_small_file(&self, mut meta: Metadata, path: &Path) -> Result<(), Error> {
        let (block_size, buffersize) = self.sizes_for(meta.size);

        let file = File::open(path).with_context(|| format!("unable to open {path:?}"))?;
        let mut chunker = Chunker::new(block_size);
        let blocks = chunker.chunk_all(file)?;

        meta.block_list = blocks.iter().map(|b| b.hash).collect();
        meta.data_already_sent = false;
        let wire = WireMetadata::from_metadata(&meta);

        let needed: HashSet<BlockHash> = match self.http.post_metadata(&wire) {
            PostOutcome::Accepted(resp) => {
                let (needed, malformed) = parse_needed(&resp.hash_list, &meta.block_list);
                if malformed {
                    self.buffer_metadata(&wire)?;
                }
                needed
            }
            PostOutcome::Failed => {
                self.buffer_metadata(&wire)?;
                meta.block_list.iter().copied().collect()
            }
        };

        if needed.is_empty() {
            self.cache.record_saved(&meta)?;
            return Ok(());
        }

        if meta.size < block_size as u64 {
            // §9 "single-block file path inefficiency", preserved for wire
            // compatibility: each needed block is POSTed individually.
            for block in &blocks {
                if needed.contains(&block.hash) {
                    self.post_single_block(block)?;
                }
            }
        } else {
            self.post_blocks_batched(&blocks, &needed, buffersize)?;
        }

        self.cache.record_saved(&meta)?;
        Ok(())
    }

    /// §4.4 step 5: regular file at or above the big-file threshold.
    /// Streams the file so peak memory stays bounded.
    fn send_big_file(&self, mut meta: Metadata, path: &Path) -> Result<(), Error> {
        let (block_size, buffersize) = self.sizes_for(meta.size);
        let mut file = File::open(path).with_context(|| format!("unable to open {path:?}"))?;
        let mut chunker = Chunker::new(block_size);

        let mut full_block_list = Vec::new();
        let mut batch: Vec<Block> = Vec::new();
        let mut batch_bytes = 0usize;

        while let Some(block) = chunker.next_block(&mut file)? {
            full_block_list.push(block.hash);
            batch_bytes += block.length as usize;
            batch.push(block);
            if batch_bytes >= buffersize {
                self.flush_batch(&mut batch)?;
                batch_bytes = 0;
            }
        }
        if !batch.is_empty() {
            self.flush_batch(&mut batch)?;
        }

        meta.block_list = full_block_list;
        meta.data_already_sent = true;
        let wire = WireMetadata::from_metadata(&meta);

        match self.http.post_metadata(&wire) {
            PostOutcome::Accepted(_) => {
                self.cache.record_saved(&meta)?;
            }
            PostOutcome::Failed => {
                self.buffer_metadata(&wire)?;
            }
        }
        Ok(())
    }

    /// Negotiate and upload one batch of the big-file streaming path
    /// (§4.4 step 5b).
    fn flush_batch(&self, batch: &mut Vec<Block>) -> Result<(), Error> {
        let hashes: Vec<String> = batch.iter().map(|b| b.hash.to_base64()).collect();

        let needed: HashSet<BlockHash> = match self.http.post_hash_array(&hashes) {
            crate::http_client::PostOutcome::Accepted(resp) => {
                let wanted: Vec<BlockHash> = batch.iter().map(|b| b.hash).collect();
                let (needed, malformed) = parse_needed(&resp.hash_list, &wanted);
                if malformed {
                    let payload = HttpClient::encode_json_body(&cdp_api_types::HashListRequest {
                        hash_list: hashes.clone(),
                    })?;
                    self.cache.buffer_unsent("/Hash_Array.json", &payload)?;
                }
                needed
            }
            crate::http_client::PostOutcome::Failed => {
                let payload = HttpClient::encode_json_body(&cdp_api_types::HashListRequest {
                    hash_list: hashes.clone(),
                })?;
                self.cache.buffer_unsent("/Hash_Array.json", &payload)?;
                batch.iter().map(|b| b.hash).collect()
            }
        };

        let wire_blocks: Vec<WireBlock> = batch
            .iter()
            .filter(|b| needed.contains(&b.hash))
            .map(WireBlock::from_block)
            .collect();

        if !wire_blocks.is_empty() {
            self.post_block_array(&wire_blocks)?;
        }

        batch.clear();
        Ok(())
    }

    fn post_single_block(&self, block: &Block) -> Result<(), Error> {
        let wire = WireBlock::from_block(block);
        match self.http.post_block(&wire) {
            PostOutcome::Accepted(_) => Ok(()),
            PostOutcome::Failed => {
                let payload = HttpClient::encode_json_body(&wire)?;
                self.cache.buffer_unsent("/Data.json", &payload)
            }
        }
    }

    fn post_blocks_batched(
        &self,
        blocks: &[Block],
        needed: &HashSet<BlockHash>,
        buffersize: usize,
    ) -> Result<(), Error> {
        let mut batch: Vec<WireBlock> = Vec::new();
        let mut batch_bytes = 0usize;

        for block in blocks {
            if !needed.contains(&block.hash) {
                continue;
            }
            batch_bytes += block.length as usize;
            batch.push(WireBlock::from_block(block));
            if batch_bytes >= buffersize {
                self.post_block_array(&batch)?;
                batch.clear();
                batch_bytes = 0;
            }
        }
        if !batch.is_empty() {
            self.post_block_array(&batch)?;
        }
        Ok(())
    }

    fn post_block_array(&self, blocks: &[WireBlock]) -> Result<(), Error> {
        match self.http.post_block_array(blocks) {
            PostOutcome::Accepted(_) => Ok(()),
            PostOutcome::Failed => {
                #[derive(serde::Serialize)]
                struct DataArray<'a> {
                    data_array: &'a [WireBlock],
                }
                let payload = HttpClient::encode_json_body(&DataArray { data_array: blocks })?;
                self.cache.buffer_unsent("/Data_Array.json", &payload)
            }
        }
    }

    fn buffer_metadata(&self, wire: &WireMetadata) -> Result<(), Error> {
        let payload = HttpClient::encode_json_body(wire)?;
        self.cache.buffer_unsent("/Meta.json", &payload)
    }

    fn sizes_for(&self, file_size: u64) -> (usize, usize) {
        if self.config.adaptive {
            adaptive_sizes(file_size, self.config.default_buffersize)
        } else {
            (self.config.fixed_blocksize, self.config.default_buffersize)
        }
    }
}

/// The `hash_list` a `/Meta.json` or `/Hash_Array.json` response carries is
/// the subset of `candidates` the server still needs (§8 "at-most-once-
/// needed"). A malformed entry, or a malformed response overall, is treated
/// as "needs everything" (§7 "Parse failure").
/// Returns the needed-set plus whether a malformed entry forced the
/// fail-open fallback, so callers can still buffer the request that
/// produced this response (§4.4 step 4.c): a malformed hash inside an
/// otherwise-successful response is as unusable as an outright failed POST.
fn parse_needed(hash_list: &[String], candidates: &[BlockHash]) -> (HashSet<BlockHash>, bool) {
    let mut needed = HashSet::new();
    for raw in hash_list {
        match BlockHash::from_base64(raw) {
            Ok(hash) => {
                needed.insert(hash);
            }
            Err(err) => {
                log::warn!("malformed hash {raw:?} in server response: {err}; needing everything");
                return (candidates.iter().copied().collect(), true);
            }
        }
    }
    (needed, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_needed_keeps_only_listed_hashes() {
        let a = BlockHash::from_bytes(b"a");
        let b = BlockHash::from_bytes(b"b");
        let candidates = [a, b];

        let (needed, malformed) = parse_needed(&[a.to_base64()], &candidates);
        assert_eq!(needed.len(), 1);
        assert!(needed.contains(&a));
        assert!(!needed.contains(&b));
        assert!(!malformed);
    }

    #[test]
    fn parse_needed_empty_list_needs_nothing() {
        let a = BlockHash::from_bytes(b"a");
        let (needed, malformed) = parse_needed(&[], &[a]);
        assert!(needed.is_empty());
        assert!(!malformed);
    }

    #[test]
    fn parse_needed_malformed_entry_needs_everything() {
        let a = BlockHash::from_bytes(b"a");
        let b = BlockHash::from_bytes(b"b");
        let candidates = [a, b];

        let (needed, malformed) = parse_needed(&["not base64!!".to_string()], &candidates);
        assert_eq!(needed, candidates.iter().copied().collect());
        assert!(malformed);
    }
}
