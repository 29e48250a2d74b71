use std::io::Read;

use anyhow::Error;
use cdp_api_types::Block;

/// Adaptive block size selection (§4.1): the block size and upload-buffer
/// multiplier grow with file size so that tiny files aren't dominated by
/// per-block overhead and huge files don't blow past a bounded upload
/// buffer.
pub const ADAPTIVE_TABLE: &[(u64, usize, usize)] = &[
    (32 * 1024, 512, 1),
    (256 * 1024, 2048, 1),
    (1024 * 1024, 8192, 1),
    (8 * 1024 * 1024, 16384, 1),
    (64 * 1024 * 1024, 65536, 1),
    (128 * 1024 * 1024, 131072, 2),
    (u64::MAX, 262144, 4),
];

/// Pick `(block_size, upload_buffer_size)` for a file of the given size,
/// given the configured default block size and upload-buffer size.
pub fn adaptive_sizes(file_size: u64, default_buffersize: usize) -> (usize, usize) {
    for &(threshold, block_size, buffer_multiplier) in ADAPTIVE_TABLE {
        if file_size < threshold {
            return (block_size, default_buffersize * buffer_multiplier);
        }
    }
    unreachable!("ADAPTIVE_TABLE always has a u64::MAX sentinel row")
}

/// Splits a byte stream into fixed-size blocks, hashing each with SHA-256 as
/// it is produced. Only the final block may be shorter than `block_size`.
///
/// This is the fixed-size counterpart of a content-defined chunker: there is
/// no rolling hash or boundary search, every block is exactly `block_size`
/// bytes except the last.
pub struct Chunker {
    block_size: usize,
    buffer: Vec<u8>,
}

impl Chunker {
    pub fn new(block_size: usize) -> Self {
        assert!(block_size > 0, "block size must be positive");
        Self {
            block_size,
            buffer: Vec::with_capacity(block_size),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Read and hash every block of `reader` into memory. Suitable for the
    /// small-file path (§4.4) where the whole block-list fits in memory.
    pub fn chunk_all(&mut self, mut reader: impl Read) -> Result<Vec<Block>, Error> {
        let mut blocks = Vec::new();
        loop {
            self.buffer.clear();
            self.buffer.resize(self.block_size, 0);
            let n = read_fill(&mut reader, &mut self.buffer)?;
            if n == 0 {
                break;
            }
            self.buffer.truncate(n);
            blocks.push(Block::new_uncompressed(std::mem::take(&mut self.buffer)));
            if n < self.block_size {
                break;
            }
        }
        Ok(blocks)
    }

    /// Read and hash one block, returning `None` at EOF. Suitable for the
    /// big-file streaming path (§4.4), which processes one block at a time
    /// without holding the whole block-list in memory.
    pub fn next_block(&mut self, mut reader: impl Read) -> Result<Option<Block>, Error> {
        self.buffer.clear();
        self.buffer.resize(self.block_size, 0);
        let n = read_fill(&mut reader, &mut self.buffer)?;
        if n == 0 {
            return Ok(None);
        }
        self.buffer.truncate(n);
        Ok(Some(Block::new_uncompressed(std::mem::take(
            &mut self.buffer,
        ))))
    }
}

/// Read until `buf` is full or EOF, returning the number of bytes actually
/// read (which may be less than `buf.len()` only at EOF).
fn read_fill(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize, Error> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn chunk_all_splits_exact_blocks() {
        let data = vec![7u8; 100];
        let mut chunker = Chunker::new(30);
        let blocks = chunker.chunk_all(Cursor::new(&data)).unwrap();
        // ceil(100/30) == 4
        assert_eq!(blocks.len(), 4);
        assert_eq!(blocks[0].length, 30);
        assert_eq!(blocks[3].length, 10);
        let total: u64 = blocks.iter().map(|b| b.length as u64).sum();
        assert_eq!(total, data.len() as u64);
    }

    #[test]
    fn next_block_streams_one_at_a_time() {
        let data = vec![1u8; 65];
        let mut cursor = Cursor::new(&data);
        let mut chunker = Chunker::new(32);
        let mut lengths = Vec::new();
        while let Some(block) = chunker.next_block(&mut cursor).unwrap() {
            lengths.push(block.length);
        }
        assert_eq!(lengths, vec![32, 32, 1]);
    }

    #[test]
    fn adaptive_sizes_match_table() {
        assert_eq!(adaptive_sizes(100, 65536), (512, 65536));
        assert_eq!(adaptive_sizes(40 * 1024, 65536), (2048, 65536));
        assert_eq!(adaptive_sizes(300 * 1024, 65536), (8192, 65536));
        assert_eq!(adaptive_sizes(2 * 1024 * 1024, 65536), (16384, 65536));
        assert_eq!(adaptive_sizes(10 * 1024 * 1024, 65536), (65536, 65536));
        assert_eq!(adaptive_sizes(70 * 1024 * 1024, 65536), (131072, 65536 * 2));
        assert_eq!(adaptive_sizes(200 * 1024 * 1024, 65536), (262144, 65536 * 4));
    }
}
