//! Content-addressed block store, fixed-size chunker, and per-host
//! metadata log shared between `cdp-server` (ingest/query) and tests.

pub mod chunk_store;
pub mod chunker;

pub use chunk_store::ChunkStore;
pub use chunker::{adaptive_sizes, Chunker};
