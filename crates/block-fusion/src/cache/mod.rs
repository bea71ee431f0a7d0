//! Cache for decompressed source chunks.

mod chunk_cache;

pub use chunk_cache::{hash_path, ChunkCache, ChunkKey};
