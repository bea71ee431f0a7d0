//! Output container: dataset creation, block writes and writer lifetimes.
//!
//! Arrays are stored `[z, y, x]` so x varies fastest in memory, matching the
//! sample order produced by fusion. Everything outside this module speaks
//! `[x, y, z]`.

mod registry;
mod writer;

pub use registry::{WriterKey, WriterRegistry};
pub use writer::{create_dataset, write_multiscales, ContainerWriter, MultiscaleLevel};

use serde::{Deserialize, Serialize};

/// Upper bound on native chunks per shard along each axis.
pub const SHARD_CHUNKS: u64 = 4;

/// Storage backend of an output container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// Zarr V3 with one object per chunk.
    #[default]
    Zarr,
    /// Zarr V3 with native chunks packed into shards of at most
    /// `SHARD_CHUNKS` chunks per axis. Each write is a read-modify-write of
    /// the shards it touches, so only one writer may exist.
    ZarrSharded,
}

impl StorageBackend {
    /// Parse from string (case-insensitive).
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "zarr" => Some(Self::Zarr),
            "zarr_sharded" | "sharded" => Some(Self::ZarrSharded),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Zarr => "zarr",
            Self::ZarrSharded => "zarr_sharded",
        }
    }

    /// Whether independent writer instances may write the same dataset at
    /// the same time.
    pub fn supports_concurrent_writers(&self) -> bool {
        matches!(self, Self::Zarr)
    }
}

impl std::fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Chunk position `[x, y, z]` to the on-disk `[z, y, x]` order.
pub(crate) fn to_storage_order<T: Copy>(v: [T; 3]) -> Vec<T> {
    vec![v[2], v[1], v[0]]
}
