//! Error types for block fusion.

use thiserror::Error;

/// Errors that can occur while fusing a volume into a container.
#[derive(Error, Debug)]
pub enum FusionError {
    /// Conflicting or missing job parameters. Raised before any task is scheduled.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The output container or dataset could not be created or opened.
    #[error("failed to open storage: {0}")]
    StorageOpen(String),

    /// Compatibility metadata could not be written.
    #[error("failed to write metadata: {0}")]
    MetadataWrite(String),

    /// A single block task failed while selecting, prefetching, fusing,
    /// converting or writing.
    #[error("{stage} task for block {block} failed: {message}")]
    TaskCompute {
        stage: String,
        block: String,
        message: String,
    },

    /// Zarr format error.
    #[error("Zarr format error: {0}")]
    Zarr(String),

    /// Storage/IO error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Source catalog error.
    #[error("catalog error: {0}")]
    Catalog(String),

    /// Invalid dataset metadata.
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),
}

impl FusionError {
    /// Create a Configuration error.
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a StorageOpen error.
    pub fn storage_open(msg: impl Into<String>) -> Self {
        Self::StorageOpen(msg.into())
    }

    /// Create a MetadataWrite error.
    pub fn metadata_write(msg: impl Into<String>) -> Self {
        Self::MetadataWrite(msg.into())
    }

    /// Wrap any error raised inside a block task.
    pub fn task_compute(
        stage: impl Into<String>,
        block: impl std::fmt::Display,
        cause: impl std::fmt::Display,
    ) -> Self {
        Self::TaskCompute {
            stage: stage.into(),
            block: block.to_string(),
            message: cause.to_string(),
        }
    }

    /// Create a Zarr error.
    pub fn zarr(msg: impl Into<String>) -> Self {
        Self::Zarr(msg.into())
    }

    /// Create a Storage error.
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a Catalog error.
    pub fn catalog(msg: impl Into<String>) -> Self {
        Self::Catalog(msg.into())
    }

    /// True for errors that must abort the run before scheduling.
    pub fn is_preflight(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::StorageOpen(_) | Self::MetadataWrite(_)
        )
    }
}

impl From<std::io::Error> for FusionError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for FusionError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidMetadata(err.to_string())
    }
}

impl From<serde_yaml::Error> for FusionError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Configuration(err.to_string())
    }
}

/// Result type for fusion operations.
pub type Result<T> = std::result::Result<T, FusionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_compute_message() {
        let err = FusionError::task_compute("level0", "[0, 128, 0]", "disk full");
        assert_eq!(
            err.to_string(),
            "level0 task for block [0, 128, 0] failed: disk full"
        );
        assert!(!err.is_preflight());
    }

    #[test]
    fn test_preflight_classification() {
        assert!(FusionError::configuration("x").is_preflight());
        assert!(FusionError::storage_open("x").is_preflight());
        assert!(FusionError::metadata_write("x").is_preflight());
        assert!(!FusionError::zarr("x").is_preflight());
    }
}
