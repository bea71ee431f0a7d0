//! Compatibility metadata written before any block is computed.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::container::StorageBackend;
use crate::convert::OutputDataType;
use crate::error::{FusionError, Result};
use crate::types::{BoundingBox, DatasetSpec, ViewId};

/// One dataset of the pyramid as recorded in the sidecar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetRecord {
    pub path: String,
    pub dimensions: [u64; 3],
    pub block_size: [u32; 3],
    pub data_type: OutputDataType,
    pub downsampling_factors: [u64; 3],
}

impl From<&DatasetSpec> for DatasetRecord {
    fn from(spec: &DatasetSpec) -> Self {
        Self {
            path: spec.dataset.clone(),
            dimensions: spec.dimensions,
            block_size: spec.block_size,
            data_type: spec.data_type,
            downsampling_factors: spec.downsampling_factors,
        }
    }
}

/// Everything a viewer needs to place the fused volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FusionRecord {
    pub container: PathBuf,
    pub backend: StorageBackend,
    pub bounding_box: BoundingBox,
    /// Bounding box minimum; the origin of voxel `(0, 0, 0)`.
    pub offset: [i64; 3],
    pub anisotropy_factor: Option<f64>,
    pub views: Vec<ViewId>,
    /// Level 0 first.
    pub datasets: Vec<DatasetRecord>,
    pub created: DateTime<Utc>,
}

/// Writer for viewer-facing metadata.
pub trait CompatibilityMetadata: Send + Sync {
    /// Persist `record`. Errors must be [`FusionError::MetadataWrite`].
    fn write(&self, record: &FusionRecord) -> Result<()>;
}

/// Writes the record as `fusion.json` in the container root.
#[derive(Debug, Clone, Default)]
pub struct JsonSidecar;

impl JsonSidecar {
    pub const FILE_NAME: &'static str = "fusion.json";

    pub fn path_for(record: &FusionRecord) -> PathBuf {
        Self::path_for_container(&record.container)
    }

    pub fn path_for_container(container: &Path) -> PathBuf {
        container.join(Self::FILE_NAME)
    }
}

impl CompatibilityMetadata for JsonSidecar {
    fn write(&self, record: &FusionRecord) -> Result<()> {
        let path = Self::path_for(record);
        let json = serde_json::to_string_pretty(record)
            .map_err(|e| FusionError::metadata_write(e.to_string()))?;
        std::fs::write(&path, json)
            .map_err(|e| FusionError::metadata_write(format!("{}: {}", path.display(), e)))?;

        info!(path = %path.display(), datasets = record.datasets.len(), "Wrote fusion metadata");
        Ok(())
    }
}

/// Skips compatibility metadata entirely.
#[derive(Debug, Clone, Default)]
pub struct NoMetadata;

impl CompatibilityMetadata for NoMetadata {
    fn write(&self, _record: &FusionRecord) -> Result<()> {
        Ok(())
    }
}
