//! Zarr V3 dataset creation and chunk-aligned block writes.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info};
use zarrs::array::codec::array_to_bytes::sharding::{ShardingCodec, ShardingCodecBuilder};
use zarrs::array::codec::bytes_to_bytes::blosc::{
    BloscCodec, BloscCompressionLevel, BloscCompressor, BloscShuffleMode,
};
use zarrs::array::codec::BytesToBytesCodecTraits;
use zarrs::array::{Array, ArrayBuilder, ChunkGrid, FillValue};
use zarrs::array_subset::ArraySubset;
use zarrs::group::GroupBuilder;
use zarrs_filesystem::FilesystemStore;

use super::registry::WriterKey;
use super::{to_storage_order, StorageBackend, SHARD_CHUNKS};
use crate::config::{ContainerConfig, ZarrCompression};
use crate::convert::{BlockSamples, OutputDataType};
use crate::error::{FusionError, Result};
use crate::types::{DatasetSpec, GridBlock};

fn open_store(container: &Path) -> Result<Arc<FilesystemStore>> {
    let store = FilesystemStore::new(container).map_err(|e| {
        FusionError::storage_open(format!("{}: {}", container.display(), e))
    })?;
    Ok(Arc::new(store))
}

fn fill_value(data_type: OutputDataType) -> FillValue {
    match data_type {
        OutputDataType::UInt8 => FillValue::from(0u8),
        OutputDataType::UInt16 => FillValue::from(0u16),
        OutputDataType::Int16 => FillValue::from(0i16),
        OutputDataType::Float32 => FillValue::from(0.0f32),
    }
}

/// Create an empty dataset in the container described by `spec`.
///
/// The container directory is created if needed. Array attributes record
/// the bounding box minimum as `offset` so readers can map chunk
/// coordinates back to the global space, together with the dimensions,
/// block size, data type and cumulative downsampling factors.
pub fn create_dataset(spec: &DatasetSpec, config: &ContainerConfig, offset: [i64; 3]) -> Result<()> {
    std::fs::create_dir_all(&spec.container).map_err(|e| {
        FusionError::storage_open(format!("{}: {}", spec.container.display(), e))
    })?;
    let store = open_store(&spec.container)?;

    let mut attrs = serde_json::Map::new();
    attrs.insert("offset".to_string(), serde_json::json!(offset));
    attrs.insert("dimensions".to_string(), serde_json::json!(spec.dimensions));
    attrs.insert("blockSize".to_string(), serde_json::json!(spec.block_size));
    attrs.insert(
        "dataType".to_string(),
        serde_json::json!(spec.data_type.as_str()),
    );
    attrs.insert(
        "downsamplingFactors".to_string(),
        serde_json::json!(spec.downsampling_factors),
    );
    if let Some(range) = spec.intensity {
        attrs.insert(
            "intensityRange".to_string(),
            serde_json::json!([range.min, range.max]),
        );
    }
    attrs.insert(
        "created".to_string(),
        serde_json::json!(Utc::now().to_rfc3339()),
    );

    let grid_shape = match spec.backend {
        StorageBackend::Zarr => to_storage_order(spec.block_size_u64()),
        StorageBackend::ZarrSharded => to_storage_order(shard_shape(spec)),
    };
    let chunk_grid: ChunkGrid = grid_shape
        .try_into()
        .map_err(|e| FusionError::configuration(format!("{:?}", e)))?;

    let mut binding = ArrayBuilder::new(
        to_storage_order(spec.dimensions),
        spec.data_type.zarr_data_type(),
        chunk_grid,
        fill_value(spec.data_type),
    );
    let mut builder = binding.attributes(attrs);

    match spec.backend {
        StorageBackend::Zarr => {
            if config.compression != ZarrCompression::None {
                let codec = create_compression_codec(config, spec.data_type)?;
                builder = builder.bytes_to_bytes_codecs(vec![codec]);
            }
        }
        StorageBackend::ZarrSharded => {
            let sharding = build_sharding_codec(config, spec)?;
            builder = builder.array_to_bytes_codec(Arc::new(sharding));
        }
    }

    let array = builder
        .build(store, &spec.dataset)
        .map_err(|e| FusionError::storage_open(e.to_string()))?;
    array
        .store_metadata()
        .map_err(|e| FusionError::storage_open(e.to_string()))?;

    info!(
        container = %spec.container.display(),
        dataset = %spec.dataset,
        backend = %spec.backend,
        dimensions = ?spec.dimensions,
        block_size = ?spec.block_size,
        data_type = %spec.data_type,
        "Created dataset"
    );

    Ok(())
}

/// Shard extent `[x, y, z]` in voxels: up to `SHARD_CHUNKS` native chunks
/// per axis, fewer when the dataset is smaller.
fn shard_shape(spec: &DatasetSpec) -> [u64; 3] {
    let block_size = spec.block_size_u64();
    let chunks = spec.num_chunks();
    [0, 1, 2].map(|d| chunks[d].clamp(1, SHARD_CHUNKS) * block_size[d])
}

/// Create the compression codec based on configuration.
fn create_compression_codec(
    config: &ContainerConfig,
    data_type: OutputDataType,
) -> Result<Arc<dyn BytesToBytesCodecTraits>> {
    let level = BloscCompressionLevel::try_from(config.compression_level)
        .map_err(|_| FusionError::configuration("Invalid compression level"))?;

    let shuffle = if config.shuffle {
        BloscShuffleMode::Shuffle
    } else {
        BloscShuffleMode::NoShuffle
    };

    // typesize is required when shuffle is enabled
    let typesize = if config.shuffle {
        Some(data_type.size_of())
    } else {
        None
    };

    let compressor = match config.compression {
        ZarrCompression::None => {
            return Err(FusionError::configuration("No compression configured"))
        }
        ZarrCompression::BloscLz4 => BloscCompressor::LZ4,
        ZarrCompression::BloscZstd => BloscCompressor::Zstd,
    };

    let codec = BloscCodec::new(compressor, level, None, shuffle, typesize)
        .map_err(|e| FusionError::configuration(e.to_string()))?;

    Ok(Arc::new(codec))
}

/// Sharding codec whose inner chunks are the dataset's native blocks.
fn build_sharding_codec(config: &ContainerConfig, spec: &DatasetSpec) -> Result<ShardingCodec> {
    let inner_chunk_shape = to_storage_order(spec.block_size_u64())
        .into_iter()
        .map(|s| {
            std::num::NonZeroU64::new(s)
                .ok_or_else(|| FusionError::configuration("block size must be positive"))
        })
        .collect::<Result<Vec<_>>>()?;

    let codec = if config.compression != ZarrCompression::None {
        let codec = create_compression_codec(config, spec.data_type)?;
        ShardingCodecBuilder::new(inner_chunk_shape.into())
            .bytes_to_bytes_codecs(vec![codec])
            .build()
    } else {
        ShardingCodecBuilder::new(inner_chunk_shape.into()).build()
    };

    Ok(codec)
}

/// One entry of the `multiscales` group attribute.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MultiscaleLevel {
    /// Level path relative to the group, e.g. `s1`.
    pub path: String,
    /// Cumulative downsampling factors relative to level 0.
    #[serde(rename = "downsamplingFactors")]
    pub factors: [u64; 3],
}

/// Write the `multiscales` attribute on the group holding the pyramid.
pub fn write_multiscales(container: &Path, group: &str, levels: &[MultiscaleLevel]) -> Result<()> {
    let store = open_store(container)?;

    let mut attrs = serde_json::Map::new();
    attrs.insert(
        "multiscales".to_string(),
        serde_json::json!([{ "name": group, "datasets": levels }]),
    );

    let mut builder = GroupBuilder::new();
    builder.attributes(attrs);
    let group_handle = builder
        .build(store, group)
        .map_err(|e| FusionError::metadata_write(e.to_string()))?;
    group_handle
        .store_metadata()
        .map_err(|e| FusionError::metadata_write(e.to_string()))?;

    debug!(group = group, levels = levels.len(), "Wrote multiscales attribute");
    Ok(())
}

/// Handle to one opened dataset.
///
/// Handles for a backend with concurrent writers are cheap and owned by a
/// single task. A handle for the sharded backend is shared by all tasks of
/// the process and serialises its writes.
pub struct ContainerWriter {
    key: WriterKey,
    spec: DatasetSpec,
    array: Array<FilesystemStore>,
    write_lock: Mutex<()>,
}

impl ContainerWriter {
    /// Open an existing dataset for writing.
    pub fn open(spec: &DatasetSpec) -> Result<Self> {
        if !spec.container.is_dir() {
            return Err(FusionError::storage_open(format!(
                "container {} does not exist",
                spec.container.display()
            )));
        }
        let store = open_store(&spec.container)?;
        let array = Array::open(store, &spec.dataset)
            .map_err(|e| FusionError::storage_open(format!("{}: {}", spec.dataset, e)))?;

        if array.data_type() != &spec.data_type.zarr_data_type() {
            return Err(FusionError::storage_open(format!(
                "dataset {} has data type {:?}, expected {}",
                spec.dataset,
                array.data_type(),
                spec.data_type
            )));
        }

        Ok(Self {
            key: WriterKey::for_spec(spec),
            spec: spec.clone(),
            array,
            write_lock: Mutex::new(()),
        })
    }

    pub fn key(&self) -> &WriterKey {
        &self.key
    }

    pub fn spec(&self) -> &DatasetSpec {
        &self.spec
    }

    /// True when this handle is the process-wide singleton for its dataset.
    pub fn is_shared(&self) -> bool {
        !self.spec.backend.supports_concurrent_writers()
    }

    /// Dataset attributes as stored at creation.
    pub fn attributes(&self) -> &serde_json::Map<String, serde_json::Value> {
        self.array.attributes()
    }

    /// Write one converted block at its chunk-aligned position.
    ///
    /// The write starts at `grid_offset * block_size`, which must equal the
    /// block's pixel offset.
    pub fn write_block(&self, block: &GridBlock, samples: &BlockSamples) -> Result<()> {
        if samples.data_type() != self.spec.data_type {
            return Err(FusionError::storage(format!(
                "cannot write {} samples to {} dataset {}",
                samples.data_type(),
                self.spec.data_type,
                self.spec.dataset
            )));
        }
        if samples.len() != block.num_voxels() {
            return Err(FusionError::storage(format!(
                "block {} expects {} samples, got {}",
                block,
                block.num_voxels(),
                samples.len()
            )));
        }

        let block_size = self.spec.block_size_u64();
        let start = [
            block.grid_offset[0] * block_size[0],
            block.grid_offset[1] * block_size[1],
            block.grid_offset[2] * block_size[2],
        ];
        if start != block.offset {
            return Err(FusionError::storage(format!(
                "block {} is not aligned to the native chunk grid {:?}",
                block, self.spec.block_size
            )));
        }
        if (0..3).any(|d| start[d] + block.size[d] > self.spec.dimensions[d]) {
            return Err(FusionError::storage(format!(
                "block {} exceeds dataset dimensions {:?}",
                block, self.spec.dimensions
            )));
        }

        let subset = ArraySubset::new_with_start_shape(
            to_storage_order(start),
            to_storage_order(block.size),
        )
        .map_err(|e| FusionError::zarr(e.to_string()))?;

        let _guard = if self.is_shared() {
            Some(
                self.write_lock
                    .lock()
                    .map_err(|_| FusionError::storage("writer lock poisoned"))?,
            )
        } else {
            None
        };

        match samples {
            BlockSamples::UInt8(v) => self.array.store_array_subset_elements::<u8>(&subset, v),
            BlockSamples::UInt16(v) => self.array.store_array_subset_elements::<u16>(&subset, v),
            BlockSamples::Int16(v) => self.array.store_array_subset_elements::<i16>(&subset, v),
            BlockSamples::Float32(v) => self.array.store_array_subset_elements::<f32>(&subset, v),
        }
        .map_err(|e| FusionError::zarr(e.to_string()))?;

        debug!(dataset = %self.spec.dataset, block = %block, "Wrote block");
        Ok(())
    }

    /// Read a region `[x, y, z]` of the dataset, x varying fastest.
    pub fn read_region(&self, offset: [u64; 3], size: [u64; 3]) -> Result<BlockSamples> {
        let subset =
            ArraySubset::new_with_start_shape(to_storage_order(offset), to_storage_order(size))
                .map_err(|e| FusionError::zarr(e.to_string()))?;

        let samples = match self.spec.data_type {
            OutputDataType::UInt8 => BlockSamples::UInt8(
                self.array
                    .retrieve_array_subset_elements::<u8>(&subset)
                    .map_err(|e| FusionError::zarr(e.to_string()))?,
            ),
            OutputDataType::UInt16 => BlockSamples::UInt16(
                self.array
                    .retrieve_array_subset_elements::<u16>(&subset)
                    .map_err(|e| FusionError::zarr(e.to_string()))?,
            ),
            OutputDataType::Int16 => BlockSamples::Int16(
                self.array
                    .retrieve_array_subset_elements::<i16>(&subset)
                    .map_err(|e| FusionError::zarr(e.to_string()))?,
            ),
            OutputDataType::Float32 => BlockSamples::Float32(
                self.array
                    .retrieve_array_subset_elements::<f32>(&subset)
                    .map_err(|e| FusionError::zarr(e.to_string()))?,
            ),
        };

        Ok(samples)
    }
}

impl std::fmt::Debug for ContainerWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerWriter")
            .field("key", &self.key)
            .finish()
    }
}
