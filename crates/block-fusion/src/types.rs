//! Core types for block fusion.
//!
//! All coordinates are voxel coordinates in `[x, y, z]` order.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::container::StorageBackend;
use crate::convert::{IntensityRange, OutputDataType};
use crate::error::{FusionError, Result};

/// An axis-aligned integer voxel interval with inclusive bounds.
///
/// Immutable: every adjustment produces a new instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawBoundingBox")]
pub struct BoundingBox {
    min: [i64; 3],
    max: [i64; 3],
}

#[derive(Deserialize)]
struct RawBoundingBox {
    min: [i64; 3],
    max: [i64; 3],
}

impl TryFrom<RawBoundingBox> for BoundingBox {
    type Error = FusionError;

    fn try_from(raw: RawBoundingBox) -> Result<Self> {
        BoundingBox::new(raw.min, raw.max)
    }
}

impl BoundingBox {
    /// Create a bounding box, rejecting `min > max` on any axis.
    pub fn new(min: [i64; 3], max: [i64; 3]) -> Result<Self> {
        if (0..3).any(|d| min[d] > max[d]) {
            return Err(FusionError::configuration(format!(
                "bounding box min {:?} exceeds max {:?}",
                min, max
            )));
        }
        Ok(Self { min, max })
    }

    pub fn min(&self) -> [i64; 3] {
        self.min
    }

    pub fn max(&self) -> [i64; 3] {
        self.max
    }

    /// Number of voxels along each axis (`max - min + 1`).
    pub fn dimensions(&self) -> [u64; 3] {
        [
            (self.max[0] - self.min[0] + 1) as u64,
            (self.max[1] - self.min[1] + 1) as u64,
            (self.max[2] - self.min[2] + 1) as u64,
        ]
    }

    /// Total number of voxels.
    pub fn num_voxels(&self) -> u64 {
        self.dimensions().iter().product()
    }

    /// Grow the box by `margin` voxels in every direction.
    pub fn expand(&self, margin: u32) -> Self {
        let m = margin as i64;
        Self {
            min: [self.min[0] - m, self.min[1] - m, self.min[2] - m],
            max: [self.max[0] + m, self.max[1] + m, self.max[2] + m],
        }
    }

    /// Check if this box shares at least one voxel with another.
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        (0..3).all(|d| self.min[d] <= other.max[d] && other.min[d] <= self.max[d])
    }

    /// Smallest box containing both boxes.
    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        Self {
            min: [
                self.min[0].min(other.min[0]),
                self.min[1].min(other.min[1]),
                self.min[2].min(other.min[2]),
            ],
            max: [
                self.max[0].max(other.max[0]),
                self.max[1].max(other.max[1]),
                self.max[2].max(other.max[2]),
            ],
        }
    }

    /// Check if a voxel lies inside the box.
    pub fn contains(&self, p: [i64; 3]) -> bool {
        (0..3).all(|d| p[d] >= self.min[d] && p[d] <= self.max[d])
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}, {}] -> [{}, {}, {}], dimensions ({}, {}, {})",
            self.min[0],
            self.min[1],
            self.min[2],
            self.max[0],
            self.max[1],
            self.max[2],
            self.dimensions()[0],
            self.dimensions()[1],
            self.dimensions()[2]
        )
    }
}

/// One unit of work: the region a single task computes and writes.
///
/// `offset` and `size` are in output pixels relative to the dataset origin;
/// `grid_offset` is the position of the first native chunk in units of the
/// container's chunk grid. A block may span several native chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridBlock {
    pub offset: [u64; 3],
    pub size: [u64; 3],
    pub grid_offset: [u64; 3],
}

impl GridBlock {
    /// The block's region in absolute coordinates, given the dataset origin.
    pub fn region(&self, origin: [i64; 3]) -> BoundingBox {
        let min = [
            origin[0] + self.offset[0] as i64,
            origin[1] + self.offset[1] as i64,
            origin[2] + self.offset[2] as i64,
        ];
        BoundingBox {
            min,
            max: [
                min[0] + self.size[0] as i64 - 1,
                min[1] + self.size[1] as i64 - 1,
                min[2] + self.size[2] as i64 - 1,
            ],
        }
    }

    /// Number of voxels in the block.
    pub fn num_voxels(&self) -> usize {
        self.size.iter().product::<u64>() as usize
    }
}

impl fmt::Display for GridBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "offset {:?} size {:?} grid {:?}",
            self.offset, self.size, self.grid_offset
        )
    }
}

/// Identifies one source view: a timepoint and a view setup.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ViewId {
    pub timepoint: u32,
    pub setup: u32,
}

impl ViewId {
    pub fn new(timepoint: u32, setup: u32) -> Self {
        Self { timepoint, setup }
    }
}

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tp={}, setup={}", self.timepoint, self.setup)
    }
}

/// Integer downsampling factor per axis for one pyramid level, relative to
/// the previous level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DownsamplingStep(pub [u32; 3]);

impl DownsamplingStep {
    pub fn new(factors: [u32; 3]) -> Result<Self> {
        if factors.iter().any(|&f| f == 0) {
            return Err(FusionError::configuration(format!(
                "downsampling factors {:?} must be positive",
                factors
            )));
        }
        Ok(Self(factors))
    }

    pub fn factors(&self) -> [u32; 3] {
        self.0
    }

    /// True for the `1,1,1` step, which does not produce a new level.
    pub fn is_identity(&self) -> bool {
        self.0 == [1, 1, 1]
    }
}

impl fmt::Display for DownsamplingStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.0[0], self.0[1], self.0[2])
    }
}

/// Everything a task needs to know about one output dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSpec {
    /// Root directory of the container.
    pub container: PathBuf,
    /// Array path inside the container, always starting with `/`.
    pub dataset: String,
    /// Storage backend used for the container.
    pub backend: StorageBackend,
    /// Dataset dimensions in voxels.
    pub dimensions: [u64; 3],
    /// Native chunk size.
    pub block_size: [u32; 3],
    /// Element type of the stored data.
    pub data_type: OutputDataType,
    /// Intensity mapping used when narrowing fused floats to integers.
    pub intensity: Option<IntensityRange>,
    /// Cumulative downsampling relative to level 0.
    pub downsampling_factors: [u64; 3],
}

impl DatasetSpec {
    /// Native chunk size as `u64`.
    pub fn block_size_u64(&self) -> [u64; 3] {
        [
            self.block_size[0] as u64,
            self.block_size[1] as u64,
            self.block_size[2] as u64,
        ]
    }

    /// Number of native chunks along each axis.
    pub fn num_chunks(&self) -> [u64; 3] {
        let b = self.block_size_u64();
        [
            self.dimensions[0].div_ceil(b[0]),
            self.dimensions[1].div_ceil(b[1]),
            self.dimensions[2].div_ceil(b[2]),
        ]
    }
}

/// Statistics about the chunk cache.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub memory_bytes: u64,
    pub evictions: u64,
}

impl CacheStats {
    /// Calculate the cache hit rate (0.0 - 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
