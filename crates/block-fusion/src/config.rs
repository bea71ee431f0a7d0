//! Job and container configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::container::StorageBackend;
use crate::convert::{IntensityRange, OutputDataType};
use crate::error::{FusionError, Result};
use crate::pyramid::{parse_steps, DownsampleMethod};
use crate::types::{DownsamplingStep, ViewId};

/// Compression settings for created datasets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Compression codec.
    pub compression: ZarrCompression,

    /// Compression level (1-9).
    pub compression_level: u8,

    /// Enable byte shuffle filter for better compression.
    pub shuffle: bool,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            compression: ZarrCompression::BloscZstd,
            compression_level: 1,
            shuffle: true,
        }
    }
}

impl ContainerConfig {
    /// Apply `FUSION_COMPRESSION*` / `FUSION_SHUFFLE` overrides.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("FUSION_COMPRESSION") {
            self.compression = ZarrCompression::from_str(&val);
        }

        if let Ok(val) = std::env::var("FUSION_COMPRESSION_LEVEL") {
            if let Ok(level) = val.parse() {
                self.compression_level = level;
            }
        }

        if let Ok(val) = std::env::var("FUSION_SHUFFLE") {
            self.shuffle = val.to_lowercase() == "true" || val == "1";
        }

        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.compression != ZarrCompression::None
            && (self.compression_level == 0 || self.compression_level > 9)
        {
            return Err(FusionError::configuration(
                "compression_level must be 1-9",
            ));
        }
        Ok(())
    }
}

/// Compression codec for Zarr datasets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ZarrCompression {
    /// No compression.
    None,
    /// Blosc with LZ4; `lz4` is accepted as an alias.
    #[serde(alias = "lz4")]
    BloscLz4,
    /// Blosc with Zstd (recommended); `zstd` is accepted as an alias.
    #[default]
    #[serde(alias = "zstd")]
    BloscZstd,
}

impl ZarrCompression {
    /// Parse from string (case-insensitive).
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "none" => Self::None,
            "lz4" | "blosc_lz4" => Self::BloscLz4,
            "zstd" | "blosc_zstd" => Self::BloscZstd,
            _ => Self::BloscZstd,
        }
    }

    /// Get the codec name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::BloscLz4 => "blosc_lz4",
            Self::BloscZstd => "blosc_zstd",
        }
    }
}

impl std::fmt::Display for ZarrCompression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Requested output type of the fused volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DataTypeFusion {
    #[default]
    Float32,
    UInt8,
    UInt16,
}

/// Local executor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Worker threads; the number of CPUs when unset.
    pub threads: Option<usize>,
    /// Attempts per task before it is reported as failed.
    pub max_attempts: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            threads: None,
            max_attempts: 1,
        }
    }
}

fn default_block_size() -> [u32; 3] {
    [128, 128, 128]
}

fn default_blocks_per_job() -> [u32; 3] {
    [1, 1, 1]
}

fn default_true() -> bool {
    true
}

/// One fusion job, usually loaded from a YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionJobConfig {
    /// Output container directory.
    pub container: PathBuf,

    /// YAML description of the source views.
    pub catalog: PathBuf,

    #[serde(default)]
    pub backend: StorageBackend,

    /// Explicit dataset path inside the container.
    #[serde(default)]
    pub dataset: Option<String>,

    /// BigDataViewer target; the dataset path is derived from it.
    #[serde(default)]
    pub bdv: Option<ViewId>,

    /// Named bounding box from the catalog; the union of all views if unset.
    #[serde(default)]
    pub bounding_box: Option<String>,

    /// Restrict fusion to these views; all catalog views if unset.
    #[serde(default)]
    pub views: Option<Vec<ViewId>>,

    #[serde(default = "default_block_size")]
    pub block_size: [u32; 3],

    #[serde(default = "default_blocks_per_job")]
    pub blocks_per_job: [u32; 3],

    #[serde(default)]
    pub data_type: DataTypeFusion,

    #[serde(default)]
    pub min_intensity: Option<f64>,

    #[serde(default)]
    pub max_intensity: Option<f64>,

    #[serde(default)]
    pub preserve_anisotropy: bool,

    /// Fixed anisotropy factor; estimated from the views if unset.
    #[serde(default)]
    pub anisotropy_factor: Option<f64>,

    /// Estimate the pyramid automatically.
    #[serde(default)]
    pub multi_res: bool,

    /// Explicit pyramid steps, e.g. `"2,2,1; 2,2,1; 2,2,2"`.
    #[serde(default)]
    pub downsampling: Option<String>,

    #[serde(default)]
    pub downsample_method: DownsampleMethod,

    /// Read each block's source chunks ahead of fusion.
    #[serde(default = "default_true")]
    pub prefetch: bool,

    #[serde(default)]
    pub compression: ContainerConfig,

    #[serde(default)]
    pub executor: ExecutorConfig,
}

impl FusionJobConfig {
    /// Parse a job from YAML text.
    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Load a job from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            FusionError::configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&text)
    }

    /// Check parameter combinations. Runs before anything is created.
    pub fn validate(&self) -> Result<()> {
        match (&self.dataset, &self.bdv) {
            (None, None) => {
                return Err(FusionError::configuration(
                    "either a dataset path or a BDV target must be given",
                ))
            }
            (Some(_), Some(_)) => {
                return Err(FusionError::configuration(
                    "a dataset path and a BDV target are mutually exclusive",
                ))
            }
            _ => {}
        }

        if self.block_size.iter().any(|&b| b == 0) {
            return Err(FusionError::configuration(format!(
                "block size {:?} must be positive",
                self.block_size
            )));
        }
        if self.blocks_per_job.iter().any(|&b| b == 0) {
            return Err(FusionError::configuration(format!(
                "blocks per job {:?} must be positive",
                self.blocks_per_job
            )));
        }

        self.intensity()?;

        if self.multi_res && self.downsampling.is_some() {
            return Err(FusionError::configuration(
                "multi_res and explicit downsampling are mutually exclusive",
            ));
        }
        if self.multi_res || self.downsampling.is_some() {
            let dataset = self.dataset_path();
            if !dataset.ends_with("/s0") {
                return Err(FusionError::configuration(format!(
                    "pyramid output requires a dataset ending in /s0, got {}",
                    dataset
                )));
            }
        }
        self.downsampling_steps()?;

        if let Some(factor) = self.anisotropy_factor {
            crate::anisotropy::validate_factor(factor)?;
        }

        if self.bdv.is_some()
            && self.backend == StorageBackend::ZarrSharded
            && self.data_type != DataTypeFusion::UInt16
        {
            return Err(FusionError::configuration(
                "BDV output on the sharded backend only supports uint16",
            ));
        }

        self.compression.validate()
    }

    /// Element type actually stored.
    ///
    /// 16-bit BDV output on the single-file backend uses the signed legacy
    /// layout.
    pub fn output_data_type(&self) -> OutputDataType {
        match self.data_type {
            DataTypeFusion::UInt8 => OutputDataType::UInt8,
            DataTypeFusion::UInt16
                if self.bdv.is_some() && self.backend == StorageBackend::ZarrSharded =>
            {
                OutputDataType::Int16
            }
            DataTypeFusion::UInt16 => OutputDataType::UInt16,
            DataTypeFusion::Float32 => OutputDataType::Float32,
        }
    }

    /// Intensity mapping for integer outputs, `None` for float output.
    pub fn intensity(&self) -> Result<Option<IntensityRange>> {
        if self.data_type == DataTypeFusion::Float32 {
            return Ok(None);
        }
        match (self.min_intensity, self.max_intensity) {
            (Some(min), Some(max)) => IntensityRange::new(min, max).map(Some),
            _ => Err(FusionError::configuration(format!(
                "{:?} output requires min_intensity and max_intensity",
                self.data_type
            ))),
        }
    }

    /// Dataset path of level 0, always starting with `/`.
    pub fn dataset_path(&self) -> String {
        if let Some(view) = self.bdv {
            return format!("/setup{}/timepoint{}/s0", view.setup, view.timepoint);
        }
        let dataset = self.dataset.as_deref().unwrap_or("/");
        let trimmed = dataset.trim_matches('/');
        format!("/{}", trimmed)
    }

    /// Explicit pyramid steps, if configured.
    pub fn downsampling_steps(&self) -> Result<Option<Vec<DownsamplingStep>>> {
        self.downsampling.as_deref().map(parse_steps).transpose()
    }
}
