//! Conversion of fused floating-point samples to the stored element type.
//!
//! Integer outputs map `[min, max]` linearly onto `[0, type max]`. Values
//! outside the range saturate at the type bounds and NaN maps to 0.

use serde::{Deserialize, Serialize};

use crate::error::{FusionError, Result};

/// Element type of a stored dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputDataType {
    UInt8,
    UInt16,
    /// 16-bit data stored with a signed type; the bits are those of the
    /// unsigned value.
    Int16,
    Float32,
}

impl OutputDataType {
    /// Get the type name as stored in dataset attributes.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UInt8 => "uint8",
            Self::UInt16 => "uint16",
            Self::Int16 => "int16",
            Self::Float32 => "float32",
        }
    }

    /// Size of one element in bytes.
    pub fn size_of(&self) -> usize {
        match self {
            Self::UInt8 => 1,
            Self::UInt16 | Self::Int16 => 2,
            Self::Float32 => 4,
        }
    }

    /// Largest quantized value for integer types.
    pub fn quantization_max(&self) -> Option<f64> {
        match self {
            Self::UInt8 => Some(u8::MAX as f64),
            Self::UInt16 | Self::Int16 => Some(u16::MAX as f64),
            Self::Float32 => None,
        }
    }

    /// Map to the Zarr data type.
    pub fn zarr_data_type(&self) -> zarrs::array::DataType {
        use zarrs::array::DataType;
        match self {
            Self::UInt8 => DataType::UInt8,
            Self::UInt16 => DataType::UInt16,
            Self::Int16 => DataType::Int16,
            Self::Float32 => DataType::Float32,
        }
    }
}

impl std::fmt::Display for OutputDataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Intensity interval mapped onto the full range of an integer type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntensityRange {
    pub min: f64,
    pub max: f64,
}

impl IntensityRange {
    pub fn new(min: f64, max: f64) -> Result<Self> {
        if !min.is_finite() || !max.is_finite() || min >= max {
            return Err(FusionError::configuration(format!(
                "intensity range [{}, {}] must be finite with min < max",
                min, max
            )));
        }
        Ok(Self { min, max })
    }

    /// Intensity width of one quantization step for the given type.
    pub fn step(&self, data_type: OutputDataType) -> Option<f64> {
        data_type
            .quantization_max()
            .map(|levels| (self.max - self.min) / levels)
    }
}

/// Typed sample buffer for one block, x varying fastest.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockSamples {
    UInt8(Vec<u8>),
    UInt16(Vec<u16>),
    Int16(Vec<i16>),
    Float32(Vec<f32>),
}

impl BlockSamples {
    pub fn data_type(&self) -> OutputDataType {
        match self {
            Self::UInt8(_) => OutputDataType::UInt8,
            Self::UInt16(_) => OutputDataType::UInt16,
            Self::Int16(_) => OutputDataType::Int16,
            Self::Float32(_) => OutputDataType::Float32,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::UInt8(v) => v.len(),
            Self::UInt16(v) => v.len(),
            Self::Int16(v) => v.len(),
            Self::Float32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Widen to f64. Int16 values are read back as the unsigned 16-bit
    /// values they encode.
    pub fn to_f64(&self) -> Vec<f64> {
        match self {
            Self::UInt8(v) => v.iter().map(|&x| x as f64).collect(),
            Self::UInt16(v) => v.iter().map(|&x| x as f64).collect(),
            Self::Int16(v) => v.iter().map(|&x| x as u16 as f64).collect(),
            Self::Float32(v) => v.iter().map(|&x| x as f64).collect(),
        }
    }

    /// Narrow already-scaled values to `data_type`, rounding and saturating.
    pub fn from_f64(values: &[f64], data_type: OutputDataType) -> Self {
        match data_type {
            OutputDataType::UInt8 => Self::UInt8(values.iter().map(|&v| v.round() as u8).collect()),
            OutputDataType::UInt16 => {
                Self::UInt16(values.iter().map(|&v| v.round() as u16).collect())
            }
            OutputDataType::Int16 => {
                Self::Int16(values.iter().map(|&v| v.round() as u16 as i16).collect())
            }
            OutputDataType::Float32 => {
                Self::Float32(values.iter().map(|&v| v as f32).collect())
            }
        }
    }
}

/// Quantize one fused value. `as` casts from f64 saturate, NaN becomes 0.
#[inline]
fn quantize(value: f32, min: f64, step: f64) -> f64 {
    ((value as f64 - min) / step).round()
}

/// Convert fused samples to the dataset's element type.
pub fn convert_samples(
    samples: Vec<f32>,
    data_type: OutputDataType,
    intensity: Option<IntensityRange>,
) -> Result<BlockSamples> {
    let (min, step) = match (intensity, data_type.quantization_max()) {
        (_, None) => return Ok(BlockSamples::Float32(samples)),
        (Some(range), Some(levels)) => (range.min, (range.max - range.min) / levels),
        (None, Some(_)) => {
            return Err(FusionError::configuration(format!(
                "{} output requires an intensity range",
                data_type
            )))
        }
    };

    Ok(match data_type {
        OutputDataType::UInt8 => BlockSamples::UInt8(
            samples
                .iter()
                .map(|&v| quantize(v, min, step) as u8)
                .collect(),
        ),
        OutputDataType::UInt16 => BlockSamples::UInt16(
            samples
                .iter()
                .map(|&v| quantize(v, min, step) as u16)
                .collect(),
        ),
        OutputDataType::Int16 => BlockSamples::Int16(
            samples
                .iter()
                .map(|&v| quantize(v, min, step) as u16 as i16)
                .collect(),
        ),
        OutputDataType::Float32 => BlockSamples::Float32(samples),
    })
}
