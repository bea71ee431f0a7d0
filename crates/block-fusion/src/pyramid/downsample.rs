//! Block-wise reduction of one pyramid level into the next.

use serde::{Deserialize, Serialize};

/// Method used to reduce a window of voxels to one.
///
/// - **Mean**: Best for intensity data
/// - **Max**: Preserves bright, sparse structures
/// - **Nearest**: Fast, preserves exact values, good for label data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DownsampleMethod {
    /// Average of the window
    #[default]
    Mean,
    /// Maximum of the window
    Max,
    /// First voxel of the window
    Nearest,
}

impl DownsampleMethod {
    /// Parse from string (case-insensitive).
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "mean" | "average" => Some(Self::Mean),
            "max" => Some(Self::Max),
            "nearest" => Some(Self::Nearest),
            _ => None,
        }
    }
}

/// Downsample a 3D block, x varying fastest.
///
/// The output has `ceil(dims / factors)` voxels per axis. Windows at the
/// upper edge are clipped to the input. NaN inputs are ignored; a window
/// holding only NaN yields NaN.
pub fn downsample_block(
    data: &[f64],
    dims: [usize; 3],
    factors: [u32; 3],
    method: DownsampleMethod,
) -> (Vec<f64>, [usize; 3]) {
    let f = factors.map(|v| v.max(1) as usize);
    let out_dims = [
        dims[0].div_ceil(f[0]),
        dims[1].div_ceil(f[1]),
        dims[2].div_ceil(f[2]),
    ];
    let mut output = Vec::with_capacity(out_dims[0] * out_dims[1] * out_dims[2]);

    for oz in 0..out_dims[2] {
        for oy in 0..out_dims[1] {
            for ox in 0..out_dims[0] {
                let start = [ox * f[0], oy * f[1], oz * f[2]];
                let end = [
                    (start[0] + f[0]).min(dims[0]),
                    (start[1] + f[1]).min(dims[1]),
                    (start[2] + f[2]).min(dims[2]),
                ];

                let value = match method {
                    DownsampleMethod::Nearest => {
                        data[start[0] + start[1] * dims[0] + start[2] * dims[0] * dims[1]]
                    }
                    DownsampleMethod::Mean | DownsampleMethod::Max => {
                        let window = (start[2]..end[2]).flat_map(|z| {
                            (start[1]..end[1]).flat_map(move |y| {
                                (start[0]..end[0])
                                    .map(move |x| data[x + y * dims[0] + z * dims[0] * dims[1]])
                            })
                        });
                        if method == DownsampleMethod::Mean {
                            mean_of_window(window)
                        } else {
                            max_of_window(window)
                        }
                    }
                };
                output.push(value);
            }
        }
    }

    (output, out_dims)
}

/// Mean of the non-NaN values, NaN if there are none.
#[inline]
fn mean_of_window(values: impl Iterator<Item = f64>) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for v in values.filter(|v| !v.is_nan()) {
        sum += v;
        count += 1;
    }
    if count == 0 {
        f64::NAN
    } else {
        sum / count as f64
    }
}

/// Maximum of the non-NaN values, NaN if there are none.
#[inline]
fn max_of_window(values: impl Iterator<Item = f64>) -> f64 {
    values
        .filter(|v| !v.is_nan())
        .fold(None, |max: Option<f64>, v| Some(max.map_or(v, |m| m.max(v))))
        .unwrap_or(f64::NAN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_utils::assert_approx_eq;

    fn ramp(dims: [usize; 3]) -> Vec<f64> {
        (0..dims[0] * dims[1] * dims[2]).map(|i| i as f64).collect()
    }

    #[test]
    fn test_mean_2x2x1() {
        // 4x2x1: [0 1 2 3 / 4 5 6 7]
        let (out, dims) = downsample_block(&ramp([4, 2, 1]), [4, 2, 1], [2, 2, 1], DownsampleMethod::Mean);
        assert_eq!(dims, [2, 1, 1]);
        assert_approx_eq!(out[0], 2.5, 1e-12);
        assert_approx_eq!(out[1], 4.5, 1e-12);
    }

    #[test]
    fn test_edge_windows_are_clipped() {
        let (out, dims) = downsample_block(&ramp([5, 1, 1]), [5, 1, 1], [2, 1, 1], DownsampleMethod::Mean);
        assert_eq!(dims, [3, 1, 1]);
        assert_approx_eq!(out[2], 4.0, 1e-12);
    }

    #[test]
    fn test_max_and_nearest() {
        let data = ramp([2, 2, 2]);
        let (max, _) = downsample_block(&data, [2, 2, 2], [2, 2, 2], DownsampleMethod::Max);
        assert_eq!(max, vec![7.0]);
        let (nearest, _) = downsample_block(&data, [2, 2, 2], [2, 2, 2], DownsampleMethod::Nearest);
        assert_eq!(nearest, vec![0.0]);
    }

    #[test]
    fn test_nan_handling() {
        let data = vec![1.0, f64::NAN, 3.0, f64::NAN, f64::NAN, f64::NAN];
        let (mean, _) = downsample_block(&data, [6, 1, 1], [3, 1, 1], DownsampleMethod::Mean);
        assert_approx_eq!(mean[0], 2.0, 1e-12);
        assert!(mean[1].is_nan());

        let (max, _) = downsample_block(&data, [6, 1, 1], [3, 1, 1], DownsampleMethod::Max);
        assert_approx_eq!(max[0], 3.0, 1e-12);
        assert!(max[1].is_nan());
    }

    #[test]
    fn test_z_only_step() {
        let (out, dims) = downsample_block(&ramp([1, 1, 4]), [1, 1, 4], [1, 1, 2], DownsampleMethod::Mean);
        assert_eq!(dims, [1, 1, 2]);
        assert_eq!(out, vec![0.5, 2.5]);
    }

    #[test]
    fn test_method_parsing() {
        assert_eq!(DownsampleMethod::from_str("MAX"), Some(DownsampleMethod::Max));
        assert_eq!(DownsampleMethod::from_str("average"), Some(DownsampleMethod::Mean));
        assert_eq!(DownsampleMethod::from_str("median"), None);
    }
}
