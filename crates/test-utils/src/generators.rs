//! Synthetic volume generators.
//!
//! Volumes are returned as flat `Vec<f32>` with x varying fastest, then y,
//! then z; the same order the fusion crate uses for blocks.

use std::error::Error;
use std::path::Path;
use std::sync::Arc;

use zarrs::array::{ArrayBuilder, ChunkGrid, DataType, FillValue};
use zarrs::array_subset::ArraySubset;
use zarrs_filesystem::FilesystemStore;

/// Creates a volume whose value is its own linear index.
///
/// `value(x, y, z) = x + y * w + z * w * h`, which makes misplaced or
/// transposed reads easy to spot.
///
/// # Example
///
/// ```
/// use test_utils::ramp_volume;
///
/// let volume = ramp_volume([4, 3, 2]);
/// assert_eq!(volume.len(), 24);
/// assert_eq!(volume[1], 1.0);  // x = 1
/// assert_eq!(volume[4], 4.0);  // y = 1
/// assert_eq!(volume[12], 12.0); // z = 1
/// ```
pub fn ramp_volume(dims: [usize; 3]) -> Vec<f32> {
    let [w, h, d] = dims;
    (0..w * h * d).map(|i| i as f32).collect()
}

/// Creates a volume filled with `value`.
pub fn constant_volume(dims: [usize; 3], value: f32) -> Vec<f32> {
    vec![value; dims[0] * dims[1] * dims[2]]
}

/// Creates a volume whose value depends on x only: `value(x, _, _) = x * scale`.
pub fn x_gradient_volume(dims: [usize; 3], scale: f32) -> Vec<f32> {
    let [w, h, d] = dims;
    let mut data = Vec::with_capacity(w * h * d);
    for _ in 0..d * h {
        data.extend((0..w).map(|x| x as f32 * scale));
    }
    data
}

/// Writes `data` as a float32 Zarr V3 array at the root of `path`.
///
/// `dims` and `chunk` are given as `[x, y, z]`; the array is stored with
/// shape `[z, y, x]`. The directory is created if needed.
pub fn write_zarr_volume(
    path: &Path,
    dims: [usize; 3],
    chunk: [usize; 3],
    data: &[f32],
) -> Result<(), Box<dyn Error>> {
    if data.len() != dims[0] * dims[1] * dims[2] {
        return Err(format!(
            "volume {:?} needs {} samples, got {}",
            dims,
            dims[0] * dims[1] * dims[2],
            data.len()
        )
        .into());
    }
    std::fs::create_dir_all(path)?;
    let store = Arc::new(FilesystemStore::new(path)?);

    let shape: Vec<u64> = [dims[2], dims[1], dims[0]].iter().map(|&d| d as u64).collect();
    let chunk_shape: Vec<u64> = [chunk[2], chunk[1], chunk[0]].iter().map(|&c| c as u64).collect();
    let chunk_grid: ChunkGrid = chunk_shape
        .try_into()
        .map_err(|e| format!("invalid chunk shape {:?}: {:?}", chunk, e))?;

    let array = ArrayBuilder::new(
        shape.clone(),
        DataType::Float32,
        chunk_grid,
        FillValue::from(0.0f32),
    )
    .build(store, "/")?;
    array.store_metadata()?;

    let subset = ArraySubset::new_with_shape(shape);
    array.store_array_subset_elements::<f32>(&subset, data)?;
    Ok(())
}
