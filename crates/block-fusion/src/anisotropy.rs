//! Anisotropy-preserving output: the fused volume keeps the z spacing of
//! the source data instead of being resampled to isotropic voxels.

use nalgebra::{Affine3, Matrix4, Vector3};

use crate::error::{FusionError, Result};
use crate::types::BoundingBox;

/// Validate an anisotropy factor (z spacing relative to xy).
pub fn validate_factor(factor: f64) -> Result<f64> {
    if !factor.is_finite() || factor <= 0.0 {
        return Err(FusionError::configuration(format!(
            "anisotropy factor must be a positive number, got {}",
            factor
        )));
    }
    Ok(factor)
}

/// Shrink the z extent of an isotropic bounding box by the anisotropy factor.
///
/// `min_z` is rounded down and `max_z` up so the adjusted box still covers
/// every source voxel.
pub fn adjust_bounding_box(bbox: &BoundingBox, factor: f64) -> Result<BoundingBox> {
    let factor = validate_factor(factor)?;
    let mut min = bbox.min();
    let mut max = bbox.max();
    min[2] = (min[2] as f64 / factor).floor() as i64;
    max[2] = (max[2] as f64 / factor).ceil() as i64;
    BoundingBox::new(min, max)
}

/// Scale transform `(1, 1, 1/factor)` prepended to every view registration.
pub fn anisotropy_transform(factor: f64) -> Result<Affine3<f64>> {
    let factor = validate_factor(factor)?;
    let scale = Matrix4::new_nonuniform_scaling(&Vector3::new(1.0, 1.0, 1.0 / factor));
    Ok(Affine3::from_matrix_unchecked(scale))
}
