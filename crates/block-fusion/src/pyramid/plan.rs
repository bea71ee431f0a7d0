//! Pyramid level planning.

use crate::error::{FusionError, Result};
use crate::types::{DatasetSpec, DownsamplingStep};

/// Maximum number of levels the automatic estimate produces beyond level 0.
pub const MAX_PYRAMID_LEVELS: usize = 10;

/// Parse explicit steps such as `"2,2,1; 2,2,1; 2,2,2"`.
pub fn parse_steps(text: &str) -> Result<Vec<DownsamplingStep>> {
    let mut steps = Vec::new();
    for level in text.split(';').map(str::trim).filter(|l| !l.is_empty()) {
        let factors = level
            .split(',')
            .map(|f| {
                f.trim().parse::<u32>().map_err(|_| {
                    FusionError::configuration(format!(
                        "invalid downsampling factor '{}' in '{}'",
                        f.trim(),
                        level
                    ))
                })
            })
            .collect::<Result<Vec<u32>>>()?;

        let factors: [u32; 3] = factors.try_into().map_err(|_| {
            FusionError::configuration(format!(
                "downsampling step '{}' must have three factors",
                level
            ))
        })?;
        steps.push(DownsamplingStep::new(factors)?);
    }

    if steps.is_empty() {
        return Err(FusionError::configuration("no downsampling steps given"));
    }
    Ok(steps)
}

/// Propose downsampling steps for a volume.
///
/// Starting from voxel size `(1, 1, anisotropy)`, every level halves the
/// axes whose voxel size is within 1.5x of the finest axis that still has
/// more than one voxel. Levels are added until the volume fits into a
/// single block, up to [`MAX_PYRAMID_LEVELS`]. A non-finite or
/// non-positive anisotropy counts as 1.
pub fn estimate_pyramid(
    dimensions: [u64; 3],
    block_size: [u32; 3],
    anisotropy: f64,
) -> Vec<DownsamplingStep> {
    let anisotropy = if anisotropy.is_finite() && anisotropy > 0.0 {
        anisotropy
    } else {
        1.0
    };
    let mut voxel = [1.0, 1.0, anisotropy];
    let mut dims = dimensions;
    let mut steps = Vec::new();

    while steps.len() < MAX_PYRAMID_LEVELS && (0..3).any(|d| dims[d] > block_size[d] as u64) {
        let finest = (0..3)
            .filter(|&d| dims[d] > 1)
            .map(|d| voxel[d])
            .fold(f64::INFINITY, f64::min);

        let mut factors = [1u32; 3];
        for d in 0..3 {
            if dims[d] > 1 && voxel[d] <= finest * 1.5 {
                factors[d] = 2;
            }
        }
        if factors == [1, 1, 1] {
            break;
        }

        for d in 0..3 {
            voxel[d] *= factors[d] as f64;
            dims[d] = dims[d].div_ceil(factors[d] as u64);
        }
        steps.push(DownsamplingStep(factors));
    }

    steps
}

/// Cumulative factors per level, starting with `[1, 1, 1]` for level 0.
pub fn cumulative_factors(steps: &[DownsamplingStep]) -> Vec<[u64; 3]> {
    let mut factors = vec![[1u64; 3]];
    let mut current = [1u64; 3];
    for step in steps {
        let f = step.factors();
        for d in 0..3 {
            current[d] *= f[d] as u64;
        }
        factors.push(current);
    }
    factors
}

/// Path of pyramid level `level` next to `level0`, which must end in `/s0`.
pub fn level_path(level0: &str, level: usize) -> Result<String> {
    let prefix = level0.strip_suffix("/s0").ok_or_else(|| {
        FusionError::configuration(format!(
            "pyramid levels require a dataset ending in /s0, got {}",
            level0
        ))
    })?;
    Ok(format!("{}/s{}", prefix, level))
}

/// Group holding a dataset, `/` for top-level datasets.
pub fn parent_group(dataset: &str) -> String {
    match dataset.trim_end_matches('/').rsplit_once('/') {
        Some((parent, _)) if !parent.is_empty() => parent.to_string(),
        _ => "/".to_string(),
    }
}

/// Dataset specs of the levels beyond 0.
///
/// Level `k` has `ceil(dims(k-1) / step(k))` voxels per axis and the same
/// block size as level 0. A leading `1,1,1` step describes level 0 itself
/// and is skipped.
pub fn plan_levels(level0: &DatasetSpec, steps: &[DownsamplingStep]) -> Result<Vec<DatasetSpec>> {
    let steps = match steps.first() {
        Some(first) if first.is_identity() => &steps[1..],
        _ => steps,
    };

    let factors = cumulative_factors(steps);
    let mut levels = Vec::with_capacity(steps.len());
    let mut dimensions = level0.dimensions;

    for (i, step) in steps.iter().enumerate() {
        let f = step.factors();
        for d in 0..3 {
            dimensions[d] = dimensions[d].div_ceil(f[d] as u64);
        }
        let base = level0.downsampling_factors;
        let cumulative = factors[i + 1];
        levels.push(DatasetSpec {
            dataset: level_path(&level0.dataset, i + 1)?,
            dimensions,
            downsampling_factors: [
                base[0] * cumulative[0],
                base[1] * cumulative[1],
                base[2] * cumulative[2],
            ],
            ..level0.clone()
        });
    }

    Ok(levels)
}
