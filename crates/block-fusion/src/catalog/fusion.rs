//! Nearest-neighbour mean fusion over Zarr source views.

use std::collections::HashMap;
use std::sync::Arc;

use nalgebra::Point3;

use super::zarr::ZarrViewCatalog;
use super::{Fusion, PrefetchBlock, SourceCatalog};
use crate::error::Result;
use crate::types::{BoundingBox, ViewId};

struct LoadedChunk {
    origin: [u64; 3],
    shape: [u64; 3],
    data: Arc<Vec<f32>>,
}

/// Averages the nearest source voxel of every view covering an output
/// voxel. Voxels no view covers are 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeanFusion;

impl Fusion<ZarrViewCatalog> for MeanFusion {
    fn fuse(
        &self,
        catalog: &ZarrViewCatalog,
        views: &[ViewId],
        region: &BoundingBox,
    ) -> Result<Vec<f32>> {
        let dims = region.dimensions();
        let min = region.min();
        let len = region.num_voxels() as usize;
        let mut sum = vec![0.0f64; len];
        let mut count = vec![0u32; len];

        for &view in views {
            let source = catalog.source(view)?;
            let max_index = source.max_index();

            let mut chunks = HashMap::new();
            for block in catalog.find_overlapping_blocks(view, region)? {
                chunks.insert(
                    block.chunk(),
                    LoadedChunk {
                        origin: block.origin(),
                        shape: block.shape(),
                        data: block.load()?,
                    },
                );
            }
            if chunks.is_empty() {
                continue;
            }

            let mut i = 0;
            for z in 0..dims[2] {
                for y in 0..dims[1] {
                    for x in 0..dims[0] {
                        let p = Point3::new(
                            (min[0] + x as i64) as f64,
                            (min[1] + y as i64) as f64,
                            (min[2] + z as i64) as f64,
                        );
                        let s = source.inverse.transform_point(&p);
                        let nearest = [s.x.round(), s.y.round(), s.z.round()];

                        if (0..3).all(|d| nearest[d] >= 0.0 && nearest[d] <= max_index[d]) {
                            let voxel = nearest.map(|v| v as u64);
                            let chunk = [
                                voxel[0] / source.chunk_shape[0],
                                voxel[1] / source.chunk_shape[1],
                                voxel[2] / source.chunk_shape[2],
                            ];
                            if let Some(c) = chunks.get(&chunk) {
                                let lx = voxel[0] - c.origin[0];
                                let ly = voxel[1] - c.origin[1];
                                let lz = voxel[2] - c.origin[2];
                                let index = lx + ly * c.shape[0] + lz * c.shape[0] * c.shape[1];
                                sum[i] += c.data[index as usize] as f64;
                                count[i] += 1;
                            }
                        }
                        i += 1;
                    }
                }
            }
        }

        Ok(sum
            .into_iter()
            .zip(count)
            .map(|(s, n)| if n == 0 { 0.0 } else { (s / n as f64) as f32 })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogDescription, ViewDescription};
    use test_utils::generators::{constant_volume, ramp_volume, write_zarr_volume};

    fn view(path: std::path::PathBuf, setup: u32, dx: f64) -> ViewDescription {
        ViewDescription {
            timepoint: 0,
            setup,
            path,
            dataset: "/".to_string(),
            transform: [1.0, 0.0, 0.0, dx, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0],
            voxel_size: [1.0, 1.0, 1.0],
        }
    }

    #[test]
    fn test_single_view_reproduces_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.zarr");
        let data = ramp_volume([12, 10, 6]);
        write_zarr_volume(&path, [12, 10, 6], [5, 5, 5], &data).unwrap();

        let catalog = ZarrViewCatalog::open(&CatalogDescription {
            views: vec![view(path, 0, 0.0)],
            bounding_boxes: Vec::new(),
            cache_size_mb: 8,
        })
        .unwrap();

        let region = BoundingBox::new([3, 4, 2], [8, 6, 4]).unwrap();
        let fused = MeanFusion
            .fuse(&catalog, &[ViewId::new(0, 0)], &region)
            .unwrap();
        assert_eq!(fused.len(), 6 * 3 * 3);
        // First voxel of the region
        assert_eq!(fused[0], data[3 + 4 * 12 + 2 * 12 * 10]);
        // Last voxel of the region
        assert_eq!(fused[fused.len() - 1], data[8 + 6 * 12 + 4 * 12 * 10]);
    }

    #[test]
    fn test_overlap_is_averaged_and_gaps_are_zero() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.zarr");
        let b = dir.path().join("b.zarr");
        write_zarr_volume(&a, [10, 4, 4], [4, 4, 4], &constant_volume([10, 4, 4], 100.0)).unwrap();
        write_zarr_volume(&b, [10, 4, 4], [4, 4, 4], &constant_volume([10, 4, 4], 300.0)).unwrap();

        let catalog = ZarrViewCatalog::open(&CatalogDescription {
            views: vec![view(a, 0, 0.0), view(b, 1, 5.0)],
            bounding_boxes: Vec::new(),
            cache_size_mb: 8,
        })
        .unwrap();
        let views = catalog.view_ids();

        // x = 0..4 only a, 5..9 both, 10..14 only b, 15..19 none
        let region = BoundingBox::new([0, 0, 0], [19, 0, 0]).unwrap();
        let fused = MeanFusion.fuse(&catalog, &views, &region).unwrap();
        assert_eq!(fused[2], 100.0);
        assert_eq!(fused[7], 200.0);
        assert_eq!(fused[12], 300.0);
        assert_eq!(fused[17], 0.0);
    }
}
