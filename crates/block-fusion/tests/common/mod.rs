//! Common helpers for block-fusion integration tests.
//!
//! Provides an in-memory catalog whose views are constant-valued boxes, so
//! expected output can be computed without reading any source data.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use block_fusion::{
    BoundingBox, CatalogLoader, Fusion, FusionError, FusionJobConfig, PrefetchBlock, Result,
    SourceCatalog, ViewId,
};
use nalgebra::Affine3;

/// Counters shared by every catalog a loader produces.
#[derive(Debug, Default)]
pub struct Counters {
    pub loads: AtomicUsize,
    pub prefetched: AtomicUsize,
    pub transforms: AtomicUsize,
}

impl Counters {
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn prefetched(&self) -> usize {
        self.prefetched.load(Ordering::SeqCst)
    }

    pub fn transforms(&self) -> usize {
        self.transforms.load(Ordering::SeqCst)
    }
}

/// A view occupying `bounds` with every voxel equal to `value`.
#[derive(Debug, Clone, Copy)]
pub struct BoxView {
    pub id: ViewId,
    pub bounds: BoundingBox,
    pub value: f32,
}

pub fn box_view(setup: u32, min: [i64; 3], max: [i64; 3], value: f32) -> BoxView {
    BoxView {
        id: ViewId::new(0, setup),
        bounds: BoundingBox::new(min, max).unwrap(),
        value,
    }
}

pub struct BoxBlock {
    counters: Arc<Counters>,
}

impl PrefetchBlock for BoxBlock {
    type Loaded = ();

    fn load(&self) -> Result<()> {
        self.counters.prefetched.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct BoxCatalog {
    views: Vec<BoxView>,
    named: HashMap<String, BoundingBox>,
    counters: Arc<Counters>,
}

impl BoxCatalog {
    fn view(&self, id: ViewId) -> Result<&BoxView> {
        self.views
            .iter()
            .find(|v| v.id == id)
            .ok_or_else(|| FusionError::catalog(format!("unknown view {}", id)))
    }
}

impl SourceCatalog for BoxCatalog {
    type Block = BoxBlock;

    fn view_ids(&self) -> Vec<ViewId> {
        self.views.iter().map(|v| v.id).collect()
    }

    fn transformed_bounding_box(&self, view: ViewId) -> Result<BoundingBox> {
        Ok(self.view(view)?.bounds)
    }

    fn find_overlapping_blocks(&self, view: ViewId, region: &BoundingBox) -> Result<Vec<BoxBlock>> {
        Ok(if self.view(view)?.bounds.intersects(region) {
            vec![BoxBlock {
                counters: Arc::clone(&self.counters),
            }]
        } else {
            Vec::new()
        })
    }

    fn preconcatenate_transform(&mut self, view: ViewId, _: &Affine3<f64>) -> Result<()> {
        self.view(view)?;
        self.counters.transforms.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn average_anisotropy_factor(&self, _: &[ViewId]) -> Result<f64> {
        Ok(1.0)
    }

    fn bounding_box(&self, name: Option<&str>, views: &[ViewId]) -> Result<BoundingBox> {
        if let Some(name) = name {
            return self
                .named
                .get(name)
                .copied()
                .ok_or_else(|| FusionError::configuration(format!("no bounding box {}", name)));
        }
        let mut union: Option<BoundingBox> = None;
        for &v in views {
            let bounds = self.view(v)?.bounds;
            union = Some(match union {
                Some(u) => u.union(&bounds),
                None => bounds,
            });
        }
        union.ok_or_else(|| FusionError::configuration("no views"))
    }
}

/// Builds a fresh [`BoxCatalog`] on every load.
pub struct BoxCatalogLoader {
    views: Vec<BoxView>,
    named: HashMap<String, BoundingBox>,
    pub counters: Arc<Counters>,
}

impl BoxCatalogLoader {
    pub fn new(views: Vec<BoxView>) -> Self {
        Self {
            views,
            named: HashMap::new(),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn with_bounding_box(mut self, name: &str, min: [i64; 3], max: [i64; 3]) -> Self {
        self.named
            .insert(name.to_string(), BoundingBox::new(min, max).unwrap());
        self
    }
}

impl CatalogLoader for BoxCatalogLoader {
    type Catalog = BoxCatalog;

    fn load(&self) -> Result<BoxCatalog> {
        self.counters.loads.fetch_add(1, Ordering::SeqCst);
        Ok(BoxCatalog {
            views: self.views.clone(),
            named: self.named.clone(),
            counters: Arc::clone(&self.counters),
        })
    }
}

/// Mean of the constant values of all views covering each voxel, 0 where
/// no view does.
pub struct BoxFusion;

impl Fusion<BoxCatalog> for BoxFusion {
    fn fuse(&self, catalog: &BoxCatalog, views: &[ViewId], region: &BoundingBox) -> Result<Vec<f32>> {
        let selected = views
            .iter()
            .map(|&v| catalog.view(v))
            .collect::<Result<Vec<_>>>()?;

        let (min, max) = (region.min(), region.max());
        let mut out = Vec::with_capacity(region.num_voxels() as usize);
        for z in min[2]..=max[2] {
            for y in min[1]..=max[1] {
                for x in min[0]..=max[0] {
                    let (sum, count) = selected
                        .iter()
                        .filter(|v| v.bounds.contains([x, y, z]))
                        .fold((0.0f32, 0u32), |(s, c), v| (s + v.value, c + 1));
                    out.push(if count == 0 { 0.0 } else { sum / count as f32 });
                }
            }
        }
        Ok(out)
    }
}

/// Fusion that always fails.
pub struct FailingFusion;

impl Fusion<BoxCatalog> for FailingFusion {
    fn fuse(&self, _: &BoxCatalog, _: &[ViewId], _: &BoundingBox) -> Result<Vec<f32>> {
        Err(FusionError::catalog("source unreadable"))
    }
}

/// Job writing `/fused/s0` into `container`, with extra YAML appended.
pub fn job(container: &Path, extra: &str) -> FusionJobConfig {
    let yaml = format!(
        "container: {}\ncatalog: unused.yaml\ndataset: /fused/s0\nexecutor: {{ threads: 4 }}\n{}",
        container.display(),
        extra
    );
    FusionJobConfig::from_yaml(&yaml).unwrap()
}
