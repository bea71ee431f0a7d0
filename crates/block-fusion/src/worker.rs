//! Per-block pipeline: select views, prefetch, fuse, convert, write.

use rayon::prelude::*;
use tracing::debug;

use crate::anisotropy::anisotropy_transform;
use crate::catalog::{CatalogLoader, Fusion, PrefetchBlock, SourceCatalog};
use crate::container::WriterRegistry;
use crate::convert::convert_samples;
use crate::error::{FusionError, Result};
use crate::executor::TaskOutcome;
use crate::selection::{select_views, OVERLAP_MARGIN};
use crate::types::{BoundingBox, DatasetSpec, GridBlock, ViewId};

/// Stage name used for level-0 fusion tasks.
pub const FUSION_STAGE: &str = "fusion";

/// Upper bound on prefetch threads within one task.
pub const MAX_PREFETCH_THREADS: usize = 128;

/// Immutable parameters shared by every fusion task of a run.
#[derive(Debug, Clone)]
pub struct FusionParams {
    /// Output bounding box; block offsets are relative to its minimum.
    pub bounding_box: BoundingBox,
    /// Views to fuse.
    pub views: Vec<ViewId>,
    /// Anisotropy factor to prepend to every view transform.
    pub anisotropy: Option<f64>,
    /// Level-0 dataset.
    pub dataset: DatasetSpec,
    /// Read source chunks ahead of fusion.
    pub prefetch: bool,
}

/// Load `blocks` concurrently and hold on to the results.
///
/// The pool is sized to the number of blocks and capped at
/// [`MAX_PREFETCH_THREADS`]. Returns once every load has finished.
pub fn prefetch<B: PrefetchBlock>(blocks: &[&B]) -> Result<Vec<B::Loaded>> {
    if blocks.is_empty() {
        return Ok(Vec::new());
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(blocks.len().min(MAX_PREFETCH_THREADS))
        .thread_name(|i| format!("prefetch-{}", i))
        .build()
        .map_err(|e| FusionError::storage(format!("cannot start prefetch pool: {}", e)))?;

    pool.install(|| blocks.par_iter().map(|b| b.load()).collect())
}

/// Computes and writes level-0 blocks.
pub struct BlockFusionWorker<'a, L, F> {
    loader: &'a L,
    fusion: &'a F,
    registry: &'a WriterRegistry,
    params: &'a FusionParams,
}

impl<'a, L, F> BlockFusionWorker<'a, L, F>
where
    L: CatalogLoader,
    F: Fusion<L::Catalog>,
{
    pub fn new(
        loader: &'a L,
        fusion: &'a F,
        registry: &'a WriterRegistry,
        params: &'a FusionParams,
    ) -> Self {
        Self {
            loader,
            fusion,
            registry,
            params,
        }
    }

    /// Process one block. Any failure is reported as a task error for the
    /// block.
    pub fn process(&self, block: &GridBlock) -> Result<TaskOutcome> {
        self.run(block)
            .map_err(|e| FusionError::task_compute(FUSION_STAGE, block, e))
    }

    fn run(&self, block: &GridBlock) -> Result<TaskOutcome> {
        // Task-local catalog, never shared between tasks
        let mut catalog = self.loader.load()?;
        if let Some(factor) = self.params.anisotropy {
            let scale = anisotropy_transform(factor)?;
            for &view in &self.params.views {
                catalog.preconcatenate_transform(view, &scale)?;
            }
        }

        let region = block.region(self.params.bounding_box.min());
        let selected = select_views(&catalog, &region, &self.params.views, OVERLAP_MARGIN)?;
        if selected.is_empty() {
            debug!(block = %block, "No contributing views, skipping block");
            return Ok(TaskOutcome::Skipped);
        }

        let loaded = if self.params.prefetch {
            let blocks: Vec<_> = selected.iter().flat_map(|s| s.blocks.iter()).collect();
            prefetch(&blocks)?
        } else {
            Vec::new()
        };

        let views: Vec<ViewId> = selected.iter().map(|s| s.view).collect();
        let fused = self.fusion.fuse(&catalog, &views, &region)?;
        if fused.len() != block.num_voxels() {
            return Err(FusionError::catalog(format!(
                "fusion returned {} samples for {} voxels",
                fused.len(),
                block.num_voxels()
            )));
        }

        let dataset = &self.params.dataset;
        let samples = convert_samples(fused, dataset.data_type, dataset.intensity)?;

        let writer = self.registry.acquire(dataset)?;
        let written = writer.write_block(block, &samples);
        self.registry.release(writer);
        drop(loaded);
        written?;

        debug!(
            block = %block,
            views = views.len(),
            prefetched = self.params.prefetch,
            "Fused block"
        );
        Ok(TaskOutcome::Written)
    }
}
