//! Orchestrates a complete fusion run.

use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::info;

use crate::anisotropy::{adjust_bounding_box, validate_factor};
use crate::catalog::{CatalogLoader, Fusion, SourceCatalog};
use crate::config::FusionJobConfig;
use crate::container::{create_dataset, write_multiscales, MultiscaleLevel, WriterKey, WriterRegistry};
use crate::error::{FusionError, Result};
use crate::executor::{ExecutionReport, Executor};
use crate::grid::partition;
use crate::metadata::{CompatibilityMetadata, DatasetRecord, FusionRecord, JsonSidecar};
use crate::pyramid::{estimate_pyramid, parent_group, plan_levels, PyramidBuilder};
use crate::types::{BoundingBox, DatasetSpec, ViewId};
use crate::worker::{BlockFusionWorker, FusionParams, FUSION_STAGE};

/// Outcome of a successful run.
#[derive(Debug)]
pub struct FusionSummary {
    pub bounding_box: BoundingBox,
    pub anisotropy_factor: Option<f64>,
    /// Level 0 first.
    pub datasets: Vec<DatasetSpec>,
    /// One report per stage, level 0 first.
    pub stages: Vec<ExecutionReport>,
    pub elapsed: Duration,
}

impl FusionSummary {
    pub fn blocks_written(&self) -> usize {
        self.stages.iter().map(|s| s.written).sum()
    }

    pub fn blocks_skipped(&self) -> usize {
        self.stages.iter().map(|s| s.skipped).sum()
    }
}

/// Runs validation, container setup, level 0 and the pyramid.
pub struct FusionDriver<'a, L, F, E> {
    config: &'a FusionJobConfig,
    loader: &'a L,
    fusion: &'a F,
    executor: &'a E,
    metadata: Box<dyn CompatibilityMetadata + 'a>,
    registry: WriterRegistry,
}

impl<'a, L, F, E> FusionDriver<'a, L, F, E>
where
    L: CatalogLoader,
    F: Fusion<L::Catalog>,
    E: Executor,
{
    pub fn new(config: &'a FusionJobConfig, loader: &'a L, fusion: &'a F, executor: &'a E) -> Self {
        Self {
            config,
            loader,
            fusion,
            executor,
            metadata: Box::new(JsonSidecar),
            registry: WriterRegistry::new(),
        }
    }

    /// Replace the default `fusion.json` sidecar.
    pub fn with_metadata(mut self, metadata: impl CompatibilityMetadata + 'a) -> Self {
        self.metadata = Box::new(metadata);
        self
    }

    pub fn registry(&self) -> &WriterRegistry {
        &self.registry
    }

    pub fn run(&self) -> Result<FusionSummary> {
        let start = Instant::now();
        let config = self.config;
        config.validate()?;

        let catalog = self.loader.load()?;
        let views = self.select_views(&catalog)?;
        let mut bounding_box = catalog.bounding_box(config.bounding_box.as_deref(), &views)?;
        info!(bounding_box = %bounding_box, views = views.len(), "Fusing volume");

        let anisotropy = if config.preserve_anisotropy {
            let factor = match config.anisotropy_factor {
                Some(factor) => factor,
                None => catalog.average_anisotropy_factor(&views)?,
            };
            let factor = validate_factor(factor)?;
            bounding_box = adjust_bounding_box(&bounding_box, factor)?;
            info!(factor = factor, bounding_box = %bounding_box, "Preserving anisotropy");
            Some(factor)
        } else {
            None
        };

        let level0 = DatasetSpec {
            container: config.container.clone(),
            dataset: config.dataset_path(),
            backend: config.backend,
            dimensions: bounding_box.dimensions(),
            block_size: config.block_size,
            data_type: config.output_data_type(),
            intensity: config.intensity()?,
            downsampling_factors: [1, 1, 1],
        };

        let steps = if config.multi_res {
            estimate_pyramid(level0.dimensions, level0.block_size, anisotropy.unwrap_or(1.0))
        } else {
            config.downsampling_steps()?.unwrap_or_default()
        };
        let levels = plan_levels(&level0, &steps)?;

        let offset = bounding_box.min();
        for spec in std::iter::once(&level0).chain(&levels) {
            create_dataset(spec, &config.compression, offset)?;
        }
        if !levels.is_empty() {
            let entries: Vec<MultiscaleLevel> = std::iter::once(&level0)
                .chain(&levels)
                .map(|spec| MultiscaleLevel {
                    path: spec
                        .dataset
                        .rsplit('/')
                        .next()
                        .unwrap_or_default()
                        .to_string(),
                    factors: spec.downsampling_factors,
                })
                .collect();
            write_multiscales(&config.container, &parent_group(&level0.dataset), &entries)?;
        }

        let record = FusionRecord {
            container: config.container.clone(),
            backend: config.backend,
            bounding_box,
            offset,
            anisotropy_factor: anisotropy,
            views: views.clone(),
            datasets: std::iter::once(&level0)
                .chain(&levels)
                .map(DatasetRecord::from)
                .collect(),
            created: Utc::now(),
        };
        self.metadata.write(&record)?;

        let blocks = partition(
            bounding_box.dimensions().map(|d| d as i64),
            config.block_size,
            config.blocks_per_job,
        );
        let params = FusionParams {
            bounding_box,
            views,
            anisotropy,
            dataset: level0.clone(),
            prefetch: config.prefetch,
        };
        let worker = BlockFusionWorker::new(self.loader, self.fusion, &self.registry, &params);
        let report = self
            .executor
            .execute(FUSION_STAGE, &blocks, |block| worker.process(block));
        self.registry.close(&WriterKey::for_spec(&level0))?;
        let mut stages = vec![report.into_result()?];

        if !levels.is_empty() {
            let builder = PyramidBuilder::new(self.executor, &self.registry, config.downsample_method)
                .with_blocks_per_job(config.blocks_per_job);
            stages.extend(builder.build(&level0, &levels)?);
        }

        let mut datasets = vec![level0];
        datasets.extend(levels);
        let summary = FusionSummary {
            bounding_box,
            anisotropy_factor: anisotropy,
            datasets,
            stages,
            elapsed: start.elapsed(),
        };

        info!(
            datasets = summary.datasets.len(),
            written = summary.blocks_written(),
            skipped = summary.blocks_skipped(),
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "Fusion complete"
        );
        Ok(summary)
    }

    fn select_views(&self, catalog: &L::Catalog) -> Result<Vec<ViewId>> {
        let available = catalog.view_ids();
        let views = match &self.config.views {
            Some(requested) => {
                if let Some(missing) = requested.iter().find(|v| !available.contains(v)) {
                    return Err(FusionError::configuration(format!(
                        "view {} is not in the catalog",
                        missing
                    )));
                }
                requested.clone()
            }
            None => available,
        };
        if views.is_empty() {
            return Err(FusionError::configuration("no views to fuse"));
        }
        Ok(views)
    }
}
