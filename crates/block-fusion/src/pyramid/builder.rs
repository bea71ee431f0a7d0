//! Write stages for pyramid levels beyond 0.

use tracing::{debug, info};

use super::downsample::{downsample_block, DownsampleMethod};
use crate::container::{ContainerWriter, WriterKey, WriterRegistry};
use crate::convert::BlockSamples;
use crate::error::{FusionError, Result};
use crate::executor::{ExecutionReport, Executor, TaskOutcome};
use crate::grid::partition;
use crate::types::{DatasetSpec, GridBlock};

/// Stage name prefix for pyramid tasks; the level index is appended.
pub const PYRAMID_STAGE: &str = "pyramid";

/// Derives each pyramid level from the one before it.
///
/// Every level is its own stage: level `k` starts only after all blocks of
/// level `k - 1` are written and its shared writer, if any, is closed.
pub struct PyramidBuilder<'a, E> {
    executor: &'a E,
    registry: &'a WriterRegistry,
    method: DownsampleMethod,
    blocks_per_job: [u32; 3],
}

impl<'a, E: Executor> PyramidBuilder<'a, E> {
    pub fn new(executor: &'a E, registry: &'a WriterRegistry, method: DownsampleMethod) -> Self {
        Self {
            executor,
            registry,
            method,
            blocks_per_job: [1, 1, 1],
        }
    }

    pub fn with_blocks_per_job(mut self, blocks_per_job: [u32; 3]) -> Self {
        self.blocks_per_job = blocks_per_job;
        self
    }

    /// Build `levels` (created but empty) from the finished `level0`.
    ///
    /// Stops at the first level with failed blocks.
    pub fn build(&self, level0: &DatasetSpec, levels: &[DatasetSpec]) -> Result<Vec<ExecutionReport>> {
        let mut reports = Vec::with_capacity(levels.len());
        let mut previous = level0;

        for (i, level) in levels.iter().enumerate() {
            let stage = format!("{}-s{}", PYRAMID_STAGE, i + 1);
            let step = relative_step(previous, level)?;
            let blocks = partition(
                level.dimensions.map(|d| d as i64),
                level.block_size,
                self.blocks_per_job,
            );

            info!(
                stage = %stage,
                dataset = %level.dataset,
                dimensions = ?level.dimensions,
                step = ?step,
                blocks = blocks.len(),
                "Building pyramid level"
            );

            let report = self.executor.execute(&stage, &blocks, |block| {
                self.downsample(previous, level, step, block)
                    .map_err(|e| FusionError::task_compute(stage.as_str(), block, e))
            });
            self.registry.close(&WriterKey::for_spec(level))?;
            reports.push(report.into_result()?);

            previous = level;
        }

        Ok(reports)
    }

    fn downsample(
        &self,
        source: &DatasetSpec,
        target: &DatasetSpec,
        step: [u32; 3],
        block: &GridBlock,
    ) -> Result<TaskOutcome> {
        let mut offset = [0u64; 3];
        let mut size = [0u64; 3];
        for d in 0..3 {
            offset[d] = block.offset[d] * step[d] as u64;
            size[d] = (block.size[d] * step[d] as u64).min(source.dimensions[d] - offset[d]);
        }

        let data = ContainerWriter::open(source)?
            .read_region(offset, size)?
            .to_f64();
        let (reduced, dims) =
            downsample_block(&data, size.map(|s| s as usize), step, self.method);
        if dims.map(|d| d as u64) != block.size {
            return Err(FusionError::storage(format!(
                "reduced block has size {:?}, expected {:?}",
                dims, block.size
            )));
        }

        let samples = BlockSamples::from_f64(&reduced, target.data_type);
        let writer = self.registry.acquire(target)?;
        let written = writer.write_block(block, &samples);
        self.registry.release(writer);
        written?;

        debug!(dataset = %target.dataset, block = %block, "Downsampled block");
        Ok(TaskOutcome::Written)
    }
}

/// Per-axis factor between two consecutive levels.
fn relative_step(previous: &DatasetSpec, level: &DatasetSpec) -> Result<[u32; 3]> {
    let mut step = [1u32; 3];
    for d in 0..3 {
        let (a, b) = (
            previous.downsampling_factors[d],
            level.downsampling_factors[d],
        );
        if a == 0 || b % a != 0 {
            return Err(FusionError::configuration(format!(
                "level {} factors {:?} are not a multiple of {:?}",
                level.dataset, level.downsampling_factors, previous.downsampling_factors
            )));
        }
        step[d] = (b / a) as u32;
    }
    Ok(step)
}
