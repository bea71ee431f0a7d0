//! Multi-resolution pyramid: level planning, reduction and the per-level
//! write stages that follow level 0.

mod builder;
mod downsample;
mod plan;

pub use builder::{PyramidBuilder, PYRAMID_STAGE};
pub use downsample::{downsample_block, DownsampleMethod};
pub use plan::{
    cumulative_factors, estimate_pyramid, level_path, parent_group, parse_steps, plan_levels,
    MAX_PYRAMID_LEVELS,
};
