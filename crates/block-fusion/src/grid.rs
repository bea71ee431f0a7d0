//! Partitioning of an output volume into chunk-aligned task blocks.

use tracing::warn;

use crate::types::GridBlock;

/// Tile `dimensions` with super-blocks of `block_size * blocks_per_job`.
///
/// The last tile along each axis is clipped to the remaining size. Blocks
/// are enumerated z-major (z outermost, x innermost) so the result is a
/// fixed, reproducible sequence for identical inputs. A non-positive
/// dimension yields no blocks.
pub fn partition(
    dimensions: [i64; 3],
    block_size: [u32; 3],
    blocks_per_job: [u32; 3],
) -> Vec<GridBlock> {
    if dimensions.iter().any(|&d| d <= 0) {
        return Vec::new();
    }
    if block_size.iter().chain(blocks_per_job.iter()).any(|&b| b == 0) {
        warn!(
            block_size = ?block_size,
            blocks_per_job = ?blocks_per_job,
            "Zero block size, nothing to partition"
        );
        return Vec::new();
    }

    let dims = [dimensions[0] as u64, dimensions[1] as u64, dimensions[2] as u64];
    let super_block = [
        block_size[0] as u64 * blocks_per_job[0] as u64,
        block_size[1] as u64 * blocks_per_job[1] as u64,
        block_size[2] as u64 * blocks_per_job[2] as u64,
    ];
    let counts = [
        dims[0].div_ceil(super_block[0]),
        dims[1].div_ceil(super_block[1]),
        dims[2].div_ceil(super_block[2]),
    ];

    let mut blocks = Vec::with_capacity((counts[0] * counts[1] * counts[2]) as usize);
    for bz in 0..counts[2] {
        for by in 0..counts[1] {
            for bx in 0..counts[0] {
                let index = [bx, by, bz];
                let mut offset = [0u64; 3];
                let mut size = [0u64; 3];
                let mut grid_offset = [0u64; 3];
                for d in 0..3 {
                    offset[d] = index[d] * super_block[d];
                    size[d] = super_block[d].min(dims[d] - offset[d]);
                    grid_offset[d] = offset[d] / block_size[d] as u64;
                }
                blocks.push(GridBlock {
                    offset,
                    size,
                    grid_offset,
                });
            }
        }
    }

    blocks
}
