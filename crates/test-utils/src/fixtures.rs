//! Common volume and block layouts used across the fusion tests.

/// Volume and block size pairs for grid partition tests.
pub mod grid {
    /// A volume and the block size it is cut with, both `[x, y, z]`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GridScenario {
        pub dimensions: [u64; 3],
        pub block_size: [u32; 3],
        /// Expected number of blocks with one block per job.
        pub blocks: usize,
    }

    /// Cube that divides evenly into 2 x 2 x 2 blocks.
    pub const EVEN_CUBE: GridScenario = GridScenario {
        dimensions: [256, 256, 256],
        block_size: [128, 128, 128],
        blocks: 8,
    };

    /// Every axis leaves a partial block at the far edge.
    pub const RAGGED: GridScenario = GridScenario {
        dimensions: [300, 200, 70],
        block_size: [128, 128, 64],
        blocks: 3 * 2 * 2,
    };

    /// Whole volume fits into one block.
    pub const SINGLE_BLOCK: GridScenario = GridScenario {
        dimensions: [40, 30, 20],
        block_size: [64, 64, 64],
        blocks: 1,
    };

    /// Flat volume, one voxel deep.
    pub const FLAT: GridScenario = GridScenario {
        dimensions: [100, 100, 1],
        block_size: [32, 32, 32],
        blocks: 4 * 4,
    };

    pub const ALL: [GridScenario; 4] = [EVEN_CUBE, RAGGED, SINGLE_BLOCK, FLAT];
}

/// Affine transforms in row-major 3x4 form.
pub mod transforms {
    pub const IDENTITY: [f64; 12] = [
        1.0, 0.0, 0.0, 0.0, //
        0.0, 1.0, 0.0, 0.0, //
        0.0, 0.0, 1.0, 0.0,
    ];

    /// Pure translation.
    pub fn translation(x: f64, y: f64, z: f64) -> [f64; 12] {
        [
            1.0, 0.0, 0.0, x, //
            0.0, 1.0, 0.0, y, //
            0.0, 0.0, 1.0, z,
        ]
    }

    /// Axis-aligned scaling.
    pub fn scaling(x: f64, y: f64, z: f64) -> [f64; 12] {
        [
            x, 0.0, 0.0, 0.0, //
            0.0, y, 0.0, 0.0, //
            0.0, 0.0, z, 0.0,
        ]
    }
}
