//! Block-Parallel Volume Fusion into Chunked Zarr V3 Containers
//!
//! This crate fuses many registered 3D source views into one large output
//! volume. The output bounding box is cut into a grid of blocks, every block
//! is fused and written independently, and an optional multi-resolution
//! pyramid is derived from the finished full-resolution level.
//!
//! - **Block parallel**: tasks share nothing but immutable parameters
//! - **Two backends**: concurrent per-task writers or one serialized writer
//!   for single-file (fully sharded) datasets
//! - **Pyramids**: explicit or estimated downsampling steps
//!
//! # Architecture
//!
//! ```text
//! FusionDriver::run()
//!      │
//!      ├─► validate config, load catalog, resolve bounding box
//!      │
//!      ├─► create datasets (s0..sN), multiscale + sidecar metadata
//!      │
//!      ├─► stage "fusion": one task per grid block
//!      │         │
//!      │         └─► select views ─► prefetch ─► fuse ─► convert ─► write
//!      │
//!      └─► stages "pyramid-s1".."pyramid-sN": read level k-1, reduce, write
//! ```
//!
//! # Example
//!
//! ```ignore
//! use block_fusion::{FusionDriver, FusionJobConfig, LocalExecutor, MeanFusion, ZarrViewCatalogLoader};
//!
//! let config = FusionJobConfig::from_file(path)?;
//! let loader = ZarrViewCatalogLoader::from_file(&config.catalog)?;
//! let executor = LocalExecutor::from_config(&config.executor)?;
//! let summary = FusionDriver::new(&config, &loader, &MeanFusion, &executor).run()?;
//! ```

pub mod anisotropy;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod container;
pub mod convert;
pub mod driver;
pub mod error;
pub mod executor;
pub mod grid;
pub mod metadata;
pub mod pyramid;
pub mod selection;
pub mod types;
pub mod worker;

// Re-export commonly used types at crate root
pub use cache::{ChunkCache, ChunkKey};
pub use catalog::{
    CatalogLoader, Fusion, MeanFusion, PrefetchBlock, SourceCatalog, ZarrViewCatalog,
    ZarrViewCatalogLoader,
};
pub use config::{ContainerConfig, DataTypeFusion, ExecutorConfig, FusionJobConfig, ZarrCompression};
pub use container::{create_dataset, ContainerWriter, StorageBackend, WriterKey, WriterRegistry};
pub use convert::{convert_samples, BlockSamples, IntensityRange, OutputDataType};
pub use driver::{FusionDriver, FusionSummary};
pub use error::{FusionError, Result};
pub use executor::{ExecutionReport, Executor, LocalExecutor, TaskFailure, TaskOutcome};
pub use grid::partition;
pub use metadata::{CompatibilityMetadata, FusionRecord, JsonSidecar, NoMetadata};
pub use pyramid::{DownsampleMethod, PyramidBuilder};
pub use selection::{select_views, SelectedView};
pub use types::{BoundingBox, CacheStats, DatasetSpec, DownsamplingStep, GridBlock, ViewId};
pub use worker::{BlockFusionWorker, FusionParams};
