//! Source views and the services the fusion core consumes from them.
//!
//! The core never looks inside a view: it asks the catalog where a view
//! lands in output space, which native storage blocks cover a region, and
//! hands the selected views to a [`Fusion`] implementation.

mod fusion;
mod zarr;

pub use fusion::MeanFusion;
pub use zarr::{
    CatalogDescription, ChunkRef, NamedBoundingBox, ViewDescription, ZarrViewCatalog,
    ZarrViewCatalogLoader,
};

use nalgebra::Affine3;

use crate::error::Result;
use crate::types::{BoundingBox, ViewId};

/// One native storage block of a source view that can be read ahead of
/// fusion.
pub trait PrefetchBlock: Send + Sync {
    /// Reference that keeps the loaded data alive (e.g. pinned in a cache).
    type Loaded: Send;

    fn load(&self) -> Result<Self::Loaded>;
}

/// Catalog of source views, their registrations and their storage.
pub trait SourceCatalog: Send + Sync {
    type Block: PrefetchBlock;

    /// All views in a fixed order.
    fn view_ids(&self) -> Vec<ViewId>;

    /// Bounds of a view after applying its transform chain, in output space.
    fn transformed_bounding_box(&self, view: ViewId) -> Result<BoundingBox>;

    /// Native blocks of `view` needed to fuse `region` (output space).
    fn find_overlapping_blocks(&self, view: ViewId, region: &BoundingBox)
        -> Result<Vec<Self::Block>>;

    /// Apply `transform` after the view's current registration.
    fn preconcatenate_transform(&mut self, view: ViewId, transform: &Affine3<f64>) -> Result<()>;

    /// Mean z/xy voxel spacing ratio across `views`.
    fn average_anisotropy_factor(&self, views: &[ViewId]) -> Result<f64>;

    /// Named bounding box, or the union of all views when `name` is `None`.
    fn bounding_box(&self, name: Option<&str>, views: &[ViewId]) -> Result<BoundingBox>;
}

/// Rebuilds a catalog from immutable parameters, once per task.
pub trait CatalogLoader: Send + Sync {
    type Catalog: SourceCatalog;

    fn load(&self) -> Result<Self::Catalog>;
}

/// The blending step: computes dense float samples for `region` from the
/// selected views, x varying fastest.
pub trait Fusion<C: SourceCatalog>: Send + Sync {
    fn fuse(&self, catalog: &C, views: &[ViewId], region: &BoundingBox) -> Result<Vec<f32>>;
}
