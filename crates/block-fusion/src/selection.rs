//! Per-block selection of the views that contribute to an output region.

use tracing::debug;

use crate::catalog::SourceCatalog;
use crate::error::Result;
use crate::types::{BoundingBox, ViewId};

/// Padding added around each view's transformed bounds before the overlap
/// test, covering interpolation support and rounding at the view border.
pub const OVERLAP_MARGIN: u32 = 2;

/// A view that contributes to a region, with the native blocks to prefetch.
#[derive(Debug)]
pub struct SelectedView<B> {
    pub view: ViewId,
    pub blocks: Vec<B>,
}

/// Select the views whose data is needed to fuse `region`.
///
/// A view is kept when its transformed bounds, expanded by `margin`,
/// intersect the region and it has at least one native block covering the
/// region. The result keeps the order of `views`.
pub fn select_views<C>(
    catalog: &C,
    region: &BoundingBox,
    views: &[ViewId],
    margin: u32,
) -> Result<Vec<SelectedView<C::Block>>>
where
    C: SourceCatalog + ?Sized,
{
    let mut selected = Vec::new();

    for &view in views {
        let bounds = catalog.transformed_bounding_box(view)?.expand(margin);
        if !bounds.intersects(region) {
            continue;
        }

        let blocks = catalog.find_overlapping_blocks(view, region)?;
        if blocks.is_empty() {
            debug!(view = %view, region = %region, "View bounds overlap but no native blocks needed");
            continue;
        }

        selected.push(SelectedView { view, blocks });
    }

    Ok(selected)
}
