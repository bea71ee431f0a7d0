//! Source views stored as Zarr V3 arrays and placed by affine transforms.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use nalgebra::{Affine3, Matrix4, Point3};
use serde::{Deserialize, Serialize};
use tracing::debug;
use zarrs::array::{Array, DataType};
use zarrs::array_subset::ArraySubset;
use zarrs_filesystem::FilesystemStore;

use super::{CatalogLoader, PrefetchBlock, SourceCatalog};
use crate::cache::{hash_path, ChunkCache};
use crate::container::to_storage_order;
use crate::error::{FusionError, Result};
use crate::types::{BoundingBox, CacheStats, ViewId};

fn default_dataset() -> String {
    "/".to_string()
}

fn identity_transform() -> [f64; 12] {
    [1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0]
}

fn unit_voxel_size() -> [f64; 3] {
    [1.0, 1.0, 1.0]
}

fn default_cache_size_mb() -> usize {
    256
}

/// One source view as described in the catalog file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewDescription {
    pub timepoint: u32,
    pub setup: u32,
    /// Zarr store holding the view.
    pub path: PathBuf,
    /// Array path inside the store.
    #[serde(default = "default_dataset")]
    pub dataset: String,
    /// View-to-output affine, 3x4 row-major.
    #[serde(default = "identity_transform")]
    pub transform: [f64; 12],
    /// Physical voxel size `[x, y, z]`.
    #[serde(default = "unit_voxel_size")]
    pub voxel_size: [f64; 3],
}

impl ViewDescription {
    pub fn id(&self) -> ViewId {
        ViewId::new(self.timepoint, self.setup)
    }
}

/// A bounding box the user can select by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedBoundingBox {
    pub name: String,
    pub min: [i64; 3],
    pub max: [i64; 3],
}

/// YAML description of all source views.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogDescription {
    pub views: Vec<ViewDescription>,
    #[serde(default)]
    pub bounding_boxes: Vec<NamedBoundingBox>,
    /// Memory budget of the per-task chunk cache.
    #[serde(default = "default_cache_size_mb")]
    pub cache_size_mb: usize,
}

impl CatalogDescription {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| FusionError::catalog(e.to_string()))
    }

    /// Load a description; relative view paths resolve against the file's
    /// directory.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| FusionError::catalog(format!("cannot read {}: {}", path.display(), e)))?;
        let mut description = Self::from_yaml(&text)?;
        if let Some(base) = path.parent() {
            for view in &mut description.views {
                if view.path.is_relative() {
                    view.path = base.join(&view.path);
                }
            }
        }
        Ok(description)
    }
}

fn affine_from_row_major(m: &[f64; 12]) -> Affine3<f64> {
    Affine3::from_matrix_unchecked(Matrix4::new(
        m[0], m[1], m[2], m[3], m[4], m[5], m[6], m[7], m[8], m[9], m[10], m[11], 0.0, 0.0, 0.0,
        1.0,
    ))
}

fn invert(view: ViewId, transform: &Affine3<f64>) -> Result<Affine3<f64>> {
    transform
        .try_inverse()
        .ok_or_else(|| FusionError::catalog(format!("transform of view {} is singular", view)))
}

/// Corners of the box spanned by `min` and `max`.
fn corners(min: [f64; 3], max: [f64; 3]) -> impl Iterator<Item = Point3<f64>> {
    (0..8).map(move |i| {
        Point3::new(
            if i & 1 == 0 { min[0] } else { max[0] },
            if i & 2 == 0 { min[1] } else { max[1] },
            if i & 4 == 0 { min[2] } else { max[2] },
        )
    })
}

/// Bounds of the transformed corners, rounded outwards.
fn transformed_bounds(
    transform: &Affine3<f64>,
    min: [f64; 3],
    max: [f64; 3],
) -> ([f64; 3], [f64; 3]) {
    let mut lo = [f64::INFINITY; 3];
    let mut hi = [f64::NEG_INFINITY; 3];
    for p in corners(min, max) {
        let q = transform.transform_point(&p);
        for d in 0..3 {
            lo[d] = lo[d].min(q[d]);
            hi[d] = hi[d].max(q[d]);
        }
    }
    (lo.map(f64::floor), hi.map(f64::ceil))
}

/// An opened source view.
pub(crate) struct SourceView {
    pub(crate) array: Arc<Array<FilesystemStore>>,
    pub(crate) path_hash: u64,
    pub(crate) dimensions: [u64; 3],
    pub(crate) chunk_shape: [u64; 3],
    pub(crate) transform: Affine3<f64>,
    pub(crate) inverse: Affine3<f64>,
    pub(crate) voxel_size: [f64; 3],
}

impl SourceView {
    fn open(description: &ViewDescription) -> Result<Self> {
        let view = description.id();
        let store = FilesystemStore::new(&description.path).map_err(|e| {
            FusionError::catalog(format!("{}: {}", description.path.display(), e))
        })?;
        let array = Array::open(Arc::new(store), &description.dataset)
            .map_err(|e| FusionError::catalog(format!("view {}: {}", view, e)))?;

        let shape = array.shape().to_vec();
        if shape.len() != 3 {
            return Err(FusionError::catalog(format!(
                "view {} must be 3-dimensional, got shape {:?}",
                view, shape
            )));
        }
        match array.data_type() {
            DataType::UInt8 | DataType::UInt16 | DataType::Float32 => {}
            other => {
                return Err(FusionError::catalog(format!(
                    "view {} has unsupported data type {:?}",
                    view, other
                )))
            }
        }

        let origin = vec![0u64; 3];
        let chunk_shape = array
            .chunk_grid()
            .chunk_shape(&origin, array.shape())
            .map_err(|e| FusionError::catalog(e.to_string()))?
            .ok_or_else(|| FusionError::catalog(format!("view {} has no chunk shape", view)))?;

        let transform = affine_from_row_major(&description.transform);
        let inverse = invert(view, &transform)?;
        let path_hash = hash_path(&format!(
            "{}{}",
            description.path.display(),
            description.dataset
        ));

        Ok(Self {
            array: Arc::new(array),
            path_hash,
            // Stored [z, y, x]
            dimensions: [shape[2], shape[1], shape[0]],
            chunk_shape: [
                chunk_shape[2].get(),
                chunk_shape[1].get(),
                chunk_shape[0].get(),
            ],
            transform,
            inverse,
            voxel_size: description.voxel_size,
        })
    }

    pub(crate) fn max_index(&self) -> [f64; 3] {
        self.dimensions.map(|d| d.saturating_sub(1) as f64)
    }
}

/// Catalog of Zarr source views sharing one chunk cache.
pub struct ZarrViewCatalog {
    views: BTreeMap<ViewId, SourceView>,
    bounding_boxes: Vec<NamedBoundingBox>,
    cache: Arc<Mutex<ChunkCache>>,
}

impl ZarrViewCatalog {
    /// Open every view of `description`.
    pub fn open(description: &CatalogDescription) -> Result<Self> {
        let mut views = BTreeMap::new();
        for view in &description.views {
            if views.insert(view.id(), SourceView::open(view)?).is_some() {
                return Err(FusionError::catalog(format!(
                    "view {} is listed twice",
                    view.id()
                )));
            }
        }
        let cache = ChunkCache::new(description.cache_size_mb * 1024 * 1024);

        Ok(Self {
            views,
            bounding_boxes: description.bounding_boxes.clone(),
            cache: Arc::new(Mutex::new(cache)),
        })
    }

    pub(crate) fn source(&self, view: ViewId) -> Result<&SourceView> {
        self.views
            .get(&view)
            .ok_or_else(|| FusionError::catalog(format!("unknown view {}", view)))
    }

    /// Statistics of the shared chunk cache.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache
            .lock()
            .map(|cache| cache.stats())
            .unwrap_or_default()
    }

    /// Current registration of a view.
    pub fn transform(&self, view: ViewId) -> Result<Affine3<f64>> {
        Ok(self.source(view)?.transform)
    }
}

impl SourceCatalog for ZarrViewCatalog {
    type Block = ChunkRef;

    fn view_ids(&self) -> Vec<ViewId> {
        self.views.keys().copied().collect()
    }

    fn transformed_bounding_box(&self, view: ViewId) -> Result<BoundingBox> {
        let source = self.source(view)?;
        let (lo, hi) = transformed_bounds(&source.transform, [0.0; 3], source.max_index());
        BoundingBox::new(lo.map(|v| v as i64), hi.map(|v| v as i64))
    }

    fn find_overlapping_blocks(&self, view: ViewId, region: &BoundingBox) -> Result<Vec<ChunkRef>> {
        let source = self.source(view)?;
        let (lo, hi) = transformed_bounds(
            &source.inverse,
            region.min().map(|v| v as f64),
            region.max().map(|v| v as f64),
        );

        // One voxel of slack for nearest-neighbour rounding
        let max_index = source.max_index();
        let mut first = [0u64; 3];
        let mut last = [0u64; 3];
        for d in 0..3 {
            let lo_d = lo[d] - 1.0;
            let hi_d = hi[d] + 1.0;
            if hi_d < 0.0 || lo_d > max_index[d] {
                return Ok(Vec::new());
            }
            first[d] = lo_d.max(0.0) as u64 / source.chunk_shape[d];
            last[d] = hi_d.min(max_index[d]) as u64 / source.chunk_shape[d];
        }

        let mut blocks = Vec::new();
        for cz in first[2]..=last[2] {
            for cy in first[1]..=last[1] {
                for cx in first[0]..=last[0] {
                    blocks.push(ChunkRef::new(source, Arc::clone(&self.cache), [cx, cy, cz]));
                }
            }
        }
        Ok(blocks)
    }

    fn preconcatenate_transform(&mut self, view: ViewId, transform: &Affine3<f64>) -> Result<()> {
        let source = self
            .views
            .get_mut(&view)
            .ok_or_else(|| FusionError::catalog(format!("unknown view {}", view)))?;
        let combined = transform * source.transform;
        source.inverse = invert(view, &combined)?;
        source.transform = combined;
        Ok(())
    }

    fn average_anisotropy_factor(&self, views: &[ViewId]) -> Result<f64> {
        if views.is_empty() {
            return Err(FusionError::catalog(
                "cannot estimate anisotropy without views",
            ));
        }
        let mut sum = 0.0;
        for &view in views {
            let size = self.source(view)?.voxel_size;
            sum += size[2] / size[0];
        }
        Ok(sum / views.len() as f64)
    }

    fn bounding_box(&self, name: Option<&str>, views: &[ViewId]) -> Result<BoundingBox> {
        if let Some(name) = name {
            let named = self
                .bounding_boxes
                .iter()
                .find(|b| b.name == name)
                .ok_or_else(|| FusionError::catalog(format!("unknown bounding box '{}'", name)))?;
            return BoundingBox::new(named.min, named.max);
        }

        let mut union: Option<BoundingBox> = None;
        for &view in views {
            let bbox = self.transformed_bounding_box(view)?;
            union = Some(match union {
                Some(u) => u.union(&bbox),
                None => bbox,
            });
        }
        union.ok_or_else(|| FusionError::catalog("no views to derive a bounding box from"))
    }
}

/// One native chunk of a source view.
pub struct ChunkRef {
    array: Arc<Array<FilesystemStore>>,
    cache: Arc<Mutex<ChunkCache>>,
    path_hash: u64,
    chunk: [u64; 3],
    origin: [u64; 3],
    shape: [u64; 3],
}

impl ChunkRef {
    fn new(source: &SourceView, cache: Arc<Mutex<ChunkCache>>, chunk: [u64; 3]) -> Self {
        let mut origin = [0u64; 3];
        let mut shape = [0u64; 3];
        for d in 0..3 {
            origin[d] = chunk[d] * source.chunk_shape[d];
            // Partial at the array edge
            shape[d] = source.chunk_shape[d].min(source.dimensions[d] - origin[d]);
        }
        Self {
            array: Arc::clone(&source.array),
            cache,
            path_hash: source.path_hash,
            chunk,
            origin,
            shape,
        }
    }

    /// Chunk index `[x, y, z]`.
    pub fn chunk(&self) -> [u64; 3] {
        self.chunk
    }

    /// First voxel of the chunk.
    pub fn origin(&self) -> [u64; 3] {
        self.origin
    }

    /// Voxels covered, clipped at the array edge.
    pub fn shape(&self) -> [u64; 3] {
        self.shape
    }

    fn read(&self) -> Result<Vec<f32>> {
        let subset =
            ArraySubset::new_with_start_shape(to_storage_order(self.origin), to_storage_order(self.shape))
                .map_err(|e| FusionError::zarr(e.to_string()))?;
        let read_err = |e: zarrs::array::ArrayError| FusionError::zarr(e.to_string());

        let data = match self.array.data_type() {
            DataType::UInt8 => self
                .array
                .retrieve_array_subset_elements::<u8>(&subset)
                .map_err(read_err)?
                .into_iter()
                .map(f32::from)
                .collect(),
            DataType::UInt16 => self
                .array
                .retrieve_array_subset_elements::<u16>(&subset)
                .map_err(read_err)?
                .into_iter()
                .map(f32::from)
                .collect(),
            DataType::Float32 => self
                .array
                .retrieve_array_subset_elements::<f32>(&subset)
                .map_err(read_err)?,
            other => {
                return Err(FusionError::catalog(format!(
                    "unsupported source data type {:?}",
                    other
                )))
            }
        };
        Ok(data)
    }
}

impl PrefetchBlock for ChunkRef {
    type Loaded = Arc<Vec<f32>>;

    fn load(&self) -> Result<Arc<Vec<f32>>> {
        let key = (self.path_hash, self.chunk);
        {
            let mut cache = self
                .cache
                .lock()
                .map_err(|_| FusionError::storage("chunk cache lock poisoned"))?;
            if let Some(data) = cache.get(&key) {
                return Ok(data);
            }
        }

        // Cache miss, read outside the lock
        let data = Arc::new(self.read()?);
        debug!(chunk = ?self.chunk, voxels = data.len(), "Loaded source chunk");

        let mut cache = self
            .cache
            .lock()
            .map_err(|_| FusionError::storage("chunk cache lock poisoned"))?;
        cache.insert(key, Arc::clone(&data));
        Ok(data)
    }
}

impl std::fmt::Debug for ChunkRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkRef")
            .field("chunk", &self.chunk)
            .field("origin", &self.origin)
            .field("shape", &self.shape)
            .finish()
    }
}

/// Re-creates a [`ZarrViewCatalog`] from its description inside each task.
#[derive(Debug, Clone)]
pub struct ZarrViewCatalogLoader {
    description: CatalogDescription,
}

impl ZarrViewCatalogLoader {
    pub fn new(description: CatalogDescription) -> Self {
        Self { description }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        Ok(Self::new(CatalogDescription::from_file(path)?))
    }

    pub fn description(&self) -> &CatalogDescription {
        &self.description
    }
}

impl CatalogLoader for ZarrViewCatalogLoader {
    type Catalog = ZarrViewCatalog;

    fn load(&self) -> Result<ZarrViewCatalog> {
        ZarrViewCatalog::open(&self.description)
    }
}
