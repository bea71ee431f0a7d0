//! Writer handle lifetimes per dataset and backend.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use super::writer::ContainerWriter;
use super::StorageBackend;
use crate::error::{FusionError, Result};
use crate::types::DatasetSpec;

/// Identifies the writer for one dataset on one backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WriterKey {
    pub container: PathBuf,
    pub dataset: String,
    pub backend: StorageBackend,
}

impl WriterKey {
    pub fn for_spec(spec: &DatasetSpec) -> Self {
        Self {
            container: spec.container.clone(),
            dataset: spec.dataset.clone(),
            backend: spec.backend,
        }
    }
}

impl std::fmt::Display for WriterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} ({})",
            self.container.display(),
            self.dataset,
            self.backend
        )
    }
}

/// Hands out writer handles and owns the singletons of backends that
/// forbid concurrent writers.
///
/// The registry is passed explicitly to every task of a process. For
/// [`StorageBackend::Zarr`] each `acquire` opens a fresh handle owned by the
/// caller. For [`StorageBackend::ZarrSharded`] the first `acquire` opens
/// the handle and every later call returns the same instance until the
/// driver calls [`WriterRegistry::close`].
#[derive(Default)]
pub struct WriterRegistry {
    singletons: Mutex<HashMap<WriterKey, Arc<ContainerWriter>>>,
}

impl WriterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<WriterKey, Arc<ContainerWriter>>>> {
        self.singletons
            .lock()
            .map_err(|_| FusionError::storage("writer registry lock poisoned"))
    }

    /// Get a writer for the dataset described by `spec`.
    pub fn acquire(&self, spec: &DatasetSpec) -> Result<Arc<ContainerWriter>> {
        if spec.backend.supports_concurrent_writers() {
            return Ok(Arc::new(ContainerWriter::open(spec)?));
        }

        let key = WriterKey::for_spec(spec);
        // Held while opening so exactly one instance is created
        let mut singletons = self.lock()?;
        if let Some(writer) = singletons.get(&key) {
            return Ok(Arc::clone(writer));
        }

        let writer = Arc::new(ContainerWriter::open(spec)?);
        info!(writer = %key, "Opened shared writer");
        singletons.insert(key, Arc::clone(&writer));
        Ok(writer)
    }

    /// Return a writer at the end of a task. Task-owned handles are
    /// closed here; for a shared singleton this is a no-op.
    pub fn release(&self, writer: Arc<ContainerWriter>) {
        if writer.is_shared() {
            return;
        }
        debug!(writer = %writer.key(), "Closed task writer");
        drop(writer);
    }

    /// Close the singleton for `key`, if one is open.
    ///
    /// Called by the driver once every task writing that dataset has
    /// finished. Returns whether a handle was closed.
    pub fn close(&self, key: &WriterKey) -> Result<bool> {
        let removed = self.lock()?.remove(key);
        match removed {
            Some(writer) => {
                let outstanding = Arc::strong_count(&writer) - 1;
                if outstanding > 0 {
                    warn!(
                        writer = %key,
                        outstanding = outstanding,
                        "Closing shared writer while tasks still hold it"
                    );
                }
                info!(writer = %key, "Closed shared writer");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Close every open singleton. Returns how many were closed.
    pub fn close_all(&self) -> Result<usize> {
        let keys: Vec<WriterKey> = self.lock()?.keys().cloned().collect();
        let mut closed = 0;
        for key in &keys {
            if self.close(key)? {
                closed += 1;
            }
        }
        Ok(closed)
    }

    /// Number of singleton handles currently open.
    pub fn open_singletons(&self) -> usize {
        self.singletons.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContainerConfig;
    use crate::container::create_dataset;
    use crate::convert::OutputDataType;

    fn spec(dir: &std::path::Path, backend: StorageBackend) -> DatasetSpec {
        DatasetSpec {
            container: dir.join("out.zarr"),
            dataset: "/s0".to_string(),
            backend,
            dimensions: [16, 16, 16],
            block_size: [8, 8, 8],
            data_type: OutputDataType::Float32,
            intensity: None,
            downsampling_factors: [1, 1, 1],
        }
    }

    #[test]
    fn test_sharded_backend_shares_one_handle() {
        let dir = tempfile::tempdir().unwrap();
        let spec = spec(dir.path(), StorageBackend::ZarrSharded);
        create_dataset(&spec, &ContainerConfig::default(), [0, 0, 0]).unwrap();

        let registry = WriterRegistry::new();
        let a = registry.acquire(&spec).unwrap();
        let b = registry.acquire(&spec).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.open_singletons(), 1);

        registry.release(a);
        registry.release(b);
        assert_eq!(registry.open_singletons(), 1);

        assert!(registry.close(&WriterKey::for_spec(&spec)).unwrap());
        assert_eq!(registry.open_singletons(), 0);
        assert!(!registry.close(&WriterKey::for_spec(&spec)).unwrap());
    }

    #[test]
    fn test_concurrent_backend_gives_fresh_handles() {
        let dir = tempfile::tempdir().unwrap();
        let spec = spec(dir.path(), StorageBackend::Zarr);
        create_dataset(&spec, &ContainerConfig::default(), [0, 0, 0]).unwrap();

        let registry = WriterRegistry::new();
        let a = registry.acquire(&spec).unwrap();
        let b = registry.acquire(&spec).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(registry.open_singletons(), 0);
    }

    #[test]
    fn test_acquire_missing_dataset_fails() {
        let dir = tempfile::tempdir().unwrap();
        let registry = WriterRegistry::new();
        let err = registry
            .acquire(&spec(dir.path(), StorageBackend::ZarrSharded))
            .unwrap_err();
        assert!(matches!(err, FusionError::StorageOpen(_)));
        assert_eq!(registry.open_singletons(), 0);
    }

    #[test]
    fn test_close_all() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = spec(dir.path(), StorageBackend::ZarrSharded);
        let mut second = first.clone();
        first.dataset = "/a/s0".to_string();
        second.dataset = "/b/s0".to_string();
        for s in [&first, &second] {
            create_dataset(s, &ContainerConfig::default(), [0, 0, 0]).unwrap();
        }

        let registry = WriterRegistry::new();
        registry.acquire(&first).unwrap();
        registry.acquire(&second).unwrap();
        assert_eq!(registry.close_all().unwrap(), 2);
        assert_eq!(registry.open_singletons(), 0);
    }
}
