//! Allocation record directory and handle cache.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::core::allocation::Allocation;
use crate::core::target::TargetRegistry;
use crate::core::{AllocResult, AllocatorError};
use crate::infra::cache::AgedLruCache;
use crate::infra::fsdb::Fsdb;
use crate::util::ids::{generate_alloc_id, is_valid_alloc_id};

const CREATE_ATTEMPTS: usize = 32;

/// Owns the allocations root directory.
///
/// Handles are cached; the cache only saves re-reading the group layout,
/// every other field is always read from disk.
pub struct AllocationStore {
    root: PathBuf,
    registry: Arc<TargetRegistry>,
    cache: AgedLruCache<String, Arc<Allocation>>,
    lock_timeout: Duration,
    lock_wait: Duration,
}

impl AllocationStore {
    /// Open (creating if needed) the allocations root.
    pub fn open(
        root: impl AsRef<Path>,
        registry: Arc<TargetRegistry>,
        cache_ttl: Duration,
        cache_max_entries: usize,
        lock_timeout: Duration,
        lock_wait: Duration,
    ) -> AllocResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            registry,
            cache: AgedLruCache::new(cache_ttl, cache_max_entries),
            lock_timeout,
            lock_wait,
        })
    }

    /// Allocations root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Registered targets.
    #[must_use]
    pub fn registry(&self) -> &Arc<TargetRegistry> {
        &self.registry
    }

    /// True if a record named `alloc_id` exists.
    #[must_use]
    pub fn exists(&self, alloc_id: &str) -> bool {
        is_valid_alloc_id(alloc_id) && self.root.join(alloc_id).is_dir()
    }

    /// Handle for `alloc_id`, or [`AllocatorError::Invalid`].
    pub fn get(&self, alloc_id: &str) -> AllocResult<Arc<Allocation>> {
        let key = alloc_id.to_owned();
        if !self.exists(alloc_id) {
            self.cache.invalidate(&key);
            return Err(AllocatorError::Invalid(format!("{alloc_id}: unknown allocation")));
        }
        if let Some(allocation) = self.cache.get(&key) {
            return Ok(allocation);
        }
        let allocation = Arc::new(Allocation::open(
            &self.root.join(alloc_id),
            alloc_id,
            &self.registry,
            self.lock_timeout,
            self.lock_wait,
        )?);
        // a record without a state is still being written; its groups may
        // be incomplete
        if allocation.state()?.is_some() {
            self.cache.insert(key, Arc::clone(&allocation));
        }
        Ok(allocation)
    }

    /// Create an empty record under a fresh id.
    pub(crate) fn create(&self) -> AllocResult<(String, Fsdb)> {
        for _ in 0..CREATE_ATTEMPTS {
            let alloc_id = generate_alloc_id();
            let dir = self.root.join(&alloc_id);
            match fs::create_dir(&dir) {
                Ok(()) => return Ok((alloc_id, Fsdb::attach(&dir)?)),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
                Err(err) => return Err(err.into()),
            }
        }
        Err(AllocatorError::Io(std::io::Error::other(
            "could not find a free allocation id",
        )))
    }

    /// Ids of every record, sorted.
    pub fn ids(&self) -> AllocResult<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if is_valid_alloc_id(&name) && entry.file_type()?.is_dir() {
                ids.push(name);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Remove a record; already missing is fine.
    pub(crate) fn wipe(&self, alloc_id: &str) -> AllocResult<()> {
        self.cache.invalidate(&alloc_id.to_owned());
        if !is_valid_alloc_id(alloc_id) {
            return Ok(());
        }
        match fs::remove_dir_all(self.root.join(alloc_id)) {
            Err(err) if err.kind() != ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }
}
