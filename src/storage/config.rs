//! Storage and tree configuration values.
//!
//! Everything a resource manager or tree needs is passed in explicitly; there
//! is no process-wide configuration.

use crate::storage::buffer::{LruCachedResourceManager, ReferenceCachedResourceManager};
use crate::storage::disk::FileResourceManager;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::resource::ResourceManager;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// Smallest page size a resource manager accepts.
pub const MIN_PAGE_SIZE: usize = 64;

pub const DEFAULT_PAGE_SIZE: usize = 4096;

pub const DEFAULT_CACHE_CAPACITY: usize = 100;

/// Which cache, if any, sits in front of the file manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheMode {
    Disabled,
    /// Recency-bounded cache, no identity guarantee after eviction.
    Lru { capacity: usize },
    /// Identity-preserving cache with `capacity` strongly held pages.
    Reference { capacity: usize },
}

impl Default for CacheMode {
    fn default() -> Self {
        CacheMode::Lru {
            capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Size of every page in the file, in bytes.
    pub page_size: usize,
    pub cache: CacheMode,
    /// Take an advisory exclusive lock on the file while it is open.
    pub use_lock: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            page_size: DEFAULT_PAGE_SIZE,
            cache: CacheMode::default(),
            use_lock: true,
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> StorageResult<()> {
        if self.page_size < MIN_PAGE_SIZE {
            return Err(StorageError::InvalidConfig(format!(
                "page size {} is below the minimum of {}",
                self.page_size, MIN_PAGE_SIZE
            )));
        }
        Ok(())
    }
}

/// Minimum fan-out the tree must be able to fit on a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeConfig {
    /// Entries a leaf page must be able to hold.
    pub min_leaf_entries: usize,
    /// Separator keys an inner page must be able to hold.
    pub min_inner_keys: usize,
}

impl Default for TreeConfig {
    fn default() -> Self {
        TreeConfig {
            min_leaf_entries: 4,
            min_inner_keys: 4,
        }
    }
}

impl TreeConfig {
    pub fn validate(&self) -> StorageResult<()> {
        if self.min_leaf_entries < 2 || self.min_inner_keys < 2 {
            return Err(StorageError::InvalidConfig(format!(
                "node minimums must be at least 2 (leaf {}, inner {})",
                self.min_leaf_entries, self.min_inner_keys
            )));
        }
        Ok(())
    }
}

/// Assembles a file manager and its cache into one shared handle.
///
/// ```no_run
/// use pagetree::storage::config::{CacheMode, ResourceManagerBuilder};
///
/// let manager = ResourceManagerBuilder::new("index.db")
///     .page_size(1024)
///     .cache(CacheMode::Reference { capacity: 64 })
///     .open()
///     .unwrap();
/// assert!(manager.is_open());
/// ```
#[derive(Debug, Clone)]
pub struct ResourceManagerBuilder {
    path: PathBuf,
    config: StorageConfig,
}

impl ResourceManagerBuilder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            config: StorageConfig::default(),
        }
    }

    pub fn with_config(path: impl Into<PathBuf>, config: StorageConfig) -> Self {
        Self {
            path: path.into(),
            config,
        }
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.config.page_size = page_size;
        self
    }

    pub fn cache(mut self, cache: CacheMode) -> Self {
        self.config.cache = cache;
        self
    }

    pub fn use_lock(mut self, use_lock: bool) -> Self {
        self.config.use_lock = use_lock;
        self
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Build the manager without opening it.
    pub fn build(self) -> StorageResult<Arc<dyn ResourceManager>> {
        self.config.validate()?;
        let file = FileResourceManager::new(self.path, self.config.page_size, self.config.use_lock)?;

        let manager: Arc<dyn ResourceManager> = match self.config.cache {
            CacheMode::Disabled => Arc::new(file),
            CacheMode::Lru { capacity } => Arc::new(LruCachedResourceManager::new(file, capacity)),
            CacheMode::Reference { capacity } => {
                Arc::new(ReferenceCachedResourceManager::new(file, capacity))
            }
        };
        Ok(manager)
    }

    /// Build the manager and open it.
    pub fn open(self) -> StorageResult<Arc<dyn ResourceManager>> {
        let manager = self.build()?;
        manager.open()?;
        Ok(manager)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = StorageConfig::default();
        assert_eq!(config.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(
            config.cache,
            CacheMode::Lru {
                capacity: DEFAULT_CACHE_CAPACITY
            }
        );
        assert!(config.use_lock);
        assert!(config.validate().is_ok());
        assert!(TreeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let config = StorageConfig {
            page_size: MIN_PAGE_SIZE - 1,
            ..StorageConfig::default()
        };
        assert!(matches!(config.validate(), Err(StorageError::InvalidConfig(_))));

        let tree = TreeConfig {
            min_leaf_entries: 1,
            min_inner_keys: 4,
        };
        assert!(matches!(tree.validate(), Err(StorageError::InvalidConfig(_))));
    }

    #[test]
    fn test_builder_opens_every_cache_mode() -> Result<()> {
        let dir = tempdir()?;

        let modes = [
            CacheMode::Disabled,
            CacheMode::Lru { capacity: 8 },
            CacheMode::Reference { capacity: 8 },
        ];
        for (i, mode) in modes.into_iter().enumerate() {
            let manager = ResourceManagerBuilder::new(dir.path().join(format!("test{}.db", i)))
                .page_size(256)
                .cache(mode)
                .open()?;
            assert!(manager.is_open());
            assert_eq!(manager.page_size(), 256);

            let page = manager.create_page()?;
            manager.write_page(&page)?;
            assert_eq!(manager.num_pages()?, 2);
            manager.close()?;
        }

        Ok(())
    }

    #[test]
    fn test_builder_rejects_small_pages() {
        let result = ResourceManagerBuilder::new("unused.db").page_size(16).build();
        assert!(matches!(result, Err(StorageError::InvalidConfig(_))));
    }
}
