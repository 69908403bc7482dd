//! Paged storage for pagetree.
//!
//! Everything above this layer sees fixed-size pages addressed by [`PageId`]:
//!
//! - **Page**: a fixed-size block of bytes, shared as a [`PageRef`]
//! - **ResourceManager**: creates, reads, writes and removes pages
//! - **FileResourceManager**: keeps pages in one file behind an id -> offset directory
//! - **Caches**: LRU and identity-preserving decorators over any manager
//!
//! No layer here writes pages implicitly. Callers own durability: a mutated
//! page must go through `write_page` before it can be evicted.

pub mod buffer;
pub mod config;
pub mod disk;
pub mod error;
pub mod page;
pub mod resource;

pub use buffer::{CacheStats, LruCachedResourceManager, ReferenceCachedResourceManager};
pub use config::{CacheMode, ResourceManagerBuilder, StorageConfig, TreeConfig};
pub use disk::FileResourceManager;
pub use error::{StorageError, StorageResult};
pub use page::{Page, PageId, PageRef};
pub use resource::ResourceManager;
