use crate::storage::error::StorageResult;
use crate::storage::page::{PageId, PageRef};

/// Maps logical page ids onto a backing store.
///
/// Implementations use interior mutability so a single manager can be shared
/// as `Arc<dyn ResourceManager>` between the tree and its nodes. There is no
/// intra-process locking of page contents: one logical writer per open
/// resource is assumed.
pub trait ResourceManager: Send + Sync {
    /// Open the resource. Fails with `AlreadyOpen` if it is open already.
    fn open(&self) -> StorageResult<()>;

    /// Close the resource. Idempotent; cleanup failures are logged, not returned.
    fn close(&self) -> StorageResult<()>;

    fn is_open(&self) -> bool;

    fn page_size(&self) -> usize;

    /// Number of live pages, including the header page.
    fn num_pages(&self) -> StorageResult<usize>;

    fn has_page(&self, id: PageId) -> StorageResult<bool>;

    /// Allocate a fresh, zeroed page. Nothing reaches the disk until the page
    /// is written with [`ResourceManager::write_page`].
    fn create_page(&self) -> StorageResult<PageRef>;

    fn get_page(&self, id: PageId) -> StorageResult<PageRef>;

    /// Write the full page buffer at its recorded offset.
    ///
    /// The caller must not hold a write guard on `page` while calling this.
    fn write_page(&self, page: &PageRef) -> StorageResult<()>;

    fn remove_page(&self, id: PageId) -> StorageResult<()>;

    /// Persist the header/directory and flush the file to stable storage.
    fn sync(&self) -> StorageResult<()>;

    /// Drop every page except the header.
    fn clear(&self) -> StorageResult<()>;
}
