use crate::storage::config::MIN_PAGE_SIZE;
use crate::storage::disk::header::ResourceHeader;
use crate::storage::disk::{read_block, write_block};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{Page, PageId, PageRef};
use crate::storage::resource::ResourceManager;
use fs2::FileExt;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// Writes pages to a single file through an id -> offset directory.
///
/// Does not cache: every `get_page` reads from disk and returns a fresh page,
/// and changes only reach the file through `write_page`.
pub struct FileResourceManager {
    path: PathBuf,
    page_size: usize,
    use_lock: bool,
    state: Mutex<Option<OpenResource>>,
}

struct OpenResource {
    file: File,
    header: ResourceHeader,
    locked: bool,
}

impl OpenResource {
    fn flush(&mut self) -> StorageResult<()> {
        if self.header.is_dirty() {
            self.header.write(&mut self.file)?;
        }
        self.file.sync_all()?;
        Ok(())
    }
}

impl FileResourceManager {
    pub fn new(path: impl Into<PathBuf>, page_size: usize, use_lock: bool) -> StorageResult<Self> {
        if page_size < MIN_PAGE_SIZE {
            return Err(StorageError::InvalidConfig(format!(
                "page size {} is below the minimum of {}",
                page_size, MIN_PAGE_SIZE
            )));
        }

        Ok(Self {
            path: path.into(),
            page_size,
            use_lock,
            state: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn describe(&self) -> String {
        format!("resource {}", self.path.display())
    }

    fn with_open<T>(&self, f: impl FnOnce(&mut OpenResource) -> StorageResult<T>) -> StorageResult<T> {
        let mut state = self.state.lock();
        let resource = state
            .as_mut()
            .ok_or_else(|| StorageError::ResourceNotOpen(self.describe()))?;
        f(resource)
    }
}

impl ResourceManager for FileResourceManager {
    fn open(&self) -> StorageResult<()> {
        let mut state = self.state.lock();
        if state.is_some() {
            return Err(StorageError::AlreadyOpen(self.describe()));
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;

        if self.use_lock {
            file.try_lock_exclusive().map_err(|e| {
                io::Error::new(
                    e.kind(),
                    format!("{} is locked by another consumer: {}", self.path.display(), e),
                )
            })?;
        }

        let file_len = file.metadata()?.len();
        let header = if file_len == 0 {
            let mut header = ResourceHeader::initialize(self.page_size);
            header.write(&mut file)?;
            header
        } else {
            ResourceHeader::load(&mut file, self.page_size, file_len)?
        };

        info!(
            "opened {} ({} pages, page size {})",
            self.path.display(),
            header.num_pages(),
            self.page_size
        );

        *state = Some(OpenResource {
            file,
            header,
            locked: self.use_lock,
        });
        Ok(())
    }

    /// Best-effort: flush and unlock failures are logged and `Ok(())` is
    /// still returned. Call `sync` first to observe a flush error.
    fn close(&self) -> StorageResult<()> {
        let mut state = self.state.lock();
        let Some(mut resource) = state.take() else {
            return Ok(());
        };

        if let Err(e) = resource.flush() {
            warn!("failed to flush {} on close: {}", self.path.display(), e);
        }
        if resource.locked {
            if let Err(e) = FileExt::unlock(&resource.file) {
                warn!("failed to release lock on {}: {}", self.path.display(), e);
            }
        }
        drop(resource);

        info!("closed {}", self.path.display());
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.lock().is_some()
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn num_pages(&self) -> StorageResult<usize> {
        self.with_open(|res| Ok(res.header.num_pages()))
    }

    fn has_page(&self, id: PageId) -> StorageResult<bool> {
        self.with_open(|res| Ok(res.header.contains(id)))
    }

    fn create_page(&self) -> StorageResult<PageRef> {
        let page_size = self.page_size;
        self.with_open(|res| {
            let (id, offset) = res.header.allocate()?;
            debug!("allocated page {} at offset {}", id, offset);
            Ok(Page::new(id, page_size).into_ref())
        })
    }

    fn get_page(&self, id: PageId) -> StorageResult<PageRef> {
        let page_size = self.page_size;
        self.with_open(|res| {
            let offset = res.header.offset_of(id).ok_or(StorageError::PageNotFound(id))?;
            let mut data = vec![0u8; page_size];
            read_block(&mut res.file, offset, &mut data)?;
            Ok(Page::from_data(id, data).into_ref())
        })
    }

    fn write_page(&self, page: &PageRef) -> StorageResult<()> {
        let page = page.read();
        if page.len() != self.page_size {
            return Err(StorageError::WrongPageSize {
                expected: self.page_size,
                actual: page.len(),
            });
        }

        self.with_open(|res| {
            let id = page.id();
            let offset = res.header.offset_of(id).ok_or(StorageError::PageNotFound(id))?;
            debug!("writing page {} to disk", id);
            write_block(&mut res.file, offset, page.data())?;
            Ok(())
        })
    }

    fn remove_page(&self, id: PageId) -> StorageResult<()> {
        let page_size = self.page_size;
        self.with_open(|res| {
            let offset = res.header.release(id)?;
            // Zero the slot so a later allocation reading it back sees an empty page.
            write_block(&mut res.file, offset, &vec![0u8; page_size])?;
            debug!("removed page {}, offset {} is free", id, offset);
            Ok(())
        })
    }

    fn sync(&self) -> StorageResult<()> {
        self.with_open(|res| res.flush())
    }

    fn clear(&self) -> StorageResult<()> {
        let page_size = self.page_size;
        self.with_open(|res| {
            res.file.set_len(0)?;
            res.header = ResourceHeader::initialize(page_size);
            res.flush()
        })
    }
}

impl Drop for FileResourceManager {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("error while closing {}: {}", self.path.display(), e);
        }
    }
}

impl std::fmt::Debug for FileResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileResourceManager")
            .field("path", &self.path)
            .field("page_size", &self.page_size)
            .field("use_lock", &self.use_lock)
            .field("open", &self.is_open())
            .finish()
    }
}
