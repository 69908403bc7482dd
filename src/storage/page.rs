use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Logical page identifier handed out by a resource manager.
///
/// Id 0 always names the file header page, so it doubles as the "no page"
/// marker inside node headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageId(pub u32);

impl PageId {
    pub const HEADER: PageId = PageId(0);

    /// Decode an on-page id where 0 means "none".
    pub fn from_raw(raw: u32) -> Option<PageId> {
        if raw == 0 { None } else { Some(PageId(raw)) }
    }

    pub fn to_raw(id: Option<PageId>) -> u32 {
        id.map(|p| p.0).unwrap_or(0)
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A fixed-size binary block identified by a page id.
///
/// The buffer length is fixed at construction and always equals the page size
/// of the manager that produced it.
pub struct Page {
    id: PageId,
    data: Box<[u8]>,
}

/// Shared handle to a page. Caches hand out clones of the same handle, which
/// is what makes identity observable through [`Arc::ptr_eq`].
pub type PageRef = Arc<RwLock<Page>>;

impl Page {
    pub fn new(id: PageId, page_size: usize) -> Self {
        Self {
            id,
            data: vec![0u8; page_size].into_boxed_slice(),
        }
    }

    pub fn from_data(id: PageId, data: Vec<u8>) -> Self {
        Self {
            id,
            data: data.into_boxed_slice(),
        }
    }

    pub fn into_ref(self) -> PageRef {
        Arc::new(RwLock::new(self))
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("id", &self.id)
            .field("len", &self.data.len())
            .finish()
    }
}
