//! On-disk header and page directory.
//!
//! ```text
//! header page (offset 0)
//! ┌────────┬────────┬──────────────────────────────────────────────┐
//! │ Offset │ Length │ Description                                  │
//! ├────────┼────────┼──────────────────────────────────────────────┤
//! │   0    │   4    │ MAGIC "PGTR"                                 │
//! │   4    │   4    │ PAGE_SIZE (u32)                              │
//! │   8    │   4    │ PAGE_COUNT (u32), header page included       │
//! │  12    │   4    │ NEXT_ID (u32), page id generator             │
//! │  16    │   4    │ FREE_COUNT (u32), reusable offsets           │
//! │  20    │   8    │ NEXT_LINK (u64), first continuation page     │
//! │  28    │   ..   │ stream: PAGE_COUNT × [id u32][offset u64]    │
//! │        │        │         FREE_COUNT × [offset u64]            │
//! └────────┴────────┴──────────────────────────────────────────────┘
//!
//! continuation page
//! ┌────────┬────────┬──────────────────────────────────────────────┐
//! │   0    │   8    │ NEXT_LINK (u64), 0 terminates the chain      │
//! │   8    │   ..   │ stream, continued                            │
//! └────────┴────────┴──────────────────────────────────────────────┘
//! ```
//!
//! All integers are little-endian. Continuation pages are not part of the
//! directory; once allocated they stay linked for the lifetime of the file.

use crate::storage::disk::{read_block, write_block};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::PageId;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::BTreeMap;
use std::io::{Cursor, Read, Seek, Write};

const MAGIC: &[u8; 4] = b"PGTR";
pub(crate) const HEADER_FIELDS_SIZE: usize = 28;
const CONTINUATION_FIELDS_SIZE: usize = 8;
const DIRECTORY_ENTRY_SIZE: usize = 12;
const FREE_ENTRY_SIZE: usize = 8;

#[derive(Debug)]
pub struct ResourceHeader {
    page_size: usize,
    directory: BTreeMap<PageId, u64>,
    free_offsets: Vec<u64>,
    continuation: Vec<u64>,
    next_id: u32,
    end_offset: u64,
    dirty: bool,
}

impl ResourceHeader {
    /// Fresh header whose directory holds only the header page itself.
    pub fn initialize(page_size: usize) -> Self {
        let mut directory = BTreeMap::new();
        directory.insert(PageId::HEADER, 0);

        Self {
            page_size,
            directory,
            free_offsets: Vec::new(),
            continuation: Vec::new(),
            next_id: 1,
            end_offset: page_size as u64,
            dirty: true,
        }
    }

    pub fn load<F: Read + Seek>(file: &mut F, page_size: usize, file_len: u64) -> StorageResult<Self> {
        let mut buf = vec![0u8; page_size];
        read_block(file, 0, &mut buf)?;

        let mut cursor = Cursor::new(&buf[..HEADER_FIELDS_SIZE]);
        let mut magic = [0u8; 4];
        cursor.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(StorageError::corruption("resource header has an unknown magic"));
        }

        let stored_page_size = cursor.read_u32::<LittleEndian>()? as usize;
        if stored_page_size != page_size {
            return Err(StorageError::WrongPageSize {
                expected: page_size,
                actual: stored_page_size,
            });
        }

        let page_count = cursor.read_u32::<LittleEndian>()? as usize;
        let next_id = cursor.read_u32::<LittleEndian>()?;
        let free_count = cursor.read_u32::<LittleEndian>()? as usize;
        let mut link = cursor.read_u64::<LittleEndian>()?;

        let stream_len = page_count * DIRECTORY_ENTRY_SIZE + free_count * FREE_ENTRY_SIZE;
        let mut stream = buf[HEADER_FIELDS_SIZE..].to_vec();
        let mut continuation = Vec::new();

        // A chain longer than the file has pages can only be a cycle.
        let max_links = (file_len / page_size as u64) as usize + 1;
        while link != 0 {
            if continuation.len() >= max_links || link % page_size as u64 != 0 {
                return Err(StorageError::corruption("header continuation chain is malformed"));
            }
            read_block(file, link, &mut buf)?;
            continuation.push(link);
            link = u64::from_le_bytes(buf[..CONTINUATION_FIELDS_SIZE].try_into().map_err(|_| {
                StorageError::corruption("short header continuation page")
            })?);
            stream.extend_from_slice(&buf[CONTINUATION_FIELDS_SIZE..]);
        }

        if stream.len() < stream_len {
            return Err(StorageError::corruption(format!(
                "header directory truncated: need {} bytes, found {}",
                stream_len,
                stream.len()
            )));
        }

        let mut cursor = Cursor::new(&stream[..stream_len]);
        let mut directory = BTreeMap::new();
        for _ in 0..page_count {
            let id = PageId(cursor.read_u32::<LittleEndian>()?);
            let offset = cursor.read_u64::<LittleEndian>()?;
            if directory.insert(id, offset).is_some() {
                return Err(StorageError::DuplicatePageId(id));
            }
        }
        let mut free_offsets = Vec::with_capacity(free_count);
        for _ in 0..free_count {
            free_offsets.push(cursor.read_u64::<LittleEndian>()?);
        }

        if directory.get(&PageId::HEADER) != Some(&0) {
            return Err(StorageError::corruption("directory does not contain the header page"));
        }

        let page_len = page_size as u64;
        let rounded_len = file_len.div_ceil(page_len) * page_len;
        let end_offset = directory
            .values()
            .chain(free_offsets.iter())
            .chain(continuation.iter())
            .map(|offset| offset + page_len)
            .fold(rounded_len.max(page_len), u64::max);

        Ok(Self {
            page_size,
            directory,
            free_offsets,
            continuation,
            next_id,
            end_offset,
            dirty: false,
        })
    }

    pub fn write<F: Write + Seek>(&mut self, file: &mut F) -> StorageResult<()> {
        let mut stream = Vec::with_capacity(
            self.directory.len() * DIRECTORY_ENTRY_SIZE + self.free_offsets.len() * FREE_ENTRY_SIZE,
        );
        for (id, offset) in &self.directory {
            stream.write_u32::<LittleEndian>(id.0)?;
            stream.write_u64::<LittleEndian>(*offset)?;
        }
        for offset in &self.free_offsets {
            stream.write_u64::<LittleEndian>(*offset)?;
        }

        let first_cap = self.page_size - HEADER_FIELDS_SIZE;
        let cont_cap = self.page_size - CONTINUATION_FIELDS_SIZE;
        let needed = stream.len().saturating_sub(first_cap).div_ceil(cont_cap);
        while self.continuation.len() < needed {
            self.continuation.push(self.end_offset);
            self.end_offset += self.page_size as u64;
        }

        let (first, mut rest) = stream.split_at(stream.len().min(first_cap));

        let mut page = Vec::with_capacity(self.page_size);
        page.write_all(MAGIC)?;
        page.write_u32::<LittleEndian>(self.page_size as u32)?;
        page.write_u32::<LittleEndian>(self.directory.len() as u32)?;
        page.write_u32::<LittleEndian>(self.next_id)?;
        page.write_u32::<LittleEndian>(self.free_offsets.len() as u32)?;
        page.write_u64::<LittleEndian>(self.continuation.first().copied().unwrap_or(0))?;
        page.extend_from_slice(first);
        page.resize(self.page_size, 0);
        write_block(file, 0, &page)?;

        for (i, &offset) in self.continuation.iter().enumerate() {
            let take = rest.len().min(cont_cap);
            let (chunk, tail) = rest.split_at(take);
            rest = tail;

            page.clear();
            page.write_u64::<LittleEndian>(self.continuation.get(i + 1).copied().unwrap_or(0))?;
            page.extend_from_slice(chunk);
            page.resize(self.page_size, 0);
            write_block(file, offset, &page)?;
        }

        self.dirty = false;
        Ok(())
    }

    pub fn contains(&self, id: PageId) -> bool {
        self.directory.contains_key(&id)
    }

    pub fn offset_of(&self, id: PageId) -> Option<u64> {
        self.directory.get(&id).copied()
    }

    pub fn num_pages(&self) -> usize {
        self.directory.len()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn free_slots(&self) -> usize {
        self.free_offsets.len()
    }

    /// Register a new page id, reusing a freed offset when one is available.
    pub fn allocate(&mut self) -> StorageResult<(PageId, u64)> {
        let id = PageId(self.next_id);
        if self.directory.contains_key(&id) {
            return Err(StorageError::DuplicatePageId(id));
        }
        self.next_id = self
            .next_id
            .checked_add(1)
            .ok_or_else(|| StorageError::InvalidState("page id space exhausted".to_string()))?;

        let offset = match self.free_offsets.pop() {
            Some(offset) => offset,
            None => {
                let offset = self.end_offset;
                self.end_offset += self.page_size as u64;
                offset
            }
        };

        self.directory.insert(id, offset);
        self.dirty = true;
        Ok((id, offset))
    }

    /// Drop `id` from the directory and return its offset to the free list.
    pub fn release(&mut self, id: PageId) -> StorageResult<u64> {
        if id == PageId::HEADER {
            return Err(StorageError::ReservedPage(id));
        }
        let offset = self
            .directory
            .remove(&id)
            .ok_or(StorageError::PageNotFound(id))?;
        self.free_offsets.push(offset);
        self.dirty = true;
        Ok(offset)
    }
}
