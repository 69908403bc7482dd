//! File-backed resource management.

pub mod file_manager;
pub mod header;

pub use file_manager::FileResourceManager;
pub use header::ResourceHeader;

use std::io::{self, Read, Seek, SeekFrom, Write};

/// Read one block at `offset`, zero-filling whatever lies past end-of-file.
///
/// Pages are allocated logically before they are ever written, so a short
/// read is a normal outcome here rather than corruption.
pub(crate) fn read_block<F: Read + Seek>(file: &mut F, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
    file.seek(SeekFrom::Start(offset))?;
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    buf[filled..].fill(0);
    Ok(filled)
}

pub(crate) fn write_block<F: Write + Seek>(file: &mut F, offset: u64, data: &[u8]) -> io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)
}
