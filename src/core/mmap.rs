use std::fs::{File, OpenOptions};
use std::path::Path;

use memmap2::{MmapMut, MmapOptions};

use crate::core::{Error, Result};

/// A read-write shared mapping of a whole file.
///
/// Both endpoints map the same file with `MAP_SHARED`, so writes made by one
/// process are visible to the other once published through a semaphore.
pub struct MmapFile {
    _file: File,
    map: MmapMut,
    len: usize,
}

impl MmapFile {
    /// Creates (or truncates) `path` to `len` zero bytes and maps it.
    pub fn create(path: &Path, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::Unsupported("mmap length must be non-zero"));
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)?;
        file.set_len(len as u64)?;
        Self::map(file, len)
    }

    /// Maps an existing file at its current length.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = usize::try_from(file.metadata()?.len())
            .map_err(|_| Error::Unsupported("mapped file larger than the address space"))?;
        if len == 0 {
            return Err(Error::Corrupt("mapped file is empty"));
        }
        Self::map(file, len)
    }

    fn map(file: File, len: usize) -> Result<Self> {
        // SAFETY: the file stays open for the lifetime of the mapping; concurrent
        // modification by the peer is the point of the mapping and is mediated by
        // atomics and the direction mutex.
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        Ok(Self {
            _file: file,
            map,
            len,
        })
    }

    /// Start of the mapping. Page aligned.
    pub fn as_ptr(&self) -> *const u8 {
        self.map.as_ptr()
    }

    pub fn range(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let end = offset.checked_add(len).ok_or(Error::Corrupt("range overflow"))?;
        if end > self.len {
            return Err(Error::Corrupt("range out of bounds"));
        }
        Ok(&self.map[offset..end])
    }

    pub fn range_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8]> {
        let end = offset.checked_add(len).ok_or(Error::Corrupt("range overflow"))?;
        if end > self.len {
            return Err(Error::Corrupt("range out of bounds"));
        }
        Ok(&mut self.map[offset..end])
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn flush_sync(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }

    /// Pins the mapping in RAM so a send never takes a page fault.
    pub fn lock(&self) -> Result<()> {
        let res = unsafe { libc::mlock(self.map.as_ptr() as *const libc::c_void, self.len) };
        if res != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }
}
