use std::mem::size_of;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use log::warn;

use crate::core::mmap::MmapFile;
use crate::core::{Error, Result};

pub const REGION_MAGIC: u32 = 0x4652_5259; // 'FRRY'
pub const REGION_VERSION: u32 = 1;
pub const REGION_HEADER_SIZE: usize = 64;
pub const MAX_REGION_CAPACITY: usize = u32::MAX as usize - 1;

const INIT_READY: u32 = 2;

#[repr(C, align(64))]
pub struct RegionHeader {
    /// Length slot:
    /// 0 = empty / consumed
    /// >0 = published payload length + 1
    pub length: AtomicU32,
    pub checksum: AtomicU32,
    pub magic: AtomicU32,
    pub version: AtomicU32,
    pub capacity: AtomicU64,
    pub init_state: AtomicU32,
    pub _pad0: [u8; 4],
    /// Number of payloads ever written into the region.
    pub sequence: AtomicU64,
    pub _pad1: [u8; 24],
}

const _: () = assert!(size_of::<RegionHeader>() == REGION_HEADER_SIZE);

/// Fixed-capacity byte buffer with a length slot, mapped by both endpoints.
///
/// The region has no locking of its own. Every call must be made while the
/// caller holds the mutex semaphore that guards this direction.
pub struct FramedRegion {
    mmap: MmapFile,
    path: PathBuf,
    capacity: usize,
    owner: bool,
    removed: bool,
}

impl FramedRegion {
    /// Allocates a zeroed region and publishes it at `path`.
    ///
    /// The file is initialized under a temporary name and hard-linked into
    /// place, so an opener never maps a half-initialized header and an existing
    /// region is never clobbered.
    pub fn create(path: &Path, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidConfig("region capacity must be non-zero".into()));
        }
        if capacity > MAX_REGION_CAPACITY {
            return Err(Error::InvalidConfig(format!(
                "region capacity {capacity} exceeds {MAX_REGION_CAPACITY}"
            )));
        }
        let tmp_path = Self::staging_path(path);
        // A freshly sized file reads as zeros: empty slot, zero sequence.
        let mmap = MmapFile::create(&tmp_path, REGION_HEADER_SIZE + capacity)?;
        {
            let block = header_of(&mmap);
            block.init_state.store(1, Ordering::Relaxed);
            block.version.store(REGION_VERSION, Ordering::Relaxed);
            block.capacity.store(capacity as u64, Ordering::Relaxed);
            block.magic.store(REGION_MAGIC, Ordering::Relaxed);
            block.init_state.store(INIT_READY, Ordering::Release);
        }
        mmap.flush_sync()?;
        let linked = std::fs::hard_link(&tmp_path, path);
        if let Err(err) = Self::remove(&tmp_path) {
            warn!("failed to remove staging file {}: {err}", tmp_path.display());
        }
        linked.map_err(|err| Error::unavailable(path.display().to_string(), err))?;
        Ok(Self {
            mmap,
            path: path.to_path_buf(),
            capacity,
            owner: true,
            removed: false,
        })
    }

    /// Attaches to a region published by the creator. Never re-initializes it.
    pub fn open(path: &Path) -> Result<Self> {
        let mmap = MmapFile::open(path).map_err(|err| match err {
            Error::Io(io) => Error::unavailable(path.display().to_string(), io),
            other => other,
        })?;
        if mmap.len() < REGION_HEADER_SIZE {
            return Err(Error::Corrupt("region file too small"));
        }
        let block = header_of(&mmap);
        if block.init_state.load(Ordering::Acquire) != INIT_READY {
            return Err(Error::Corrupt("region not initialized"));
        }
        if block.magic.load(Ordering::Acquire) != REGION_MAGIC {
            return Err(Error::Corrupt("region magic mismatch"));
        }
        if block.version.load(Ordering::Acquire) != REGION_VERSION {
            return Err(Error::Unsupported("region version"));
        }
        let capacity = block.capacity.load(Ordering::Acquire) as usize;
        if REGION_HEADER_SIZE.checked_add(capacity) != Some(mmap.len()) {
            return Err(Error::Corrupt("region size does not match its header"));
        }
        Ok(Self {
            mmap,
            path: path.to_path_buf(),
            capacity,
            owner: false,
            removed: false,
        })
    }

    /// Publishes `payload`, replacing whatever the slot held.
    ///
    /// Oversized payloads are rejected before any byte is written.
    pub fn write(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > self.capacity {
            return Err(Error::CapacityExceeded {
                len: payload.len(),
                capacity: self.capacity,
            });
        }
        self.mmap
            .range_mut(REGION_HEADER_SIZE, payload.len())?
            .copy_from_slice(payload);
        let checksum = crc32(payload);
        let block = self.header();
        block.checksum.store(checksum, Ordering::Relaxed);
        block.sequence.fetch_add(1, Ordering::Relaxed);
        block
            .length
            .store(payload.len() as u32 + 1, Ordering::Release);
        Ok(())
    }

    /// Returns the published payload, or an empty slice when the slot is empty.
    pub fn read(&self) -> Result<&[u8]> {
        let Some(len) = self.payload_len() else {
            return Ok(&[]);
        };
        if len > self.capacity {
            return Err(Error::Corrupt("region length exceeds capacity"));
        }
        let expected = self.header().checksum.load(Ordering::Relaxed);
        let payload = self.mmap.range(REGION_HEADER_SIZE, len)?;
        if crc32(payload) != expected {
            return Err(Error::Corrupt("region checksum mismatch"));
        }
        Ok(payload)
    }

    pub fn clear(&mut self) {
        self.header().length.store(0, Ordering::Release);
    }

    pub fn is_empty(&self) -> bool {
        self.header().length.load(Ordering::Acquire) == 0
    }

    /// Length of the published payload, `None` when the slot is empty.
    pub fn payload_len(&self) -> Option<usize> {
        match self.header().length.load(Ordering::Acquire) {
            0 => None,
            commit => Some((commit - 1) as usize),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn sequence(&self) -> u64 {
        self.header().sequence.load(Ordering::Acquire)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }

    pub fn lock(&self) -> Result<()> {
        self.mmap.lock()
    }

    /// Where `create` initializes a region before publishing it at `path`.
    pub fn staging_path(path: &Path) -> PathBuf {
        path.with_extension("tmp")
    }

    /// Deletes the backing file if this handle created it, reporting failures.
    pub fn destroy(mut self) -> Result<()> {
        self.remove_backing()
    }

    /// Deletes the backing file now if this handle created it. Existing
    /// mappings, including the peer's, stay valid; new opens fail.
    pub fn unlink_file(&mut self) -> Result<()> {
        self.remove_backing()
    }

    /// Removes a region file by path. Returns `false` when nothing was there.
    pub fn remove(path: &Path) -> Result<bool> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(Error::Io(err)),
        }
    }

    fn remove_backing(&mut self) -> Result<()> {
        if !self.owner || self.removed {
            return Ok(());
        }
        self.removed = true;
        Self::remove(&self.path).map(|_| ())
    }

    fn header(&self) -> &RegionHeader {
        header_of(&self.mmap)
    }
}

impl Drop for FramedRegion {
    fn drop(&mut self) {
        if let Err(err) = self.remove_backing() {
            warn!("failed to remove region {}: {err}", self.path.display());
        }
    }
}

fn header_of(mmap: &MmapFile) -> &RegionHeader {
    // SAFETY: mappings are page aligned and at least REGION_HEADER_SIZE long;
    // every header field is an atomic, so shared access is sound.
    unsafe { &*(mmap.as_ptr() as *const RegionHeader) }
}

pub fn crc32(payload: &[u8]) -> u32 {
    use crc32fast::Hasher;
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn region_pair(capacity: usize) -> (TempDir, FramedRegion, FramedRegion) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c2w.region");
        let creator = FramedRegion::create(&path, capacity).unwrap();
        let opener = FramedRegion::open(&path).unwrap();
        (dir, creator, opener)
    }

    #[test]
    fn write_is_visible_to_opener() {
        let (_dir, mut creator, mut opener) = region_pair(64);
        assert!(opener.is_empty());
        assert_eq!(opener.read().unwrap(), b"");

        creator.write(b"step").unwrap();
        assert_eq!(opener.payload_len(), Some(4));
        assert_eq!(opener.read().unwrap(), b"step");
        assert_eq!(opener.sequence(), 1);

        opener.clear();
        assert!(creator.is_empty());
    }

    #[test]
    fn empty_payload_is_distinct_from_empty_slot() {
        let (_dir, mut creator, opener) = region_pair(8);
        creator.write(b"").unwrap();
        assert!(!opener.is_empty());
        assert_eq!(opener.payload_len(), Some(0));
    }

    #[test]
    fn oversized_write_leaves_region_untouched() {
        let (_dir, mut creator, opener) = region_pair(4);
        creator.write(b"abcd").unwrap();
        let err = creator.write(b"abcde").unwrap_err();
        assert!(matches!(
            err,
            Error::CapacityExceeded {
                len: 5,
                capacity: 4
            }
        ));
        assert_eq!(opener.read().unwrap(), b"abcd");
        assert_eq!(opener.sequence(), 1);
    }

    #[test]
    fn open_does_not_reinitialize() {
        let (dir, mut creator, _opener) = region_pair(16);
        creator.write(b"pending").unwrap();
        let second = FramedRegion::open(&dir.path().join("c2w.region")).unwrap();
        assert_eq!(second.read().unwrap(), b"pending");
    }

    #[test]
    fn create_refuses_existing_region() {
        let (dir, _creator, _opener) = region_pair(16);
        let err = FramedRegion::create(&dir.path().join("c2w.region"), 16).err();
        assert!(matches!(err, Some(Error::ResourceUnavailable { .. })));
    }

    #[test]
    fn open_missing_region_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let err = FramedRegion::open(&dir.path().join("absent.region")).err();
        assert!(matches!(err, Some(Error::ResourceUnavailable { .. })));
    }

    #[test]
    fn checksum_mismatch_is_detected() {
        let (dir, mut creator, _opener) = region_pair(16);
        creator.write(b"payload").unwrap();
        let mut raw = MmapFile::open(&dir.path().join("c2w.region")).unwrap();
        raw.range_mut(REGION_HEADER_SIZE, 1).unwrap()[0] ^= 0xFF;
        assert!(matches!(creator.read(), Err(Error::Corrupt(_))));
    }

    #[test]
    fn creator_drop_removes_backing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("w2c.region");
        let creator = FramedRegion::create(&path, 8).unwrap();
        let opener = FramedRegion::open(&path).unwrap();
        drop(opener);
        assert!(path.exists());
        creator.destroy().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn create_leaves_no_staging_file() {
        let (dir, creator, _opener) = region_pair(8);
        assert!(creator.is_empty());
        assert_eq!(creator.sequence(), 0);
        let staging = FramedRegion::staging_path(&dir.path().join("c2w.region"));
        assert!(!staging.exists());
    }

    #[test]
    fn unlinked_region_keeps_serving_mapped_peers() {
        let (dir, mut creator, opener) = region_pair(16);
        let path = dir.path().join("c2w.region");
        creator.unlink_file().unwrap();
        assert!(!path.exists());
        assert!(FramedRegion::open(&path).is_err());

        creator.write(b"late").unwrap();
        assert_eq!(opener.read().unwrap(), b"late");

        // The name can be reused right away.
        let _next = FramedRegion::create(&path, 16).unwrap();
        creator.destroy().unwrap();
        assert!(path.exists());
    }
}
