//! The workspace store: a fixed-size flat arena backed by a file.
//!
//! Offsets are bump-allocated at a configured alignment and never reclaimed
//! within a session. Reads are zero-copy views into the map in mapped mode,
//! or LRU-cached copies in direct-IO mode. Writes happen only during the
//! one-time build phase; a built store is reopened read-only and shared.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;

use memmap2::{Mmap, MmapMut};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::IoMode;

use super::lru::RangeLru;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Workspace full: {needed} bytes requested, {available} remaining")]
    Full { needed: usize, available: usize },

    #[error("Range {offset}+{len} exceeds workspace size {total}")]
    BadRange {
        offset: usize,
        len: usize,
        total: usize,
    },

    #[error("Store at {0} is read-only")]
    ReadOnly(PathBuf),

    #[error("Range at {offset} is not aligned for element size {align}")]
    Misaligned { offset: usize, align: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A bump-allocated region of the arena.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceRegion {
    pub offset: usize,
    pub size: usize,
}

/// A read view over a region.
///
/// Mapped reads borrow the store; direct-IO reads hand out a shared copy that
/// stays valid even if the LRU later drops it.
pub enum WorkspaceSlice<'a> {
    Mapped(&'a [u8]),
    Cached(Arc<Vec<u8>>),
}

impl WorkspaceSlice<'_> {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            WorkspaceSlice::Mapped(b) => b,
            WorkspaceSlice::Cached(v) => v.as_slice(),
        }
    }

    /// Reinterpret as f32 values. Fails if the backing bytes are misaligned.
    pub fn try_as_f32(&self) -> Result<&[f32], StoreError> {
        bytemuck::try_cast_slice(self.as_bytes()).map_err(|_| StoreError::Misaligned {
            offset: 0,
            align: std::mem::align_of::<f32>(),
        })
    }

    /// Copy out as f32 values regardless of alignment.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        self.as_bytes()
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

enum Backing {
    MappedRw(MmapMut),
    MappedRo(Mmap),
    Direct {
        file: File,
        cache: Mutex<RangeLru>,
    },
}

/// The workspace store.
pub struct WorkspaceStore {
    path: PathBuf,
    total_size: usize,
    alignment: usize,
    writable: bool,
    backing: Backing,
    /// Bump pointer: next free offset.
    next_free: usize,
    /// offset -> (size, owner name).
    regions: BTreeMap<usize, (usize, String)>,
}

#[cfg(unix)]
fn pread(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn pread(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut read = 0;
    while read < buf.len() {
        let n = file.seek_read(&mut buf[read..], offset + read as u64)?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        read += n;
    }
    Ok(())
}

#[cfg(unix)]
fn pwrite(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn pwrite(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut written = 0;
    while written < buf.len() {
        written += file.seek_write(&buf[written..], offset + written as u64)?;
    }
    Ok(())
}

impl WorkspaceStore {
    /// Create (or truncate) a writable store of `total_size` bytes.
    pub fn create(
        path: &Path,
        total_size: usize,
        mode: IoMode,
        alignment: usize,
        ram_cache_bytes: usize,
    ) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(total_size as u64)?;

        let backing = match mode {
            IoMode::Mapped => {
                // Safety: the file is exclusively owned during the build phase
                // and kept at a fixed length for the map's lifetime.
                let map = unsafe { MmapMut::map_mut(&file)? };
                Backing::MappedRw(map)
            }
            IoMode::DirectIo => Backing::Direct {
                file,
                cache: Mutex::new(RangeLru::new(ram_cache_bytes)),
            },
        };

        info!(path = %path.display(), total_size, ?mode, "Created workspace store");
        Ok(Self {
            path: path.to_path_buf(),
            total_size,
            alignment,
            writable: true,
            backing,
            next_free: 0,
            regions: BTreeMap::new(),
        })
    }

    /// Attach to an existing store read-only.
    pub fn open(
        path: &Path,
        mode: IoMode,
        alignment: usize,
        ram_cache_bytes: usize,
    ) -> Result<Self, StoreError> {
        let file = OpenOptions::new().read(true).open(path)?;
        let total_size = file.metadata()?.len() as usize;

        let backing = match mode {
            IoMode::Mapped => {
                // Safety: built stores are never rewritten; the map stays
                // valid for the store's lifetime.
                let map = unsafe { Mmap::map(&file)? };
                Backing::MappedRo(map)
            }
            IoMode::DirectIo => Backing::Direct {
                file,
                cache: Mutex::new(RangeLru::new(ram_cache_bytes)),
            },
        };

        debug!(path = %path.display(), total_size, ?mode, "Opened workspace store");
        Ok(Self {
            path: path.to_path_buf(),
            total_size,
            alignment,
            writable: false,
            backing,
            next_free: total_size,
            regions: BTreeMap::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Bytes not yet claimed by the bump pointer.
    pub fn remaining(&self) -> usize {
        self.total_size - self.next_free
    }

    /// Bump-allocate an aligned region. There is no in-session free.
    pub fn allocate(&mut self, size: usize, name: &str) -> Result<WorkspaceRegion, StoreError> {
        if !self.writable {
            return Err(StoreError::ReadOnly(self.path.clone()));
        }
        let offset = self.next_free.next_multiple_of(self.alignment);
        if offset + size > self.total_size {
            return Err(StoreError::Full {
                needed: size,
                available: self.total_size.saturating_sub(offset),
            });
        }
        self.next_free = offset + size;
        self.regions.insert(offset, (size, name.to_string()));
        Ok(WorkspaceRegion { offset, size })
    }

    /// Write bytes through to the backing file.
    pub fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<(), StoreError> {
        if !self.writable {
            return Err(StoreError::ReadOnly(self.path.clone()));
        }
        self.check_range(offset, bytes.len())?;
        match &mut self.backing {
            Backing::MappedRw(map) => {
                map[offset..offset + bytes.len()].copy_from_slice(bytes);
                Ok(())
            }
            Backing::MappedRo(_) => Err(StoreError::ReadOnly(self.path.clone())),
            Backing::Direct { file, .. } => {
                pwrite(file, bytes, offset as u64)?;
                Ok(())
            }
        }
    }

    /// Read a byte range. Mapped mode returns a zero-copy view; direct-IO
    /// mode ensures the named range is resident in the RAM cache first.
    pub fn read(&self, offset: usize, len: usize, name: &str) -> Result<WorkspaceSlice<'_>, StoreError> {
        self.check_range(offset, len)?;
        match &self.backing {
            Backing::MappedRw(map) => Ok(WorkspaceSlice::Mapped(&map[offset..offset + len])),
            Backing::MappedRo(map) => Ok(WorkspaceSlice::Mapped(&map[offset..offset + len])),
            Backing::Direct { file, cache } => {
                let mut cache = cache.lock().unwrap();
                if let Some(hit) = cache.get(name) {
                    if hit.len() == len {
                        return Ok(WorkspaceSlice::Cached(hit));
                    }
                }
                let mut buf = vec![0u8; len];
                pread(file, &mut buf, offset as u64)?;
                Ok(WorkspaceSlice::Cached(cache.insert(name, buf)))
            }
        }
    }

    /// Flush dirty bytes in a range to disk.
    pub fn sync(&self, offset: usize, size: usize) -> Result<(), StoreError> {
        self.check_range(offset, size)?;
        match &self.backing {
            Backing::MappedRw(map) => {
                map.flush_range(offset, size)?;
                Ok(())
            }
            Backing::MappedRo(_) => Ok(()),
            Backing::Direct { file, .. } => {
                file.sync_data()?;
                Ok(())
            }
        }
    }

    /// Hint that resident pages (or cached ranges) belonging to regions whose
    /// owner name starts with `prefix` can be released.
    pub fn layer_evict(&self, prefix: &str) -> Result<usize, StoreError> {
        match &self.backing {
            Backing::Direct { cache, .. } => Ok(cache.lock().unwrap().evict_prefix(prefix)),
            #[cfg(unix)]
            Backing::MappedRo(map) => {
                let mut released = 0;
                for (offset, (size, name)) in &self.regions {
                    if name.starts_with(prefix) {
                        unsafe {
                            map.unchecked_advise_range(
                                memmap2::UncheckedAdvice::DontNeed,
                                *offset,
                                *size,
                            )?;
                        }
                        released += size;
                    }
                }
                Ok(released)
            }
            #[cfg(unix)]
            Backing::MappedRw(map) => {
                let mut released = 0;
                for (offset, (size, name)) in &self.regions {
                    if name.starts_with(prefix) {
                        unsafe {
                            map.unchecked_advise_range(
                                memmap2::UncheckedAdvice::DontNeed,
                                *offset,
                                *size,
                            )?;
                        }
                        released += size;
                    }
                }
                Ok(released)
            }
            #[cfg(not(unix))]
            _ => Ok(0),
        }
    }

    /// All registered regions as (offset, size, name).
    pub fn regions(&self) -> impl Iterator<Item = (usize, usize, &str)> {
        self.regions
            .iter()
            .map(|(offset, (size, name))| (*offset, *size, name.as_str()))
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<(), StoreError> {
        if offset + len > self.total_size {
            return Err(StoreError::BadRange {
                offset,
                len,
                total: self.total_size,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn scratch() -> (TempDir, PathBuf) {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("workspace.bin");
        (tmp, path)
    }

    #[test]
    fn test_allocate_aligned() {
        let (_tmp, path) = scratch();
        let mut store = WorkspaceStore::create(&path, 4096, IoMode::Mapped, 256, 0).unwrap();

        let a = store.allocate(100, "a").unwrap();
        let b = store.allocate(100, "b").unwrap();
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 256);
    }

    #[test]
    fn test_write_read_mapped() {
        let (_tmp, path) = scratch();
        let mut store = WorkspaceStore::create(&path, 4096, IoMode::Mapped, 256, 0).unwrap();

        let region = store.allocate(8, "t").unwrap();
        let values = [1.0f32, 2.0];
        store.write(region.offset, bytemuck::cast_slice(&values)).unwrap();

        let slice = store.read(region.offset, 8, "t").unwrap();
        assert_eq!(slice.try_as_f32().unwrap(), &values);
    }

    #[test]
    fn test_full_arena() {
        let (_tmp, path) = scratch();
        let mut store = WorkspaceStore::create(&path, 512, IoMode::Mapped, 256, 0).unwrap();

        store.allocate(256, "a").unwrap();
        let err = store.allocate(512, "b").unwrap_err();
        assert!(matches!(err, StoreError::Full { .. }));
    }

    #[test]
    fn test_direct_io_roundtrip_and_cache() {
        let (_tmp, path) = scratch();
        let mut store =
            WorkspaceStore::create(&path, 4096, IoMode::DirectIo, 256, 1024).unwrap();

        let region = store.allocate(64, "t").unwrap();
        let data = vec![42u8; 64];
        store.write(region.offset, &data).unwrap();
        store.sync(region.offset, 64).unwrap();

        let first = store.read(region.offset, 64, "t").unwrap();
        assert_eq!(first.as_bytes(), data.as_slice());
        // Second read is served from the LRU.
        let second = store.read(region.offset, 64, "t").unwrap();
        assert_eq!(second.as_bytes(), data.as_slice());
    }

    #[test]
    fn test_reopen_readonly() {
        let (_tmp, path) = scratch();
        {
            let mut store = WorkspaceStore::create(&path, 1024, IoMode::Mapped, 256, 0).unwrap();
            let region = store.allocate(4, "x").unwrap();
            store.write(region.offset, &7u32.to_le_bytes()).unwrap();
            store.sync(0, 1024).unwrap();
        }

        let store = WorkspaceStore::open(&path, IoMode::Mapped, 256, 0).unwrap();
        let slice = store.read(0, 4, "x").unwrap();
        assert_eq!(slice.as_bytes(), &7u32.to_le_bytes());

        let mut store = store;
        assert!(matches!(
            store.allocate(4, "y").unwrap_err(),
            StoreError::ReadOnly(_)
        ));
    }
}
