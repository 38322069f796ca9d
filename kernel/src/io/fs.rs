//! Boot filesystem seam.
//!
//! The VFS proper is a separate subsystem; the kernel core only needs to
//! read whole files (driver images, configuration databases) from whatever
//! medium is bootable right now. The initial provider is the unpacked
//! ramdisk; once the system volume is mounted the provider is swapped.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use crate::ke::SpinLock;
use crate::status::{Result, Status};

pub trait BootFileSystem: Send + Sync {
    fn exists(&self, path: &str) -> bool;
    fn size(&self, path: &str) -> Result<u64>;
    fn read(&self, path: &str, offset: u64, buffer: &mut [u8]) -> Result<usize>;
}

static PROVIDER: SpinLock<Option<Arc<dyn BootFileSystem>>> = SpinLock::new(None);

/// Install or replace the active provider.
pub fn set_filesystem(fs: Arc<dyn BootFileSystem>) {
    *PROVIDER.lock() = Some(fs);
}

fn provider() -> Result<Arc<dyn BootFileSystem>> {
    PROVIDER.lock().clone().ok_or(Status::DeviceNotAvailable)
}

pub fn exists(path: &str) -> bool {
    provider().map(|fs| fs.exists(path)).unwrap_or(false)
}

pub fn file_size(path: &str) -> Result<u64> {
    provider()?.size(path)
}

/// Read a whole file into memory.
pub fn read_file(path: &str) -> Result<Vec<u8>> {
    let fs = provider()?;
    let size = fs.size(path)? as usize;
    let mut buffer = vec![0u8; size];
    let actual = fs.read(path, 0, &mut buffer)?;
    if actual != size {
        return Err(Status::ReadIncomplete);
    }
    Ok(buffer)
}

/// Flat in-memory filesystem: the unpacked initial ramdisk, and the fixture
/// store for the unit tests.
#[derive(Default)]
pub struct MemoryFileSystem {
    files: SpinLock<BTreeMap<String, Arc<[u8]>>>,
}

impl MemoryFileSystem {
    pub fn new() -> MemoryFileSystem {
        MemoryFileSystem::default()
    }

    pub fn insert(&self, path: &str, contents: impl Into<Vec<u8>>) {
        self.files
            .lock()
            .insert(String::from(path), contents.into().into());
    }

    pub fn remove(&self, path: &str) {
        self.files.lock().remove(path);
    }
}

impl BootFileSystem for MemoryFileSystem {
    fn exists(&self, path: &str) -> bool {
        self.files.lock().contains_key(path)
    }

    fn size(&self, path: &str) -> Result<u64> {
        self.files
            .lock()
            .get(path)
            .map(|data| data.len() as u64)
            .ok_or(Status::FileNotFound)
    }

    fn read(&self, path: &str, offset: u64, buffer: &mut [u8]) -> Result<usize> {
        let files = self.files.lock();
        let data = files.get(path).ok_or(Status::FileNotFound)?;
        let offset = offset as usize;
        if offset > data.len() {
            return Ok(0);
        }
        let count = buffer.len().min(data.len() - offset);
        buffer[..count].copy_from_slice(&data[offset..offset + count]);
        Ok(count)
    }
}

/// Convenience for installing a fresh in-memory provider.
pub fn install_memory_filesystem() -> Arc<MemoryFileSystem> {
    let fs = Arc::new(MemoryFileSystem::new());
    set_filesystem(Arc::clone(&fs) as Arc<dyn BootFileSystem>);
    fs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_filesystem_round_trip() {
        let fs = MemoryFileSystem::new();
        fs.insert("/initrd/config.ndb", b"hello".as_slice());

        assert!(fs.exists("/initrd/config.ndb"));
        assert!(!fs.exists("/initrd/missing"));
        assert_eq!(fs.size("/initrd/config.ndb"), Ok(5));

        let mut buffer = [0u8; 3];
        assert_eq!(fs.read("/initrd/config.ndb", 2, &mut buffer), Ok(3));
        assert_eq!(&buffer, b"llo");

        assert_eq!(fs.size("/initrd/missing"), Err(Status::FileNotFound));
    }
}
