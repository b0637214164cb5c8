//! Storage service: the virtio disk and its mounted FAT32 volume.
//!
//! The volume's single sector buffer is not reentrant, so every
//! filesystem call funnels through one lock here; collaborators run
//! their file operations serially on the desktop task.

use quasar_core::sync::SpinLock;
use quasar_fs::{Fat32Volume, FsEntry, FsError, IoError};

use crate::drivers::virtio_blk::VirtioBlk;

use alloc::vec::Vec;

/// The mounted volume, or `None` before/without a disk.
pub struct StorageService {
    volume: SpinLock<Option<Fat32Volume<VirtioBlk>>>,
}

impl StorageService {
    /// An empty service.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            volume: SpinLock::new(None),
        }
    }

    /// Probes the disk and mounts the filesystem.
    pub fn init(&self) {
        let Some(disk) = VirtioBlk::probe() else {
            crate::kwarn!("storage: no virtio-blk device, filesystem disabled");
            return;
        };
        match Fat32Volume::mount(disk) {
            Ok(volume) => {
                crate::kinfo!("storage: FAT32 volume mounted");
                *self.volume.lock() = Some(volume);
            }
            Err(err) => crate::kerr!("storage: mount failed: {:?}", err),
        }
    }

    /// Whether a volume is mounted.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.volume.lock().is_some()
    }

    /// Runs `f` against the mounted volume.
    pub fn with_volume<R>(
        &self,
        f: impl FnOnce(&mut Fat32Volume<VirtioBlk>) -> Result<R, FsError>,
    ) -> Result<R, FsError> {
        let mut volume = self.volume.lock();
        match volume.as_mut() {
            Some(volume) => f(volume),
            None => Err(FsError::Io(IoError::NotReady)),
        }
    }

    /// Lists a directory.
    pub fn list_dir(&self, path: &str) -> Result<Vec<FsEntry>, FsError> {
        self.with_volume(|v| v.list_dir(path))
    }

    /// Reads a whole file.
    pub fn read(&self, path: &str) -> Result<Vec<u8>, FsError> {
        self.with_volume(|v| v.read(path))
    }

    /// Creates or overwrites a file.
    pub fn write(&self, path: &str, data: &[u8]) -> Result<(), FsError> {
        self.with_volume(|v| v.write(path, data))
    }

    /// Appends to a file, creating it if needed.
    pub fn append(&self, path: &str, data: &[u8]) -> Result<(), FsError> {
        self.with_volume(|v| v.append(path, data))
    }

    /// Creates a directory.
    pub fn mkdir(&self, path: &str) -> Result<(), FsError> {
        self.with_volume(|v| v.mkdir(path))
    }

    /// Deletes a file or empty directory.
    pub fn remove(&self, path: &str) -> Result<(), FsError> {
        self.with_volume(|v| v.remove(path))
    }

    /// Renames within the volume.
    pub fn rename(&self, old_path: &str, new_path: &str) -> Result<(), FsError> {
        self.with_volume(|v| v.rename(old_path, new_path))
    }

    /// Copies a file.
    pub fn copy(&self, src: &str, dst: &str) -> Result<(), FsError> {
        self.with_volume(|v| v.copy(src, dst))
    }

    /// Moves a file or directory.
    pub fn rename_or_move(&self, src: &str, dst: &str) -> Result<(), FsError> {
        self.with_volume(|v| v.rename_or_move(src, dst))
    }

    /// Stats an entry.
    pub fn stat(&self, path: &str) -> Result<FsEntry, FsError> {
        self.with_volume(|v| v.stat(path))
    }

    /// Whether a path exists.
    pub fn exists(&self, path: &str) -> Result<bool, FsError> {
        self.with_volume(|v| v.exists(path))
    }
}

impl Default for StorageService {
    fn default() -> Self {
        Self::new()
    }
}
