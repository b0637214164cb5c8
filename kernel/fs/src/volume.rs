//! FAT32 volume: mount, FAT table access, cluster allocation, and the
//! path-based operations built on the directory and file layers.

use alloc::string::String;
use alloc::vec::Vec;

use crate::bpb::Geometry;
use crate::dir::ATTR_DIR;
use crate::path::split_path;
use crate::{BlockDevice, FsEntry, FsError, SECTOR_SIZE, mbr};

/// First FAT value that marks end-of-chain; anything `>=` this ends the
/// walk. `0` is a free cluster, `2..EOC_MIN` links to the next cluster.
pub(crate) const EOC_MIN: u32 = 0x0FFF_FFF8;

/// Value written to terminate a chain.
pub(crate) const EOC: u32 = 0x0FFF_FFFF;

/// Mask for the 28 significant bits of a FAT32 entry.
const FAT_MASK: u32 = 0x0FFF_FFFF;

/// A mounted FAT32 volume over a block device.
///
/// Owns a single sector scratch buffer; every method that touches the
/// disk goes through it, so the volume must not be shared without
/// external serialization.
pub struct Fat32Volume<D: BlockDevice> {
    pub(crate) dev: D,
    pub(crate) geo: Geometry,
    pub(crate) buf: [u8; SECTOR_SIZE],
}

impl<D: BlockDevice> Fat32Volume<D> {
    /// Mounts the first FAT32 partition (or the whole device when no
    /// MBR is present).
    pub fn mount(mut dev: D) -> Result<Self, FsError> {
        let mut buf = [0u8; SECTOR_SIZE];
        dev.read_sector(0, &mut buf)?;
        let part_lba = mbr::find_fat32_partition(&buf);
        if part_lba != 0 {
            dev.read_sector(part_lba, &mut buf)?;
        }
        let geo = Geometry::parse(&buf, part_lba)?;
        Ok(Self { dev, geo, buf })
    }

    /// Cluster number of the root directory.
    #[must_use]
    pub fn root_cluster(&self) -> u32 {
        self.geo.root_cluster
    }

    /// Whether `cluster` refers to the data area (not free, not EOC).
    pub(crate) fn is_data_cluster(&self, cluster: u32) -> bool {
        (2..EOC_MIN).contains(&cluster)
    }

    pub(crate) fn read_sector_at(&mut self, lba: u64) -> Result<(), FsError> {
        self.dev.read_sector(lba, &mut self.buf)?;
        Ok(())
    }

    pub(crate) fn write_sector_at(&mut self, lba: u64) -> Result<(), FsError> {
        self.dev.write_sector(lba, &self.buf)?;
        Ok(())
    }

    // -- FAT table ---------------------------------------------------------

    /// Reads the FAT entry for `cluster` (28 significant bits).
    pub(crate) fn fat_entry(&mut self, cluster: u32) -> Result<u32, FsError> {
        let offset = u64::from(cluster) * 4;
        let lba = self.geo.fat_start_lba + offset / SECTOR_SIZE as u64;
        let at = (offset % SECTOR_SIZE as u64) as usize;
        self.read_sector_at(lba)?;
        let raw = u32::from_le_bytes([
            self.buf[at],
            self.buf[at + 1],
            self.buf[at + 2],
            self.buf[at + 3],
        ]);
        Ok(raw & FAT_MASK)
    }

    /// Writes the FAT entry for `cluster` into every FAT copy.
    pub(crate) fn set_fat_entry(&mut self, cluster: u32, value: u32) -> Result<(), FsError> {
        let offset = u64::from(cluster) * 4;
        for copy in 0..self.geo.fat_count {
            let lba = self.geo.fat_start_lba
                + u64::from(copy) * u64::from(self.geo.fat_size)
                + offset / SECTOR_SIZE as u64;
            let at = (offset % SECTOR_SIZE as u64) as usize;
            self.read_sector_at(lba)?;
            self.buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
            self.write_sector_at(lba)?;
        }
        Ok(())
    }

    /// Claims the first free cluster, marks it end-of-chain, and
    /// returns it.
    pub(crate) fn alloc_cluster(&mut self) -> Result<u32, FsError> {
        for cluster in 2..self.geo.total_clusters {
            if self.fat_entry(cluster)? == 0 {
                self.set_fat_entry(cluster, EOC)?;
                return Ok(cluster);
            }
        }
        Err(FsError::NoSpace)
    }

    /// Zeroes every FAT entry of the chain starting at `start`.
    pub(crate) fn free_chain(&mut self, start: u32) -> Result<(), FsError> {
        let mut cluster = start;
        while self.is_data_cluster(cluster) {
            let next = self.fat_entry(cluster)?;
            self.set_fat_entry(cluster, 0)?;
            cluster = next;
        }
        Ok(())
    }

    /// Fills an entire cluster with zero bytes.
    pub(crate) fn zero_cluster(&mut self, cluster: u32) -> Result<(), FsError> {
        let lba = self.geo.cluster_to_lba(cluster);
        self.buf.fill(0);
        for s in 0..u64::from(self.geo.sectors_per_cluster) {
            self.write_sector_at(lba + s)?;
        }
        Ok(())
    }

    // -- Path operations ---------------------------------------------------

    /// Walks `path` down to its final component.
    ///
    /// Returns the cluster of the parent directory and the leaf name.
    pub(crate) fn resolve_parent(&mut self, path: &str) -> Result<(u32, String), FsError> {
        let (components, leaf) = split_path(path)?;
        let mut dir = self.geo.root_cluster;
        for component in &components {
            let (raw, _) = self
                .find_entry(dir, component)?
                .ok_or(FsError::NotFound)?;
            if raw.attr() & ATTR_DIR == 0 {
                return Err(FsError::NotDirectory);
            }
            dir = raw.first_cluster();
            if dir == 0 {
                return Err(FsError::NotFound);
            }
        }
        Ok((dir, leaf))
    }

    /// Resolves a directory path (the root included) to its cluster.
    fn resolve_dir(&mut self, path: &str) -> Result<u32, FsError> {
        if path == "/" || path.is_empty() {
            return Ok(self.geo.root_cluster);
        }
        let (dir, leaf) = self.resolve_parent(path)?;
        let (raw, _) = self.find_entry(dir, &leaf)?.ok_or(FsError::NotFound)?;
        if raw.attr() & ATTR_DIR == 0 {
            return Err(FsError::NotDirectory);
        }
        let cluster = raw.first_cluster();
        if cluster == 0 {
            return Err(FsError::NotFound);
        }
        Ok(cluster)
    }

    /// Lists the entries of the directory at `path`.
    pub fn list_dir(&mut self, path: &str) -> Result<Vec<FsEntry>, FsError> {
        let dir = self.resolve_dir(path)?;
        self.read_dir(dir)
    }

    /// Reads the whole file at `path`.
    pub fn read(&mut self, path: &str) -> Result<Vec<u8>, FsError> {
        let (dir, leaf) = self.resolve_parent(path)?;
        self.read_file(dir, &leaf)
    }

    /// Creates or overwrites the file at `path` with `data`.
    pub fn write(&mut self, path: &str, data: &[u8]) -> Result<(), FsError> {
        let (dir, leaf) = self.resolve_parent(path)?;
        self.write_file(dir, &leaf, data, false)
    }

    /// Appends `data` to the file at `path`, creating it if needed.
    pub fn append(&mut self, path: &str, data: &[u8]) -> Result<(), FsError> {
        let (dir, leaf) = self.resolve_parent(path)?;
        self.write_file(dir, &leaf, data, true)
    }

    /// Creates an empty directory at `path`.
    pub fn mkdir(&mut self, path: &str) -> Result<(), FsError> {
        let (dir, leaf) = self.resolve_parent(path)?;
        if self.find_entry(dir, &leaf)?.is_some() {
            return Err(FsError::Exists);
        }
        let (mut raw, loc) = self.create_entry(dir, &leaf, ATTR_DIR)?;
        let cluster = self.alloc_cluster()?;
        raw.set_first_cluster(cluster);
        raw.set_size(0);
        self.update_entry(loc, &raw)?;
        self.init_directory_cluster(cluster, dir)
    }

    /// Whether `path` names an existing entry. The root always exists.
    pub fn exists(&mut self, path: &str) -> Result<bool, FsError> {
        if path == "/" {
            return Ok(true);
        }
        let (dir, leaf) = match self.resolve_parent(path) {
            Ok(v) => v,
            Err(FsError::NotFound) => return Ok(false),
            Err(e) => return Err(e),
        };
        Ok(self.find_entry(dir, &leaf)?.is_some())
    }

    /// Deletes the file or empty directory at `path`.
    pub fn remove(&mut self, path: &str) -> Result<(), FsError> {
        if path == "/" {
            return Err(FsError::InvalidPath);
        }
        let (dir, leaf) = self.resolve_parent(path)?;
        let (raw, _) = self.find_entry(dir, &leaf)?.ok_or(FsError::NotFound)?;
        let start = raw.first_cluster();
        if raw.attr() & ATTR_DIR != 0 {
            if start == 0 {
                return Err(FsError::NotFound);
            }
            if !self.dir_is_empty(start)? {
                return Err(FsError::NotEmpty);
            }
        }
        self.delete_entry(dir, &leaf)?;
        if start != 0 {
            self.free_chain(start)?;
        }
        Ok(())
    }

    /// Renames `old_path` to `new_path`.
    ///
    /// Directories can only be renamed within their parent; the
    /// destination must not exist.
    pub fn rename(&mut self, old_path: &str, new_path: &str) -> Result<(), FsError> {
        if old_path == new_path {
            return Ok(());
        }
        let (old_dir, old_leaf) = self.resolve_parent(old_path)?;
        let (new_dir, new_leaf) = self.resolve_parent(new_path)?;
        if self.find_entry(new_dir, &new_leaf)?.is_some() {
            return Err(FsError::Exists);
        }
        let (raw, _) = self
            .find_entry(old_dir, &old_leaf)?
            .ok_or(FsError::NotFound)?;
        if raw.attr() & ATTR_DIR != 0 && old_dir != new_dir {
            return Err(FsError::InvalidPath);
        }

        let (mut new_raw, new_loc) = self.create_entry(new_dir, &new_leaf, raw.attr())?;
        new_raw.set_first_cluster(raw.first_cluster());
        new_raw.set_size(raw.size());
        self.update_entry(new_loc, &new_raw)?;

        self.delete_entry(old_dir, &old_leaf)?;
        Ok(())
    }

    /// Copies the file at `src_path` to `dst_path`.
    pub fn copy(&mut self, src_path: &str, dst_path: &str) -> Result<(), FsError> {
        let (dir, leaf) = self.resolve_parent(src_path)?;
        let (raw, _) = self.find_entry(dir, &leaf)?.ok_or(FsError::NotFound)?;
        if raw.attr() & ATTR_DIR != 0 {
            return Err(FsError::IsDirectory);
        }
        let data = self.read(src_path)?;
        self.write(dst_path, &data)
    }

    /// Moves `src_path` to `dst_path`: rename when possible, otherwise
    /// copy followed by delete.
    pub fn rename_or_move(&mut self, src_path: &str, dst_path: &str) -> Result<(), FsError> {
        match self.rename(src_path, dst_path) {
            Ok(()) => Ok(()),
            Err(FsError::Io(e)) => Err(FsError::Io(e)),
            Err(_) => {
                self.copy(src_path, dst_path)?;
                self.remove(src_path)
            }
        }
    }

    /// Returns name, size, and kind for the entry at `path`.
    pub fn stat(&mut self, path: &str) -> Result<FsEntry, FsError> {
        if path == "/" {
            return Ok(FsEntry {
                name: String::from("/"),
                size: 0,
                is_dir: true,
            });
        }
        let (dir, leaf) = self.resolve_parent(path)?;
        let (raw, _) = self.find_entry(dir, &leaf)?.ok_or(FsError::NotFound)?;
        Ok(FsEntry {
            name: leaf,
            size: raw.size(),
            is_dir: raw.attr() & ATTR_DIR != 0,
        })
    }
}
