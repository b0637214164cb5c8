//! File content I/O: whole-file reads and overwrite/append writes.

use alloc::vec::Vec;

use crate::dir::{ATTR_ARCHIVE, ATTR_DIR};
use crate::volume::EOC;
use crate::{BlockDevice, Fat32Volume, FsError, SECTOR_SIZE};

impl<D: BlockDevice> Fat32Volume<D> {
    /// Reads the whole content of the file `name` in directory `dir`.
    pub(crate) fn read_file(&mut self, dir: u32, name: &str) -> Result<Vec<u8>, FsError> {
        let (raw, _) = self.find_entry(dir, name)?.ok_or(FsError::NotFound)?;
        if raw.attr() & ATTR_DIR != 0 {
            return Err(FsError::IsDirectory);
        }

        let size = raw.size() as usize;
        let mut data = Vec::with_capacity(size);
        let mut cluster = raw.first_cluster();
        while self.is_data_cluster(cluster) && data.len() < size {
            let lba = self.geo.cluster_to_lba(cluster);
            for s in 0..u64::from(self.geo.sectors_per_cluster) {
                if data.len() >= size {
                    break;
                }
                self.read_sector_at(lba + s)?;
                let take = SECTOR_SIZE.min(size - data.len());
                data.extend_from_slice(&self.buf[..take]);
            }
            cluster = self.fat_entry(cluster)?;
        }
        Ok(data)
    }

    /// Writes `data` to the file `name` in directory `dir`, creating it
    /// when missing. `append` keeps the existing content and writes past
    /// it; otherwise the old cluster chain is released first.
    pub(crate) fn write_file(
        &mut self,
        dir: u32,
        name: &str,
        data: &[u8],
        append: bool,
    ) -> Result<(), FsError> {
        let (mut raw, loc) = match self.find_entry(dir, name)? {
            Some(found) => found,
            None => self.create_entry(dir, name, ATTR_ARCHIVE)?,
        };
        if raw.attr() & ATTR_DIR != 0 {
            return Err(FsError::IsDirectory);
        }

        let mut start = raw.first_cluster();
        let offset = if append && start != 0 {
            raw.size()
        } else {
            if start != 0 {
                self.free_chain(start)?;
                start = 0;
            }
            0
        };

        let cluster_bytes = self.geo.cluster_bytes();
        let need = offset + data.len() as u32;
        let needed_clusters = need.div_ceil(cluster_bytes);

        if needed_clusters == 0 {
            raw.set_first_cluster(0);
            raw.set_size(0);
            return self.update_entry(loc, &raw);
        }

        // Reuse the existing chain and extend it to `needed_clusters`.
        let first;
        let mut last;
        let mut have = 0u32;
        if start == 0 {
            first = self.alloc_cluster()?;
            last = first;
            have = 1;
        } else {
            first = start;
            let mut cur = start;
            loop {
                have += 1;
                let next = self.fat_entry(cur)?;
                if !self.is_data_cluster(next) {
                    last = cur;
                    break;
                }
                cur = next;
            }
        }
        while have < needed_clusters {
            let fresh = self.alloc_cluster()?;
            self.set_fat_entry(last, fresh)?;
            last = fresh;
            have += 1;
        }
        self.set_fat_entry(last, EOC)?;

        // Read-modify-write every sector that intersects the window
        // [offset, offset + data.len()).
        let end = offset + data.len() as u32;
        let mut cluster = first;
        let mut pos = 0u32;
        while self.is_data_cluster(cluster) && pos < end {
            let lba = self.geo.cluster_to_lba(cluster);
            for s in 0..u64::from(self.geo.sectors_per_cluster) {
                if pos >= end {
                    break;
                }
                let sector_end = pos + SECTOR_SIZE as u32;
                let write_start = offset.max(pos);
                let write_end = end.min(sector_end);
                if write_end > write_start {
                    self.read_sector_at(lba + s)?;
                    let src = (write_start - offset) as usize;
                    let dst = (write_start - pos) as usize;
                    let len = (write_end - write_start) as usize;
                    self.buf[dst..dst + len].copy_from_slice(&data[src..src + len]);
                    self.write_sector_at(lba + s)?;
                }
                pos += SECTOR_SIZE as u32;
            }
            cluster = self.fat_entry(cluster)?;
        }

        raw.set_first_cluster(first);
        raw.set_size(need);
        self.update_entry(loc, &raw)
    }
}
