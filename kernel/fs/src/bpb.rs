//! BIOS Parameter Block parsing and volume geometry.

use crate::{FsError, SECTOR_SIZE};

/// Geometry derived from the BPB, with LBAs already shifted by the
/// partition start.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geometry {
    /// Sectors per allocation cluster.
    pub sectors_per_cluster: u8,
    /// Number of FAT copies; every FAT write updates all of them.
    pub fat_count: u8,
    /// Sectors per FAT copy.
    pub fat_size: u32,
    /// Total sectors of the volume.
    pub total_sectors: u32,
    /// Cluster number of the root directory.
    pub root_cluster: u32,
    /// LBA the volume starts at (0 without an MBR).
    pub part_lba: u64,
    /// First LBA of the first FAT copy.
    pub fat_start_lba: u64,
    /// First LBA of the data area (cluster 2).
    pub data_start_lba: u64,
    /// Number of data clusters.
    pub total_clusters: u32,
}

impl Geometry {
    /// Parses the BPB sector at `part_lba`.
    ///
    /// Rejects volumes without the boot signature, with a sector size
    /// other than 512 (the rest of the driver assumes it), or with a
    /// zero cluster or FAT size.
    pub fn parse(sector: &[u8; SECTOR_SIZE], part_lba: u64) -> Result<Self, FsError> {
        if sector[510] != 0x55 || sector[511] != 0xAA {
            return Err(FsError::FormatInvalid);
        }
        let bytes_per_sector = u16::from_le_bytes([sector[11], sector[12]]);
        let sectors_per_cluster = sector[13];
        let reserved_sectors = u16::from_le_bytes([sector[14], sector[15]]);
        let fat_count = sector[16];
        let total_sectors = u32::from_le_bytes([sector[32], sector[33], sector[34], sector[35]]);
        let fat_size = u32::from_le_bytes([sector[36], sector[37], sector[38], sector[39]]);
        let root_cluster = u32::from_le_bytes([sector[44], sector[45], sector[46], sector[47]]);

        if usize::from(bytes_per_sector) != SECTOR_SIZE
            || sectors_per_cluster == 0
            || fat_size == 0
            || fat_count == 0
        {
            return Err(FsError::FormatInvalid);
        }

        let fat_start_lba = part_lba + u64::from(reserved_sectors);
        let fat_sectors = u32::from(fat_count) * fat_size;
        let data_start_lba = fat_start_lba + u64::from(fat_sectors);
        let total_clusters = (total_sectors - u32::from(reserved_sectors) - fat_sectors)
            / u32::from(sectors_per_cluster);

        Ok(Self {
            sectors_per_cluster,
            fat_count,
            fat_size,
            total_sectors,
            root_cluster,
            part_lba,
            fat_start_lba,
            data_start_lba,
            total_clusters,
        })
    }

    /// Bytes per cluster.
    #[must_use]
    pub fn cluster_bytes(&self) -> u32 {
        u32::from(self.sectors_per_cluster) * SECTOR_SIZE as u32
    }

    /// First LBA of a data cluster (cluster numbering starts at 2).
    #[must_use]
    pub fn cluster_to_lba(&self, cluster: u32) -> u64 {
        self.data_start_lba + u64::from(cluster - 2) * u64::from(self.sectors_per_cluster)
    }
}
