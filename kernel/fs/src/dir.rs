//! Directory entries: scanning, lookup, creation, and deletion.
//!
//! A directory is a cluster chain of 32-byte entries. A name with no
//! exact 8.3 representation is stored as a run of long-file-name
//! entries (attr 0x0F) physically preceding the short entry, ordered
//! last-fragment-first and tied to it by a checksum.

use alloc::string::String;
use alloc::vec::Vec;

use crate::name::{
    fits_short, lfn_entry, lfn_entry_count, lfn_fragment, name_eq, short_from_name, short_to_name,
    short_with_tail,
};
use crate::volume::EOC;
use crate::{BlockDevice, Fat32Volume, FsEntry, FsError, SECTOR_SIZE};

/// Long-file-name marker attribute.
pub(crate) const ATTR_LFN: u8 = 0x0F;
/// Directory attribute bit.
pub(crate) const ATTR_DIR: u8 = 0x10;
/// Volume label attribute bit.
pub(crate) const ATTR_VOLUME: u8 = 0x08;
/// Plain file attribute.
pub(crate) const ATTR_ARCHIVE: u8 = 0x20;

/// First byte of a deleted entry.
const ENTRY_DELETED: u8 = 0xE5;
/// First byte marking the end of the used directory area.
const ENTRY_END: u8 = 0x00;

/// Entries per sector.
const ENTRIES_PER_SECTOR: usize = SECTOR_SIZE / 32;

/// A raw 32-byte directory entry.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawDirent(pub [u8; 32]);

impl RawDirent {
    /// A fresh entry with the given short name and attributes, size 0,
    /// cluster 0.
    pub fn new(short: &[u8; 11], attr: u8) -> Self {
        let mut bytes = [0u8; 32];
        bytes[..11].copy_from_slice(short);
        bytes[11] = attr;
        Self(bytes)
    }

    pub fn short_name(&self) -> [u8; 11] {
        let mut out = [0u8; 11];
        out.copy_from_slice(&self.0[..11]);
        out
    }

    pub fn attr(&self) -> u8 {
        self.0[11]
    }

    pub fn first_cluster(&self) -> u32 {
        let hi = u16::from_le_bytes([self.0[20], self.0[21]]);
        let lo = u16::from_le_bytes([self.0[26], self.0[27]]);
        (u32::from(hi) << 16) | u32::from(lo)
    }

    pub fn set_first_cluster(&mut self, cluster: u32) {
        self.0[20..22].copy_from_slice(&((cluster >> 16) as u16).to_le_bytes());
        self.0[26..28].copy_from_slice(&((cluster & 0xFFFF) as u16).to_le_bytes());
    }

    pub fn size(&self) -> u32 {
        u32::from_le_bytes([self.0[28], self.0[29], self.0[30], self.0[31]])
    }

    pub fn set_size(&mut self, size: u32) {
        self.0[28..32].copy_from_slice(&size.to_le_bytes());
    }
}

/// Position of a 32-byte entry: owning cluster plus byte offset inside
/// that cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Location {
    pub cluster: u32,
    pub offset: u32,
}

/// One live entry produced by a directory scan.
pub(crate) struct ScannedEntry {
    pub raw: RawDirent,
    pub name: String,
    pub loc: Location,
    /// Locations of the LFN entries belonging to this entry, in
    /// physical order.
    pub lfn_locs: Vec<Location>,
}

impl<D: BlockDevice> Fat32Volume<D> {
    fn entry_lba(&self, loc: Location) -> (u64, usize) {
        let lba = self.geo.cluster_to_lba(loc.cluster) + u64::from(loc.offset) / SECTOR_SIZE as u64;
        (lba, loc.offset as usize % SECTOR_SIZE)
    }

    /// Read-modify-writes the 32 bytes at `loc`.
    fn write_entry_bytes(&mut self, loc: Location, bytes: &[u8; 32]) -> Result<(), FsError> {
        let (lba, at) = self.entry_lba(loc);
        self.read_sector_at(lba)?;
        self.buf[at..at + 32].copy_from_slice(bytes);
        self.write_sector_at(lba)
    }

    /// Rewrites the short entry at `loc`.
    pub(crate) fn update_entry(&mut self, loc: Location, raw: &RawDirent) -> Result<(), FsError> {
        self.write_entry_bytes(loc, &raw.0)
    }

    /// Flags the entry at `loc` as deleted.
    fn mark_deleted(&mut self, loc: Location) -> Result<(), FsError> {
        let (lba, at) = self.entry_lba(loc);
        self.read_sector_at(lba)?;
        self.buf[at] = ENTRY_DELETED;
        self.write_sector_at(lba)
    }

    /// Walks the live entries of the directory chain at `dir`, calling
    /// `f` for each; `f` returns `false` to stop early. LFN runs are
    /// folded into the following short entry.
    fn scan_entries<F>(&mut self, dir: u32, mut f: F) -> Result<(), FsError>
    where
        F: FnMut(ScannedEntry) -> bool,
    {
        let mut cluster = dir;
        let mut lfn_name = String::new();
        let mut lfn_locs: Vec<Location> = Vec::new();

        while self.is_data_cluster(cluster) {
            let lba = self.geo.cluster_to_lba(cluster);
            for s in 0..u64::from(self.geo.sectors_per_cluster) {
                self.read_sector_at(lba + s)?;
                for e in 0..ENTRIES_PER_SECTOR {
                    let at = e * 32;
                    let first = self.buf[at];
                    if first == ENTRY_END {
                        return Ok(());
                    }
                    let loc = Location {
                        cluster,
                        offset: (s as u32) * SECTOR_SIZE as u32 + at as u32,
                    };
                    if first == ENTRY_DELETED {
                        lfn_name.clear();
                        lfn_locs.clear();
                        continue;
                    }
                    let attr = self.buf[at + 11];
                    if attr == ATTR_LFN {
                        let mut entry = [0u8; 32];
                        entry.copy_from_slice(&self.buf[at..at + 32]);
                        if entry[0] & 0x40 != 0 {
                            lfn_name.clear();
                            lfn_locs.clear();
                        }
                        lfn_locs.push(loc);
                        lfn_name.insert_str(0, &lfn_fragment(&entry));
                        continue;
                    }
                    if attr & ATTR_VOLUME != 0 {
                        lfn_name.clear();
                        lfn_locs.clear();
                        continue;
                    }

                    let mut bytes = [0u8; 32];
                    bytes.copy_from_slice(&self.buf[at..at + 32]);
                    let raw = RawDirent(bytes);
                    let name = if lfn_name.is_empty() {
                        short_to_name(&raw.short_name())
                    } else {
                        core::mem::take(&mut lfn_name)
                    };
                    lfn_name.clear();
                    let entry = ScannedEntry {
                        raw,
                        name,
                        loc,
                        lfn_locs: core::mem::take(&mut lfn_locs),
                    };
                    if !f(entry) {
                        return Ok(());
                    }
                }
            }
            cluster = self.fat_entry(cluster)?;
        }
        Ok(())
    }

    /// Finds the entry called `name` (case-insensitive) in `dir`.
    pub(crate) fn find_entry(
        &mut self,
        dir: u32,
        name: &str,
    ) -> Result<Option<(RawDirent, Location)>, FsError> {
        let mut found = None;
        self.scan_entries(dir, |entry| {
            if name_eq(&entry.name, name) {
                found = Some((entry.raw, entry.loc));
                false
            } else {
                true
            }
        })?;
        Ok(found)
    }

    /// Lists the live entries of `dir`, volume labels excluded.
    pub(crate) fn read_dir(&mut self, dir: u32) -> Result<Vec<FsEntry>, FsError> {
        let mut out = Vec::new();
        self.scan_entries(dir, |entry| {
            out.push(FsEntry {
                name: entry.name,
                size: entry.raw.size(),
                is_dir: entry.raw.attr() & ATTR_DIR != 0,
            });
            true
        })?;
        Ok(out)
    }

    /// Whether `dir` holds nothing besides `.` and `..`.
    pub(crate) fn dir_is_empty(&mut self, dir: u32) -> Result<bool, FsError> {
        let mut empty = true;
        self.scan_entries(dir, |entry| {
            if entry.name == "." || entry.name == ".." {
                true
            } else {
                empty = false;
                false
            }
        })?;
        Ok(empty)
    }

    /// Removes `name` from `dir`: its LFN run and short entry are all
    /// flagged deleted. The cluster chain is left to the caller.
    pub(crate) fn delete_entry(&mut self, dir: u32, name: &str) -> Result<RawDirent, FsError> {
        let mut target: Option<(RawDirent, Location, Vec<Location>)> = None;
        self.scan_entries(dir, |entry| {
            if name_eq(&entry.name, name) {
                target = Some((entry.raw, entry.loc, entry.lfn_locs));
                false
            } else {
                true
            }
        })?;
        let (raw, loc, lfn_locs) = target.ok_or(FsError::NotFound)?;
        for lfn_loc in lfn_locs {
            self.mark_deleted(lfn_loc)?;
        }
        self.mark_deleted(loc)?;
        Ok(raw)
    }

    /// Whether any live entry of `dir` already uses the raw short name.
    fn short_name_in_use(&mut self, dir: u32, short: &[u8; 11]) -> Result<bool, FsError> {
        let mut used = false;
        self.scan_entries(dir, |entry| {
            if entry.raw.short_name() == *short {
                used = true;
                false
            } else {
                true
            }
        })?;
        Ok(used)
    }

    /// Picks the on-disk short name for `name`: the exact 8.3 form when
    /// it round-trips, otherwise a truncated stem with the first free
    /// `~1`..`~9` numeric tail.
    fn pick_short_name(&mut self, dir: u32, name: &str) -> Result<([u8; 11], bool), FsError> {
        let base = short_from_name(name);
        if fits_short(name) {
            return Ok((base, false));
        }
        for tail in 1..=9 {
            let candidate = short_with_tail(&base, tail);
            if !self.short_name_in_use(dir, &candidate)? {
                return Ok((candidate, true));
            }
        }
        Err(FsError::NoSpace)
    }

    /// Collects every free slot (deleted or past the end marker) of the
    /// chain, in order, until `count` consecutive ones are found.
    fn find_free_run(&mut self, dir: u32, count: usize) -> Result<Option<Vec<Location>>, FsError> {
        let mut run: Vec<Location> = Vec::new();
        let mut cluster = dir;
        while self.is_data_cluster(cluster) {
            let lba = self.geo.cluster_to_lba(cluster);
            for s in 0..u64::from(self.geo.sectors_per_cluster) {
                self.read_sector_at(lba + s)?;
                for e in 0..ENTRIES_PER_SECTOR {
                    let at = e * 32;
                    let first = self.buf[at];
                    if first == ENTRY_END || first == ENTRY_DELETED {
                        run.push(Location {
                            cluster,
                            offset: (s as u32) * SECTOR_SIZE as u32 + at as u32,
                        });
                        if run.len() == count {
                            return Ok(Some(run));
                        }
                    } else {
                        run.clear();
                    }
                }
            }
            cluster = self.fat_entry(cluster)?;
        }
        Ok(None)
    }

    /// Appends a zeroed cluster to the directory chain at `dir`.
    fn extend_directory(&mut self, dir: u32) -> Result<(), FsError> {
        let mut last = dir;
        loop {
            let next = self.fat_entry(last)?;
            if !self.is_data_cluster(next) {
                break;
            }
            last = next;
        }
        let fresh = self.alloc_cluster()?;
        self.set_fat_entry(last, fresh)?;
        self.set_fat_entry(fresh, EOC)?;
        self.zero_cluster(fresh)
    }

    /// Creates a new entry called `name` in `dir` and returns it with
    /// its location. The caller fills in cluster/size afterwards.
    pub(crate) fn create_entry(
        &mut self,
        dir: u32,
        name: &str,
        attr: u8,
    ) -> Result<(RawDirent, Location), FsError> {
        let (short, needs_lfn) = self.pick_short_name(dir, name)?;
        let lfn_count = if needs_lfn { lfn_entry_count(name.len()) } else { 0 };
        let total = lfn_count + 1;

        let run = loop {
            if let Some(run) = self.find_free_run(dir, total)? {
                break run;
            }
            self.extend_directory(dir)?;
        };

        // LFN slots fill back-to-front: the physically first slot holds
        // the highest-order fragment and the 0x40 terminator flag.
        for (slot, loc) in run[..lfn_count].iter().enumerate() {
            let order = lfn_count - slot;
            let entry = lfn_entry(name, &short, order, order == lfn_count);
            self.write_entry_bytes(*loc, &entry)?;
        }

        let raw = RawDirent::new(&short, attr);
        let loc = run[lfn_count];
        self.write_entry_bytes(loc, &raw.0)?;
        Ok((raw, loc))
    }

    /// Writes the `.` and `..` entries into a fresh directory cluster.
    pub(crate) fn init_directory_cluster(
        &mut self,
        cluster: u32,
        parent: u32,
    ) -> Result<(), FsError> {
        self.zero_cluster(cluster)?;

        let mut dot = RawDirent::new(b".          ", ATTR_DIR);
        dot.set_first_cluster(cluster);
        let mut dotdot = RawDirent::new(b"..         ", ATTR_DIR);
        // By convention `..` stores 0 when the parent is the root.
        dotdot.set_first_cluster(if parent == self.geo.root_cluster {
            0
        } else {
            parent
        });

        self.write_entry_bytes(Location { cluster, offset: 0 }, &dot.0)?;
        self.write_entry_bytes(Location { cluster, offset: 32 }, &dotdot.0)
    }
}
