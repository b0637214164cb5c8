//! FAT32 end-to-end tests against an in-memory volume.

mod common;

use common::{fresh_disk, mkfs_at, small_cluster_disk, RamDisk};
use quasar_fs::{Fat32Volume, FsError, SortMode, SortOrder, sort_entries};

fn mounted() -> Fat32Volume<RamDisk> {
    Fat32Volume::mount(fresh_disk()).unwrap()
}

#[test]
fn mount_rejects_garbage() {
    let disk = RamDisk::new(64);
    assert!(matches!(
        Fat32Volume::mount(disk),
        Err(FsError::FormatInvalid)
    ));
}

#[test]
fn mount_through_mbr_partition() {
    let mut disk = RamDisk::new(32 * 1024);
    mkfs_at(&mut disk, 2048, 4, 16 * 1024);
    let mut vol = Fat32Volume::mount(disk).unwrap();
    vol.write("/boot.cfg", b"timeout=3").unwrap();
    assert_eq!(vol.read("/boot.cfg").unwrap(), b"timeout=3");
}

#[test]
fn write_then_read_round_trip() {
    let mut vol = mounted();
    let data: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
    vol.write("/data.bin", &data).unwrap();
    assert_eq!(vol.read("/data.bin").unwrap(), data);
}

#[test]
fn large_file_round_trip() {
    let mut vol = mounted();
    // 200 KiB spans many clusters.
    let data: Vec<u8> = (0..200 * 1024u32).map(|i| (i * 7 % 256) as u8).collect();
    vol.write("/big.bin", &data).unwrap();
    let back = vol.read("/big.bin").unwrap();
    assert_eq!(back.len(), data.len());
    assert_eq!(back, data);
}

#[test]
fn file_spanning_cluster_chain_on_small_clusters() {
    let mut vol = Fat32Volume::mount(small_cluster_disk()).unwrap();
    let data: Vec<u8> = (0..3000u32).map(|i| (i % 199) as u8).collect();
    vol.write("/chain.bin", &data).unwrap();
    assert_eq!(vol.read("/chain.bin").unwrap(), data);
}

#[test]
fn empty_file() {
    let mut vol = mounted();
    vol.write("/empty", b"").unwrap();
    assert!(vol.exists("/empty").unwrap());
    assert_eq!(vol.read("/empty").unwrap(), b"");
    assert_eq!(vol.stat("/empty").unwrap().size, 0);
}

#[test]
fn overwrite_shrinks_file() {
    let mut vol = mounted();
    vol.write("/note.txt", &[0xAAu8; 10_000]).unwrap();
    vol.write("/note.txt", b"short").unwrap();
    assert_eq!(vol.read("/note.txt").unwrap(), b"short");
    assert_eq!(vol.stat("/note.txt").unwrap().size, 5);
}

#[test]
fn append_concatenates() {
    let mut vol = mounted();
    vol.write("/log.txt", b"Hello ").unwrap();
    vol.append("/log.txt", b"World").unwrap();
    assert_eq!(vol.read("/log.txt").unwrap(), b"Hello World");
}

#[test]
fn append_creates_missing_file() {
    let mut vol = mounted();
    vol.append("/fresh.txt", b"first").unwrap();
    assert_eq!(vol.read("/fresh.txt").unwrap(), b"first");
}

#[test]
fn append_across_cluster_boundary() {
    let mut vol = Fat32Volume::mount(small_cluster_disk()).unwrap();
    vol.write("/grow.bin", &[1u8; 500]).unwrap();
    vol.append("/grow.bin", &[2u8; 500]).unwrap();
    let back = vol.read("/grow.bin").unwrap();
    assert_eq!(back.len(), 1000);
    assert!(back[..500].iter().all(|&b| b == 1));
    assert!(back[500..].iter().all(|&b| b == 2));
}

#[test]
fn lfn_lengths_round_trip_exactly() {
    // Boundary lengths around the 13-character LFN fragment size.
    let mut vol = mounted();
    for len in [1usize, 13, 14, 26, 27] {
        let name: String = (0..len)
            .map(|i| char::from(b'a' + (i % 26) as u8))
            .collect();
        let path = format!("/{name}");
        vol.write(&path, name.as_bytes()).unwrap();
        let listing = vol.list_dir("/").unwrap();
        assert!(
            listing.iter().any(|e| e.name == name),
            "name of length {len} did not round-trip: {listing:?}"
        );
        assert_eq!(vol.read(&path).unwrap(), name.as_bytes());
    }
}

#[test]
fn max_length_name_round_trips() {
    let mut vol = mounted();
    let name: String = (0..255).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
    let path = format!("/{name}");
    vol.write(&path, b"payload").unwrap();
    let listing = vol.list_dir("/").unwrap();
    assert!(listing.iter().any(|e| e.name == name));
    assert_eq!(vol.read(&path).unwrap(), b"payload");
}

#[test]
fn long_name_run_spans_clusters() {
    // 1-sector clusters hold 16 directory slots; a 255-character name
    // needs 21, forcing the run across the cluster chain.
    let mut vol = Fat32Volume::mount(small_cluster_disk()).unwrap();
    let name: String = (0..255).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
    vol.write(&format!("/{name}"), b"x").unwrap();
    let listing = vol.list_dir("/").unwrap();
    assert!(listing.iter().any(|e| e.name == name));
}

#[test]
fn lookup_is_case_insensitive() {
    let mut vol = mounted();
    vol.write("/MiXeD case NAME.txt", b"1").unwrap();
    assert!(vol.exists("/mixed CASE name.TXT").unwrap());
    assert_eq!(vol.read("/MIXED CASE NAME.TXT").unwrap(), b"1");
}

#[test]
fn short_name_collisions_get_distinct_tails() {
    let mut vol = mounted();
    vol.write("/long shared prefix one.txt", b"one").unwrap();
    vol.write("/long shared prefix two.txt", b"two").unwrap();
    assert_eq!(vol.read("/long shared prefix one.txt").unwrap(), b"one");
    assert_eq!(vol.read("/long shared prefix two.txt").unwrap(), b"two");
    let listing = vol.list_dir("/").unwrap();
    assert_eq!(listing.len(), 2);
}

#[test]
fn mkdir_and_list_parent() {
    let mut vol = mounted();
    vol.mkdir("/projects").unwrap();
    let listing = vol.list_dir("/").unwrap();
    let entry = listing.iter().find(|e| e.name == "projects").unwrap();
    assert!(entry.is_dir);
}

#[test]
fn mkdir_twice_fails() {
    let mut vol = mounted();
    vol.mkdir("/d").unwrap();
    assert_eq!(vol.mkdir("/d"), Err(FsError::Exists));
}

#[test]
fn new_directory_has_dot_entries() {
    let mut vol = mounted();
    vol.mkdir("/d").unwrap();
    let listing = vol.list_dir("/d").unwrap();
    let names: Vec<&str> = listing.iter().map(|e| e.name.as_str()).collect();
    assert!(names.contains(&"."));
    assert!(names.contains(&".."));
}

#[test]
fn nested_directories_and_files() {
    let mut vol = mounted();
    vol.mkdir("/a").unwrap();
    vol.mkdir("/a/b").unwrap();
    vol.write("/a/b/deep.txt", b"deep").unwrap();
    assert_eq!(vol.read("/a/b/deep.txt").unwrap(), b"deep");
    assert!(vol.exists("/a/b").unwrap());
    let stat = vol.stat("/a/b/deep.txt").unwrap();
    assert_eq!(stat.size, 4);
    assert!(!stat.is_dir);
}

#[test]
fn path_through_file_is_not_directory() {
    let mut vol = mounted();
    vol.write("/plain.txt", b"x").unwrap();
    assert_eq!(
        vol.read("/plain.txt/inner"),
        Err(FsError::NotDirectory)
    );
}

#[test]
fn rename_file_keeps_content() {
    let mut vol = mounted();
    vol.write("/old.txt", b"payload").unwrap();
    vol.rename("/old.txt", "/new.txt").unwrap();
    assert_eq!(vol.read("/new.txt").unwrap(), b"payload");
    assert!(!vol.exists("/old.txt").unwrap());
}

#[test]
fn rename_into_subdirectory() {
    let mut vol = mounted();
    vol.mkdir("/dst").unwrap();
    vol.write("/f.txt", b"move me").unwrap();
    vol.rename("/f.txt", "/dst/f.txt").unwrap();
    assert_eq!(vol.read("/dst/f.txt").unwrap(), b"move me");
    assert!(!vol.exists("/f.txt").unwrap());
}

#[test]
fn rename_refuses_existing_destination() {
    let mut vol = mounted();
    vol.write("/a", b"1").unwrap();
    vol.write("/b", b"2").unwrap();
    assert_eq!(vol.rename("/a", "/b"), Err(FsError::Exists));
    assert_eq!(vol.read("/b").unwrap(), b"2");
}

#[test]
fn rename_directory_across_parents_fails() {
    let mut vol = mounted();
    vol.mkdir("/src").unwrap();
    vol.mkdir("/dst").unwrap();
    assert!(vol.rename("/src", "/dst/src").is_err());
    assert!(vol.exists("/src").unwrap());
}

#[test]
fn delete_file() {
    let mut vol = mounted();
    vol.write("/gone.txt", b"x").unwrap();
    vol.remove("/gone.txt").unwrap();
    assert!(!vol.exists("/gone.txt").unwrap());
    assert_eq!(vol.read("/gone.txt"), Err(FsError::NotFound));
}

#[test]
fn delete_long_name_removes_all_entries() {
    let mut vol = mounted();
    vol.write("/a rather long file name.txt", b"x").unwrap();
    vol.remove("/a rather long file name.txt").unwrap();
    assert!(vol.list_dir("/").unwrap().is_empty());
}

#[test]
fn delete_nonempty_directory_fails_and_preserves_contents() {
    let mut vol = mounted();
    vol.mkdir("/keep").unwrap();
    vol.write("/keep/inner.txt", b"still here").unwrap();
    assert_eq!(vol.remove("/keep"), Err(FsError::NotEmpty));
    assert_eq!(vol.read("/keep/inner.txt").unwrap(), b"still here");

    vol.remove("/keep/inner.txt").unwrap();
    vol.remove("/keep").unwrap();
    assert!(!vol.exists("/keep").unwrap());
}

#[test]
fn deleted_space_is_reused() {
    let mut vol = Fat32Volume::mount(small_cluster_disk()).unwrap();
    vol.write("/a.bin", &[1u8; 4096]).unwrap();
    vol.remove("/a.bin").unwrap();
    // The freed chain must be allocatable again.
    vol.write("/b.bin", &[2u8; 4096]).unwrap();
    assert_eq!(vol.read("/b.bin").unwrap(), vec![2u8; 4096]);
}

#[test]
fn copy_file() {
    let mut vol = mounted();
    vol.write("/a.txt", &[1, 2, 3]).unwrap();
    vol.copy("/a.txt", "/b.txt").unwrap();
    assert_eq!(vol.stat("/b.txt").unwrap().size, 3);
    assert_eq!(vol.read("/b.txt").unwrap(), vec![1, 2, 3]);
    assert_eq!(vol.read("/a.txt").unwrap(), vec![1, 2, 3]);
}

#[test]
fn copy_directory_fails() {
    let mut vol = mounted();
    vol.mkdir("/d").unwrap();
    assert_eq!(vol.copy("/d", "/e"), Err(FsError::IsDirectory));
}

#[test]
fn move_file_between_directories() {
    let mut vol = mounted();
    vol.mkdir("/inbox").unwrap();
    vol.write("/msg.txt", b"mail").unwrap();
    vol.rename_or_move("/msg.txt", "/inbox/msg.txt").unwrap();
    assert_eq!(vol.read("/inbox/msg.txt").unwrap(), b"mail");
    assert!(!vol.exists("/msg.txt").unwrap());
}

#[test]
fn stat_root() {
    let mut vol = mounted();
    let root = vol.stat("/").unwrap();
    assert!(root.is_dir);
    assert_eq!(root.name, "/");
}

#[test]
fn listing_sorts_size_ascending_dirs_first() {
    let mut vol = mounted();
    vol.mkdir("/dir2").unwrap();
    vol.write("/file1.txt", &[0u8; 10]).unwrap();
    vol.write("/file2.md", &[0u8; 5]).unwrap();
    let mut listing = vol.list_dir("/").unwrap();
    sort_entries(&mut listing, SortMode::Size, SortOrder::Ascending);
    let names: Vec<&str> = listing.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, ["dir2", "file2.md", "file1.txt"]);
}

#[test]
fn many_files_extend_directory() {
    // Enough entries to outgrow the root directory's first cluster.
    let mut vol = Fat32Volume::mount(small_cluster_disk()).unwrap();
    for i in 0..40 {
        vol.write(&format!("/F{i:03}.TXT"), &[i as u8]).unwrap();
    }
    let listing = vol.list_dir("/").unwrap();
    assert_eq!(listing.len(), 40);
    for i in 0..40 {
        assert_eq!(vol.read(&format!("/F{i:03}.TXT")).unwrap(), vec![i as u8]);
    }
}
