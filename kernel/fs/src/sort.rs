//! Directory listing sort.

use core::cmp::Ordering;

use crate::FsEntry;

/// What to order listings by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortMode {
    /// Case-insensitive name.
    Name,
    /// File size.
    Size,
    /// Extension, then name.
    Type,
}

/// Listing direction. Directories always precede files either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Smallest/first alphabetically first.
    Ascending,
    /// Largest/last alphabetically first.
    Descending,
}

fn cmp_ignore_case(a: &str, b: &str) -> Ordering {
    let a = a.bytes().map(|b| b.to_ascii_lowercase());
    let b = b.bytes().map(|b| b.to_ascii_lowercase());
    a.cmp(b)
}

fn extension(name: &str) -> &str {
    name.rfind('.').map_or("", |i| &name[i + 1..])
}

fn cmp_by_mode(a: &FsEntry, b: &FsEntry, mode: SortMode) -> Ordering {
    match mode {
        SortMode::Name => cmp_ignore_case(&a.name, &b.name),
        SortMode::Size => a.size.cmp(&b.size),
        SortMode::Type => cmp_ignore_case(extension(&a.name), extension(&b.name))
            .then_with(|| cmp_ignore_case(&a.name, &b.name)),
    }
}

/// Stably sorts `entries` in place. Directories come first regardless
/// of `order`; within each group the mode comparison is applied in the
/// requested direction.
pub fn sort_entries(entries: &mut [FsEntry], mode: SortMode, order: SortOrder) {
    entries.sort_by(|a, b| {
        match (a.is_dir, b.is_dir) {
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            _ => {}
        }
        let cmp = cmp_by_mode(a, b, mode);
        match order {
            SortOrder::Ascending => cmp,
            SortOrder::Descending => cmp.reverse(),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;
    use alloc::vec;

    fn entry(name: &str, size: u32, is_dir: bool) -> FsEntry {
        FsEntry {
            name: name.to_string(),
            size,
            is_dir,
        }
    }

    fn names(entries: &[FsEntry]) -> alloc::vec::Vec<&str> {
        entries.iter().map(|e| e.name.as_str()).collect()
    }

    #[test]
    fn size_ascending_dirs_first() {
        let mut entries = vec![
            entry("file1.txt", 10, false),
            entry("file2.md", 5, false),
            entry("dir2", 0, true),
        ];
        sort_entries(&mut entries, SortMode::Size, SortOrder::Ascending);
        assert_eq!(names(&entries), ["dir2", "file2.md", "file1.txt"]);
    }

    #[test]
    fn descending_keeps_dirs_first() {
        let mut entries = vec![
            entry("b.txt", 2, false),
            entry("a", 0, true),
            entry("c.txt", 9, false),
        ];
        sort_entries(&mut entries, SortMode::Size, SortOrder::Descending);
        assert_eq!(names(&entries), ["a", "c.txt", "b.txt"]);
    }

    #[test]
    fn name_sort_is_case_insensitive() {
        let mut entries = vec![
            entry("Zebra", 0, false),
            entry("apple", 0, false),
            entry("Mango", 0, false),
        ];
        sort_entries(&mut entries, SortMode::Name, SortOrder::Ascending);
        assert_eq!(names(&entries), ["apple", "Mango", "Zebra"]);
    }

    #[test]
    fn type_sort_orders_by_extension_then_name() {
        let mut entries = vec![
            entry("b.txt", 0, false),
            entry("a.txt", 0, false),
            entry("z.md", 0, false),
            entry("plain", 0, false),
        ];
        sort_entries(&mut entries, SortMode::Type, SortOrder::Ascending);
        assert_eq!(names(&entries), ["plain", "z.md", "a.txt", "b.txt"]);
    }

    #[test]
    fn sort_is_stable_for_equal_keys() {
        let mut entries = vec![
            entry("first", 7, false),
            entry("second", 7, false),
            entry("third", 7, false),
        ];
        sort_entries(&mut entries, SortMode::Size, SortOrder::Ascending);
        assert_eq!(names(&entries), ["first", "second", "third"]);
    }
}
