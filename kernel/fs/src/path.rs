//! Path splitting.

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::FsError;
use crate::name::MAX_NAME_LEN;

/// Splits an absolute path into its directory components and the final
/// leaf name.
///
/// Accepts redundant slashes. Fails on an empty path, a bare `/` (there
/// is no leaf), or an over-long component.
pub fn split_path(path: &str) -> Result<(Vec<String>, String), FsError> {
    let mut parts: Vec<String> = Vec::new();
    for component in path.split('/') {
        if component.is_empty() {
            continue;
        }
        if component.len() > MAX_NAME_LEN {
            return Err(FsError::InvalidPath);
        }
        parts.push(component.to_string());
    }
    let leaf = parts.pop().ok_or(FsError::InvalidPath)?;
    Ok((parts, leaf))
}
