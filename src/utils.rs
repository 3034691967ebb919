//! Shared helpers.

use std::path::{Path, PathBuf};

/// Comparable form of a path: surrounding whitespace and trailing `/`
/// removed. `None` when nothing is left (the root collapses to `/`).
pub fn normalize_path(path: &Path) -> Option<PathBuf> {
    let raw = path.to_string_lossy();
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let stripped = trimmed.trim_end_matches('/');
    if stripped.is_empty() {
        return Some(PathBuf::from("/"));
    }
    Some(PathBuf::from(stripped))
}

/// Both paths are known and normalize to the same value.
pub fn same_path(a: Option<&Path>, b: Option<&Path>) -> bool {
    match (a.and_then(normalize_path), b.and_then(normalize_path)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Both paths are known and normalize to different values.
pub fn conflicting_paths(a: Option<&Path>, b: Option<&Path>) -> bool {
    match (a.and_then(normalize_path), b.and_then(normalize_path)) {
        (Some(a), Some(b)) => a != b,
        _ => false,
    }
}
