//! Project-root lookup: the nearest ancestor holding a build or VCS marker.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Marker files/directories, highest priority first.
pub const PROJECT_MARKERS: &[&str] = &[
    ".git",
    "package.json",
    "composer.json",
    "wp-config.php",
    "Gemfile",
    "go.mod",
    "pyproject.toml",
    "Makefile",
    "Cargo.toml",
];

pub struct ProjectResolver {
    markers: Vec<String>,
    cache: RwLock<HashMap<PathBuf, Option<PathBuf>>>,
}

impl Default for ProjectResolver {
    fn default() -> Self {
        Self::with_markers(PROJECT_MARKERS.iter().copied())
    }
}

impl ProjectResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_markers<'a>(markers: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            markers: markers.into_iter().map(String::from).collect(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Walk upward from `start` (inclusive) and return the first directory
    /// containing a marker. The filesystem root itself never counts.
    /// Negative answers are cached the same as positive ones.
    pub fn find_root(&self, start: &Path) -> Option<PathBuf> {
        if start.as_os_str().is_empty() {
            return None;
        }

        if let Ok(cache) = self.cache.read() {
            if let Some(cached) = cache.get(start) {
                return cached.clone();
            }
        }

        let found = self.walk(start);
        if let Ok(mut cache) = self.cache.write() {
            cache.insert(start.to_path_buf(), found.clone());
        }
        found
    }

    fn walk(&self, start: &Path) -> Option<PathBuf> {
        for dir in start.ancestors() {
            // 루트 디렉토리는 검사하지 않음
            if dir.parent().is_none() {
                break;
            }
            if self.markers.iter().any(|marker| dir.join(marker).exists()) {
                tracing::debug!("Project root for {} is {}", start.display(), dir.display());
                return Some(dir.to_path_buf());
            }
        }
        None
    }

    pub fn clear_cache(&self) {
        if let Ok(mut cache) = self.cache.write() {
            cache.clear();
        }
    }

    pub fn clear_cache_for(&self, path: &Path) {
        if let Ok(mut cache) = self.cache.write() {
            cache.remove(path);
        }
    }
}
