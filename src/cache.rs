//! Local disk cache: logical-path to cache-file mapping plus the dirty
//! (to-flush) list.
//!
//! The cache mirrors the logical hierarchy verbatim under a fixed root; no
//! index file exists on disk, so the cache survives restarts while the tree
//! is rebuilt from remote listings.

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;

pub struct DiskCache {
    root: PathBuf,
    // ordered, deduplicated; most recently marked last
    dirty: Vec<String>,
}

impl DiskCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            dirty: Vec::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic cache location of a logical path; no remote call.
    pub fn cached_path(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    pub fn is_cached(&self, path: &str) -> bool {
        self.cached_path(path).exists()
    }

    /// Create the cache-side parent chain and return the cache path.
    pub async fn ensure_parent(&self, path: &str) -> io::Result<PathBuf> {
        let cached = self.cached_path(path);
        if let Some(parent) = cached.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(cached)
    }

    /// Add `path` to the dirty list. Re-marking moves it to the
    /// most-recently-marked position instead of duplicating it.
    pub fn mark_dirty(&mut self, path: &str) {
        self.dirty.retain(|p| p != path);
        self.dirty.push(path.to_string());
    }

    pub fn remove_dirty(&mut self, path: &str) {
        self.dirty.retain(|p| p != path);
    }

    pub fn dirty_len(&self) -> usize {
        self.dirty.len()
    }

    /// Dirty paths matching `filter` (or all), most recently marked first.
    pub fn dirty_lifo(&self, filter: Option<&str>) -> Vec<String> {
        self.dirty
            .iter()
            .rev()
            .filter(|p| filter.is_none_or(|f| f == p.as_str()))
            .cloned()
            .collect()
    }

    /// Remove a cached file and prune its parent directory when that leaves
    /// it empty (sidecar cleanup).
    pub async fn remove_cached(&self, path: &str) -> io::Result<()> {
        let cached = self.cached_path(path);
        match fs::remove_file(&cached).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        }
        if let Some(parent) = cached.parent() {
            // fails while non-empty, which is exactly what we want
            let _ = fs::remove_dir(parent).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cached_path_mirrors_hierarchy() {
        let cache = DiskCache::new("/var/cache/shardfs");
        assert_eq!(
            cache.cached_path("/bucket/dir/file.txt"),
            PathBuf::from("/var/cache/shardfs/bucket/dir/file.txt")
        );
    }

    #[test]
    fn dirty_list_dedups_and_orders_lifo() {
        let mut cache = DiskCache::new("/tmp/x");
        cache.mark_dirty("/b/one");
        cache.mark_dirty("/b/two");
        cache.mark_dirty("/b/one");
        assert_eq!(cache.dirty_len(), 2);
        assert_eq!(cache.dirty_lifo(None), ["/b/one", "/b/two"]);
        assert_eq!(cache.dirty_lifo(Some("/b/two")), ["/b/two"]);

        cache.remove_dirty("/b/one");
        assert_eq!(cache.dirty_lifo(None), ["/b/two"]);
    }

    #[tokio::test]
    async fn remove_cached_prunes_empty_parent() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(tmp.path());
        let file = cache.ensure_parent("/b/group/frag").await.unwrap();
        tokio::fs::write(&file, b"x").await.unwrap();

        cache.remove_cached("/b/group/frag").await.unwrap();
        assert!(!file.exists());
        assert!(!tmp.path().join("b/group").exists());
        assert!(tmp.path().join("b").exists());
    }
}
