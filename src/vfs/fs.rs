//! Path-based filesystem operations over the directory tree, disk cache and
//! erasure bridge.
//!
//! This is also the synchronization core: a single lock guards the tree, the
//! dirty list and the versioning memo for the whole of every mutating
//! operation, remote round-trips included. Object-store latency dominates, so
//! coarse serialization is the simplest correct discipline here.

use crate::cadapter::client::ObjectStore;
use crate::cache::DiskCache;
use crate::codec::bridge::{self, FragmentRef};
use crate::codec::{ErasurePolicy, FragmentCodec};
use crate::tree::versions::{self, DeleteMarkerVisibility, VERSION_GROUP_PREFIX};
use crate::tree::{Completeness, DIR_SIZE, DirTree, NodeId, TreeNode, VersioningCache};
use crate::vfs::error::FsError;
use log::{debug, warn};
use std::io::SeekFrom;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

/// Listing ceiling for bucket/prefix reconciliation.
const MAX_LIST_KEYS: i32 = 10_000;
/// Listing ceiling for per-object version enumeration.
const MAX_VERSION_KEYS: i32 = 1_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    File,
    Dir,
}

#[derive(Clone, Debug)]
pub struct FileAttr {
    pub kind: FileType,
    pub size: u64,
    pub modified: SystemTime,
}

#[derive(Clone, Debug)]
pub struct DirEntry {
    pub name: String,
    pub kind: FileType,
}

/// Construction-time options, fixed for the process lifetime.
#[derive(Debug, Clone)]
pub struct FsOptions {
    pub cache_root: PathBuf,
    pub staging_root: PathBuf,
    /// Erasure-encode flushed files instead of uploading them whole.
    pub encode: bool,
    pub policy: ErasurePolicy,
    pub delete_markers: DeleteMarkerVisibility,
}

struct FsState {
    tree: DirTree,
    cache: DiskCache,
    versioning: VersioningCache,
}

pub struct ObjectFs<S, C> {
    store: S,
    codec: C,
    options: FsOptions,
    state: Mutex<FsState>,
}

fn norm_path(p: &str) -> String {
    let parts: Vec<&str> = p.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", parts.join("/"))
}

/// Split a logical path into its bucket and the listing prefix below it. The
/// prefix carries a trailing slash so the store only matches keys strictly
/// under the path, directory-style.
fn split_bucket(path: &str) -> (String, Option<String>) {
    let trimmed = path.trim_matches('/');
    match trimmed.split_once('/') {
        Some((bucket, rest)) => (bucket.to_string(), Some(format!("{rest}/"))),
        None => (trimmed.to_string(), None),
    }
}

/// Sidecar body: a leading tag word, then the decimal size.
fn parse_sidecar_size(body: &str) -> Option<i64> {
    let mut fields = body.split_whitespace();
    fields.next()?;
    fields.next()?.parse().ok()
}

fn attr_of(node: &TreeNode) -> FileAttr {
    if node.info.size == DIR_SIZE {
        FileAttr {
            kind: FileType::Dir,
            size: 0,
            modified: node.info.modified,
        }
    } else {
        FileAttr {
            kind: FileType::File,
            size: node.info.size.max(0) as u64,
            modified: node.info.modified,
        }
    }
}

impl<S, C> ObjectFs<S, C>
where
    S: ObjectStore,
    C: FragmentCodec,
{
    pub fn new(store: S, codec: C, options: FsOptions) -> Self {
        let cache = DiskCache::new(&options.cache_root);
        Self {
            store,
            codec,
            options,
            state: Mutex::new(FsState {
                tree: DirTree::new(),
                cache,
                versioning: VersioningCache::new(),
            }),
        }
    }

    // ===== resolution and reconciliation =====

    /// Walk the tree for `path`, reconciling against a remote listing when a
    /// level is missing or the final node lacks child-listing completeness.
    /// Reconciliation runs at most once per call; a miss after it means the
    /// path genuinely does not exist.
    async fn resolve(
        &self,
        st: &mut FsState,
        path: &str,
        require_complete: bool,
    ) -> Result<Option<NodeId>, FsError> {
        if st.tree.is_empty() {
            let buckets = self.store.list_buckets().await?;
            st.tree.populate_buckets(&buckets);
        }
        let mut found = st.tree.lookup(path);
        let needs_listing = match found {
            None => true,
            Some(id) => {
                require_complete && !st.tree.node(id).complete.contains(Completeness::NODE)
            }
        };
        if needs_listing && path != "/" {
            let merged = self.reconcile(st, path).await?;
            if merged > 0 {
                found = st.tree.lookup(path);
            }
        }
        Ok(found)
    }

    /// One listing pass scoped to `path`, merged into the tree.
    async fn reconcile(&self, st: &mut FsState, path: &str) -> Result<usize, FsError> {
        let (bucket, prefix) = split_bucket(path);
        debug!("reconcile {path}: bucket={bucket} prefix={prefix:?}");
        let listing = self
            .store
            .list_objects(&bucket, prefix.as_deref(), MAX_LIST_KEYS)
            .await?;
        if listing.is_empty() {
            return Ok(0);
        }
        let count = listing.len();
        let sidecars = st.tree.merge_objects(path, &listing);
        for sidecar in sidecars {
            if let Err(e) = self.fix_sidecar(st, sidecar).await {
                warn!("sidecar fixup under {path} failed: {e}");
            }
        }
        Ok(count)
    }

    /// A sidecar object encodes its parent's true logical size. Pull the
    /// sidecar into the cache, parse the size, promote the parent to a
    /// fragment-group file node and drop the sidecar's cache copy again.
    async fn fix_sidecar(&self, st: &mut FsState, sidecar: NodeId) -> Result<(), FsError> {
        let Some(parent) = st.tree.parent_of(sidecar) else {
            return Ok(());
        };
        let meta_path = st.tree.path_of(sidecar);
        let parent_path = st.tree.path_of(parent);

        // a plaintext cached copy of the logical file is authoritative
        let parent_cached = st.cache.cached_path(&parent_path);
        if let Ok(meta) = fs::metadata(&parent_cached).await {
            if meta.is_file() {
                let node = st.tree.node_mut(parent);
                node.info.size = meta.len() as i64;
                node.is_file = true;
                return Ok(());
            }
        }

        self.fetch_path(st, &meta_path).await?;
        let cached = st.cache.cached_path(&meta_path);
        let body = fs::read_to_string(&cached).await?;
        let size = parse_sidecar_size(&body).ok_or_else(|| {
            FsError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("sidecar {meta_path} carries no size field"),
            ))
        })?;
        let node = st.tree.node_mut(parent);
        node.info.size = size;
        node.is_file = true;
        st.cache.remove_cached(&meta_path).await?;
        debug!("sidecar fixup: {parent_path} is a fragment group of {size} bytes");
        Ok(())
    }

    // ===== versioning =====

    /// Synthesize `.versions-<name>` groups for the file children of `dir`.
    /// The owning bucket's versioning state is memoized for the process
    /// lifetime; unversioned buckets return immediately.
    async fn ensure_versions(
        &self,
        st: &mut FsState,
        dir: NodeId,
        path: &str,
    ) -> Result<(), FsError> {
        let (bucket, _) = split_bucket(path);
        if bucket.is_empty() {
            return Ok(());
        }
        let state = match st.versioning.get(&bucket) {
            Some(state) => state,
            None => {
                let state = self.store.get_bucket_versioning(&bucket).await?;
                st.versioning.insert(&bucket, state);
                state
            }
        };
        if !state.is_versioned() || !st.tree.has_children(dir) {
            return Ok(());
        }
        st.tree.node_mut(dir).complete.insert(Completeness::VERSIONS);

        let pending: Vec<NodeId> = st
            .tree
            .children(dir)
            .into_iter()
            .filter(|&c| {
                let node = st.tree.node(c);
                node.is_file && !node.complete.contains(Completeness::VERSIONS)
            })
            .collect();

        for child in pending {
            let child_name = st.tree.node(child).name.clone();
            let child_key = st
                .tree
                .path_of(child)
                .trim_start_matches('/')
                .split_once('/')
                .map(|(_, rest)| rest.to_string())
                .unwrap_or_default();
            let group = versions::prepare_version_group(&mut st.tree, dir, &child_name);

            let fragment_children = st.tree.children(child);
            let mut sidecars = Vec::new();
            if fragment_children.is_empty() {
                let listing = self
                    .store
                    .list_object_versions(&bucket, Some(&child_key), MAX_VERSION_KEYS)
                    .await?;
                if !listing.is_empty() {
                    sidecars.extend(versions::merge_version_listing(
                        &mut st.tree,
                        group,
                        child,
                        &listing,
                        self.options.delete_markers,
                    ));
                }
            } else {
                for fragment in fragment_children {
                    let fragment_key =
                        format!("{child_key}/{}", st.tree.node(fragment).name);
                    let listing = self
                        .store
                        .list_object_versions(&bucket, Some(&fragment_key), MAX_VERSION_KEYS)
                        .await?;
                    if !listing.is_empty() {
                        sidecars.extend(versions::merge_version_listing(
                            &mut st.tree,
                            group,
                            child,
                            &listing,
                            self.options.delete_markers,
                        ));
                    }
                }
            }
            for sidecar in sidecars {
                if let Err(e) = self.fix_sidecar(st, sidecar).await {
                    warn!("version sidecar fixup under {path} failed: {e}");
                }
            }
            st.tree
                .node_mut(child)
                .complete
                .insert(Completeness::VERSIONS);
        }
        Ok(())
    }

    // ===== cache fetch and flush =====

    /// Ensure the cache file for `path` exists and is populated. Version and
    /// fragment nodes substitute their true remote key; fragment groups go
    /// through the decode bridge, everything else is a direct get.
    async fn fetch_path(&self, st: &mut FsState, path: &str) -> Result<(), FsError> {
        let cached = st.cache.ensure_parent(path).await?;
        let Some(node_id) = st.tree.lookup(path) else {
            return Err(FsError::NotFound(path.to_string()));
        };

        let remote_key = {
            let node = st.tree.node(node_id);
            match (&node.remote_name, path.find(VERSION_GROUP_PREFIX)) {
                (Some(remote), Some(pos)) => format!("{}{remote}", &path[..pos]),
                _ => path.to_string(),
            }
        };
        let key = remote_key.trim_start_matches('/').to_string();

        let is_fragment_group =
            st.tree.node(node_id).is_file && st.tree.has_children(node_id);
        if is_fragment_group {
            let fragments: Vec<FragmentRef> = st
                .tree
                .children(node_id)
                .into_iter()
                .map(|c| {
                    let node = st.tree.node(c);
                    FragmentRef {
                        name: node.name.clone(),
                        version_id: node.info.version_id.clone(),
                    }
                })
                .collect();
            bridge::fetch_and_decode(
                &self.store,
                &self.codec,
                &key,
                &fragments,
                &cached,
                &self.options.staging_root,
            )
            .await?;
        } else {
            let version = st.tree.node(node_id).info.version_id.clone();
            self.store
                .get_object(&key, version.as_deref(), &cached)
                .await?;
        }

        if fs::metadata(&cached).await.is_err() {
            return Err(FsError::Io(std::io::Error::other(format!(
                "fetch of {path} produced no cache file"
            ))));
        }
        Ok(())
    }

    /// Upload dirty entries (most recently marked first), optionally through
    /// the erasure encoder, then refresh the tree and shrink the dirty list.
    async fn flush_locked(&self, st: &mut FsState, filter: Option<&str>) -> Result<(), FsError> {
        let targets = st.cache.dirty_lifo(filter);
        for path in targets {
            let cached = st.cache.cached_path(&path);
            let key = path.trim_start_matches('/').to_string();
            if self.options.encode {
                bridge::encode_and_upload(
                    &self.store,
                    &self.codec,
                    &self.options.policy,
                    &key,
                    &cached,
                    &self.options.staging_root,
                )
                .await?;
            } else {
                self.store.put_object(&key, &cached).await?;
            }
            let size = fs::metadata(&cached)
                .await
                .map(|m| m.len() as i64)
                .unwrap_or(DIR_SIZE);
            // a new remote version now exists that cached listings don't know
            st.tree.update_after_flush(&path, size);
            st.cache.remove_dirty(&path);
            debug!("flushed {path} ({size} bytes)");
        }
        Ok(())
    }

    // ===== deletion =====

    async fn delete_path(&self, st: &mut FsState, path: &str) -> Result<(), FsError> {
        if path.contains(VERSION_GROUP_PREFIX) {
            self.delete_through_tree(st, path).await
        } else {
            self.delete_through_store(st, path).await
        }
    }

    /// Deletion inside the synthetic version namespace: the tree already
    /// knows every affected remote object (and its versionId), so no listing
    /// round-trip is needed.
    async fn delete_through_tree(&self, st: &mut FsState, path: &str) -> Result<(), FsError> {
        let Some(node_id) = st.tree.lookup(path) else {
            return Err(FsError::NotFound(path.to_string()));
        };
        let base = match path.find(VERSION_GROUP_PREFIX) {
            Some(pos) => &path[..pos],
            None => path,
        };
        let children = st.tree.children(node_id);
        let targets: Vec<NodeId> = if children.is_empty() {
            vec![node_id]
        } else {
            children
        };
        for target in targets {
            let (key, version) = {
                let node = st.tree.node(target);
                let key = match &node.remote_name {
                    Some(remote) => format!("{base}{remote}"),
                    None => path.to_string(),
                };
                (
                    key.trim_start_matches('/').to_string(),
                    node.info.version_id.clone(),
                )
            };
            self.store.delete_object(&key, version.as_deref()).await?;
        }
        st.tree.remove_subtree(node_id);
        Ok(())
    }

    /// Deletion outside the version namespace: enumerate the live remote
    /// listing under the path, delete every object (and the bucket itself
    /// when the path is a bucket root), then prune the tree subtree.
    async fn delete_through_store(&self, st: &mut FsState, path: &str) -> Result<(), FsError> {
        let (bucket, prefix) = split_bucket(path);
        let listing = self
            .store
            .list_objects(&bucket, prefix.as_deref(), MAX_LIST_KEYS)
            .await?;
        for obj in &listing {
            let key = format!("{bucket}/{}", obj.key);
            self.store.delete_object(&key, None).await?;
        }
        if prefix.is_none() {
            self.store.delete_bucket(&bucket).await?;
        }
        if let Some(node_id) = st.tree.lookup(path) {
            st.tree.remove_subtree(node_id);
        }
        Ok(())
    }

    // ===== operation handlers =====

    /// Attribute lookup: tree first, local cache copy as fallback for files
    /// created locally and not yet flushed.
    pub async fn getattr(&self, path: &str) -> Result<FileAttr, FsError> {
        let path = norm_path(path);
        let mut st = self.state.lock().await;
        if let Some(id) = self.resolve(&mut st, &path, true).await? {
            return Ok(attr_of(st.tree.node(id)));
        }
        let cached = st.cache.cached_path(&path);
        match fs::metadata(&cached).await {
            Ok(meta) => Ok(FileAttr {
                kind: if meta.is_dir() {
                    FileType::Dir
                } else {
                    FileType::File
                },
                size: meta.len(),
                modified: meta.modified().unwrap_or(UNIX_EPOCH),
            }),
            Err(_) => Err(FsError::NotFound(path)),
        }
    }

    /// Directory listing. For versioned buckets this is also where the
    /// synthetic `.versions-*` groups materialize.
    pub async fn readdir(&self, path: &str) -> Result<Vec<DirEntry>, FsError> {
        let path = norm_path(path);
        let mut st = self.state.lock().await;
        let Some(id) = self.resolve(&mut st, &path, true).await? else {
            return Err(FsError::NotFound(path));
        };
        if st.tree.node(id).is_file && !st.tree.has_children(id) {
            return Err(FsError::NotADirectory(path));
        }
        // synthesize version groups for real directories; the synthetic
        // version namespace itself has no further history
        if !st.tree.node(id).is_file && !path.contains(VERSION_GROUP_PREFIX) {
            if let Err(e) = self.ensure_versions(&mut st, id, &path).await {
                warn!("version synthesis under {path} failed: {e}");
            }
        }
        Ok(st
            .tree
            .children(id)
            .into_iter()
            .map(|c| {
                let node = st.tree.node(c);
                DirEntry {
                    name: node.name.clone(),
                    kind: if node.info.size == DIR_SIZE {
                        FileType::Dir
                    } else {
                        FileType::File
                    },
                }
            })
            .collect())
    }

    /// Open for IO: populate the cache copy on first access.
    pub async fn open(&self, path: &str) -> Result<(), FsError> {
        let path = norm_path(path);
        let mut st = self.state.lock().await;
        if !st.cache.is_cached(&path) {
            self.resolve(&mut st, &path, false).await?;
            self.fetch_path(&mut st, &path).await?;
        }
        Ok(())
    }

    /// Offset read from the cache copy, fetching it on miss.
    pub async fn read(&self, path: &str, offset: u64, len: usize) -> Result<Vec<u8>, FsError> {
        let path = norm_path(path);
        let mut st = self.state.lock().await;
        if !st.cache.is_cached(&path) {
            self.resolve(&mut st, &path, false).await?;
            self.fetch_path(&mut st, &path).await?;
        }
        let cached = st.cache.cached_path(&path);
        let mut file = fs::File::open(&cached).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    /// Offset write into the cache copy, marking the path dirty.
    pub async fn write(&self, path: &str, offset: u64, data: &[u8]) -> Result<usize, FsError> {
        let path = norm_path(path);
        let mut st = self.state.lock().await;
        let cached = st.cache.ensure_parent(&path).await?;
        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&cached)
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        st.cache.mark_dirty(&path);
        Ok(data.len())
    }

    /// Create an empty cache-local file (the remote object appears on flush).
    pub async fn create(&self, path: &str) -> Result<(), FsError> {
        let path = norm_path(path);
        let st = self.state.lock().await;
        let cached = st.cache.ensure_parent(&path).await?;
        fs::File::create(&cached).await?;
        Ok(())
    }

    /// Create a directory; a bare top-level segment becomes a remote bucket.
    pub async fn mkdir(&self, path: &str) -> Result<(), FsError> {
        let path = norm_path(path);
        let mut st = self.state.lock().await;
        if st.tree.is_empty() {
            let buckets = self.store.list_buckets().await?;
            st.tree.populate_buckets(&buckets);
        }
        if !path.trim_start_matches('/').contains('/') {
            self.store.create_bucket(path.trim_matches('/')).await?;
        }
        st.tree.mark_directory(&path);
        fs::create_dir_all(st.cache.cached_path(&path)).await?;
        Ok(())
    }

    /// Remove a file: remote objects (or tree-known versions), the tree
    /// subtree, the cached copy and any pending dirty entry.
    pub async fn unlink(&self, path: &str) -> Result<(), FsError> {
        let path = norm_path(path);
        let mut st = self.state.lock().await;
        self.delete_path(&mut st, &path).await?;
        if st.cache.is_cached(&path) {
            fs::remove_file(st.cache.cached_path(&path)).await?;
        }
        st.cache.remove_dirty(&path);
        Ok(())
    }

    /// Remove a directory subtree, remote objects included.
    pub async fn rmdir(&self, path: &str) -> Result<(), FsError> {
        let path = norm_path(path);
        let mut st = self.state.lock().await;
        self.delete_path(&mut st, &path).await?;
        let cached = st.cache.cached_path(&path);
        if fs::metadata(&cached).await.is_ok() {
            fs::remove_dir_all(&cached).await?;
        }
        Ok(())
    }

    /// Truncate the cache copy and queue it for flush.
    pub async fn truncate(&self, path: &str, size: u64) -> Result<(), FsError> {
        let path = norm_path(path);
        let mut st = self.state.lock().await;
        let cached = st.cache.ensure_parent(&path).await?;
        let file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .open(&cached)
            .await?;
        file.set_len(size).await?;
        st.cache.mark_dirty(&path);
        Ok(())
    }

    /// Flush dirty entries matching `path` (or all of them).
    pub async fn flush(&self, path: Option<&str>) -> Result<(), FsError> {
        let filter = path.map(norm_path);
        let mut st = self.state.lock().await;
        self.flush_locked(&mut st, filter.as_deref()).await
    }

    /// Number of paths with unflushed local writes.
    pub async fn dirty_count(&self) -> usize {
        self.state.lock().await.cache.dirty_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cadapter::client::VersioningState;
    use crate::cadapter::memory::MemoryStore;
    use crate::codec::ReedSolomonCodec;
    use std::sync::Arc;

    fn options(root: &std::path::Path, encode: bool) -> FsOptions {
        FsOptions {
            cache_root: root.join("cache"),
            staging_root: root.join("staging"),
            encode,
            policy: ErasurePolicy::default(),
            delete_markers: DeleteMarkerVisibility::Hidden,
        }
    }

    fn fs_over(
        store: &Arc<MemoryStore>,
        root: &std::path::Path,
        encode: bool,
    ) -> ObjectFs<Arc<MemoryStore>, ReedSolomonCodec> {
        let opts = options(root, encode);
        let codec = ReedSolomonCodec::from_policy(&opts.policy);
        ObjectFs::new(store.clone(), codec, opts)
    }

    #[tokio::test]
    async fn resolve_is_idempotent_and_issues_no_extra_listing() {
        let store = Arc::new(MemoryStore::new());
        store.add_bucket("b", VersioningState::Unversioned);
        store.insert_object("b/dir/a.txt", b"hello");
        let tmp = tempfile::tempdir().unwrap();
        let fs = fs_over(&store, tmp.path(), false);

        let entries = fs.readdir("/b").await.unwrap();
        assert!(entries.iter().any(|e| e.name == "dir"));
        assert_eq!(store.stats().list_buckets, 1);
        assert_eq!(store.stats().list_objects, 1);

        let first = fs.getattr("/b/dir/a.txt").await.unwrap();
        let second = fs.getattr("/b/dir/a.txt").await.unwrap();
        assert_eq!(first.kind, FileType::File);
        assert_eq!(first.size, 5);
        assert_eq!(second.size, 5);
        // both lookups were served from the reconciled tree
        assert_eq!(store.stats().list_objects, 1);
        assert_eq!(store.stats().list_buckets, 1);
    }

    #[tokio::test]
    async fn missing_path_reconciles_once_then_reports_not_found() {
        let store = Arc::new(MemoryStore::new());
        store.add_bucket("b", VersioningState::Unversioned);
        let tmp = tempfile::tempdir().unwrap();
        let fs = fs_over(&store, tmp.path(), false);

        let err = fs.getattr("/b/ghost").await.unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);
        assert_eq!(store.stats().list_objects, 1);
    }

    #[tokio::test]
    async fn sidecar_fixup_sets_group_size_and_drops_cache_copy() {
        let store = Arc::new(MemoryStore::new());
        store.add_bucket("b", VersioningState::Unversioned);
        store.insert_object("b/photo.jpg/photo.jpg.0", &[0u8; 2048]);
        store.insert_object("b/photo.jpg/photo.jpg.1", &[1u8; 2048]);
        store.insert_object("b/photo.jpg/photo.jpg_meta.txt", b"checksum 4096");
        let tmp = tempfile::tempdir().unwrap();
        let fs = fs_over(&store, tmp.path(), false);

        fs.readdir("/b").await.unwrap();
        let attr = fs.getattr("/b/photo.jpg").await.unwrap();
        assert_eq!(attr.kind, FileType::File);
        assert_eq!(attr.size, 4096);
        // the sidecar's cache copy is gone again
        assert!(
            !tmp.path()
                .join("cache/b/photo.jpg/photo.jpg_meta.txt")
                .exists()
        );
    }

    async fn version_group_names(visibility: DeleteMarkerVisibility) -> Vec<String> {
        let store = Arc::new(MemoryStore::new());
        store.add_bucket("b", VersioningState::Enabled);
        store.insert_object("b/dir/doc.txt", b"first");
        store.insert_delete_marker("b/dir/doc.txt");
        store.insert_object("b/dir/doc.txt", b"second!");
        let tmp = tempfile::tempdir().unwrap();
        let mut opts = options(tmp.path(), false);
        opts.delete_markers = visibility;
        let codec = ReedSolomonCodec::from_policy(&opts.policy);
        let fs = ObjectFs::new(store.clone(), codec, opts);

        let entries = fs.readdir("/b/dir").await.unwrap();
        assert!(entries.iter().any(|e| e.name == ".versions-doc.txt"));
        fs.readdir("/b/dir/.versions-doc.txt")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect()
    }

    #[tokio::test]
    async fn version_synthesis_hides_delete_markers_by_default() {
        let names = version_group_names(DeleteMarkerVisibility::Hidden).await;
        assert_eq!(names, ["0-doc.txt", "1-doc.txt"]);
    }

    #[tokio::test]
    async fn version_synthesis_can_expose_delete_markers() {
        let names = version_group_names(DeleteMarkerVisibility::Visible).await;
        assert_eq!(names, ["0-doc.txt", "1-doc.txt", "2-doc.txt"]);
    }

    #[tokio::test]
    async fn reading_a_version_fetches_those_bytes() {
        let store = Arc::new(MemoryStore::new());
        store.add_bucket("b", VersioningState::Enabled);
        store.insert_object("b/dir/doc.txt", b"first");
        store.insert_object("b/dir/doc.txt", b"second!");
        let tmp = tempfile::tempdir().unwrap();
        let fs = fs_over(&store, tmp.path(), false);

        fs.readdir("/b/dir").await.unwrap();
        // newest version gets index 0, the older one index 1
        let old = fs
            .read("/b/dir/.versions-doc.txt/1-doc.txt", 0, 16)
            .await
            .unwrap();
        assert_eq!(old, b"first");
        let new = fs
            .read("/b/dir/.versions-doc.txt/0-doc.txt", 0, 16)
            .await
            .unwrap();
        assert_eq!(new, b"second!");
    }

    #[tokio::test]
    async fn dirty_flush_round_trip_uploads_once() {
        let store = Arc::new(MemoryStore::new());
        store.add_bucket("b", VersioningState::Unversioned);
        let tmp = tempfile::tempdir().unwrap();
        let fs = fs_over(&store, tmp.path(), false);

        fs.create("/b/notes.txt").await.unwrap();
        fs.write("/b/notes.txt", 0, b"dirty bytes").await.unwrap();
        assert_eq!(fs.dirty_count().await, 1);
        assert_eq!(store.stats().puts, 0);

        fs.flush(Some("/b/notes.txt")).await.unwrap();
        assert_eq!(store.stats().puts, 1);
        assert_eq!(fs.dirty_count().await, 0);
        assert_eq!(store.object_data("b/notes.txt").unwrap(), b"dirty bytes");

        let attr = fs.getattr("/b/notes.txt").await.unwrap();
        assert_eq!(attr.kind, FileType::File);
        assert_eq!(attr.size, 11);
    }

    #[tokio::test]
    async fn rewriting_a_path_keeps_one_dirty_entry() {
        let store = Arc::new(MemoryStore::new());
        store.add_bucket("b", VersioningState::Unversioned);
        let tmp = tempfile::tempdir().unwrap();
        let fs = fs_over(&store, tmp.path(), false);

        fs.write("/b/f", 0, b"one").await.unwrap();
        fs.write("/b/f", 3, b"two").await.unwrap();
        assert_eq!(fs.dirty_count().await, 1);
        fs.flush(None).await.unwrap();
        assert_eq!(store.stats().puts, 1);
        assert_eq!(store.object_data("b/f").unwrap(), b"onetwo");
    }

    #[tokio::test]
    async fn unlink_of_version_group_member_deletes_each_fragment_version() {
        let store = Arc::new(MemoryStore::new());
        store.add_bucket("b", VersioningState::Enabled);
        for _ in 0..2 {
            store.insert_object("b/dir/big.bin/big.bin_k0", &[7u8; 128]);
            store.insert_object("b/dir/big.bin/big.bin_k1", &[8u8; 128]);
            store.insert_object("b/dir/big.bin/big.bin_meta.txt", b"checksum 256");
        }
        let tmp = tempfile::tempdir().unwrap();
        let fs = fs_over(&store, tmp.path(), false);

        fs.readdir("/b/dir").await.unwrap();
        let slots = fs.readdir("/b/dir/.versions-big.bin").await.unwrap();
        assert_eq!(slots.len(), 2);

        let before = store.recorded_deletes().len();
        fs.unlink("/b/dir/.versions-big.bin/0-big.bin").await.unwrap();
        let deletes: Vec<_> = store.recorded_deletes().split_off(before);
        // one delete per fragment child, each pinned to its own version
        assert_eq!(deletes.len(), 3);
        assert!(deletes.iter().all(|(key, version)| {
            key.starts_with("b/dir/big.bin/") && version.is_some()
        }));
        assert!(fs.readdir("/b/dir/.versions-big.bin").await.unwrap().len() == 1);
    }

    #[tokio::test]
    async fn unlink_of_fragment_group_deletes_every_fragment_object() {
        let store = Arc::new(MemoryStore::new());
        store.add_bucket("b", VersioningState::Unversioned);
        store.insert_object("b/photo.jpg/photo.jpg.0", &[0u8; 64]);
        store.insert_object("b/photo.jpg/photo.jpg.1", &[1u8; 64]);
        store.insert_object("b/photo.jpg/photo.jpg_meta.txt", b"checksum 128");
        let tmp = tempfile::tempdir().unwrap();
        let fs = fs_over(&store, tmp.path(), false);

        fs.readdir("/b").await.unwrap();
        fs.unlink("/b/photo.jpg").await.unwrap();
        assert_eq!(store.stats().deletes, 3);
        assert!(store.object_data("b/photo.jpg/photo.jpg.0").is_none());
        let err = fs.getattr("/b/photo.jpg").await.unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);
    }

    #[tokio::test]
    async fn rmdir_of_bucket_root_also_deletes_the_bucket() {
        let store = Arc::new(MemoryStore::new());
        store.add_bucket("b", VersioningState::Unversioned);
        store.insert_object("b/x", b"1");
        store.insert_object("b/y", b"2");
        let tmp = tempfile::tempdir().unwrap();
        let fs = fs_over(&store, tmp.path(), false);

        fs.readdir("/b").await.unwrap();
        fs.rmdir("/b").await.unwrap();
        assert_eq!(store.stats().deletes, 2);
        assert_eq!(store.stats().bucket_deletes, 1);
        assert!(!store.has_bucket("b"));
    }

    #[tokio::test]
    async fn mkdir_of_top_level_segment_creates_a_bucket() {
        let store = Arc::new(MemoryStore::new());
        let tmp = tempfile::tempdir().unwrap();
        let fs = fs_over(&store, tmp.path(), false);

        fs.mkdir("/fresh").await.unwrap();
        assert_eq!(store.stats().bucket_creates, 1);
        assert!(store.has_bucket("fresh"));
        let attr = fs.getattr("/fresh").await.unwrap();
        assert_eq!(attr.kind, FileType::Dir);

        fs.mkdir("/fresh/sub").await.unwrap();
        // no second bucket for a nested directory
        assert_eq!(store.stats().bucket_creates, 1);
    }

    #[tokio::test]
    async fn second_read_is_served_from_cache() {
        let store = Arc::new(MemoryStore::new());
        store.add_bucket("b", VersioningState::Unversioned);
        store.insert_object("b/data", b"cached content");
        let tmp = tempfile::tempdir().unwrap();
        let fs = fs_over(&store, tmp.path(), false);

        fs.readdir("/b").await.unwrap();
        let first = fs.read("/b/data", 0, 64).await.unwrap();
        assert_eq!(first, b"cached content");
        let gets = store.stats().gets;
        let second = fs.read("/b/data", 7, 64).await.unwrap();
        assert_eq!(second, b"content");
        assert_eq!(store.stats().gets, gets);
    }

    #[tokio::test]
    async fn encode_flush_then_cold_read_reconstructs_through_fragments() {
        let store = Arc::new(MemoryStore::new());
        store.add_bucket("b", VersioningState::Unversioned);
        let tmp = tempfile::tempdir().unwrap();
        let fs = fs_over(&store, tmp.path(), true);

        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 241) as u8).collect();
        fs.create("/b/blob.bin").await.unwrap();
        fs.write("/b/blob.bin", 0, &payload).await.unwrap();
        fs.flush(None).await.unwrap();
        // whole object never uploaded, fragments were
        assert!(store.object_data("b/blob.bin").is_none());
        assert!(store.object_data("b/blob.bin/blob.bin_k0").is_some());
        assert!(store.object_data("b/blob.bin/blob.bin_meta.txt").is_some());

        // a fresh process: empty tree, empty cache, same store
        let tmp2 = tempfile::tempdir().unwrap();
        let cold = fs_over(&store, tmp2.path(), true);
        let attr = cold.getattr("/b/blob.bin").await.unwrap();
        assert_eq!(attr.kind, FileType::File);
        assert_eq!(attr.size, payload.len() as u64);
        let read_back = cold.read("/b/blob.bin", 0, payload.len()).await.unwrap();
        assert_eq!(read_back, payload);
    }

    #[tokio::test]
    async fn getattr_falls_back_to_unflushed_cache_files() {
        let store = Arc::new(MemoryStore::new());
        store.add_bucket("b", VersioningState::Unversioned);
        let tmp = tempfile::tempdir().unwrap();
        let fs = fs_over(&store, tmp.path(), false);

        fs.create("/b/local.txt").await.unwrap();
        fs.write("/b/local.txt", 0, b"abc").await.unwrap();
        // not flushed: the tree does not know it, the cache stat answers
        let attr = fs.getattr("/b/local.txt").await.unwrap();
        assert_eq!(attr.kind, FileType::File);
        assert_eq!(attr.size, 3);
    }
}
