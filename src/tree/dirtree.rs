//! The lazily-populated directory tree mirroring the remote namespace.
//!
//! Children of a node are kept name-ordered (ascending) in a doubly-linked
//! sibling chain, so search is a linear scan with an early exit and insertion
//! is a splice. All structural edits happen through `DirTree`; the arena
//! guarantees freed subtrees cannot be reached through stale handles held by
//! the tree itself.

use crate::cadapter::client::{BucketInfo, ObjectInfo};
use crate::codec::META_SUFFIX;
use crate::tree::node::{Arena, Completeness, NodeId, TreeNode};
use log::debug;
use std::cmp::Ordering;

pub struct DirTree {
    arena: Arena,
    root: Option<NodeId>,
}

impl Default for DirTree {
    fn default() -> Self {
        Self::new()
    }
}

/// Path segments, ignoring empty components.
fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

impl DirTree {
    pub fn new() -> Self {
        Self {
            arena: Arena::new(),
            root: None,
        }
    }

    /// True until the first bucket-listing population.
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &TreeNode {
        self.arena.get(id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut TreeNode {
        self.arena.get_mut(id)
    }

    pub fn parent_of(&self, id: NodeId) -> Option<NodeId> {
        self.arena.get(id).parent
    }

    pub fn has_children(&self, id: NodeId) -> bool {
        self.arena.get(id).first_child.is_some()
    }

    /// Child handles in sibling order.
    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut cur = self.arena.get(id).first_child;
        while let Some(c) = cur {
            out.push(c);
            cur = self.arena.get(c).next;
        }
        out
    }

    /// Linear scan of the ordered sibling list; exits early once a name
    /// compares greater than the target.
    pub fn search_child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        let mut cur = self.arena.get(parent).first_child;
        while let Some(id) = cur {
            let node = self.arena.get(id);
            match node.name.as_str().cmp(name) {
                Ordering::Equal => return Some(id),
                Ordering::Less => cur = node.next,
                Ordering::Greater => return None,
            }
        }
        None
    }

    /// Find `name` under `parent` or splice in a fresh node preserving order.
    pub fn find_or_insert_child(&mut self, parent: NodeId, name: &str) -> NodeId {
        let mut prev: Option<NodeId> = None;
        let mut cur = self.arena.get(parent).first_child;
        while let Some(id) = cur {
            let node = self.arena.get(id);
            match node.name.as_str().cmp(name) {
                Ordering::Equal => return id,
                Ordering::Less => {
                    prev = Some(id);
                    cur = node.next;
                }
                Ordering::Greater => break,
            }
        }
        let mut node = TreeNode::new(name);
        node.parent = Some(parent);
        node.prev = prev;
        node.next = cur;
        let id = self.arena.alloc(node);
        match prev {
            Some(p) => self.arena.get_mut(p).next = Some(id),
            None => self.arena.get_mut(parent).first_child = Some(id),
        }
        if let Some(n) = cur {
            self.arena.get_mut(n).prev = Some(id);
        }
        id
    }

    /// Walk existing nodes by exact name match; no insertion, no remote call.
    pub fn lookup(&self, path: &str) -> Option<NodeId> {
        let mut cur = self.root?;
        for seg in segments(path) {
            cur = self.search_child(cur, seg)?;
        }
        Some(cur)
    }

    fn ensure_root(&mut self) -> NodeId {
        match self.root {
            Some(id) => id,
            None => {
                let id = self.arena.alloc(TreeNode::new("/"));
                self.root = Some(id);
                id
            }
        }
    }

    /// Find-or-insert the whole segment chain of `path`, returning the leaf.
    pub fn ensure_path(&mut self, path: &str) -> NodeId {
        let mut cur = self.ensure_root();
        for seg in segments(path) {
            cur = self.find_or_insert_child(cur, seg);
        }
        cur
    }

    /// Absolute slash-separated path of a node ("/" for the root).
    pub fn path_of(&self, id: NodeId) -> String {
        let mut names = Vec::new();
        let mut cur = Some(id);
        while let Some(c) = cur {
            let node = self.arena.get(c);
            if node.parent.is_some() {
                names.push(node.name.clone());
            }
            cur = node.parent;
        }
        if names.is_empty() {
            return "/".to_string();
        }
        names.reverse();
        format!("/{}", names.join("/"))
    }

    /// First population: one child per bucket under a synthetic root, which is
    /// then fully complete (the bucket listing is a single atomic pass).
    pub fn populate_buckets(&mut self, buckets: &[BucketInfo]) {
        let root = self.ensure_root();
        for bucket in buckets {
            let id = self.find_or_insert_child(root, &bucket.name);
            self.arena.get_mut(id).info.modified = bucket.created;
        }
        self.arena.get_mut(root).complete = Completeness::NODE | Completeness::VERSIONS;
        debug!("populated {} buckets", buckets.len());
    }

    /// Merge one scoped listing pass under `path`. Listed keys are relative to
    /// the bucket; the portion of `path` below the bucket is stripped before
    /// the per-segment walk. Returns nodes whose name carries the sidecar
    /// metadata suffix so the caller can run the size fixup.
    pub fn merge_objects(&mut self, path: &str, listing: &[ObjectInfo]) -> Vec<NodeId> {
        let anchor = self.ensure_path(path);
        self.arena.get_mut(anchor).complete.insert(Completeness::NODE);

        let below: Vec<&str> = segments(path).skip(1).collect();
        let below = below.join("/");

        let mut sidecars = Vec::new();
        for obj in listing {
            let rel = if below.is_empty() {
                obj.key.as_str()
            } else {
                obj.key.strip_prefix(below.as_str()).unwrap_or(&obj.key)
            };
            let segs: Vec<&str> = rel.split('/').filter(|s| !s.is_empty()).collect();
            let Some((leaf, dirs)) = segs.split_last() else {
                continue;
            };
            let mut cur = anchor;
            for seg in dirs {
                cur = self.find_or_insert_child(cur, seg);
                let node = self.arena.get_mut(cur);
                node.complete.insert(Completeness::NODE);
                // an existing node's timestamp is only refined forward
                if node.info.modified < obj.modified {
                    node.info.modified = obj.modified;
                }
            }
            cur = self.find_or_insert_child(cur, leaf);
            let node = self.arena.get_mut(cur);
            node.complete.insert(Completeness::NODE);
            node.info.modified = obj.modified;
            node.info.size = obj.size;
            node.is_file = true;
            if leaf.ends_with(META_SUFFIX) {
                sidecars.push(cur);
            }
        }
        debug!(
            "merged {} keys under {path}, {} sidecars",
            listing.len(),
            sidecars.len()
        );
        sidecars
    }

    /// Refresh the tree after a successful upload of `path`: the node is a
    /// file of the given size, and its (and its parent's) version history no
    /// longer reflects the remote state.
    pub fn update_after_flush(&mut self, path: &str, size: i64) {
        let id = self.ensure_path(path);
        let node = self.arena.get_mut(id);
        node.is_file = true;
        if size >= 0 {
            node.info.size = size;
        }
        node.complete.remove(Completeness::VERSIONS);
        if let Some(parent) = self.arena.get(id).parent {
            self.arena
                .get_mut(parent)
                .complete
                .remove(Completeness::VERSIONS);
        }
    }

    /// Record an explicitly created directory (mkdir path).
    pub fn mark_directory(&mut self, path: &str) {
        let id = self.ensure_path(path);
        let node = self.arena.get_mut(id);
        node.is_file = false;
        node.complete.insert(Completeness::NODE);
    }

    /// Delete all children of `id`, keeping the node itself.
    pub fn remove_children(&mut self, id: NodeId) {
        let mut child = self.arena.get(id).first_child;
        while let Some(c) = child {
            let next = self.arena.get(c).next;
            self.free_recursive(c);
            child = next;
        }
        self.arena.get_mut(id).first_child = None;
    }

    /// Unlink `id` from its siblings/parent and free the whole subtree.
    pub fn remove_subtree(&mut self, id: NodeId) {
        let (parent, prev, next) = {
            let node = self.arena.get(id);
            (node.parent, node.prev, node.next)
        };
        if let Some(p) = prev {
            self.arena.get_mut(p).next = next;
        } else if let Some(par) = parent {
            self.arena.get_mut(par).first_child = next;
        }
        if let Some(n) = next {
            self.arena.get_mut(n).prev = prev;
        }
        if self.root == Some(id) {
            self.root = None;
        }
        self.free_recursive(id);
    }

    fn free_recursive(&mut self, id: NodeId) {
        let mut child = self.arena.get(id).first_child;
        while let Some(c) = child {
            let next = self.arena.get(c).next;
            self.free_recursive(c);
            child = next;
        }
        self.arena.free(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::node::DIR_SIZE;
    use std::time::{Duration, UNIX_EPOCH};

    fn t(secs: u64) -> std::time::SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn bucket(name: &str) -> BucketInfo {
        BucketInfo {
            name: name.to_string(),
            created: t(1),
        }
    }

    fn obj(key: &str, size: i64, secs: u64) -> ObjectInfo {
        ObjectInfo {
            key: key.to_string(),
            size,
            modified: t(secs),
        }
    }

    #[test]
    fn siblings_stay_sorted_and_unique() {
        let mut tree = DirTree::new();
        tree.populate_buckets(&[bucket("b")]);
        let b = tree.lookup("/b").unwrap();
        for name in ["zeta", "alpha", "mid", "alpha", "beta"] {
            tree.find_or_insert_child(b, name);
        }
        let names: Vec<String> = tree
            .children(b)
            .into_iter()
            .map(|id| tree.node(id).name.clone())
            .collect();
        assert_eq!(names, ["alpha", "beta", "mid", "zeta"]);
    }

    #[test]
    fn find_or_insert_returns_same_handle() {
        let mut tree = DirTree::new();
        tree.populate_buckets(&[bucket("b")]);
        let b = tree.lookup("/b").unwrap();
        let first = tree.find_or_insert_child(b, "x");
        let second = tree.find_or_insert_child(b, "x");
        assert_eq!(first, second);
        assert_eq!(tree.search_child(b, "x"), Some(first));
        assert_eq!(tree.search_child(b, "missing"), None);
    }

    #[test]
    fn merge_builds_hierarchy_and_marks_complete() {
        let mut tree = DirTree::new();
        tree.populate_buckets(&[bucket("b")]);
        tree.merge_objects(
            "/b",
            &[
                obj("dir/a.txt", 3, 10),
                obj("dir/sub/b.txt", 5, 20),
                obj("top.txt", 7, 5),
            ],
        );
        let dir = tree.lookup("/b/dir").unwrap();
        assert!(tree.node(dir).complete.contains(Completeness::NODE));
        assert!(!tree.node(dir).is_file);
        assert_eq!(tree.node(dir).info.size, DIR_SIZE);
        // intermediate timestamps refine to the newest key below them
        assert_eq!(tree.node(dir).info.modified, t(20));

        let leaf = tree.lookup("/b/dir/sub/b.txt").unwrap();
        assert!(tree.node(leaf).is_file);
        assert_eq!(tree.node(leaf).info.size, 5);
        assert_eq!(tree.path_of(leaf), "/b/dir/sub/b.txt");
    }

    #[test]
    fn merge_is_idempotent_and_monotonic() {
        let mut tree = DirTree::new();
        tree.populate_buckets(&[bucket("b")]);
        let listing = [obj("dir/a.txt", 3, 10)];
        tree.merge_objects("/b/dir", &listing);
        let dir = tree.lookup("/b/dir").unwrap();
        let leaf = tree.lookup("/b/dir/a.txt").unwrap();
        tree.merge_objects("/b/dir", &listing);
        assert_eq!(tree.lookup("/b/dir"), Some(dir));
        assert_eq!(tree.lookup("/b/dir/a.txt"), Some(leaf));
        assert!(tree.node(dir).complete.contains(Completeness::NODE));
        assert_eq!(tree.children(dir).len(), 1);
    }

    #[test]
    fn merge_detects_sidecars() {
        let mut tree = DirTree::new();
        tree.populate_buckets(&[bucket("b")]);
        let sidecars = tree.merge_objects(
            "/b",
            &[
                obj("photo.jpg/photo.jpg_k0", 2048, 10),
                obj("photo.jpg/photo.jpg_k1", 2048, 10),
                obj("photo.jpg/photo.jpg_meta.txt", 13, 10),
            ],
        );
        assert_eq!(sidecars.len(), 1);
        assert_eq!(tree.node(sidecars[0]).name, "photo.jpg_meta.txt");
        let group = tree.lookup("/b/photo.jpg").unwrap();
        assert_eq!(tree.children(group).len(), 3);
    }

    #[test]
    fn flush_update_clears_version_completeness_only() {
        let mut tree = DirTree::new();
        tree.populate_buckets(&[bucket("b")]);
        tree.merge_objects("/b/dir", &[obj("dir/a.txt", 3, 10)]);
        let dir = tree.lookup("/b/dir").unwrap();
        let leaf = tree.lookup("/b/dir/a.txt").unwrap();
        tree.node_mut(dir).complete.insert(Completeness::VERSIONS);
        tree.node_mut(leaf).complete.insert(Completeness::VERSIONS);

        tree.update_after_flush("/b/dir/a.txt", 42);
        assert_eq!(tree.node(leaf).info.size, 42);
        assert!(!tree.node(leaf).complete.contains(Completeness::VERSIONS));
        assert!(!tree.node(dir).complete.contains(Completeness::VERSIONS));
        // child-listing completeness survives the invalidation
        assert!(tree.node(dir).complete.contains(Completeness::NODE));
        assert!(tree.node(leaf).complete.contains(Completeness::NODE));
    }

    #[test]
    fn remove_subtree_unlinks_middle_sibling() {
        let mut tree = DirTree::new();
        tree.populate_buckets(&[bucket("b")]);
        let b = tree.lookup("/b").unwrap();
        tree.find_or_insert_child(b, "a");
        let mid = tree.find_or_insert_child(b, "m");
        tree.find_or_insert_child(b, "z");
        tree.find_or_insert_child(mid, "grandchild");

        tree.remove_subtree(mid);
        let names: Vec<String> = tree
            .children(b)
            .into_iter()
            .map(|id| tree.node(id).name.clone())
            .collect();
        assert_eq!(names, ["a", "z"]);
        assert_eq!(tree.lookup("/b/m"), None);
    }
}
