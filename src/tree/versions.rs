//! Versioning subsystem: the per-bucket versioning-state memo and the merge
//! of remote version listings into synthetic `.versions-<name>` subtrees.

use crate::cadapter::client::{ObjectVersion, VersioningState};
use crate::codec::META_SUFFIX;
use crate::tree::dirtree::DirTree;
use crate::tree::node::{Completeness, NodeId};

/// Name prefix of the synthetic per-file version group nodes.
pub const VERSION_GROUP_PREFIX: &str = ".versions-";

/// How delete markers surface in a synthesized version group.
///
/// The remote listing always reports markers; whether they deserve a tree
/// node is a policy choice. `Hidden` reproduces the historical behavior:
/// markers are skipped and `<index>-<name>` counts real versions only.
/// `Visible` gives every listed entry an index, so markers appear as empty
/// version nodes without colliding with their neighbors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeleteMarkerVisibility {
    #[default]
    Hidden,
    Visible,
}

#[derive(Debug, Clone)]
pub struct VersioningInfo {
    pub bucket: String,
    pub state: VersioningState,
}

/// Bucket versioning states, memoized for the process lifetime. Bucket
/// versioning is assumed immutable for the session; entries are never
/// invalidated.
#[derive(Default)]
pub struct VersioningCache {
    entries: Vec<VersioningInfo>,
}

impl VersioningCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, bucket: &str) -> Option<VersioningState> {
        self.entries
            .iter()
            .find(|e| e.bucket == bucket)
            .map(|e| e.state)
    }

    pub fn insert(&mut self, bucket: &str, state: VersioningState) {
        if self.get(bucket).is_none() {
            self.entries.push(VersioningInfo {
                bucket: bucket.to_string(),
                state,
            });
        }
    }
}

/// Find-or-create the `.versions-<name>` group as a sibling of the file
/// (child of the containing directory), dropping stale children from any
/// previous pass. The group itself is fully complete once rebuilt.
pub fn prepare_version_group(tree: &mut DirTree, dir: NodeId, child_name: &str) -> NodeId {
    let group_name = format!("{VERSION_GROUP_PREFIX}{child_name}");
    let group = tree.find_or_insert_child(dir, &group_name);
    if tree.has_children(group) {
        tree.remove_children(group);
    }
    tree.node_mut(group).complete = Completeness::NODE | Completeness::VERSIONS;
    group
}

/// Merge one remote version listing into `group`.
///
/// `child` is the live file node the history belongs to. When the child is a
/// fragment group, this is called once per fragment with that fragment's
/// listing; version slots (`<index>-<name>`) are shared across those calls so
/// fragment versions of the same generation land under one slot. Returns the
/// version fragment nodes carrying the sidecar suffix so the caller can run
/// the size fixup on them.
pub fn merge_version_listing(
    tree: &mut DirTree,
    group: NodeId,
    child: NodeId,
    listing: &[ObjectVersion],
    visibility: DeleteMarkerVisibility,
) -> Vec<NodeId> {
    let child_name = tree.node(child).name.clone();
    let child_is_group = tree.has_children(child);
    let mut sidecars = Vec::new();
    let mut index = 0usize;

    for entry in listing {
        if entry.delete_marker && visibility == DeleteMarkerVisibility::Hidden {
            continue;
        }
        let slot_name = format!("{index}-{child_name}");
        let slot = tree.find_or_insert_child(group, &slot_name);
        {
            let node = tree.node_mut(slot);
            node.remote_name = Some(child_name.clone());
            node.is_file = true;
        }
        if child_is_group {
            let frag_name = entry
                .key
                .rsplit('/')
                .next()
                .unwrap_or(entry.key.as_str())
                .to_string();
            let frag = tree.find_or_insert_child(slot, &frag_name);
            let node = tree.node_mut(frag);
            node.is_file = true;
            node.info.size = if entry.delete_marker { 0 } else { entry.size };
            node.info.modified = entry.modified;
            node.info.version_id = entry.version_id.clone();
            node.remote_name = Some(format!("{child_name}/{frag_name}"));
            if tree.node(slot).info.modified < entry.modified {
                tree.node_mut(slot).info.modified = entry.modified;
            }
            if frag_name.ends_with(META_SUFFIX) {
                sidecars.push(frag);
            }
        } else {
            let node = tree.node_mut(slot);
            node.info.size = if entry.delete_marker { 0 } else { entry.size };
            node.info.modified = entry.modified;
            node.info.version_id = entry.version_id.clone();
        }
        index += 1;
    }
    sidecars
}
