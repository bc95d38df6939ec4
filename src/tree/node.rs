//! Tree nodes and their arena storage.
//!
//! Nodes are arena-allocated and addressed by stable [`NodeId`] handles;
//! parent/sibling relations are handle fields, so subtree deletion is a
//! bookkeeping exercise rather than a manual free-order problem.

use bitflags::bitflags;
use std::time::{SystemTime, UNIX_EPOCH};

bitflags! {
    /// How far a node's local view reflects the remote store.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Completeness: u8 {
        /// Immediate children fully reflect one remote listing pass.
        const NODE = 1;
        /// Version history is fully populated.
        const VERSIONS = 2;
    }
}

/// Size sentinel meaning "directory / unknown".
pub const DIR_SIZE: i64 = -1;

#[derive(Debug, Clone)]
pub struct FileInfo {
    pub size: i64,
    pub modified: SystemTime,
    pub version_id: Option<String>,
}

impl Default for FileInfo {
    fn default() -> Self {
        Self {
            size: DIR_SIZE,
            modified: UNIX_EPOCH,
            version_id: None,
        }
    }
}

/// Stable handle into the tree arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) usize);

#[derive(Debug)]
pub struct TreeNode {
    /// Path segment, unique among siblings.
    pub name: String,
    pub info: FileInfo,
    /// Leaf object vs. prefix node. A node may be a file and still have
    /// children (fragment group, version group member).
    pub is_file: bool,
    pub complete: Completeness,
    /// True remote key component when it differs from the on-tree name
    /// (version nodes and their fragment children).
    pub remote_name: Option<String>,
    pub(crate) parent: Option<NodeId>,
    pub(crate) first_child: Option<NodeId>,
    pub(crate) prev: Option<NodeId>,
    pub(crate) next: Option<NodeId>,
}

impl TreeNode {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            info: FileInfo::default(),
            is_file: false,
            complete: Completeness::empty(),
            remote_name: None,
            parent: None,
            first_child: None,
            prev: None,
            next: None,
        }
    }
}

enum Slot {
    Occupied(TreeNode),
    Vacant(Option<usize>),
}

/// Slab-style arena with a free list; freed slots are reused.
pub(crate) struct Arena {
    slots: Vec<Slot>,
    free_head: Option<usize>,
}

impl Arena {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
        }
    }

    pub(crate) fn alloc(&mut self, node: TreeNode) -> NodeId {
        match self.free_head {
            Some(idx) => {
                let next_free = match &self.slots[idx] {
                    Slot::Vacant(next) => *next,
                    Slot::Occupied(_) => unreachable!("free list points at occupied slot"),
                };
                self.free_head = next_free;
                self.slots[idx] = Slot::Occupied(node);
                NodeId(idx)
            }
            None => {
                self.slots.push(Slot::Occupied(node));
                NodeId(self.slots.len() - 1)
            }
        }
    }

    pub(crate) fn free(&mut self, id: NodeId) {
        debug_assert!(matches!(self.slots[id.0], Slot::Occupied(_)));
        self.slots[id.0] = Slot::Vacant(self.free_head);
        self.free_head = Some(id.0);
    }

    pub(crate) fn get(&self, id: NodeId) -> &TreeNode {
        match &self.slots[id.0] {
            Slot::Occupied(node) => node,
            Slot::Vacant(_) => panic!("dangling NodeId {}", id.0),
        }
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> &mut TreeNode {
        match &mut self.slots[id.0] {
            Slot::Occupied(node) => node,
            Slot::Vacant(_) => panic!("dangling NodeId {}", id.0),
        }
    }
}
