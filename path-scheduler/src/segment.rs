//! High-level path tree
//!
//! Every path through the bytecode is a sequence of bytecode PC values. The
//! tree stores these sequences as a trie: the children of a segment are keyed
//! by the next bytecode PC observed after it. The first child of a segment
//! continues the path of its parent, while any further child starts a new
//! path with a fresh id.
//!
//! A segment is owned by its parent's children map and by every state
//! positioned on it. The parent link is weak.

use bytecode_tracer::StateId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::arena::{Arena, Handle};
use crate::error::SchedulerError;
use crate::Result;

/// Identifier of one high-level path, never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PathId(pub u64);

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

pub type SegmentId = Handle<PathSegment>;

/// One node of the path tree
#[derive(Debug)]
pub struct PathSegment {
    /// Bytecode PC that led to this segment, zero for a root
    pub hlpc: u64,
    pub path_id: PathId,
    /// Weak link to the segment this one was reached from
    pub parent: Option<SegmentId>,
    children: BTreeMap<u64, SegmentId>,
    states: BTreeSet<StateId>,
}

impl PathSegment {
    /// Successors keyed by bytecode PC
    pub fn children(&self) -> &BTreeMap<u64, SegmentId> {
        &self.children
    }

    pub fn child(&self, hlpc: u64) -> Option<SegmentId> {
        self.children.get(&hlpc).copied()
    }

    /// Low-level states currently positioned on this segment
    pub fn states(&self) -> &BTreeSet<StateId> {
        &self.states
    }
}

/// Arena-backed trie of path segments
#[derive(Debug, Default)]
pub struct PathTree {
    segments: Arena<PathSegment>,
    next_path_id: u64,
}

impl PathTree {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_path_id(&mut self) -> PathId {
        let id = PathId(self.next_path_id);
        self.next_path_id += 1;
        id
    }

    /// Create a root segment on a new path; the caller owns the returned handle
    pub fn create_root(&mut self) -> SegmentId {
        let path_id = self.allocate_path_id();
        self.segments.insert(PathSegment {
            hlpc: 0,
            path_id,
            parent: None,
            children: BTreeMap::new(),
            states: BTreeSet::new(),
        })
    }

    /// The successor of `segment` reached by bytecode PC `hlpc`
    ///
    /// The successor is created on first use. The returned handle is owned by
    /// the parent, callers that keep it must [`retain`](Self::retain) it.
    pub fn next_segment(&mut self, segment: SegmentId, hlpc: u64) -> Result<SegmentId> {
        let parent = self.segment(segment)?;
        if let Some(child) = parent.child(hlpc) {
            return Ok(child);
        }
        let path_id = if parent.children.is_empty() {
            parent.path_id
        } else {
            self.allocate_path_id()
        };
        let child = self.segments.insert(PathSegment {
            hlpc,
            path_id,
            parent: Some(segment),
            children: BTreeMap::new(),
            states: BTreeSet::new(),
        });
        self.segment_mut(segment)?.children.insert(hlpc, child);
        Ok(child)
    }

    /// Look up a live segment
    pub fn get(&self, segment: SegmentId) -> Option<&PathSegment> {
        self.segments.get(segment)
    }

    /// Look up a segment that must be alive
    pub fn segment(&self, segment: SegmentId) -> Result<&PathSegment> {
        self.segments
            .get(segment)
            .ok_or_else(|| SchedulerError::DanglingSegment(segment.to_string()).into())
    }

    fn segment_mut(&mut self, segment: SegmentId) -> Result<&mut PathSegment> {
        self.segments
            .get_mut(segment)
            .ok_or_else(|| SchedulerError::DanglingSegment(segment.to_string()).into())
    }

    /// Take an owning reference
    pub fn retain(&mut self, segment: SegmentId) -> Result<()> {
        if self.segments.retain(segment) {
            Ok(())
        } else {
            Err(SchedulerError::DanglingSegment(segment.to_string()).into())
        }
    }

    /// Drop an owning reference, freeing the segment and the subtrees only it
    /// owned when it was the last one
    pub fn release(&mut self, segment: SegmentId) {
        let mut pending = vec![segment];
        while let Some(segment) = pending.pop() {
            if let Some(freed) = self.segments.release(segment) {
                pending.extend(freed.children.into_values());
            }
        }
    }

    /// Cut the weak link to the parent
    pub fn detach(&mut self, segment: SegmentId) -> Result<()> {
        self.segment_mut(segment)?.parent = None;
        Ok(())
    }

    /// Position a low-level state on `segment`
    pub fn join(&mut self, segment: SegmentId, state: StateId) -> Result<()> {
        self.segment_mut(segment)?.states.insert(state);
        Ok(())
    }

    /// Remove a low-level state from `segment`
    pub fn leave(&mut self, segment: SegmentId, state: StateId) -> Result<()> {
        self.segment_mut(segment)?.states.remove(&state);
        Ok(())
    }

    /// Number of live segments
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_segment_is_idempotent() {
        let mut tree = PathTree::new();
        let root = tree.create_root();

        let a = tree.next_segment(root, 0x10).unwrap();
        let b = tree.next_segment(root, 0x10).unwrap();
        assert_eq!(a, b, "Same bytecode PC must yield the same segment");
        assert_eq!(tree.segment(root).unwrap().children().len(), 1);
    }

    #[test]
    fn test_first_child_inherits_path_id() {
        let mut tree = PathTree::new();
        let root = tree.create_root();
        let root_path = tree.segment(root).unwrap().path_id;

        let first = tree.next_segment(root, 0x10).unwrap();
        let second = tree.next_segment(root, 0x20).unwrap();
        let third = tree.next_segment(root, 0x30).unwrap();

        let paths: Vec<PathId> = [first, second, third]
            .iter()
            .map(|s| tree.segment(*s).unwrap().path_id)
            .collect();
        assert_eq!(paths[0], root_path);
        assert_ne!(paths[1], root_path);
        assert_ne!(paths[2], root_path);
        assert_ne!(paths[1], paths[2], "Every fork gets a fresh path id");

        // Path ids are never reused, even across roots
        let other = tree.create_root();
        assert!(!paths.contains(&tree.segment(other).unwrap().path_id));
    }

    #[test]
    fn test_release_cascades_to_unowned_children() {
        let mut tree = PathTree::new();
        let root = tree.create_root();
        let kept = tree.next_segment(root, 0x10).unwrap();
        let dropped = tree.next_segment(root, 0x20).unwrap();
        let grandchild = tree.next_segment(dropped, 0x30).unwrap();
        tree.retain(kept).unwrap();

        tree.release(root);
        assert!(tree.get(root).is_none());
        assert!(tree.get(dropped).is_none());
        assert!(tree.get(grandchild).is_none());
        assert!(tree.get(kept).is_some(), "A retained child outlives its parent");
        assert_eq!(tree.len(), 1);
        assert!(tree.next_segment(root, 0x40).is_err());
    }

    #[test]
    fn test_join_and_leave() {
        let mut tree = PathTree::new();
        let root = tree.create_root();
        tree.join(root, StateId(1)).unwrap();
        tree.join(root, StateId(2)).unwrap();
        tree.leave(root, StateId(1)).unwrap();

        let states: Vec<StateId> = tree.segment(root).unwrap().states().iter().copied().collect();
        assert_eq!(states, vec![StateId(2)]);
    }
}
