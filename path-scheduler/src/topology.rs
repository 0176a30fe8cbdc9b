//! Topological index over native execution positions
//!
//! A position is a pair `(basic_block, call_index)` inside one level of the
//! tree. Levels are sibling chains linked through `next`, kept in strictly
//! increasing position order. A new level hangs below a node through `down`,
//! either for a call made from that position or for a new iteration of a
//! loop. Two states on the same node have executed the same structural
//! prefix and are merge candidates.
//!
//! The `parent` link of a node (its predecessor in the chain, or the node it
//! hangs below) is strong: a live node keeps its whole prefix alive. `next`
//! and `down` are weak and resolve to nothing once the target is freed.

use bytecode_tracer::StateId;
use std::fmt;

use crate::arena::{Arena, Handle};
use crate::error::SchedulerError;
use crate::Result;

pub type NodeId = Handle<TopologicNode>;

/// One position of the topological index
#[derive(Debug)]
pub struct TopologicNode {
    pub parent: Option<NodeId>,
    /// Index of the basic block, `-1` for the head of a level
    pub basic_block: i64,
    /// Number of calls returned from at this basic block
    pub call_index: u32,
    /// Whether the level of this node was opened by a call
    pub is_call_base: bool,
    next: Option<NodeId>,
    down: Option<NodeId>,
    states: Vec<StateId>,
}

impl TopologicNode {
    fn new(parent: Option<NodeId>, basic_block: i64, call_index: u32, is_call_base: bool) -> Self {
        Self {
            parent,
            basic_block,
            call_index,
            is_call_base,
            next: None,
            down: None,
            states: Vec::new(),
        }
    }

    pub fn position(&self) -> (i64, u32) {
        (self.basic_block, self.call_index)
    }

    /// States positioned here, in arrival order
    pub fn states(&self) -> &[StateId] {
        &self.states
    }
}

/// Arena-backed topological tree
#[derive(Debug, Default)]
pub struct TopologicTree {
    nodes: Arena<TopologicNode>,
}

impl TopologicTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the root of a new tree; the caller owns the returned handle
    pub fn create_root(&mut self) -> NodeId {
        self.nodes.insert(TopologicNode::new(None, -1, 0, true))
    }

    pub fn get(&self, node: NodeId) -> Option<&TopologicNode> {
        self.nodes.get(node)
    }

    /// Look up a node that must be alive
    pub fn node(&self, node: NodeId) -> Result<&TopologicNode> {
        self.nodes
            .get(node)
            .ok_or_else(|| SchedulerError::DanglingNode(node.to_string()).into())
    }

    fn node_mut(&mut self, node: NodeId) -> Result<&mut TopologicNode> {
        self.nodes
            .get_mut(node)
            .ok_or_else(|| SchedulerError::DanglingNode(node.to_string()).into())
    }

    /// Take an owning reference
    pub fn retain(&mut self, node: NodeId) -> Result<()> {
        if self.nodes.retain(node) {
            Ok(())
        } else {
            Err(SchedulerError::DanglingNode(node.to_string()).into())
        }
    }

    /// Drop an owning reference, freeing the prefix only this node kept alive
    pub fn release(&mut self, node: NodeId) {
        let mut pending = Some(node);
        while let Some(node) = pending.take() {
            if let Some(freed) = self.nodes.release(node) {
                pending = freed.parent;
            }
        }
    }

    /// Live successor in the chain
    pub fn next_of(&self, node: NodeId) -> Option<NodeId> {
        let next = self.nodes.get(node)?.next?;
        self.nodes.contains(next).then_some(next)
    }

    /// Live head of the level below
    pub fn down_of(&self, node: NodeId) -> Option<NodeId> {
        let down = self.nodes.get(node)?.down?;
        self.nodes.contains(down).then_some(down)
    }

    /// The head of the level below `node`, created on first use
    ///
    /// The returned handle carries a reference owned by the caller.
    pub fn get_down(&mut self, node: NodeId, is_call_base: bool) -> Result<NodeId> {
        if let Some(down) = self.down_of(node) {
            self.retain(down)?;
            return Ok(down);
        }
        self.retain(node)?;
        let down = self.nodes.insert(TopologicNode::new(Some(node), -1, 0, is_call_base));
        self.node_mut(node)?.down = Some(down);
        Ok(down)
    }

    /// The node at `(basic_block, call_index)` in the chain after `node`
    ///
    /// The position must follow the one of `node`. A missing node is spliced
    /// into the chain so that positions stay strictly increasing. The
    /// returned handle carries a reference owned by the caller.
    pub fn get_next(&mut self, node: NodeId, basic_block: i64, call_index: u32) -> Result<NodeId> {
        let this = self.node(node)?;
        let target = (basic_block, call_index);
        if target <= this.position() {
            return Err(SchedulerError::TopologicOrder {
                from_bb: this.basic_block,
                from_ci: this.call_index,
                to_bb: basic_block,
                to_ci: call_index,
            }
            .into());
        }
        let is_call_base = this.is_call_base;

        let mut previous = node;
        let mut current = self.next_of(node);
        while let Some(candidate) = current {
            let position = self.node(candidate)?.position();
            if position == target {
                self.retain(candidate)?;
                return Ok(candidate);
            }
            if target < position {
                // Splice between `previous` and `candidate`
                self.retain(previous)?;
                let spliced = self
                    .nodes
                    .insert(TopologicNode::new(Some(previous), basic_block, call_index, is_call_base));
                self.node_mut(spliced)?.next = Some(candidate);
                self.node_mut(previous)?.next = Some(spliced);
                // The successor now hangs off the spliced node
                self.retain(spliced)?;
                self.node_mut(candidate)?.parent = Some(spliced);
                self.release(previous);
                return Ok(spliced);
            }
            previous = candidate;
            current = self.next_of(candidate);
        }

        self.retain(previous)?;
        let appended = self
            .nodes
            .insert(TopologicNode::new(Some(previous), basic_block, call_index, is_call_base));
        self.node_mut(previous)?.next = Some(appended);
        Ok(appended)
    }

    /// First node of the level containing `node`
    pub fn level_head(&self, node: NodeId) -> Result<NodeId> {
        let mut current = node;
        loop {
            let this = self.node(current)?;
            match this.parent {
                Some(parent) if self.next_of(parent) == Some(current) => current = parent,
                _ => return Ok(current),
            }
        }
    }

    /// Record `state` at `node`, returns the number of states there
    pub fn add_state(&mut self, node: NodeId, state: StateId) -> Result<usize> {
        let node = self.node_mut(node)?;
        if !node.states.contains(&state) {
            node.states.push(state);
        }
        Ok(node.states.len())
    }

    pub fn remove_state(&mut self, node: NodeId, state: StateId) -> Result<()> {
        self.node_mut(node)?.states.retain(|s| *s != state);
        Ok(())
    }

    /// Positions of the chain starting at `node`
    pub fn chain(&self, node: NodeId) -> Vec<(i64, u32)> {
        let mut positions = Vec::new();
        let mut current = Some(node);
        while let Some(node) = current {
            let Some(this) = self.nodes.get(node) else {
                break;
            };
            positions.push(this.position());
            current = self.next_of(node);
        }
        positions
    }

    /// Number of live nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Renders a stack of levels as `[bb:ci/...] [bb:ci/...]`
pub struct IndexDisplay<'a> {
    pub tree: &'a TopologicTree,
    pub index: &'a [NodeId],
}

impl fmt::Display for IndexDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (depth, node) in self.index.iter().enumerate() {
            match self.tree.get(*node) {
                Some(node) => {
                    if node.is_call_base && depth > 0 {
                        write!(f, "] [")?;
                    }
                    write!(f, "{}:{}/", node.basic_block, node.call_index)?;
                }
                None => write!(f, "?/")?,
            }
        }
        write!(f, "]")
    }
}
