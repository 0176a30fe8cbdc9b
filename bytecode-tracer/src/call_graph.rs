//! Dynamic call tree of one execution context

use std::collections::HashMap;

use crate::call_tracer::{CallStack, CallStackFrame, CallStackListener};
use crate::state::StateId;
use crate::Result;

/// One function activation in the call tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionNode {
    pub function: u64,
    /// Calls made by this activation: call site and callee node index
    pub calls: Vec<(u64, usize)>,
}

/// Builds the call tree of a single state from its frame push and pop events
#[derive(Debug)]
pub struct CallGraphMonitor {
    state: StateId,
    nodes: Vec<FunctionNode>,
    stack: Vec<usize>,
}

impl CallGraphMonitor {
    /// Start monitoring `state`, replaying the frames already on its stack
    pub fn new(state: StateId, call_stack: &CallStack) -> Self {
        let frames = call_stack.frames();
        let mut monitor = Self {
            state,
            nodes: vec![FunctionNode {
                function: frames[0].function,
                calls: Vec::new(),
            }],
            stack: vec![0],
        };
        for frame in &frames[1..] {
            monitor.push_frame(frame);
        }
        monitor
    }

    fn push_frame(&mut self, frame: &CallStackFrame) {
        let index = self.nodes.len();
        self.nodes.push(FunctionNode {
            function: frame.function,
            calls: Vec::new(),
        });
        if let Some(&caller) = self.stack.last() {
            self.nodes[caller].calls.push((frame.call_site, index));
        }
        self.stack.push(index);
    }

    /// The root activation
    pub fn root(&self) -> &FunctionNode {
        &self.nodes[0]
    }

    pub fn node(&self, index: usize) -> Option<&FunctionNode> {
        self.nodes.get(index)
    }

    /// Current nesting depth, the root included
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Functions ranked by the total number of calls they made, at most `limit`
    pub fn top_callers(&self, limit: usize) -> Vec<(u64, usize)> {
        let mut counts: HashMap<u64, usize> = HashMap::new();
        for node in &self.nodes {
            *counts.entry(node.function).or_default() += node.calls.len();
        }
        let mut ranked: Vec<(u64, usize)> = counts.into_iter().filter(|(_, calls)| *calls > 0).collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked.truncate(limit);
        ranked
    }

    /// Log the top callers
    pub fn report(&self, limit: usize) {
        tracing::info!("Top callers of {} ({} activations):", self.state, self.nodes.len());
        for (function, calls) in self.top_callers(limit) {
            tracing::info!("  {:#x}: {} calls", function, calls);
        }
    }
}

impl CallStackListener for CallGraphMonitor {
    fn on_stack_frame_push(&mut self, state: StateId, _old_top: &CallStackFrame, new_top: &CallStackFrame) -> Result<()> {
        if state == self.state {
            self.push_frame(new_top);
        }
        Ok(())
    }

    fn on_stack_frame_popping(&mut self, state: StateId, _old_top: &CallStackFrame, _new_top: &CallStackFrame) -> Result<()> {
        if state == self.state && self.stack.len() > 1 {
            self.stack.pop();
        }
        Ok(())
    }
}
