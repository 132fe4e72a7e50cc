//! The user-facing node graph: an arena of compile nodes and their wiring.

mod composite;
mod node;

pub use composite::Composite;
pub use node::{CompileNode, SentinelNode};

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::GraphError;

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

/// Stable node identifier.
///
/// Ids are allocated from a process-wide counter, so a node id never
/// collides with another node's, including nodes living in a different
/// graph. This keeps the state manager's per-node keys unambiguous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Reference to one output of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputRef {
    pub node: NodeId,
    pub output: u32,
}

pub(crate) struct NodeEntry {
    pub(crate) behavior: Box<dyn CompileNode>,
    /// One slot per input; each holds at most one source reference.
    pub(crate) inputs: Vec<Option<OutputRef>>,
    pub(crate) output_count: u32,
    /// Back-references: (consumer node, consumer input index). Kept in
    /// one-to-one correspondence with the input slots that point here.
    pub(crate) consumers: Vec<(NodeId, u32)>,
}

/// A directed graph of compile nodes, cycles allowed.
///
/// The graph owns the node behaviors; connectivity and arity live in the
/// per-node entries. Structural mutation is only valid between
/// compilations.
#[derive(Default)]
pub struct Graph {
    nodes: HashMap<NodeId, NodeEntry>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node; its declared arity seeds the entry.
    pub fn insert(&mut self, behavior: Box<dyn CompileNode>) -> NodeId {
        let id = NodeId(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed));
        let entry = NodeEntry {
            inputs: vec![None; behavior.input_count() as usize],
            output_count: behavior.output_count(),
            behavior,
            consumers: Vec::new(),
        };
        self.nodes.insert(id, entry);
        id
    }

    /// Destroy a node, unplugging every consumer input that pointed at it
    /// and removing its own back-references from its sources.
    pub fn remove(&mut self, id: NodeId) {
        let Some(entry) = self.nodes.remove(&id) else { return };
        for (consumer, input) in entry.consumers {
            // A self-loop's consumer entry is the removed node itself.
            if let Some(consumer_entry) = self.nodes.get_mut(&consumer) {
                if let Some(slot) = consumer_entry.inputs.get_mut(input as usize) {
                    if slot.map(|r| r.node) == Some(id) {
                        *slot = None;
                    }
                }
            }
        }
        for source in entry.inputs.into_iter().flatten() {
            if let Some(source_entry) = self.nodes.get_mut(&source.node) {
                source_entry
                    .consumers
                    .retain(|&(consumer, _)| consumer != id);
            }
        }
    }

    /// Connect `src`'s output to `dst`'s input, replacing whatever was
    /// plugged there.
    pub fn connect(
        &mut self,
        src: NodeId,
        src_output: u32,
        dst: NodeId,
        dst_input: u32,
    ) -> Result<(), GraphError> {
        let src_entry = self.entry(src)?;
        if src_output >= src_entry.output_count {
            return Err(GraphError::InvalidArity { node: src, port: src_output });
        }
        let dst_entry = self.entry(dst)?;
        if dst_input as usize >= dst_entry.inputs.len() {
            return Err(GraphError::InvalidArity { node: dst, port: dst_input });
        }

        self.unplug(dst, dst_input);
        self.nodes.get_mut(&dst).expect("checked above").inputs[dst_input as usize] =
            Some(OutputRef { node: src, output: src_output });
        self.nodes
            .get_mut(&src)
            .expect("checked above")
            .consumers
            .push((dst, dst_input));
        Ok(())
    }

    /// Unplug `dst`'s input. No-op when nothing is plugged.
    pub fn disconnect(&mut self, dst: NodeId, input: u32) -> Result<(), GraphError> {
        let entry = self.entry(dst)?;
        if input as usize >= entry.inputs.len() {
            return Err(GraphError::InvalidArity { node: dst, port: input });
        }
        self.unplug(dst, input);
        Ok(())
    }

    /// The source plugged into `dst`'s input, if any.
    pub fn input(&self, dst: NodeId, input: u32) -> Result<Option<OutputRef>, GraphError> {
        let entry = self.entry(dst)?;
        entry
            .inputs
            .get(input as usize)
            .copied()
            .ok_or(GraphError::InvalidArity { node: dst, port: input })
    }

    pub fn input_count(&self, id: NodeId) -> Result<u32, GraphError> {
        Ok(self.entry(id)?.inputs.len() as u32)
    }

    pub fn output_count(&self, id: NodeId) -> Result<u32, GraphError> {
        Ok(self.entry(id)?.output_count)
    }

    /// Append an input slot.
    pub fn add_input(&mut self, id: NodeId) -> Result<(), GraphError> {
        self.entry_mut(id)?.inputs.push(None);
        Ok(())
    }

    /// Drop the last input slot, unplugging it first.
    pub fn remove_input(&mut self, id: NodeId) -> Result<(), GraphError> {
        let count = self.entry(id)?.inputs.len() as u32;
        if count == 0 {
            return Err(GraphError::InvalidArity { node: id, port: 0 });
        }
        self.unplug(id, count - 1);
        self.entry_mut(id)?.inputs.pop();
        Ok(())
    }

    /// Append an output.
    pub fn add_output(&mut self, id: NodeId) -> Result<(), GraphError> {
        self.entry_mut(id)?.output_count += 1;
        Ok(())
    }

    /// Drop the last output, unplugging every consumer that pointed at it
    /// before shrinking.
    pub fn remove_output(&mut self, id: NodeId) -> Result<(), GraphError> {
        let count = self.entry(id)?.output_count;
        if count == 0 {
            return Err(GraphError::InvalidArity { node: id, port: 0 });
        }
        let removed = count - 1;
        let stale: Vec<(NodeId, u32)> = self
            .entry(id)?
            .consumers
            .iter()
            .copied()
            .filter(|&(consumer, input)| {
                self.nodes
                    .get(&consumer)
                    .and_then(|e| e.inputs.get(input as usize).copied().flatten())
                    .map(|r| r.node == id && r.output == removed)
                    .unwrap_or(false)
            })
            .collect();
        for (consumer, input) in stale {
            self.unplug(consumer, input);
        }
        self.entry_mut(id)?.output_count = removed;
        Ok(())
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Clears `dst`'s input slot and the matching back-reference.
    fn unplug(&mut self, dst: NodeId, input: u32) {
        let Some(entry) = self.nodes.get_mut(&dst) else { return };
        let Some(slot) = entry.inputs.get_mut(input as usize) else { return };
        let Some(source) = slot.take() else { return };
        if let Some(source_entry) = self.nodes.get_mut(&source.node) {
            if let Some(pos) = source_entry
                .consumers
                .iter()
                .position(|&(consumer, i)| consumer == dst && i == input)
            {
                source_entry.consumers.swap_remove(pos);
            }
        }
    }

    pub(crate) fn entry(&self, id: NodeId) -> Result<&NodeEntry, GraphError> {
        self.nodes.get(&id).ok_or(GraphError::NodeNotFound(id))
    }

    fn entry_mut(&mut self, id: NodeId) -> Result<&mut NodeEntry, GraphError> {
        self.nodes.get_mut(&id).ok_or(GraphError::NodeNotFound(id))
    }
}
