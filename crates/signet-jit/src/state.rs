//! Per-node mutable state, cycle state and static memory, with
//! generation-based reclamation against the concurrent audio thread.
//!
//! Buffers whose addresses are baked into a compiled module must outlive
//! that module on the audio thread. The manager therefore never frees
//! anything eagerly: retired buffers and modules go into a *delete
//! sequence* tagged with a compile sequence number, and a delete sequence
//! is only freed once the audio thread has acknowledged a strictly later
//! sequence.

use std::collections::{BTreeMap, HashMap, HashSet};

use signet_ir::{self as ir, FuncBuilder, Linkage, Param, Signature, Type};
use tracing::{debug, warn};

use crate::engine::{ExecutionEngine, ModuleId};
use crate::error::CompileError;
use crate::graph::{CompileNode, Graph, NodeId};

/// Monotonic compile sequence number, the reclamation epoch.
pub type CompileSequence = u32;

/// Builder handed to [`CompileNode::initialize_mutable_state`] hooks.
///
/// Wraps the initialization function under construction together with the
/// module the compilation links against, so hooks can emit calls.
pub struct InitEmitter<'a, 'm> {
    builder: &'a mut FuncBuilder,
    module: &'m ir::Module,
}

impl InitEmitter<'_, '_> {
    /// The instruction builder positioned in the initialization function.
    pub fn ins(&mut self) -> &mut FuncBuilder {
        self.builder
    }

    /// Emit a call into the linked module.
    pub fn call(
        &mut self,
        callee: &str,
        args: &[ir::Value],
    ) -> Result<Option<ir::Value>, CompileError> {
        self.builder
            .call(self.module, callee, args)
            .map_err(|e| match e {
                ir::IrError::MissingSymbol(s) => CompileError::MissingSymbol(s),
                other => CompileError::Ir(other),
            })
    }

    /// Signature of a function in the linked module.
    pub fn signature(&self, name: &str) -> Option<&Signature> {
        self.module.function(name).map(|f| &f.sig)
    }
}

/// State buffers of one node, replicated per instance.
///
/// Lifetime is decoupled from the node itself: created on first compile,
/// destroyed only via a delete sequence once no running program can
/// reference the addresses.
pub(crate) struct NodeState {
    /// `state_size * instance_count` bytes of opaque mutable state.
    data: Box<[u8]>,
    /// One `f32` cycle cell per (output, instance), column-major: the cells
    /// of output `k` occupy `[k * instance_count, (k + 1) * instance_count)`.
    cycle: Box<[f32]>,
    state_size: usize,
    output_count: u32,
    instance_count: usize,
}

impl NodeState {
    fn new(state_size: usize, instance_count: usize, output_count: u32) -> Self {
        Self {
            data: vec![0u8; state_size * instance_count].into_boxed_slice(),
            cycle: vec![0.0; output_count as usize * instance_count].into_boxed_slice(),
            state_size,
            output_count,
            instance_count,
        }
    }

    /// Per-instance mutable-state pointer: `base + instance_num * size`,
    /// typed as a byte pointer. The base address is baked into the IR.
    fn mutable_state_ptr(&self, b: &mut FuncBuilder, instance_num: ir::Value) -> ir::Value {
        let base = b.const_ptr(self.data.as_ptr() as usize, Type::byte_ptr());
        b.gep(base, instance_num, self.state_size as u32)
    }

    /// Per-instance cycle cell pointer for `output`: the column base plus
    /// `instance_num` in `f32` units.
    fn cycle_state_ptr(
        &self,
        b: &mut FuncBuilder,
        instance_num: ir::Value,
        output: u32,
    ) -> ir::Value {
        let column = unsafe {
            self.cycle
                .as_ptr()
                .add(output as usize * self.instance_count)
        };
        let base = b.const_ptr(column as usize, Type::f32_ptr());
        b.gep(base, instance_num, 4)
    }
}

/// Everything retired during one compile sequence, freed together after a
/// later sequence is acknowledged.
#[derive(Default)]
struct DeleteSequence {
    module: Option<ModuleId>,
    states: Vec<NodeState>,
    static_chunks: Vec<Box<[u8]>>,
    cycle_buffers: Vec<Box<[f32]>>,
}

/// Owner of all node state across recompilations.
pub struct StateManager {
    instance_count: usize,
    states: HashMap<NodeId, NodeState>,
    static_chunks: HashMap<NodeId, Box<[u8]>>,
    delete_sequences: BTreeMap<CompileSequence, DeleteSequence>,
    current_sequence: CompileSequence,

    // Per-sequence scratch.
    used_nodes: HashSet<NodeId>,
    new_nodes: Vec<NodeId>,
    used_cycle_cells: HashSet<(NodeId, u32)>,
    init_builder: Option<FuncBuilder>,
    init_new_builder: Option<FuncBuilder>,
}

impl StateManager {
    pub fn new(instance_count: usize, initial_sequence: CompileSequence) -> Self {
        let mut delete_sequences = BTreeMap::new();
        delete_sequences.insert(initial_sequence, DeleteSequence::default());
        Self {
            instance_count,
            states: HashMap::new(),
            static_chunks: HashMap::new(),
            delete_sequences,
            current_sequence: initial_sequence,
            used_nodes: HashSet::new(),
            new_nodes: Vec::new(),
            used_cycle_cells: HashSet::new(),
            init_builder: None,
            init_new_builder: None,
        }
    }

    pub fn instance_count(&self) -> usize {
        self.instance_count
    }

    /// Start a compilation sequence. Restarting without finishing the
    /// previous one cancels it; no partial per-sequence state survives.
    pub fn begin_sequence(&mut self, seq: CompileSequence) {
        self.current_sequence = seq;
        self.used_nodes.clear();
        self.new_nodes.clear();
        self.used_cycle_cells.clear();

        let init_sig = Signature::new(vec![Param::new(Type::I64)], None);
        self.init_builder = Some(FuncBuilder::new(
            "graph__initialize",
            init_sig.clone(),
            Linkage::External,
        ));
        self.init_new_builder = Some(FuncBuilder::new(
            "graph__initialize_new_nodes",
            init_sig,
            Linkage::External,
        ));
    }

    /// Mark `id` used this sequence, creating its state record on first
    /// encounter and resizing the cycle table when the node's output count
    /// changed since the last compilation.
    ///
    /// A resize retires the old cycle buffer into the newest delete
    /// sequence (the running program still holds its address) and copies
    /// the surviving output columns so feedback state is preserved for
    /// unchanged outputs. Cells beyond the new output count are discarded.
    fn get_or_create(&mut self, graph: &Graph, id: NodeId) -> Result<&mut NodeState, CompileError> {
        let entry = graph.entry(id)?;
        let output_count = entry.output_count;

        if !self.states.contains_key(&id) {
            self.states.insert(
                id,
                NodeState::new(
                    entry.behavior.mutable_state_size(),
                    self.instance_count,
                    output_count,
                ),
            );
            self.new_nodes.push(id);
        } else {
            let state = self.states.get_mut(&id).expect("present");
            if state.output_count != output_count {
                debug!(node = %id, old = state.output_count, new = output_count,
                    "resizing cycle state");
                let mut fresh =
                    vec![0.0f32; output_count as usize * self.instance_count].into_boxed_slice();
                let kept = state.output_count.min(output_count) as usize * self.instance_count;
                fresh[..kept].copy_from_slice(&state.cycle[..kept]);
                let old = std::mem::replace(&mut state.cycle, fresh);
                state.output_count = output_count;
                self.newest_delete_sequence().cycle_buffers.push(old);
            }
        }

        self.used_nodes.insert(id);
        Ok(self.states.get_mut(&id).expect("present"))
    }

    /// Emit the per-instance mutable-state pointer for `id` into `b`.
    pub fn mutable_state_ptr(
        &mut self,
        b: &mut FuncBuilder,
        graph: &Graph,
        id: NodeId,
        instance_num: ir::Value,
    ) -> Result<Option<ir::Value>, CompileError> {
        let state = self.get_or_create(graph, id)?;
        if state.state_size == 0 {
            return Ok(None);
        }
        Ok(Some(state.mutable_state_ptr(b, instance_num)))
    }

    /// Emit the per-instance cycle cell pointer for `(id, output)` into
    /// `b`, marking the cell used this sequence.
    pub fn cycle_state_ptr(
        &mut self,
        b: &mut FuncBuilder,
        graph: &Graph,
        id: NodeId,
        output: u32,
        instance_num: ir::Value,
    ) -> Result<ir::Value, CompileError> {
        let state = self.get_or_create(graph, id)?;
        let ptr = state.cycle_state_ptr(b, instance_num, output);
        self.used_cycle_cells.insert((id, output));
        Ok(ptr)
    }

    /// Replace or install the static-memory chunk of a node. The previous
    /// bytes are retired, not freed: a running program may reference them.
    pub fn register_static_memory_chunk(&mut self, id: NodeId, bytes: Vec<u8>) {
        let chunk = bytes.into_boxed_slice();
        if let Some(old) = self.static_chunks.insert(id, chunk) {
            self.newest_delete_sequence().static_chunks.push(old);
        }
    }

    /// Drop a node's static-memory chunk, retiring the bytes.
    pub fn free_static_memory_chunk(&mut self, id: NodeId) {
        match self.static_chunks.remove(&id) {
            Some(old) => self.newest_delete_sequence().static_chunks.push(old),
            // Not an error: the node may never have been given a chunk.
            None => warn!(node = %id, "no static memory chunk to free"),
        }
    }

    /// The chunk's address as a typed pointer constant, or `None` when no
    /// chunk is registered.
    pub fn static_memory_ref(&self, b: &mut FuncBuilder, id: NodeId) -> Option<ir::Value> {
        self.static_chunks
            .get(&id)
            .map(|chunk| b.const_ptr(chunk.as_ptr() as usize, Type::byte_ptr()))
    }

    /// Whether `id` was first seen this sequence.
    fn is_new(&self, id: NodeId) -> bool {
        self.new_nodes.contains(&id)
    }

    /// Append `behavior`'s state-initialization code for `id` to
    /// `graph__initialize`, and to `graph__initialize_new_nodes` when the
    /// node is new this sequence.
    ///
    /// Called by the compiler at the node's single emission site, where the
    /// behavior object is in hand; a node without mutable state, or a
    /// static-memory node without a chunk, contributes nothing.
    pub fn emit_node_init(
        &mut self,
        module: &ir::Module,
        id: NodeId,
        behavior: &dyn CompileNode,
    ) -> Result<(), CompileError> {
        if behavior.mutable_state_size() == 0 {
            return Ok(());
        }
        if behavior.uses_static_memory() && !self.static_chunks.contains_key(&id) {
            return Ok(());
        }

        self.emit_init_into(false, module, id, behavior)?;
        if self.is_new(id) {
            self.emit_init_into(true, module, id, behavior)?;
        }
        Ok(())
    }

    fn emit_init_into(
        &mut self,
        into_new: bool,
        module: &ir::Module,
        id: NodeId,
        behavior: &dyn CompileNode,
    ) -> Result<(), CompileError> {
        let builder = if into_new {
            self.init_new_builder.as_mut()
        } else {
            self.init_builder.as_mut()
        }
        .expect("sequence started");

        let static_memory = if behavior.uses_static_memory() {
            let chunk = self.static_chunks.get(&id).expect("checked by caller");
            Some(builder.const_ptr(chunk.as_ptr() as usize, Type::byte_ptr()))
        } else {
            None
        };

        let instance_num = builder.param(0);
        let state = self.states.get(&id).expect("state created at emission");
        let state_ptr = state.mutable_state_ptr(builder, instance_num);
        let mut emitter = InitEmitter { builder, module };
        behavior.initialize_mutable_state(&mut emitter, state_ptr, static_memory)
    }

    /// Close the sequence.
    ///
    /// Moves the state of every node *not* used this sequence into the
    /// previous delete sequence, zeroes every used cycle cell in
    /// `graph__initialize`, opens the delete sequence for the current
    /// compilation, and returns the two sealed initialization functions.
    pub fn finish_sequence(&mut self) -> Result<(ir::Function, ir::Function), CompileError> {
        let mut init = self.init_builder.take().expect("sequence started");
        let mut init_new = self.init_new_builder.take().expect("sequence started");

        let instance_num = init.param(0);
        let mut cells: Vec<(NodeId, u32)> = self.used_cycle_cells.iter().copied().collect();
        cells.sort_unstable();
        for (id, output) in cells {
            let state = self.states.get(&id).expect("used cell has state");
            let ptr = state.cycle_state_ptr(&mut init, instance_num, output);
            let zero = init.f32const(0.0);
            init.store(zero, ptr);
        }
        init.ret(None);
        init_new.ret(None);

        let unused: Vec<NodeId> = self
            .states
            .keys()
            .filter(|id| !self.used_nodes.contains(id))
            .copied()
            .collect();
        if !unused.is_empty() {
            debug!(count = unused.len(), seq = self.current_sequence,
                "retiring state of unused nodes");
        }
        for id in unused {
            let state = self.states.remove(&id).expect("present");
            self.newest_delete_sequence().states.push(state);
        }

        self.delete_sequences
            .insert(self.current_sequence, DeleteSequence::default());

        Ok((init.finish(), init_new.finish()))
    }

    /// Attach the engine module of the current compilation to its delete
    /// sequence, so it is released only after a later acknowledgment.
    pub fn retire_module(&mut self, module: ModuleId) {
        self.delete_sequences
            .get_mut(&self.current_sequence)
            .expect("sequence finished")
            .module = Some(module);
    }

    /// The audio thread acknowledged `seq`: free every delete sequence
    /// tagged strictly below it.
    pub fn using_sequence(&mut self, seq: CompileSequence, engine: &mut dyn ExecutionEngine) {
        let keep = self.delete_sequences.split_off(&seq);
        let dead = std::mem::replace(&mut self.delete_sequences, keep);
        for (tag, bag) in dead {
            debug!(seq = tag, states = bag.states.len(), "freeing delete sequence");
            if let Some(module) = bag.module {
                engine.delete_module(module);
            }
        }
    }

    /// The newest existing delete sequence: retirements during an active
    /// sequence land in the previous compilation's bag, which is freed only
    /// once the audio thread has moved past that compilation.
    fn newest_delete_sequence(&mut self) -> &mut DeleteSequence {
        self.delete_sequences
            .iter_mut()
            .next_back()
            .expect("delete sequence map is never empty")
            .1
    }

    #[cfg(test)]
    pub(crate) fn has_state(&self, id: NodeId) -> bool {
        self.states.contains_key(&id)
    }

    #[cfg(test)]
    pub(crate) fn pending_delete_sequences(&self) -> usize {
        self.delete_sequences.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::NullEngine;
    use crate::graph::SentinelNode;
    use crate::nodes::DelayNode;

    fn process_builder() -> FuncBuilder {
        let sig = Signature::new(
            vec![
                Param::new(Type::I64),
                Param::readonly(Type::f32_ptr()),
                Param::new(Type::f32_ptr()),
            ],
            None,
        );
        FuncBuilder::new("graph__process", sig, Linkage::External)
    }

    #[test]
    fn state_is_kept_while_used_and_retired_when_not() {
        let mut graph = Graph::new();
        let delay = graph.insert(Box::new(DelayNode));
        let mut mgr = StateManager::new(1, 0);
        let mut engine = NullEngine::default();

        mgr.begin_sequence(1);
        let mut b = process_builder();
        let inst = b.param(0);
        mgr.mutable_state_ptr(&mut b, &graph, delay, inst).unwrap();
        mgr.finish_sequence().unwrap();
        assert!(mgr.has_state(delay));

        // Next sequence never touches the node: its state is retired, but
        // only freed after a later acknowledgment.
        mgr.begin_sequence(2);
        mgr.finish_sequence().unwrap();
        assert!(!mgr.has_state(delay));

        assert_eq!(mgr.pending_delete_sequences(), 3);
        mgr.using_sequence(2, &mut engine);
        assert_eq!(mgr.pending_delete_sequences(), 1);
    }

    #[test]
    fn cycle_state_survives_recompilation() {
        let mut graph = Graph::new();
        let node = graph.insert(Box::new(SentinelNode::new(0, 1)));
        let mut mgr = StateManager::new(2, 0);

        mgr.begin_sequence(1);
        let mut b = process_builder();
        let inst = b.param(0);
        mgr.cycle_state_ptr(&mut b, &graph, node, 0, inst).unwrap();
        mgr.finish_sequence().unwrap();

        mgr.begin_sequence(2);
        let mut b = process_builder();
        let inst = b.param(0);
        mgr.cycle_state_ptr(&mut b, &graph, node, 0, inst).unwrap();
        mgr.finish_sequence().unwrap();
        assert!(mgr.has_state(node));
    }

    #[test]
    fn static_chunk_replacement_retires_the_old_bytes() {
        let mut mgr = StateManager::new(1, 0);
        let mut graph = Graph::new();
        let node = graph.insert(Box::new(SentinelNode::new(0, 1)));

        mgr.register_static_memory_chunk(node, vec![1, 2, 3, 4]);
        mgr.register_static_memory_chunk(node, vec![5, 6, 7, 8]);
        mgr.free_static_memory_chunk(node);
        // Freeing twice is a logged no-op.
        mgr.free_static_memory_chunk(node);

        let mut b = process_builder();
        assert!(mgr.static_memory_ref(&mut b, node).is_none());
    }
}
