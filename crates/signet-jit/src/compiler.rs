//! Graph-to-IR compilation.
//!
//! The compiler walks the graph from the requested outputs toward the
//! inputs and emits straight-line IR, memoising every node's output values
//! so no node is emitted twice. Feedback is resolved through cycle-state
//! cells: a back-edge reads the cell, and the node at the other end stores
//! its freshly computed value into it when it is finally emitted, giving
//! exactly one sample of delay per traversal of the back-edge.

use std::collections::{HashMap, VecDeque};

use signet_ir::{self as ir, FuncBuilder};
use tracing::warn;

use crate::error::CompileError;
use crate::graph::{Graph, NodeId, OutputRef};
use crate::state::StateManager;

/// Helper driving one compilation scope.
///
/// The process-function compilation owns the root scope; a composite node
/// opens a nested scope with [`GraphCompiler::sub_compiler`], sharing the
/// instruction builder and state manager but memoising values separately.
pub struct GraphCompiler<'a, 'm> {
    builder: &'a mut FuncBuilder,
    module: &'m ir::Module,
    instance_num: ir::Value,
    state: &'a mut StateManager,
    /// Memoised output values; a `None` slot marks a node whose value is
    /// still being resolved (the target of a back-edge).
    values: HashMap<NodeId, Vec<Option<ir::Value>>>,
    /// Non-dependant nodes whose inputs still have to be pushed.
    pending_pushes: VecDeque<NodeId>,
}

impl<'a, 'm> GraphCompiler<'a, 'm> {
    pub fn new(
        builder: &'a mut FuncBuilder,
        module: &'m ir::Module,
        instance_num: ir::Value,
        state: &'a mut StateManager,
    ) -> Self {
        Self {
            builder,
            module,
            instance_num,
            state,
            values: HashMap::new(),
            pending_pushes: VecDeque::new(),
        }
    }

    /// A nested scope over the same builder and state manager, with a fresh
    /// memo table.
    pub fn sub_compiler(&mut self) -> GraphCompiler<'_, 'm> {
        GraphCompiler::new(self.builder, self.module, self.instance_num, self.state)
    }

    /// The instruction builder, positioned at the current insert point.
    pub fn ins(&mut self) -> &mut FuncBuilder {
        self.builder
    }

    /// The module this compilation links against.
    pub fn module(&self) -> &'m ir::Module {
        self.module
    }

    /// The `instance_num` value of the process function.
    pub fn instance_num(&self) -> ir::Value {
        self.instance_num
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

    /// Pre-assign a node's output values, bypassing emission. This is how
    /// graph-level input nodes get their values.
    pub fn assign_values(&mut self, node: NodeId, values: Vec<ir::Value>) {
        self.values
            .insert(node, values.into_iter().map(Some).collect());
    }

    /// The value of `source`, compiling whatever part of the graph it
    /// depends on. An unconnected source yields a literal `0.0`.
    pub fn node_value(
        &mut self,
        graph: &Graph,
        source: Option<OutputRef>,
    ) -> Result<ir::Value, CompileError> {
        let Some(OutputRef { node, output }) = source else {
            return Ok(self.builder.f32const(0.0));
        };

        if !self.values.contains_key(&node) {
            self.resolve(graph, node)?;
        }
        self.memoised(node, output)
    }

    /// Iterative depth-first driver with an explicit stack.
    ///
    /// For each node the inputs are scanned left to right and at most one
    /// not-yet-visited dependency is pushed before yielding, so a node can
    /// never sit on the stack twice. A node found on the stack with an
    /// unresolved output is a back-edge and reads its cycle cell instead.
    fn resolve(&mut self, graph: &Graph, node: NodeId) -> Result<(), CompileError> {
        let mut stack = vec![node];
        while let Some(&top) = stack.last() {
            if !self.values.contains_key(&top) {
                let entry = graph.entry(top)?;
                self.values
                    .insert(top, vec![None; entry.output_count as usize]);
                if !entry.behavior.is_dependant_process() {
                    // Outputs of a non-dependant node exist before its
                    // inputs do; the push is scheduled for later.
                    self.pull_node(graph, top)?;
                    stack.pop();
                    continue;
                }
            }
            if let Some(inputs) = self.scan_inputs(graph, &mut stack, top)? {
                self.emit_node(graph, top, &inputs)?;
                stack.pop();
            }
        }
        Ok(())
    }

    fn memoised(&self, node: NodeId, output: u32) -> Result<ir::Value, CompileError> {
        self.values
            .get(&node)
            .and_then(|slots| slots.get(output as usize).copied().flatten())
            .ok_or(CompileError::UnresolvedValue { node, output })
    }

    fn scan_inputs(
        &mut self,
        graph: &Graph,
        stack: &mut Vec<NodeId>,
        id: NodeId,
    ) -> Result<Option<Vec<ir::Value>>, CompileError> {
        let entry = graph.entry(id)?;
        let mut inputs = Vec::with_capacity(entry.inputs.len());

        for slot in &entry.inputs {
            let Some(OutputRef { node: src, output }) = *slot else {
                inputs.push(self.builder.f32const(0.0));
                continue;
            };

            match self.values.get(&src) {
                None => {
                    // Not visited yet: yield to the driver with it on top.
                    stack.push(src);
                    return Ok(None);
                }
                Some(slots) => match slots.get(output as usize).copied() {
                    Some(Some(value)) => inputs.push(value),
                    Some(None) => {
                        // Back-edge: read the cycle cell now and remember
                        // the load so the source stores into the cell when
                        // it is emitted.
                        let cell = self.state.cycle_state_ptr(
                            self.builder,
                            graph,
                            src,
                            output,
                            self.instance_num,
                        )?;
                        let value = self.builder.load(cell);
                        self.values.get_mut(&src).expect("present")[output as usize] =
                            Some(value);
                        inputs.push(value);
                    }
                    None => {
                        return Err(CompileError::UnresolvedValue { node: src, output });
                    }
                },
            }
        }
        Ok(Some(inputs))
    }

    /// Emit a dependant-process node with resolved inputs.
    fn emit_node(
        &mut self,
        graph: &Graph,
        id: NodeId,
        inputs: &[ir::Value],
    ) -> Result<(), CompileError> {
        let entry = graph.entry(id)?;
        let behavior = &*entry.behavior;
        let output_count = entry.output_count;

        let state_ptr =
            self.state
                .mutable_state_ptr(self.builder, graph, id, self.instance_num)?;

        let static_ptr = if behavior.uses_static_memory() {
            match self.state.static_memory_ref(self.builder, id) {
                Some(ptr) => Some(ptr),
                None => {
                    warn!(node = %id, "no static memory chunk registered, node degrades to zero output");
                    return self.fill_zero(id, output_count);
                }
            }
        } else {
            None
        };

        // Outputs observed as back-edges before this point already hold
        // their cycle-cell loads; they get a store of the real value below.
        let cycle_outputs: Vec<u32> = self.values[&id]
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.is_some().then_some(i as u32))
            .collect();

        let outputs = behavior.emit_outputs(self, graph, inputs, state_ptr, static_ptr)?;
        if outputs.len() != output_count as usize {
            return Err(CompileError::OutputArityMismatch {
                expected: output_count,
                got: outputs.len() as u32,
            });
        }

        for &output in &cycle_outputs {
            let cell =
                self.state
                    .cycle_state_ptr(self.builder, graph, id, output, self.instance_num)?;
            self.builder.store(outputs[output as usize], cell);
        }

        let slots = self.values.get_mut(&id).expect("present");
        for (slot, value) in slots.iter_mut().zip(&outputs) {
            *slot = Some(*value);
        }

        self.state.emit_node_init(self.module, id, behavior)
    }

    /// First visit of a non-dependant node: produce its outputs from state
    /// alone and schedule the input push.
    fn pull_node(&mut self, graph: &Graph, id: NodeId) -> Result<(), CompileError> {
        let entry = graph.entry(id)?;
        let behavior = &*entry.behavior;
        let output_count = entry.output_count;

        let state_ptr =
            self.state
                .mutable_state_ptr(self.builder, graph, id, self.instance_num)?;

        let static_ptr = if behavior.uses_static_memory() {
            match self.state.static_memory_ref(self.builder, id) {
                Some(ptr) => Some(ptr),
                None => {
                    warn!(node = %id, "no static memory chunk registered, node degrades to zero output");
                    return self.fill_zero(id, output_count);
                }
            }
        } else {
            None
        };

        let outputs = behavior.pull_outputs(self, state_ptr, static_ptr)?;
        if outputs.len() != output_count as usize {
            return Err(CompileError::OutputArityMismatch {
                expected: output_count,
                got: outputs.len() as u32,
            });
        }

        let slots = self.values.get_mut(&id).expect("present");
        for (slot, value) in slots.iter_mut().zip(&outputs) {
            *slot = Some(*value);
        }

        self.state.emit_node_init(self.module, id, behavior)?;
        self.pending_pushes.push_back(id);
        Ok(())
    }

    /// Resolve the inputs of every pulled node and emit its push. Input
    /// resolution may reach yet-unvisited parts of the graph and schedule
    /// further pushes; the queue drains until empty.
    ///
    /// Must run after the last `node_value` of the scope so a pull can
    /// never observe a state already advanced by its own push.
    pub fn flush_pushes(&mut self, graph: &Graph) -> Result<(), CompileError> {
        while let Some(id) = self.pending_pushes.pop_front() {
            let input_count = graph.input_count(id)?;
            let mut inputs = Vec::with_capacity(input_count as usize);
            for i in 0..input_count {
                let source = graph.input(id, i)?;
                inputs.push(self.node_value(graph, source)?);
            }

            let entry = graph.entry(id)?;
            let behavior = &*entry.behavior;
            let state_ptr =
                self.state
                    .mutable_state_ptr(self.builder, graph, id, self.instance_num)?;
            let static_ptr = if behavior.uses_static_memory() {
                self.state.static_memory_ref(self.builder, id)
            } else {
                None
            };
            behavior.push_inputs(self, &inputs, state_ptr, static_ptr)?;
        }
        Ok(())
    }

    fn fill_zero(&mut self, id: NodeId, output_count: u32) -> Result<(), CompileError> {
        let zero = self.builder.f32const(0.0);
        let slots = self.values.get_mut(&id).expect("present");
        for slot in slots.iter_mut().take(output_count as usize) {
            *slot = Some(zero);
        }
        Ok(())
    }
}
