use signet_ir as ir;

use crate::compiler::GraphCompiler;
use crate::error::CompileError;
use crate::graph::Graph;
use crate::state::InitEmitter;

/// Behavior of a node in the compile graph.
///
/// A node declares its arity, its per-instance mutable-state size, whether
/// it reads a client-registered static-memory chunk, and which of the two
/// emission APIs it uses:
///
/// - **Dependant process** (the default): [`CompileNode::emit_outputs`]
///   computes the outputs from the inputs in one combinational step.
/// - **Non-dependant process**: [`CompileNode::pull_outputs`] produces the
///   outputs *before* the inputs are known, and
///   [`CompileNode::push_inputs`] consumes the inputs later. This is how a
///   one-sample delay participates in feedback without forcing an extra
///   cycle-state cell into the loop.
///
/// All emission hooks receive IR values and append instructions through the
/// compiler; none of them run at audio time.
pub trait CompileNode: Send {
    /// Declared input count, used to size the entry at insertion.
    fn input_count(&self) -> u32;

    /// Declared output count, used to size the entry at insertion.
    fn output_count(&self) -> u32;

    /// Size in bytes of the per-instance mutable state. Zero for stateless
    /// nodes.
    fn mutable_state_size(&self) -> usize {
        0
    }

    /// Whether emission receives a client-registered static-memory chunk.
    fn uses_static_memory(&self) -> bool {
        false
    }

    /// Selects the emission API; see the trait documentation.
    fn is_dependant_process(&self) -> bool {
        true
    }

    /// Emit code priming this node's mutable state, into the graph
    /// initialization functions.
    fn initialize_mutable_state(
        &self,
        emit: &mut InitEmitter<'_, '_>,
        mutable_state: ir::Value,
        static_memory: Option<ir::Value>,
    ) -> Result<(), CompileError> {
        let _ = (emit, mutable_state, static_memory);
        Ok(())
    }

    /// Dependant-process hook: compute output values from input values.
    fn emit_outputs(
        &self,
        compiler: &mut GraphCompiler<'_, '_>,
        graph: &Graph,
        inputs: &[ir::Value],
        mutable_state: Option<ir::Value>,
        static_memory: Option<ir::Value>,
    ) -> Result<Vec<ir::Value>, CompileError> {
        let _ = (compiler, graph, inputs, mutable_state, static_memory);
        Err(CompileError::UnsupportedComputeApi)
    }

    /// Non-dependant hook: produce outputs before the inputs are resolved.
    fn pull_outputs(
        &self,
        compiler: &mut GraphCompiler<'_, '_>,
        mutable_state: Option<ir::Value>,
        static_memory: Option<ir::Value>,
    ) -> Result<Vec<ir::Value>, CompileError> {
        let _ = (compiler, mutable_state, static_memory);
        Err(CompileError::UnsupportedComputeApi)
    }

    /// Non-dependant hook: consume the resolved inputs.
    fn push_inputs(
        &self,
        compiler: &mut GraphCompiler<'_, '_>,
        inputs: &[ir::Value],
        mutable_state: Option<ir::Value>,
        static_memory: Option<ir::Value>,
    ) -> Result<(), CompileError> {
        let _ = (compiler, inputs, mutable_state, static_memory);
        Err(CompileError::UnsupportedComputeApi)
    }
}

/// A pure connection point with no behavior of its own.
///
/// Graph-level inputs and outputs are sentinels: input sentinels get their
/// output values assigned by the compiler before traversal, output
/// sentinels only ever have their input slots resolved. The same nodes
/// bound a composite's internal sub-graph.
pub struct SentinelNode {
    inputs: u32,
    outputs: u32,
}

impl SentinelNode {
    pub fn new(inputs: u32, outputs: u32) -> Self {
        Self { inputs, outputs }
    }
}

impl CompileNode for SentinelNode {
    fn input_count(&self) -> u32 {
        self.inputs
    }

    fn output_count(&self) -> u32 {
        self.outputs
    }

    fn emit_outputs(
        &self,
        _compiler: &mut GraphCompiler<'_, '_>,
        _graph: &Graph,
        _inputs: &[ir::Value],
        _mutable_state: Option<ir::Value>,
        _static_memory: Option<ir::Value>,
    ) -> Result<Vec<ir::Value>, CompileError> {
        // Reached only when a sentinel with outputs was never assigned
        // values; the arity check in the compiler reports it.
        Ok(Vec::new())
    }
}
