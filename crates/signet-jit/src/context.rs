//! The graph execution context: compile-side orchestration and the
//! audio-side program holder.
//!
//! The context is split into the two actors of the concurrency model. The
//! compile side owns the execution engine, the state manager and the
//! library module, and may block and allocate freely. The audio side owns
//! nothing but the current program pair and the queue ends; none of its
//! operations block, allocate, or take locks. The only shared objects are
//! the two wait-free queues carrying `compile_done` messages one way and
//! acknowledgments the other.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use signet_ir::{self as ir, FuncBuilder, Linkage, Param, Signature, Type};
use tracing::{debug, error, warn};

use crate::compiler::GraphCompiler;
use crate::engine::{CraneliftEngine, ExecutionEngine, OptLevel};
use crate::error::{CompileError, EngineError};
use crate::graph::{Graph, NodeId};
use crate::spsc;
use crate::state::{CompileSequence, StateManager};

/// Signature of the emitted process function.
pub type ProcessFn = extern "C" fn(instance_num: i64, inputs: *const f32, outputs: *mut f32);
/// Signature of the emitted initialize functions.
pub type InitializeFn = extern "C" fn(instance_num: i64);

extern "C" fn noop_process(_: i64, _: *const f32, _: *mut f32) {}
extern "C" fn noop_initialize(_: i64) {}

pub const PROCESS_SYMBOL: &str = "graph__process";
pub const INITIALIZE_SYMBOL: &str = "graph__initialize";
pub const INITIALIZE_NEW_NODES_SYMBOL: &str = "graph__initialize_new_nodes";

/// `compile_done`: a finished program travelling to the audio thread.
#[derive(Clone, Copy)]
struct CompileDoneMsg {
    seq: CompileSequence,
    process: ProcessFn,
    initialize: InitializeFn,
}

type AckMsg = CompileSequence;

const MSG_QUEUE_CAPACITY: usize = 256;

/// Context construction options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextOptions {
    /// Number of parallel runtime instances the state manager provisions.
    pub instance_count: usize,
    /// Native code generation effort, forwarded to the backend.
    pub opt_level: OptLevel,
    /// Dump IR before and after optimization to the log sink.
    pub enable_ir_dump: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            instance_count: 1,
            opt_level: OptLevel::default(),
            enable_ir_dump: false,
        }
    }
}

/// Compile-side half of a graph execution context.
pub struct GraphExecutionContext {
    engine: Box<dyn ExecutionEngine>,
    state: StateManager,
    library: ir::Module,
    current_sequence: CompileSequence,
    ir_dump: bool,
    ack_rx: spsc::Consumer<AckMsg>,
    done_tx: spsc::Producer<CompileDoneMsg>,
}

/// Audio-side half: holds the current program and swaps it on request.
///
/// Safe to move to the audio thread; every method runs to completion
/// without blocking or allocating.
pub struct GraphProcessor {
    process: ProcessFn,
    initialize: InitializeFn,
    done_rx: spsc::Consumer<CompileDoneMsg>,
    ack_tx: spsc::Producer<AckMsg>,
}

impl GraphExecutionContext {
    /// Build a context over an explicit execution engine.
    pub fn new(
        engine: Box<dyn ExecutionEngine>,
        options: ContextOptions,
    ) -> (GraphExecutionContext, GraphProcessor) {
        let (done_tx, done_rx) = spsc::channel(MSG_QUEUE_CAPACITY);
        let (ack_tx, ack_rx) = spsc::channel(MSG_QUEUE_CAPACITY);
        let context = GraphExecutionContext {
            engine,
            state: StateManager::new(options.instance_count, 0),
            library: ir::Module::new("library"),
            current_sequence: 0,
            ir_dump: options.enable_ir_dump,
            ack_rx,
            done_tx,
        };
        let processor = GraphProcessor {
            process: noop_process,
            initialize: noop_initialize,
            done_rx,
            ack_tx,
        };
        (context, processor)
    }

    /// Build a context over the default Cranelift engine.
    pub fn with_default_engine(
        options: ContextOptions,
    ) -> Result<(GraphExecutionContext, GraphProcessor), EngineError> {
        let engine = CraneliftEngine::new(options.opt_level)?;
        Ok(Self::new(Box::new(engine), options))
    }

    /// Link a module into the per-context library. A clone of the library
    /// is linked into every compiled module, making its functions
    /// available to node emission.
    pub fn add_library_module(&mut self, module: ir::Module) -> Result<(), CompileError> {
        self.library.link(module)?;
        Ok(())
    }

    /// Create or reassign a named float constant in the library.
    pub fn set_global_constant(&mut self, name: impl Into<String>, value: f32) {
        self.library.set_global(name, value);
    }

    /// Replace or install a node's static-memory chunk. Ignored with a
    /// warning when the node is not declared static-memory-using.
    pub fn register_static_memory_chunk(
        &mut self,
        graph: &Graph,
        node: NodeId,
        bytes: Vec<u8>,
    ) -> Result<(), CompileError> {
        if !graph.entry(node)?.behavior.uses_static_memory() {
            warn!(node = %node, "node does not use static memory, chunk ignored");
            return Ok(());
        }
        self.state.register_static_memory_chunk(node, bytes);
        Ok(())
    }

    /// Drop a node's static-memory chunk; the bytes are reclaimed once no
    /// running program can reference them.
    pub fn free_static_memory_chunk(&mut self, node: NodeId) {
        self.state.free_static_memory_chunk(node);
    }

    pub fn enable_ir_dump(&mut self, enable: bool) {
        self.ir_dump = enable;
    }

    /// Compile the graph spanned by `inputs` and `outputs` into native
    /// code and post it to the audio thread.
    ///
    /// Inputs bind to the process function's input array in declaration
    /// order, one slot per input-node output; each output node's inputs
    /// are stored to the output array in node order, then slot order. On
    /// success the audio thread picks the program up at its next
    /// `update_program`; on any error the previously swapped program keeps
    /// running untouched.
    pub fn compile(
        &mut self,
        graph: &Graph,
        inputs: &[NodeId],
        outputs: &[NodeId],
    ) -> Result<(), CompileError> {
        let started = Instant::now();

        // An acknowledged sequence retires everything older than it.
        if let Some(acked) = self.ack_rx.pop() {
            debug!(seq = acked, "acknowledgment received");
            self.state.using_sequence(acked, &mut *self.engine);
        }

        self.current_sequence = self.current_sequence.wrapping_add(1);
        let seq = self.current_sequence;
        self.state.begin_sequence(seq);

        let mut module = ir::Module::new("graph");
        module.link(self.library.clone())?;

        let process_fn = self.emit_process_function(&module, graph, inputs, outputs)?;
        let (init_fn, init_new_fn) = self.state.finish_sequence()?;
        module.add_function(process_fn)?;
        module.add_function(init_fn)?;
        module.add_function(init_new_fn)?;

        if self.ir_dump {
            debug!(seq, "IR before optimization:\n{module}");
        }

        ir::opt::resolve_globals(&mut module)?;
        module.internalize_except(&[
            PROCESS_SYMBOL,
            INITIALIZE_SYMBOL,
            INITIALIZE_NEW_NODES_SYMBOL,
        ]);
        ir::opt::run_default_pipeline(&mut module);

        if let Err(e) = ir::verify_module(&module) {
            // Malformed code must not reach native codegen; stay on the
            // last good program.
            error!(seq, error = %e, "malformed IR, canceling compilation");
            return Err(CompileError::IrVerifierFailed(e));
        }

        if self.ir_dump {
            debug!(seq, "IR after optimization:\n{module}");
        }

        let module_id = self.engine.add_module(module)?;
        self.state.retire_module(module_id);
        self.engine.emit_native_code()?;

        let process = self.function_pointer(module_id, PROCESS_SYMBOL)?;
        let initialize = self.function_pointer(module_id, INITIALIZE_SYMBOL)?;
        let initialize_new = self.function_pointer(module_id, INITIALIZE_NEW_NODES_SYMBOL)?;

        // Prime the state of nodes added this sequence in every live
        // instance, without touching existing state.
        let initialize_new: InitializeFn = unsafe { std::mem::transmute(initialize_new) };
        for instance in 0..self.state.instance_count() {
            initialize_new(instance as i64);
        }

        let msg = CompileDoneMsg {
            seq,
            process: unsafe { std::mem::transmute::<*const u8, ProcessFn>(process) },
            initialize: unsafe { std::mem::transmute::<*const u8, InitializeFn>(initialize) },
        };
        if !self.done_tx.push(msg) {
            error!(seq, "cannot post compile_done, is the audio thread draining?");
            return Err(CompileError::QueueFull);
        }

        debug!(seq, elapsed = ?started.elapsed(), "graph compilation finished");
        Ok(())
    }

    fn function_pointer(
        &self,
        module: crate::engine::ModuleId,
        name: &str,
    ) -> Result<*const u8, CompileError> {
        self.engine
            .function_pointer(module, name)
            .ok_or_else(|| CompileError::MissingSymbol(name.to_string()))
    }

    /// Emit `graph__process(i64 instance_num, f32* inputs, f32* outputs)`.
    fn emit_process_function(
        &mut self,
        module: &ir::Module,
        graph: &Graph,
        inputs: &[NodeId],
        outputs: &[NodeId],
    ) -> Result<ir::Function, CompileError> {
        let sig = Signature::new(
            vec![
                Param::new(Type::I64),
                Param::readonly(Type::f32_ptr()),
                Param::new(Type::f32_ptr()),
            ],
            None,
        );
        let mut builder = FuncBuilder::new(PROCESS_SYMBOL, sig, Linkage::External);
        let instance_num = builder.param(0);
        let input_array = builder.param(1);
        let output_array = builder.param(2);

        let mut compiler =
            GraphCompiler::new(&mut builder, module, instance_num, &mut self.state);

        // Preload the input array and assign the values to the input
        // nodes' outputs.
        let mut input_index: i64 = 0;
        for &input_node in inputs {
            let output_count = graph.output_count(input_node)?;
            let mut values = Vec::with_capacity(output_count as usize);
            for _ in 0..output_count {
                let index = compiler.ins().i64const(input_index);
                let ptr = compiler.ins().gep(input_array, index, 4);
                values.push(compiler.ins().load(ptr));
                input_index += 1;
            }
            compiler.assign_values(input_node, values);
        }

        // Compute every output node's inputs and store them to the output
        // array at increasing positions.
        let mut output_index: i64 = 0;
        for &output_node in outputs {
            let input_count = graph.input_count(output_node)?;
            for i in 0..input_count {
                let source = graph.input(output_node, i)?;
                let value = compiler.node_value(graph, source)?;
                let index = compiler.ins().i64const(output_index);
                let ptr = compiler.ins().gep(output_array, index, 4);
                compiler.ins().store(value, ptr);
                output_index += 1;
            }
        }

        compiler.flush_pushes(graph)?;

        builder.ret(None);
        Ok(builder.finish())
    }
}

impl GraphProcessor {
    /// Swap in the most recently compiled program, if one is pending.
    ///
    /// Drains at most one `compile_done` message; on a swap the consumed
    /// sequence is acknowledged back to the compile thread, which tells it
    /// no program older than this one can still be running here.
    pub fn update_program(&mut self) -> bool {
        match self.done_rx.pop() {
            Some(msg) => {
                self.process = msg.process;
                self.initialize = msg.initialize;
                self.ack_tx.push(msg.seq);
                true
            }
            None => false,
        }
    }

    /// Run the current program for one sample.
    ///
    /// The slices must match the compiled graph's ABI: one input value per
    /// input-node output, one output slot per output-node input. Before
    /// the first `update_program` this is a no-op.
    pub fn process(&mut self, instance_num: usize, inputs: &[f32], outputs: &mut [f32]) {
        (self.process)(instance_num as i64, inputs.as_ptr(), outputs.as_mut_ptr());
    }

    /// Initialize the state of every node in the given instance.
    pub fn initialize_state(&mut self, instance_num: usize) {
        (self.initialize)(instance_num as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processor_defaults_to_a_noop_program() {
        let (_context, mut processor) =
            GraphExecutionContext::with_default_engine(ContextOptions::default()).unwrap();
        let mut out = [42.0f32];
        processor.process(0, &[], &mut out);
        assert_eq!(out[0], 42.0);
        processor.initialize_state(0);
        assert!(!processor.update_program());
    }

    #[test]
    fn processor_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<GraphProcessor>();
    }
}
