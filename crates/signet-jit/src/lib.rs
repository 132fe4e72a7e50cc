//! Runtime JIT compilation of signal-processing dataflow graphs.
//!
//! A client builds a directed graph of computational nodes (arithmetic,
//! delays, externally compiled plugins, nested sub-graphs) and the
//! [`GraphExecutionContext`] translates it into a pair of native functions:
//! a per-sample `process` and a state `initialize`. Recompiling hot-swaps
//! the running program into the concurrently executing audio thread
//! without interrupting it: the audio side never blocks, never allocates,
//! and keeps the previous program until it picks the new one up.
//!
//! The moving parts:
//!
//! - [`Graph`] / [`CompileNode`] - the user graph, cycles allowed
//! - [`GraphCompiler`] - graph traversal into straight-line IR, with
//!   feedback broken through cycle-state cells
//! - [`StateManager`] - per-node state that outlives compilations, with
//!   epoch-based reclamation against the audio thread
//! - [`ExecutionEngine`] / [`CraneliftEngine`] - the native backend seam
//! - [`ExternalPlugin`] - foreign IR modules as first-class nodes
//! - [`Composite`] - sub-graphs spliced transparently into a compilation
//! - [`GraphExecutionContext`] / [`GraphProcessor`] - the two actors of
//!   the hot-swap protocol

mod compiler;
mod context;
mod engine;
mod error;
mod graph;
mod nodes;
mod plugin;
pub mod spsc;
mod state;

pub use compiler::GraphCompiler;
pub use context::{
    ContextOptions, GraphExecutionContext, GraphProcessor, InitializeFn, ProcessFn,
    INITIALIZE_NEW_NODES_SYMBOL, INITIALIZE_SYMBOL, PROCESS_SYMBOL,
};
pub use engine::{CraneliftEngine, ExecutionEngine, ModuleId, OptLevel};
pub use error::{CompileError, EngineError, GraphError};
pub use graph::{CompileNode, Composite, Graph, NodeId, OutputRef, SentinelNode};
pub use nodes::{
    AddNode, ConstantNode, DelayNode, GlobalRefNode, InvertNode, MulNode, NegateNode,
    ReferenceNode, StaticValueNode,
};
pub use plugin::{
    ExternalPlugin, PluginError, PluginNode, INITIALIZE_SYMBOL as PLUGIN_INITIALIZE_SYMBOL,
    PROCESS_SYMBOL as PLUGIN_PROCESS_SYMBOL, PULL_SYMBOL as PLUGIN_PULL_SYMBOL,
    PUSH_SYMBOL as PLUGIN_PUSH_SYMBOL,
};
pub use state::{CompileSequence, InitEmitter, StateManager};

pub use signet_ir as ir;
