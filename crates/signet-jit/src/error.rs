//! Error types for signet-jit.

use thiserror::Error;

use crate::graph::NodeId;

/// Errors from node-graph mutation.
#[derive(Debug, Clone, Error)]
pub enum GraphError {
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("invalid arity: node {node} has no port {port}")]
    InvalidArity { node: NodeId, port: u32 },
}

/// Errors from the execution-engine backend.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("host machine is not supported: {0}")]
    Host(String),

    #[error("module error: {0}")]
    Module(String),

    #[error("native codegen failed: {0}")]
    Codegen(String),
}

/// Errors from a graph compilation.
///
/// Every variant leaves the running program untouched; see the individual
/// documentation for what state the compile side is left in.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("ir error: {0}")]
    Ir(#[from] signet_ir::IrError),

    /// The generated module failed verification. The compilation is
    /// abandoned before native codegen; the sequence number is consumed.
    #[error("ir verifier failed: {0}")]
    IrVerifierFailed(signet_ir::IrError),

    /// Surfaced from the execution engine. The module stays tracked in its
    /// delete sequence and is reclaimed on a later acknowledgment.
    #[error("backend error: {0}")]
    Backend(#[from] EngineError),

    /// A symbol a node emitted a call to is absent from the linked module,
    /// which indicates a library-linking mistake.
    #[error("symbol not found in linked module: {0}")]
    MissingSymbol(String),

    /// The `compile_done` queue is full; the audio thread is not draining.
    /// The generated module stays tracked for later reclamation.
    #[error("compile_done queue is full")]
    QueueFull,

    #[error("node emitted {got} outputs, expected {expected}")]
    OutputArityMismatch { expected: u32, got: u32 },

    /// A node value was requested that traversal never resolved, e.g. a
    /// sentinel with outputs that was never assigned values.
    #[error("unresolved value: output {output} of node {node}")]
    UnresolvedValue { node: NodeId, output: u32 },

    /// A compute hook was invoked on a node whose dependant-process flag
    /// selects the other emission API.
    #[error("compute api not supported by this node")]
    UnsupportedComputeApi,
}
