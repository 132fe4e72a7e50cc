//! Typed straight-line IR for the signet JIT.
//!
//! This crate provides the intermediate representation that the graph
//! compiler emits and the execution engine lowers to native code:
//!
//! - [`Type`] - value types, including typed pointers with pointee sizes
//! - [`Module`] - ordered named functions plus named `f32` globals, with
//!   link/clone primitives
//! - [`FuncBuilder`] - SSA instruction builder for a single function
//! - [`verify_module`] - structural and type checks for untrusted modules
//! - [`opt`] - the optimization pipeline (inlining, constant folding, CSE,
//!   dead-code and dead-function elimination)
//!
//! Functions are deliberately restricted to a single implicit basic block:
//! the graph compiler only ever produces straight-line code, and the
//! restriction keeps lowering, inlining and verification small.

mod builder;
mod display;
mod module;
pub mod opt;
mod types;
mod verify;

pub use builder::FuncBuilder;
pub use module::{Function, Inst, IrError, Linkage, Module, Param, Signature, Value};
pub use types::Type;
pub use verify::verify_module;
