//! The execution-engine abstraction and its Cranelift implementation.

mod cranelift;

pub use cranelift::{CraneliftEngine, OptLevel};

use signet_ir as ir;

use crate::error::EngineError;

/// Handle of a module owned by an execution engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleId(pub(crate) u64);

/// Narrow interface the compilation pipeline needs from a native backend.
///
/// The core does not care which JIT sits behind it: it pushes finished IR
/// modules in, triggers code generation, asks for function pointers by
/// name, and releases modules when the reclamation protocol says they can
/// no longer be executing.
pub trait ExecutionEngine: Send {
    /// Take ownership of a module and lower it. Function pointers become
    /// available only after [`ExecutionEngine::emit_native_code`].
    fn add_module(&mut self, module: ir::Module) -> Result<ModuleId, EngineError>;

    /// Materialise machine code for every added module.
    fn emit_native_code(&mut self) -> Result<(), EngineError>;

    /// Address of a finalized function, or `None` when the module or name
    /// is unknown or not yet finalized.
    fn function_pointer(&self, module: ModuleId, name: &str) -> Option<*const u8>;

    /// Release a module and its native code. Idempotent.
    fn delete_module(&mut self, module: ModuleId);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Engine stub that records calls; for tests that never run code.
    #[derive(Default)]
    pub(crate) struct NullEngine {
        next: u64,
        pub(crate) deleted: Vec<ModuleId>,
    }

    impl ExecutionEngine for NullEngine {
        fn add_module(&mut self, _module: ir::Module) -> Result<ModuleId, EngineError> {
            self.next += 1;
            Ok(ModuleId(self.next))
        }

        fn emit_native_code(&mut self) -> Result<(), EngineError> {
            Ok(())
        }

        fn function_pointer(&self, _module: ModuleId, _name: &str) -> Option<*const u8> {
            None
        }

        fn delete_module(&mut self, module: ModuleId) {
            self.deleted.push(module);
        }
    }
}
