//! Common node implementations: arithmetic, constants, references and the
//! one-sample delay.

use signet_ir::{self as ir, Type};

use crate::compiler::GraphCompiler;
use crate::error::CompileError;
use crate::graph::{CompileNode, Graph};
use crate::state::InitEmitter;

/// Emits a compile-time float constant.
pub struct ConstantNode {
    pub value: f32,
}

impl ConstantNode {
    pub fn new(value: f32) -> Self {
        Self { value }
    }
}

impl CompileNode for ConstantNode {
    fn input_count(&self) -> u32 {
        0
    }

    fn output_count(&self) -> u32 {
        1
    }

    fn emit_outputs(
        &self,
        compiler: &mut GraphCompiler<'_, '_>,
        _graph: &Graph,
        _inputs: &[ir::Value],
        _mutable_state: Option<ir::Value>,
        _static_memory: Option<ir::Value>,
    ) -> Result<Vec<ir::Value>, CompileError> {
        Ok(vec![compiler.ins().f32const(self.value)])
    }
}

/// Loads a client-owned float each sample; its address is baked into the
/// program as a constant.
pub struct ReferenceNode {
    ptr: *const f32,
}

impl ReferenceNode {
    /// # Safety contract
    ///
    /// The pointee must stay valid and readable for as long as any program
    /// compiled from a graph containing this node can run.
    pub fn new(ptr: *const f32) -> Self {
        Self { ptr }
    }
}

// The raw pointer is only ever embedded as an address; the node itself
// never dereferences it.
unsafe impl Send for ReferenceNode {}

impl CompileNode for ReferenceNode {
    fn input_count(&self) -> u32 {
        0
    }

    fn output_count(&self) -> u32 {
        1
    }

    fn emit_outputs(
        &self,
        compiler: &mut GraphCompiler<'_, '_>,
        _graph: &Graph,
        _inputs: &[ir::Value],
        _mutable_state: Option<ir::Value>,
        _static_memory: Option<ir::Value>,
    ) -> Result<Vec<ir::Value>, CompileError> {
        let b = compiler.ins();
        let ptr = b.const_ptr(self.ptr as usize, Type::f32_ptr());
        Ok(vec![b.load(ptr)])
    }
}

/// Reads a named library global set with `set_global_constant`.
pub struct GlobalRefNode {
    name: String,
}

impl GlobalRefNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl CompileNode for GlobalRefNode {
    fn input_count(&self) -> u32 {
        0
    }

    fn output_count(&self) -> u32 {
        1
    }

    fn emit_outputs(
        &self,
        compiler: &mut GraphCompiler<'_, '_>,
        _graph: &Graph,
        _inputs: &[ir::Value],
        _mutable_state: Option<ir::Value>,
        _static_memory: Option<ir::Value>,
    ) -> Result<Vec<ir::Value>, CompileError> {
        Ok(vec![compiler.ins().global_get(&self.name)])
    }
}

/// `out = in0 + in1`.
pub struct AddNode;

impl CompileNode for AddNode {
    fn input_count(&self) -> u32 {
        2
    }

    fn output_count(&self) -> u32 {
        1
    }

    fn emit_outputs(
        &self,
        compiler: &mut GraphCompiler<'_, '_>,
        _graph: &Graph,
        inputs: &[ir::Value],
        _mutable_state: Option<ir::Value>,
        _static_memory: Option<ir::Value>,
    ) -> Result<Vec<ir::Value>, CompileError> {
        Ok(vec![compiler.ins().fadd(inputs[0], inputs[1])])
    }
}

/// `out = in0 * in1`.
pub struct MulNode;

impl CompileNode for MulNode {
    fn input_count(&self) -> u32 {
        2
    }

    fn output_count(&self) -> u32 {
        1
    }

    fn emit_outputs(
        &self,
        compiler: &mut GraphCompiler<'_, '_>,
        _graph: &Graph,
        inputs: &[ir::Value],
        _mutable_state: Option<ir::Value>,
        _static_memory: Option<ir::Value>,
    ) -> Result<Vec<ir::Value>, CompileError> {
        Ok(vec![compiler.ins().fmul(inputs[0], inputs[1])])
    }
}

/// `out = -in`.
pub struct NegateNode;

impl CompileNode for NegateNode {
    fn input_count(&self) -> u32 {
        1
    }

    fn output_count(&self) -> u32 {
        1
    }

    fn emit_outputs(
        &self,
        compiler: &mut GraphCompiler<'_, '_>,
        _graph: &Graph,
        inputs: &[ir::Value],
        _mutable_state: Option<ir::Value>,
        _static_memory: Option<ir::Value>,
    ) -> Result<Vec<ir::Value>, CompileError> {
        Ok(vec![compiler.ins().fneg(inputs[0])])
    }
}

/// `out = 1 / in`.
pub struct InvertNode;

impl CompileNode for InvertNode {
    fn input_count(&self) -> u32 {
        1
    }

    fn output_count(&self) -> u32 {
        1
    }

    fn emit_outputs(
        &self,
        compiler: &mut GraphCompiler<'_, '_>,
        _graph: &Graph,
        inputs: &[ir::Value],
        _mutable_state: Option<ir::Value>,
        _static_memory: Option<ir::Value>,
    ) -> Result<Vec<ir::Value>, CompileError> {
        let b = compiler.ins();
        let one = b.f32const(1.0);
        Ok(vec![b.fdiv(one, inputs[0])])
    }
}

/// One-sample delay (`z^-1`), the canonical non-dependant node.
///
/// Its output is the previous sample held in one float of mutable state,
/// produced before the current input is known; the input is pushed into the
/// state afterwards. Used in a feedback loop it therefore provides the
/// loop's sample of delay without a cycle-state cell.
pub struct DelayNode;

impl CompileNode for DelayNode {
    fn input_count(&self) -> u32 {
        1
    }

    fn output_count(&self) -> u32 {
        1
    }

    fn mutable_state_size(&self) -> usize {
        4
    }

    fn is_dependant_process(&self) -> bool {
        false
    }

    fn initialize_mutable_state(
        &self,
        emit: &mut InitEmitter<'_, '_>,
        mutable_state: ir::Value,
        _static_memory: Option<ir::Value>,
    ) -> Result<(), CompileError> {
        let b = emit.ins();
        let cell = b.ptr_cast(mutable_state, Type::f32_ptr());
        let zero = b.f32const(0.0);
        b.store(zero, cell);
        Ok(())
    }

    fn pull_outputs(
        &self,
        compiler: &mut GraphCompiler<'_, '_>,
        mutable_state: Option<ir::Value>,
        _static_memory: Option<ir::Value>,
    ) -> Result<Vec<ir::Value>, CompileError> {
        let b = compiler.ins();
        let cell = b.ptr_cast(mutable_state.expect("delay declares state"), Type::f32_ptr());
        Ok(vec![b.load(cell)])
    }

    fn push_inputs(
        &self,
        compiler: &mut GraphCompiler<'_, '_>,
        inputs: &[ir::Value],
        mutable_state: Option<ir::Value>,
        _static_memory: Option<ir::Value>,
    ) -> Result<(), CompileError> {
        let b = compiler.ins();
        let cell = b.ptr_cast(mutable_state.expect("delay declares state"), Type::f32_ptr());
        b.store(inputs[0], cell);
        Ok(())
    }
}

/// Loads the first float of the node's static-memory chunk.
///
/// Degrades to a zero output while no chunk is registered.
pub struct StaticValueNode;

impl CompileNode for StaticValueNode {
    fn input_count(&self) -> u32 {
        0
    }

    fn output_count(&self) -> u32 {
        1
    }

    fn uses_static_memory(&self) -> bool {
        true
    }

    fn emit_outputs(
        &self,
        compiler: &mut GraphCompiler<'_, '_>,
        _graph: &Graph,
        _inputs: &[ir::Value],
        _mutable_state: Option<ir::Value>,
        static_memory: Option<ir::Value>,
    ) -> Result<Vec<ir::Value>, CompileError> {
        let b = compiler.ins();
        let chunk = static_memory.expect("compiler provides the chunk or degrades");
        let ptr = b.ptr_cast(chunk, Type::f32_ptr());
        Ok(vec![b.load(ptr)])
    }
}
