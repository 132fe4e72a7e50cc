//! External-plugin binding: turns a foreign IR module that follows the
//! fixed calling convention into a node factory.
//!
//! A plugin module exposes its compute entry points under well-known
//! names. Parameters are classified purely by signature shape, scanned
//! left to right:
//!
//! 1. a read-only pointer with a non-`f32` pointee is the static-memory
//!    pointer;
//! 2. the next pointer with a non-`f32` pointee is the mutable-state
//!    pointer, its pointee's data-layout size being the state size;
//! 3. a run of `f32` parameters are the inputs (process and push only);
//! 4. a run of `f32` pointers are the outputs (process and pull only);
//! 5. anything further is a signature error.
//!
//! Every defined function is renamed into a plugin-local namespace before
//! any linking, so two plugins with identical public symbols cannot
//! collide inside one compiled module.

use std::sync::atomic::{AtomicU64, Ordering};

use signet_ir::{self as ir, Type};
use thiserror::Error;
use tracing::debug;

use crate::compiler::GraphCompiler;
use crate::error::CompileError;
use crate::graph::{CompileNode, Graph};
use crate::state::InitEmitter;

/// Dependant-process compute entry.
pub const PROCESS_SYMBOL: &str = "node_process";
/// Non-dependant push entry (consumes inputs).
pub const PUSH_SYMBOL: &str = "node_push";
/// Non-dependant pull entry (produces outputs).
pub const PULL_SYMBOL: &str = "node_pull";
/// Optional state initializer.
pub const INITIALIZE_SYMBOL: &str = "node_initialize";

static PLUGIN_NONCE: AtomicU64 = AtomicU64::new(1);

/// Errors from plugin loading.
#[derive(Debug, Clone, Error)]
pub enum PluginError {
    #[error("invalid plugin signature: {0}")]
    InvalidSignature(String),

    /// Either both `node_process` and the push/pull pair were provided, or
    /// neither was.
    #[error("exactly one compute api must be provided")]
    DuplicateCompute,

    /// A non-zero mutable-state size requires `node_initialize`.
    #[error("a node with mutable state requires `node_initialize`")]
    MissingInitialize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ComputeInfo {
    input_count: u32,
    output_count: u32,
    mutable_state_size: usize,
    uses_static_memory: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ComputeKind {
    Process,
    Push,
    Pull,
}

#[derive(Clone)]
enum ComputeSymbols {
    Process(String),
    PushPull { push: String, pull: String },
}

/// A loaded plugin: the namespaced module plus the metadata detected from
/// its signatures.
pub struct ExternalPlugin {
    module: ir::Module,
    info: ComputeInfo,
    compute: ComputeSymbols,
    initialize: Option<String>,
}

impl ExternalPlugin {
    /// Load a parsed plugin module: detect the API functions, validate
    /// their consistency, and rename every defined function into the
    /// plugin's namespace.
    pub fn load(mut module: ir::Module) -> Result<Self, PluginError> {
        let mut process = None;
        let mut push = None;
        let mut pull = None;
        let mut initialize = None;

        for function in module.functions() {
            if !function.is_definition() {
                continue;
            }
            match function.name.as_str() {
                PROCESS_SYMBOL => {
                    process = Some(classify_compute(function, ComputeKind::Process)?)
                }
                PUSH_SYMBOL => push = Some(classify_compute(function, ComputeKind::Push)?),
                PULL_SYMBOL => pull = Some(classify_compute(function, ComputeKind::Pull)?),
                INITIALIZE_SYMBOL => initialize = Some(classify_initialize(function)?),
                _ => {}
            }
        }

        // Exactly one compute API.
        let (info, has_push_pull) = match (process, push, pull) {
            (Some(info), None, None) => (info, false),
            (None, Some(push), Some(pull)) => {
                if push.mutable_state_size != pull.mutable_state_size
                    || push.uses_static_memory != pull.uses_static_memory
                {
                    return Err(PluginError::InvalidSignature(
                        "push and pull disagree on state or static memory".into(),
                    ));
                }
                (
                    ComputeInfo {
                        input_count: push.input_count,
                        output_count: pull.output_count,
                        ..push
                    },
                    true,
                )
            }
            _ => return Err(PluginError::DuplicateCompute),
        };

        match initialize {
            Some((state_size, uses_static)) => {
                if state_size != info.mutable_state_size
                    || uses_static != info.uses_static_memory
                    || info.mutable_state_size == 0
                {
                    return Err(PluginError::InvalidSignature(
                        "initialize and compute functions are not consistent".into(),
                    ));
                }
            }
            None => {
                if info.mutable_state_size != 0 {
                    return Err(PluginError::MissingInitialize);
                }
            }
        }

        let nonce = PLUGIN_NONCE.fetch_add(1, Ordering::Relaxed);
        let prefix = format!("plugin__{nonce}__");
        module
            .rename_defined(|name| Some(format!("{prefix}{name}")))
            .map_err(|e| PluginError::InvalidSignature(e.to_string()))?;

        debug!(
            inputs = info.input_count,
            outputs = info.output_count,
            state = info.mutable_state_size,
            static_memory = info.uses_static_memory,
            dependant = !has_push_pull,
            "loaded external plugin"
        );

        let compute = if has_push_pull {
            ComputeSymbols::PushPull {
                push: format!("{prefix}{PUSH_SYMBOL}"),
                pull: format!("{prefix}{PULL_SYMBOL}"),
            }
        } else {
            ComputeSymbols::Process(format!("{prefix}{PROCESS_SYMBOL}"))
        };
        let initialize =
            initialize.map(|_| format!("{prefix}{INITIALIZE_SYMBOL}"));

        Ok(Self {
            module,
            info,
            compute,
            initialize,
        })
    }

    /// A clone of the namespaced module, for linking into a context's
    /// library.
    pub fn ir_module(&self) -> ir::Module {
        self.module.clone()
    }

    /// A node emitting calls into this plugin's API.
    pub fn create_node(&self) -> PluginNode {
        PluginNode {
            info: self.info,
            compute: self.compute.clone(),
            initialize: self.initialize.clone(),
        }
    }
}

fn is_non_f32_pointer(ty: &Type) -> bool {
    matches!(ty.pointee(), Some(p) if *p != Type::F32)
}

fn classify_compute(
    function: &ir::Function,
    kind: ComputeKind,
) -> Result<ComputeInfo, PluginError> {
    let name = &function.name;
    if function.sig.ret.is_some() {
        return Err(PluginError::InvalidSignature(format!(
            "{name} must return void"
        )));
    }

    let params = &function.sig.params;
    let mut index = 0;

    let uses_static_memory = match params.first() {
        Some(p) if p.readonly && is_non_f32_pointer(&p.ty) => {
            index += 1;
            true
        }
        _ => false,
    };

    let mutable_state_size = match params.get(index) {
        Some(p) if is_non_f32_pointer(&p.ty) => {
            index += 1;
            p.ty.pointee().expect("checked").size_in_bytes() as usize
        }
        _ => 0,
    };

    let mut input_count = 0;
    if kind != ComputeKind::Pull {
        while matches!(params.get(index), Some(p) if p.ty == Type::F32) {
            input_count += 1;
            index += 1;
        }
    }

    let mut output_count = 0;
    if kind != ComputeKind::Push {
        while matches!(params.get(index), Some(p) if p.ty == Type::f32_ptr()) {
            output_count += 1;
            index += 1;
        }
    }

    if index != params.len() {
        return Err(PluginError::InvalidSignature(format!(
            "{name}: parameter {index} does not fit the calling convention"
        )));
    }

    Ok(ComputeInfo {
        input_count,
        output_count,
        mutable_state_size,
        uses_static_memory,
    })
}

/// `node_initialize(static?, state)`: returns (state size, static flag).
fn classify_initialize(function: &ir::Function) -> Result<(usize, bool), PluginError> {
    if function.sig.ret.is_some() {
        return Err(PluginError::InvalidSignature(
            "node_initialize must return void".into(),
        ));
    }
    let params = &function.sig.params;
    match params.len() {
        1 if is_non_f32_pointer(&params[0].ty) => Ok((
            params[0].ty.pointee().expect("checked").size_in_bytes() as usize,
            false,
        )),
        2 if params[0].readonly
            && is_non_f32_pointer(&params[0].ty)
            && is_non_f32_pointer(&params[1].ty) =>
        {
            Ok((
                params[1].ty.pointee().expect("checked").size_in_bytes() as usize,
                true,
            ))
        }
        _ => Err(PluginError::InvalidSignature(
            "invalid node_initialize signature".into(),
        )),
    }
}

/// A node that emits calls into a plugin's API functions.
///
/// Outputs come back through out-pointers: emission allocates a stack slot
/// per output, passes its address, and loads the result after the call,
/// preserving the plugin's natural multiple-return ABI.
pub struct PluginNode {
    info: ComputeInfo,
    compute: ComputeSymbols,
    initialize: Option<String>,
}

impl PluginNode {
    /// Pointer-cast `value` to the exact parameter type of the callee.
    fn cast_arg(
        compiler: &mut GraphCompiler<'_, '_>,
        value: ir::Value,
        target: &Type,
    ) -> ir::Value {
        compiler.ins().ptr_cast(value, target.clone())
    }

    fn call_compute(
        &self,
        compiler: &mut GraphCompiler<'_, '_>,
        symbol: &str,
        kind: ComputeKind,
        inputs: &[ir::Value],
        mutable_state: Option<ir::Value>,
        static_memory: Option<ir::Value>,
    ) -> Result<Option<Vec<ir::Value>>, CompileError> {
        let sig = compiler
            .module()
            .function(symbol)
            .ok_or_else(|| CompileError::MissingSymbol(symbol.to_string()))?
            .sig
            .clone();

        let mut output_ptrs = Vec::new();
        if kind != ComputeKind::Push {
            for _ in 0..self.info.output_count {
                output_ptrs.push(compiler.ins().alloca(Type::F32));
            }
        }

        let mut args = Vec::new();
        if self.info.uses_static_memory {
            let chunk = static_memory.expect("compiler provides the chunk or degrades");
            args.push(Self::cast_arg(compiler, chunk, &sig.params[args.len()].ty));
        }
        if self.info.mutable_state_size > 0 {
            let state = mutable_state.expect("node declares a state size");
            args.push(Self::cast_arg(compiler, state, &sig.params[args.len()].ty));
        }
        if kind != ComputeKind::Pull {
            args.extend_from_slice(inputs);
        }
        if kind != ComputeKind::Push {
            args.extend_from_slice(&output_ptrs);
        }

        compiler.call(symbol, &args)?;

        if kind == ComputeKind::Push {
            Ok(None)
        } else {
            let outputs = output_ptrs
                .into_iter()
                .map(|ptr| compiler.ins().load(ptr))
                .collect();
            Ok(Some(outputs))
        }
    }
}

impl CompileNode for PluginNode {
    fn input_count(&self) -> u32 {
        self.info.input_count
    }

    fn output_count(&self) -> u32 {
        self.info.output_count
    }

    fn mutable_state_size(&self) -> usize {
        self.info.mutable_state_size
    }

    fn uses_static_memory(&self) -> bool {
        self.info.uses_static_memory
    }

    fn is_dependant_process(&self) -> bool {
        matches!(self.compute, ComputeSymbols::Process(_))
    }

    fn initialize_mutable_state(
        &self,
        emit: &mut InitEmitter<'_, '_>,
        mutable_state: ir::Value,
        static_memory: Option<ir::Value>,
    ) -> Result<(), CompileError> {
        if self.info.mutable_state_size == 0 {
            return Ok(());
        }
        let symbol = self
            .initialize
            .as_ref()
            .ok_or_else(|| CompileError::MissingSymbol(INITIALIZE_SYMBOL.to_string()))?;
        let sig = emit
            .signature(symbol)
            .ok_or_else(|| CompileError::MissingSymbol(symbol.clone()))?
            .clone();

        let mut args = Vec::new();
        if self.info.uses_static_memory {
            let chunk = static_memory.expect("state manager provides the chunk");
            args.push(emit.ins().ptr_cast(chunk, sig.params[0].ty.clone()));
        }
        let state_ty = sig.params[args.len()].ty.clone();
        args.push(emit.ins().ptr_cast(mutable_state, state_ty));

        emit.call(symbol, &args)?;
        Ok(())
    }

    fn emit_outputs(
        &self,
        compiler: &mut GraphCompiler<'_, '_>,
        _graph: &Graph,
        inputs: &[ir::Value],
        mutable_state: Option<ir::Value>,
        static_memory: Option<ir::Value>,
    ) -> Result<Vec<ir::Value>, CompileError> {
        let ComputeSymbols::Process(symbol) = &self.compute else {
            return Err(CompileError::UnsupportedComputeApi);
        };
        let outputs = self.call_compute(
            compiler,
            symbol,
            ComputeKind::Process,
            inputs,
            mutable_state,
            static_memory,
        )?;
        Ok(outputs.expect("process produces outputs"))
    }

    fn pull_outputs(
        &self,
        compiler: &mut GraphCompiler<'_, '_>,
        mutable_state: Option<ir::Value>,
        static_memory: Option<ir::Value>,
    ) -> Result<Vec<ir::Value>, CompileError> {
        let ComputeSymbols::PushPull { pull, .. } = &self.compute else {
            return Err(CompileError::UnsupportedComputeApi);
        };
        let outputs = self.call_compute(
            compiler,
            pull,
            ComputeKind::Pull,
            &[],
            mutable_state,
            static_memory,
        )?;
        Ok(outputs.expect("pull produces outputs"))
    }

    fn push_inputs(
        &self,
        compiler: &mut GraphCompiler<'_, '_>,
        inputs: &[ir::Value],
        mutable_state: Option<ir::Value>,
        static_memory: Option<ir::Value>,
    ) -> Result<(), CompileError> {
        let ComputeSymbols::PushPull { push, .. } = &self.compute else {
            return Err(CompileError::UnsupportedComputeApi);
        };
        self.call_compute(
            compiler,
            push,
            ComputeKind::Push,
            inputs,
            mutable_state,
            static_memory,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signet_ir::{FuncBuilder, Linkage, Param, Signature};

    fn void_fn(name: &str, params: Vec<Param>) -> ir::Function {
        let mut b = FuncBuilder::new(name, Signature::new(params, None), Linkage::External);
        b.ret(None);
        b.finish()
    }

    fn module_with(functions: Vec<ir::Function>) -> ir::Module {
        let mut m = ir::Module::new("plugin");
        for f in functions {
            m.add_function(f).unwrap();
        }
        m
    }

    #[test]
    fn classifies_a_stateless_process_plugin() {
        let m = module_with(vec![void_fn(
            PROCESS_SYMBOL,
            vec![
                Param::new(Type::F32),
                Param::new(Type::F32),
                Param::new(Type::f32_ptr()),
            ],
        )]);
        let plugin = ExternalPlugin::load(m).unwrap();
        let node = plugin.create_node();
        assert_eq!(node.input_count(), 2);
        assert_eq!(node.output_count(), 1);
        assert_eq!(node.mutable_state_size(), 0);
        assert!(!node.uses_static_memory());
        assert!(node.is_dependant_process());
    }

    #[test]
    fn classifies_state_and_static_memory() {
        let state_ty = Type::ptr_to(Type::Bytes(12));
        let m = module_with(vec![
            void_fn(
                PROCESS_SYMBOL,
                vec![
                    Param::readonly(Type::byte_ptr()),
                    Param::new(state_ty.clone()),
                    Param::new(Type::F32),
                    Param::new(Type::f32_ptr()),
                ],
            ),
            void_fn(
                INITIALIZE_SYMBOL,
                vec![Param::readonly(Type::byte_ptr()), Param::new(state_ty)],
            ),
        ]);
        let plugin = ExternalPlugin::load(m).unwrap();
        let node = plugin.create_node();
        assert_eq!(node.mutable_state_size(), 12);
        assert!(node.uses_static_memory());
    }

    #[test]
    fn classifies_a_push_pull_plugin() {
        let state_ty = Type::ptr_to(Type::Bytes(4));
        let m = module_with(vec![
            void_fn(
                PUSH_SYMBOL,
                vec![Param::new(state_ty.clone()), Param::new(Type::F32)],
            ),
            void_fn(
                PULL_SYMBOL,
                vec![Param::new(state_ty.clone()), Param::new(Type::f32_ptr())],
            ),
            void_fn(INITIALIZE_SYMBOL, vec![Param::new(state_ty)]),
        ]);
        let plugin = ExternalPlugin::load(m).unwrap();
        let node = plugin.create_node();
        assert!(!node.is_dependant_process());
        assert_eq!(node.input_count(), 1);
        assert_eq!(node.output_count(), 1);
        assert_eq!(node.mutable_state_size(), 4);
    }

    #[test]
    fn rejects_both_compute_apis() {
        let m = module_with(vec![
            void_fn(PROCESS_SYMBOL, vec![Param::new(Type::F32)]),
            void_fn(PUSH_SYMBOL, vec![Param::new(Type::F32)]),
            void_fn(PULL_SYMBOL, vec![Param::new(Type::f32_ptr())]),
        ]);
        assert!(matches!(
            ExternalPlugin::load(m),
            Err(PluginError::DuplicateCompute)
        ));
    }

    #[test]
    fn rejects_a_module_without_compute() {
        let m = module_with(vec![void_fn("helper", vec![])]);
        assert!(matches!(
            ExternalPlugin::load(m),
            Err(PluginError::DuplicateCompute)
        ));
    }

    #[test]
    fn rejects_missing_pull() {
        let m = module_with(vec![void_fn(PUSH_SYMBOL, vec![Param::new(Type::F32)])]);
        assert!(matches!(
            ExternalPlugin::load(m),
            Err(PluginError::DuplicateCompute)
        ));
    }

    #[test]
    fn state_requires_initialize() {
        let m = module_with(vec![void_fn(
            PROCESS_SYMBOL,
            vec![Param::new(Type::ptr_to(Type::Bytes(8))), Param::new(Type::F32)],
        )]);
        assert!(matches!(
            ExternalPlugin::load(m),
            Err(PluginError::MissingInitialize)
        ));
    }

    #[test]
    fn rejects_inconsistent_initialize() {
        let m = module_with(vec![
            void_fn(
                PROCESS_SYMBOL,
                vec![Param::new(Type::ptr_to(Type::Bytes(8))), Param::new(Type::F32)],
            ),
            void_fn(
                INITIALIZE_SYMBOL,
                vec![Param::new(Type::ptr_to(Type::Bytes(4)))],
            ),
        ]);
        assert!(matches!(
            ExternalPlugin::load(m),
            Err(PluginError::InvalidSignature(_))
        ));
    }

    #[test]
    fn rejects_push_pull_disagreement() {
        let m = module_with(vec![
            void_fn(
                PUSH_SYMBOL,
                vec![Param::new(Type::ptr_to(Type::Bytes(4))), Param::new(Type::F32)],
            ),
            void_fn(
                PULL_SYMBOL,
                vec![
                    Param::new(Type::ptr_to(Type::Bytes(8))),
                    Param::new(Type::f32_ptr()),
                ],
            ),
            void_fn(
                INITIALIZE_SYMBOL,
                vec![Param::new(Type::ptr_to(Type::Bytes(4)))],
            ),
        ]);
        assert!(matches!(
            ExternalPlugin::load(m),
            Err(PluginError::InvalidSignature(_))
        ));
    }

    #[test]
    fn rejects_trailing_parameters() {
        let m = module_with(vec![void_fn(
            PROCESS_SYMBOL,
            vec![
                Param::new(Type::F32),
                Param::new(Type::f32_ptr()),
                // An input after the outputs violates rule 5.
                Param::new(Type::F32),
            ],
        )]);
        assert!(matches!(
            ExternalPlugin::load(m),
            Err(PluginError::InvalidSignature(_))
        ));
    }

    #[test]
    fn rejects_inputs_on_pull() {
        let m = module_with(vec![
            void_fn(PUSH_SYMBOL, vec![Param::new(Type::F32)]),
            void_fn(
                PULL_SYMBOL,
                vec![Param::new(Type::F32), Param::new(Type::f32_ptr())],
            ),
        ]);
        assert!(matches!(
            ExternalPlugin::load(m),
            Err(PluginError::InvalidSignature(_))
        ));
    }

    #[test]
    fn mangles_every_defined_function() {
        let m = module_with(vec![
            void_fn(PROCESS_SYMBOL, vec![Param::new(Type::F32)]),
            void_fn("helper", vec![]),
        ]);
        let plugin = ExternalPlugin::load(m).unwrap();
        let module = plugin.ir_module();
        assert!(module.function(PROCESS_SYMBOL).is_none());
        assert!(module.function("helper").is_none());
        let names: Vec<&str> = module.functions().map(|f| f.name.as_str()).collect();
        assert!(names.iter().all(|n| n.starts_with("plugin__")));
        assert!(names.iter().any(|n| n.ends_with(PROCESS_SYMBOL)));
        assert!(names.iter().any(|n| n.ends_with("helper")));
    }

    #[test]
    fn two_plugins_get_distinct_namespaces() {
        let make = || {
            module_with(vec![void_fn(
                PROCESS_SYMBOL,
                vec![Param::new(Type::F32), Param::new(Type::f32_ptr())],
            )])
        };
        let a = ExternalPlugin::load(make()).unwrap();
        let b = ExternalPlugin::load(make()).unwrap();

        let mut library = ir::Module::new("library");
        library.link(a.ir_module()).unwrap();
        // Distinct prefixes keep identical public symbols from colliding.
        library.link(b.ir_module()).unwrap();
    }
}
