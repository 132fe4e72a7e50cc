//! Cranelift-backed execution engine.
//!
//! Each added IR module is lowered into its own `JITModule`, so a module's
//! native code can be released independently once the reclamation protocol
//! has proven no thread can still be executing it.

use std::collections::HashMap;

use cranelift_codegen::ir::{
    types, AbiParam, InstBuilder, MemFlags, StackSlotData, StackSlotKind, UserFuncName,
    Value as ClifValue,
};
use cranelift_codegen::isa::OwnedTargetIsa;
use cranelift_codegen::settings::{self, Configurable};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{default_libcall_names, FuncId, Linkage as ClifLinkage, Module};
use serde::{Deserialize, Serialize};
use signet_ir::{self as ir, Inst, Type};

use super::{ExecutionEngine, ModuleId};
use crate::error::EngineError;

/// Native code generation effort, forwarded to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OptLevel {
    None,
    Less,
    #[default]
    Default,
    Aggressive,
}

impl OptLevel {
    fn cranelift_flag(self) -> &'static str {
        match self {
            OptLevel::None | OptLevel::Less => "none",
            OptLevel::Default => "speed",
            OptLevel::Aggressive => "speed_and_size",
        }
    }
}

struct LoadedModule {
    jit: Option<JITModule>,
    functions: HashMap<String, FuncId>,
    finalized: bool,
}

/// JIT execution engine over `cranelift-jit`, one `JITModule` per added IR
/// module.
pub struct CraneliftEngine {
    isa: OwnedTargetIsa,
    symbols: Vec<(String, *const u8)>,
    modules: HashMap<ModuleId, LoadedModule>,
    next_id: u64,
}

// The engine is handed between threads only as a whole (it moves with its
// execution context); all mutation goes through `&mut self`, and the raw
// symbol addresses are plain function pointers.
unsafe impl Send for CraneliftEngine {}

impl CraneliftEngine {
    /// Configure Cranelift for the host machine.
    pub fn new(opt_level: OptLevel) -> Result<Self, EngineError> {
        let mut flag_builder = settings::builder();
        flag_builder
            .set("opt_level", opt_level.cranelift_flag())
            .expect("opt_level flag exists");
        flag_builder.set("is_pic", "false").expect("is_pic flag exists");

        let isa_builder =
            cranelift_native::builder().map_err(|msg| EngineError::Host(msg.to_string()))?;
        let isa = isa_builder
            .finish(settings::Flags::new(flag_builder))
            .map_err(|e| EngineError::Host(e.to_string()))?;

        if isa.pointer_type() != types::I64 {
            return Err(EngineError::Host("a 64-bit target is required".into()));
        }

        Ok(Self {
            isa,
            symbols: Vec::new(),
            modules: HashMap::new(),
            next_id: 0,
        })
    }

    /// Register a host symbol resolvable by `import`-linkage declarations
    /// in subsequently added modules.
    pub fn with_symbol(mut self, name: impl Into<String>, addr: *const u8) -> Self {
        self.symbols.push((name.into(), addr));
        self
    }

    fn lower_signature(
        &self,
        jit: &JITModule,
        sig: &ir::Signature,
    ) -> Result<cranelift_codegen::ir::Signature, EngineError> {
        let mut lowered = jit.make_signature();
        for param in &sig.params {
            lowered.params.push(AbiParam::new(lower_type(&param.ty)?));
        }
        if let Some(ret) = &sig.ret {
            lowered.returns.push(AbiParam::new(lower_type(ret)?));
        }
        Ok(lowered)
    }
}

fn lower_type(ty: &Type) -> Result<cranelift_codegen::ir::Type, EngineError> {
    match ty {
        Type::F32 => Ok(types::F32),
        Type::I64 => Ok(types::I64),
        Type::Ptr(_) => Ok(types::I64),
        Type::Bytes(_) => Err(EngineError::Codegen(
            "by-value bytes are not a machine type".into(),
        )),
    }
}

impl ExecutionEngine for CraneliftEngine {
    fn add_module(&mut self, module: ir::Module) -> Result<ModuleId, EngineError> {
        let mut builder = JITBuilder::with_isa(self.isa.clone(), default_libcall_names());
        for (name, addr) in &self.symbols {
            builder.symbol(name.clone(), *addr);
        }
        let mut jit = JITModule::new(builder);

        let mut functions: HashMap<String, FuncId> = HashMap::new();
        for function in module.functions() {
            let sig = self.lower_signature(&jit, &function.sig)?;
            let linkage = match (function.linkage, function.is_definition()) {
                (_, false) | (ir::Linkage::Import, _) => ClifLinkage::Import,
                (ir::Linkage::External, true) => ClifLinkage::Export,
                (ir::Linkage::Internal, true) => ClifLinkage::Local,
            };
            let id = jit
                .declare_function(&function.name, linkage, &sig)
                .map_err(|e| EngineError::Module(e.to_string()))?;
            functions.insert(function.name.clone(), id);
        }

        let mut fb_ctx = FunctionBuilderContext::new();
        for function in module.functions().filter(|f| f.is_definition()) {
            let func_id = functions[&function.name];
            let mut ctx = jit.make_context();
            ctx.func.signature = self.lower_signature(&jit, &function.sig)?;
            ctx.func.name = UserFuncName::user(0, func_id.as_u32());

            define_body(&mut jit, &mut ctx.func, &mut fb_ctx, function, &functions)?;

            jit.define_function(func_id, &mut ctx)
                .map_err(|e| EngineError::Codegen(e.to_string()))?;
            jit.clear_context(&mut ctx);
        }

        self.next_id += 1;
        let id = ModuleId(self.next_id);
        self.modules.insert(
            id,
            LoadedModule {
                jit: Some(jit),
                functions,
                finalized: false,
            },
        );
        Ok(id)
    }

    fn emit_native_code(&mut self) -> Result<(), EngineError> {
        for module in self.modules.values_mut() {
            if module.finalized {
                continue;
            }
            module
                .jit
                .as_mut()
                .expect("present until deleted")
                .finalize_definitions()
                .map_err(|e| EngineError::Codegen(e.to_string()))?;
            module.finalized = true;
        }
        Ok(())
    }

    fn function_pointer(&self, module: ModuleId, name: &str) -> Option<*const u8> {
        let module = self.modules.get(&module)?;
        if !module.finalized {
            return None;
        }
        let id = module.functions.get(name)?;
        Some(module.jit.as_ref()?.get_finalized_function(*id))
    }

    fn delete_module(&mut self, module: ModuleId) {
        if let Some(mut loaded) = self.modules.remove(&module) {
            if let Some(jit) = loaded.jit.take() {
                // The reclamation protocol guarantees no thread can still
                // be executing this module's code.
                unsafe { jit.free_memory() };
            }
        }
    }
}

impl Drop for CraneliftEngine {
    fn drop(&mut self) {
        let ids: Vec<ModuleId> = self.modules.keys().copied().collect();
        for id in ids {
            self.delete_module(id);
        }
    }
}

/// Translate a straight-line IR body into a single Cranelift block.
fn define_body(
    jit: &mut JITModule,
    func: &mut cranelift_codegen::ir::Function,
    fb_ctx: &mut FunctionBuilderContext,
    function: &ir::Function,
    functions: &HashMap<String, FuncId>,
) -> Result<(), EngineError> {
    let body = function.body.as_deref().expect("definition");
    match body.last() {
        Some(Inst::Ret(_)) => {}
        _ => {
            return Err(EngineError::Codegen(format!(
                "function {} has an unterminated body",
                function.name
            )));
        }
    }
    let value_types = function
        .value_types()
        .map_err(|e| EngineError::Codegen(e.to_string()))?;

    let mut b = FunctionBuilder::new(func, fb_ctx);
    let entry = b.create_block();
    b.append_block_params_for_function_params(entry);
    b.switch_to_block(entry);
    b.seal_block(entry);

    let param_count = function.sig.params.len();
    let mut map: Vec<Option<ClifValue>> = vec![None; param_count + body.len()];
    for i in 0..param_count {
        map[i] = Some(b.block_params(entry)[i]);
    }

    let operand = |map: &[Option<ClifValue>], v: ir::Value| -> Result<ClifValue, EngineError> {
        map[v.index()]
            .ok_or_else(|| EngineError::Codegen(format!("void operand v{}", v.0)))
    };

    for (i, inst) in body.iter().enumerate() {
        let id = param_count + i;
        let result = match inst {
            Inst::ConstF32(v) => Some(b.ins().f32const(*v)),
            Inst::ConstI64(v) => Some(b.ins().iconst(types::I64, *v)),
            Inst::ConstPtr { addr, .. } => Some(b.ins().iconst(types::I64, *addr as i64)),
            Inst::GlobalGet(name) => {
                return Err(EngineError::Codegen(format!(
                    "unresolved global `{name}` reached lowering"
                )));
            }
            Inst::FAdd(x, y) => {
                let (x, y) = (operand(&map, *x)?, operand(&map, *y)?);
                Some(b.ins().fadd(x, y))
            }
            Inst::FSub(x, y) => {
                let (x, y) = (operand(&map, *x)?, operand(&map, *y)?);
                Some(b.ins().fsub(x, y))
            }
            Inst::FMul(x, y) => {
                let (x, y) = (operand(&map, *x)?, operand(&map, *y)?);
                Some(b.ins().fmul(x, y))
            }
            Inst::FDiv(x, y) => {
                let (x, y) = (operand(&map, *x)?, operand(&map, *y)?);
                Some(b.ins().fdiv(x, y))
            }
            Inst::FNeg(x) => {
                let x = operand(&map, *x)?;
                Some(b.ins().fneg(x))
            }
            Inst::IAdd(x, y) => {
                let (x, y) = (operand(&map, *x)?, operand(&map, *y)?);
                Some(b.ins().iadd(x, y))
            }
            Inst::IMul(x, y) => {
                let (x, y) = (operand(&map, *x)?, operand(&map, *y)?);
                Some(b.ins().imul(x, y))
            }
            Inst::Gep { base, index, stride } => {
                let base = operand(&map, *base)?;
                let index = operand(&map, *index)?;
                let stride = b.ins().iconst(types::I64, *stride as i64);
                let offset = b.ins().imul(index, stride);
                Some(b.ins().iadd(base, offset))
            }
            Inst::Load { ptr } => {
                let addr = operand(&map, *ptr)?;
                let ty = value_types[id]
                    .as_ref()
                    .map(lower_type)
                    .transpose()?
                    .ok_or_else(|| EngineError::Codegen("void load".into()))?;
                Some(b.ins().load(ty, MemFlags::new(), addr, 0))
            }
            Inst::Store { ptr, value } => {
                let addr = operand(&map, *ptr)?;
                let value = operand(&map, *value)?;
                b.ins().store(MemFlags::new(), value, addr, 0);
                None
            }
            Inst::Alloca(ty) => {
                let slot = b.create_sized_stack_slot(StackSlotData::new(
                    StackSlotKind::ExplicitSlot,
                    ty.size_in_bytes(),
                    3,
                ));
                Some(b.ins().stack_addr(types::I64, slot, 0))
            }
            Inst::PtrCast { value, .. } => Some(operand(&map, *value)?),
            Inst::Call { callee, args, ret } => {
                let func_id = functions.get(callee).ok_or_else(|| {
                    EngineError::Codegen(format!("call to undeclared function `{callee}`"))
                })?;
                let callee_ref = jit.declare_func_in_func(*func_id, b.func);
                let mut lowered_args = Vec::with_capacity(args.len());
                for a in args {
                    lowered_args.push(operand(&map, *a)?);
                }
                let call = b.ins().call(callee_ref, &lowered_args);
                match ret {
                    Some(_) => Some(b.inst_results(call)[0]),
                    None => None,
                }
            }
            Inst::Ret(v) => {
                match v {
                    Some(v) => {
                        let value = operand(&map, *v)?;
                        b.ins().return_(&[value]);
                    }
                    None => {
                        b.ins().return_(&[]);
                    }
                }
                None
            }
        };
        map[id] = result;
    }

    b.finalize();
    Ok(())
}
