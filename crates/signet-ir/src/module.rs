use std::collections::{BTreeMap, HashMap};

use thiserror::Error;

use crate::types::Type;

/// Errors produced by module construction, linking and verification.
#[derive(Debug, Clone, Error)]
pub enum IrError {
    #[error("duplicate function definition: {0}")]
    DuplicateFunction(String),

    #[error("symbol not found in module: {0}")]
    MissingSymbol(String),

    #[error("call to `{callee}` does not match its signature")]
    SignatureMismatch { callee: String },

    #[error("unresolved global: {0}")]
    UnresolvedGlobal(String),

    #[error("malformed function `{function}`: {message}")]
    Malformed { function: String, message: String },
}

/// Dense SSA value id.
///
/// Function parameters occupy ids `0..param_count`; each instruction defines
/// the next id in order. Instructions without a result still consume an id,
/// which the verifier rejects any use of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Value(pub u32);

impl Value {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A single straight-line instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Inst {
    ConstF32(f32),
    ConstI64(i64),
    /// A host address embedded as a typed pointer constant.
    ConstPtr { addr: usize, ty: Type },
    /// Read of a named module-level `f32` global. Folded to a constant by
    /// `opt::resolve_globals` before lowering.
    GlobalGet(String),

    FAdd(Value, Value),
    FSub(Value, Value),
    FMul(Value, Value),
    FDiv(Value, Value),
    FNeg(Value),

    IAdd(Value, Value),
    IMul(Value, Value),

    /// `base + index * stride`, preserving the base pointer type.
    Gep { base: Value, index: Value, stride: u32 },

    Load { ptr: Value },
    Store { ptr: Value, value: Value },

    /// Stack slot of the given type; yields a pointer to it.
    Alloca(Type),

    /// Pointer reinterpretation; no-op at the machine level.
    PtrCast { value: Value, ty: Type },

    /// Call of a module function. The return type is recorded at build time
    /// and cross-checked against the callee by the verifier.
    Call { callee: String, args: Vec<Value>, ret: Option<Type> },

    Ret(Option<Value>),
}

impl Inst {
    /// Operand values of this instruction.
    pub fn operands(&self) -> Vec<Value> {
        match self {
            Inst::ConstF32(_)
            | Inst::ConstI64(_)
            | Inst::ConstPtr { .. }
            | Inst::GlobalGet(_)
            | Inst::Alloca(_) => Vec::new(),
            Inst::FAdd(a, b)
            | Inst::FSub(a, b)
            | Inst::FMul(a, b)
            | Inst::FDiv(a, b)
            | Inst::IAdd(a, b)
            | Inst::IMul(a, b) => vec![*a, *b],
            Inst::FNeg(a) => vec![*a],
            Inst::Gep { base, index, .. } => vec![*base, *index],
            Inst::Load { ptr } => vec![*ptr],
            Inst::Store { ptr, value } => vec![*ptr, *value],
            Inst::PtrCast { value, .. } => vec![*value],
            Inst::Call { args, .. } => args.clone(),
            Inst::Ret(v) => v.iter().copied().collect(),
        }
    }

    /// Rewrite every operand through `f`.
    pub fn map_operands(&mut self, mut f: impl FnMut(Value) -> Value) {
        match self {
            Inst::ConstF32(_)
            | Inst::ConstI64(_)
            | Inst::ConstPtr { .. }
            | Inst::GlobalGet(_)
            | Inst::Alloca(_) => {}
            Inst::FAdd(a, b)
            | Inst::FSub(a, b)
            | Inst::FMul(a, b)
            | Inst::FDiv(a, b)
            | Inst::IAdd(a, b)
            | Inst::IMul(a, b) => {
                *a = f(*a);
                *b = f(*b);
            }
            Inst::FNeg(a) => *a = f(*a),
            Inst::Gep { base, index, .. } => {
                *base = f(*base);
                *index = f(*index);
            }
            Inst::Load { ptr } => *ptr = f(*ptr),
            Inst::Store { ptr, value } => {
                *ptr = f(*ptr);
                *value = f(*value);
            }
            Inst::PtrCast { value, .. } => *value = f(*value),
            Inst::Call { args, .. } => {
                for a in args {
                    *a = f(*a);
                }
            }
            Inst::Ret(Some(v)) => *v = f(*v),
            Inst::Ret(None) => {}
        }
    }

    /// Whether removing this instruction (given an unused result) changes
    /// observable behavior.
    pub fn has_side_effect(&self) -> bool {
        matches!(self, Inst::Store { .. } | Inst::Call { .. } | Inst::Ret(_))
    }
}

/// Function parameter: a type plus the `readonly` attribute used by the
/// plugin calling convention to mark static-memory pointers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub ty: Type,
    pub readonly: bool,
}

impl Param {
    pub fn new(ty: Type) -> Self {
        Self { ty, readonly: false }
    }

    pub fn readonly(ty: Type) -> Self {
        Self { ty, readonly: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Signature {
    pub params: Vec<Param>,
    pub ret: Option<Type>,
}

impl Signature {
    pub fn new(params: Vec<Param>, ret: Option<Type>) -> Self {
        Self { params, ret }
    }
}

/// Function linkage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkage {
    /// Visible outside the module; a global-DCE root.
    External,
    /// Module-local; removable once unreferenced.
    Internal,
    /// Declaration of a host-provided symbol.
    Import,
}

#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub sig: Signature,
    pub linkage: Linkage,
    /// `None` for declarations.
    pub body: Option<Vec<Inst>>,
}

impl Function {
    pub fn is_definition(&self) -> bool {
        self.body.is_some()
    }

    /// Infer the type of every value id in this function.
    ///
    /// `None` entries are void results. Errors describe the first malformed
    /// instruction encountered.
    pub fn value_types(&self) -> Result<Vec<Option<Type>>, IrError> {
        let body = self.body.as_deref().unwrap_or(&[]);
        let mut types: Vec<Option<Type>> =
            self.sig.params.iter().map(|p| Some(p.ty.clone())).collect();

        let malformed = |message: String| IrError::Malformed {
            function: self.name.clone(),
            message,
        };

        for (i, inst) in body.iter().enumerate() {
            let id = types.len();
            let operand = |v: Value| -> Result<Type, IrError> {
                if v.index() >= id {
                    return Err(malformed(format!("v{} used before definition", v.0)));
                }
                types[v.index()]
                    .clone()
                    .ok_or_else(|| malformed(format!("v{} is a void value", v.0)))
            };
            let float = |v: Value| -> Result<(), IrError> {
                match operand(v)? {
                    Type::F32 => Ok(()),
                    other => Err(malformed(format!("expected f32 operand, got {other}"))),
                }
            };
            let int = |v: Value| -> Result<(), IrError> {
                match operand(v)? {
                    Type::I64 => Ok(()),
                    other => Err(malformed(format!("expected i64 operand, got {other}"))),
                }
            };

            let ty = match inst {
                Inst::ConstF32(_) => Some(Type::F32),
                Inst::ConstI64(_) => Some(Type::I64),
                Inst::ConstPtr { ty, .. } => {
                    if !ty.is_ptr() {
                        return Err(malformed(format!("const_ptr of non-pointer type {ty}")));
                    }
                    Some(ty.clone())
                }
                Inst::GlobalGet(_) => Some(Type::F32),
                Inst::FAdd(a, b) | Inst::FSub(a, b) | Inst::FMul(a, b) | Inst::FDiv(a, b) => {
                    float(*a)?;
                    float(*b)?;
                    Some(Type::F32)
                }
                Inst::FNeg(a) => {
                    float(*a)?;
                    Some(Type::F32)
                }
                Inst::IAdd(a, b) | Inst::IMul(a, b) => {
                    int(*a)?;
                    int(*b)?;
                    Some(Type::I64)
                }
                Inst::Gep { base, index, .. } => {
                    let base_ty = operand(*base)?;
                    if !base_ty.is_ptr() {
                        return Err(malformed(format!("gep base is not a pointer: {base_ty}")));
                    }
                    int(*index)?;
                    Some(base_ty)
                }
                Inst::Load { ptr } => {
                    let ptr_ty = operand(*ptr)?;
                    match ptr_ty.pointee() {
                        Some(Type::F32) => Some(Type::F32),
                        Some(Type::I64) => Some(Type::I64),
                        _ => {
                            return Err(malformed(format!("load through {ptr_ty}")));
                        }
                    }
                }
                Inst::Store { ptr, value } => {
                    let ptr_ty = operand(*ptr)?;
                    let value_ty = operand(*value)?;
                    match ptr_ty.pointee() {
                        Some(p) if *p == value_ty => None,
                        _ => {
                            return Err(malformed(format!(
                                "store of {value_ty} through {ptr_ty}"
                            )));
                        }
                    }
                }
                Inst::Alloca(ty) => Some(Type::ptr_to(ty.clone())),
                Inst::PtrCast { value, ty } => {
                    let value_ty = operand(*value)?;
                    if !value_ty.is_ptr() || !ty.is_ptr() {
                        return Err(malformed(format!("ptr_cast {value_ty} -> {ty}")));
                    }
                    Some(ty.clone())
                }
                Inst::Call { args, ret, .. } => {
                    for a in args {
                        operand(*a)?;
                    }
                    ret.clone()
                }
                Inst::Ret(v) => {
                    if let Some(v) = v {
                        let got = operand(*v)?;
                        match &self.sig.ret {
                            Some(expected) if *expected == got => {}
                            other => {
                                return Err(malformed(format!(
                                    "return of {got}, signature says {other:?}"
                                )));
                            }
                        }
                    } else if self.sig.ret.is_some() {
                        return Err(malformed("missing return value".into()));
                    }
                    if i + 1 != body.len() {
                        return Err(malformed("ret before the end of the body".into()));
                    }
                    None
                }
            };
            types.push(ty);
        }

        Ok(types)
    }
}

/// An IR module: ordered named functions plus named `f32` globals.
///
/// Cloning a module is the clone primitive used to link a fresh copy of the
/// library into every compiled graph module.
#[derive(Debug, Clone, Default)]
pub struct Module {
    name: String,
    functions: Vec<Function>,
    index: HashMap<String, usize>,
    globals: BTreeMap<String, f32>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a function to the module.
    ///
    /// A declaration may be superseded by a definition with the same
    /// signature (and vice versa, the definition wins); two definitions of
    /// the same name are an error.
    pub fn add_function(&mut self, function: Function) -> Result<(), IrError> {
        match self.index.get(&function.name) {
            None => {
                self.index.insert(function.name.clone(), self.functions.len());
                self.functions.push(function);
                Ok(())
            }
            Some(&i) => {
                let existing = &self.functions[i];
                if existing.sig != function.sig {
                    return Err(IrError::SignatureMismatch {
                        callee: function.name,
                    });
                }
                if existing.is_definition() && function.is_definition() {
                    return Err(IrError::DuplicateFunction(function.name));
                }
                if function.is_definition() {
                    self.functions[i] = function;
                }
                Ok(())
            }
        }
    }

    /// Link another module into this one.
    pub fn link(&mut self, other: Module) -> Result<(), IrError> {
        for function in other.functions {
            self.add_function(function)?;
        }
        self.globals.extend(other.globals);
        Ok(())
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.index.get(name).map(|&i| &self.functions[i])
    }

    pub fn functions(&self) -> impl Iterator<Item = &Function> {
        self.functions.iter()
    }

    pub fn set_global(&mut self, name: impl Into<String>, value: f32) {
        self.globals.insert(name.into(), value);
    }

    pub fn global(&self, name: &str) -> Option<f32> {
        self.globals.get(name).copied()
    }

    pub fn globals(&self) -> impl Iterator<Item = (&str, f32)> {
        self.globals.iter().map(|(n, v)| (n.as_str(), *v))
    }

    /// Rename defined functions through `rename`, rewriting every call site
    /// in the module to match. Declarations keep their names.
    pub fn rename_defined(
        &mut self,
        mut rename: impl FnMut(&str) -> Option<String>,
    ) -> Result<(), IrError> {
        let mut renames: HashMap<String, String> = HashMap::new();
        for function in &self.functions {
            if !function.is_definition() {
                continue;
            }
            if let Some(new_name) = rename(&function.name) {
                renames.insert(function.name.clone(), new_name);
            }
        }

        for function in &mut self.functions {
            if let Some(new_name) = renames.get(&function.name) {
                function.name = new_name.clone();
            }
            if let Some(body) = &mut function.body {
                for inst in body {
                    if let Inst::Call { callee, .. } = inst {
                        if let Some(new_name) = renames.get(callee) {
                            *callee = new_name.clone();
                        }
                    }
                }
            }
        }

        self.rebuild_index()
    }

    /// Demote every defined function not named in `keep` to internal
    /// linkage, so dead-function elimination can strip what the kept entry
    /// points do not reach.
    pub fn internalize_except(&mut self, keep: &[&str]) {
        for function in &mut self.functions {
            if function.is_definition() && !keep.contains(&function.name.as_str()) {
                function.linkage = Linkage::Internal;
            }
        }
    }

    pub(crate) fn retain_functions(&mut self, mut keep: impl FnMut(&Function) -> bool) {
        self.functions.retain(|f| keep(f));
        self.rebuild_index().expect("retain cannot introduce duplicates");
    }

    pub(crate) fn functions_mut(&mut self) -> impl Iterator<Item = &mut Function> {
        self.functions.iter_mut()
    }

    fn rebuild_index(&mut self) -> Result<(), IrError> {
        self.index.clear();
        for (i, function) in self.functions.iter().enumerate() {
            if self.index.insert(function.name.clone(), i).is_some() {
                return Err(IrError::DuplicateFunction(function.name.clone()));
            }
        }
        Ok(())
    }
}
