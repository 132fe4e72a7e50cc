use crate::module::{Function, Inst, IrError, Linkage, Module, Signature, Value};
use crate::types::Type;

/// SSA instruction builder for a single straight-line function.
///
/// Emission methods panic on type misuse: the builder is an internal tool
/// for trusted code generators, and the panics surface compiler bugs at the
/// point of emission rather than at verification. Only [`FuncBuilder::call`]
/// is fallible, because symbol lookup genuinely depends on module contents.
pub struct FuncBuilder {
    name: String,
    sig: Signature,
    linkage: Linkage,
    insts: Vec<Inst>,
    types: Vec<Option<Type>>,
}

impl FuncBuilder {
    pub fn new(name: impl Into<String>, sig: Signature, linkage: Linkage) -> Self {
        let types = sig.params.iter().map(|p| Some(p.ty.clone())).collect();
        Self {
            name: name.into(),
            sig,
            linkage,
            insts: Vec::new(),
            types,
        }
    }

    /// The `i`th function parameter as a value.
    pub fn param(&self, i: usize) -> Value {
        assert!(i < self.sig.params.len(), "parameter {i} out of range");
        Value(i as u32)
    }

    /// Type of an already-defined value.
    pub fn value_type(&self, v: Value) -> &Type {
        self.types[v.index()]
            .as_ref()
            .expect("queried the type of a void value")
    }

    fn push(&mut self, inst: Inst, ty: Option<Type>) -> Value {
        self.insts.push(inst);
        self.types.push(ty);
        Value((self.types.len() - 1) as u32)
    }

    fn expect(&self, v: Value, ty: &Type, what: &str) {
        assert_eq!(self.value_type(v), ty, "{what}: type mismatch on v{}", v.0);
    }

    pub fn f32const(&mut self, value: f32) -> Value {
        self.push(Inst::ConstF32(value), Some(Type::F32))
    }

    pub fn i64const(&mut self, value: i64) -> Value {
        self.push(Inst::ConstI64(value), Some(Type::I64))
    }

    /// Embed a host address as a typed pointer constant.
    pub fn const_ptr(&mut self, addr: usize, ty: Type) -> Value {
        assert!(ty.is_ptr(), "const_ptr of non-pointer type {ty}");
        self.push(Inst::ConstPtr { addr, ty: ty.clone() }, Some(ty))
    }

    pub fn global_get(&mut self, name: impl Into<String>) -> Value {
        self.push(Inst::GlobalGet(name.into()), Some(Type::F32))
    }

    pub fn fadd(&mut self, a: Value, b: Value) -> Value {
        self.expect(a, &Type::F32, "fadd");
        self.expect(b, &Type::F32, "fadd");
        self.push(Inst::FAdd(a, b), Some(Type::F32))
    }

    pub fn fsub(&mut self, a: Value, b: Value) -> Value {
        self.expect(a, &Type::F32, "fsub");
        self.expect(b, &Type::F32, "fsub");
        self.push(Inst::FSub(a, b), Some(Type::F32))
    }

    pub fn fmul(&mut self, a: Value, b: Value) -> Value {
        self.expect(a, &Type::F32, "fmul");
        self.expect(b, &Type::F32, "fmul");
        self.push(Inst::FMul(a, b), Some(Type::F32))
    }

    pub fn fdiv(&mut self, a: Value, b: Value) -> Value {
        self.expect(a, &Type::F32, "fdiv");
        self.expect(b, &Type::F32, "fdiv");
        self.push(Inst::FDiv(a, b), Some(Type::F32))
    }

    pub fn fneg(&mut self, a: Value) -> Value {
        self.expect(a, &Type::F32, "fneg");
        self.push(Inst::FNeg(a), Some(Type::F32))
    }

    pub fn iadd(&mut self, a: Value, b: Value) -> Value {
        self.expect(a, &Type::I64, "iadd");
        self.expect(b, &Type::I64, "iadd");
        self.push(Inst::IAdd(a, b), Some(Type::I64))
    }

    pub fn imul(&mut self, a: Value, b: Value) -> Value {
        self.expect(a, &Type::I64, "imul");
        self.expect(b, &Type::I64, "imul");
        self.push(Inst::IMul(a, b), Some(Type::I64))
    }

    /// `base + index * stride`, keeping the base pointer type.
    pub fn gep(&mut self, base: Value, index: Value, stride: u32) -> Value {
        let base_ty = self.value_type(base).clone();
        assert!(base_ty.is_ptr(), "gep base is not a pointer: {base_ty}");
        self.expect(index, &Type::I64, "gep index");
        self.push(Inst::Gep { base, index, stride }, Some(base_ty))
    }

    pub fn load(&mut self, ptr: Value) -> Value {
        let ty = match self.value_type(ptr).pointee() {
            Some(Type::F32) => Type::F32,
            Some(Type::I64) => Type::I64,
            other => panic!("load through pointer to {other:?}"),
        };
        self.push(Inst::Load { ptr }, Some(ty))
    }

    pub fn store(&mut self, value: Value, ptr: Value) {
        let pointee = self
            .value_type(ptr)
            .pointee()
            .unwrap_or_else(|| panic!("store through non-pointer"))
            .clone();
        self.expect(value, &pointee, "store");
        self.push(Inst::Store { ptr, value }, None);
    }

    /// Stack slot of `ty`; yields a pointer to it.
    pub fn alloca(&mut self, ty: Type) -> Value {
        let ptr = Type::ptr_to(ty.clone());
        self.push(Inst::Alloca(ty), Some(ptr))
    }

    pub fn ptr_cast(&mut self, value: Value, ty: Type) -> Value {
        assert!(self.value_type(value).is_ptr(), "ptr_cast of non-pointer");
        assert!(ty.is_ptr(), "ptr_cast to non-pointer type {ty}");
        self.push(Inst::PtrCast { value, ty: ty.clone() }, Some(ty))
    }

    /// Call a function defined or declared in `module`.
    ///
    /// Returns the result value, or `None` for a void callee. Fails with
    /// [`IrError::MissingSymbol`] when the callee is absent and
    /// [`IrError::SignatureMismatch`] when argument types disagree.
    pub fn call(
        &mut self,
        module: &Module,
        callee: &str,
        args: &[Value],
    ) -> Result<Option<Value>, IrError> {
        let function = module
            .function(callee)
            .ok_or_else(|| IrError::MissingSymbol(callee.to_string()))?;
        let sig = &function.sig;
        if sig.params.len() != args.len()
            || sig
                .params
                .iter()
                .zip(args)
                .any(|(p, &a)| self.value_type(a) != &p.ty)
        {
            return Err(IrError::SignatureMismatch {
                callee: callee.to_string(),
            });
        }
        let ret = sig.ret.clone();
        let value = self.push(
            Inst::Call {
                callee: callee.to_string(),
                args: args.to_vec(),
                ret: ret.clone(),
            },
            ret.clone(),
        );
        Ok(ret.map(|_| value))
    }

    pub fn ret(&mut self, value: Option<Value>) {
        match (&self.sig.ret, value) {
            (Some(expected), Some(v)) => self.expect(v, &expected.clone(), "ret"),
            (None, None) => {}
            _ => panic!("ret does not match the signature of {}", self.name),
        }
        self.push(Inst::Ret(value), None);
    }

    /// Seal the function. The body is taken as-is; the verifier enforces
    /// termination.
    pub fn finish(self) -> Function {
        Function {
            name: self.name,
            sig: self.sig,
            linkage: self.linkage,
            body: Some(self.insts),
        }
    }
}
