use std::fmt;

use crate::module::{Function, Inst, Linkage, Module};
use crate::types::Type;

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::F32 => write!(f, "f32"),
            Type::I64 => write!(f, "i64"),
            Type::Bytes(n) => write!(f, "bytes({n})"),
            Type::Ptr(p) => write!(f, "ptr({p})"),
        }
    }
}

impl fmt::Display for Linkage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Linkage::External => write!(f, "external"),
            Linkage::Internal => write!(f, "internal"),
            Linkage::Import => write!(f, "import"),
        }
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} function {}(", self.linkage, self.name)?;
        for (i, p) in self.sig.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            if p.readonly {
                write!(f, "readonly ")?;
            }
            write!(f, "{}", p.ty)?;
        }
        write!(f, ")")?;
        if let Some(ret) = &self.sig.ret {
            write!(f, " -> {ret}")?;
        }

        let Some(body) = &self.body else {
            return writeln!(f, ";");
        };
        writeln!(f, " {{")?;
        let base = self.sig.params.len();
        for (i, inst) in body.iter().enumerate() {
            let id = base + i;
            match inst {
                Inst::ConstF32(v) => writeln!(f, "  v{id} = f32const {v}")?,
                Inst::ConstI64(v) => writeln!(f, "  v{id} = i64const {v}")?,
                Inst::ConstPtr { addr, ty } => {
                    writeln!(f, "  v{id} = const_ptr {addr:#x} : {ty}")?
                }
                Inst::GlobalGet(name) => writeln!(f, "  v{id} = global_get {name}")?,
                Inst::FAdd(a, b) => writeln!(f, "  v{id} = fadd v{}, v{}", a.0, b.0)?,
                Inst::FSub(a, b) => writeln!(f, "  v{id} = fsub v{}, v{}", a.0, b.0)?,
                Inst::FMul(a, b) => writeln!(f, "  v{id} = fmul v{}, v{}", a.0, b.0)?,
                Inst::FDiv(a, b) => writeln!(f, "  v{id} = fdiv v{}, v{}", a.0, b.0)?,
                Inst::FNeg(a) => writeln!(f, "  v{id} = fneg v{}", a.0)?,
                Inst::IAdd(a, b) => writeln!(f, "  v{id} = iadd v{}, v{}", a.0, b.0)?,
                Inst::IMul(a, b) => writeln!(f, "  v{id} = imul v{}, v{}", a.0, b.0)?,
                Inst::Gep { base, index, stride } => {
                    writeln!(f, "  v{id} = gep v{}, v{}, stride {stride}", base.0, index.0)?
                }
                Inst::Load { ptr } => writeln!(f, "  v{id} = load v{}", ptr.0)?,
                Inst::Store { ptr, value } => {
                    writeln!(f, "  store v{}, v{}", value.0, ptr.0)?
                }
                Inst::Alloca(ty) => writeln!(f, "  v{id} = alloca {ty}")?,
                Inst::PtrCast { value, ty } => {
                    writeln!(f, "  v{id} = ptr_cast v{} : {ty}", value.0)?
                }
                Inst::Call { callee, args, .. } => {
                    let args: Vec<String> = args.iter().map(|a| format!("v{}", a.0)).collect();
                    writeln!(f, "  v{id} = call {callee}({})", args.join(", "))?
                }
                Inst::Ret(Some(v)) => writeln!(f, "  ret v{}", v.0)?,
                Inst::Ret(None) => writeln!(f, "  ret")?,
            }
        }
        writeln!(f, "}}")
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "module {}", self.name())?;
        for (name, value) in self.globals() {
            writeln!(f, "global {name} = {value}")?;
        }
        for function in self.functions() {
            writeln!(f)?;
            write!(f, "{function}")?;
        }
        Ok(())
    }
}
