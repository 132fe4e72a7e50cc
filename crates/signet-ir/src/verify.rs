use crate::module::{Inst, IrError, Module};

/// Verify a module before lowering.
///
/// Checks, per defined function: operands defined before use, operand and
/// result types agree, no use of void values, the body ends with exactly one
/// `ret` matching the signature, every call targets a known function with
/// matching argument and return types, and every `global_get` names an
/// existing global. A failing module must not reach native codegen.
pub fn verify_module(module: &Module) -> Result<(), IrError> {
    for function in module.functions() {
        let body = match &function.body {
            Some(body) => body,
            None => continue,
        };

        let malformed = |message: String| IrError::Malformed {
            function: function.name.clone(),
            message,
        };

        // Runs the full per-value type inference, which covers use-before-def,
        // void uses and per-instruction typing.
        function.value_types()?;

        match body.last() {
            Some(Inst::Ret(_)) => {}
            _ => return Err(malformed("body does not end with ret".into())),
        }

        for inst in body {
            match inst {
                Inst::Call { callee, args, ret } => {
                    let target = module
                        .function(callee)
                        .ok_or_else(|| IrError::MissingSymbol(callee.clone()))?;
                    if target.sig.params.len() != args.len() || target.sig.ret != *ret {
                        return Err(IrError::SignatureMismatch {
                            callee: callee.clone(),
                        });
                    }
                }
                Inst::GlobalGet(name) => {
                    if module.global(name).is_none() {
                        return Err(IrError::UnresolvedGlobal(name.clone()));
                    }
                }
                _ => {}
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{Function, Linkage, Param, Signature};
    use crate::types::Type;
    use crate::FuncBuilder;

    #[test]
    fn accepts_a_valid_module() {
        let mut m = Module::new("m");
        let sig = Signature::new(vec![Param::new(Type::F32)], Some(Type::F32));
        let mut b = FuncBuilder::new("id", sig, Linkage::External);
        let v = b.param(0);
        b.ret(Some(v));
        m.add_function(b.finish()).unwrap();
        verify_module(&m).unwrap();
    }

    #[test]
    fn rejects_unterminated_body() {
        let mut m = Module::new("m");
        m.add_function(Function {
            name: "f".into(),
            sig: Signature::default(),
            linkage: Linkage::External,
            body: Some(vec![Inst::ConstF32(0.0)]),
        })
        .unwrap();
        assert!(matches!(verify_module(&m), Err(IrError::Malformed { .. })));
    }

    #[test]
    fn rejects_call_to_missing_symbol() {
        let mut m = Module::new("m");
        m.add_function(Function {
            name: "f".into(),
            sig: Signature::default(),
            linkage: Linkage::External,
            body: Some(vec![
                Inst::Call {
                    callee: "absent".into(),
                    args: vec![],
                    ret: None,
                },
                Inst::Ret(None),
            ]),
        })
        .unwrap();
        assert!(matches!(verify_module(&m), Err(IrError::MissingSymbol(_))));
    }

    #[test]
    fn rejects_unresolved_global() {
        let mut m = Module::new("m");
        m.add_function(Function {
            name: "f".into(),
            sig: Signature::new(vec![], Some(Type::F32)),
            linkage: Linkage::External,
            body: Some(vec![Inst::GlobalGet("gain".into()), Inst::Ret(Some(crate::Value(0)))]),
        })
        .unwrap();
        assert!(matches!(
            verify_module(&m),
            Err(IrError::UnresolvedGlobal(_))
        ));
    }
}
