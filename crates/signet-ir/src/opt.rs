//! Optimization passes over straight-line modules.
//!
//! The pipeline run after a graph compilation mirrors a classic JIT
//! cleanup: inline everything inlinable, fold constants, deduplicate pure
//! instructions, drop dead code, then strip internal functions nothing
//! reaches. Passes rebuild instruction vectors and renumber values; all of
//! them preserve program order of effectful instructions.

use std::collections::{HashMap, HashSet};

use crate::module::{Function, Inst, IrError, Linkage, Module, Value};
use crate::types::Type;

/// Replace every `global_get` with the constant value of the named module
/// global. Fails when a global is missing, which surfaces a library set-up
/// mistake before the verifier runs.
pub fn resolve_globals(module: &mut Module) -> Result<(), IrError> {
    let globals: HashMap<String, f32> = module
        .globals()
        .map(|(n, v)| (n.to_string(), v))
        .collect();

    for function in module.functions_mut() {
        let Some(body) = &mut function.body else { continue };
        for inst in body {
            if let Inst::GlobalGet(name) = inst {
                let value = globals
                    .get(name.as_str())
                    .copied()
                    .ok_or_else(|| IrError::UnresolvedGlobal(name.clone()))?;
                *inst = Inst::ConstF32(value);
            }
        }
    }
    Ok(())
}

/// Inline calls to functions defined in the same module.
///
/// Straight-line bodies make this a splice: callee instructions are copied
/// into the caller with parameters substituted by arguments, and the callee's
/// `ret` value becomes the call's value. Runs a bounded number of rounds so
/// nested calls flatten without looping on (mutual) recursion.
pub fn inline_functions(module: &mut Module) {
    const MAX_ROUNDS: usize = 4;

    for _ in 0..MAX_ROUNDS {
        let bodies: HashMap<String, Vec<Inst>> = module
            .functions()
            .filter_map(|f| f.body.clone().map(|b| (f.name.clone(), b)))
            .collect();

        let mut changed = false;
        for function in module.functions_mut() {
            changed |= inline_into(function, &bodies);
        }
        if !changed {
            return;
        }
    }
}

fn inline_into(function: &mut Function, bodies: &HashMap<String, Vec<Inst>>) -> bool {
    let Some(body) = function.body.take() else { return false };
    let param_count = function.sig.params.len();

    let mut changed = false;
    let mut out: Vec<Inst> = Vec::with_capacity(body.len());
    // Caller value id -> id in the rebuilt body.
    let mut map: Vec<Value> = (0..param_count as u32).map(Value).collect();

    let mut push = |out: &mut Vec<Inst>, inst: Inst| -> Value {
        out.push(inst);
        Value((param_count + out.len() - 1) as u32)
    };

    for mut inst in body {
        inst.map_operands(|v| map[v.index()]);

        let inlinable = match &inst {
            Inst::Call { callee, .. } if callee != &function.name => bodies.get(callee),
            _ => None,
        };

        match inlinable {
            None => {
                let new_id = push(&mut out, inst);
                map.push(new_id);
            }
            Some(callee_body) => {
                let Inst::Call { args, .. } = &inst else { unreachable!() };
                changed = true;

                // Callee value id -> caller id: parameters map to arguments,
                // instructions to their spliced copies.
                let mut callee_map: Vec<Value> = args.clone();
                let mut call_result: Option<Value> = None;

                for callee_inst in callee_body {
                    if let Inst::Ret(v) = callee_inst {
                        call_result = v.map(|v| callee_map[v.index()]);
                        break;
                    }
                    let mut copy = callee_inst.clone();
                    copy.map_operands(|v| callee_map[v.index()]);
                    let new_id = push(&mut out, copy);
                    callee_map.push(new_id);
                }

                // The call's id maps to the returned value; a void callee
                // leaves a dangling id no verifier-clean caller can use.
                map.push(call_result.unwrap_or(Value(u32::MAX)));
            }
        }
    }

    function.body = Some(out);
    changed
}

#[derive(Clone, Copy, PartialEq)]
enum Known {
    F(f32),
    I(i64),
    P(usize, PtrTag),
}

/// Folded pointers keep their type through an index into a side table.
#[derive(Clone, Copy, PartialEq)]
struct PtrTag(u32);

/// Fold arithmetic and address computations over constants.
pub fn fold_constants(module: &mut Module) {
    for function in module.functions_mut() {
        let Some(body) = &mut function.body else { continue };
        let param_count = function.sig.params.len();

        let mut ptr_types: Vec<Type> = Vec::new();
        let mut known: Vec<Option<Known>> = vec![None; param_count];

        for inst in body.iter_mut() {
            let get = |known: &Vec<Option<Known>>, v: &Value| known[v.index()];
            let folded = match inst {
                Inst::ConstF32(v) => Some(Known::F(*v)),
                Inst::ConstI64(v) => Some(Known::I(*v)),
                Inst::ConstPtr { addr, ty } => {
                    ptr_types.push(ty.clone());
                    Some(Known::P(*addr, PtrTag(ptr_types.len() as u32 - 1)))
                }
                Inst::FAdd(a, b) => fold_f(get(&known, a), get(&known, b), |x, y| x + y),
                Inst::FSub(a, b) => fold_f(get(&known, a), get(&known, b), |x, y| x - y),
                Inst::FMul(a, b) => fold_f(get(&known, a), get(&known, b), |x, y| x * y),
                Inst::FDiv(a, b) => fold_f(get(&known, a), get(&known, b), |x, y| x / y),
                Inst::FNeg(a) => match get(&known, a) {
                    Some(Known::F(x)) => Some(Known::F(-x)),
                    _ => None,
                },
                Inst::IAdd(a, b) => fold_i(get(&known, a), get(&known, b), |x, y| {
                    x.wrapping_add(y)
                }),
                Inst::IMul(a, b) => fold_i(get(&known, a), get(&known, b), |x, y| {
                    x.wrapping_mul(y)
                }),
                Inst::Gep { base, index, stride } => {
                    match (get(&known, base), get(&known, index)) {
                        (Some(Known::P(addr, tag)), Some(Known::I(i))) => Some(Known::P(
                            (addr as i64).wrapping_add(i.wrapping_mul(*stride as i64)) as usize,
                            tag,
                        )),
                        _ => None,
                    }
                }
                Inst::PtrCast { value, ty } => match get(&known, value) {
                    Some(Known::P(addr, _)) => {
                        ptr_types.push(ty.clone());
                        Some(Known::P(addr, PtrTag(ptr_types.len() as u32 - 1)))
                    }
                    _ => None,
                },
                _ => None,
            };

            if let Some(k) = folded {
                *inst = match k {
                    Known::F(v) => Inst::ConstF32(v),
                    Known::I(v) => Inst::ConstI64(v),
                    Known::P(addr, tag) => Inst::ConstPtr {
                        addr,
                        ty: ptr_types[tag.0 as usize].clone(),
                    },
                };
            }

            known.push(folded);
        }
    }
}

fn fold_f(a: Option<Known>, b: Option<Known>, op: impl Fn(f32, f32) -> f32) -> Option<Known> {
    match (a?, b?) {
        (Known::F(x), Known::F(y)) => Some(Known::F(op(x, y))),
        _ => None,
    }
}

fn fold_i(a: Option<Known>, b: Option<Known>, op: impl Fn(i64, i64) -> i64) -> Option<Known> {
    match (a?, b?) {
        (Known::I(x), Known::I(y)) => Some(Known::I(op(x, y))),
        _ => None,
    }
}

/// Deduplicate pure, memory-free instructions (constants, arithmetic,
/// address computation). Loads stay put: a later store may change them.
pub fn local_cse(module: &mut Module) {
    for function in module.functions_mut() {
        let Some(body) = function.body.take() else { continue };
        let param_count = function.sig.params.len();

        let mut seen: HashMap<String, Value> = HashMap::new();
        let mut map: Vec<Value> = (0..param_count as u32).map(Value).collect();
        let mut out: Vec<Inst> = Vec::with_capacity(body.len());

        for mut inst in body {
            inst.map_operands(|v| map[v.index()]);

            let key = match &inst {
                Inst::ConstF32(v) => Some(format!("f32 {}", v.to_bits())),
                Inst::ConstI64(v) => Some(format!("i64 {v}")),
                Inst::ConstPtr { addr, ty } => Some(format!("ptr {addr} {ty}")),
                Inst::GlobalGet(name) => Some(format!("global {name}")),
                Inst::FAdd(a, b) => Some(format!("fadd {} {}", a.0, b.0)),
                Inst::FSub(a, b) => Some(format!("fsub {} {}", a.0, b.0)),
                Inst::FMul(a, b) => Some(format!("fmul {} {}", a.0, b.0)),
                Inst::FDiv(a, b) => Some(format!("fdiv {} {}", a.0, b.0)),
                Inst::FNeg(a) => Some(format!("fneg {}", a.0)),
                Inst::IAdd(a, b) => Some(format!("iadd {} {}", a.0, b.0)),
                Inst::IMul(a, b) => Some(format!("imul {} {}", a.0, b.0)),
                Inst::Gep { base, index, stride } => {
                    Some(format!("gep {} {} {stride}", base.0, index.0))
                }
                Inst::PtrCast { value, ty } => Some(format!("cast {} {ty}", value.0)),
                _ => None,
            };

            if let Some(key) = key {
                if let Some(&prior) = seen.get(&key) {
                    map.push(prior);
                    continue;
                }
                out.push(inst);
                let id = Value((param_count + out.len() - 1) as u32);
                seen.insert(key, id);
                map.push(id);
            } else {
                out.push(inst);
                map.push(Value((param_count + out.len() - 1) as u32));
            }
        }

        function.body = Some(out);
    }
}

/// Drop pure instructions whose results are never used.
pub fn eliminate_dead_code(module: &mut Module) {
    for function in module.functions_mut() {
        let Some(body) = function.body.take() else { continue };
        let param_count = function.sig.params.len();
        let total = param_count + body.len();

        let mut live = vec![false; total];
        for (i, inst) in body.iter().enumerate().rev() {
            let id = param_count + i;
            if inst.has_side_effect() || live[id] {
                live[id] = true;
                for op in inst.operands() {
                    live[op.index()] = true;
                }
            }
        }

        let mut map: Vec<Value> = (0..param_count as u32).map(Value).collect();
        let mut out: Vec<Inst> = Vec::with_capacity(body.len());
        for (i, mut inst) in body.into_iter().enumerate() {
            let id = param_count + i;
            if !live[id] {
                // Dead ids keep a placeholder mapping; nothing live uses them.
                map.push(Value(u32::MAX));
                continue;
            }
            inst.map_operands(|v| map[v.index()]);
            out.push(inst);
            map.push(Value((param_count + out.len() - 1) as u32));
        }

        function.body = Some(out);
    }
}

/// Remove internal definitions and declarations unreachable from any
/// external-linkage function.
pub fn strip_dead_functions(module: &mut Module) {
    let mut reachable: HashSet<String> = module
        .functions()
        .filter(|f| f.is_definition() && f.linkage == Linkage::External)
        .map(|f| f.name.clone())
        .collect();

    let mut queue: Vec<String> = reachable.iter().cloned().collect();
    while let Some(name) = queue.pop() {
        let Some(function) = module.function(&name) else { continue };
        let Some(body) = &function.body else { continue };
        for inst in body {
            if let Inst::Call { callee, .. } = inst {
                if reachable.insert(callee.clone()) {
                    queue.push(callee.clone());
                }
            }
        }
    }

    module.retain_functions(|f| reachable.contains(&f.name));
}

/// The standard post-compile pipeline, in the order the execution context
/// runs it.
pub fn run_default_pipeline(module: &mut Module) {
    inline_functions(module);
    fold_constants(module);
    local_cse(module);
    eliminate_dead_code(module);
    strip_dead_functions(module);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{Param, Signature};
    use crate::{FuncBuilder, Type};

    fn count_insts(m: &Module, name: &str) -> usize {
        m.function(name).unwrap().body.as_ref().unwrap().len()
    }

    #[test]
    fn resolves_globals_to_constants() {
        let mut m = Module::new("m");
        m.set_global("gain", 2.5);
        let mut b = FuncBuilder::new(
            "f",
            Signature::new(vec![], Some(Type::F32)),
            Linkage::External,
        );
        let g = b.global_get("gain");
        b.ret(Some(g));
        m.add_function(b.finish()).unwrap();

        resolve_globals(&mut m).unwrap();
        let body = m.function("f").unwrap().body.as_ref().unwrap();
        assert_eq!(body[0], Inst::ConstF32(2.5));
    }

    #[test]
    fn missing_global_is_an_error() {
        let mut m = Module::new("m");
        let mut b = FuncBuilder::new(
            "f",
            Signature::new(vec![], Some(Type::F32)),
            Linkage::External,
        );
        let g = b.global_get("absent");
        b.ret(Some(g));
        m.add_function(b.finish()).unwrap();
        assert!(matches!(
            resolve_globals(&mut m),
            Err(IrError::UnresolvedGlobal(_))
        ));
    }

    #[test]
    fn inlines_and_strips_the_callee() {
        let mut m = Module::new("m");

        let sig = Signature::new(vec![Param::new(Type::F32)], Some(Type::F32));
        let mut callee = FuncBuilder::new("double", sig.clone(), Linkage::Internal);
        let x = callee.param(0);
        let two = callee.f32const(2.0);
        let r = callee.fmul(x, two);
        callee.ret(Some(r));
        m.add_function(callee.finish()).unwrap();

        let mut caller = FuncBuilder::new("entry", sig, Linkage::External);
        let x = caller.param(0);
        let r = caller.call(&m, "double", &[x]).unwrap().unwrap();
        caller.ret(Some(r));
        m.add_function(caller.finish()).unwrap();

        run_default_pipeline(&mut m);

        assert!(m.function("double").is_none());
        let body = m.function("entry").unwrap().body.as_ref().unwrap();
        assert!(body.iter().all(|i| !matches!(i, Inst::Call { .. })));
        crate::verify_module(&m).unwrap();
    }

    #[test]
    fn folds_and_dedups_constants() {
        let mut m = Module::new("m");
        let mut b = FuncBuilder::new(
            "f",
            Signature::new(vec![], Some(Type::F32)),
            Linkage::External,
        );
        let a = b.f32const(1.5);
        let c = b.f32const(2.5);
        let sum = b.fadd(a, c);
        let sum2 = b.fadd(a, c);
        let r = b.fadd(sum, sum2);
        b.ret(Some(r));
        m.add_function(b.finish()).unwrap();

        fold_constants(&mut m);
        local_cse(&mut m);
        eliminate_dead_code(&mut m);

        // 1.5 + 2.5 folds to 4.0, the duplicate folds to the same constant,
        // CSE merges them, and the final add folds to 8.0.
        fold_constants(&mut m);
        eliminate_dead_code(&mut m);
        let body = m.function("f").unwrap().body.as_ref().unwrap();
        assert_eq!(body.len(), 2);
        assert_eq!(body[0], Inst::ConstF32(8.0));
        crate::verify_module(&m).unwrap();
    }

    #[test]
    fn dce_keeps_stores() {
        let mut m = Module::new("m");
        let mut b = FuncBuilder::new("f", Signature::default(), Linkage::External);
        let slot = b.alloca(Type::F32);
        let v = b.f32const(1.0);
        b.store(v, slot);
        let _unused = b.f32const(9.0);
        b.ret(None);
        m.add_function(b.finish()).unwrap();

        eliminate_dead_code(&mut m);
        assert_eq!(count_insts(&m, "f"), 4);
        crate::verify_module(&m).unwrap();
    }

    #[test]
    fn strips_unreachable_internal_functions() {
        let mut m = Module::new("m");
        let mut dead = FuncBuilder::new("dead", Signature::default(), Linkage::Internal);
        dead.ret(None);
        m.add_function(dead.finish()).unwrap();
        let mut live = FuncBuilder::new("live", Signature::default(), Linkage::External);
        live.ret(None);
        m.add_function(live.finish()).unwrap();

        strip_dead_functions(&mut m);
        assert!(m.function("dead").is_none());
        assert!(m.function("live").is_some());
    }
}
