//! Memory-access reduction.
//!
//! Within a basic block, a `load` from an address that was just stored to (or
//! just loaded from) is rewritten to a register alias, provided no possibly
//! aliasing store or call intervened. Aliasing is judged conservatively: any
//! store to a different address key, and any call, clears the tracked state.

use super::{OptimizationStep, OptimizeContext};
use crate::ir::{CodeHolder, Instruction, Op, VRegId, Value, ValueKind};
use rustc_hash::FxHashMap;

/// Identity of a memory location: base operand plus immediate offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum AddrKey {
    Reg(VRegId, u64),
    Stack(u32, u64),
    ModuleData(u32, u32, u64),
}

fn addr_key(base: Option<&Value>, offset: Option<&Value>) -> Option<AddrKey> {
    let off = match offset {
        None => 0,
        Some(v) => v.imm_value()?.as_u64()?,
    };
    match base?.kind {
        ValueKind::Register(r) => Some(AddrKey::Reg(r, off)),
        ValueKind::StackAlloc(a) => Some(AddrKey::Stack(a, off)),
        ValueKind::ModuleData { module, slot } => {
            Some(AddrKey::ModuleData(module.as_u32(), slot, off))
        }
        _ => None,
    }
}

pub struct ReduceMemoryAccess;

impl OptimizationStep for ReduceMemoryAccess {
    fn name(&self) -> &'static str {
        "reduce-memory-access"
    }

    fn run(&mut self, holder: &mut CodeHolder, _ctx: &mut OptimizeContext) -> bool {
        let mut changed = false;
        let blocks: Vec<(usize, usize)> = holder
            .cfg
            .blocks
            .iter()
            .map(|b| (b.begin, b.end))
            .collect();

        for (begin, end) in blocks {
            // address → register currently known to hold that location's value
            let mut known: FxHashMap<AddrKey, VRegId> = FxHashMap::default();

            for addr in begin..end {
                let instr = holder.code[addr].clone();
                match instr.op {
                    Op::Store => {
                        // store value, addr [, off]
                        let key = addr_key(instr.op2(), instr.op3());
                        match (key, instr.op1().and_then(Value::reg_id)) {
                            (Some(key), Some(value_reg)) => {
                                // A store to one key invalidates everything
                                // else that might alias it
                                known.clear();
                                known.insert(key, value_reg);
                            }
                            _ => known.clear(),
                        }
                    }
                    Op::Load => {
                        // load dst, addr [, off]
                        let key = addr_key(instr.op2(), instr.op3());
                        let dst = instr.op1().cloned();
                        if let (Some(key), Some(dst)) = (key, dst) {
                            if let Some(&have) = known.get(&key) {
                                if Some(have) != dst.reg_id() {
                                    let ty = dst.ty;
                                    holder.code[addr] = Instruction::new(Op::Cvt, instr.src)
                                        .with_op1(dst)
                                        .with_op2(Value::reg(have, ty));
                                    changed = true;
                                }
                            } else if let Some(dst_reg) = dst.reg_id() {
                                known.insert(key, dst_reg);
                            }
                        }
                    }
                    // Calls may write through any pointer the callee can see
                    Op::Call => known.clear(),
                    _ => {
                        // A redefinition invalidates entries that use the
                        // register as base or cached value
                        if let Some(written) = instr.assigned_reg() {
                            known.retain(|key, value_reg| {
                                *value_reg != written
                                    && !matches!(key, AddrKey::Reg(base, _) if *base == written)
                            });
                        }
                    }
                }
            }
        }

        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_ffi::{TypeId, TypeRegistry};
    use tern_parser::{Logger, SourceLocation};

    fn ty() -> TypeId {
        TypeId::from_fqn("i32")
    }

    fn run_once(code: Vec<Instruction>) -> CodeHolder {
        let types = TypeRegistry::new();
        let mut log = Logger::new();
        let mut ctx = OptimizeContext {
            types: &types,
            log: &mut log,
            enabled: true,
        };
        let mut holder = CodeHolder::new(code);
        holder.rebuild_all(&types);
        ReduceMemoryAccess.run(&mut holder, &mut ctx);
        holder
    }

    #[test]
    fn load_after_store_is_forwarded() {
        let src = SourceLocation::default();
        // store r1 → [stack0]; r2 = load [stack0]  →  r2 = cvt r1
        let holder = run_once(vec![
            Instruction::new(Op::Store, src)
                .with_op1(Value::reg(1, ty()))
                .with_op2(Value::stack(0, ty())),
            Instruction::new(Op::Load, src)
                .with_op1(Value::reg(2, ty()))
                .with_op2(Value::stack(0, ty())),
            Instruction::new(Op::Ret, src).with_op1(Value::reg(2, ty())),
        ]);
        assert_eq!(holder.code[1].op, Op::Cvt);
        assert_eq!(holder.code[1].op2().unwrap().reg_id(), Some(1));
    }

    #[test]
    fn intervening_store_blocks_forwarding() {
        let src = SourceLocation::default();
        // Stores to a different key clear the tracked state (may alias)
        let holder = run_once(vec![
            Instruction::new(Op::Store, src)
                .with_op1(Value::reg(1, ty()))
                .with_op2(Value::stack(0, ty())),
            Instruction::new(Op::Store, src)
                .with_op1(Value::reg(3, ty()))
                .with_op2(Value::reg(9, ty())),
            Instruction::new(Op::Load, src)
                .with_op1(Value::reg(2, ty()))
                .with_op2(Value::stack(0, ty())),
            Instruction::new(Op::Ret, src).with_op1(Value::reg(2, ty())),
        ]);
        assert_eq!(holder.code[2].op, Op::Load);
    }

    #[test]
    fn repeated_loads_are_deduplicated() {
        let src = SourceLocation::default();
        let holder = run_once(vec![
            Instruction::new(Op::Load, src)
                .with_op1(Value::reg(1, ty()))
                .with_op2(Value::stack(0, ty())),
            Instruction::new(Op::Load, src)
                .with_op1(Value::reg(2, ty()))
                .with_op2(Value::stack(0, ty())),
            Instruction::new(Op::Ret, src).with_op1(Value::reg(2, ty())),
        ]);
        assert_eq!(holder.code[1].op, Op::Cvt);
        assert_eq!(holder.code[1].op2().unwrap().reg_id(), Some(1));
    }

    #[test]
    fn offsets_distinguish_locations() {
        let src = SourceLocation::default();
        let u64_ty = TypeId::from_fqn("u64");
        let holder = run_once(vec![
            Instruction::new(Op::Load, src)
                .with_op1(Value::reg(1, ty()))
                .with_op2(Value::stack(0, ty()))
                .with_op3(Value::imm_u(0, u64_ty)),
            Instruction::new(Op::Load, src)
                .with_op1(Value::reg(2, ty()))
                .with_op2(Value::stack(0, ty()))
                .with_op3(Value::imm_u(4, u64_ty)),
            Instruction::new(Op::Ret, src).with_op1(Value::reg(2, ty())),
        ]);
        assert_eq!(holder.code[1].op, Op::Load);
    }
}
