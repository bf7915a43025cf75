//! Common-subexpression elimination.
//!
//! Within a basic block, a pure computation already performed with identical
//! operands is replaced by an alias of the earlier result.

use super::{OptimizationStep, OptimizeContext};
use crate::ir::{CodeHolder, Immediate, Instruction, Op, VRegId, Value, ValueKind};
use rustc_hash::FxHashMap;

/// Hashable identity of one operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum OperandKey {
    Reg(VRegId),
    Imm { bits: u64, ty: u32, tag: u8 },
    Stack(u32),
    ModuleData(u32, u32),
    Null,
    Absent,
}

fn key_of(value: Option<&Value>) -> Option<OperandKey> {
    let value = match value {
        Some(v) => v,
        None => return Some(OperandKey::Absent),
    };
    Some(match value.kind {
        ValueKind::Register(r) => OperandKey::Reg(r),
        ValueKind::Imm(imm) => {
            let tag = match imm {
                Immediate::Int(_) => 0,
                Immediate::UInt(_) => 1,
                Immediate::F32(_) => 2,
                Immediate::F64(_) => 3,
                Immediate::Func(_) => 4,
                Immediate::Module(_) => 5,
            };
            OperandKey::Imm {
                bits: imm.to_word(),
                ty: value.ty.as_u32(),
                tag,
            }
        }
        ValueKind::StackAlloc(a) => OperandKey::Stack(a),
        ValueKind::ModuleData { module, slot } => OperandKey::ModuleData(module.as_u32(), slot),
        ValueKind::Null => OperandKey::Null,
        ValueKind::Poison => return None,
    })
}

/// Ops safe to deduplicate: pure computations over their operands.
fn is_pure_computation(op: Op) -> bool {
    op.is_arithmetic()
        || op.is_comparison()
        || matches!(op, Op::BAnd | Op::BOr | Op::BXor | Op::Sl | Op::Sr | Op::LAnd | Op::LOr | Op::Neg)
}

pub struct CommonSubexpressionElimination;

impl OptimizationStep for CommonSubexpressionElimination {
    fn name(&self) -> &'static str {
        "common-subexpression-elimination"
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
            let mut seen: FxHashMap<(Op, OperandKey, OperandKey), VRegId> = FxHashMap::default();

            for addr in begin..end {
                let instr = &holder.code[addr];

                let mut pending_insert = None;
                if is_pure_computation(instr.op) && instr.is_assignment() {
                    let dst = instr.op1().and_then(Value::reg_id);
                    let k2 = key_of(instr.op2());
                    let k3 = key_of(instr.op3());
                    if let (Some(dst), Some(k2), Some(k3)) = (dst, k2, k3) {
                        let key = (instr.op, k2, k3);
                        if let Some(&prev) = seen.get(&key) {
                            // Same computation, same inputs: alias the result
                            let ty = instr.op1().map(|v| v.ty).unwrap_or_default();
                            let src = instr.src;
                            holder.code[addr] = Instruction::new(Op::Cvt, src)
                                .with_op1(Value::reg(dst, ty))
                                .with_op2(Value::reg(prev, ty));
                            changed = true;
                        } else {
                            pending_insert = Some((key, dst));
                        }
                    }
                }

                // A redefinition invalidates entries mentioning the register,
                // as inputs or as the cached result
                if let Some(written) = holder.code[addr].assigned_reg() {
                    seen.retain(|(_, k2, k3), result| {
                        *result != written
                            && *k2 != OperandKey::Reg(written)
                            && *k3 != OperandKey::Reg(written)
                    });
                }

                // Record the computation unless it consumed its own output
                if let Some(((op, k2, k3), dst)) = pending_insert {
                    if k2 != OperandKey::Reg(dst) && k3 != OperandKey::Reg(dst) {
                        seen.insert((op, k2, k3), dst);
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
        CommonSubexpressionElimination.run(&mut holder, &mut ctx);
        holder
    }

    #[test]
    fn duplicate_computation_becomes_alias() {
        let src = SourceLocation::default();
        // r2 = iadd r0, r1; r3 = iadd r0, r1  →  r3 = cvt r2
        let holder = run_once(vec![
            Instruction::new(Op::IAdd, src)
                .with_op1(Value::reg(2, ty()))
                .with_op2(Value::reg(0, ty()))
                .with_op3(Value::reg(1, ty())),
            Instruction::new(Op::IAdd, src)
                .with_op1(Value::reg(3, ty()))
                .with_op2(Value::reg(0, ty()))
                .with_op3(Value::reg(1, ty())),
            Instruction::new(Op::Ret, src).with_op1(Value::reg(3, ty())),
        ]);
        assert_eq!(holder.code[1].op, Op::Cvt);
        assert_eq!(holder.code[1].op2().unwrap().reg_id(), Some(2));
    }

    #[test]
    fn redefined_input_is_not_deduplicated() {
        let src = SourceLocation::default();
        // r2 = iadd r0, r1; r0 = cvt 5; r3 = iadd r0, r1; the second add stays
        let holder = run_once(vec![
            Instruction::new(Op::IAdd, src)
                .with_op1(Value::reg(2, ty()))
                .with_op2(Value::reg(0, ty()))
                .with_op3(Value::reg(1, ty())),
            Instruction::new(Op::Cvt, src)
                .with_op1(Value::reg(0, ty()))
                .with_op2(Value::imm_i(5, ty())),
            Instruction::new(Op::IAdd, src)
                .with_op1(Value::reg(3, ty()))
                .with_op2(Value::reg(0, ty()))
                .with_op3(Value::reg(1, ty())),
            Instruction::new(Op::Ret, src).with_op1(Value::reg(3, ty())),
        ]);
        assert_eq!(holder.code[2].op, Op::IAdd);
    }

    #[test]
    fn different_ops_are_distinct() {
        let src = SourceLocation::default();
        let holder = run_once(vec![
            Instruction::new(Op::IAdd, src)
                .with_op1(Value::reg(2, ty()))
                .with_op2(Value::reg(0, ty()))
                .with_op3(Value::reg(1, ty())),
            Instruction::new(Op::ISub, src)
                .with_op1(Value::reg(3, ty()))
                .with_op2(Value::reg(0, ty()))
                .with_op3(Value::reg(1, ty())),
            Instruction::new(Op::Ret, src).with_op1(Value::reg(3, ty())),
        ]);
        assert_eq!(holder.code[1].op, Op::ISub);
    }
}
