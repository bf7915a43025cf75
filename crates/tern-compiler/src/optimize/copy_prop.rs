//! Copy propagation.
//!
//! Within a basic block, a `cvt` between registers of the same type is a pure
//! alias; later reads of the destination are rewritten to the source until
//! either register is redefined.

use super::{OptimizationStep, OptimizeContext};
use crate::ir::{CodeHolder, Op, VRegId, ValueKind};
use rustc_hash::FxHashMap;

pub struct CopyPropagation;

impl OptimizationStep for CopyPropagation {
    fn name(&self) -> &'static str {
        "copy-propagation"
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
            // dst → canonical source register
            let mut alias: FxHashMap<VRegId, VRegId> = FxHashMap::default();

            for addr in begin..end {
                let assigned = holder.code[addr].assigned_slot();

                // Rewrite reads through the alias map
                for (i, operand) in holder.code[addr].operands.iter_mut().enumerate() {
                    if Some(i) == assigned {
                        continue;
                    }
                    if let Some(op) = operand {
                        if let ValueKind::Register(reg) = op.kind {
                            if let Some(&src) = alias.get(&reg) {
                                op.kind = ValueKind::Register(src);
                                changed = true;
                            }
                        }
                    }
                }

                let instr = &holder.code[addr];

                // A redefinition kills aliases involving the register
                if let Some(written) = instr.assigned_reg() {
                    alias.remove(&written);
                    alias.retain(|_, src| *src != written);
                }

                // Record fresh aliases from same-type register copies
                if instr.op == Op::Cvt {
                    if let (Some(dst), Some(src)) = (instr.op1(), instr.op2()) {
                        if let (ValueKind::Register(d), ValueKind::Register(s)) =
                            (dst.kind, src.kind)
                        {
                            if dst.ty == src.ty && d != s {
                                let root = alias.get(&s).copied().unwrap_or(s);
                                alias.insert(d, root);
                            }
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
    use crate::ir::{Instruction, Value};
    use tern_ffi::{TypeId, TypeRegistry};
    use tern_parser::{Logger, SourceLocation};

    fn ty() -> TypeId {
        TypeId::from_fqn("i32")
    }

    fn run(code: Vec<Instruction>) -> CodeHolder {
        let types = TypeRegistry::new();
        let mut log = Logger::new();
        let mut ctx = OptimizeContext {
            types: &types,
            log: &mut log,
            enabled: true,
        };
        let mut holder = CodeHolder::new(code);
        holder.rebuild_all(&types);
        while CopyPropagation.run(&mut holder, &mut ctx) {
            holder.rebuild_all(&types);
        }
        holder
    }

    #[test]
    fn aliased_reads_are_rewritten() {
        let src = SourceLocation::default();
        // r1 = cvt r0; r2 = iadd r1, r1  →  r2 = iadd r0, r0
        let holder = run(vec![
            Instruction::new(Op::Cvt, src)
                .with_op1(Value::reg(1, ty()))
                .with_op2(Value::reg(0, ty())),
            Instruction::new(Op::IAdd, src)
                .with_op1(Value::reg(2, ty()))
                .with_op2(Value::reg(1, ty()))
                .with_op3(Value::reg(1, ty())),
            Instruction::new(Op::Ret, src).with_op1(Value::reg(2, ty())),
        ]);
        let add = &holder.code[1];
        assert_eq!(add.op2().unwrap().reg_id(), Some(0));
        assert_eq!(add.op3().unwrap().reg_id(), Some(0));
    }

    #[test]
    fn redefinition_kills_the_alias() {
        let src = SourceLocation::default();
        // r1 = cvt r0; r0 = iadd r0, 1; r2 = cvt r1; r1 must NOT become r0
        let holder = run(vec![
            Instruction::new(Op::Cvt, src)
                .with_op1(Value::reg(1, ty()))
                .with_op2(Value::reg(0, ty())),
            Instruction::new(Op::IAdd, src)
                .with_op1(Value::reg(0, ty()))
                .with_op2(Value::reg(0, ty()))
                .with_op3(Value::imm_i(1, ty())),
            Instruction::new(Op::Cvt, src)
                .with_op1(Value::reg(2, ty()))
                .with_op2(Value::reg(1, ty())),
            Instruction::new(Op::Ret, src).with_op1(Value::reg(2, ty())),
        ]);
        assert_eq!(holder.code[2].op2().unwrap().reg_id(), Some(1));
    }

    #[test]
    fn cross_type_cvt_is_not_an_alias() {
        let src = SourceLocation::default();
        let f32_ty = TypeId::from_fqn("f32");
        let holder = run(vec![
            Instruction::new(Op::Cvt, src)
                .with_op1(Value::reg(1, f32_ty))
                .with_op2(Value::reg(0, ty())),
            Instruction::new(Op::FAdd, src)
                .with_op1(Value::reg(2, f32_ty))
                .with_op2(Value::reg(1, f32_ty))
                .with_op3(Value::reg(1, f32_ty)),
            Instruction::new(Op::Ret, src).with_op1(Value::reg(2, f32_ty)),
        ]);
        assert_eq!(holder.code[1].op2().unwrap().reg_id(), Some(1));
    }
}
