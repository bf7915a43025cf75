//! Dead-code elimination.
//!
//! Function-level: removes assignments whose result is never read and which
//! have no observable side effect. Calls are never removed, whatever happens
//! to their result.

use super::{OptimizationStep, OptimizeContext};
use crate::ir::CodeHolder;

pub struct DeadCodeElimination;

impl OptimizationStep for DeadCodeElimination {
    fn name(&self) -> &'static str {
        "dead-code-elimination"
    }

    fn run(&mut self, holder: &mut CodeHolder, _ctx: &mut OptimizeContext) -> bool {
        let liveness = &holder.liveness;
        let before = holder.code.len();

        let keep: Vec<bool> = holder
            .code
            .iter()
            .map(|instr| {
                if instr.has_side_effects() || !instr.is_assignment() {
                    return true;
                }
                match instr.assigned_reg() {
                    Some(reg) => liveness.usage_count(reg) > 0,
                    // Assignments to non-register destinations stay
                    None => true,
                }
            })
            .collect();

        let mut idx = 0;
        holder.code.retain(|_| {
            let k = keep[idx];
            idx += 1;
            k
        });

        holder.code.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Instruction, Op, Value};
    use tern_ffi::{FunctionId, TypeId, TypeRegistry};
    use tern_parser::{Logger, SourceLocation};

    fn ty() -> TypeId {
        TypeId::from_fqn("i32")
    }

    fn eliminate(code: Vec<Instruction>) -> CodeHolder {
        let types = TypeRegistry::new();
        let mut log = Logger::new();
        let mut ctx = OptimizeContext {
            types: &types,
            log: &mut log,
            enabled: true,
        };
        let mut holder = CodeHolder::new(code);
        holder.rebuild_all(&types);
        while DeadCodeElimination.run(&mut holder, &mut ctx) {
            holder.rebuild_all(&types);
        }
        holder
    }

    #[test]
    fn unused_assignment_is_removed() {
        let src = SourceLocation::default();
        let holder = eliminate(vec![
            Instruction::new(Op::Cvt, src)
                .with_op1(Value::reg(0, ty()))
                .with_op2(Value::imm_i(42, ty())),
            Instruction::new(Op::Ret, src),
        ]);
        assert_eq!(holder.code.len(), 1);
        assert_eq!(holder.code[0].op, Op::Ret);
    }

    #[test]
    fn transitive_chains_die() {
        let src = SourceLocation::default();
        // r0 and r1 feed only r2, which is unused
        let holder = eliminate(vec![
            Instruction::new(Op::Cvt, src)
                .with_op1(Value::reg(0, ty()))
                .with_op2(Value::imm_i(10, ty())),
            Instruction::new(Op::Cvt, src)
                .with_op1(Value::reg(1, ty()))
                .with_op2(Value::imm_i(20, ty())),
            Instruction::new(Op::IAdd, src)
                .with_op1(Value::reg(2, ty()))
                .with_op2(Value::reg(0, ty()))
                .with_op3(Value::reg(1, ty())),
            Instruction::new(Op::Ret, src),
        ]);
        assert_eq!(holder.code.len(), 1);
    }

    #[test]
    fn returned_value_survives() {
        let src = SourceLocation::default();
        let holder = eliminate(vec![
            Instruction::new(Op::Cvt, src)
                .with_op1(Value::reg(0, ty()))
                .with_op2(Value::imm_i(42, ty())),
            Instruction::new(Op::Ret, src).with_op1(Value::reg(0, ty())),
        ]);
        assert_eq!(holder.code.len(), 2);
    }

    #[test]
    fn calls_survive_even_with_dead_results() {
        let src = SourceLocation::default();
        let holder = eliminate(vec![
            Instruction::new(Op::Call, src)
                .with_op1(Value::func(FunctionId(7), ty()))
                .with_op2(Value::reg(0, ty())),
            Instruction::new(Op::Ret, src),
        ]);
        assert_eq!(holder.code.len(), 2);
        assert_eq!(holder.code[0].op, Op::Call);
    }

    #[test]
    fn stores_survive() {
        let src = SourceLocation::default();
        let holder = eliminate(vec![
            Instruction::new(Op::Store, src)
                .with_op1(Value::reg(0, ty()))
                .with_op2(Value::stack(0, ty())),
            Instruction::new(Op::Ret, src),
        ]);
        assert_eq!(holder.code.len(), 2);
    }
}
