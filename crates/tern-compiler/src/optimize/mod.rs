//! IR optimization passes.
//!
//! Passes implement [`OptimizationStep`] and compose into an
//! [`OptimizationGroup`], which is itself a step. A step returning `true`
//! asks to be run again on the same code; the group iterates its members to a
//! fixed point. Steps marked required run even when optimizations are
//! globally disabled. After any step that changed code, the holder's
//! analyses are rebuilt before the next step reads them.

mod const_fold;
mod copy_prop;
mod cse;
mod dce;
mod mem_reduce;

pub use const_fold::ConstantFolding;
pub use copy_prop::CopyPropagation;
pub use cse::CommonSubexpressionElimination;
pub use dce::DeadCodeElimination;
pub use mem_reduce::ReduceMemoryAccess;

use crate::ir::CodeHolder;
use tern_ffi::TypeRegistry;
use tern_parser::Logger;

/// Safety valve for pathological inputs; real functions converge in a
/// handful of iterations.
const MAX_GROUP_ITERATIONS: usize = 64;

/// Shared state handed to every pass.
pub struct OptimizeContext<'a> {
    pub types: &'a TypeRegistry,
    pub log: &'a mut Logger,
    /// When false, only required steps run.
    pub enabled: bool,
}

/// One rewriting pass over a function's IR.
pub trait OptimizationStep {
    fn name(&self) -> &'static str;

    /// Required steps run even with optimizations disabled.
    fn is_required(&self) -> bool {
        false
    }

    /// Rewrite `holder.code`; return true when something changed and the
    /// step wants another run.
    fn run(&mut self, holder: &mut CodeHolder, ctx: &mut OptimizeContext) -> bool;
}

/// An ordered collection of steps run to a fixed point.
pub struct OptimizationGroup {
    steps: Vec<Box<dyn OptimizationStep>>,
}

impl OptimizationGroup {
    pub fn new(steps: Vec<Box<dyn OptimizationStep>>) -> Self {
        Self { steps }
    }

    /// The default pipeline, in order: copy propagation, CSE, memory-access
    /// reduction, constant folding (required), dead-code elimination.
    pub fn default_pipeline() -> Self {
        Self::new(vec![
            Box::new(CopyPropagation),
            Box::new(CommonSubexpressionElimination),
            Box::new(ReduceMemoryAccess),
            Box::new(ConstantFolding),
            Box::new(DeadCodeElimination),
        ])
    }

    /// Run the group on one function until nothing changes.
    pub fn process(&mut self, holder: &mut CodeHolder, ctx: &mut OptimizeContext) {
        holder.rebuild_all(ctx.types);
        for _ in 0..MAX_GROUP_ITERATIONS {
            if !self.run_once(holder, ctx) {
                return;
            }
        }
        ctx.log.debug(1, "optimizer hit the iteration cap before converging");
    }

    fn run_once(&mut self, holder: &mut CodeHolder, ctx: &mut OptimizeContext) -> bool {
        let mut any = false;
        for step in &mut self.steps {
            if !ctx.enabled && !step.is_required() {
                continue;
            }
            let mut runs = 0usize;
            while step.run(holder, ctx) {
                holder.rebuild_all(ctx.types);
                any = true;
                runs += 1;
                if runs >= MAX_GROUP_ITERATIONS {
                    break;
                }
            }
            if runs > 0 {
                ctx.log.debug(
                    1,
                    format!("pass '{}' rewrote code ({} runs)", step.name(), runs),
                );
            }
        }
        any
    }
}

impl OptimizationStep for OptimizationGroup {
    fn name(&self) -> &'static str {
        "group"
    }

    fn is_required(&self) -> bool {
        // A group always runs; its members decide for themselves.
        true
    }

    fn run(&mut self, holder: &mut CodeHolder, ctx: &mut OptimizeContext) -> bool {
        self.run_once(holder, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Instruction, Op, Value};
    use tern_ffi::TypeId;
    use tern_parser::SourceLocation;

    fn i32_ty() -> TypeId {
        TypeId::from_fqn("i32")
    }

    /// `r1 = iadd 2, 3; r2 = imul r1, 4; ret r2` folds to `ret 20`.
    #[test]
    fn default_group_folds_straight_line_arithmetic() {
        let src = SourceLocation::default();
        let code = vec![
            Instruction::new(Op::IAdd, src)
                .with_op1(Value::reg(1, i32_ty()))
                .with_op2(Value::imm_i(2, i32_ty()))
                .with_op3(Value::imm_i(3, i32_ty())),
            Instruction::new(Op::IMul, src)
                .with_op1(Value::reg(2, i32_ty()))
                .with_op2(Value::reg(1, i32_ty()))
                .with_op3(Value::imm_i(4, i32_ty())),
            Instruction::new(Op::Ret, src).with_op1(Value::reg(2, i32_ty())),
        ];
        let types = TypeRegistry::new();
        let mut log = Logger::new();
        let mut ctx = OptimizeContext {
            types: &types,
            log: &mut log,
            enabled: true,
        };
        let mut holder = CodeHolder::new(code);
        OptimizationGroup::default_pipeline().process(&mut holder, &mut ctx);

        assert_eq!(holder.code.len(), 1, "listing:\n{}", holder.listing());
        assert_eq!(holder.code[0].op, Op::Ret);
        let ret = holder.code[0].op1().unwrap();
        assert_eq!(ret.imm_value().and_then(|i| i.as_i64()), Some(20));
    }

    #[test]
    fn disabled_group_runs_only_required_steps() {
        let src = SourceLocation::default();
        // Dead assignment: DCE would remove it, but DCE is optional.
        // Constant folding is required and still folds the add.
        let code = vec![
            Instruction::new(Op::IAdd, src)
                .with_op1(Value::reg(0, i32_ty()))
                .with_op2(Value::imm_i(1, i32_ty()))
                .with_op3(Value::imm_i(2, i32_ty())),
            Instruction::new(Op::Ret, src),
        ];
        let types = TypeRegistry::new();
        let mut log = Logger::new();
        let mut ctx = OptimizeContext {
            types: &types,
            log: &mut log,
            enabled: false,
        };
        let mut holder = CodeHolder::new(code);
        OptimizationGroup::default_pipeline().process(&mut holder, &mut ctx);

        // Folded but not eliminated
        assert_eq!(holder.code.len(), 2);
        assert_eq!(holder.code[0].op, Op::Cvt);
        assert_eq!(
            holder.code[0].op2().unwrap().imm_value().and_then(|i| i.as_i64()),
            Some(3)
        );
    }
}
