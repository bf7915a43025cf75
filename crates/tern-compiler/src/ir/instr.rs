//! IR instructions.

use super::op::Op;
use super::value::{LabelId, Value, VRegId};
use tern_parser::SourceLocation;

/// One three-address instruction: an op, up to three operands, up to three
/// label slots, and the source location it was emitted for.
#[derive(Debug, Clone)]
pub struct Instruction {
    pub op: Op,
    pub operands: [Option<Value>; 3],
    pub labels: [Option<LabelId>; 3],
    pub src: SourceLocation,
}

impl Instruction {
    pub fn new(op: Op, src: SourceLocation) -> Self {
        Self {
            op,
            operands: [None, None, None],
            labels: [None, None, None],
            src,
        }
    }

    pub fn with_op1(mut self, v: Value) -> Self {
        self.operands[0] = Some(v);
        self
    }

    pub fn with_op2(mut self, v: Value) -> Self {
        self.operands[1] = Some(v);
        self
    }

    pub fn with_op3(mut self, v: Value) -> Self {
        self.operands[2] = Some(v);
        self
    }

    pub fn with_label(mut self, idx: usize, label: LabelId) -> Self {
        self.labels[idx] = Some(label);
        self
    }

    pub fn op1(&self) -> Option<&Value> {
        self.operands[0].as_ref()
    }

    pub fn op2(&self) -> Option<&Value> {
        self.operands[1].as_ref()
    }

    pub fn op3(&self) -> Option<&Value> {
        self.operands[2].as_ref()
    }

    pub fn operand_count(&self) -> usize {
        self.operands.iter().filter(|o| o.is_some()).count()
    }

    /// Whether this instruction writes one of its operands. Drives liveness
    /// and dead-code analysis.
    pub fn is_assignment(&self) -> bool {
        if self.op.writes_first_operand() {
            return self.operands[0].is_some();
        }
        // A call assigns when it carries a result operand
        self.op == Op::Call && self.operands[1].is_some()
    }

    /// The register this instruction assigns, if any.
    pub fn assigned_reg(&self) -> Option<VRegId> {
        if self.op.writes_first_operand() {
            return self.operands[0].as_ref().and_then(Value::reg_id);
        }
        if self.op == Op::Call {
            return self.operands[1].as_ref().and_then(Value::reg_id);
        }
        None
    }

    /// The operand slot this instruction assigns, if any.
    pub fn assigned_slot(&self) -> Option<usize> {
        if self.op.writes_first_operand() && self.operands[0].is_some() {
            return Some(0);
        }
        if self.op == Op::Call && self.operands[1].is_some() {
            return Some(1);
        }
        None
    }

    /// Visit every register the instruction reads.
    pub fn for_each_read_reg(&self, mut f: impl FnMut(VRegId)) {
        let assigned = self.assigned_slot();
        for (i, operand) in self.operands.iter().enumerate() {
            if Some(i) == assigned {
                continue;
            }
            if let Some(reg) = operand.as_ref().and_then(Value::reg_id) {
                f(reg);
            }
        }
    }

    /// Visit every register the instruction references, reads and writes.
    pub fn for_each_reg(&self, mut f: impl FnMut(VRegId)) {
        for operand in self.operands.iter().flatten() {
            if let Some(reg) = operand.reg_id() {
                f(reg);
            }
        }
    }

    /// The label a `jump`/`branch` targets, or the one a `label` defines.
    pub fn primary_label(&self) -> Option<LabelId> {
        self.labels[0]
    }

    pub fn has_side_effects(&self) -> bool {
        self.op.has_side_effects()
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.op.mnemonic())?;
        let mut first = true;
        for operand in self.operands.iter().flatten() {
            if first {
                write!(f, " {operand}")?;
                first = false;
            } else {
                write!(f, ", {operand}")?;
            }
        }
        for label in self.labels.iter().flatten() {
            if first {
                write!(f, " L{label}")?;
                first = false;
            } else {
                write!(f, ", L{label}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::value::Immediate;
    use tern_ffi::TypeId;

    fn ty() -> TypeId {
        TypeId::from_fqn("i32")
    }

    #[test]
    fn assignment_detection() {
        let src = SourceLocation::default();
        let add = Instruction::new(Op::IAdd, src)
            .with_op1(Value::reg(2, ty()))
            .with_op2(Value::reg(0, ty()))
            .with_op3(Value::reg(1, ty()));
        assert!(add.is_assignment());
        assert_eq!(add.assigned_reg(), Some(2));

        let store = Instruction::new(Op::Store, src)
            .with_op1(Value::reg(0, ty()))
            .with_op2(Value::reg(1, ty()));
        assert!(!store.is_assignment());
        assert_eq!(store.assigned_reg(), None);

        let call_with_result = Instruction::new(Op::Call, src)
            .with_op1(Value::imm(Immediate::Func(tern_ffi::FunctionId(9)), ty()))
            .with_op2(Value::reg(5, ty()));
        assert!(call_with_result.is_assignment());
        assert_eq!(call_with_result.assigned_reg(), Some(5));

        let call_void = Instruction::new(Op::Call, src)
            .with_op1(Value::imm(Immediate::Func(tern_ffi::FunctionId(9)), ty()));
        assert!(!call_void.is_assignment());
    }

    #[test]
    fn read_registers_exclude_destination() {
        let src = SourceLocation::default();
        let add = Instruction::new(Op::IAdd, src)
            .with_op1(Value::reg(2, ty()))
            .with_op2(Value::reg(0, ty()))
            .with_op3(Value::reg(1, ty()));
        let mut reads = Vec::new();
        add.for_each_read_reg(|r| reads.push(r));
        assert_eq!(reads, vec![0, 1]);
    }

    #[test]
    fn display_renders_operands_and_labels() {
        let src = SourceLocation::default();
        let branch = Instruction::new(Op::Branch, src)
            .with_op1(Value::reg(4, ty()))
            .with_label(0, 2);
        assert_eq!(branch.to_string(), "branch r4, L2");

        let label = Instruction::new(Op::Label, src).with_label(0, 2);
        assert_eq!(label.to_string(), "label L2");
    }
}
