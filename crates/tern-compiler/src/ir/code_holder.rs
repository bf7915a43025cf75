//! Per-function IR container with derived analyses.

use super::cfg::ControlFlowGraph;
use super::instr::Instruction;
use super::liveness::LivenessData;
use super::op::Op;
use rustc_hash::FxHashMap;
use tern_ffi::{FunctionId, TypeRegistry};

/// Label id → address of the defining `label` instruction.
pub type LabelMap = FxHashMap<u32, usize>;

/// A function's IR plus the label map, CFG, and liveness derived from it.
/// Every mutation of `code` must be followed by [`CodeHolder::rebuild_all`]
/// before the analyses are read again.
#[derive(Debug, Clone, Default)]
pub struct CodeHolder {
    pub owner: Option<FunctionId>,
    pub code: Vec<Instruction>,
    pub labels: LabelMap,
    pub cfg: ControlFlowGraph,
    pub liveness: LivenessData,
}

impl CodeHolder {
    pub fn new(code: Vec<Instruction>) -> Self {
        Self {
            owner: None,
            code,
            labels: LabelMap::default(),
            cfg: ControlFlowGraph::default(),
            liveness: LivenessData::default(),
        }
    }

    pub fn with_owner(mut self, owner: FunctionId) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Re-derive labels, CFG, and liveness from `code`. Idempotent.
    pub fn rebuild_all(&mut self, types: &TypeRegistry) {
        self.rebuild_labels();
        self.rebuild_cfg();
        self.rebuild_liveness(types);
    }

    pub fn rebuild_labels(&mut self) {
        self.labels.clear();
        for (addr, instr) in self.code.iter().enumerate() {
            if instr.op == Op::Label {
                if let Some(label) = instr.primary_label() {
                    self.labels.insert(label, addr);
                }
            }
        }
    }

    pub fn rebuild_cfg(&mut self) {
        self.cfg = ControlFlowGraph::build(&self.code, &self.labels);
    }

    pub fn rebuild_liveness(&mut self, types: &TypeRegistry) {
        self.liveness = LivenessData::build(&self.code, &self.cfg, types);
    }

    /// Drop advisory meta markers; called before code generation.
    pub fn strip_meta(&mut self, types: &TypeRegistry) {
        let before = self.code.len();
        self.code.retain(|i| !i.op.is_meta());
        if self.code.len() != before {
            self.rebuild_all(types);
        }
    }

    /// Render an address-annotated listing, labels called out, for debug
    /// logs and tests.
    pub fn listing(&self) -> String {
        let mut out = String::new();
        for (addr, instr) in self.code.iter().enumerate() {
            out.push_str(&format!("{addr:4}: {instr}\n"));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::value::Value;
    use tern_ffi::TypeId;
    use tern_parser::SourceLocation;

    fn sample_code() -> Vec<Instruction> {
        let src = SourceLocation::default();
        let ty = TypeId::from_fqn("i32");
        vec![
            Instruction::new(Op::Label, src).with_label(0, 0),
            Instruction::new(Op::IAdd, src)
                .with_op1(Value::reg(1, ty))
                .with_op2(Value::reg(0, ty))
                .with_op3(Value::imm_i(1, ty)),
            Instruction::new(Op::Branch, src)
                .with_op1(Value::reg(1, ty))
                .with_label(0, 0),
            Instruction::new(Op::Ret, src).with_op1(Value::reg(1, ty)),
        ]
    }

    #[test]
    fn rebuild_is_idempotent() {
        let types = TypeRegistry::new();
        let mut holder = CodeHolder::new(sample_code());
        holder.rebuild_all(&types);
        let labels = holder.labels.clone();
        let blocks = holder.cfg.blocks.len();
        let intervals = holder.liveness.intervals.clone();

        holder.rebuild_all(&types);
        assert_eq!(holder.labels, labels);
        assert_eq!(holder.cfg.blocks.len(), blocks);
        assert_eq!(holder.liveness.intervals, intervals);
    }

    #[test]
    fn every_operand_reg_is_in_the_lifetime_map() {
        let types = TypeRegistry::new();
        let mut holder = CodeHolder::new(sample_code());
        holder.rebuild_all(&types);
        for (addr, instr) in holder.code.iter().enumerate() {
            instr.for_each_reg(|reg| {
                assert!(
                    holder.liveness.live_at(reg, addr),
                    "r{reg} not live at {addr}"
                );
            });
        }
    }

    #[test]
    fn listing_shows_addresses() {
        let types = TypeRegistry::new();
        let mut holder = CodeHolder::new(sample_code());
        holder.rebuild_all(&types);
        let listing = holder.listing();
        assert!(listing.contains("0: label L0"));
        assert!(listing.contains("3: ret r1"));
    }
}
