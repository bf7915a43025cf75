//! Liveness intervals over linear IR.

use super::cfg::ControlFlowGraph;
use super::instr::Instruction;
use rustc_hash::FxHashMap;
use tern_ffi::{TypeId, TypeRegistry};

/// Live interval of one virtual register: `[begin, end]` instruction
/// addresses, a use count, and the register bank it needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegInterval {
    pub reg: u32,
    pub begin: usize,
    pub end: usize,
    pub usage_count: u32,
    pub is_fp: bool,
}

impl RegInterval {
    /// Two intervals are concurrent when their ranges overlap.
    pub fn is_concurrent(&self, other: &RegInterval) -> bool {
        self.begin <= other.end && other.begin <= self.end
    }
}

/// Per-function liveness data: intervals sorted by `begin`, plus an index
/// from register id to its intervals.
#[derive(Debug, Clone, Default)]
pub struct LivenessData {
    pub intervals: Vec<RegInterval>,
    pub reg_lifetime_map: FxHashMap<u32, Vec<usize>>,
}

impl LivenessData {
    /// Compute intervals for `code`.
    ///
    /// Each register gets the interval from its first definition to its last
    /// use, then intervals are widened across loop back edges: a register
    /// live at a back edge's target stays live through the jump itself.
    pub fn build(code: &[Instruction], cfg: &ControlFlowGraph, types: &TypeRegistry) -> Self {
        let mut begin: FxHashMap<u32, usize> = FxHashMap::default();
        let mut end: FxHashMap<u32, usize> = FxHashMap::default();
        let mut uses: FxHashMap<u32, u32> = FxHashMap::default();
        let mut reg_ty: FxHashMap<u32, TypeId> = FxHashMap::default();

        for (addr, instr) in code.iter().enumerate() {
            instr.for_each_reg(|reg| {
                begin.entry(reg).or_insert(addr);
                let e = end.entry(reg).or_insert(addr);
                if addr > *e {
                    *e = addr;
                }
            });
            instr.for_each_read_reg(|reg| {
                *uses.entry(reg).or_insert(0) += 1;
            });
            for operand in instr.operands.iter().flatten() {
                if let Some(reg) = operand.reg_id() {
                    reg_ty.entry(reg).or_insert(operand.ty);
                }
            }
        }

        // Widen across loops until stable: any interval covering a back
        // edge's target must survive to the back edge's source.
        let back_edges = cfg.back_edges();
        let mut changed = true;
        while changed {
            changed = false;
            for &(from_addr, to_addr) in &back_edges {
                for (&reg, &b) in begin.iter() {
                    let e = end.get_mut(&reg).expect("begin implies end");
                    if b <= to_addr && *e >= to_addr && *e < from_addr {
                        *e = from_addr;
                        changed = true;
                    }
                }
            }
        }

        let mut intervals: Vec<RegInterval> = begin
            .iter()
            .map(|(&reg, &b)| {
                let is_fp = reg_ty
                    .get(&reg)
                    .and_then(|ty| types.resolve(*ty))
                    .map(|dt| dt.meta.is_floating_point)
                    .unwrap_or(false);
                RegInterval {
                    reg,
                    begin: b,
                    end: end[&reg],
                    usage_count: uses.get(&reg).copied().unwrap_or(0),
                    is_fp,
                }
            })
            .collect();
        intervals.sort_by_key(|iv| (iv.begin, iv.reg));

        let mut reg_lifetime_map: FxHashMap<u32, Vec<usize>> = FxHashMap::default();
        for (i, iv) in intervals.iter().enumerate() {
            reg_lifetime_map.entry(iv.reg).or_default().push(i);
        }

        Self {
            intervals,
            reg_lifetime_map,
        }
    }

    /// All intervals of one register.
    pub fn ranges_of(&self, reg: u32) -> impl Iterator<Item = &RegInterval> {
        self.reg_lifetime_map
            .get(&reg)
            .into_iter()
            .flatten()
            .map(move |&i| &self.intervals[i])
    }

    /// Whether `reg` is live at `addr`.
    pub fn live_at(&self, reg: u32, addr: usize) -> bool {
        self.ranges_of(reg).any(|iv| iv.begin <= addr && addr <= iv.end)
    }

    pub fn usage_count(&self, reg: u32) -> u32 {
        self.ranges_of(reg).map(|iv| iv.usage_count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::op::Op;
    use crate::ir::value::Value;
    use rustc_hash::FxHashMap as Map;
    use tern_parser::SourceLocation;

    fn build(code: &[Instruction]) -> LivenessData {
        let types = TypeRegistry::new();
        let mut labels = Map::default();
        for (addr, i) in code.iter().enumerate() {
            if i.op == Op::Label {
                labels.insert(i.primary_label().unwrap(), addr);
            }
        }
        let cfg = ControlFlowGraph::build(code, &labels);
        LivenessData::build(code, &cfg, &types)
    }

    fn i32_ty() -> TypeId {
        TypeId::from_fqn("i32")
    }

    fn f64_ty() -> TypeId {
        TypeId::from_fqn("f64")
    }

    #[test]
    fn straight_line_intervals() {
        let src = SourceLocation::default();
        // 0: cvt r0, 1
        // 1: cvt r1, 2
        // 2: iadd r2, r0, r1
        // 3: ret r2
        let code = vec![
            Instruction::new(Op::Cvt, src)
                .with_op1(Value::reg(0, i32_ty()))
                .with_op2(Value::imm_i(1, i32_ty())),
            Instruction::new(Op::Cvt, src)
                .with_op1(Value::reg(1, i32_ty()))
                .with_op2(Value::imm_i(2, i32_ty())),
            Instruction::new(Op::IAdd, src)
                .with_op1(Value::reg(2, i32_ty()))
                .with_op2(Value::reg(0, i32_ty()))
                .with_op3(Value::reg(1, i32_ty())),
            Instruction::new(Op::Ret, src).with_op1(Value::reg(2, i32_ty())),
        ];
        let lv = build(&code);
        assert_eq!(lv.intervals.len(), 3);
        let r0 = lv.ranges_of(0).next().unwrap();
        assert_eq!((r0.begin, r0.end), (0, 2));
        let r2 = lv.ranges_of(2).next().unwrap();
        assert_eq!((r2.begin, r2.end), (2, 3));
        assert_eq!(lv.usage_count(2), 1);
        assert!(lv.intervals.windows(2).all(|w| w[0].begin <= w[1].begin));
    }

    #[test]
    fn fp_flag_from_operand_type() {
        let src = SourceLocation::default();
        let code = vec![
            Instruction::new(Op::DAdd, src)
                .with_op1(Value::reg(0, f64_ty()))
                .with_op2(Value::imm_f64(1.0, f64_ty()))
                .with_op3(Value::imm_f64(2.0, f64_ty())),
            Instruction::new(Op::Ret, src).with_op1(Value::reg(0, f64_ty())),
        ];
        let lv = build(&code);
        assert!(lv.ranges_of(0).next().unwrap().is_fp);
    }

    #[test]
    fn loop_widens_interval_to_back_edge() {
        let src = SourceLocation::default();
        // r0 defined before the loop, used at the loop head; the back edge
        // at address 3 must keep it live through the whole loop body.
        // 0: cvt r0, 1
        // 1: label L0
        // 2: branch r0, L1
        // 3: jump L0
        // 4: label L1
        // 5: ret
        let code = vec![
            Instruction::new(Op::Cvt, src)
                .with_op1(Value::reg(0, i32_ty()))
                .with_op2(Value::imm_i(1, i32_ty())),
            Instruction::new(Op::Label, src).with_label(0, 0),
            Instruction::new(Op::Branch, src)
                .with_op1(Value::reg(0, i32_ty()))
                .with_label(0, 1),
            Instruction::new(Op::Jump, src).with_label(0, 0),
            Instruction::new(Op::Label, src).with_label(0, 1),
            Instruction::new(Op::Ret, src),
        ];
        let lv = build(&code);
        let iv = lv.ranges_of(0).next().unwrap();
        assert!(iv.end >= 3, "interval must cover the back edge, got {:?}", iv);
        assert!(lv.live_at(0, 3));
    }

    #[test]
    fn concurrency_is_overlap() {
        let a = RegInterval { reg: 0, begin: 0, end: 5, usage_count: 1, is_fp: false };
        let b = RegInterval { reg: 1, begin: 5, end: 9, usage_count: 1, is_fp: false };
        let c = RegInterval { reg: 2, begin: 6, end: 9, usage_count: 1, is_fp: false };
        assert!(a.is_concurrent(&b));
        assert!(!a.is_concurrent(&c));
        assert!(b.is_concurrent(&c));
    }
}
