//! Control-flow graph over linear IR.

use super::instr::Instruction;
use super::op::Op;
use rustc_hash::FxHashMap;

/// One basic block: the half-open instruction range `[begin, end)` plus
/// predecessor/successor block indices.
#[derive(Debug, Clone, Default)]
pub struct BasicBlock {
    pub begin: usize,
    pub end: usize,
    pub from: Vec<usize>,
    pub to: Vec<usize>,
}

impl BasicBlock {
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.begin && addr < self.end
    }

    pub fn len(&self) -> usize {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }
}

/// Basic blocks split at labels and after terminators, with edges for
/// fallthrough, jumps, and branches.
#[derive(Debug, Clone, Default)]
pub struct ControlFlowGraph {
    pub blocks: Vec<BasicBlock>,
}

impl ControlFlowGraph {
    /// Derive the CFG from `code`. `label_addr` maps label ids to the
    /// address of their defining `label` instruction.
    pub fn build(code: &[Instruction], label_addr: &FxHashMap<u32, usize>) -> Self {
        if code.is_empty() {
            return Self::default();
        }

        // Block boundaries: address 0, every label, every address after a
        // terminator.
        let mut starts = vec![0usize];
        for (addr, instr) in code.iter().enumerate() {
            if instr.op == Op::Label {
                starts.push(addr);
            }
            if instr.op.is_terminator() && addr + 1 < code.len() {
                starts.push(addr + 1);
            }
        }
        starts.sort_unstable();
        starts.dedup();

        let mut blocks: Vec<BasicBlock> = starts
            .windows(2)
            .map(|w| BasicBlock {
                begin: w[0],
                end: w[1],
                from: Vec::new(),
                to: Vec::new(),
            })
            .collect();
        blocks.push(BasicBlock {
            begin: *starts.last().unwrap_or(&0),
            end: code.len(),
            from: Vec::new(),
            to: Vec::new(),
        });

        let block_of = |addr: usize, blocks: &[BasicBlock]| -> usize {
            // Blocks are sorted by begin
            match blocks.binary_search_by(|b| {
                if addr < b.begin {
                    std::cmp::Ordering::Greater
                } else if addr >= b.end {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Equal
                }
            }) {
                Ok(i) => i,
                Err(_) => blocks.len().saturating_sub(1),
            }
        };

        let mut edges: Vec<(usize, usize)> = Vec::new();
        for (i, block) in blocks.iter().enumerate() {
            if block.is_empty() {
                continue;
            }
            let last = &code[block.end - 1];
            match last.op {
                Op::Jump => {
                    if let Some(target) = last.primary_label().and_then(|l| label_addr.get(&l)) {
                        edges.push((i, block_of(*target, &blocks)));
                    }
                }
                Op::Branch => {
                    if let Some(target) = last.primary_label().and_then(|l| label_addr.get(&l)) {
                        edges.push((i, block_of(*target, &blocks)));
                    }
                    if block.end < code.len() {
                        edges.push((i, block_of(block.end, &blocks)));
                    }
                }
                Op::Ret | Op::Term => {}
                _ => {
                    if block.end < code.len() {
                        edges.push((i, block_of(block.end, &blocks)));
                    }
                }
            }
        }

        for (from, to) in edges {
            if !blocks[from].to.contains(&to) {
                blocks[from].to.push(to);
            }
            if !blocks[to].from.contains(&from) {
                blocks[to].from.push(from);
            }
        }

        Self { blocks }
    }

    pub fn block_containing(&self, addr: usize) -> Option<usize> {
        self.blocks.iter().position(|b| b.contains(addr))
    }

    /// Back edges: `(from_addr, to_addr)` pairs where control moves to an
    /// earlier address. Used to extend liveness across loops.
    pub fn back_edges(&self) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        for block in &self.blocks {
            for &succ in &block.to {
                if self.blocks[succ].begin < block.end {
                    out.push((block.end.saturating_sub(1), self.blocks[succ].begin));
                }
            }
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

    fn label_map(code: &[Instruction]) -> FxHashMap<u32, usize> {
        let mut map = FxHashMap::default();
        for (addr, instr) in code.iter().enumerate() {
            if instr.op == Op::Label {
                map.insert(instr.primary_label().unwrap(), addr);
            }
        }
        map
    }

    fn ty() -> TypeId {
        TypeId::from_fqn("bool")
    }

    #[test]
    fn straight_line_is_one_block() {
        let src = SourceLocation::default();
        let code = vec![
            Instruction::new(Op::IAdd, src)
                .with_op1(Value::reg(2, ty()))
                .with_op2(Value::reg(0, ty()))
                .with_op3(Value::reg(1, ty())),
            Instruction::new(Op::Ret, src).with_op1(Value::reg(2, ty())),
        ];
        let cfg = ControlFlowGraph::build(&code, &label_map(&code));
        assert_eq!(cfg.blocks.len(), 1);
        assert_eq!(cfg.blocks[0].begin, 0);
        assert_eq!(cfg.blocks[0].end, 2);
        assert!(cfg.blocks[0].to.is_empty());
    }

    #[test]
    fn branch_splits_and_connects() {
        let src = SourceLocation::default();
        // 0: branch r0, L0   (fallthrough to 1, jump to 2)
        // 1: jump L1
        // 2: label L0
        // 3: label L1
        // 4: ret
        let code = vec![
            Instruction::new(Op::Branch, src)
                .with_op1(Value::reg(0, ty()))
                .with_label(0, 0),
            Instruction::new(Op::Jump, src).with_label(0, 1),
            Instruction::new(Op::Label, src).with_label(0, 0),
            Instruction::new(Op::Label, src).with_label(0, 1),
            Instruction::new(Op::Ret, src),
        ];
        let cfg = ControlFlowGraph::build(&code, &label_map(&code));
        // blocks: [0,1) [1,2) [2,3) [3,5)
        assert_eq!(cfg.blocks.len(), 4);
        assert_eq!(cfg.blocks[0].to, vec![2, 1]);
        assert_eq!(cfg.blocks[1].to, vec![3]);
        assert_eq!(cfg.blocks[2].to, vec![3]);
        let mut from = cfg.blocks[3].from.clone();
        from.sort_unstable();
        assert_eq!(from, vec![1, 2]);
    }

    #[test]
    fn blocks_cover_code_exactly() {
        let src = SourceLocation::default();
        let code = vec![
            Instruction::new(Op::Label, src).with_label(0, 0),
            Instruction::new(Op::IAdd, src)
                .with_op1(Value::reg(0, ty()))
                .with_op2(Value::reg(0, ty()))
                .with_op3(Value::reg(0, ty())),
            Instruction::new(Op::Branch, src)
                .with_op1(Value::reg(0, ty()))
                .with_label(0, 0),
            Instruction::new(Op::Ret, src),
        ];
        let cfg = ControlFlowGraph::build(&code, &label_map(&code));
        let mut covered = vec![false; code.len()];
        for b in &cfg.blocks {
            for a in b.begin..b.end {
                assert!(!covered[a], "overlap at {a}");
                covered[a] = true;
            }
        }
        assert!(covered.iter().all(|&c| c));
    }

    #[test]
    fn loop_has_back_edge() {
        let src = SourceLocation::default();
        let code = vec![
            Instruction::new(Op::Label, src).with_label(0, 0),
            Instruction::new(Op::Branch, src)
                .with_op1(Value::reg(0, ty()))
                .with_label(0, 1),
            Instruction::new(Op::Jump, src).with_label(0, 0),
            Instruction::new(Op::Label, src).with_label(0, 1),
            Instruction::new(Op::Ret, src),
        ];
        let cfg = ControlFlowGraph::build(&code, &label_map(&code));
        let back = cfg.back_edges();
        assert_eq!(back.len(), 1);
        assert!(back[0].1 <= back[0].0);
    }
}
