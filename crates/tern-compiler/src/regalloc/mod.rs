//! Linear-scan register allocation.
//!
//! Lowers virtual registers onto `gp_count` general + `fp_count` floating
//! banks. When `fp_count` is zero, floating values share the general bank.
//! Non-spilled vregs are renumbered into `[0..N)`/`[0..M)`; the banks are
//! distinguished by operand type downstream. Spilled values live in frame
//! slots; their defs and uses are rewritten to scratch ids just above the
//! bank limit (`N..N+3`), which the VM backend maps onto its volatile
//! registers, with a `store` after each def and a `load` before each use.
//!
//! The allocator also fixes the frame layout: every compiler stack
//! allocation and every spill slot gets a static offset from the
//! [`StackManager`], published as a [`FrameLayout`] for the backend.

mod stack;

pub use stack::StackManager;

use crate::ir::{AllocId, CodeHolder, Instruction, Op, RegInterval, VRegId, Value, ValueKind};
use rustc_hash::FxHashMap;
use tern_ffi::TypeRegistry;

/// Scratch ids reserved above each bank for spill traffic; the backend maps
/// them to volatile registers.
pub const SPILL_SCRATCH_COUNT: u32 = 3;

/// Where one original vreg ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegAssignment {
    /// Physical index within its bank.
    Phys(u32),
    /// Frame offset of the 8-byte spill slot.
    Spill(u32),
}

/// Static frame layout for one function.
#[derive(Debug, Clone, Default)]
pub struct FrameLayout {
    /// Total frame bytes, 8-aligned.
    pub frame_size: u32,
    /// Offset of each compiler stack allocation.
    pub alloc_offsets: FxHashMap<AllocId, u32>,
}

/// Result of allocating one function.
#[derive(Debug, Clone, Default)]
pub struct AllocationResult {
    pub frame: FrameLayout,
    /// Assignment of every original vreg that appeared in the code.
    pub assignments: FxHashMap<VRegId, RegAssignment>,
    /// How many spill slots were created.
    pub spill_count: u32,
}

pub struct RegisterAllocator {
    gp_count: u32,
    fp_count: u32,
}

impl RegisterAllocator {
    pub fn new(gp_count: u32, fp_count: u32) -> Self {
        debug_assert!(gp_count >= 2, "need at least two general registers");
        Self { gp_count, fp_count }
    }

    /// Allocate registers for `holder`, rewriting its code in place.
    pub fn process(&self, holder: &mut CodeHolder, types: &TypeRegistry) -> AllocationResult {
        holder.rebuild_all(types);

        let mut stack_mgr = StackManager::new();
        let frame_allocs = assign_alloc_offsets(&holder.code, &mut stack_mgr);

        // Partition intervals by bank. With no FP bank, everything is GP.
        let mut gp: Vec<RegInterval> = Vec::new();
        let mut fp: Vec<RegInterval> = Vec::new();
        for iv in &holder.liveness.intervals {
            if iv.is_fp && self.fp_count > 0 {
                fp.push(*iv);
            } else {
                gp.push(*iv);
            }
        }

        let mut assignments: FxHashMap<VRegId, RegAssignment> = FxHashMap::default();
        let mut spill_count = 0;
        spill_count += linear_scan(&mut gp, self.gp_count, &mut stack_mgr, &mut assignments);
        if self.fp_count > 0 {
            spill_count += linear_scan(&mut fp, self.fp_count, &mut stack_mgr, &mut assignments);
        }

        let gp_scratch_base = self.gp_count;
        let fp_scratch_base = if self.fp_count > 0 { self.fp_count } else { self.gp_count };
        let spill_allocs = rewrite_code(
            holder,
            &assignments,
            self.fp_count > 0,
            gp_scratch_base,
            fp_scratch_base,
            types,
        );

        let mut alloc_offsets = frame_allocs;
        alloc_offsets.extend(spill_allocs);

        let frame_size = stack_mgr.size().div_ceil(8) * 8;
        holder.rebuild_all(types);

        AllocationResult {
            frame: FrameLayout {
                frame_size,
                alloc_offsets,
            },
            assignments,
            spill_count,
        }
    }
}

/// Walk the code assigning static offsets to `stack_alloc`s, reusing space
/// freed by `stack_free` in program order.
fn assign_alloc_offsets(
    code: &[Instruction],
    stack_mgr: &mut StackManager,
) -> FxHashMap<AllocId, u32> {
    let mut offsets = FxHashMap::default();
    for instr in code {
        match instr.op {
            Op::StackAlloc => {
                let alloc = match instr.op1().map(|v| &v.kind) {
                    Some(ValueKind::StackAlloc(a)) => *a,
                    _ => continue,
                };
                let size = instr
                    .op2()
                    .and_then(Value::imm_value)
                    .and_then(|i| i.as_u64())
                    .unwrap_or(8) as u32;
                offsets.entry(alloc).or_insert_with(|| stack_mgr.alloc(size));
            }
            Op::StackFree => {
                if let Some(ValueKind::StackAlloc(a)) = instr.op1().map(|v| &v.kind) {
                    if let Some(offset) = offsets.get(a) {
                        stack_mgr.free(*offset);
                    }
                }
            }
            _ => {}
        }
    }
    offsets
}

/// Classic linear scan over one bank. Returns the number of spills.
fn linear_scan(
    intervals: &mut [RegInterval],
    k: u32,
    stack_mgr: &mut StackManager,
    assignments: &mut FxHashMap<VRegId, RegAssignment>,
) -> u32 {
    intervals.sort_by_key(|iv| (iv.begin, iv.end));

    // (interval index, phys reg), kept sorted by interval end
    let mut active: Vec<(usize, u32)> = Vec::new();
    let mut free: Vec<u32> = (0..k).rev().collect();
    let mut spills = 0;

    for idx in 0..intervals.len() {
        let current = intervals[idx];

        // Expire intervals whose value dies at or before this def; a dying
        // source may share its register with the new destination.
        active.retain(|&(i, phys)| {
            if intervals[i].end <= current.begin {
                free.push(phys);
                false
            } else {
                true
            }
        });
        free.sort_unstable_by(|a, b| b.cmp(a));

        if let Some(phys) = free.pop() {
            assignments.insert(current.reg, RegAssignment::Phys(phys));
            active.push((idx, phys));
            active.sort_by_key(|&(i, _)| intervals[i].end);
            continue;
        }

        // No register free: spill whichever live interval ends last,
        // the current one included.
        spills += 1;
        let slot = stack_mgr.alloc(8);
        let victim = active
            .iter()
            .enumerate()
            .max_by_key(|(_, &(i, _))| intervals[i].end)
            .map(|(pos, &(i, phys))| (pos, i, phys));

        match victim {
            Some((pos, i, phys)) if intervals[i].end > current.end => {
                assignments.insert(intervals[i].reg, RegAssignment::Spill(slot));
                active.remove(pos);
                assignments.insert(current.reg, RegAssignment::Phys(phys));
                active.push((idx, phys));
                active.sort_by_key(|&(j, _)| intervals[j].end);
            }
            _ => {
                assignments.insert(current.reg, RegAssignment::Spill(slot));
            }
        }
    }

    spills
}

/// Rewrite every register operand to its physical index, inserting spill
/// loads and stores through scratch ids. Returns the synthetic allocation
/// ids created for spill slots, with their frame offsets.
fn rewrite_code(
    holder: &mut CodeHolder,
    assignments: &FxHashMap<VRegId, RegAssignment>,
    fp_bank: bool,
    gp_scratch_base: u32,
    fp_scratch_base: u32,
    types: &TypeRegistry,
) -> FxHashMap<AllocId, u32> {
    let mut out: Vec<Instruction> = Vec::with_capacity(holder.code.len());
    // Spill slots are addressed as synthetic allocations; ids continue after
    // the compiler's own.
    let mut spill_alloc_ids: FxHashMap<u32, AllocId> = FxHashMap::default();
    let mut next_alloc: AllocId = holder
        .code
        .iter()
        .filter_map(|i| match i.op1().map(|v| &v.kind) {
            Some(ValueKind::StackAlloc(a)) => Some(*a + 1),
            _ => None,
        })
        .max()
        .unwrap_or(0);

    let is_fp_value = |v: &Value| -> bool {
        fp_bank
            && types
                .resolve(v.ty)
                .map(|dt| dt.meta.is_floating_point)
                .unwrap_or(false)
    };

    for instr in holder.code.iter() {
        let mut instr = instr.clone();
        let assigned_slot = instr.assigned_slot();
        let mut loads: Vec<Instruction> = Vec::new();
        let mut stores: Vec<Instruction> = Vec::new();
        let mut scratch_used = 0u32;

        for (i, operand) in instr.operands.iter_mut().enumerate() {
            let Some(value) = operand else { continue };
            let Some(reg) = value.reg_id() else { continue };
            let Some(assignment) = assignments.get(&reg) else { continue };

            match assignment {
                RegAssignment::Phys(p) => {
                    value.kind = ValueKind::Register(*p);
                }
                RegAssignment::Spill(offset) => {
                    let scratch_base = if is_fp_value(value) {
                        fp_scratch_base
                    } else {
                        gp_scratch_base
                    };
                    let scratch = scratch_base + (scratch_used % SPILL_SCRATCH_COUNT);
                    scratch_used += 1;

                    let slot_alloc = *spill_alloc_ids.entry(*offset).or_insert_with(|| {
                        let id = next_alloc;
                        next_alloc += 1;
                        id
                    });
                    let slot_value = Value::stack(slot_alloc, value.ty);
                    let scratch_value = Value::reg(scratch, value.ty);

                    if Some(i) == assigned_slot {
                        stores.push(
                            Instruction::new(Op::Store, instr.src)
                                .with_op1(scratch_value.clone())
                                .with_op2(slot_value),
                        );
                    } else {
                        loads.push(
                            Instruction::new(Op::Load, instr.src)
                                .with_op1(scratch_value.clone())
                                .with_op2(slot_value),
                        );
                    }
                    value.kind = ValueKind::Register(scratch);
                }
            }
        }

        out.extend(loads);
        out.push(instr);
        out.extend(stores);
    }

    holder.code = out;

    spill_alloc_ids
        .into_iter()
        .map(|(offset, alloc)| (alloc, offset))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_ffi::TypeId;
    use tern_parser::SourceLocation;

    fn i32_ty() -> TypeId {
        TypeId::from_fqn("i32")
    }

    fn cvt(dst: u32, imm: i64) -> Instruction {
        Instruction::new(Op::Cvt, SourceLocation::default())
            .with_op1(Value::reg(dst, i32_ty()))
            .with_op2(Value::imm_i(imm, i32_ty()))
    }

    fn iadd(dst: u32, a: u32, b: u32) -> Instruction {
        Instruction::new(Op::IAdd, SourceLocation::default())
            .with_op1(Value::reg(dst, i32_ty()))
            .with_op2(Value::reg(a, i32_ty()))
            .with_op3(Value::reg(b, i32_ty()))
    }

    fn max_phys_reg(holder: &CodeHolder) -> u32 {
        let mut max = 0;
        for instr in &holder.code {
            instr.for_each_reg(|r| max = max.max(r));
        }
        max
    }

    #[test]
    fn no_spill_when_registers_suffice() {
        let types = TypeRegistry::new();
        let mut holder = CodeHolder::new(vec![
            cvt(0, 1),
            cvt(1, 2),
            iadd(2, 0, 1),
            Instruction::new(Op::Ret, SourceLocation::default())
                .with_op1(Value::reg(2, i32_ty())),
        ]);
        let result = RegisterAllocator::new(4, 0).process(&mut holder, &types);
        assert_eq!(result.spill_count, 0);
        assert!(max_phys_reg(&holder) < 4);
    }

    #[test]
    fn destination_reuses_dying_source_register() {
        let types = TypeRegistry::new();
        let mut holder = CodeHolder::new(vec![
            cvt(0, 1),
            cvt(1, 2),
            iadd(2, 0, 1),
            Instruction::new(Op::Ret, SourceLocation::default())
                .with_op1(Value::reg(2, i32_ty())),
        ]);
        let result = RegisterAllocator::new(2, 0).process(&mut holder, &types);
        assert_eq!(result.spill_count, 0, "r2 can reuse a dying register");
        assert!(max_phys_reg(&holder) < 2);
    }

    /// Three concurrent values with two registers insert exactly one
    /// store/load pair, for the value with the latest end.
    #[test]
    fn spill_inserts_one_store_load_pair() {
        let types = TypeRegistry::new();
        // v0 [0,3], v1 [1,3], v2 [2,4]: all three overlap in [2,3]; v2 has
        // the latest end and gets spilled.
        let mut holder = CodeHolder::new(vec![
            cvt(0, 1),
            cvt(1, 2),
            cvt(2, 3),
            iadd(3, 0, 1),
            iadd(4, 3, 2),
            Instruction::new(Op::Ret, SourceLocation::default())
                .with_op1(Value::reg(4, i32_ty())),
        ]);
        let result = RegisterAllocator::new(2, 0).process(&mut holder, &types);
        assert_eq!(result.spill_count, 1);
        assert_eq!(result.assignments.get(&2), Some(&RegAssignment::Spill(0)));

        let stores = holder.code.iter().filter(|i| i.op == Op::Store).count();
        let loads = holder.code.iter().filter(|i| i.op == Op::Load).count();
        assert_eq!((stores, loads), (1, 1), "listing:\n{}", holder.listing());

        // The store follows the def; the load precedes the use
        let store_at = holder.code.iter().position(|i| i.op == Op::Store).unwrap();
        let load_at = holder.code.iter().position(|i| i.op == Op::Load).unwrap();
        assert!(store_at < load_at);
    }

    #[test]
    fn no_two_concurrent_intervals_share_a_register() {
        let types = TypeRegistry::new();
        let mut holder = CodeHolder::new(vec![
            cvt(0, 1),
            cvt(1, 2),
            cvt(2, 3),
            iadd(3, 0, 1),
            iadd(4, 3, 2),
            Instruction::new(Op::Ret, SourceLocation::default())
                .with_op1(Value::reg(4, i32_ty())),
        ]);
        let result = RegisterAllocator::new(2, 0).process(&mut holder, &types);

        let phys: Vec<(u32, RegAssignment)> = result
            .assignments
            .iter()
            .map(|(r, a)| (*r, *a))
            .collect();
        // Recompute original liveness to cross-check concurrency
        let mut original = CodeHolder::new(vec![
            cvt(0, 1),
            cvt(1, 2),
            cvt(2, 3),
            iadd(3, 0, 1),
            iadd(4, 3, 2),
            Instruction::new(Op::Ret, SourceLocation::default())
                .with_op1(Value::reg(4, i32_ty())),
        ]);
        original.rebuild_all(&types);
        for (ra, aa) in &phys {
            for (rb, ab) in &phys {
                if ra >= rb {
                    continue;
                }
                if let (RegAssignment::Phys(pa), RegAssignment::Phys(pb)) = (aa, ab) {
                    if pa == pb {
                        let ia = original.liveness.ranges_of(*ra).next().unwrap();
                        let ib = original.liveness.ranges_of(*rb).next().unwrap();
                        // Shared register requires non-overlap (allowing the
                        // def-kill boundary to touch)
                        assert!(
                            ia.end <= ib.begin || ib.end <= ia.begin,
                            "r{ra} and r{rb} share phys {pa} while concurrent"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn fp_bank_is_separate_when_present() {
        let types = TypeRegistry::new();
        let f64_ty = TypeId::from_fqn("f64");
        let src = SourceLocation::default();
        let mut holder = CodeHolder::new(vec![
            cvt(0, 1),
            Instruction::new(Op::Cvt, src)
                .with_op1(Value::reg(1, f64_ty))
                .with_op2(Value::imm_f64(1.0, f64_ty)),
            Instruction::new(Op::DAdd, src)
                .with_op1(Value::reg(2, f64_ty))
                .with_op2(Value::reg(1, f64_ty))
                .with_op3(Value::reg(1, f64_ty)),
            Instruction::new(Op::Ret, src).with_op1(Value::reg(2, f64_ty)),
        ]);
        let result = RegisterAllocator::new(2, 2).process(&mut holder, &types);
        assert_eq!(result.spill_count, 0);
        // Both banks start numbering at zero; types disambiguate
        assert!(matches!(result.assignments.get(&0), Some(RegAssignment::Phys(0))));
        assert!(matches!(result.assignments.get(&1), Some(RegAssignment::Phys(0))));
    }
}
