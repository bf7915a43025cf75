//! Constant folding.
//!
//! Function-level and required: any pure instruction whose inputs are all
//! immediates becomes a single assignment of the computed immediate.
//! Floating-point folds use the IEEE-754 semantics of the operand type; `%`
//! on floats follows Rust's truncating remainder. Integer division by a zero
//! immediate is left in place for the runtime to raise.

use super::{OptimizationStep, OptimizeContext};
use crate::ir::{CodeHolder, Immediate, Instruction, Op, Value};
use tern_ffi::TypeRegistry;

pub struct ConstantFolding;

impl OptimizationStep for ConstantFolding {
    fn name(&self) -> &'static str {
        "constant-folding"
    }

    fn is_required(&self) -> bool {
        true
    }

    fn run(&mut self, holder: &mut CodeHolder, ctx: &mut OptimizeContext) -> bool {
        let mut changed = fold_instructions(holder, ctx);
        changed |= propagate_block_constants(holder, ctx);
        changed |= fold_constant_branches(holder);
        changed
    }
}

fn fold_instructions(holder: &mut CodeHolder, ctx: &mut OptimizeContext) -> bool {
    let mut changed = false;

    for addr in 0..holder.code.len() {
        let instr = &holder.code[addr];
        if !instr.is_assignment() || instr.op == Op::Call {
            continue;
        }
        let Some(dst) = instr.op1().cloned() else { continue };

        let folded = match (instr.op2().and_then(Value::imm_value), instr.op3().and_then(Value::imm_value)) {
            (Some(a), Some(b)) if instr.operand_count() == 3 => fold_binary(instr.op, a, b),
            (Some(a), None) if instr.operand_count() == 2 => {
                let out = fold_unary(instr.op, a, &dst, ctx.types);
                // Rewriting a cvt whose immediate is already canonical would
                // loop forever
                match (instr.op, out) {
                    (Op::Cvt, Some(imm)) if imm == a => None,
                    (_, out) => out,
                }
            }
            _ => None,
        };

        if let Some(imm) = folded {
            let src = instr.src;
            let ty = dst.ty;
            holder.code[addr] = Instruction::new(Op::Cvt, src)
                .with_op1(dst)
                .with_op2(Value::imm(imm, ty));
            changed = true;
        }
    }

    changed
}

/// How many operand slots of this instruction may hold an immediate. Jumps
/// and branches spend their immediate word on the target; everywhere else
/// the encoder materializes surplus immediates through scratch registers.
fn imm_budget(op: Op) -> usize {
    match op {
        Op::Jump | Op::Branch => 0,
        _ => 3,
    }
}

/// Replace register reads with known block-local constants, within the
/// encoding's one-immediate budget.
fn propagate_block_constants(holder: &mut CodeHolder, ctx: &mut OptimizeContext) -> bool {
    use rustc_hash::FxHashMap;
    let mut changed = false;
    let blocks: Vec<(usize, usize)> = holder
        .cfg
        .blocks
        .iter()
        .map(|b| (b.begin, b.end))
        .collect();

    for (begin, end) in blocks {
        let mut known: FxHashMap<u32, (Immediate, tern_ffi::TypeId)> = FxHashMap::default();

        for addr in begin..end {
            let assigned = holder.code[addr].assigned_slot();
            let budget = imm_budget(holder.code[addr].op);
            let mut imm_count = holder.code[addr]
                .operands
                .iter()
                .flatten()
                .filter(|v| v.is_imm())
                .count();

            for (i, operand) in holder.code[addr].operands.iter_mut().enumerate() {
                if Some(i) == assigned {
                    continue;
                }
                let Some(op_val) = operand else { continue };
                let Some(reg) = op_val.reg_id() else { continue };
                if let Some((imm, ty)) = known.get(&reg) {
                    if imm_count < budget {
                        *op_val = Value::imm(*imm, *ty);
                        imm_count += 1;
                        changed = true;
                    }
                }
            }

            let instr = &holder.code[addr];
            if let Some(written) = instr.assigned_reg() {
                known.remove(&written);
                if instr.op == Op::Cvt {
                    if let (Some(dst), Some(imm)) = (instr.op1(), instr.op2().and_then(Value::imm_value)) {
                        // Record the value as seen through the destination type
                        if let Some(norm) = fold_unary(Op::Cvt, imm, dst, ctx.types) {
                            known.insert(written, (norm, dst.ty));
                        }
                    }
                }
            }
        }
    }

    changed
}

/// `branch` on a constant condition either falls through (drop the branch) or
/// always jumps (rewrite to `jump`).
fn fold_constant_branches(holder: &mut CodeHolder) -> bool {
    let mut changed = false;
    let mut rewritten = Vec::with_capacity(holder.code.len());
    for instr in holder.code.drain(..) {
        if instr.op == Op::Branch {
            if let Some(imm) = instr.op1().and_then(Value::imm_value) {
                changed = true;
                if imm.is_truthy() {
                    // Always falls through
                    continue;
                }
                let mut jump = Instruction::new(Op::Jump, instr.src);
                jump.labels = instr.labels;
                rewritten.push(jump);
                continue;
            }
        }
        rewritten.push(instr);
    }
    holder.code = rewritten;
    changed
}

fn fold_binary(op: Op, a: Immediate, b: Immediate) -> Option<Immediate> {
    use Immediate::*;
    use Op::*;

    Some(match op {
        // signed
        IAdd => Int(a.as_i64()?.wrapping_add(b.as_i64()?)),
        ISub => Int(a.as_i64()?.wrapping_sub(b.as_i64()?)),
        IMul => Int(a.as_i64()?.wrapping_mul(b.as_i64()?)),
        IDiv => Int(a.as_i64()?.checked_div(b.as_i64()?)?),
        IMod => Int(a.as_i64()?.checked_rem(b.as_i64()?)?),
        // unsigned
        UAdd => UInt(a.as_u64()?.wrapping_add(b.as_u64()?)),
        USub => UInt(a.as_u64()?.wrapping_sub(b.as_u64()?)),
        UMul => UInt(a.as_u64()?.wrapping_mul(b.as_u64()?)),
        UDiv => UInt(a.as_u64()?.checked_div(b.as_u64()?)?),
        UMod => UInt(a.as_u64()?.checked_rem(b.as_u64()?)?),
        // f32
        FAdd => F32(as_f32(a)? + as_f32(b)?),
        FSub => F32(as_f32(a)? - as_f32(b)?),
        FMul => F32(as_f32(a)? * as_f32(b)?),
        FDiv => F32(as_f32(a)? / as_f32(b)?),
        FMod => F32(as_f32(a)? % as_f32(b)?),
        // f64
        DAdd => F64(a.as_f64()? + b.as_f64()?),
        DSub => F64(a.as_f64()? - b.as_f64()?),
        DMul => F64(a.as_f64()? * b.as_f64()?),
        DDiv => F64(a.as_f64()? / b.as_f64()?),
        DMod => F64(a.as_f64()? % b.as_f64()?),
        // bitwise / shift
        BAnd => UInt(a.as_u64()? & b.as_u64()?),
        BOr => UInt(a.as_u64()? | b.as_u64()?),
        BXor => UInt(a.as_u64()? ^ b.as_u64()?),
        Sl => UInt(a.as_u64()?.wrapping_shl(b.as_u64()? as u32)),
        Sr => UInt(a.as_u64()?.wrapping_shr(b.as_u64()? as u32)),
        // logical
        LAnd => UInt((a.is_truthy() && b.is_truthy()) as u64),
        LOr => UInt((a.is_truthy() || b.is_truthy()) as u64),
        // comparisons
        Lt => UInt(cmp_imm(a, b, |o| o == std::cmp::Ordering::Less)?),
        Gt => UInt(cmp_imm(a, b, |o| o == std::cmp::Ordering::Greater)?),
        Lte => UInt(cmp_imm(a, b, |o| o != std::cmp::Ordering::Greater)?),
        Gte => UInt(cmp_imm(a, b, |o| o != std::cmp::Ordering::Less)?),
        Cmp => UInt(eq_imm(a, b)? as u64),
        NCmp => UInt(!eq_imm(a, b)? as u64),
        _ => return None,
    })
}

fn as_f32(imm: Immediate) -> Option<f32> {
    match imm {
        Immediate::F32(v) => Some(v),
        Immediate::F64(v) => Some(v as f32),
        Immediate::Int(v) => Some(v as f32),
        Immediate::UInt(v) => Some(v as f32),
        _ => None,
    }
}

fn cmp_imm(a: Immediate, b: Immediate, pred: impl Fn(std::cmp::Ordering) -> bool) -> Option<u64> {
    use Immediate::*;
    let ord = match (a, b) {
        (Int(x), Int(y)) => x.partial_cmp(&y),
        (UInt(x), UInt(y)) => x.partial_cmp(&y),
        (Int(x), UInt(y)) | (UInt(y), Int(x)) => (x as i128).partial_cmp(&(y as i128)),
        _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
    }?;
    Some(pred(ord) as u64)
}

fn eq_imm(a: Immediate, b: Immediate) -> Option<bool> {
    use Immediate::*;
    Some(match (a, b) {
        (Int(x), Int(y)) => x == y,
        (UInt(x), UInt(y)) => x == y,
        (Int(x), UInt(y)) | (UInt(y), Int(x)) => x as i128 == y as i128,
        _ => a.as_f64()? == b.as_f64()?,
    })
}

fn fold_unary(op: Op, a: Immediate, dst: &Value, types: &TypeRegistry) -> Option<Immediate> {
    match op {
        Op::Neg => Some(match a {
            Immediate::Int(v) => Immediate::Int(v.wrapping_neg()),
            Immediate::UInt(v) => Immediate::Int((v as i64).wrapping_neg()),
            Immediate::F32(v) => Immediate::F32(-v),
            Immediate::F64(v) => Immediate::F64(-v),
            _ => return None,
        }),
        Op::Cvt => {
            // Fold immediate conversions using the destination type's meta
            let meta = types.resolve(dst.ty)?.meta;
            if !meta.is_primitive {
                return None;
            }
            Some(if meta.is_floating_point {
                if meta.size == 4 {
                    Immediate::F32(as_f32(a)?)
                } else {
                    Immediate::F64(a.as_f64().or_else(|| a.as_i64().map(|v| v as f64))?)
                }
            } else if meta.is_unsigned {
                let bits = match a {
                    Immediate::F32(v) => v as u64,
                    Immediate::F64(v) => v as u64,
                    _ => a.as_u64()?,
                };
                Immediate::UInt(truncate_u(bits, meta.size))
            } else {
                let v = match a {
                    Immediate::F32(v) => v as i64,
                    Immediate::F64(v) => v as i64,
                    _ => a.as_i64()?,
                };
                Immediate::Int(truncate_i(v, meta.size))
            })
        }
        _ => None,
    }
}

fn truncate_u(v: u64, size: u32) -> u64 {
    match size {
        1 => v as u8 as u64,
        2 => v as u16 as u64,
        4 => v as u32 as u64,
        _ => v,
    }
}

fn truncate_i(v: i64, size: u32) -> i64 {
    match size {
        1 => v as i8 as i64,
        2 => v as i16 as i64,
        4 => v as i32 as i64,
        _ => v,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_parser::{Logger, SourceLocation};
    use tern_ffi::TypeId;

    fn i32_ty() -> TypeId {
        TypeId::from_fqn("i32")
    }

    fn fold(code: Vec<Instruction>) -> CodeHolder {
        let types = TypeRegistry::new();
        let mut log = Logger::new();
        let mut ctx = OptimizeContext {
            types: &types,
            log: &mut log,
            enabled: true,
        };
        let mut holder = CodeHolder::new(code);
        holder.rebuild_all(&types);
        while ConstantFolding.run(&mut holder, &mut ctx) {
            holder.rebuild_all(&types);
        }
        holder
    }

    fn folded_imm(holder: &CodeHolder, addr: usize) -> Option<i64> {
        holder.code[addr].op2().and_then(Value::imm_value).and_then(|i| i.as_i64())
    }

    #[test]
    fn folds_integer_arithmetic() {
        let src = SourceLocation::default();
        let holder = fold(vec![Instruction::new(Op::IAdd, src)
            .with_op1(Value::reg(0, i32_ty()))
            .with_op2(Value::imm_i(2, i32_ty()))
            .with_op3(Value::imm_i(40, i32_ty()))]);
        assert_eq!(holder.code[0].op, Op::Cvt);
        assert_eq!(folded_imm(&holder, 0), Some(42));
    }

    #[test]
    fn folding_is_idempotent() {
        let src = SourceLocation::default();
        let code = vec![
            Instruction::new(Op::IAdd, src)
                .with_op1(Value::reg(1, i32_ty()))
                .with_op2(Value::imm_i(2, i32_ty()))
                .with_op3(Value::imm_i(3, i32_ty())),
            Instruction::new(Op::Ret, src).with_op1(Value::reg(1, i32_ty())),
        ];
        let once = fold(code.clone());
        let listing = once.listing();
        let twice = fold(once.code.clone());
        assert_eq!(twice.listing(), listing);
    }

    #[test]
    fn division_by_zero_is_not_folded() {
        let src = SourceLocation::default();
        let holder = fold(vec![Instruction::new(Op::IDiv, src)
            .with_op1(Value::reg(0, i32_ty()))
            .with_op2(Value::imm_i(1, i32_ty()))
            .with_op3(Value::imm_i(0, i32_ty()))]);
        assert_eq!(holder.code[0].op, Op::IDiv);
    }

    #[test]
    fn float_folds_use_ieee_semantics() {
        let src = SourceLocation::default();
        let f64_ty = TypeId::from_fqn("f64");
        let holder = fold(vec![
            Instruction::new(Op::DDiv, src)
                .with_op1(Value::reg(0, f64_ty))
                .with_op2(Value::imm_f64(1.0, f64_ty))
                .with_op3(Value::imm_f64(0.0, f64_ty)),
            Instruction::new(Op::DMod, src)
                .with_op1(Value::reg(1, f64_ty))
                .with_op2(Value::imm_f64(5.5, f64_ty))
                .with_op3(Value::imm_f64(f64::INFINITY, f64_ty)),
        ]);
        let div = holder.code[0].op2().and_then(Value::imm_value).unwrap();
        assert_eq!(div.as_f64(), Some(f64::INFINITY));
        let rem = holder.code[1].op2().and_then(Value::imm_value).unwrap();
        assert_eq!(rem.as_f64(), Some(5.5));
    }

    #[test]
    fn comparisons_fold_to_bool_words() {
        let src = SourceLocation::default();
        let bool_ty = TypeId::from_fqn("bool");
        let holder = fold(vec![Instruction::new(Op::Lt, src)
            .with_op1(Value::reg(0, bool_ty))
            .with_op2(Value::imm_i(1, i32_ty()))
            .with_op3(Value::imm_i(2, i32_ty()))]);
        assert_eq!(
            holder.code[0].op2().and_then(Value::imm_value).and_then(|i| i.as_u64()),
            Some(1)
        );
    }
}
