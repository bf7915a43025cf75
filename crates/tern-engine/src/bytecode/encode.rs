//! IR → VM instruction encoding.
//!
//! The encoder consumes register-allocated IR (virtual registers already
//! lowered to bank indices, frame layout fixed) and produces the packed
//! instruction stream plus a source map. Frame-addressed operands become
//! frame-relative loads/stores; surplus immediates and address
//! materializations go through the volatile scratch registers; `label`,
//! `stack_free`, and advisory markers emit nothing.

use super::opcode::{NumKind, VmOp, VmRegister, FP_COUNT, GP_COUNT};
use rustc_hash::FxHashMap;
use tern_compiler::ir::{CodeHolder, Immediate, Instruction, Op, Value, ValueKind};
use tern_compiler::regalloc::{AllocationResult, FrameLayout, RegAssignment};
use tern_compiler::FunctionDef;
use tern_ffi::{ModuleId, TypeId, TypeRegistry};
use tern_parser::SourceLocation;
use thiserror::Error;

const INSTR_SHIFT: u32 = 24;
const OP1_SHIFT: u32 = 18;
const OP2_SHIFT: u32 = 12;
const OP3_SHIFT: u32 = 6;
const REG_MASK: u32 = 0x3f;

const FLAG_OP1: u32 = 0b0001;
const FLAG_OP2: u32 = 0b0010;
const FLAG_OP3: u32 = 0b0100;
const FLAG_OP3_FLOAT: u32 = 0b1000;

/// One packed instruction: a 32-bit opcode word plus its immediate word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedInstruction {
    pub word: u32,
    pub imm: u64,
}

impl EncodedInstruction {
    pub fn new(op: VmOp) -> Self {
        Self {
            word: (op.index() as u32) << INSTR_SHIFT,
            imm: 0,
        }
    }

    pub fn with_reg1(mut self, r: VmRegister) -> Self {
        self.word |= ((r.index() as u32) & REG_MASK) << OP1_SHIFT | FLAG_OP1;
        self
    }

    pub fn with_reg2(mut self, r: VmRegister) -> Self {
        self.word |= ((r.index() as u32) & REG_MASK) << OP2_SHIFT | FLAG_OP2;
        self
    }

    pub fn with_reg3(mut self, r: VmRegister) -> Self {
        self.word |= ((r.index() as u32) & REG_MASK) << OP3_SHIFT | FLAG_OP3;
        self
    }

    pub fn with_imm(mut self, imm: u64) -> Self {
        self.imm = imm;
        self
    }

    pub fn with_float_result(mut self) -> Self {
        self.word |= FLAG_OP3_FLOAT;
        self
    }

    pub fn op(&self) -> Option<VmOp> {
        VmOp::from_index((self.word >> INSTR_SHIFT) as u8)
    }

    pub fn reg1(&self) -> VmRegister {
        VmRegister::from_index(((self.word >> OP1_SHIFT) & REG_MASK) as u8).unwrap_or(VmRegister::Zero)
    }

    pub fn reg2(&self) -> VmRegister {
        VmRegister::from_index(((self.word >> OP2_SHIFT) & REG_MASK) as u8).unwrap_or(VmRegister::Zero)
    }

    pub fn reg3(&self) -> VmRegister {
        VmRegister::from_index(((self.word >> OP3_SHIFT) & REG_MASK) as u8).unwrap_or(VmRegister::Zero)
    }

    pub fn has_op1(&self) -> bool {
        self.word & FLAG_OP1 != 0
    }

    pub fn has_op2(&self) -> bool {
        self.word & FLAG_OP2 != 0
    }

    pub fn has_op3(&self) -> bool {
        self.word & FLAG_OP3 != 0
    }

    pub fn float_result(&self) -> bool {
        self.word & FLAG_OP3_FLOAT != 0
    }

    /// Render for the engine's debug log.
    pub fn disassemble(&self) -> String {
        let Some(op) = self.op() else {
            return format!("?? {:08x}", self.word);
        };
        let mut out = op.mnemonic().to_string();
        let mut first = true;
        let mut push = |s: String, out: &mut String, first: &mut bool| {
            if *first {
                out.push(' ');
                *first = false;
            } else {
                out.push_str(", ");
            }
            out.push_str(&s);
        };
        if self.has_op1() {
            push(self.reg1().to_string(), &mut out, &mut first);
        }
        if self.has_op2() {
            push(self.reg2().to_string(), &mut out, &mut first);
        }
        if self.has_op3() {
            push(self.reg3().to_string(), &mut out, &mut first);
        }
        match op {
            VmOp::MovImm
            | VmOp::ParamImm
            | VmOp::Jmp
            | VmOp::Branch
            | VmOp::Call
            | VmOp::Lea
            | VmOp::Cvt
            | VmOp::FrameLd8
            | VmOp::FrameLd8S
            | VmOp::FrameLd16
            | VmOp::FrameLd16S
            | VmOp::FrameLd32
            | VmOp::FrameLd32S
            | VmOp::FrameLd64
            | VmOp::FrameSt8
            | VmOp::FrameSt16
            | VmOp::FrameSt32
            | VmOp::FrameSt64 => {
                push(format!("{:#x}", self.imm), &mut out, &mut first);
            }
            _ if !self.has_op2() || !self.has_op3() => {
                push(format!("{:#x}", self.imm), &mut out, &mut first);
            }
            _ => {}
        }
        out
    }
}

/// The executable image: packed instructions plus address → source mapping.
#[derive(Debug, Default)]
pub struct Program {
    pub code: Vec<EncodedInstruction>,
    pub source_map: Vec<SourceLocation>,
    /// Frame size per entry address, read by the VM on calls.
    pub frames: FxHashMap<u32, u32>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn src_at(&self, addr: usize) -> Option<SourceLocation> {
        self.source_map.get(addr).copied()
    }

    pub fn listing(&self) -> String {
        let mut out = String::new();
        for (addr, instr) in self.code.iter().enumerate() {
            out.push_str(&format!("{addr:5}: {}\n", instr.disassemble()));
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EncodeError {
    #[error("branch to label L{0} with no definition")]
    UndefinedLabel(u32),
    #[error("operand kind not representable at address {0}")]
    BadOperand(usize),
    #[error("module data slot {1} of module {0:08x} is not loaded")]
    UnknownModuleData(u32, u32),
    #[error("function '{0}' exceeds the 8-argument ABI limit")]
    TooManyArguments(String),
}

/// Resolves module data slots to stable host addresses.
pub trait DataResolver {
    fn slot_address(&self, module: ModuleId, slot: u32) -> Option<*const u8>;
}

enum Operand {
    Reg(VmRegister),
    Imm(u64),
    Frame(u32),
}

/// Encodes one allocated function into a [`Program`].
pub struct Encoder<'a> {
    types: &'a TypeRegistry,
    resolver: &'a dyn DataResolver,
}

impl<'a> Encoder<'a> {
    pub fn new(types: &'a TypeRegistry, resolver: &'a dyn DataResolver) -> Self {
        Self { types, resolver }
    }

    fn is_fp(&self, ty: TypeId) -> bool {
        self.types
            .resolve(ty)
            .map(|t| t.meta.is_floating_point)
            .unwrap_or(false)
    }

    fn num_kind(&self, ty: TypeId) -> NumKind {
        let Some(dt) = self.types.resolve(ty) else {
            return NumKind::U64;
        };
        let m = dt.meta;
        if m.is_floating_point {
            return if m.size == 4 { NumKind::F32 } else { NumKind::F64 };
        }
        if !m.is_primitive && !m.is_integral {
            // Pointers and objects travel as raw words
            return NumKind::U64;
        }
        match (m.size, m.is_unsigned) {
            (1, true) => NumKind::U8,
            (1, false) => NumKind::I8,
            (2, true) => NumKind::U16,
            (2, false) => NumKind::I16,
            (4, true) => NumKind::U32,
            (4, false) => NumKind::I32,
            (_, true) => NumKind::U64,
            (_, false) => NumKind::I64,
        }
    }

    fn map_reg(&self, v: &Value) -> VmRegister {
        let id = v.reg_id().expect("operand must be a register");
        if self.is_fp(v.ty) {
            if id < FP_COUNT {
                VmRegister::fp(id)
            } else {
                VmRegister::fscratch(id - FP_COUNT)
            }
        } else if id < GP_COUNT {
            VmRegister::gp(id)
        } else {
            VmRegister::scratch(id - GP_COUNT)
        }
    }

    fn operand(
        &self,
        v: &Value,
        frame: &FrameLayout,
        addr: usize,
    ) -> Result<Operand, EncodeError> {
        Ok(match &v.kind {
            ValueKind::Register(_) => Operand::Reg(self.map_reg(v)),
            ValueKind::Imm(imm) => Operand::Imm(imm.to_word()),
            ValueKind::StackAlloc(a) => {
                let offset = frame
                    .alloc_offsets
                    .get(a)
                    .copied()
                    .ok_or(EncodeError::BadOperand(addr))?;
                Operand::Frame(offset)
            }
            ValueKind::ModuleData { module, slot } => {
                let ptr = self
                    .resolver
                    .slot_address(*module, *slot)
                    .ok_or(EncodeError::UnknownModuleData(module.as_u32(), *slot))?;
                Operand::Imm(ptr as u64)
            }
            ValueKind::Null => Operand::Imm(0),
            ValueKind::Poison => return Err(EncodeError::BadOperand(addr)),
        })
    }

    /// Encode `holder` (plus the function's prologue) into `program`,
    /// returning the entry address.
    pub fn encode_function(
        &self,
        def: &FunctionDef,
        holder: &CodeHolder,
        alloc: &AllocationResult,
        program: &mut Program,
    ) -> Result<u32, EncodeError> {
        let frame = &alloc.frame;
        let base = program.code.len() as u32;
        let mut out: Vec<(EncodedInstruction, SourceLocation)> = Vec::new();
        let mut patches: Vec<(usize, u32)> = Vec::new();
        let mut ir_to_local: Vec<usize> = Vec::with_capacity(holder.code.len());

        self.encode_prologue(def, alloc, &mut out)?;

        for (addr, instr) in holder.code.iter().enumerate() {
            ir_to_local.push(out.len());
            self.encode_instruction(instr, addr, frame, &mut out, &mut patches)?;
        }
        ir_to_local.push(out.len());

        // Patch label targets to absolute addresses
        for (local_idx, label) in patches {
            let ir_addr = *holder
                .labels
                .get(&label)
                .ok_or(EncodeError::UndefinedLabel(label))?;
            let target = base as u64 + ir_to_local[ir_addr] as u64;
            out[local_idx].0.imm = target;
        }

        program.frames.insert(base, frame.frame_size);
        for (instr, src) in out {
            program.code.push(instr);
            program.source_map.push(src);
        }
        Ok(base)
    }

    /// Move incoming arguments from the ABI registers into their allocated
    /// homes. Integer/pointer arguments arrive in `a0..`, floating in
    /// `fa0..`, `this` first.
    fn encode_prologue(
        &self,
        def: &FunctionDef,
        alloc: &AllocationResult,
        out: &mut Vec<(EncodedInstruction, SourceLocation)>,
    ) -> Result<(), EncodeError> {
        let src = def.src;
        let mut gp_idx = 0u32;
        let mut fp_idx = 0u32;

        let mut incoming: Vec<Value> = Vec::new();
        if let Some(this) = def.this_value() {
            incoming.push(this);
        }
        for i in 0..def.args.len() {
            if let Some(arg) = def.arg(i) {
                incoming.push(arg);
            }
        }

        for value in incoming {
            let fp = self.is_fp(value.ty);
            if (fp && fp_idx >= 8) || (!fp && gp_idx >= 8) {
                return Err(EncodeError::TooManyArguments(
                    def.fully_qualified_name.clone(),
                ));
            }
            let from = if fp {
                let r = VmRegister::farg(fp_idx);
                fp_idx += 1;
                r
            } else {
                let r = VmRegister::arg(gp_idx);
                gp_idx += 1;
                r
            };
            // The body was rewritten to physical indices; the original
            // argument vreg's home lives in the allocation result. An
            // argument with no assignment is simply unused.
            let Some(original) = value.reg_id() else { continue };
            match alloc.assignments.get(&original) {
                Some(RegAssignment::Phys(p)) => {
                    let home = if fp {
                        VmRegister::fp(*p)
                    } else {
                        VmRegister::gp(*p)
                    };
                    out.push((
                        EncodedInstruction::new(VmOp::Mov)
                            .with_reg1(home)
                            .with_reg2(from),
                        src,
                    ));
                }
                Some(RegAssignment::Spill(offset)) => {
                    out.push((
                        EncodedInstruction::new(VmOp::FrameSt64)
                            .with_reg1(from)
                            .with_imm(*offset as u64),
                        src,
                    ));
                }
                None => {}
            }
        }
        Ok(())
    }

    fn encode_instruction(
        &self,
        instr: &Instruction,
        addr: usize,
        frame: &FrameLayout,
        out: &mut Vec<(EncodedInstruction, SourceLocation)>,
        patches: &mut Vec<(usize, u32)>,
    ) -> Result<(), EncodeError> {
        let src = instr.src;
        let emit = |e: EncodedInstruction, out: &mut Vec<(EncodedInstruction, SourceLocation)>| {
            out.push((e, src));
        };

        match instr.op {
            Op::Label | Op::StackFree => {}
            Op::MetaIf | Op::MetaWhile | Op::MetaFor | Op::MetaDoWhile => {}

            Op::StackAlloc => {
                // Frames are laid out statically; the address value exists
                // only through its uses, so the alloc itself is a no-op
                // unless the result was lowered to a register.
                if let Some(v) = instr.op1() {
                    if v.is_register() {
                        let offset = v
                            .stack_ref
                            .and_then(|a| frame.alloc_offsets.get(&a))
                            .copied()
                            .unwrap_or(0);
                        emit(
                            EncodedInstruction::new(VmOp::Lea)
                                .with_reg1(self.map_reg(v))
                                .with_imm(offset as u64),
                            out,
                        );
                    }
                }
            }

            Op::Load => {
                let dst = instr.op1().ok_or(EncodeError::BadOperand(addr))?;
                let base = instr.op2().ok_or(EncodeError::BadOperand(addr))?;
                let off = instr
                    .op3()
                    .and_then(Value::imm_value)
                    .and_then(|i| i.as_u64())
                    .unwrap_or(0);
                let kind = self.num_kind(dst.ty);
                let dst_reg = self.map_reg(dst);
                match self.operand(base, frame, addr)? {
                    Operand::Reg(b) => emit(
                        EncodedInstruction::new(load_op(kind, false))
                            .with_reg1(dst_reg)
                            .with_reg2(b)
                            .with_imm(off),
                        out,
                    ),
                    Operand::Frame(frame_off) => emit(
                        EncodedInstruction::new(load_op(kind, true))
                            .with_reg1(dst_reg)
                            .with_imm(frame_off as u64 + off),
                        out,
                    ),
                    Operand::Imm(address) => {
                        emit(
                            EncodedInstruction::new(VmOp::MovImm)
                                .with_reg1(VmRegister::V0)
                                .with_imm(address),
                            out,
                        );
                        emit(
                            EncodedInstruction::new(load_op(kind, false))
                                .with_reg1(dst_reg)
                                .with_reg2(VmRegister::V0)
                                .with_imm(off),
                            out,
                        );
                    }
                }
            }

            Op::Store => {
                let value = instr.op1().ok_or(EncodeError::BadOperand(addr))?;
                let base = instr.op2().ok_or(EncodeError::BadOperand(addr))?;
                let off = instr
                    .op3()
                    .and_then(Value::imm_value)
                    .and_then(|i| i.as_u64())
                    .unwrap_or(0);
                let kind = self.num_kind(value.ty);
                let src_reg = match self.operand(value, frame, addr)? {
                    Operand::Reg(r) => r,
                    Operand::Imm(bits) => {
                        let scratch = if kind.is_float() {
                            VmRegister::Vf0
                        } else {
                            VmRegister::V0
                        };
                        emit(
                            EncodedInstruction::new(VmOp::MovImm)
                                .with_reg1(scratch)
                                .with_imm(bits),
                            out,
                        );
                        scratch
                    }
                    Operand::Frame(frame_off) => {
                        emit(
                            EncodedInstruction::new(VmOp::Lea)
                                .with_reg1(VmRegister::V0)
                                .with_imm(frame_off as u64),
                            out,
                        );
                        VmRegister::V0
                    }
                };
                match self.operand(base, frame, addr)? {
                    Operand::Reg(b) => emit(
                        EncodedInstruction::new(store_op(kind))
                            .with_reg1(src_reg)
                            .with_reg2(b)
                            .with_imm(off),
                        out,
                    ),
                    Operand::Frame(frame_off) => emit(
                        EncodedInstruction::new(frame_store_op(kind))
                            .with_reg1(src_reg)
                            .with_imm(frame_off as u64 + off),
                        out,
                    ),
                    Operand::Imm(address) => {
                        // V3 avoids the spill scratches a loaded value may
                        // occupy
                        emit(
                            EncodedInstruction::new(VmOp::MovImm)
                                .with_reg1(VmRegister::V3)
                                .with_imm(address),
                            out,
                        );
                        emit(
                            EncodedInstruction::new(store_op(kind))
                                .with_reg1(src_reg)
                                .with_reg2(VmRegister::V3)
                                .with_imm(off),
                            out,
                        );
                    }
                }
            }

            Op::ModuleData => {
                let dst = instr.op1().ok_or(EncodeError::BadOperand(addr))?;
                let module = instr
                    .op2()
                    .and_then(Value::imm_value)
                    .and_then(|i| i.as_u64())
                    .unwrap_or(0) as u32;
                let slot = instr
                    .op3()
                    .and_then(Value::imm_value)
                    .and_then(|i| i.as_u64())
                    .unwrap_or(0) as u32;
                let ptr = self
                    .resolver
                    .slot_address(ModuleId(module), slot)
                    .ok_or(EncodeError::UnknownModuleData(module, slot))?;
                emit(
                    EncodedInstruction::new(VmOp::MovImm)
                        .with_reg1(self.map_reg(dst))
                        .with_imm(ptr as u64),
                    out,
                );
            }

            op if op.is_arithmetic()
                || op.is_comparison()
                || matches!(
                    op,
                    Op::BAnd | Op::BOr | Op::BXor | Op::Sl | Op::Sr | Op::LAnd | Op::LOr | Op::Neg
                ) =>
            {
                self.encode_compute(instr, addr, frame, out)?;
            }

            Op::Cvt => self.encode_cvt(instr, addr, frame, out)?,

            Op::Jump => {
                let label = instr.primary_label().ok_or(EncodeError::BadOperand(addr))?;
                patches.push((out.len(), label));
                emit(EncodedInstruction::new(VmOp::Jmp), out);
            }

            Op::Branch => {
                let cond = instr.op1().ok_or(EncodeError::BadOperand(addr))?;
                let label = instr.primary_label().ok_or(EncodeError::BadOperand(addr))?;
                let cond_reg = match self.operand(cond, frame, addr)? {
                    Operand::Reg(r) => r,
                    Operand::Imm(bits) => {
                        emit(
                            EncodedInstruction::new(VmOp::MovImm)
                                .with_reg1(VmRegister::V0)
                                .with_imm(bits),
                            out,
                        );
                        VmRegister::V0
                    }
                    Operand::Frame(_) => return Err(EncodeError::BadOperand(addr)),
                };
                patches.push((out.len(), label));
                emit(
                    EncodedInstruction::new(VmOp::Branch).with_reg1(cond_reg),
                    out,
                );
            }

            Op::Param => {
                let v = instr.op1().ok_or(EncodeError::BadOperand(addr))?;
                match self.operand(v, frame, addr)? {
                    Operand::Reg(r) => {
                        emit(EncodedInstruction::new(VmOp::Param).with_reg1(r), out)
                    }
                    Operand::Imm(bits) => {
                        emit(EncodedInstruction::new(VmOp::ParamImm).with_imm(bits), out)
                    }
                    Operand::Frame(offset) => {
                        emit(
                            EncodedInstruction::new(VmOp::Lea)
                                .with_reg1(VmRegister::V0)
                                .with_imm(offset as u64),
                            out,
                        );
                        emit(
                            EncodedInstruction::new(VmOp::Param).with_reg1(VmRegister::V0),
                            out,
                        );
                    }
                }
            }

            Op::Call => {
                let callee = instr.op1().ok_or(EncodeError::BadOperand(addr))?;
                let result = instr.op2();
                match &callee.kind {
                    ValueKind::Imm(Immediate::Func(fid)) => {
                        let mut e = EncodedInstruction::new(VmOp::Call).with_imm(fid.as_u32() as u64);
                        if let Some(r) = result {
                            e = e.with_reg1(self.map_reg(r));
                            if self.is_fp(r.ty) {
                                e = e.with_float_result();
                            }
                        }
                        emit(e, out);
                    }
                    ValueKind::Register(_) => {
                        let mut e = EncodedInstruction::new(VmOp::CallR)
                            .with_reg2(self.map_reg(callee));
                        if let Some(r) = result {
                            e = e.with_reg1(self.map_reg(r));
                            if self.is_fp(r.ty) {
                                e = e.with_float_result();
                            }
                        }
                        emit(e, out);
                    }
                    _ => return Err(EncodeError::BadOperand(addr)),
                }
            }

            Op::Ret => {
                if let Some(v) = instr.op1() {
                    let fp = self.is_fp(v.ty);
                    let home = if fp { VmRegister::Vf0 } else { VmRegister::V0 };
                    match self.operand(v, frame, addr)? {
                        Operand::Reg(r) => emit(
                            EncodedInstruction::new(VmOp::Mov).with_reg1(home).with_reg2(r),
                            out,
                        ),
                        Operand::Imm(bits) => emit(
                            EncodedInstruction::new(VmOp::MovImm)
                                .with_reg1(home)
                                .with_imm(bits),
                            out,
                        ),
                        Operand::Frame(offset) => emit(
                            EncodedInstruction::new(VmOp::Lea)
                                .with_reg1(home)
                                .with_imm(offset as u64),
                            out,
                        ),
                    }
                }
                emit(EncodedInstruction::new(VmOp::Ret), out);
            }

            Op::Term => emit(EncodedInstruction::new(VmOp::Term), out),

            _ => return Err(EncodeError::BadOperand(addr)),
        }
        Ok(())
    }

    /// Arithmetic, bitwise, logical, comparison, negation.
    fn encode_compute(
        &self,
        instr: &Instruction,
        addr: usize,
        frame: &FrameLayout,
        out: &mut Vec<(EncodedInstruction, SourceLocation)>,
    ) -> Result<(), EncodeError> {
        let src = instr.src;
        let dst = instr.op1().ok_or(EncodeError::BadOperand(addr))?;
        let a = instr.op2().ok_or(EncodeError::BadOperand(addr))?;
        let b = instr.op3();

        let operand_kind = self.num_kind(a.ty);
        let vm_op = compute_op(instr.op, operand_kind).ok_or(EncodeError::BadOperand(addr))?;

        let mut e = EncodedInstruction::new(vm_op).with_reg1(self.map_reg(dst));
        let mut imm_used = false;

        let a_res = self.operand(a, frame, addr)?;
        let a_slot = match a_res {
            Operand::Reg(r) => Some(r),
            Operand::Imm(bits) => {
                // Keep the immediate slot for op3 when both inputs are
                // immediates
                if b.map(|v| v.is_imm()).unwrap_or(false) {
                    let scratch = if operand_kind.is_float() {
                        VmRegister::Vf0
                    } else {
                        VmRegister::V0
                    };
                    out.push((
                        EncodedInstruction::new(VmOp::MovImm)
                            .with_reg1(scratch)
                            .with_imm(bits),
                        src,
                    ));
                    Some(scratch)
                } else {
                    e = e.with_imm(bits);
                    imm_used = true;
                    None
                }
            }
            Operand::Frame(offset) => {
                out.push((
                    EncodedInstruction::new(VmOp::Lea)
                        .with_reg1(VmRegister::V0)
                        .with_imm(offset as u64),
                    src,
                ));
                Some(VmRegister::V0)
            }
        };
        if let Some(r) = a_slot {
            e = e.with_reg2(r);
        }

        if let Some(b) = b {
            match self.operand(b, frame, addr)? {
                Operand::Reg(r) => e = e.with_reg3(r),
                Operand::Imm(bits) => {
                    debug_assert!(!imm_used, "two immediates must not survive to op3");
                    e = e.with_imm(bits);
                }
                Operand::Frame(offset) => {
                    out.push((
                        EncodedInstruction::new(VmOp::Lea)
                            .with_reg1(VmRegister::V3)
                            .with_imm(offset as u64),
                        src,
                    ));
                    e = e.with_reg3(VmRegister::V3);
                }
            }
        }

        out.push((e, src));
        Ok(())
    }

    fn encode_cvt(
        &self,
        instr: &Instruction,
        addr: usize,
        frame: &FrameLayout,
        out: &mut Vec<(EncodedInstruction, SourceLocation)>,
    ) -> Result<(), EncodeError> {
        let src = instr.src;
        let dst = instr.op1().ok_or(EncodeError::BadOperand(addr))?;
        let from = instr.op2().ok_or(EncodeError::BadOperand(addr))?;
        let to_kind = self.num_kind(dst.ty);
        let from_kind = self.num_kind(from.ty);
        let dst_reg = self.map_reg(dst);

        match self.operand(from, frame, addr)? {
            Operand::Imm(bits) => {
                // Converting a constant is an encode-time computation
                let converted = convert_bits(bits, from_kind, to_kind);
                out.push((
                    EncodedInstruction::new(VmOp::MovImm)
                        .with_reg1(dst_reg)
                        .with_imm(converted),
                    src,
                ));
            }
            Operand::Reg(r) => {
                if from_kind == to_kind {
                    out.push((
                        EncodedInstruction::new(VmOp::Mov).with_reg1(dst_reg).with_reg2(r),
                        src,
                    ));
                } else {
                    let packed = (from_kind as u64) | ((to_kind as u64) << 8);
                    out.push((
                        EncodedInstruction::new(VmOp::Cvt)
                            .with_reg1(dst_reg)
                            .with_reg2(r)
                            .with_imm(packed),
                        src,
                    ));
                }
            }
            Operand::Frame(offset) => {
                out.push((
                    EncodedInstruction::new(VmOp::Lea)
                        .with_reg1(dst_reg)
                        .with_imm(offset as u64),
                    src,
                ));
            }
        }
        Ok(())
    }
}

fn load_op(kind: NumKind, frame_relative: bool) -> VmOp {
    use NumKind::*;
    match (kind, frame_relative) {
        (I8, false) => VmOp::Ld8S,
        (U8, false) => VmOp::Ld8,
        (I16, false) => VmOp::Ld16S,
        (U16, false) => VmOp::Ld16,
        (I32, false) => VmOp::Ld32S,
        (U32 | F32, false) => VmOp::Ld32,
        (I64 | U64 | F64, false) => VmOp::Ld64,
        (I8, true) => VmOp::FrameLd8S,
        (U8, true) => VmOp::FrameLd8,
        (I16, true) => VmOp::FrameLd16S,
        (U16, true) => VmOp::FrameLd16,
        (I32, true) => VmOp::FrameLd32S,
        (U32 | F32, true) => VmOp::FrameLd32,
        (I64 | U64 | F64, true) => VmOp::FrameLd64,
    }
}

fn store_op(kind: NumKind) -> VmOp {
    use NumKind::*;
    match kind {
        I8 | U8 => VmOp::St8,
        I16 | U16 => VmOp::St16,
        I32 | U32 | F32 => VmOp::St32,
        I64 | U64 | F64 => VmOp::St64,
    }
}

fn frame_store_op(kind: NumKind) -> VmOp {
    use NumKind::*;
    match kind {
        I8 | U8 => VmOp::FrameSt8,
        I16 | U16 => VmOp::FrameSt16,
        I32 | U32 | F32 => VmOp::FrameSt32,
        I64 | U64 | F64 => VmOp::FrameSt64,
    }
}

fn compute_op(op: Op, kind: NumKind) -> Option<VmOp> {
    use VmOp::*;
    Some(match op {
        Op::IAdd => IAdd,
        Op::ISub => ISub,
        Op::IMul => IMul,
        Op::IDiv => IDiv,
        Op::IMod => IMod,
        Op::UAdd => UAdd,
        Op::USub => USub,
        Op::UMul => UMul,
        Op::UDiv => UDiv,
        Op::UMod => UMod,
        Op::FAdd => FAdd,
        Op::FSub => FSub,
        Op::FMul => FMul,
        Op::FDiv => FDiv,
        Op::FMod => FMod,
        Op::DAdd => DAdd,
        Op::DSub => DSub,
        Op::DMul => DMul,
        Op::DDiv => DDiv,
        Op::DMod => DMod,
        Op::BAnd => BAnd,
        Op::BOr => BOr,
        Op::BXor => BXor,
        Op::Sl => Sl,
        Op::Sr => Sr,
        Op::LAnd => LAnd,
        Op::LOr => LOr,
        Op::Neg => match kind {
            NumKind::F32 => FNeg,
            NumKind::F64 => DNeg,
            _ => INeg,
        },
        Op::Lt => family_cmp(kind, ILt, ULt, FLt, DLt),
        Op::Gt => family_cmp(kind, IGt, UGt, FGt, DGt),
        Op::Lte => family_cmp(kind, ILte, ULte, FLte, DLte),
        Op::Gte => family_cmp(kind, IGte, UGte, FGte, DGte),
        Op::Cmp => family_cmp(kind, ICmp, ICmp, FCmp, DCmp),
        Op::NCmp => family_cmp(kind, INCmp, INCmp, FNCmp, DNCmp),
        _ => return None,
    })
}

fn family_cmp(kind: NumKind, signed: VmOp, unsigned: VmOp, f32_op: VmOp, f64_op: VmOp) -> VmOp {
    match kind {
        NumKind::F32 => f32_op,
        NumKind::F64 => f64_op,
        k if k.is_signed() => signed,
        _ => unsigned,
    }
}

/// Convert raw bits between numeric kinds, matching the VM's runtime `cvt`.
pub fn convert_bits(bits: u64, from: NumKind, to: NumKind) -> u64 {
    use NumKind::*;

    // Widen the source to a common representation first
    let as_i64: i64 = match from {
        I8 => bits as u8 as i8 as i64,
        U8 => bits as u8 as i64,
        I16 => bits as u16 as i16 as i64,
        U16 => bits as u16 as i64,
        I32 => bits as u32 as i32 as i64,
        U32 => bits as u32 as i64,
        I64 | U64 => bits as i64,
        F32 => f32::from_bits(bits as u32) as i64,
        F64 => f64::from_bits(bits) as i64,
    };
    let as_f64: f64 = match from {
        F32 => f32::from_bits(bits as u32) as f64,
        F64 => f64::from_bits(bits),
        U64 => bits as f64,
        _ => as_i64 as f64,
    };

    match to {
        I8 => as_i64 as i8 as u8 as u64,
        U8 => as_i64 as u8 as u64,
        I16 => as_i64 as i16 as u16 as u64,
        U16 => as_i64 as u16 as u64,
        I32 => as_i64 as i32 as u32 as u64,
        U32 => as_i64 as u32 as u64,
        I64 => as_i64 as u64,
        U64 => {
            if from.is_float() {
                as_f64 as u64
            } else {
                bits
            }
        }
        F32 => {
            let v = if from.is_float() { as_f64 as f32 } else { as_i64 as f32 };
            v.to_bits() as u64
        }
        F64 => {
            let v = if from.is_float() { as_f64 } else { as_i64 as f64 };
            v.to_bits()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_packing_round_trips() {
        let e = EncodedInstruction::new(VmOp::IAdd)
            .with_reg1(VmRegister::S2)
            .with_reg2(VmRegister::S0)
            .with_reg3(VmRegister::S1);
        assert_eq!(e.op(), Some(VmOp::IAdd));
        assert_eq!(e.reg1(), VmRegister::S2);
        assert_eq!(e.reg2(), VmRegister::S0);
        assert_eq!(e.reg3(), VmRegister::S1);
        assert!(e.has_op1() && e.has_op2() && e.has_op3());
        assert!(!e.float_result());
    }

    #[test]
    fn immediate_slot_is_flagged_by_absence() {
        let e = EncodedInstruction::new(VmOp::IAdd)
            .with_reg1(VmRegister::S0)
            .with_reg2(VmRegister::S1)
            .with_imm(42);
        assert!(e.has_op1() && e.has_op2());
        assert!(!e.has_op3());
        assert_eq!(e.imm, 42);
    }

    #[test]
    fn disassembly_is_readable() {
        let e = EncodedInstruction::new(VmOp::IAdd)
            .with_reg1(VmRegister::S2)
            .with_reg2(VmRegister::S0)
            .with_imm(4);
        assert_eq!(e.disassemble(), "iadd $s2, $s0, 0x4");

        let call = EncodedInstruction::new(VmOp::Call)
            .with_reg1(VmRegister::S0)
            .with_imm(0x1234);
        assert_eq!(call.disassemble(), "call $s0, 0x1234");
    }

    #[test]
    fn bit_conversions_match_casts() {
        assert_eq!(
            convert_bits((-5i32 as u32) as u64, NumKind::I32, NumKind::I64) as i64,
            -5
        );
        assert_eq!(
            convert_bits(3.75f64.to_bits(), NumKind::F64, NumKind::I32) as u32 as i32,
            3
        );
        let f = convert_bits(7u64, NumKind::U64, NumKind::F32);
        assert_eq!(f32::from_bits(f as u32), 7.0);
        assert_eq!(
            convert_bits(300u64, NumKind::U32, NumKind::U8),
            300u32 as u64 % 256
        );
    }
}
