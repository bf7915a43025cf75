//! The register-file VM.
//!
//! Single-threaded execution over 64 64-bit registers and a fixed-capacity
//! byte stack. Script frames are laid out statically by the register
//! allocator; the VM allocates one frame per call, saves and restores the
//! allocatable banks around calls, and bridges to host functions through the
//! FFI call framing. Runtime failures set the exception bit on the current
//! execution context and unwind to the nearest host boundary.

use crate::bytecode::{NumKind, Program, VmOp, VmRegister, REGISTER_COUNT};
use tern_ffi::{
    classify, ArgClass, CallContext, ExecutionContext, FunctionId, FunctionRegistry, TypeRegistry,
};
use tern_parser::SourceLocation;
use thiserror::Error;

/// Sentinel return address that halts the dispatch loop.
const HALT: usize = usize::MAX;

/// Default script stack capacity in bytes.
const DEFAULT_STACK_SIZE: usize = 1 << 20;

/// Runtime failures. Each sets the exception bit before unwinding.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VmError {
    #[error("script exception: {0}")]
    ScriptException(String),
    #[error("stack overflow")]
    StackOverflow,
    #[error("invalid instruction at {0}")]
    InvalidInstruction(usize),
    #[error("call to unknown function {0:08x}")]
    UnknownFunction(u32),
    #[error("function has no executable body")]
    NoBody,
    #[error("division by zero")]
    DivideByZero,
    #[error("null pointer access")]
    NullPointer,
    #[error("execution terminated")]
    Terminated,
    #[error("script execution is disabled")]
    ExecutionDisabled,
}

impl VmError {
    /// Stable diagnostic code (400-range).
    pub fn code(&self) -> u32 {
        match self {
            VmError::ScriptException(_) => 400,
            VmError::StackOverflow => 401,
            VmError::InvalidInstruction(_) => 402,
            VmError::UnknownFunction(_) => 403,
            VmError::NoBody => 404,
            VmError::DivideByZero => 405,
            VmError::NullPointer => 406,
            VmError::Terminated => 407,
            VmError::ExecutionDisabled => 408,
        }
    }
}

struct Frame {
    return_ip: usize,
    caller_frame_base: u64,
    sp_restore: usize,
    saved: [u64; 32],
    /// Where the caller wants the return value, and whether it is floating.
    result_dst: Option<(VmRegister, bool)>,
}

/// One VM execution state. Multiple may exist per thread, stacked through
/// the per-thread execution contexts.
pub struct Vm {
    regs: [u64; REGISTER_COUNT],
    stack: Box<[u8]>,
    sp: usize,
    frame_base: u64,
    frames: Vec<Frame>,
    params: Vec<u64>,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_stack_size(DEFAULT_STACK_SIZE)
    }

    pub fn with_stack_size(size: usize) -> Self {
        Self {
            regs: [0; REGISTER_COUNT],
            stack: vec![0u8; size].into_boxed_slice(),
            sp: 0,
            frame_base: 0,
            frames: Vec::new(),
            params: Vec::new(),
        }
    }

    #[inline]
    fn reg(&self, r: VmRegister) -> u64 {
        self.regs[r.index() as usize]
    }

    #[inline]
    fn set_reg(&mut self, r: VmRegister, v: u64) {
        if r != VmRegister::Zero {
            self.regs[r.index() as usize] = v;
        }
    }

    /// Raw register file snapshot, for determinism tests and debugging.
    pub fn registers(&self) -> &[u64; REGISTER_COUNT] {
        &self.regs
    }

    /// Call a function by id: host functions are invoked directly through
    /// their wrapper, script functions run in the dispatch loop. `args` are
    /// raw 64-bit words in declaration order (`this` first for methods).
    /// Returns the raw return word (zero for void).
    pub fn call_function(
        &mut self,
        program: &Program,
        types: &TypeRegistry,
        funcs: &FunctionRegistry,
        fid: FunctionId,
        args: &[u64],
    ) -> Result<u64, VmError> {
        let func = funcs.get(fid).ok_or(VmError::UnknownFunction(fid.as_u32()))?;

        if func.is_host() {
            self.params.clear();
            self.params.extend_from_slice(args);
            self.invoke_host(funcs, fid, SourceLocation::default())?;
            return Ok(self.reg(VmRegister::V0));
        }

        let entry = func.entry.ok_or(VmError::NoBody)?;
        let fp_return = func
            .signature
            .return_type
            .and_then(|t| types.resolve(t))
            .map(|t| t.meta.is_floating_point)
            .unwrap_or(false);

        self.params.clear();
        self.params.extend_from_slice(args);
        self.enter_script(program, types, funcs, fid, entry, HALT, None)?;
        self.run(program, types, funcs)?;

        Ok(if fp_return {
            self.reg(VmRegister::Vf0)
        } else {
            self.reg(VmRegister::V0)
        })
    }

    /// Push a frame and transfer control to a script function's entry.
    #[allow(clippy::too_many_arguments)]
    fn enter_script(
        &mut self,
        program: &Program,
        types: &TypeRegistry,
        funcs: &FunctionRegistry,
        fid: FunctionId,
        entry: u32,
        return_ip: usize,
        result_dst: Option<(VmRegister, bool)>,
    ) -> Result<(), VmError> {
        let func = funcs.get(fid).ok_or(VmError::UnknownFunction(fid.as_u32()))?;
        let frame_size = program.frames.get(&entry).copied().unwrap_or(0) as usize;

        // Marshal staged arguments into the ABI registers by class
        let mut gp_idx = 0u32;
        let mut fp_idx = 0u32;
        let mut staged = 0usize;
        for arg in &func.signature.args {
            if arg.arg_type == tern_ffi::ArgType::ContextPtr {
                continue;
            }
            let word = self
                .params
                .get(staged)
                .copied()
                .ok_or(VmError::InvalidInstruction(entry as usize))?;
            staged += 1;
            let class = types
                .resolve(arg.ty)
                .map(|t| classify(&t.meta))
                .unwrap_or(ArgClass::Pointer);
            let is_float = class == ArgClass::Float && arg.arg_type == tern_ffi::ArgType::Value;
            if (is_float && fp_idx >= 8) || (!is_float && gp_idx >= 8) {
                return Err(self.raise(
                    VmError::InvalidInstruction(entry as usize),
                    SourceLocation::default(),
                ));
            }
            if is_float {
                self.set_reg(VmRegister::farg(fp_idx), word);
                fp_idx += 1;
            } else {
                self.set_reg(VmRegister::arg(gp_idx), word);
                gp_idx += 1;
            }
        }
        self.params.clear();

        // Save the allocatable banks; the callee owns them until return
        let mut saved = [0u64; 32];
        for i in 0..16 {
            saved[i] = self.reg(VmRegister::gp(i as u32));
            saved[16 + i] = self.reg(VmRegister::fp(i as u32));
        }

        let aligned_sp = (self.sp + 7) & !7;
        if aligned_sp + frame_size > self.stack.len() {
            return Err(self.raise(VmError::StackOverflow, SourceLocation::default()));
        }
        self.frames.push(Frame {
            return_ip,
            caller_frame_base: self.frame_base,
            sp_restore: self.sp,
            saved,
            result_dst,
        });
        self.frame_base = unsafe { self.stack.as_ptr().add(aligned_sp) } as u64;
        self.sp = aligned_sp + frame_size;
        self.set_reg(VmRegister::Sp, self.frame_base + frame_size as u64);
        self.set_reg(VmRegister::Ra, return_ip as u64);
        self.set_reg(VmRegister::Ip, entry as u64);
        Ok(())
    }

    fn leave_script(&mut self) -> usize {
        let frame = self.frames.pop().expect("ret without frame");
        for i in 0..16 {
            self.set_reg(VmRegister::gp(i as u32), frame.saved[i]);
            self.set_reg(VmRegister::fp(i as u32), frame.saved[16 + i]);
        }
        self.sp = frame.sp_restore;
        self.frame_base = frame.caller_frame_base;
        // v0/vf0 are volatile, untouched by the bank restore
        if let Some((dst, fp)) = frame.result_dst {
            let ret = if fp {
                self.reg(VmRegister::Vf0)
            } else {
                self.reg(VmRegister::V0)
            };
            self.set_reg(dst, ret);
        }
        frame.return_ip
    }

    /// Record the failure on the current execution context and return it for
    /// unwinding.
    fn raise(&mut self, err: VmError, src: SourceLocation) -> VmError {
        tern_ffi::raise_exception(err.to_string(), src);
        err
    }

    /// The dispatch loop. Runs until the sentinel frame returns.
    fn run(
        &mut self,
        program: &Program,
        types: &TypeRegistry,
        funcs: &FunctionRegistry,
    ) -> Result<(), VmError> {
        let mut ip = self.reg(VmRegister::Ip) as usize;

        loop {
            let Some(instr) = program.code.get(ip).copied() else {
                return Err(self.raise(VmError::InvalidInstruction(ip), SourceLocation::default()));
            };
            let src = program.src_at(ip).unwrap_or_default();
            let Some(op) = instr.op() else {
                return Err(self.raise(VmError::InvalidInstruction(ip), src));
            };

            macro_rules! src2 {
                () => {
                    if instr.has_op2() {
                        self.reg(instr.reg2())
                    } else {
                        instr.imm
                    }
                };
            }
            macro_rules! src3 {
                () => {
                    if instr.has_op3() {
                        self.reg(instr.reg3())
                    } else {
                        instr.imm
                    }
                };
            }
            macro_rules! binop {
                ($f:expr) => {{
                    let a = src2!();
                    let b = src3!();
                    let r = $f(a, b);
                    self.set_reg(instr.reg1(), r);
                }};
            }
            macro_rules! checked_div {
                ($f:expr) => {{
                    let a = src2!();
                    let b = src3!();
                    if b == 0 {
                        return Err(self.raise(VmError::DivideByZero, src));
                    }
                    let r = $f(a, b);
                    self.set_reg(instr.reg1(), r);
                }};
            }

            match op {
                VmOp::Nop => {}
                VmOp::Mov => {
                    let v = self.reg(instr.reg2());
                    self.set_reg(instr.reg1(), v);
                }
                VmOp::MovImm => self.set_reg(instr.reg1(), instr.imm),
                VmOp::Cvt => {
                    let from = NumKind::from_index((instr.imm & 0xff) as u8)
                        .ok_or(VmError::InvalidInstruction(ip))?;
                    let to = NumKind::from_index(((instr.imm >> 8) & 0xff) as u8)
                        .ok_or(VmError::InvalidInstruction(ip))?;
                    let v = crate::bytecode::convert_bits(self.reg(instr.reg2()), from, to);
                    self.set_reg(instr.reg1(), v);
                }

                VmOp::Ld8 | VmOp::Ld8S | VmOp::Ld16 | VmOp::Ld16S | VmOp::Ld32 | VmOp::Ld32S
                | VmOp::Ld64 => {
                    let base = self.reg(instr.reg2());
                    let addr = base.wrapping_add(instr.imm);
                    if base == 0 {
                        return Err(self.raise(VmError::NullPointer, src));
                    }
                    let v = unsafe { load_sized(op, addr as *const u8) };
                    self.set_reg(instr.reg1(), v);
                }
                VmOp::St8 | VmOp::St16 | VmOp::St32 | VmOp::St64 => {
                    let base = self.reg(instr.reg2());
                    let addr = base.wrapping_add(instr.imm);
                    if base == 0 {
                        return Err(self.raise(VmError::NullPointer, src));
                    }
                    let v = self.reg(instr.reg1());
                    unsafe { store_sized(op, addr as *mut u8, v) };
                }

                VmOp::FrameLd8 | VmOp::FrameLd8S | VmOp::FrameLd16 | VmOp::FrameLd16S
                | VmOp::FrameLd32 | VmOp::FrameLd32S | VmOp::FrameLd64 => {
                    let addr = self.frame_base.wrapping_add(instr.imm);
                    let v = unsafe { load_sized(frame_to_plain(op), addr as *const u8) };
                    self.set_reg(instr.reg1(), v);
                }
                VmOp::FrameSt8 | VmOp::FrameSt16 | VmOp::FrameSt32 | VmOp::FrameSt64 => {
                    let addr = self.frame_base.wrapping_add(instr.imm);
                    let v = self.reg(instr.reg1());
                    unsafe { store_sized(frame_to_plain(op), addr as *mut u8, v) };
                }
                VmOp::Lea => {
                    let addr = self.frame_base.wrapping_add(instr.imm);
                    self.set_reg(instr.reg1(), addr);
                }

                VmOp::IAdd => binop!(|a: u64, b: u64| (a as i64).wrapping_add(b as i64) as u64),
                VmOp::ISub => binop!(|a: u64, b: u64| (a as i64).wrapping_sub(b as i64) as u64),
                VmOp::IMul => binop!(|a: u64, b: u64| (a as i64).wrapping_mul(b as i64) as u64),
                VmOp::IDiv => checked_div!(|a: u64, b: u64| (a as i64).wrapping_div(b as i64) as u64),
                VmOp::IMod => checked_div!(|a: u64, b: u64| (a as i64).wrapping_rem(b as i64) as u64),
                VmOp::INeg => {
                    let v = src2!();
                    self.set_reg(instr.reg1(), (v as i64).wrapping_neg() as u64);
                }
                VmOp::UAdd => binop!(|a: u64, b: u64| a.wrapping_add(b)),
                VmOp::USub => binop!(|a: u64, b: u64| a.wrapping_sub(b)),
                VmOp::UMul => binop!(|a: u64, b: u64| a.wrapping_mul(b)),
                VmOp::UDiv => checked_div!(|a: u64, b: u64| a / b),
                VmOp::UMod => checked_div!(|a: u64, b: u64| a % b),

                VmOp::FAdd => binop!(|a, b| f32_op(a, b, |x, y| x + y)),
                VmOp::FSub => binop!(|a, b| f32_op(a, b, |x, y| x - y)),
                VmOp::FMul => binop!(|a, b| f32_op(a, b, |x, y| x * y)),
                VmOp::FDiv => binop!(|a, b| f32_op(a, b, |x, y| x / y)),
                VmOp::FMod => binop!(|a, b| f32_op(a, b, |x, y| x % y)),
                VmOp::FNeg => {
                    let v = src2!();
                    self.set_reg(instr.reg1(), (-f32::from_bits(v as u32)).to_bits() as u64);
                }
                VmOp::DAdd => binop!(|a, b| f64_op(a, b, |x, y| x + y)),
                VmOp::DSub => binop!(|a, b| f64_op(a, b, |x, y| x - y)),
                VmOp::DMul => binop!(|a, b| f64_op(a, b, |x, y| x * y)),
                VmOp::DDiv => binop!(|a, b| f64_op(a, b, |x, y| x / y)),
                VmOp::DMod => binop!(|a, b| f64_op(a, b, |x, y| x % y)),
                VmOp::DNeg => {
                    let v = src2!();
                    self.set_reg(instr.reg1(), (-f64::from_bits(v)).to_bits());
                }

                VmOp::BAnd => binop!(|a, b| a & b),
                VmOp::BOr => binop!(|a, b| a | b),
                VmOp::BXor => binop!(|a, b| a ^ b),
                VmOp::Sl => binop!(|a: u64, b: u64| a.wrapping_shl(b as u32)),
                VmOp::Sr => binop!(|a: u64, b: u64| a.wrapping_shr(b as u32)),
                VmOp::LAnd => binop!(|a, b| ((a != 0) && (b != 0)) as u64),
                VmOp::LOr => binop!(|a, b| ((a != 0) || (b != 0)) as u64),

                VmOp::ILt => binop!(|a: u64, b: u64| ((a as i64) < (b as i64)) as u64),
                VmOp::IGt => binop!(|a: u64, b: u64| ((a as i64) > (b as i64)) as u64),
                VmOp::ILte => binop!(|a: u64, b: u64| ((a as i64) <= (b as i64)) as u64),
                VmOp::IGte => binop!(|a: u64, b: u64| ((a as i64) >= (b as i64)) as u64),
                VmOp::ICmp => binop!(|a, b| (a == b) as u64),
                VmOp::INCmp => binop!(|a, b| (a != b) as u64),
                VmOp::ULt => binop!(|a, b| (a < b) as u64),
                VmOp::UGt => binop!(|a, b| (a > b) as u64),
                VmOp::ULte => binop!(|a, b| (a <= b) as u64),
                VmOp::UGte => binop!(|a, b| (a >= b) as u64),
                VmOp::FLt => binop!(|a, b| f32_cmp(a, b, |x, y| x < y)),
                VmOp::FGt => binop!(|a, b| f32_cmp(a, b, |x, y| x > y)),
                VmOp::FLte => binop!(|a, b| f32_cmp(a, b, |x, y| x <= y)),
                VmOp::FGte => binop!(|a, b| f32_cmp(a, b, |x, y| x >= y)),
                VmOp::FCmp => binop!(|a, b| f32_cmp(a, b, |x, y| x == y)),
                VmOp::FNCmp => binop!(|a, b| f32_cmp(a, b, |x, y| x != y)),
                VmOp::DLt => binop!(|a, b| f64_cmp(a, b, |x, y| x < y)),
                VmOp::DGt => binop!(|a, b| f64_cmp(a, b, |x, y| x > y)),
                VmOp::DLte => binop!(|a, b| f64_cmp(a, b, |x, y| x <= y)),
                VmOp::DGte => binop!(|a, b| f64_cmp(a, b, |x, y| x >= y)),
                VmOp::DCmp => binop!(|a, b| f64_cmp(a, b, |x, y| x == y)),
                VmOp::DNCmp => binop!(|a, b| f64_cmp(a, b, |x, y| x != y)),

                VmOp::Jmp => {
                    ip = instr.imm as usize;
                    continue;
                }
                VmOp::Branch => {
                    if self.reg(instr.reg1()) == 0 {
                        ip = instr.imm as usize;
                        continue;
                    }
                }
                VmOp::Ret => {
                    let return_ip = self.leave_script();
                    if return_ip == HALT {
                        return Ok(());
                    }
                    ip = return_ip;
                    continue;
                }
                VmOp::Term => {
                    return Err(self.raise(VmError::Terminated, src));
                }

                VmOp::Param => {
                    let v = self.reg(instr.reg1());
                    self.params.push(v);
                }
                VmOp::ParamImm => self.params.push(instr.imm),

                VmOp::Call | VmOp::CallR => {
                    let fid = if op == VmOp::Call {
                        FunctionId(instr.imm as u32)
                    } else {
                        FunctionId(self.reg(instr.reg2()) as u32)
                    };
                    let func = funcs
                        .get(fid)
                        .ok_or(VmError::UnknownFunction(fid.as_u32()))?;

                    if func.is_host() {
                        // Pause the loop, bridge through the FFI framing,
                        // resume with the return value placed.
                        self.invoke_host(funcs, fid, src)?;
                        if instr.has_op1() {
                            let ret = if instr.float_result() {
                                self.reg(VmRegister::Vf0)
                            } else {
                                self.reg(VmRegister::V0)
                            };
                            self.set_reg(instr.reg1(), ret);
                        }
                    } else {
                        let entry = func.entry.ok_or(VmError::NoBody)?;
                        let result_dst = if instr.has_op1() {
                            Some((instr.reg1(), instr.float_result()))
                        } else {
                            None
                        };
                        self.enter_script(program, types, funcs, fid, entry, ip + 1, result_dst)?;
                        ip = entry as usize;
                        continue;
                    }
                }
            }

            ip += 1;
        }
    }

    /// Script-to-host bridge: drain the staged parameters into a call
    /// context, invoke the wrapper, store the return into `v0`, and check
    /// the exception bit.
    fn invoke_host(
        &mut self,
        funcs: &FunctionRegistry,
        fid: FunctionId,
        src: SourceLocation,
    ) -> Result<(), VmError> {
        let func = funcs.get(fid).ok_or(VmError::UnknownFunction(fid.as_u32()))?;
        let wrapper = func.host_fn.clone().ok_or(VmError::NoBody)?;

        let staged: Vec<u64> = std::mem::take(&mut self.params);
        let takes_this = func.is_method();
        let (this_ptr, args) = if takes_this {
            let this = staged.first().copied().unwrap_or(0);
            (this as *mut u8, &staged[1.min(staged.len())..])
        } else {
            (std::ptr::null_mut(), &staged[..])
        };

        let mut ret_word: u64 = 0;
        // The wrapper gets a scratch context; both it and the thread-local
        // channel (used by free functions like raise_exception) converge
        // below.
        let mut scratch = ExecutionContext::new();
        {
            let mut ctx = CallContext {
                ectx: &mut scratch,
                func: fid,
                ret_ptr: &mut ret_word as *mut u64 as *mut u8,
                this_ptr,
                capture_ptr: std::ptr::null_mut(),
                args,
            };
            wrapper(&mut ctx);
        }
        if scratch.has_exception() {
            let message = scratch.message().to_string();
            tern_ffi::with_current(|e| {
                for frame in scratch.call_stack() {
                    e.push_frame(*frame);
                }
                e.raise_exception(message.clone(), src);
            });
            return Err(VmError::ScriptException(message));
        }

        self.set_reg(VmRegister::V0, ret_word);
        self.set_reg(VmRegister::Vf0, ret_word);

        if tern_ffi::has_exception() {
            let message = tern_ffi::with_current(|e| {
                e.push_frame(src);
                e.message().to_string()
            });
            return Err(VmError::ScriptException(message));
        }
        Ok(())
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

fn frame_to_plain(op: VmOp) -> VmOp {
    match op {
        VmOp::FrameLd8 => VmOp::Ld8,
        VmOp::FrameLd8S => VmOp::Ld8S,
        VmOp::FrameLd16 => VmOp::Ld16,
        VmOp::FrameLd16S => VmOp::Ld16S,
        VmOp::FrameLd32 => VmOp::Ld32,
        VmOp::FrameLd32S => VmOp::Ld32S,
        VmOp::FrameLd64 => VmOp::Ld64,
        VmOp::FrameSt8 => VmOp::St8,
        VmOp::FrameSt16 => VmOp::St16,
        VmOp::FrameSt32 => VmOp::St32,
        VmOp::FrameSt64 => VmOp::St64,
        other => other,
    }
}

unsafe fn load_sized(op: VmOp, addr: *const u8) -> u64 {
    match op {
        VmOp::Ld8 => std::ptr::read_unaligned(addr) as u64,
        VmOp::Ld8S => std::ptr::read_unaligned(addr as *const i8) as i64 as u64,
        VmOp::Ld16 => std::ptr::read_unaligned(addr as *const u16) as u64,
        VmOp::Ld16S => std::ptr::read_unaligned(addr as *const i16) as i64 as u64,
        VmOp::Ld32 => std::ptr::read_unaligned(addr as *const u32) as u64,
        VmOp::Ld32S => std::ptr::read_unaligned(addr as *const i32) as i64 as u64,
        _ => std::ptr::read_unaligned(addr as *const u64),
    }
}

unsafe fn store_sized(op: VmOp, addr: *mut u8, v: u64) {
    match op {
        VmOp::St8 => std::ptr::write_unaligned(addr, v as u8),
        VmOp::St16 => std::ptr::write_unaligned(addr as *mut u16, v as u16),
        VmOp::St32 => std::ptr::write_unaligned(addr as *mut u32, v as u32),
        _ => std::ptr::write_unaligned(addr as *mut u64, v),
    }
}

fn f32_op(a: u64, b: u64, f: impl Fn(f32, f32) -> f32) -> u64 {
    f(f32::from_bits(a as u32), f32::from_bits(b as u32)).to_bits() as u64
}

fn f64_op(a: u64, b: u64, f: impl Fn(f64, f64) -> f64) -> u64 {
    f(f64::from_bits(a), f64::from_bits(b)).to_bits()
}

fn f32_cmp(a: u64, b: u64, f: impl Fn(f32, f32) -> bool) -> u64 {
    f(f32::from_bits(a as u32), f32::from_bits(b as u32)) as u64
}

fn f64_cmp(a: u64, b: u64, f: impl Fn(f64, f64) -> bool) -> u64 {
    f(f64::from_bits(a), f64::from_bits(b)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::EncodedInstruction as E;

    fn run_raw(code: Vec<E>) -> Vm {
        let mut program = Program::new();
        for instr in code {
            program.code.push(instr);
            program.source_map.push(SourceLocation::default());
        }
        program.frames.insert(0, 64);

        let mut vm = Vm::new();
        vm.frames.push(Frame {
            return_ip: HALT,
            caller_frame_base: 0,
            sp_restore: 0,
            saved: [0; 32],
            result_dst: None,
        });
        vm.frame_base = vm.stack.as_ptr() as u64;
        vm.sp = 64;
        vm.set_reg(VmRegister::Ip, 0);

        let types = TypeRegistry::new();
        let funcs = FunctionRegistry::new();
        vm.run(&program, &types, &funcs).expect("execution");
        vm
    }

    #[test]
    fn arithmetic_and_return() {
        // s0 = 40, s1 = 2, v0 = s0 + s1
        let vm = run_raw(vec![
            E::new(VmOp::MovImm).with_reg1(VmRegister::S0).with_imm(40),
            E::new(VmOp::MovImm).with_reg1(VmRegister::S1).with_imm(2),
            E::new(VmOp::IAdd)
                .with_reg1(VmRegister::V0)
                .with_reg2(VmRegister::S0)
                .with_reg3(VmRegister::S1),
            E::new(VmOp::Ret),
        ]);
        assert_eq!(vm.reg(VmRegister::V0), 42);
    }

    #[test]
    fn immediate_operand_slots() {
        // v0 = s0 * 6, with 6 in the immediate word
        let vm = run_raw(vec![
            E::new(VmOp::MovImm).with_reg1(VmRegister::S0).with_imm(7),
            E::new(VmOp::IMul)
                .with_reg1(VmRegister::V0)
                .with_reg2(VmRegister::S0)
                .with_imm(6),
            E::new(VmOp::Ret),
        ]);
        assert_eq!(vm.reg(VmRegister::V0), 42);
    }

    #[test]
    fn branch_falls_through_on_truthy() {
        // branch taken when falsy: skip the poison write
        let vm = run_raw(vec![
            E::new(VmOp::MovImm).with_reg1(VmRegister::S0).with_imm(0),
            E::new(VmOp::Branch).with_reg1(VmRegister::S0).with_imm(3),
            E::new(VmOp::MovImm).with_reg1(VmRegister::V0).with_imm(111),
            E::new(VmOp::MovImm).with_reg1(VmRegister::S1).with_imm(5),
            E::new(VmOp::Ret),
        ]);
        assert_eq!(vm.reg(VmRegister::V0), 0, "fall-through body must be skipped");
        assert_eq!(vm.reg(VmRegister::S1), 5);
    }

    #[test]
    fn frame_store_load_round_trip() {
        let vm = run_raw(vec![
            E::new(VmOp::MovImm).with_reg1(VmRegister::S0).with_imm(0xABCD),
            E::new(VmOp::FrameSt64).with_reg1(VmRegister::S0).with_imm(8),
            E::new(VmOp::FrameLd64).with_reg1(VmRegister::V0).with_imm(8),
            E::new(VmOp::Ret),
        ]);
        assert_eq!(vm.reg(VmRegister::V0), 0xABCD);
    }

    #[test]
    fn zero_register_is_immutable() {
        let vm = run_raw(vec![
            E::new(VmOp::MovImm).with_reg1(VmRegister::Zero).with_imm(99),
            E::new(VmOp::Mov)
                .with_reg1(VmRegister::V0)
                .with_reg2(VmRegister::Zero),
            E::new(VmOp::Ret),
        ]);
        assert_eq!(vm.reg(VmRegister::V0), 0);
    }

    #[test]
    fn division_by_zero_raises() {
        tern_ffi::push_context();
        let mut program = Program::new();
        program.code.push(
            E::new(VmOp::IDiv)
                .with_reg1(VmRegister::V0)
                .with_reg2(VmRegister::S0)
                .with_imm(0),
        );
        program.source_map.push(SourceLocation::default());

        let mut vm = Vm::new();
        vm.frames.push(Frame {
            return_ip: HALT,
            caller_frame_base: 0,
            sp_restore: 0,
            saved: [0; 32],
            result_dst: None,
        });
        vm.frame_base = vm.stack.as_ptr() as u64;
        vm.set_reg(VmRegister::Ip, 0);

        let types = TypeRegistry::new();
        let funcs = FunctionRegistry::new();
        let err = vm.run(&program, &types, &funcs).unwrap_err();
        assert_eq!(err, VmError::DivideByZero);
        assert!(tern_ffi::has_exception());
        tern_ffi::pop_context();
    }
}
