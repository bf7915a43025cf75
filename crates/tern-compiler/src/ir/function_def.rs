//! In-progress functions.
//!
//! A [`FunctionDef`] accumulates IR while the compiler walks a function body.
//! It owns the id counters for virtual registers, labels, and stack
//! allocations, plus the argument and `this` values the body reads.

use super::instr::Instruction;
use super::op::Op;
use super::value::{AllocId, Immediate, LabelId, Value, VRegId};
use tern_ffi::{AccessModifier, FunctionKind, TypeId};
use tern_parser::SourceLocation;

/// One declared argument of an in-progress function.
#[derive(Debug, Clone)]
pub struct ArgInfo {
    pub name: String,
    pub ty: TypeId,
    /// Register holding the argument on entry.
    pub reg: VRegId,
    /// Non-primitive arguments arrive as pointers.
    pub is_pointer: bool,
}

/// A function being compiled.
#[derive(Debug, Clone)]
pub struct FunctionDef {
    pub name: String,
    pub fully_qualified_name: String,
    pub kind: FunctionKind,
    pub access: AccessModifier,
    pub return_type: Option<TypeId>,
    /// Whether the script spelled the return type out.
    pub return_type_explicit: bool,
    pub this_type: Option<TypeId>,
    pub args: Vec<ArgInfo>,
    pub implicit_arg_count: u8,
    pub src: SourceLocation,
    pub code: Vec<Instruction>,

    next_reg: VRegId,
    next_label: LabelId,
    next_alloc: AllocId,
    /// Register holding `this`, reserved before user args.
    this_reg: Option<VRegId>,
}

impl FunctionDef {
    pub fn new(name: impl Into<String>, fqn: impl Into<String>, src: SourceLocation) -> Self {
        Self {
            name: name.into(),
            fully_qualified_name: fqn.into(),
            kind: FunctionKind::Function,
            access: AccessModifier::Public,
            return_type: None,
            return_type_explicit: false,
            this_type: None,
            args: Vec::new(),
            implicit_arg_count: 0,
            src,
            code: Vec::new(),
            next_reg: 0,
            next_label: 0,
            next_alloc: 0,
            this_reg: None,
        }
    }

    /// Reserve the `this` register. Must precede `add_arg`.
    pub fn set_this_type(&mut self, ty: TypeId) {
        debug_assert!(self.args.is_empty(), "this must be reserved before args");
        self.this_type = Some(ty);
        self.this_reg = Some(self.fresh_reg());
        self.implicit_arg_count = 1;
    }

    pub fn set_return_type(&mut self, ty: Option<TypeId>, explicit: bool) {
        self.return_type = ty;
        self.return_type_explicit = explicit;
    }

    /// Declare an argument; its value arrives in a fresh register.
    pub fn add_arg(&mut self, name: impl Into<String>, ty: TypeId, is_pointer: bool) -> Value {
        let reg = self.fresh_reg();
        self.args.push(ArgInfo {
            name: name.into(),
            ty,
            reg,
            is_pointer,
        });
        let mut v = Value::reg(reg, ty);
        v.flags.is_pointer = is_pointer;
        v
    }

    pub fn arg(&self, idx: usize) -> Option<Value> {
        self.args.get(idx).map(|a| {
            let mut v = Value::reg(a.reg, a.ty);
            v.flags.is_pointer = a.is_pointer;
            v.label = Some(a.name.clone());
            v
        })
    }

    /// The `this` pointer value for methods.
    pub fn this_value(&self) -> Option<Value> {
        let reg = self.this_reg?;
        let ty = self.this_type?;
        let mut v = Value::reg(reg, ty);
        v.flags.is_pointer = true;
        v.label = Some("this".to_string());
        Some(v)
    }

    // ----- id allocation --------------------------------------------------

    pub fn fresh_reg(&mut self) -> VRegId {
        let id = self.next_reg;
        self.next_reg += 1;
        id
    }

    /// A fresh temporary of the given type.
    pub fn val(&mut self, ty: TypeId) -> Value {
        Value::reg(self.fresh_reg(), ty)
    }

    pub fn label(&mut self) -> LabelId {
        let id = self.next_label;
        self.next_label += 1;
        id
    }

    pub fn alloc_id(&mut self) -> AllocId {
        let id = self.next_alloc;
        self.next_alloc += 1;
        id
    }

    pub fn reg_count(&self) -> VRegId {
        self.next_reg
    }

    pub fn label_count(&self) -> LabelId {
        self.next_label
    }

    // ----- emission -------------------------------------------------------

    pub fn add(&mut self, instr: Instruction) {
        self.code.push(instr);
    }

    /// Emit a `label` instruction for `label`.
    pub fn place_label(&mut self, label: LabelId, src: SourceLocation) {
        self.add(Instruction::new(Op::Label, src).with_label(0, label));
    }

    /// Emit `stack_alloc` and return the allocation's address value.
    pub fn stack(&mut self, ty: TypeId, size: u32, src: SourceLocation) -> Value {
        let alloc = self.alloc_id();
        let value = Value::stack(alloc, ty);
        // Builtin ids derive from their names, no registry needed
        let size_ty = TypeId::from_fqn("u64");
        self.add(
            Instruction::new(Op::StackAlloc, src)
                .with_op1(value.clone())
                .with_op2(Value::imm(Immediate::UInt(size as u64), size_ty)),
        );
        value
    }

    /// Emit a `cvt` copy of `src_val` into a fresh register of `ty`.
    pub fn convert(&mut self, src_val: &Value, ty: TypeId, src: SourceLocation) -> Value {
        let dst = self.val(ty);
        self.add(
            Instruction::new(Op::Cvt, src)
                .with_op1(dst.clone())
                .with_op2(src_val.clone()),
        );
        dst
    }

    /// Restore counters when loading a serialized function body.
    pub fn restore_counters(&mut self, regs: VRegId, labels: LabelId, allocs: AllocId) {
        self.next_reg = regs;
        self.next_label = labels;
        self.next_alloc = allocs;
    }

    pub fn alloc_count(&self) -> AllocId {
        self.next_alloc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ty(name: &str) -> TypeId {
        TypeId::from_fqn(name)
    }

    #[test]
    fn register_ids_are_monotonic_and_unique() {
        let mut fd = FunctionDef::new("f", "m::f", SourceLocation::default());
        let a = fd.val(ty("i32"));
        let b = fd.val(ty("i32"));
        let c = fd.val(ty("f32"));
        let ids: Vec<_> = [a, b, c].iter().map(|v| v.reg_id().unwrap()).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn this_reserves_the_first_register() {
        let mut fd = FunctionDef::new("m", "T::m", SourceLocation::default());
        fd.set_this_type(ty("T"));
        let arg = fd.add_arg("x", ty("i32"), false);
        assert_eq!(fd.this_value().unwrap().reg_id(), Some(0));
        assert_eq!(arg.reg_id(), Some(1));
        assert_eq!(fd.implicit_arg_count, 1);
    }

    #[test]
    fn stack_emits_alloc_instruction() {
        let mut fd = FunctionDef::new("f", "m::f", SourceLocation::default());
        let v = fd.stack(ty("T"), 16, SourceLocation::default());
        assert_eq!(fd.code.len(), 1);
        assert_eq!(fd.code[0].op, Op::StackAlloc);
        assert_eq!(v.stack_ref, Some(0));
    }
}
