//! Expression compilation.
//!
//! Every expression node compiles to a [`Value`]. Errors log a diagnostic
//! and abort the enclosing function via the `CResult` sentinel.

use super::resolve::MatchFlags;
use super::{Compiler, CResult, Imported};
use crate::error::{CompileErrorKind, CompileWarning};
use crate::ir::{Immediate, Instruction, Op, Value};
use tern_ffi::{FunctionId, FunctionKind, Property, TypeId};
use tern_parser::{IntSuffix, Literal, NodeId, NodeKind, OperatorKind, SourceLocation};

/// An assignable location.
pub(crate) enum Place {
    /// A named local backed by a register or stack allocation.
    Symbol { value: Value, is_const: bool },
    /// A raw memory cell: `*(addr + offset)`.
    Mem {
        addr: Value,
        offset: u32,
        ty: TypeId,
    },
    /// A property with storage and/or accessors.
    Prop {
        object: Value,
        prop: Property,
        offset: u32,
    },
    /// `object[index]`, backed by `operator []`.
    Index { object: Value, index: Value },
}

impl<'a> Compiler<'a> {
    pub(crate) fn compile_expr(&mut self, node_id: NodeId) -> CResult<Value> {
        let node = self.arena.get(node_id);
        let src = node.loc;
        match node.kind {
            NodeKind::Literal => self.compile_literal(node_id),
            NodeKind::Identifier => {
                let name = self.node_text(node_id);
                self.compile_identifier(&name, src)
            }
            NodeKind::This => match self.fd_ref().this_value() {
                Some(v) => Ok(v),
                None => self.error(CompileErrorKind::ThisOutsideMethod, src),
            },
            NodeKind::Sizeof => {
                let Some(ty_node) = node.data_type else {
                    return self.error(CompileErrorKind::UnknownType("sizeof".into()), src);
                };
                let ty = self.resolve_type(ty_node)?;
                let size = self.types.resolve(ty).map(|t| t.size()).unwrap_or(0);
                Ok(Value::imm_u(size as u64, self.builtin("u64")))
            }
            NodeKind::ArrayLiteral => self.compile_array_literal(node_id),
            NodeKind::Expression => {
                let op = node.op.expect("expression node without operator");
                self.compile_operator(node_id, op, src)
            }
            _ => self.error(
                CompileErrorKind::UnknownSymbol(format!("{:?}", node.kind)),
                src,
            ),
        }
    }

    fn compile_operator(
        &mut self,
        node_id: NodeId,
        op: OperatorKind,
        src: SourceLocation,
    ) -> CResult<Value> {
        let node = self.arena.get(node_id);
        let lvalue = node.lvalue;
        let rvalue = node.rvalue;
        let condition = node.condition;

        match op {
            OperatorKind::Assign => {
                let rhs = self.compile_expr(rvalue.expect("assign without rhs"))?;
                let place = self.compile_place(lvalue.expect("assign without lhs"))?;
                self.write_place(place, rhs, src)
            }
            OperatorKind::AddAssign
            | OperatorKind::SubAssign
            | OperatorKind::MulAssign
            | OperatorKind::DivAssign
            | OperatorKind::ModAssign
            | OperatorKind::BitAndAssign
            | OperatorKind::BitOrAssign
            | OperatorKind::BitXorAssign
            | OperatorKind::ShlAssign
            | OperatorKind::ShrAssign => {
                let base = op.base_of_compound().expect("compound without base");
                let lhs_node = lvalue.expect("compound without lhs");
                let rhs = self.compile_expr(rvalue.expect("compound without rhs"))?;
                let place = self.compile_place(lhs_node)?;
                let current = self.read_place(&place, src)?;
                let combined = self.compile_binary_values(base, current, rhs, src)?;
                // The assignment target's type wins; warn when the store
                // narrows the computed value
                let target_ty = self.place_type(&place);
                if self.is_narrowing(combined.ty, target_ty) {
                    let from = self.type_name(combined.ty);
                    let to = self.type_name(target_ty);
                    self.warn(CompileWarning::Truncation(from, to), src);
                }
                self.write_place(place, combined, src)
            }
            OperatorKind::Add
            | OperatorKind::Sub
            | OperatorKind::Mul
            | OperatorKind::Div
            | OperatorKind::Mod
            | OperatorKind::BitAnd
            | OperatorKind::BitOr
            | OperatorKind::BitXor
            | OperatorKind::Shl
            | OperatorKind::Shr
            | OperatorKind::Eq
            | OperatorKind::NotEq
            | OperatorKind::Less
            | OperatorKind::LessEq
            | OperatorKind::Greater
            | OperatorKind::GreaterEq => {
                let a = self.compile_expr(lvalue.expect("binary without lhs"))?;
                let b = self.compile_expr(rvalue.expect("binary without rhs"))?;
                self.compile_binary_values(op, a, b, src)
            }
            OperatorKind::LogicalAnd | OperatorKind::LogicalOr => {
                self.compile_logical(op, lvalue.expect("logical lhs"), rvalue.expect("logical rhs"), src)
            }
            OperatorKind::Not => {
                let v = self.compile_expr(lvalue.expect("not operand"))?;
                let cond = self.truthy(v, src)?;
                let bool_ty = self.builtin("bool");
                let dst = self.fd().val(bool_ty);
                self.emit(
                    Instruction::new(Op::Cmp, src)
                        .with_op1(dst.clone())
                        .with_op2(cond)
                        .with_op3(Value::imm_u(0, bool_ty)),
                );
                Ok(dst)
            }
            OperatorKind::BitNot => {
                let v = self.compile_expr(lvalue.expect("bitnot operand"))?;
                let dst = self.fd().val(v.ty);
                let all_ones = Value::imm_i(-1, v.ty);
                self.emit(
                    Instruction::new(Op::BXor, src)
                        .with_op1(dst.clone())
                        .with_op2(v)
                        .with_op3(all_ones),
                );
                Ok(dst)
            }
            OperatorKind::Negate => {
                let v = self.compile_expr(lvalue.expect("negate operand"))?;
                let dst = self.fd().val(v.ty);
                self.emit(
                    Instruction::new(Op::Neg, src)
                        .with_op1(dst.clone())
                        .with_op2(v),
                );
                Ok(dst)
            }
            OperatorKind::Conditional => {
                self.compile_conditional(
                    condition.expect("conditional without condition"),
                    lvalue.expect("conditional then"),
                    rvalue.expect("conditional else"),
                    src,
                )
            }
            OperatorKind::Call => self.compile_call(node_id, src),
            OperatorKind::Index => {
                let object = self.compile_expr(lvalue.expect("index base"))?;
                let index = self.compile_expr(rvalue.expect("index value"))?;
                self.call_index_operator(object, index, None, src)
            }
            OperatorKind::Member => self.compile_member_read(node_id, src),
            OperatorKind::New => self.compile_new(node_id, src),
            OperatorKind::Cast => {
                let v = self.compile_expr(lvalue.expect("cast operand"))?;
                let ty_node = node_id;
                let target_node = self.arena.get(ty_node).data_type.expect("cast type");
                let to = self.resolve_type(target_node)?;
                // Explicit casts permit any standard conversion silently
                match self.conversion(v.ty, to) {
                    super::Conversion::Exact => Ok(v),
                    super::Conversion::Standard => self.convert_value(v, to, src),
                    super::Conversion::None => {
                        let from = self.type_name(v.ty);
                        let to_name = self.type_name(to);
                        self.error(CompileErrorKind::NoImplicitConversion(from, to_name), src)
                    }
                }
            }
        }
    }

    // ----- literals and names ---------------------------------------------

    fn compile_literal(&mut self, node_id: NodeId) -> CResult<Value> {
        let node = self.arena.get(node_id);
        let src = node.loc;
        let lit = node.value.clone().expect("literal node without payload");
        Ok(match lit {
            Literal::Signed(v, suffix) => {
                let ty = match suffix {
                    IntSuffix::I8 => self.builtin("i8"),
                    IntSuffix::I16 => self.builtin("i16"),
                    IntSuffix::I64 => self.builtin("i64"),
                    _ if v > i32::MAX as i64 || v < i32::MIN as i64 => self.builtin("i64"),
                    _ => self.builtin("i32"),
                };
                Value::imm_i(v, ty)
            }
            Literal::Unsigned(v, suffix) => {
                let ty = match suffix {
                    IntSuffix::U8 => self.builtin("u8"),
                    IntSuffix::U16 => self.builtin("u16"),
                    IntSuffix::U32 => self.builtin("u32"),
                    _ => self.builtin("u64"),
                };
                Value::imm_u(v, ty)
            }
            Literal::F32(v) => Value::imm_f32(v, self.builtin("f32")),
            Literal::F64(v) => Value::imm_f64(v, self.builtin("f64")),
            Literal::Bool(v) => Value::imm_u(v as u64, self.builtin("bool")),
            Literal::Null => Value::null(self.builtin("null")),
            Literal::Str(s) => {
                let Some(string_ty) = self.try_resolve_named_type("string") else {
                    return self.error(CompileErrorKind::UnknownType("string".into()), src);
                };
                // Literal bytes live in a module data slot for the module's
                // lifetime
                let slot = self.module.add_data_slot(
                    format!("$str{}", self.module.data_slots.len()),
                    string_ty,
                    s.len() as u32 + 1,
                    tern_ffi::AccessModifier::Private,
                );
                if let Some(storage) = self.module.slot_mut(slot) {
                    storage.bytes_mut()[..s.len()].copy_from_slice(s.as_bytes());
                }
                Value::module_data(self.module.id, slot, string_ty)
            }
        })
    }

    pub(crate) fn try_resolve_named_type(&self, name: &str) -> Option<TypeId> {
        if let Some(ty) = self.scopes.lookup_type_alias(name) {
            return Some(ty);
        }
        if let Some(Imported::Type(ty)) = self.imports.get(name) {
            return Some(*ty);
        }
        if let Some(dt) = self.types.by_fqn(&self.fqn(name)) {
            return Some(dt.id);
        }
        self.types.by_fqn(name).map(|dt| dt.id)
    }

    fn compile_identifier(&mut self, name: &str, src: SourceLocation) -> CResult<Value> {
        if let Some(sym) = self.scopes.lookup(name) {
            return Ok(sym.value.clone());
        }
        if let Some(v) = self.module_symbols.get(name) {
            let v = v.clone();
            return self.load_if_primitive(v, src);
        }
        match self.imports.get(name) {
            Some(Imported::Data { module, slot, ty }) => {
                let v = Value::module_data(*module, *slot, *ty);
                return self.load_if_primitive(v, src);
            }
            Some(Imported::Function(fid)) => {
                let fid = *fid;
                let sig_ty = self.funcs.get(fid).map(|f| f.sig_type).unwrap_or_default();
                return Ok(Value::func(fid, sig_ty));
            }
            _ => {}
        }
        // A lone function name is a function value when unambiguous
        let global: Vec<FunctionId> = self.callable_candidates(name);
        if global.len() == 1 {
            let fid = global[0];
            let sig_ty = self.funcs.get(fid).map(|f| f.sig_type).unwrap_or_default();
            return Ok(Value::func(fid, sig_ty));
        }
        if global.len() > 1 {
            return self.error(CompileErrorKind::AmbiguousOverload(name.to_string()), src);
        }
        self.error(CompileErrorKind::UnknownSymbol(name.to_string()), src)
    }

    /// Module data holding a primitive reads as its loaded value; objects
    /// stay as addresses.
    fn load_if_primitive(&mut self, v: Value, src: SourceLocation) -> CResult<Value> {
        let primitive = self
            .types
            .resolve(v.ty)
            .map(|t| t.is_register_sized())
            .unwrap_or(false);
        if !primitive {
            return Ok(v);
        }
        let dst = self.fd().val(v.ty);
        self.emit(
            Instruction::new(Op::Load, src)
                .with_op1(dst.clone())
                .with_op2(v),
        );
        Ok(dst)
    }

    // ----- binary operators -----------------------------------------------

    /// The numeric type both operands convert to.
    fn common_numeric_type(&mut self, a: TypeId, b: TypeId, src: SourceLocation) -> CResult<TypeId> {
        let am = match self.types.resolve(a) {
            Some(dt) if dt.meta.is_primitive || dt.meta.is_integral => dt.meta,
            _ => {
                let name = self.type_name(a);
                return self.error(
                    CompileErrorKind::NoImplicitConversion(name, "a numeric type".into()),
                    src,
                );
            }
        };
        let bm = match self.types.resolve(b) {
            Some(dt) if dt.meta.is_primitive || dt.meta.is_integral => dt.meta,
            _ => {
                let name = self.type_name(b);
                return self.error(
                    CompileErrorKind::NoImplicitConversion(name, "a numeric type".into()),
                    src,
                );
            }
        };

        if am.is_floating_point || bm.is_floating_point {
            let size = if (am.is_floating_point && am.size == 8)
                || (bm.is_floating_point && bm.size == 8)
            {
                8
            } else {
                4
            };
            return Ok(self.builtin(if size == 8 { "f64" } else { "f32" }));
        }

        // Integral lattice: wider size wins; at equal width unsigned wins
        let size = am.size.max(bm.size).max(4);
        let unsigned = if am.size == bm.size {
            am.is_unsigned || bm.is_unsigned
        } else if am.size > bm.size {
            am.is_unsigned
        } else {
            bm.is_unsigned
        };
        Ok(self.builtin(match (size, unsigned) {
            (8, true) => "u64",
            (8, false) => "i64",
            (_, true) => "u32",
            (_, false) => "i32",
        }))
    }

    fn arith_op(&self, kind: OperatorKind, ty: TypeId) -> Op {
        let meta = self
            .types
            .resolve(ty)
            .map(|t| t.meta)
            .unwrap_or_default();
        let family = if meta.is_floating_point {
            if meta.size == 8 {
                2
            } else {
                1
            }
        } else if meta.is_unsigned {
            3
        } else {
            0
        };
        match (kind, family) {
            (OperatorKind::Add, 0) => Op::IAdd,
            (OperatorKind::Add, 3) => Op::UAdd,
            (OperatorKind::Add, 1) => Op::FAdd,
            (OperatorKind::Add, 2) => Op::DAdd,
            (OperatorKind::Sub, 0) => Op::ISub,
            (OperatorKind::Sub, 3) => Op::USub,
            (OperatorKind::Sub, 1) => Op::FSub,
            (OperatorKind::Sub, 2) => Op::DSub,
            (OperatorKind::Mul, 0) => Op::IMul,
            (OperatorKind::Mul, 3) => Op::UMul,
            (OperatorKind::Mul, 1) => Op::FMul,
            (OperatorKind::Mul, 2) => Op::DMul,
            (OperatorKind::Div, 0) => Op::IDiv,
            (OperatorKind::Div, 3) => Op::UDiv,
            (OperatorKind::Div, 1) => Op::FDiv,
            (OperatorKind::Div, 2) => Op::DDiv,
            (OperatorKind::Mod, 0) => Op::IMod,
            (OperatorKind::Mod, 3) => Op::UMod,
            (OperatorKind::Mod, 1) => Op::FMod,
            (OperatorKind::Mod, 2) => Op::DMod,
            _ => unreachable!("not an arithmetic operator"),
        }
    }

    pub(crate) fn compile_binary_values(
        &mut self,
        kind: OperatorKind,
        a: Value,
        b: Value,
        src: SourceLocation,
    ) -> CResult<Value> {
        // Objects dispatch to their operator methods
        let a_is_object = self
            .types
            .resolve(a.ty)
            .map(|t| !t.meta.is_primitive && !t.meta.is_integral)
            .unwrap_or(false);
        if a_is_object {
            let method = format!("operator {}", kind.symbol());
            let candidates = self.methods_named(a.ty, &method);
            if candidates.is_empty() {
                let name = self.type_name(a.ty);
                return self.error(CompileErrorKind::NoSuchMember(name, method), src);
            }
            return self.call_method_on(a, &method, candidates, vec![b], src);
        }

        match kind {
            OperatorKind::Add
            | OperatorKind::Sub
            | OperatorKind::Mul
            | OperatorKind::Div
            | OperatorKind::Mod => {
                let common = self.common_numeric_type(a.ty, b.ty, src)?;
                let a = self.convert_value(a, common, src)?;
                let b = self.convert_value(b, common, src)?;
                let op = self.arith_op(kind, common);
                let dst = self.fd().val(common);
                self.emit(
                    Instruction::new(op, src)
                        .with_op1(dst.clone())
                        .with_op2(a)
                        .with_op3(b),
                );
                Ok(dst)
            }
            OperatorKind::BitAnd
            | OperatorKind::BitOr
            | OperatorKind::BitXor
            | OperatorKind::Shl
            | OperatorKind::Shr => {
                let common = self.common_numeric_type(a.ty, b.ty, src)?;
                let meta = self.types.resolve(common).map(|t| t.meta).unwrap_or_default();
                if meta.is_floating_point {
                    let name = self.type_name(common);
                    return self.error(
                        CompileErrorKind::NoImplicitConversion(name, "an integral type".into()),
                        src,
                    );
                }
                let a = self.convert_value(a, common, src)?;
                let b = self.convert_value(b, common, src)?;
                let op = match kind {
                    OperatorKind::BitAnd => Op::BAnd,
                    OperatorKind::BitOr => Op::BOr,
                    OperatorKind::BitXor => Op::BXor,
                    OperatorKind::Shl => Op::Sl,
                    _ => Op::Sr,
                };
                let dst = self.fd().val(common);
                self.emit(
                    Instruction::new(op, src)
                        .with_op1(dst.clone())
                        .with_op2(a)
                        .with_op3(b),
                );
                Ok(dst)
            }
            OperatorKind::Eq
            | OperatorKind::NotEq
            | OperatorKind::Less
            | OperatorKind::LessEq
            | OperatorKind::Greater
            | OperatorKind::GreaterEq => {
                let common = self.common_numeric_type(a.ty, b.ty, src)?;
                let a = self.convert_value(a, common, src)?;
                let b = self.convert_value(b, common, src)?;
                let op = match kind {
                    OperatorKind::Eq => Op::Cmp,
                    OperatorKind::NotEq => Op::NCmp,
                    OperatorKind::Less => Op::Lt,
                    OperatorKind::LessEq => Op::Lte,
                    OperatorKind::Greater => Op::Gt,
                    _ => Op::Gte,
                };
                let bool_ty = self.builtin("bool");
                let dst = self.fd().val(bool_ty);
                self.emit(
                    Instruction::new(op, src)
                        .with_op1(dst.clone())
                        .with_op2(a)
                        .with_op3(b),
                );
                Ok(dst)
            }
            _ => unreachable!("not a value binary operator"),
        }
    }

    /// Convert `v` to a boolean condition value.
    pub(crate) fn truthy(&mut self, v: Value, src: SourceLocation) -> CResult<Value> {
        let bool_ty = self.builtin("bool");
        if self.types.resolve(v.ty).map(|t| t.id) == self.types.resolve(bool_ty).map(|t| t.id) {
            return Ok(v);
        }
        let zero = Value::imm_u(0, v.ty);
        let dst = self.fd().val(bool_ty);
        self.emit(
            Instruction::new(Op::NCmp, src)
                .with_op1(dst.clone())
                .with_op2(v)
                .with_op3(zero),
        );
        Ok(dst)
    }

    /// Short-circuit `&&`/`||` compiled to branches, never to bitwise ops.
    fn compile_logical(
        &mut self,
        kind: OperatorKind,
        lhs: NodeId,
        rhs: NodeId,
        src: SourceLocation,
    ) -> CResult<Value> {
        let bool_ty = self.builtin("bool");
        let result = self.fd().val(bool_ty);
        let short_label = self.fd().label();
        let end_label = self.fd().label();

        let a = self.compile_expr(lhs)?;
        let a = self.truthy(a, src)?;

        match kind {
            OperatorKind::LogicalAnd => {
                // Falsy lhs short-circuits to false
                self.emit(
                    Instruction::new(Op::Branch, src)
                        .with_op1(a)
                        .with_label(0, short_label),
                );
                let b = self.compile_expr(rhs)?;
                let b = self.truthy(b, src)?;
                self.emit(
                    Instruction::new(Op::Branch, src)
                        .with_op1(b)
                        .with_label(0, short_label),
                );
                self.emit(
                    Instruction::new(Op::Cvt, src)
                        .with_op1(result.clone())
                        .with_op2(Value::imm_u(1, bool_ty)),
                );
                self.emit(Instruction::new(Op::Jump, src).with_label(0, end_label));
                self.fd().place_label(short_label, src);
                self.emit(
                    Instruction::new(Op::Cvt, src)
                        .with_op1(result.clone())
                        .with_op2(Value::imm_u(0, bool_ty)),
                );
                self.fd().place_label(end_label, src);
            }
            _ => {
                // Falsy lhs falls into the rhs; truthy short-circuits to true
                let rhs_label = short_label;
                let false_label = self.fd().label();
                self.emit(
                    Instruction::new(Op::Branch, src)
                        .with_op1(a)
                        .with_label(0, rhs_label),
                );
                self.emit(
                    Instruction::new(Op::Cvt, src)
                        .with_op1(result.clone())
                        .with_op2(Value::imm_u(1, bool_ty)),
                );
                self.emit(Instruction::new(Op::Jump, src).with_label(0, end_label));
                self.fd().place_label(rhs_label, src);
                let b = self.compile_expr(rhs)?;
                let b = self.truthy(b, src)?;
                self.emit(
                    Instruction::new(Op::Branch, src)
                        .with_op1(b)
                        .with_label(0, false_label),
                );
                self.emit(
                    Instruction::new(Op::Cvt, src)
                        .with_op1(result.clone())
                        .with_op2(Value::imm_u(1, bool_ty)),
                );
                self.emit(Instruction::new(Op::Jump, src).with_label(0, end_label));
                self.fd().place_label(false_label, src);
                self.emit(
                    Instruction::new(Op::Cvt, src)
                        .with_op1(result.clone())
                        .with_op2(Value::imm_u(0, bool_ty)),
                );
                self.fd().place_label(end_label, src);
            }
        }

        Ok(result)
    }

    fn compile_conditional(
        &mut self,
        cond: NodeId,
        then_node: NodeId,
        else_node: NodeId,
        src: SourceLocation,
    ) -> CResult<Value> {
        let else_label = self.fd().label();
        let end_label = self.fd().label();

        let c = self.compile_expr(cond)?;
        let c = self.truthy(c, src)?;
        self.emit(
            Instruction::new(Op::Branch, src)
                .with_op1(c)
                .with_label(0, else_label),
        );

        // Compile the then-arm first to learn the result type
        let t = self.compile_expr(then_node)?;
        let result = self.fd().val(t.ty);
        self.emit(
            Instruction::new(Op::Cvt, src)
                .with_op1(result.clone())
                .with_op2(t),
        );
        self.emit(Instruction::new(Op::Jump, src).with_label(0, end_label));

        self.fd().place_label(else_label, src);
        let e = self.compile_expr(else_node)?;
        let e = self.convert_value(e, result.ty, src)?;
        self.emit(
            Instruction::new(Op::Cvt, src)
                .with_op1(result.clone())
                .with_op2(e),
        );
        self.fd().place_label(end_label, src);
        Ok(result)
    }

    // ----- member access --------------------------------------------------

    fn compile_member_read(&mut self, node_id: NodeId, src: SourceLocation) -> CResult<Value> {
        let node = self.arena.get(node_id);
        let base = node.lvalue.expect("member without base");
        let member_name = self.ident_text(node.identifier);

        // Qualified names that are not object accesses: enum members and
        // imported-module members
        if self.arena.get(base).kind == NodeKind::Identifier {
            let base_name = self.node_text(base);

            if let Some(Imported::Module(module_id)) = self.imports.get(&base_name) {
                let module_id = *module_id;
                return self.compile_module_member(module_id, &member_name, src);
            }

            if let Some(ty) = self.try_resolve_named_type(&base_name) {
                let dt = self.types.resolve(ty);
                if let Some(dt) = dt {
                    if !dt.enumerators.is_empty() {
                        let found = dt.enumerators.iter().find(|(n, _)| n == &member_name);
                        let ty_id = dt.id;
                        return match found {
                            Some((_, value)) => Ok(Value::imm(Immediate::Int(*value), ty_id)),
                            None => {
                                let type_name = dt.name.clone();
                                self.error(
                                    CompileErrorKind::NoSuchMember(type_name, member_name),
                                    src,
                                )
                            }
                        };
                    }
                }
            }
        }

        let object = self.compile_expr(base)?;
        let place = self.member_place(object, &member_name, src)?;
        self.read_place(&place, src)
    }

    fn compile_module_member(
        &mut self,
        module_id: tern_ffi::ModuleId,
        name: &str,
        src: SourceLocation,
    ) -> CResult<Value> {
        // Data slot or public function of the module
        if let Some((slot, ty)) = self.module_slot_by_id(module_id, name) {
            let v = Value::module_data(module_id, slot, ty);
            return self.load_if_primitive(v, src);
        }
        if let Some(fid) = self.module_function_by_id(module_id, name) {
            let sig_ty = self.funcs.get(fid).map(|f| f.sig_type).unwrap_or_default();
            return Ok(Value::func(fid, sig_ty));
        }
        self.error(
            CompileErrorKind::SymbolNotInModule(format!("{:08x}", module_id.as_u32()), name.to_string()),
            src,
        )
    }

    pub(crate) fn member_place(
        &mut self,
        object: Value,
        name: &str,
        src: SourceLocation,
    ) -> CResult<Place> {
        let Some((prop, offset)) = self.find_property(object.ty, name) else {
            let ty_name = self.type_name(object.ty);
            return self.error(
                CompileErrorKind::NoSuchMember(ty_name, name.to_string()),
                src,
            );
        };
        if prop.access == tern_ffi::AccessModifier::Private
            && self.current_class.map(|c| self.types.resolve(c).map(|t| t.id))
                != Some(self.types.resolve(object.ty).map(|t| t.id))
        {
            return self.error(CompileErrorKind::AccessDenied(name.to_string()), src);
        }
        Ok(Place::Prop {
            object,
            prop,
            offset,
        })
    }

    /// Find a property on `ty` or its bases, with the accumulated offset.
    fn find_property(&self, ty: TypeId, name: &str) -> Option<(Property, u32)> {
        fn walk(
            c: &Compiler,
            ty: TypeId,
            name: &str,
            base_off: u32,
        ) -> Option<(Property, u32)> {
            let dt = c.types.resolve(ty)?;
            if let Some(p) = dt.prop(name) {
                return Some((p.clone(), base_off + p.offset));
            }
            for b in &dt.bases {
                if let Some(found) = walk(c, b.ty, name, base_off + b.offset) {
                    return Some(found);
                }
            }
            None
        }
        walk(self, ty, name, 0)
    }

    // ----- places ----------------------------------------------------------

    pub(crate) fn compile_place(&mut self, node_id: NodeId) -> CResult<Place> {
        let node = self.arena.get(node_id);
        let src = node.loc;
        match node.kind {
            NodeKind::Identifier => {
                let name = self.node_text(node_id);
                if let Some(sym) = self.scopes.lookup(&name) {
                    return Ok(Place::Symbol {
                        value: sym.value.clone(),
                        is_const: sym.is_const,
                    });
                }
                if let Some(v) = self.module_symbols.get(&name) {
                    return Ok(Place::Mem {
                        addr: v.clone(),
                        offset: 0,
                        ty: v.ty,
                    });
                }
                if let Some(Imported::Data { module, slot, ty }) = self.imports.get(&name) {
                    let v = Value::module_data(*module, *slot, *ty);
                    return Ok(Place::Mem {
                        addr: v,
                        offset: 0,
                        ty: *ty,
                    });
                }
                self.error(CompileErrorKind::UnknownSymbol(name), src)
            }
            NodeKind::Expression => match node.op {
                Some(OperatorKind::Member) => {
                    let base = node.lvalue.expect("member without base");
                    let member_name = self.ident_text(node.identifier);
                    let object = self.compile_expr(base)?;
                    self.member_place(object, &member_name, src)
                }
                Some(OperatorKind::Index) => {
                    let base = node.lvalue.expect("index base");
                    let value = node.rvalue.expect("index value");
                    let object = self.compile_expr(base)?;
                    let index = self.compile_expr(value)?;
                    Ok(Place::Index { object, index })
                }
                _ => self.error(CompileErrorKind::NotAssignable, src),
            },
            _ => self.error(CompileErrorKind::NotAssignable, src),
        }
    }

    pub(crate) fn place_type(&self, place: &Place) -> TypeId {
        match place {
            Place::Symbol { value, .. } => value.ty,
            Place::Mem { ty, .. } => *ty,
            Place::Prop { prop, .. } => prop.ty,
            Place::Index { object, .. } => object.ty,
        }
    }

    pub(crate) fn read_place(&mut self, place: &Place, src: SourceLocation) -> CResult<Value> {
        match place {
            Place::Symbol { value, .. } => Ok(value.clone()),
            Place::Mem { addr, offset, ty } => {
                let primitive = self
                    .types
                    .resolve(*ty)
                    .map(|t| t.is_register_sized())
                    .unwrap_or(false);
                if primitive {
                    let dst = self.fd().val(*ty);
                    let u64_ty = self.builtin("u64");
                    let mut load = Instruction::new(Op::Load, src)
                        .with_op1(dst.clone())
                        .with_op2(addr.clone());
                    if *offset != 0 {
                        load = load.with_op3(Value::imm_u(*offset as u64, u64_ty));
                    }
                    self.emit(load);
                    Ok(dst)
                } else {
                    Ok(addr.clone())
                }
            }
            Place::Prop {
                object,
                prop,
                offset,
            } => {
                if let Some(getter) = prop.getter {
                    return self.emit_call(getter, Some(object.clone()), Vec::new(), src);
                }
                if !prop.can_read {
                    return self.error(
                        CompileErrorKind::RestrictedProperty(prop.name.clone(), "write-only"),
                        src,
                    );
                }
                let primitive = self
                    .types
                    .resolve(prop.ty)
                    .map(|t| t.is_register_sized())
                    .unwrap_or(false);
                if primitive {
                    let dst = self.fd().val(prop.ty);
                    let u64_ty = self.builtin("u64");
                    let mut load = Instruction::new(Op::Load, src)
                        .with_op1(dst.clone())
                        .with_op2(object.clone());
                    if *offset != 0 {
                        load = load.with_op3(Value::imm_u(*offset as u64, u64_ty));
                    }
                    self.emit(load);
                    Ok(dst)
                } else {
                    // Interior object: address arithmetic over the layout
                    let dst = self.fd().val(prop.ty).as_pointer();
                    let u64_ty = self.builtin("u64");
                    self.emit(
                        Instruction::new(Op::UAdd, src)
                            .with_op1(dst.clone())
                            .with_op2(object.clone())
                            .with_op3(Value::imm_u(*offset as u64, u64_ty)),
                    );
                    Ok(dst)
                }
            }
            Place::Index { object, index } => {
                self.call_index_operator(object.clone(), index.clone(), None, src)
            }
        }
    }

    pub(crate) fn write_place(
        &mut self,
        place: Place,
        value: Value,
        src: SourceLocation,
    ) -> CResult<Value> {
        match place {
            Place::Symbol {
                value: sym,
                is_const,
            } => {
                if is_const || !sym.flags.writable {
                    return self.error(CompileErrorKind::NotAssignable, src);
                }
                match sym.kind {
                    crate::ir::ValueKind::Register(_) => {
                        let converted = self.convert_value(value, sym.ty, src)?;
                        self.emit(
                            Instruction::new(Op::Cvt, src)
                                .with_op1(sym.clone())
                                .with_op2(converted),
                        );
                        Ok(sym)
                    }
                    crate::ir::ValueKind::StackAlloc(_) => {
                        // Object assignment dispatches to operator=
                        let method = "operator =";
                        let candidates = self.methods_named(sym.ty, method);
                        if candidates.is_empty() {
                            let name = self.type_name(sym.ty);
                            return self.error(
                                CompileErrorKind::NoSuchMember(name, method.to_string()),
                                src,
                            );
                        }
                        self.call_method_on(sym, method, candidates, vec![value], src)
                    }
                    _ => self.error(CompileErrorKind::NotAssignable, src),
                }
            }
            Place::Mem { addr, offset, ty } => {
                let converted = self.convert_value(value, ty, src)?;
                let u64_ty = self.builtin("u64");
                let mut store = Instruction::new(Op::Store, src)
                    .with_op1(converted.clone())
                    .with_op2(addr);
                if offset != 0 {
                    store = store.with_op3(Value::imm_u(offset as u64, u64_ty));
                }
                self.emit(store);
                Ok(converted)
            }
            Place::Prop {
                object,
                prop,
                offset,
            } => {
                if let Some(setter) = prop.setter {
                    let converted = self.convert_value(value, prop.ty, src)?;
                    self.emit_call(setter, Some(object), vec![converted.clone()], src)?;
                    return Ok(converted);
                }
                if !prop.can_write {
                    return self.error(
                        CompileErrorKind::RestrictedProperty(prop.name.clone(), "read-only"),
                        src,
                    );
                }
                let converted = self.convert_value(value, prop.ty, src)?;
                let u64_ty = self.builtin("u64");
                let mut store = Instruction::new(Op::Store, src)
                    .with_op1(converted.clone())
                    .with_op2(object);
                if offset != 0 {
                    store = store.with_op3(Value::imm_u(offset as u64, u64_ty));
                }
                self.emit(store);
                Ok(converted)
            }
            Place::Index { object, index } => {
                self.call_index_operator(object, index, Some(value), src)
            }
        }
    }

    // ----- calls ------------------------------------------------------------

    /// Candidate functions visible under a bare name: host globals, module
    /// locals, and imports.
    pub(crate) fn callable_candidates(&self, name: &str) -> Vec<FunctionId> {
        let mut out = Vec::new();
        if let Some(Imported::Function(fid)) = self.imports.get(name) {
            out.push(*fid);
        }
        let local_fqn = self.fqn(name);
        for &fid in self.funcs.by_name(name) {
            let Some(f) = self.funcs.get(fid) else { continue };
            if f.fully_qualified_name == name || f.fully_qualified_name == local_fqn {
                if !out.contains(&fid) {
                    out.push(fid);
                }
            }
        }
        out
    }

    fn compile_call(&mut self, node_id: NodeId, src: SourceLocation) -> CResult<Value> {
        let node = self.arena.get(node_id);
        let callee = node.callee.expect("call without callee");
        let arg_nodes: Vec<NodeId> = self
            .arena
            .iter_list(node.arguments)
            .map(|(id, _)| id)
            .collect();

        let mut args = Vec::with_capacity(arg_nodes.len());
        for a in arg_nodes {
            args.push(self.compile_expr(a)?);
        }
        let arg_types: Vec<TypeId> = args.iter().map(|v| v.ty).collect();

        let callee_node = self.arena.get(callee);
        match callee_node.kind {
            NodeKind::Identifier => {
                let name = self.node_text(callee);

                // Local holding a callable value: indirect call
                if let Some(sym) = self.scopes.lookup(&name) {
                    let target = sym.value.clone();
                    return self.compile_indirect_call(target, args, src);
                }

                let mut candidates = self.callable_candidates(&name);
                if candidates.is_empty() && self.templates.has_function(&name) {
                    if let Ok(fid) = self.instantiate_function_template(&name, &arg_types, src) {
                        candidates.push(fid);
                    }
                }
                let resolved = self.resolve_function(
                    &name,
                    &candidates,
                    None,
                    &arg_types,
                    MatchFlags::call_site(),
                    src,
                )?;
                self.emit_call(resolved, None, args, src)
            }
            NodeKind::Expression if callee_node.op == Some(OperatorKind::Member) => {
                let base = callee_node.lvalue.expect("method call without base");
                let method_name = self.ident_text(callee_node.identifier);

                // Module-qualified call: mod.f(...)
                if self.arena.get(base).kind == NodeKind::Identifier {
                    let base_name = self.node_text(base);
                    if let Some(Imported::Module(module_id)) = self.imports.get(&base_name) {
                        let module_id = *module_id;
                        if let Some(fid) = self.module_function_by_id(module_id, &method_name) {
                            let resolved = self.resolve_function(
                                &method_name,
                                &[fid],
                                None,
                                &arg_types,
                                MatchFlags::call_site(),
                                src,
                            )?;
                            return self.emit_call(resolved, None, args, src);
                        }
                    }
                }

                let object = self.compile_expr(base)?;
                let candidates = self.methods_named(object.ty, &method_name);
                if candidates.is_empty() {
                    let ty_name = self.type_name(object.ty);
                    return self.error(
                        CompileErrorKind::NoSuchMember(ty_name, method_name),
                        src,
                    );
                }
                self.call_method_on(object, &method_name, candidates, args, src)
            }
            _ => {
                // Arbitrary callable expression
                let target = self.compile_expr(callee)?;
                self.compile_indirect_call(target, args, src)
            }
        }
    }

    /// Resolve and invoke a method set on `object`.
    pub(crate) fn call_method_on(
        &mut self,
        object: Value,
        name: &str,
        candidates: Vec<(FunctionId, u32)>,
        args: Vec<Value>,
        src: SourceLocation,
    ) -> CResult<Value> {
        let ids: Vec<FunctionId> = candidates.iter().map(|(id, _)| *id).collect();
        let arg_types: Vec<TypeId> = args.iter().map(|v| v.ty).collect();
        let resolved = self.resolve_function(
            name,
            &ids,
            None,
            &arg_types,
            MatchFlags::call_site(),
            src,
        )?;
        let base_adjust = candidates
            .iter()
            .find(|(id, _)| *id == resolved)
            .map(|(_, off)| *off)
            .unwrap_or(0);

        let this = if base_adjust != 0 {
            let adjusted = self.fd().val(object.ty).as_pointer();
            let u64_ty = self.builtin("u64");
            self.emit(
                Instruction::new(Op::UAdd, src)
                    .with_op1(adjusted.clone())
                    .with_op2(object)
                    .with_op3(Value::imm_u(base_adjust as u64, u64_ty)),
            );
            adjusted
        } else {
            object
        };
        self.emit_call(resolved, Some(this), args, src)
    }

    fn call_index_operator(
        &mut self,
        object: Value,
        index: Value,
        store: Option<Value>,
        src: SourceLocation,
    ) -> CResult<Value> {
        let method = "operator []";
        let candidates = self.methods_named(object.ty, method);
        if candidates.is_empty() {
            let name = self.type_name(object.ty);
            return self.error(CompileErrorKind::NoSuchMember(name, method.to_string()), src);
        }
        let mut args = vec![index];
        if let Some(v) = store {
            args.push(v);
        }
        self.call_method_on(object, method, candidates, args, src)
    }

    /// Call through a function-typed value: a function reference or closure.
    fn compile_indirect_call(
        &mut self,
        target: Value,
        args: Vec<Value>,
        src: SourceLocation,
    ) -> CResult<Value> {
        let Some(sig) = self
            .types
            .resolve(target.ty)
            .and_then(|dt| dt.signature.clone())
        else {
            return self.error(CompileErrorKind::NotCallable, src);
        };
        let declared: Vec<TypeId> = sig.args.iter().map(|a| a.ty).collect();
        if declared.len() != args.len() {
            return self.error(CompileErrorKind::NoMatchingOverload("function value".into()), src);
        }
        for (arg, want) in args.into_iter().zip(declared) {
            let converted = self.convert_value(arg, want, src)?;
            self.emit(Instruction::new(Op::Param, src).with_op1(converted));
        }
        let result = sig.return_type.map(|ty| self.fd().val(ty));
        let mut call = Instruction::new(Op::Call, src).with_op1(target);
        if let Some(r) = &result {
            call = call.with_op2(r.clone());
        }
        self.emit(call);
        Ok(result.unwrap_or(Value::null(self.builtin("void"))))
    }

    /// Emit params and the call for a resolved function.
    pub(crate) fn emit_call(
        &mut self,
        fid: FunctionId,
        this: Option<Value>,
        args: Vec<Value>,
        src: SourceLocation,
    ) -> CResult<Value> {
        let (sig_ret, declared, sig_type, kind) = {
            let Some(f) = self.funcs.get(fid) else {
                return self.error(CompileErrorKind::UnknownSymbol(fid.to_string()), src);
            };
            (
                f.signature.return_type,
                f.explicit_arg_types(),
                f.sig_type,
                f.kind,
            )
        };

        if let Some(this) = this {
            debug_assert!(matches!(
                kind,
                FunctionKind::Method | FunctionKind::Constructor | FunctionKind::Destructor
            ));
            self.emit(Instruction::new(Op::Param, src).with_op1(this));
        }
        if declared.len() != args.len() {
            let name = self
                .funcs
                .get(fid)
                .map(|f| f.name.clone())
                .unwrap_or_default();
            return self.error(CompileErrorKind::NoMatchingOverload(name), src);
        }
        for (arg, want) in args.into_iter().zip(declared) {
            let converted = self.convert_value(arg, want, src)?;
            self.emit(Instruction::new(Op::Param, src).with_op1(converted));
        }

        let result = sig_ret.map(|ty| self.fd().val(ty));
        let mut call = Instruction::new(Op::Call, src).with_op1(Value::func(fid, sig_type));
        if let Some(r) = &result {
            call = call.with_op2(r.clone());
        }
        self.emit(call);
        Ok(result.unwrap_or(Value::null(self.builtin("void"))))
    }

    // ----- construction ----------------------------------------------------

    /// `new T(args)`: stack storage, constructor call, scoped teardown duty.
    fn compile_new(&mut self, node_id: NodeId, src: SourceLocation) -> CResult<Value> {
        let node = self.arena.get(node_id);
        let ty_node = node.data_type.expect("new without type");
        let arg_nodes: Vec<NodeId> = self
            .arena
            .iter_list(node.arguments)
            .map(|(id, _)| id)
            .collect();

        let ty = self.resolve_type(ty_node)?;
        let dt = match self.types.resolve(ty) {
            Some(dt) if !dt.meta.is_primitive => dt,
            Some(dt) => {
                let name = dt.name.clone();
                return self.error(
                    CompileErrorKind::NoImplicitConversion(name, "a class type".into()),
                    src,
                );
            }
            None => return self.error(CompileErrorKind::UnknownType("new target".into()), src),
        };
        let size = dt.size().max(1);
        let trivially_constructible = dt.meta.is_trivially_constructible;
        let concrete_ty = dt.id;
        let destructor = dt.destructor;

        let mut args = Vec::with_capacity(arg_nodes.len());
        for a in arg_nodes {
            args.push(self.compile_expr(a)?);
        }

        let storage = self.fd().stack(concrete_ty, size, src).heap();
        self.scopes.add_alloc(storage.clone());

        let ctors = self.methods_named(concrete_ty, "constructor");
        if ctors.is_empty() {
            if !args.is_empty() || !trivially_constructible {
                let name = self.type_name(concrete_ty);
                return self.error(CompileErrorKind::NoDefaultConstructor(name), src);
            }
        } else {
            self.call_method_on(storage.clone(), "constructor", ctors, args, src)?;
        }

        if let Some(dtor) = destructor {
            self.scopes.add_dtor_duty(storage.clone(), dtor);
        }
        Ok(storage)
    }

    fn compile_array_literal(&mut self, node_id: NodeId) -> CResult<Value> {
        let node = self.arena.get(node_id);
        let src = node.loc;
        let elem_nodes: Vec<NodeId> = self
            .arena
            .iter_list(node.arguments)
            .map(|(id, _)| id)
            .collect();

        let mut elems = Vec::with_capacity(elem_nodes.len());
        for e in elem_nodes {
            elems.push(self.compile_expr(e)?);
        }
        let Some(first) = elems.first() else {
            return self.error(CompileErrorKind::UnknownType("array".into()), src);
        };
        let elem_ty = first.ty;

        // Requires a bound `array<T>` template with `push`
        let array_ty = self.instantiate_class_template("array", &[elem_ty], src)?;
        let size = self.types.resolve(array_ty).map(|t| t.size()).unwrap_or(8);
        let storage = self.fd().stack(array_ty, size, src);
        self.scopes.add_alloc(storage.clone());

        let ctors = self.methods_named(array_ty, "constructor");
        if !ctors.is_empty() {
            self.call_method_on(storage.clone(), "constructor", ctors, Vec::new(), src)?;
        }
        if let Some(dtor) = self.types.resolve(array_ty).and_then(|t| t.destructor) {
            self.scopes.add_dtor_duty(storage.clone(), dtor);
        }
        for elem in elems {
            let pushers = self.methods_named(array_ty, "push");
            if pushers.is_empty() {
                let name = self.type_name(array_ty);
                return self.error(
                    CompileErrorKind::NoSuchMember(name, "push".to_string()),
                    src,
                );
            }
            self.call_method_on(storage.clone(), "push", pushers, vec![elem], src)?;
        }
        Ok(storage)
    }

    // ----- cross-module helpers --------------------------------------------

    pub(crate) fn module_slot_by_id(
        &self,
        module: tern_ffi::ModuleId,
        name: &str,
    ) -> Option<(u32, TypeId)> {
        let m = self.find_module_by_id(module)?;
        let slot = m.find_slot(name)?;
        let ty = m.slot(slot)?.ty;
        Some((slot, ty))
    }

    pub(crate) fn module_function_by_id(
        &self,
        module: tern_ffi::ModuleId,
        name: &str,
    ) -> Option<FunctionId> {
        let m = self.find_module_by_id(module)?;
        m.functions
            .iter()
            .copied()
            .find(|fid| {
                self.funcs
                    .get(*fid)
                    .map(|f| f.name == name && f.access == tern_ffi::AccessModifier::Public)
                    .unwrap_or(false)
            })
    }

    fn find_module_by_id(&self, id: tern_ffi::ModuleId) -> Option<&tern_ffi::Module> {
        let path = self.module_paths.get(&id)?;
        self.lookup.find_module(path)
    }
}
