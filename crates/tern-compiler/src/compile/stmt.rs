//! Statement compilation: control flow, declarations, and scope teardown.

use super::{Compiler, CResult, LocalSymbol, ScopeKind, SymbolLifetime};
use crate::error::{CompileErrorKind, CompileWarning};
use crate::ir::{AllocId, Instruction, Op, Value, ValueKind};
use tern_ffi::AccessModifier;
use tern_parser::{NodeId, NodeKind, SourceLocation};

impl<'a> Compiler<'a> {
    /// Compile the statements of a `Block` node without opening a scope
    /// (used for function bodies, whose scope is the function scope).
    pub(crate) fn compile_block_body(&mut self, block: NodeId) -> CResult<()> {
        let mut cursor = self.arena.get(block).body;
        let mut terminated = false;
        while let Some(stmt) = cursor {
            cursor = self.arena.get(stmt).next;
            if terminated {
                let loc = self.arena.get(stmt).loc;
                self.warn(CompileWarning::UnreachableCode, loc);
                break;
            }
            self.compile_stmt(stmt)?;
            terminated = self
                .fd_ref()
                .code
                .last()
                .map(|i| matches!(i.op, Op::Ret | Op::Term))
                .unwrap_or(false);
        }
        Ok(())
    }

    pub(crate) fn compile_stmt(&mut self, node_id: NodeId) -> CResult<()> {
        let node = self.arena.get(node_id);
        let src = node.loc;
        match node.kind {
            NodeKind::Block => {
                self.scopes.push(ScopeKind::Block);
                let result = self.compile_block_body(node_id);
                self.close_scope(src, result.is_ok());
                result
            }
            NodeKind::VariableDecl => self.compile_variable_decl(node_id, false),
            NodeKind::If => self.compile_if(node_id, src),
            NodeKind::While => self.compile_while(node_id, src),
            NodeKind::DoWhile => self.compile_do_while(node_id, src),
            NodeKind::For => self.compile_for(node_id, src),
            NodeKind::Switch => self.compile_switch(node_id, src),
            NodeKind::Return => {
                let value_node = node.rvalue;
                let value = match value_node {
                    Some(v) => Some(self.compile_expr(v)?),
                    None => None,
                };
                self.emit_return(value, src)
            }
            NodeKind::Break => {
                let Some((loop_scope, _, break_label)) = self.scopes.innermost_loop() else {
                    return self.error(CompileErrorKind::NotInLoop("break"), src);
                };
                self.emit_teardown_from(loop_scope, None, src);
                self.emit(Instruction::new(Op::Jump, src).with_label(0, break_label));
                Ok(())
            }
            NodeKind::Continue => {
                let Some((loop_scope, continue_label, _)) = self.scopes.innermost_loop() else {
                    return self.error(CompileErrorKind::NotInLoop("continue"), src);
                };
                self.emit_teardown_from(loop_scope, None, src);
                self.emit(Instruction::new(Op::Jump, src).with_label(0, continue_label));
                Ok(())
            }
            NodeKind::Delete => self.compile_delete(node_id, src),
            NodeKind::Empty => Ok(()),
            _ => {
                // Expression statement
                self.compile_expr(node_id)?;
                Ok(())
            }
        }
    }

    /// Top-level statement inside `$init`: variable declarations become
    /// module data slots; everything else compiles normally.
    pub(crate) fn compile_module_level_stmt(&mut self, node_id: NodeId) -> CResult<()> {
        if self.arena.get(node_id).kind == NodeKind::VariableDecl {
            return self.compile_variable_decl(node_id, true);
        }
        self.compile_stmt(node_id)
    }

    // ----- declarations ---------------------------------------------------

    fn compile_variable_decl(&mut self, node_id: NodeId, module_level: bool) -> CResult<()> {
        let node = self.arena.get(node_id);
        let src = node.loc;
        let name = self.ident_text(node.identifier);
        let is_const = node.flags.is_const;
        let ty_node = node.data_type;
        let init_node = node.initializer;

        // The declared type, or the initializer's type
        let declared_ty = match ty_node {
            Some(t) => Some(self.resolve_type(t)?),
            None => None,
        };

        let init = match init_node {
            Some(i) => Some(self.compile_expr(i)?),
            None => None,
        };

        let ty = match (declared_ty, &init) {
            (Some(t), _) => t,
            (None, Some(v)) => v.ty,
            (None, None) => {
                return self.error(CompileErrorKind::UnknownType(name), src);
            }
        };

        if module_level {
            return self.declare_module_data(&name, ty, init, is_const, src);
        }

        let primitive = self
            .types
            .resolve(ty)
            .map(|t| t.is_register_sized())
            .unwrap_or(false);

        let value = if primitive {
            let reg = self.fd().val(ty).named(&name);
            if let Some(init) = init {
                let converted = self.convert_value(init, ty, src)?;
                self.emit(
                    Instruction::new(Op::Cvt, src)
                        .with_op1(reg.clone())
                        .with_op2(converted),
                );
            }
            let mut v = reg;
            v.flags.writable = !is_const;
            v
        } else {
            // Object local: adopt a freshly constructed value, or default
            // construct
            match init {
                Some(v) if v.stack_ref.is_some() && v.ty == ty => {
                    let mut adopted = v.named(&name);
                    adopted.flags.is_heap = false;
                    adopted
                }
                Some(v) => {
                    let from = self.type_name(v.ty);
                    let to = self.type_name(ty);
                    return self.error(CompileErrorKind::NoImplicitConversion(from, to), src);
                }
                None => {
                    let (size, trivially, dtor) = match self.types.resolve(ty) {
                        Some(dt) => (dt.size().max(1), dt.meta.is_trivially_constructible, dt.destructor),
                        None => return self.error(CompileErrorKind::UnknownType(name), src),
                    };
                    let storage = self.fd().stack(ty, size, src).named(&name);
                    self.scopes.add_alloc(storage.clone());
                    let ctors = self.methods_named(ty, "constructor");
                    if ctors.is_empty() {
                        if !trivially {
                            let tn = self.type_name(ty);
                            return self.error(CompileErrorKind::NoDefaultConstructor(tn), src);
                        }
                    } else {
                        self.call_method_on(storage.clone(), "constructor", ctors, Vec::new(), src)?;
                    }
                    if let Some(dtor) = dtor {
                        self.scopes.add_dtor_duty(storage.clone(), dtor);
                    }
                    storage
                }
            }
        };

        if self
            .scopes
            .declare(LocalSymbol {
                name: name.clone(),
                value,
                is_const,
                decl_src: src,
            })
            .is_err()
        {
            return self.error(CompileErrorKind::DuplicateDeclaration(name), src);
        }
        Ok(())
    }

    fn declare_module_data(
        &mut self,
        name: &str,
        ty: tern_ffi::TypeId,
        init: Option<Value>,
        is_const: bool,
        src: SourceLocation,
    ) -> CResult<()> {
        if self.module_symbols.contains_key(name) {
            return self.error(CompileErrorKind::DuplicateDeclaration(name.to_string()), src);
        }
        let size = self.types.resolve(ty).map(|t| t.size().max(1)).unwrap_or(8);
        let access = if is_const {
            AccessModifier::Private
        } else {
            AccessModifier::Public
        };
        let slot = self.module.add_data_slot(name, ty, size, access);
        let cell = Value::module_data(self.module.id, slot, ty);
        self.module_symbols.insert(name.to_string(), cell.clone());

        if let Some(init) = init {
            let converted = self.convert_value(init, ty, src)?;
            self.emit(
                Instruction::new(Op::Store, src)
                    .with_op1(converted)
                    .with_op2(cell),
            );
        }
        Ok(())
    }

    // ----- control flow ---------------------------------------------------

    fn compile_if(&mut self, node_id: NodeId, src: SourceLocation) -> CResult<()> {
        let node = self.arena.get(node_id);
        let cond = node.condition.expect("if without condition");
        let body = node.body.expect("if without body");
        let else_body = node.else_body;

        let else_label = self.fd().label();
        let end_label = self.fd().label();
        self.emit(
            Instruction::new(Op::MetaIf, src)
                .with_label(0, else_label)
                .with_label(1, end_label),
        );

        let c = self.compile_expr(cond)?;
        let c = self.truthy(c, src)?;
        self.emit(
            Instruction::new(Op::Branch, src)
                .with_op1(c)
                .with_label(0, else_label),
        );

        self.compile_stmt(body)?;
        if else_body.is_some() {
            self.emit(Instruction::new(Op::Jump, src).with_label(0, end_label));
        }
        self.fd().place_label(else_label, src);
        if let Some(else_body) = else_body {
            self.compile_stmt(else_body)?;
        }
        self.fd().place_label(end_label, src);
        Ok(())
    }

    fn compile_while(&mut self, node_id: NodeId, src: SourceLocation) -> CResult<()> {
        let node = self.arena.get(node_id);
        let cond = node.condition.expect("while without condition");
        let body = node.body.expect("while without body");

        let head_label = self.fd().label();
        let end_label = self.fd().label();
        self.emit(
            Instruction::new(Op::MetaWhile, src)
                .with_label(0, head_label)
                .with_label(1, end_label),
        );

        self.fd().place_label(head_label, src);
        let c = self.compile_expr(cond)?;
        let c = self.truthy(c, src)?;
        self.emit(
            Instruction::new(Op::Branch, src)
                .with_op1(c)
                .with_label(0, end_label),
        );

        self.scopes.push(ScopeKind::Loop {
            continue_label: head_label,
            break_label: end_label,
        });
        let result = self.compile_stmt(body);
        self.close_scope(src, result.is_ok());
        result?;

        self.emit(Instruction::new(Op::Jump, src).with_label(0, head_label));
        self.fd().place_label(end_label, src);
        Ok(())
    }

    fn compile_do_while(&mut self, node_id: NodeId, src: SourceLocation) -> CResult<()> {
        let node = self.arena.get(node_id);
        let cond = node.condition.expect("do-while without condition");
        let body = node.body.expect("do-while without body");

        let head_label = self.fd().label();
        let cond_label = self.fd().label();
        let end_label = self.fd().label();
        self.emit(
            Instruction::new(Op::MetaDoWhile, src)
                .with_label(0, head_label)
                .with_label(1, end_label),
        );

        self.fd().place_label(head_label, src);
        self.scopes.push(ScopeKind::Loop {
            continue_label: cond_label,
            break_label: end_label,
        });
        let result = self.compile_stmt(body);
        self.close_scope(src, result.is_ok());
        result?;

        self.fd().place_label(cond_label, src);
        let c = self.compile_expr(cond)?;
        let c = self.truthy(c, src)?;
        self.emit(
            Instruction::new(Op::Branch, src)
                .with_op1(c)
                .with_label(0, end_label),
        );
        self.emit(Instruction::new(Op::Jump, src).with_label(0, head_label));
        self.fd().place_label(end_label, src);
        Ok(())
    }

    fn compile_for(&mut self, node_id: NodeId, src: SourceLocation) -> CResult<()> {
        let node = self.arena.get(node_id);
        let init = node.initializer;
        let cond = node.condition;
        let step = node.modifier;
        let body = node.body.expect("for without body");

        // The initializer's scope encloses the whole loop
        self.scopes.push(ScopeKind::Block);
        let result = (|c: &mut Self| -> CResult<()> {
            if let Some(init) = init {
                match c.arena.get(init).kind {
                    NodeKind::VariableDecl => c.compile_variable_decl(init, false)?,
                    _ => {
                        c.compile_expr(init)?;
                    }
                }
            }

            let head_label = c.fd().label();
            let step_label = c.fd().label();
            let end_label = c.fd().label();
            c.emit(
                Instruction::new(Op::MetaFor, src)
                    .with_label(0, head_label)
                    .with_label(1, end_label),
            );

            c.fd().place_label(head_label, src);
            if let Some(cond) = cond {
                let v = c.compile_expr(cond)?;
                let v = c.truthy(v, src)?;
                c.emit(
                    Instruction::new(Op::Branch, src)
                        .with_op1(v)
                        .with_label(0, end_label),
                );
            }

            c.scopes.push(ScopeKind::Loop {
                continue_label: step_label,
                break_label: end_label,
            });
            let body_result = c.compile_stmt(body);
            c.close_scope(src, body_result.is_ok());
            body_result?;

            c.fd().place_label(step_label, src);
            if let Some(step) = step {
                c.compile_expr(step)?;
            }
            c.emit(Instruction::new(Op::Jump, src).with_label(0, head_label));
            c.fd().place_label(end_label, src);
            Ok(())
        })(self);
        self.close_scope(src, result.is_ok());
        result
    }

    fn compile_switch(&mut self, node_id: NodeId, src: SourceLocation) -> CResult<()> {
        let node = self.arena.get(node_id);
        let value_node = node.condition.expect("switch without value");
        let cases: Vec<NodeId> = self.arena.iter_list(node.body).map(|(id, _)| id).collect();

        let value = self.compile_expr(value_node)?;
        let end_label = self.fd().label();

        // Dispatch chain: one comparison per case, default last
        let mut case_labels = Vec::with_capacity(cases.len());
        let mut default_label = None;
        for &case in &cases {
            let label = self.fd().label();
            case_labels.push(label);
            if self.arena.get(case).condition.is_none() {
                default_label = Some(label);
            }
        }

        for (&case, &label) in cases.iter().zip(&case_labels) {
            let Some(cond) = self.arena.get(case).condition else { continue };
            let case_value = self.compile_expr(cond)?;
            let matched = self.compile_binary_values(
                tern_parser::OperatorKind::Eq,
                value.clone(),
                case_value,
                src,
            )?;
            // Falls through to the next comparison when the case mismatches
            let next_check = self.fd().label();
            self.emit(
                Instruction::new(Op::Branch, src)
                    .with_op1(matched)
                    .with_label(0, next_check),
            );
            self.emit(Instruction::new(Op::Jump, src).with_label(0, label));
            self.fd().place_label(next_check, src);
        }
        match default_label {
            Some(label) => self.emit(Instruction::new(Op::Jump, src).with_label(0, label)),
            None => self.emit(Instruction::new(Op::Jump, src).with_label(0, end_label)),
        }

        // Case bodies; `break` targets the end label
        self.scopes.push(ScopeKind::Loop {
            continue_label: end_label,
            break_label: end_label,
        });
        let result = (|c: &mut Self| -> CResult<()> {
            for (&case, &label) in cases.iter().zip(&case_labels) {
                c.fd().place_label(label, src);
                let mut cursor = c.arena.get(case).body;
                while let Some(stmt) = cursor {
                    cursor = c.arena.get(stmt).next;
                    c.compile_stmt(stmt)?;
                }
            }
            Ok(())
        })(self);
        self.close_scope(src, result.is_ok());
        result?;

        self.fd().place_label(end_label, src);
        Ok(())
    }

    fn compile_delete(&mut self, node_id: NodeId, src: SourceLocation) -> CResult<()> {
        let node = self.arena.get(node_id);
        let target = node.rvalue.expect("delete without operand");
        let value = self.compile_expr(target)?;

        // Only values whose provenance is a `new` expression may be deleted
        let Some(alloc) = value.stack_ref else {
            return self.error(CompileErrorKind::IllegalDelete, src);
        };
        if !value.flags.is_heap {
            // Adopted locals lose the flag; check the place itself
            let is_new_local = matches!(
                self.arena.get(target).kind,
                NodeKind::Identifier
            ) && self
                .scopes
                .lookup(&self.node_text(target))
                .map(|s| s.value.stack_ref == Some(alloc))
                .unwrap_or(false);
            if !is_new_local {
                return self.error(CompileErrorKind::IllegalDelete, src);
            }
        }

        // Run the destructor and free the storage now; cancel the scope duty
        let dtor = self.types.resolve(value.ty).and_then(|t| t.destructor);
        self.scopes.release_alloc(alloc);
        if let Some(dtor) = dtor {
            self.emit_call(dtor, Some(value.clone()), Vec::new(), src)?;
        }
        self.emit(Instruction::new(Op::StackFree, src).with_op1(value));
        Ok(())
    }

    // ----- teardown and returns -------------------------------------------

    /// Emit destructor calls and frees for scopes `[from_scope ..]`, without
    /// popping them. `exempt` skips one allocation whose ownership moves out.
    pub(crate) fn emit_teardown_from(
        &mut self,
        from_scope: usize,
        exempt: Option<AllocId>,
        src: SourceLocation,
    ) {
        let mut duties = Vec::new();
        let mut frees = Vec::new();
        for i in (from_scope..self.scopes.depth()).rev() {
            let scope = self.scopes.scope(i);
            for duty in scope.dtors.iter().rev() {
                if exempt.is_some() && duty.object.stack_ref == exempt {
                    continue;
                }
                duties.push((duty.object.clone(), duty.dtor));
            }
            for alloc in scope.allocs.iter().rev() {
                if exempt.is_some() && alloc.stack_ref == exempt {
                    continue;
                }
                frees.push(alloc.clone());
            }
        }
        for (object, dtor) in duties {
            let _ = self.emit_call(dtor, Some(object), Vec::new(), src);
        }
        for alloc in frees {
            self.emit(Instruction::new(Op::StackFree, src).with_op1(alloc));
        }
    }

    /// Tear down the innermost scope and pop it. `emit` controls whether
    /// teardown code is emitted (skipped when the body already failed).
    pub(crate) fn close_scope(&mut self, src: SourceLocation, emit: bool) {
        if emit {
            let top = self.scopes.depth().saturating_sub(1);
            self.emit_teardown_from(top, None, src);
        }
        // Record symbol lifetimes for the debug table
        let end = self
            .fd_ref()
            .code
            .last()
            .map(|i| i.src)
            .unwrap_or(src);
        if let Some(scope) = self.scopes.top() {
            let mut lifetimes = Vec::new();
            for sym in scope.symbols() {
                lifetimes.push(SymbolLifetime {
                    name: sym.name.clone(),
                    reg: sym.value.reg_id(),
                    begin: sym.decl_src,
                    end,
                });
            }
            self.symbol_lifetimes.extend(lifetimes);
        }
        self.scopes.pop();
    }

    /// Compile a `return`: convert the value, tear every scope down (the
    /// returned stack slot is exempt, ownership transfers to the caller),
    /// and emit `ret`.
    pub(crate) fn emit_return(&mut self, value: Option<Value>, src: SourceLocation) -> CResult<()> {
        let value = match value {
            Some(v) => {
                // Infer the return type from the first return statement
                let declared = self.fd_ref().return_type;
                match declared {
                    Some(ty) => Some(self.convert_value(v, ty, src)?),
                    None if !self.fd_ref().return_type_explicit => {
                        let ty = v.ty;
                        self.fd().set_return_type(Some(ty), false);
                        Some(v)
                    }
                    None => {
                        let kind = self.fd_ref().kind;
                        let what = match kind {
                            tern_ffi::FunctionKind::Constructor => "a constructor",
                            tern_ffi::FunctionKind::Destructor => "a destructor",
                            _ => "a void function",
                        };
                        return self.error(CompileErrorKind::VoidReturnValue(what), src);
                    }
                }
            }
            None => None,
        };

        let exempt = value.as_ref().and_then(|v| v.stack_ref);
        self.emit_teardown_from(0, exempt, src);
        if let Some(exempt) = exempt {
            self.scopes.release_alloc(exempt);
        }

        let mut ret = Instruction::new(Op::Ret, src);
        if let Some(v) = value {
            // Poison results still terminate cleanly
            if !matches!(v.kind, ValueKind::Poison) {
                ret = ret.with_op1(v);
            }
        }
        self.emit(ret);
        Ok(())
    }
}
