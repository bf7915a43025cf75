//! Type resolution, implicit conversions, and overload matching.

use super::{Compiler, CResult, Imported};
use crate::error::CompileErrorKind;
use crate::ir::{Instruction, Op, Value};
use tern_ffi::{AccessModifier, FunctionId, FunctionSignature, TypeId};
use tern_parser::{NodeId, SourceLocation};

/// Degree of an implicit conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conversion {
    Exact,
    /// One standard conversion (numeric widening/narrowing, enum to integer,
    /// null to pointer, derived to base).
    Standard,
    None,
}

/// Matching options for function resolution.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchFlags {
    /// Compare only user-visible arguments (default at call sites).
    pub skip_implicit_args: bool,
    /// Ignore arguments entirely (match by name/return only).
    pub ignore_args: bool,
    /// Require an exact return type.
    pub strict_return: bool,
    /// Require exact argument types.
    pub strict_args: bool,
    /// Drop private candidates (calls from outside the owning class).
    pub exclude_private: bool,
}

impl MatchFlags {
    pub fn call_site() -> Self {
        Self {
            skip_implicit_args: true,
            exclude_private: true,
            ..Default::default()
        }
    }
}

impl<'a> Compiler<'a> {
    // ----- type resolution ------------------------------------------------

    /// Resolve a `TypeIdentifier` node to a registered type.
    pub(crate) fn resolve_type(&mut self, node_id: NodeId) -> CResult<TypeId> {
        let node = self.arena.get(node_id);
        let src = node.loc;

        // Function signature form: `(A, B) => R`
        if node.text.is_none() {
            let param_nodes: Vec<NodeId> = self
                .arena
                .iter_list(node.parameters)
                .map(|(id, _)| id)
                .collect();
            let Some(ret_node) = node.data_type else {
                return self.error(CompileErrorKind::UnknownType("function type".into()), src);
            };
            let mut args = Vec::new();
            for p in param_nodes {
                let ty = self.resolve_type(p)?;
                let by_pointer = !self
                    .types
                    .resolve(ty)
                    .map(|t| t.is_register_sized())
                    .unwrap_or(false);
                args.push(if by_pointer {
                    tern_ffi::Argument::pointer(ty)
                } else {
                    tern_ffi::Argument::value(ty)
                });
            }
            let ret = self.resolve_type(ret_node)?;
            let void = self.builtin("void");
            let sig = FunctionSignature::new(if ret == void { None } else { Some(ret) }, args);
            return Ok(self.types.signature_type(&sig));
        }

        let name = node.text.clone().unwrap_or_default();
        let arg_nodes: Vec<NodeId> = self
            .arena
            .iter_list(node.arguments)
            .map(|(id, _)| id)
            .collect();

        if !arg_nodes.is_empty() {
            // Template instantiation
            let mut args = Vec::new();
            for a in arg_nodes {
                args.push(self.resolve_type(a)?);
            }
            return self.instantiate_class_template(&name, &args, src);
        }

        self.resolve_named_type(&name, src)
    }

    pub(crate) fn resolve_named_type(&mut self, name: &str, src: SourceLocation) -> CResult<TypeId> {
        // Template parameter bindings shadow everything
        if let Some(ty) = self.scopes.lookup_type_alias(name) {
            return Ok(ty);
        }
        // Imported types
        if let Some(Imported::Type(ty)) = self.imports.get(name) {
            return Ok(*ty);
        }
        // Module-local types
        let fqn = self.fqn(name);
        if let Some(dt) = self.types.by_fqn(&fqn) {
            return Ok(dt.id);
        }
        // Builtins and host types register under their bare name
        if let Some(dt) = self.types.by_fqn(name) {
            return Ok(dt.id);
        }
        // A known template used without arguments
        if self.templates.has_class(name) {
            return self.error(CompileErrorKind::SubtypeRequired(name.to_string()), src);
        }
        self.error(CompileErrorKind::UnknownType(name.to_string()), src)
    }

    // ----- conversions ----------------------------------------------------

    /// Classify the implicit conversion from `from` to `to`.
    pub(crate) fn conversion(&self, from: TypeId, to: TypeId) -> Conversion {
        let Some(from_dt) = self.types.resolve(from) else {
            return Conversion::None;
        };
        let Some(to_dt) = self.types.resolve(to) else {
            return Conversion::None;
        };
        if from_dt.id == to_dt.id {
            return Conversion::Exact;
        }

        let null_ty = TypeId::from_fqn("null");
        if from_dt.id == null_ty && !to_dt.meta.is_primitive {
            return Conversion::Standard;
        }

        // Numeric lattice: every primitive-or-enum number converts
        let from_numeric = from_dt.meta.is_primitive || from_dt.meta.is_integral;
        let to_numeric = to_dt.meta.is_primitive;
        if from_numeric && to_numeric {
            // Integer into enum is not implicit
            return Conversion::Standard;
        }

        // Derived class pointer to base class pointer
        if self.base_offset(from_dt.id, to_dt.id).is_some() {
            return Conversion::Standard;
        }

        Conversion::None
    }

    /// Byte offset of base `base` within `derived`, walking the base chain.
    pub(crate) fn base_offset(&self, derived: TypeId, base: TypeId) -> Option<u32> {
        let dt = self.types.resolve(derived)?;
        for b in &dt.bases {
            if self.types.resolve(b.ty).map(|t| t.id) == self.types.resolve(base).map(|t| t.id) {
                return Some(b.offset);
            }
            if let Some(inner) = self.base_offset(b.ty, base) {
                return Some(b.offset + inner);
            }
        }
        None
    }

    /// Emit the conversion of `value` to `to`, or fail with a diagnostic.
    pub(crate) fn convert_value(
        &mut self,
        value: Value,
        to: TypeId,
        src: SourceLocation,
    ) -> CResult<Value> {
        match self.conversion(value.ty, to) {
            Conversion::Exact => Ok(value),
            Conversion::Standard => {
                // Base-class adjustment keeps the pointer shape
                if let Some(offset) = self.base_offset(value.ty, to) {
                    if offset == 0 {
                        let mut v = value;
                        v.ty = to;
                        return Ok(v);
                    }
                    let dst = self.fd().val(to).as_pointer();
                    let u64_ty = self.builtin("u64");
                    self.emit(
                        Instruction::new(Op::UAdd, src)
                            .with_op1(dst.clone())
                            .with_op2(value)
                            .with_op3(Value::imm_u(offset as u64, u64_ty)),
                    );
                    return Ok(dst);
                }
                let dst = self.fd().convert(&value, to, src);
                Ok(dst)
            }
            Conversion::None => {
                let from_name = self.type_name(value.ty);
                let to_name = self.type_name(to);
                self.error(CompileErrorKind::NoImplicitConversion(from_name, to_name), src)
            }
        }
    }

    pub(crate) fn type_name(&self, ty: TypeId) -> String {
        self.types
            .get(ty)
            .map(|t| t.name.clone())
            .unwrap_or_else(|| ty.to_string())
    }

    /// Whether converting `from` into `to` can drop information.
    pub(crate) fn is_narrowing(&self, from: TypeId, to: TypeId) -> bool {
        let (Some(f), Some(t)) = (self.types.resolve(from), self.types.resolve(to)) else {
            return false;
        };
        if !f.meta.is_primitive || !t.meta.is_primitive {
            return false;
        }
        if f.meta.is_floating_point && !t.meta.is_floating_point {
            return true;
        }
        t.meta.size < f.meta.size
    }

    // ----- overload resolution --------------------------------------------

    /// Pick the unique best candidate for a call.
    ///
    /// Non-strict matching permits one standard conversion per argument and
    /// return; two candidates at the same (minimal) cost are ambiguous.
    pub(crate) fn resolve_function(
        &mut self,
        name: &str,
        candidates: &[FunctionId],
        ret: Option<TypeId>,
        arg_types: &[TypeId],
        flags: MatchFlags,
        src: SourceLocation,
    ) -> CResult<FunctionId> {
        let mut best: Option<(u32, FunctionId)> = None;
        let mut tied = false;
        let mut saw_candidate = false;

        for &fid in candidates {
            let Some(func) = self.funcs.get(fid) else { continue };
            // Private methods resolve only from their own class; private
            // free functions are already scoped by candidate collection.
            if flags.exclude_private
                && func.access == AccessModifier::Private
                && func.this_type.is_some()
                && func.this_type != self.current_class
            {
                continue;
            }
            if func.access == AccessModifier::Trusted && !self.trusted {
                continue;
            }
            saw_candidate = true;

            let mut cost = 0u32;
            if !flags.ignore_args {
                let declared: Vec<TypeId> = if flags.skip_implicit_args {
                    func.explicit_arg_types()
                } else {
                    func.signature.args.iter().map(|a| a.ty).collect()
                };
                if declared.len() != arg_types.len() {
                    continue;
                }
                let mut feasible = true;
                for (have, want) in arg_types.iter().zip(declared.iter()) {
                    match self.conversion(*have, *want) {
                        Conversion::Exact => {}
                        Conversion::Standard if !flags.strict_args => cost += 1,
                        _ => {
                            feasible = false;
                            break;
                        }
                    }
                }
                if !feasible {
                    continue;
                }
            }

            if let Some(want_ret) = ret {
                match func.signature.return_type {
                    Some(have_ret) => match self.conversion(have_ret, want_ret) {
                        Conversion::Exact => {}
                        Conversion::Standard if !flags.strict_return => cost += 1,
                        _ => continue,
                    },
                    None => continue,
                }
            }

            match best {
                None => best = Some((cost, fid)),
                Some((best_cost, _)) if cost < best_cost => {
                    best = Some((cost, fid));
                    tied = false;
                }
                Some((best_cost, best_id)) if cost == best_cost && best_id != fid => {
                    tied = true;
                }
                _ => {}
            }
        }

        match best {
            Some((_, fid)) if !tied => Ok(fid),
            Some(_) => self.error(CompileErrorKind::AmbiguousOverload(name.to_string()), src),
            None if saw_candidate => {
                self.error(CompileErrorKind::NoMatchingOverload(name.to_string()), src)
            }
            None if candidates.is_empty() => {
                self.error(CompileErrorKind::UnknownSymbol(name.to_string()), src)
            }
            None => self.error(CompileErrorKind::AccessDenied(name.to_string()), src),
        }
    }

    /// Methods named `name` on `ty` and its bases, paired with the `this`
    /// adjustment needed to call them.
    pub(crate) fn methods_named(&self, ty: TypeId, name: &str) -> Vec<(FunctionId, u32)> {
        let mut out = Vec::new();
        self.collect_methods(ty, name, 0, &mut out);
        out
    }

    fn collect_methods(&self, ty: TypeId, name: &str, offset: u32, out: &mut Vec<(FunctionId, u32)>) {
        let Some(dt) = self.types.resolve(ty) else { return };
        for &m in &dt.methods {
            if let Some(f) = self.funcs.get(m) {
                if f.name == name {
                    out.push((m, offset));
                }
            }
        }
        for b in &dt.bases {
            self.collect_methods(b.ty, name, offset + b.offset, out);
        }
    }
}
