//! Registered functions.

use crate::call::HostFn;
use crate::types::{FunctionId, FunctionSignature, TypeId};
use crate::AccessModifier;

/// What a function is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Function,
    Method,
    Constructor,
    Destructor,
}

/// One registered function: script-defined, host-bound, or both (a script
/// function with a host fast path). A function with neither IR nor a host
/// wrapper is invalid and the registry rejects it.
#[derive(Clone)]
pub struct Function {
    pub id: FunctionId,
    pub name: String,
    pub fully_qualified_name: String,
    pub kind: FunctionKind,
    pub access: AccessModifier,
    pub signature: FunctionSignature,
    /// The function-signature `DataType` this signature interned to.
    pub sig_type: TypeId,
    pub this_type: Option<TypeId>,
    /// `this` adjustment for methods inherited through a non-first base.
    pub base_offset: u32,
    /// Leading arguments hidden from user-visible signatures (context
    /// pointer, `this`).
    pub implicit_args: u8,
    /// Host wrapper; `None` means pure script function.
    pub host_fn: Option<HostFn>,
    /// Entry address into the encoded program, set by the backend.
    pub entry: Option<u32>,
}

impl Function {
    pub fn new(
        name: impl Into<String>,
        fqn: impl Into<String>,
        kind: FunctionKind,
        signature: FunctionSignature,
        sig_type: TypeId,
    ) -> Self {
        let name = name.into();
        let fqn = fqn.into();
        let id = FunctionId(crc32fast::hash(
            format!("{}:{}", fqn, signature.render()).as_bytes(),
        ));
        Self {
            id,
            name,
            fully_qualified_name: fqn,
            kind,
            access: AccessModifier::Public,
            signature,
            sig_type,
            this_type: None,
            base_offset: 0,
            implicit_args: 0,
            host_fn: None,
            entry: None,
        }
    }

    pub fn is_host(&self) -> bool {
        self.host_fn.is_some()
    }

    pub fn is_script(&self) -> bool {
        self.host_fn.is_none()
    }

    pub fn is_method(&self) -> bool {
        matches!(
            self.kind,
            FunctionKind::Method | FunctionKind::Constructor | FunctionKind::Destructor
        )
    }

    /// Argument types visible at a call site.
    pub fn explicit_arg_types(&self) -> Vec<TypeId> {
        self.signature
            .args
            .iter()
            .skip(self.implicit_args as usize)
            .map(|a| a.ty)
            .collect()
    }
}

impl std::fmt::Debug for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Function")
            .field("id", &self.id)
            .field("fqn", &self.fully_qualified_name)
            .field("kind", &self.kind)
            .field("access", &self.access)
            .field("signature", &self.signature)
            .field("this_type", &self.this_type)
            .field("implicit_args", &self.implicit_args)
            .field("host", &self.is_host())
            .field("entry", &self.entry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Argument;

    #[test]
    fn id_depends_on_signature() {
        let i32_id = TypeId::from_fqn("i32");
        let f32_id = TypeId::from_fqn("f32");
        let sig_a = FunctionSignature::new(None, vec![Argument::value(i32_id)]);
        let sig_b = FunctionSignature::new(None, vec![Argument::value(f32_id)]);
        let st = TypeId::from_fqn("sig");
        let a = Function::new("f", "mod::f", FunctionKind::Function, sig_a, st);
        let b = Function::new("f", "mod::f", FunctionKind::Function, sig_b, st);
        assert_ne!(a.id, b.id, "overloads must get distinct ids");
    }

    #[test]
    fn explicit_args_skip_implicit_prefix() {
        let i32_id = TypeId::from_fqn("i32");
        let void_id = TypeId::from_fqn("void");
        let sig = FunctionSignature::new(
            None,
            vec![
                Argument::pointer(void_id),
                Argument::pointer(i32_id),
                Argument::value(i32_id),
            ],
        );
        let mut f = Function::new("m", "T::m", FunctionKind::Method, sig, TypeId::from_fqn("s"));
        f.implicit_args = 2;
        assert_eq!(f.explicit_arg_types(), vec![i32_id]);
    }
}
