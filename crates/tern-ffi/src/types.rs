//! Data types and function signatures.
//!
//! A [`DataType`] is identified by a [`TypeId`] derived from the crc32 of its
//! fully-qualified name. Equal ids imply structural identity within one
//! context. Function signature types are themselves `DataType`s whose meta
//! marks them `is_function`.

use crate::AccessModifier;
use std::hash::{Hash, Hasher};

/// Stable type identifier: crc32 of the fully-qualified name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub u32);

impl TypeId {
    pub fn from_fqn(fqn: &str) -> Self {
        Self(crc32fast::hash(fqn.as_bytes()))
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for TypeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ty#{:08x}", self.0)
    }
}

/// Stable function identifier: crc32 of the fully-qualified name and
/// signature rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(pub u32);

impl FunctionId {
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for FunctionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fn#{:08x}", self.0)
    }
}

/// Module identifier: crc32 of the module path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleId(pub u32);

impl ModuleId {
    pub fn from_path(path: &str) -> Self {
        Self(crc32fast::hash(path.as_bytes()))
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

/// Hash of a host (Rust) type, derived from `std::any::TypeId`. Used to find
/// the bound `DataType` for a native argument.
pub fn host_type_hash<T: 'static>() -> u64 {
    let mut hasher = rustc_hash::FxHasher::default();
    std::any::TypeId::of::<T>().hash(&mut hasher);
    hasher.finish()
}

/// Size, triviality, and numeric classification of a type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TypeMeta {
    pub size: u32,
    pub is_pod: bool,
    pub is_trivially_constructible: bool,
    pub is_trivially_copyable: bool,
    pub is_trivially_destructible: bool,
    pub is_primitive: bool,
    pub is_floating_point: bool,
    pub is_integral: bool,
    pub is_unsigned: bool,
    pub is_function: bool,
    pub is_template: bool,
    pub is_alias: bool,
    pub is_host: bool,
    pub is_anonymous: bool,
    /// Hash of the native type this binds, zero for script types.
    pub host_hash: u64,
}

impl TypeMeta {
    pub fn primitive(size: u32, is_floating_point: bool, is_integral: bool, is_unsigned: bool) -> Self {
        Self {
            size,
            is_pod: true,
            is_trivially_constructible: true,
            is_trivially_copyable: true,
            is_trivially_destructible: true,
            is_primitive: true,
            is_floating_point,
            is_integral,
            is_unsigned,
            ..Default::default()
        }
    }
}

/// How an argument travels across a call boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    /// Hidden first argument carrying the call context.
    ContextPtr,
    /// Passed by value in a single slot.
    Value,
    /// Passed by address; the compiler materializes one when needed.
    Pointer,
}

/// One declared argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Argument {
    pub arg_type: ArgType,
    pub ty: TypeId,
}

impl Argument {
    pub fn value(ty: TypeId) -> Self {
        Self {
            arg_type: ArgType::Value,
            ty,
        }
    }

    pub fn pointer(ty: TypeId) -> Self {
        Self {
            arg_type: ArgType::Pointer,
            ty,
        }
    }

    /// Implicit arguments are elided from user-visible signatures.
    pub fn is_implicit(&self) -> bool {
        self.arg_type == ArgType::ContextPtr
    }
}

/// A function signature: return type plus argument list.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FunctionSignature {
    pub return_type: Option<TypeId>,
    /// Non-primitive returns come back through a hidden out-pointer.
    pub returns_via_pointer: bool,
    pub args: Vec<Argument>,
}

impl FunctionSignature {
    pub fn new(return_type: Option<TypeId>, args: Vec<Argument>) -> Self {
        Self {
            return_type,
            returns_via_pointer: false,
            args,
        }
    }

    /// Arguments without the implicit context/this prefix.
    pub fn explicit_args(&self) -> impl Iterator<Item = &Argument> {
        self.args.iter().filter(|a| !a.is_implicit())
    }

    /// Render for fully-qualified-name hashing: `ret(a,b,c)`.
    pub fn render(&self) -> String {
        let mut out = String::new();
        match &self.return_type {
            Some(t) => out.push_str(&format!("{:08x}", t.as_u32())),
            None => out.push_str("void"),
        }
        out.push('(');
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&format!("{:08x}", arg.ty.as_u32()));
        }
        out.push(')');
        out
    }
}

/// A named member with storage or accessors.
#[derive(Debug, Clone)]
pub struct Property {
    pub name: String,
    pub ty: TypeId,
    pub offset: u32,
    pub access: AccessModifier,
    pub can_read: bool,
    pub can_write: bool,
    pub is_static: bool,
    pub getter: Option<FunctionId>,
    pub setter: Option<FunctionId>,
}

impl Property {
    pub fn field(name: impl Into<String>, ty: TypeId, offset: u32) -> Self {
        Self {
            name: name.into(),
            ty,
            offset,
            access: AccessModifier::Public,
            can_read: true,
            can_write: true,
            is_static: false,
            getter: None,
            setter: None,
        }
    }
}

/// A base class with the offset of its subobject, used to adjust `this` under
/// multiple inheritance.
#[derive(Debug, Clone, Copy)]
pub struct BaseClass {
    pub ty: TypeId,
    pub offset: u32,
}

/// One registered data type.
#[derive(Debug, Clone)]
pub struct DataType {
    pub id: TypeId,
    pub name: String,
    pub fully_qualified_name: String,
    pub meta: TypeMeta,
    pub access: AccessModifier,
    pub props: Vec<Property>,
    pub bases: Vec<BaseClass>,
    pub methods: Vec<FunctionId>,
    pub destructor: Option<FunctionId>,
    /// Present when `meta.is_function`.
    pub signature: Option<FunctionSignature>,
    /// Present when `meta.is_alias`.
    pub alias_of: Option<TypeId>,
    /// Enumerator table for enum types.
    pub enumerators: Vec<(String, i64)>,
}

impl DataType {
    pub fn new(name: impl Into<String>, fqn: impl Into<String>, meta: TypeMeta) -> Self {
        let fqn = fqn.into();
        Self {
            id: TypeId::from_fqn(&fqn),
            name: name.into(),
            fully_qualified_name: fqn,
            meta,
            access: AccessModifier::Public,
            props: Vec::new(),
            bases: Vec::new(),
            methods: Vec::new(),
            destructor: None,
            signature: None,
            alias_of: None,
            enumerators: Vec::new(),
        }
    }

    pub fn prop(&self, name: &str) -> Option<&Property> {
        self.props.iter().find(|p| p.name == name)
    }

    /// Whether a value of this type occupies a register (by value) rather
    /// than being addressed through a pointer.
    pub fn is_register_sized(&self) -> bool {
        self.meta.is_primitive && self.meta.size <= 8
    }

    /// Total size in bytes, including base-class subobjects for classes.
    pub fn size(&self) -> u32 {
        self.meta.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_id_is_stable_for_fqn() {
        let a = TypeId::from_fqn("test/mod::Vec2");
        let b = TypeId::from_fqn("test/mod::Vec2");
        let c = TypeId::from_fqn("test/mod::Vec3");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn primitive_meta_flags() {
        let meta = TypeMeta::primitive(4, false, true, true);
        assert!(meta.is_primitive && meta.is_integral && meta.is_unsigned);
        assert!(!meta.is_floating_point);
        assert_eq!(meta.size, 4);
    }

    #[test]
    fn signature_render_distinguishes_arity() {
        let t = TypeId::from_fqn("i32");
        let a = FunctionSignature::new(Some(t), vec![Argument::value(t)]);
        let b = FunctionSignature::new(Some(t), vec![Argument::value(t), Argument::value(t)]);
        assert_ne!(a.render(), b.render());
    }

    #[test]
    fn explicit_args_skip_context_ptr() {
        let t = TypeId::from_fqn("i32");
        let sig = FunctionSignature::new(
            Some(t),
            vec![
                Argument {
                    arg_type: ArgType::ContextPtr,
                    ty: t,
                },
                Argument::value(t),
            ],
        );
        assert_eq!(sig.explicit_args().count(), 1);
    }
}
