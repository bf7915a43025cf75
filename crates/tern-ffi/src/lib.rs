//! Type system, registries, and the bidirectional host binding layer for the
//! Tern toolchain.
//!
//! Everything a context shares between compilation and execution lives here:
//! data types and their meta, function records with host wrappers, modules
//! with their data slots, the per-thread execution context stack, and
//! reference-counted closures.

pub mod bind;
pub mod call;
pub mod closure;
pub mod error;
pub mod exec;
pub mod function;
pub mod module;
pub mod registry;
pub mod types;

pub use bind::{Bindings, HostArg, HostCtor, HostFunction, HostMethod, HostReturn, TypeBuilder};
pub use call::{classify, ArgClass, CallContext, FfiPrimitive, HostFn};
pub use closure::{ClosureBuilder, ClosureRef, FieldDtor};
pub use error::BindError;
pub use exec::{
    has_exception, pop_context, push_context, raise_exception, with_current, ExecutionContext,
};
pub use function::{Function, FunctionKind};
pub use module::{DataSlot, Module};
pub use registry::{FunctionRegistry, TypeRegistry};
pub use types::{
    host_type_hash, ArgType, Argument, BaseClass, DataType, FunctionId, FunctionSignature,
    ModuleId, Property, TypeId, TypeMeta,
};

/// Visibility of a bound or script symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessModifier {
    Public,
    Private,
    /// Resolvable only from trusted modules.
    Trusted,
}

impl Default for AccessModifier {
    fn default() -> Self {
        AccessModifier::Public
    }
}
