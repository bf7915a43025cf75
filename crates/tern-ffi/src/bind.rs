//! Host binding builder.
//!
//! The host registers native types and callables through explicit generic
//! parameters; each binding generates its wrapper in a single instantiation,
//! with no runtime introspection. Argument and return classification come
//! from the traits below, the signature from the registered builtin and host
//! types.

use crate::call::{CallContext, FfiPrimitive, HostFn};
use crate::error::BindError;
use crate::function::{Function, FunctionKind};
use crate::registry::{FunctionRegistry, TypeRegistry};
use crate::types::{
    host_type_hash, ArgType, Argument, DataType, FunctionId, FunctionSignature, Property, TypeId,
    TypeMeta,
};
use crate::AccessModifier;
use std::marker::PhantomData;
use std::sync::Arc;

/// One explicit argument of a bound callable.
pub trait HostArg: 'static {
    fn argument(types: &TypeRegistry) -> Result<Argument, BindError>;

    /// # Safety
    /// `word` must carry a value of this argument's declared type.
    unsafe fn decode(word: u64) -> Self;
}

impl<T: FfiPrimitive> HostArg for T {
    fn argument(types: &TypeRegistry) -> Result<Argument, BindError> {
        let ty = types
            .by_fqn(T::SCRIPT_NAME)
            .ok_or_else(|| BindError::UnknownType(T::SCRIPT_NAME.to_string()))?;
        Ok(Argument::value(ty.id))
    }

    unsafe fn decode(word: u64) -> Self {
        T::from_word(word)
    }
}

impl<T: 'static> HostArg for *mut T {
    fn argument(types: &TypeRegistry) -> Result<Argument, BindError> {
        let ty = types
            .by_host_hash(host_type_hash::<T>())
            .ok_or(BindError::UnboundHostType)?;
        Ok(Argument::pointer(ty.id))
    }

    unsafe fn decode(word: u64) -> Self {
        word as *mut T
    }
}

impl<T: 'static> HostArg for *const T {
    fn argument(types: &TypeRegistry) -> Result<Argument, BindError> {
        <*mut T as HostArg>::argument(types)
    }

    unsafe fn decode(word: u64) -> Self {
        word as *const T
    }
}

/// Return channel of a bound callable.
pub trait HostReturn: 'static {
    fn return_type(types: &TypeRegistry) -> Result<Option<TypeId>, BindError>;

    /// # Safety
    /// `ctx.ret_ptr` must be valid return storage for this type (ignored for
    /// void).
    unsafe fn write(self, ctx: &mut CallContext);
}

impl HostReturn for () {
    fn return_type(_types: &TypeRegistry) -> Result<Option<TypeId>, BindError> {
        Ok(None)
    }

    unsafe fn write(self, _ctx: &mut CallContext) {}
}

impl<T: FfiPrimitive> HostReturn for T {
    fn return_type(types: &TypeRegistry) -> Result<Option<TypeId>, BindError> {
        let ty = types
            .by_fqn(T::SCRIPT_NAME)
            .ok_or_else(|| BindError::UnknownType(T::SCRIPT_NAME.to_string()))?;
        Ok(Some(ty.id))
    }

    unsafe fn write(self, ctx: &mut CallContext) {
        ctx.write_ret(self);
    }
}

fn context_arg(types: &TypeRegistry) -> Argument {
    // The hidden context-pointer slot; typed void by convention
    let void = types.by_fqn("void").map(|t| t.id).unwrap_or(TypeId(0));
    Argument {
        arg_type: ArgType::ContextPtr,
        ty: void,
    }
}

/// A host callable bindable as a free function.
pub trait HostFunction<A, R> {
    fn bind(self, types: &TypeRegistry) -> Result<(FunctionSignature, HostFn), BindError>;
}

/// A host callable bindable as a method of `T`.
pub trait HostMethod<T, A, R> {
    fn bind(self, types: &TypeRegistry, this_ty: TypeId) -> Result<(FunctionSignature, HostFn), BindError>;
}

/// A host callable bindable as a constructor of `T`.
pub trait HostCtor<T, A> {
    fn bind(self, types: &TypeRegistry, this_ty: TypeId) -> Result<(FunctionSignature, HostFn), BindError>;
}

macro_rules! impl_host_callables {
    ($($arg:ident : $idx:tt),*) => {
        impl<F, R, $($arg,)*> HostFunction<($($arg,)*), R> for F
        where
            F: Fn($($arg),*) -> R + Send + Sync + 'static,
            R: HostReturn,
            $($arg: HostArg,)*
        {
            fn bind(self, types: &TypeRegistry) -> Result<(FunctionSignature, HostFn), BindError> {
                let mut args = vec![context_arg(types)];
                $(args.push(<$arg as HostArg>::argument(types)?);)*
                let sig = FunctionSignature::new(R::return_type(types)?, args);
                let wrapper: HostFn = Arc::new(move |ctx: &mut CallContext| {
                    let r = self($(unsafe { <$arg as HostArg>::decode(ctx.args[$idx]) }),*);
                    unsafe { r.write(ctx) };
                });
                Ok((sig, wrapper))
            }
        }

        impl<F, T, R, $($arg,)*> HostMethod<T, ($($arg,)*), R> for F
        where
            F: Fn(&mut T, $($arg),*) -> R + Send + Sync + 'static,
            T: 'static,
            R: HostReturn,
            $($arg: HostArg,)*
        {
            fn bind(self, types: &TypeRegistry, this_ty: TypeId) -> Result<(FunctionSignature, HostFn), BindError> {
                let mut args = vec![context_arg(types), Argument::pointer(this_ty)];
                $(args.push(<$arg as HostArg>::argument(types)?);)*
                let sig = FunctionSignature::new(R::return_type(types)?, args);
                let wrapper: HostFn = Arc::new(move |ctx: &mut CallContext| {
                    let this = unsafe { ctx.this_as::<T>() };
                    let r = self(this, $(unsafe { <$arg as HostArg>::decode(ctx.args[$idx]) }),*);
                    unsafe { r.write(ctx) };
                });
                Ok((sig, wrapper))
            }
        }

        impl<F, T, $($arg,)*> HostCtor<T, ($($arg,)*)> for F
        where
            F: Fn($($arg),*) -> T + Send + Sync + 'static,
            T: 'static,
            $($arg: HostArg,)*
        {
            fn bind(self, types: &TypeRegistry, this_ty: TypeId) -> Result<(FunctionSignature, HostFn), BindError> {
                let mut args = vec![context_arg(types), Argument::pointer(this_ty)];
                $(args.push(<$arg as HostArg>::argument(types)?);)*
                let sig = FunctionSignature::new(None, args);
                let wrapper: HostFn = Arc::new(move |ctx: &mut CallContext| {
                    let value = self($(unsafe { <$arg as HostArg>::decode(ctx.args[$idx]) }),*);
                    unsafe { std::ptr::write(ctx.this_ptr as *mut T, value) };
                });
                Ok((sig, wrapper))
            }
        }
    };
}

impl_host_callables!();
impl_host_callables!(A0: 0);
impl_host_callables!(A0: 0, A1: 1);
impl_host_callables!(A0: 0, A1: 1, A2: 2);
impl_host_callables!(A0: 0, A1: 1, A2: 2, A3: 3);
impl_host_callables!(A0: 0, A1: 1, A2: 2, A3: 3, A4: 4);
impl_host_callables!(A0: 0, A1: 1, A2: 2, A3: 3, A4: 4, A5: 5);

/// Entry point the host uses to register symbols on a context.
pub struct Bindings<'r> {
    pub types: &'r mut TypeRegistry,
    pub funcs: &'r mut FunctionRegistry,
}

impl<'r> Bindings<'r> {
    pub fn new(types: &'r mut TypeRegistry, funcs: &'r mut FunctionRegistry) -> Self {
        Self { types, funcs }
    }

    /// Register a free function with the given access.
    pub fn bind_function<A, R>(
        &mut self,
        name: &str,
        access: AccessModifier,
        f: impl HostFunction<A, R>,
    ) -> Result<FunctionId, BindError> {
        let (sig, wrapper) = f.bind(self.types)?;
        let sig_type = self.types.signature_type(&sig);
        let mut func = Function::new(name, name, FunctionKind::Function, sig, sig_type);
        func.access = access;
        func.implicit_args = 1;
        func.host_fn = Some(wrapper);
        self.funcs.register(func)
    }

    /// Register a script-visible alias of a primitive.
    pub fn bind_primitive<T: FfiPrimitive>(&mut self, name: &str) -> Result<TypeId, BindError> {
        let target = self
            .types
            .by_fqn(T::SCRIPT_NAME)
            .ok_or_else(|| BindError::UnknownType(T::SCRIPT_NAME.to_string()))?
            .id;
        let mut dt = DataType::new(name, name, TypeMeta {
            is_alias: true,
            ..Default::default()
        });
        dt.alias_of = Some(target);
        self.types.insert(dt)
    }

    /// Begin binding a host object type. Finish with [`TypeBuilder::finish`].
    pub fn bind_type<T: 'static>(&mut self, name: &str) -> Result<TypeBuilder<'_, 'r, T>, BindError> {
        let id = self.types.insert_incomplete(name, name)?;
        let meta = TypeMeta {
            size: std::mem::size_of::<T>() as u32,
            is_pod: false,
            is_host: true,
            is_trivially_copyable: false,
            is_trivially_destructible: false,
            host_hash: host_type_hash::<T>(),
            ..Default::default()
        };
        let dt = DataType::new(name, name, meta);
        debug_assert_eq!(dt.id, id);
        Ok(TypeBuilder {
            bindings: self,
            dt,
            _marker: PhantomData,
        })
    }
}

/// Incremental builder for one host object type.
pub struct TypeBuilder<'b, 'r, T> {
    bindings: &'b mut Bindings<'r>,
    dt: DataType,
    _marker: PhantomData<T>,
}

impl<'b, 'r, T: 'static> TypeBuilder<'b, 'r, T> {
    pub fn with_access(mut self, access: AccessModifier) -> Self {
        self.dt.access = access;
        self
    }

    /// Bind a constructor. Multiple constructors may be bound as overloads.
    pub fn with_constructor<A>(mut self, f: impl HostCtor<T, A>) -> Result<Self, BindError> {
        let (sig, wrapper) = f.bind(self.bindings.types, self.dt.id)?;
        let fqn = format!("{}::constructor", self.dt.fully_qualified_name);
        let sig_type = self.bindings.types.signature_type(&sig);
        let mut func = Function::new("constructor", fqn, FunctionKind::Constructor, sig, sig_type);
        func.this_type = Some(self.dt.id);
        func.implicit_args = 2;
        func.host_fn = Some(wrapper);
        let id = self.bindings.funcs.register(func)?;
        self.dt.methods.push(id);
        Ok(self)
    }

    /// Bind the destructor.
    pub fn with_destructor(mut self, f: impl Fn(&mut T) + Send + Sync + 'static) -> Result<Self, BindError> {
        let sig = FunctionSignature::new(
            None,
            vec![context_arg(self.bindings.types), Argument::pointer(self.dt.id)],
        );
        let sig_type = self.bindings.types.signature_type(&sig);
        let fqn = format!("{}::destructor", self.dt.fully_qualified_name);
        let mut func = Function::new("destructor", fqn, FunctionKind::Destructor, sig, sig_type);
        func.this_type = Some(self.dt.id);
        func.implicit_args = 2;
        func.host_fn = Some(Arc::new(move |ctx: &mut CallContext| {
            f(unsafe { ctx.this_as::<T>() });
        }));
        let id = self.bindings.funcs.register(func)?;
        self.dt.destructor = Some(id);
        Ok(self)
    }

    /// Bind a destructor that simply drops the Rust value in place.
    pub fn with_default_destructor(self) -> Result<Self, BindError> {
        self.with_destructor(|this: &mut T| unsafe {
            std::ptr::drop_in_place(this as *mut T);
        })
    }

    /// Bind a method.
    pub fn with_method<A, R>(
        mut self,
        name: &str,
        f: impl HostMethod<T, A, R>,
    ) -> Result<Self, BindError> {
        let (sig, wrapper) = f.bind(self.bindings.types, self.dt.id)?;
        let fqn = format!("{}::{}", self.dt.fully_qualified_name, name);
        let sig_type = self.bindings.types.signature_type(&sig);
        let mut func = Function::new(name, fqn, FunctionKind::Method, sig, sig_type);
        func.this_type = Some(self.dt.id);
        func.implicit_args = 2;
        func.host_fn = Some(wrapper);
        let id = self.bindings.funcs.register(func)?;
        self.dt.methods.push(id);
        Ok(self)
    }

    /// Expose a plain field at a byte offset.
    pub fn with_property<P: FfiPrimitive>(mut self, name: &str, offset: u32) -> Result<Self, BindError> {
        let ty = self
            .bindings
            .types
            .by_fqn(P::SCRIPT_NAME)
            .ok_or_else(|| BindError::UnknownType(P::SCRIPT_NAME.to_string()))?
            .id;
        self.dt.props.push(Property::field(name, ty, offset));
        Ok(self)
    }

    /// Expose a property through accessor functions. A missing setter makes
    /// the property read-only.
    pub fn with_accessor<P: FfiPrimitive>(
        mut self,
        name: &str,
        getter: impl Fn(&mut T) -> P + Send + Sync + 'static,
        setter: Option<Box<dyn Fn(&mut T, P) + Send + Sync>>,
    ) -> Result<Self, BindError> {
        let prop_ty = self
            .bindings
            .types
            .by_fqn(P::SCRIPT_NAME)
            .ok_or_else(|| BindError::UnknownType(P::SCRIPT_NAME.to_string()))?
            .id;

        let getter_name = format!("$get_{name}");
        let this = self.dt.id;
        let get_sig = FunctionSignature::new(
            Some(prop_ty),
            vec![context_arg(self.bindings.types), Argument::pointer(this)],
        );
        let get_sig_type = self.bindings.types.signature_type(&get_sig);
        let mut get_fn = Function::new(
            getter_name.clone(),
            format!("{}::{}", self.dt.fully_qualified_name, getter_name),
            FunctionKind::Method,
            get_sig,
            get_sig_type,
        );
        get_fn.this_type = Some(this);
        get_fn.implicit_args = 2;
        get_fn.host_fn = Some(Arc::new(move |ctx: &mut CallContext| {
            let value = getter(unsafe { ctx.this_as::<T>() });
            unsafe { ctx.write_ret(value) };
        }));
        let getter_id = self.bindings.funcs.register(get_fn)?;
        self.dt.methods.push(getter_id);

        let setter_id = match setter {
            Some(set) => {
                let setter_name = format!("$set_{name}");
                let set_sig = FunctionSignature::new(
                    None,
                    vec![
                        context_arg(self.bindings.types),
                        Argument::pointer(this),
                        Argument::value(prop_ty),
                    ],
                );
                let set_sig_type = self.bindings.types.signature_type(&set_sig);
                let mut set_fn = Function::new(
                    setter_name.clone(),
                    format!("{}::{}", self.dt.fully_qualified_name, setter_name),
                    FunctionKind::Method,
                    set_sig,
                    set_sig_type,
                );
                set_fn.this_type = Some(this);
                set_fn.implicit_args = 2;
                set_fn.host_fn = Some(Arc::new(move |ctx: &mut CallContext| {
                    let value = unsafe { P::decode(ctx.args[0]) };
                    set(unsafe { ctx.this_as::<T>() }, value);
                }));
                let id = self.bindings.funcs.register(set_fn)?;
                self.dt.methods.push(id);
                Some(id)
            }
            None => None,
        };

        let mut prop = Property::field(name, prop_ty, 0);
        prop.getter = Some(getter_id);
        prop.setter = setter_id;
        prop.can_write = setter_id.is_some();
        self.dt.props.push(prop);
        Ok(self)
    }

    /// Complete the registration and return the type id.
    pub fn finish(self) -> Result<TypeId, BindError> {
        let id = self.dt.id;
        self.bindings.types.complete(self.dt)?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::ExecutionContext;

    #[repr(C)]
    struct Counter {
        value: i32,
        step: i32,
    }

    fn registries() -> (TypeRegistry, FunctionRegistry) {
        (TypeRegistry::new(), FunctionRegistry::new())
    }

    fn invoke(f: &Function, args: &[u64], this: *mut u8, ret: *mut u8) {
        let mut ectx = ExecutionContext::new();
        let mut ctx = CallContext {
            ectx: &mut ectx,
            func: f.id,
            ret_ptr: ret,
            this_ptr: this,
            capture_ptr: std::ptr::null_mut(),
            args,
        };
        (f.host_fn.as_ref().expect("host fn"))(&mut ctx);
    }

    #[test]
    fn bind_free_function_round_trips_args() {
        let (mut types, mut funcs) = registries();
        let mut b = Bindings::new(&mut types, &mut funcs);
        let id = b
            .bind_function("mul_add", AccessModifier::Public, |a: i32, b: i32, c: i32| a * b + c)
            .unwrap();

        let f = funcs.get(id).unwrap();
        assert_eq!(f.explicit_arg_types().len(), 3);
        assert_eq!(f.implicit_args, 1);

        let mut ret = 0u64;
        invoke(
            f,
            &[3i32.to_word(), 4i32.to_word(), 5i32.to_word()],
            std::ptr::null_mut(),
            &mut ret as *mut u64 as *mut u8,
        );
        assert_eq!(i32::from_word(ret), 17);
    }

    #[test]
    fn bind_type_with_ctor_method_dtor() {
        let (mut types, mut funcs) = registries();
        let mut b = Bindings::new(&mut types, &mut funcs);
        let ty = b
            .bind_type::<Counter>("Counter")
            .unwrap()
            .with_constructor(|start: i32, step: i32| Counter { value: start, step })
            .unwrap()
            .with_method("bump", |c: &mut Counter| {
                c.value += c.step;
                c.value
            })
            .unwrap()
            .with_property::<i32>("value", 0)
            .unwrap()
            .with_default_destructor()
            .unwrap()
            .finish()
            .unwrap();

        let dt = types.get(ty).unwrap();
        assert!(dt.meta.is_host);
        assert_eq!(dt.meta.size, std::mem::size_of::<Counter>() as u32);
        assert!(dt.destructor.is_some());
        assert_eq!(dt.prop("value").unwrap().offset, 0);

        // Construct into raw storage, call the method, read the result
        let mut storage = [0u8; std::mem::size_of::<Counter>()];
        let ctor = funcs.get(dt.methods[0]).unwrap();
        invoke(
            ctor,
            &[10i32.to_word(), 5i32.to_word()],
            storage.as_mut_ptr(),
            std::ptr::null_mut(),
        );

        let bump = funcs.get(dt.methods[1]).unwrap();
        let mut ret = 0u64;
        invoke(bump, &[], storage.as_mut_ptr(), &mut ret as *mut u64 as *mut u8);
        assert_eq!(i32::from_word(ret), 15);
    }

    #[test]
    fn overloads_share_a_name() {
        let (mut types, mut funcs) = registries();
        let mut b = Bindings::new(&mut types, &mut funcs);
        b.bind_function("f", AccessModifier::Public, |_: i32| ()).unwrap();
        b.bind_function("f", AccessModifier::Public, |_: f32| ()).unwrap();
        assert_eq!(funcs.by_name("f").len(), 2);
    }

    #[test]
    fn accessor_binds_getter_and_optional_setter() {
        let (mut types, mut funcs) = registries();
        let mut b = Bindings::new(&mut types, &mut funcs);
        let ty = b
            .bind_type::<Counter>("Counter")
            .unwrap()
            .with_accessor::<i32>("value", |c| c.value, Some(Box::new(|c, v| c.value = v)))
            .unwrap()
            .with_accessor::<i32>("step", |c| c.step, None)
            .unwrap()
            .finish()
            .unwrap();

        let dt = types.get(ty).unwrap();
        let value = dt.prop("value").unwrap();
        assert!(value.getter.is_some() && value.setter.is_some() && value.can_write);
        let step = dt.prop("step").unwrap();
        assert!(step.getter.is_some() && step.setter.is_none() && !step.can_write);
    }
}
