//! Type and function registries.
//!
//! Registries are logically per-context: populated during bindings setup,
//! appended to during compilation, and read-only during execution. Types may
//! be inserted as incomplete placeholders first so that cyclic references
//! (a method whose signature mentions its own class) resolve through the id
//! indirection.

use crate::error::BindError;
use crate::function::Function;
use crate::types::{DataType, FunctionId, FunctionSignature, TypeId, TypeMeta};
use rustc_hash::FxHashMap;

/// All data types known to one context.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    types: FxHashMap<TypeId, DataType>,
    by_fqn: FxHashMap<String, TypeId>,
    by_host_hash: FxHashMap<u64, TypeId>,
    incomplete: FxHashMap<TypeId, String>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        let mut reg = Self::default();
        reg.install_builtins();
        reg
    }

    /// Register the primitive types every context starts with.
    fn install_builtins(&mut self) {
        let prims: &[(&str, u32, bool, bool, bool)] = &[
            // name, size, fp, integral, unsigned
            ("bool", 1, false, true, true),
            ("i8", 1, false, true, false),
            ("u8", 1, false, true, true),
            ("i16", 2, false, true, false),
            ("u16", 2, false, true, true),
            ("i32", 4, false, true, false),
            ("u32", 4, false, true, true),
            ("i64", 8, false, true, false),
            ("u64", 8, false, true, true),
            ("f32", 4, true, false, false),
            ("f64", 8, true, false, false),
        ];
        for (name, size, fp, integral, unsigned) in prims {
            let meta = TypeMeta::primitive(*size, *fp, *integral, *unsigned);
            let dt = DataType::new(*name, *name, meta);
            // Builtin names cannot collide
            let _ = self.insert(dt);
        }

        let void = DataType::new(
            "void",
            "void",
            TypeMeta {
                size: 0,
                is_pod: true,
                is_trivially_constructible: true,
                is_trivially_copyable: true,
                is_trivially_destructible: true,
                ..Default::default()
            },
        );
        let _ = self.insert(void);

        // The type of `null`: an untyped pointer
        let null = DataType::new(
            "null",
            "null",
            TypeMeta {
                size: 8,
                is_pod: true,
                is_trivially_constructible: true,
                is_trivially_copyable: true,
                is_trivially_destructible: true,
                ..Default::default()
            },
        );
        let _ = self.insert(null);
    }

    pub fn insert(&mut self, ty: DataType) -> Result<TypeId, BindError> {
        let id = ty.id;
        if self.types.contains_key(&id) {
            return Err(BindError::DuplicateType(ty.fully_qualified_name));
        }
        self.by_fqn.insert(ty.fully_qualified_name.clone(), id);
        if ty.meta.host_hash != 0 {
            self.by_host_hash.insert(ty.meta.host_hash, id);
        }
        self.incomplete.remove(&id);
        self.types.insert(id, ty);
        Ok(id)
    }

    /// Reserve an id for a type whose definition is still being built.
    /// Lookups by id succeed with a placeholder; `complete` fills it in.
    pub fn insert_incomplete(&mut self, name: &str, fqn: &str) -> Result<TypeId, BindError> {
        let id = TypeId::from_fqn(fqn);
        if self.types.contains_key(&id) {
            return Err(BindError::DuplicateType(fqn.to_string()));
        }
        let placeholder = DataType::new(name, fqn, TypeMeta::default());
        self.by_fqn.insert(fqn.to_string(), id);
        self.types.insert(id, placeholder);
        self.incomplete.insert(id, fqn.to_string());
        Ok(id)
    }

    /// Replace an incomplete placeholder with its finished definition.
    pub fn complete(&mut self, ty: DataType) -> Result<(), BindError> {
        let id = ty.id;
        if self.incomplete.remove(&id).is_none() {
            return Err(BindError::NotIncomplete(ty.fully_qualified_name));
        }
        if ty.meta.host_hash != 0 {
            self.by_host_hash.insert(ty.meta.host_hash, id);
        }
        self.types.insert(id, ty);
        Ok(())
    }

    pub fn is_incomplete(&self, id: TypeId) -> bool {
        self.incomplete.contains_key(&id)
    }

    pub fn get(&self, id: TypeId) -> Option<&DataType> {
        self.types.get(&id)
    }

    pub fn get_mut(&mut self, id: TypeId) -> Option<&mut DataType> {
        self.types.get_mut(&id)
    }

    /// Resolve aliases down to the concrete type.
    pub fn resolve(&self, id: TypeId) -> Option<&DataType> {
        let mut cur = self.types.get(&id)?;
        let mut hops = 0;
        while let Some(target) = cur.alias_of {
            cur = self.types.get(&target)?;
            hops += 1;
            if hops > 32 {
                return None;
            }
        }
        Some(cur)
    }

    pub fn by_fqn(&self, fqn: &str) -> Option<&DataType> {
        self.by_fqn.get(fqn).and_then(|id| self.types.get(id))
    }

    pub fn by_host_hash(&self, hash: u64) -> Option<&DataType> {
        self.by_host_hash.get(&hash).and_then(|id| self.types.get(id))
    }

    /// Find or create the function-signature type for `sig`.
    pub fn signature_type(&mut self, sig: &FunctionSignature) -> TypeId {
        let fqn = format!("$sig:{}", sig.render());
        if let Some(id) = self.by_fqn.get(&fqn) {
            return *id;
        }
        let mut dt = DataType::new(fqn.clone(), fqn, TypeMeta {
            size: 8,
            is_function: true,
            is_pod: true,
            is_trivially_copyable: true,
            is_trivially_destructible: true,
            ..Default::default()
        });
        dt.signature = Some(sig.clone());
        // Signature FQNs are canonical, no collision possible
        self.insert(dt).unwrap_or_else(|_| unreachable!())
    }

    pub fn iter(&self) -> impl Iterator<Item = &DataType> {
        self.types.values()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

/// All functions known to one context. `FunctionId` maps 1:1 to an index.
#[derive(Debug, Default)]
pub struct FunctionRegistry {
    funcs: Vec<Function>,
    by_id: FxHashMap<FunctionId, usize>,
    by_name: FxHashMap<String, Vec<FunctionId>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, func: Function) -> Result<FunctionId, BindError> {
        let id = func.id;
        if self.by_id.contains_key(&id) {
            return Err(BindError::DuplicateFunction(func.fully_qualified_name));
        }
        self.by_id.insert(id, self.funcs.len());
        self.by_name.entry(func.name.clone()).or_default().push(id);
        self.funcs.push(func);
        Ok(id)
    }

    pub fn get(&self, id: FunctionId) -> Option<&Function> {
        self.by_id.get(&id).map(|&i| &self.funcs[i])
    }

    pub fn get_mut(&mut self, id: FunctionId) -> Option<&mut Function> {
        self.by_id.get(&id).copied().map(move |i| &mut self.funcs[i])
    }

    pub fn index_of(&self, id: FunctionId) -> Option<usize> {
        self.by_id.get(&id).copied()
    }

    pub fn by_index(&self, index: usize) -> Option<&Function> {
        self.funcs.get(index)
    }

    /// All overloads sharing an unqualified name.
    pub fn by_name(&self, name: &str) -> &[FunctionId] {
        self.by_name.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Function> {
        self.funcs.iter()
    }

    pub fn len(&self) -> usize {
        self.funcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.funcs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::FunctionKind;
    use crate::types::Argument;

    #[test]
    fn builtins_are_present() {
        let reg = TypeRegistry::new();
        for name in ["bool", "i8", "u8", "i16", "u16", "i32", "u32", "i64", "u64", "f32", "f64", "void", "null"] {
            assert!(reg.by_fqn(name).is_some(), "missing builtin {name}");
        }
        let i32_ty = reg.by_fqn("i32").unwrap();
        assert!(i32_ty.meta.is_integral && !i32_ty.meta.is_unsigned);
        assert_eq!(i32_ty.meta.size, 4);
    }

    #[test]
    fn incomplete_types_break_cycles() {
        let mut reg = TypeRegistry::new();
        let id = reg.insert_incomplete("Node", "m::Node").unwrap();
        assert!(reg.is_incomplete(id));
        // The placeholder is visible by id while methods are being built
        assert!(reg.get(id).is_some());

        let i32_id = reg.by_fqn("i32").unwrap().id;
        let mut done = DataType::new("Node", "m::Node", TypeMeta { size: 16, ..Default::default() });
        done.props.push(crate::types::Property::field("value", i32_id, 0));
        reg.complete(done).unwrap();
        assert!(!reg.is_incomplete(id));
        assert_eq!(reg.get(id).unwrap().props.len(), 1);
    }

    #[test]
    fn duplicate_type_rejected() {
        let mut reg = TypeRegistry::new();
        let dt = DataType::new("X", "m::X", TypeMeta::default());
        reg.insert(dt.clone()).unwrap();
        assert!(matches!(reg.insert(dt), Err(BindError::DuplicateType(_))));
    }

    #[test]
    fn alias_resolution_terminates() {
        let mut reg = TypeRegistry::new();
        let i32_id = reg.by_fqn("i32").unwrap().id;
        let mut alias = DataType::new("Int", "m::Int", TypeMeta { is_alias: true, ..Default::default() });
        alias.alias_of = Some(i32_id);
        let alias_id = reg.insert(alias).unwrap();
        assert_eq!(reg.resolve(alias_id).unwrap().id, i32_id);
    }

    #[test]
    fn function_ids_map_to_indices() {
        let mut types = TypeRegistry::new();
        let i32_id = types.by_fqn("i32").unwrap().id;
        let mut funcs = FunctionRegistry::new();
        let sig = FunctionSignature::new(Some(i32_id), vec![Argument::value(i32_id)]);
        let st = types.signature_type(&sig);
        let f = Function::new("f", "m::f", FunctionKind::Function, sig, st);
        let id = funcs.register(f).unwrap();
        assert_eq!(funcs.index_of(id), Some(0));
        assert_eq!(funcs.by_name("f"), &[id]);
        assert!(funcs.get(id).is_some());
    }
}
