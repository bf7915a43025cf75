//! Templates: recorded declarations and on-demand instantiation.
//!
//! A template definition keeps its AST subtree and the imports visible at
//! its declaration. Instantiating deep-copies the subtree, binds the
//! parameters as type aliases, and recompiles under a name that includes the
//! arguments' fully-qualified names. Instantiations are cached per argument
//! list.

use super::{CResult, Compiler, Imported, PendingFunction};
use crate::error::CompileErrorKind;
use rustc_hash::FxHashMap;
use tern_ffi::{FunctionId, TypeId};
use tern_parser::{NodeArena, NodeId, SourceLocation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
    Class,
    Function,
}

/// One recorded template declaration.
#[derive(Debug, Clone)]
pub struct TemplateDecl {
    pub name: String,
    pub kind: TemplateKind,
    pub params: Vec<String>,
    pub node: NodeId,
    /// Imports visible where the template was declared.
    pub captured_imports: FxHashMap<String, Imported>,
}

/// All templates of one context, with their instantiation caches.
#[derive(Debug, Default)]
pub struct TemplateStore {
    classes: FxHashMap<String, TemplateDecl>,
    functions: FxHashMap<String, TemplateDecl>,
    class_instances: FxHashMap<(String, Vec<TypeId>), TypeId>,
    function_instances: FxHashMap<(String, Vec<TypeId>), FunctionId>,
}

impl TemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_class(
        &mut self,
        arena: &NodeArena,
        node: NodeId,
        imports: &FxHashMap<String, Imported>,
    ) {
        if let Some(decl) = Self::make_decl(arena, node, TemplateKind::Class, imports) {
            self.classes.insert(decl.name.clone(), decl);
        }
    }

    pub fn record_function(
        &mut self,
        arena: &NodeArena,
        node: NodeId,
        imports: &FxHashMap<String, Imported>,
    ) {
        if let Some(decl) = Self::make_decl(arena, node, TemplateKind::Function, imports) {
            self.functions.insert(decl.name.clone(), decl);
        }
    }

    fn make_decl(
        arena: &NodeArena,
        node: NodeId,
        kind: TemplateKind,
        imports: &FxHashMap<String, Imported>,
    ) -> Option<TemplateDecl> {
        let n = arena.get(node);
        let name = n.identifier.and_then(|i| arena.get(i).text.clone())?;
        let params: Vec<String> = arena
            .iter_list(n.template_params)
            .filter_map(|(_, p)| p.text.clone())
            .collect();
        Some(TemplateDecl {
            name,
            kind,
            params,
            node,
            captured_imports: imports.clone(),
        })
    }

    pub fn has_class(&self, name: &str) -> bool {
        self.classes.contains_key(name)
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn class(&self, name: &str) -> Option<&TemplateDecl> {
        self.classes.get(name)
    }

    pub fn function(&self, name: &str) -> Option<&TemplateDecl> {
        self.functions.get(name)
    }

    pub fn cached_class(&self, name: &str, args: &[TypeId]) -> Option<TypeId> {
        self.class_instances.get(&(name.to_string(), args.to_vec())).copied()
    }

    pub fn cache_class(&mut self, name: &str, args: &[TypeId], ty: TypeId) {
        self.class_instances.insert((name.to_string(), args.to_vec()), ty);
    }

    pub fn cached_function(&self, name: &str, args: &[TypeId]) -> Option<FunctionId> {
        self.function_instances
            .get(&(name.to_string(), args.to_vec()))
            .copied()
    }

    pub fn cache_function(&mut self, name: &str, args: &[TypeId], f: FunctionId) {
        self.function_instances.insert((name.to_string(), args.to_vec()), f);
    }

    /// All recorded declarations, for persistence.
    pub fn declarations(&self) -> impl Iterator<Item = &TemplateDecl> {
        self.classes.values().chain(self.functions.values())
    }

    /// Re-register a declaration restored from a persisted module.
    pub fn restore(&mut self, decl: TemplateDecl) {
        match decl.kind {
            TemplateKind::Class => self.classes.insert(decl.name.clone(), decl),
            TemplateKind::Function => self.functions.insert(decl.name.clone(), decl),
        };
    }
}

impl<'a> Compiler<'a> {
    /// Instantiate `Name<Args...>` as a type.
    pub(crate) fn instantiate_class_template(
        &mut self,
        name: &str,
        args: &[TypeId],
        src: SourceLocation,
    ) -> CResult<TypeId> {
        if let Some(cached) = self.templates.cached_class(name, args) {
            return Ok(cached);
        }
        let Some(decl) = self.templates.class(name).cloned() else {
            // Subtype arguments on something that is not a template
            if self.try_resolve_named_type(name).is_some() {
                return self.error(CompileErrorKind::UnexpectedSubtype(name.to_string()), src);
            }
            return self.error(CompileErrorKind::UnknownType(name.to_string()), src);
        };
        if decl.params.len() != args.len() {
            return self.error(CompileErrorKind::SubtypeRequired(name.to_string()), src);
        }

        let mangled = self.mangle(name, args);

        // Recompile a fresh copy of the declaration under the mangled name,
        // with parameters bound and the declaration-site imports restored
        let copy = self.arena.deep_copy(decl.node);
        if let Some(ident) = self.arena.get(copy).identifier {
            self.arena.get_mut(ident).text = Some(mangled.clone());
        }
        self.arena.get_mut(copy).template_params = None;

        let saved_imports = std::mem::replace(&mut self.imports, decl.captured_imports.clone());
        self.scopes.push(super::ScopeKind::TypeBindings);
        for (param, &arg) in decl.params.iter().zip(args) {
            self.scopes.bind_type_alias(param, arg);
        }

        let result = (|c: &mut Self| -> CResult<TypeId> {
            c.reserve_class(copy, false)?;
            let mut pending: Vec<PendingFunction> = Vec::new();
            let ty = c.define_class(copy, false, &mut pending)?;
            for p in pending {
                c.compile_function_body(p);
            }
            Ok(ty)
        })(self);

        self.scopes.pop();
        self.imports = saved_imports;

        if let Ok(ty) = result {
            self.templates.cache_class(name, args, ty);
        }
        result
    }

    /// Instantiate a function template for a call with `arg_types`,
    /// inferring each parameter from the argument it names. Failed attempts
    /// leave no diagnostics behind.
    pub(crate) fn instantiate_function_template(
        &mut self,
        name: &str,
        arg_types: &[TypeId],
        src: SourceLocation,
    ) -> CResult<FunctionId> {
        self.log.begin_transaction();
        let result = self.instantiate_function_inner(name, arg_types, src);
        match result {
            Ok(f) => {
                self.log.commit();
                Ok(f)
            }
            Err(()) => {
                self.log.revert();
                Err(())
            }
        }
    }

    fn instantiate_function_inner(
        &mut self,
        name: &str,
        arg_types: &[TypeId],
        src: SourceLocation,
    ) -> CResult<FunctionId> {
        let Some(decl) = self.templates.function(name).cloned() else {
            return self.error(CompileErrorKind::UnknownSymbol(name.to_string()), src);
        };

        // Infer each template parameter from the first argument declared
        // with exactly that parameter as its type
        let param_tys: Vec<Option<String>> = {
            let node = self.arena.get(decl.node);
            self.arena
                .iter_list(node.parameters)
                .map(|(_, p)| {
                    p.data_type
                        .and_then(|t| self.arena.get(t).text.clone())
                })
                .collect()
        };
        if param_tys.len() != arg_types.len() {
            return self.error(CompileErrorKind::NoMatchingOverload(name.to_string()), src);
        }

        let mut bindings = Vec::new();
        for param in &decl.params {
            let found = param_tys
                .iter()
                .zip(arg_types)
                .find(|(ty_name, _)| ty_name.as_deref() == Some(param.as_str()))
                .map(|(_, &arg)| arg);
            match found {
                Some(arg) => bindings.push((param.clone(), arg)),
                None => {
                    return self.error(
                        CompileErrorKind::SubtypeRequired(name.to_string()),
                        src,
                    )
                }
            }
        }
        let binding_args: Vec<TypeId> = bindings.iter().map(|(_, t)| *t).collect();
        if let Some(cached) = self.templates.cached_function(name, &binding_args) {
            return Ok(cached);
        }

        let mangled = self.mangle(name, &binding_args);
        let copy = self.arena.deep_copy(decl.node);
        if let Some(ident) = self.arena.get(copy).identifier {
            self.arena.get_mut(ident).text = Some(mangled);
        }
        self.arena.get_mut(copy).template_params = None;

        let saved_imports = std::mem::replace(&mut self.imports, decl.captured_imports.clone());
        self.scopes.push(super::ScopeKind::TypeBindings);
        for (param, arg) in &bindings {
            self.scopes.bind_type_alias(param, *arg);
        }

        let result = (|c: &mut Self| -> CResult<FunctionId> {
            let p = c.declare_function(copy, false, None)?;
            let id = p.id;
            c.compile_function_body(p);
            Ok(id)
        })(self);

        self.scopes.pop();
        self.imports = saved_imports;

        if let Ok(id) = result {
            self.templates.cache_function(name, &binding_args, id);
        }
        result
    }

    /// `Name<fq1,fq2>` from argument fully-qualified names.
    fn mangle(&self, name: &str, args: &[TypeId]) -> String {
        let rendered: Vec<String> = args
            .iter()
            .map(|a| {
                self.types
                    .get(*a)
                    .map(|t| t.fully_qualified_name.clone())
                    .unwrap_or_else(|| a.to_string())
            })
            .collect();
        format!("{}<{}>", name, rendered.join(","))
    }
}
