//! AST → IR compilation.
//!
//! The compiler walks one module's AST and produces a [`FunctionDef`] per
//! function (including the synthetic `$init` holding top-level statements),
//! registering new types and functions as it goes. Compile errors abort the
//! current function's emission but not the module walk; the module is marked
//! not-compiled when any error was logged.

mod expr;
mod resolve;
mod scope;
mod stmt;
mod template;

pub use resolve::{Conversion, MatchFlags};
pub use scope::{DtorDuty, LocalSymbol, Scope, ScopeKind, ScopeManager};
pub use template::{TemplateDecl, TemplateKind, TemplateStore};

use crate::error::CompileErrorKind;
use crate::ir::{FunctionDef, Instruction, Op, VRegId, Value};
use rustc_hash::FxHashMap;
use tern_ffi::{
    AccessModifier, Argument, Function, FunctionId, FunctionKind, FunctionRegistry,
    FunctionSignature, Module, ModuleId, TypeId, TypeRegistry,
};
use tern_parser::{
    Literal, NodeArena, NodeId, NodeKind, Logger, Severity, SourceLocation,
};

/// Read access to previously compiled modules, for imports.
pub trait ModuleLookup {
    fn find_module(&self, path: &str) -> Option<&Module>;
}

/// No imports available.
impl ModuleLookup for () {
    fn find_module(&self, _path: &str) -> Option<&Module> {
        None
    }
}

/// A symbol brought in by an `import`.
#[derive(Debug, Clone)]
pub enum Imported {
    Function(FunctionId),
    Data {
        module: ModuleId,
        slot: u32,
        ty: TypeId,
    },
    Type(TypeId),
    Module(ModuleId),
}

/// Lifetime of one named local, for debugging output.
#[derive(Debug, Clone)]
pub struct SymbolLifetime {
    pub name: String,
    pub reg: Option<VRegId>,
    pub begin: SourceLocation,
    pub end: SourceLocation,
}

/// One finished function.
#[derive(Debug)]
pub struct CompiledFunction {
    pub id: FunctionId,
    pub def: FunctionDef,
}

/// Everything one module compilation produced.
#[derive(Debug, Default)]
pub struct CompilerOutput {
    pub functions: Vec<CompiledFunction>,
    pub new_types: Vec<TypeId>,
    pub symbol_lifetimes: Vec<SymbolLifetime>,
}

/// Error sentinel: the diagnostic is already in the logger.
pub(crate) type CResult<T> = Result<T, ()>;

pub struct Compiler<'a> {
    pub(crate) arena: &'a mut NodeArena,
    pub(crate) types: &'a mut TypeRegistry,
    pub(crate) funcs: &'a mut FunctionRegistry,
    pub(crate) module: &'a mut Module,
    pub(crate) log: &'a mut Logger,
    pub(crate) templates: &'a mut TemplateStore,
    pub(crate) lookup: &'a dyn ModuleLookup,
    pub(crate) trusted: bool,

    pub(crate) imports: FxHashMap<String, Imported>,
    pub(crate) module_paths: FxHashMap<ModuleId, String>,
    pub(crate) module_symbols: FxHashMap<String, Value>,
    pub(crate) scopes: ScopeManager,
    pub(crate) fds: Vec<FunctionDef>,
    pub(crate) current_class: Option<TypeId>,

    out_functions: Vec<CompiledFunction>,
    pub(crate) new_types: Vec<TypeId>,
    pub(crate) symbol_lifetimes: Vec<SymbolLifetime>,
}

/// A function whose signature exists but whose body still needs compiling.
pub(crate) struct PendingFunction {
    fd: FunctionDef,
    id: FunctionId,
    body: NodeId,
    class: Option<TypeId>,
}

impl<'a> Compiler<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        arena: &'a mut NodeArena,
        types: &'a mut TypeRegistry,
        funcs: &'a mut FunctionRegistry,
        module: &'a mut Module,
        templates: &'a mut TemplateStore,
        lookup: &'a dyn ModuleLookup,
        trusted: bool,
        log: &'a mut Logger,
    ) -> Self {
        Self {
            arena,
            types,
            funcs,
            module,
            log,
            templates,
            lookup,
            trusted,
            imports: FxHashMap::default(),
            module_paths: FxHashMap::default(),
            module_symbols: FxHashMap::default(),
            scopes: ScopeManager::new(),
            fds: Vec::new(),
            current_class: None,
            out_functions: Vec::new(),
            new_types: Vec::new(),
            symbol_lifetimes: Vec::new(),
        }
    }

    /// Compile the module rooted at `root`. The module's `compiled` flag is
    /// set according to whether any error was logged.
    pub fn compile(mut self, root: NodeId) -> CompilerOutput {
        let errors_before = self.log.error_count();

        let mut aliases = Vec::new();
        let mut enums = Vec::new();
        let mut classes = Vec::new();
        let mut functions = Vec::new();
        let mut init_stmts = Vec::new();

        // Pass 1: sort top-level units; reserve ids for class types so that
        // members can reference each other cyclically.
        let mut cursor = self.arena.get(root).body;
        while let Some(node_id) = cursor {
            cursor = self.arena.get(node_id).next;
            self.collect_top_level(
                node_id,
                false,
                &mut aliases,
                &mut enums,
                &mut classes,
                &mut functions,
                &mut init_stmts,
            );
        }

        for &(node, exported) in &classes {
            let _ = self.reserve_class(node, exported);
        }

        // Pass 2: definitions. Classes first (aliases and signatures may
        // reference them), then enums, then aliases, then function
        // signatures.
        let mut pending: Vec<PendingFunction> = Vec::new();
        for &(node, exported) in &classes {
            if let Err(()) = self.define_class(node, exported, &mut pending) {
                continue;
            }
        }
        for &(node, exported) in &enums {
            let _ = self.define_enum(node, exported);
        }
        for &(node, exported) in &aliases {
            let _ = self.define_alias(node, exported);
        }
        for &(node, exported) in &functions {
            if let Ok(p) = self.declare_function(node, exported, None) {
                pending.push(p);
            }
        }

        // Pass 3: bodies.
        for p in pending {
            self.compile_function_body(p);
        }

        // Pass 4: module initializer from top-level statements.
        self.compile_module_init(&init_stmts);

        self.module.compiled = self.log.error_count() == errors_before;
        CompilerOutput {
            functions: self.out_functions,
            new_types: self.new_types,
            symbol_lifetimes: self.symbol_lifetimes,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn collect_top_level(
        &mut self,
        node_id: NodeId,
        exported: bool,
        aliases: &mut Vec<(NodeId, bool)>,
        enums: &mut Vec<(NodeId, bool)>,
        classes: &mut Vec<(NodeId, bool)>,
        functions: &mut Vec<(NodeId, bool)>,
        init_stmts: &mut Vec<NodeId>,
    ) {
        let node = self.arena.get(node_id);
        match node.kind {
            NodeKind::Import => {
                let _ = self.process_import(node_id);
            }
            NodeKind::Export => {
                if let Some(inner) = node.body {
                    self.collect_top_level(
                        inner, true, aliases, enums, classes, functions, init_stmts,
                    );
                }
            }
            NodeKind::TypeDecl => aliases.push((node_id, exported)),
            NodeKind::EnumDecl => enums.push((node_id, exported)),
            NodeKind::ClassDecl => {
                if node.template_params.is_some() {
                    self.templates.record_class(self.arena, node_id, &self.imports);
                } else {
                    classes.push((node_id, exported));
                }
            }
            NodeKind::FunctionDecl => {
                if node.template_params.is_some() {
                    self.templates.record_function(self.arena, node_id, &self.imports);
                } else {
                    functions.push((node_id, exported));
                }
            }
            _ => init_stmts.push(node_id),
        }
    }

    // ----- shared helpers -------------------------------------------------

    pub(crate) fn fd(&mut self) -> &mut FunctionDef {
        self.fds.last_mut().expect("no function being compiled")
    }

    pub(crate) fn fd_ref(&self) -> &FunctionDef {
        self.fds.last().expect("no function being compiled")
    }

    pub(crate) fn emit(&mut self, instr: Instruction) {
        self.fd().add(instr);
    }

    /// Log a compile error and return the function-abort sentinel.
    pub(crate) fn error<T>(&mut self, kind: CompileErrorKind, src: SourceLocation) -> CResult<T> {
        self.log
            .submit(Severity::Error, kind.code(), kind.to_string(), Some(src));
        Err(())
    }

    pub(crate) fn warn(&mut self, warning: crate::error::CompileWarning, src: SourceLocation) {
        self.log
            .submit(Severity::Warn, warning.code(), warning.to_string(), Some(src));
    }

    pub(crate) fn node_text(&self, id: NodeId) -> String {
        self.arena.get(id).text.clone().unwrap_or_default()
    }

    pub(crate) fn ident_text(&self, id: Option<NodeId>) -> String {
        id.map(|i| self.node_text(i)).unwrap_or_default()
    }

    /// Fully-qualified name of a module-level symbol.
    pub(crate) fn fqn(&self, name: &str) -> String {
        format!("{}::{}", self.module.name, name)
    }

    pub(crate) fn builtin(&self, name: &str) -> TypeId {
        TypeId::from_fqn(name)
    }

    // ----- imports --------------------------------------------------------

    fn process_import(&mut self, node_id: NodeId) -> CResult<()> {
        let node = self.arena.get(node_id);
        let src = node.loc;
        let path = node.text.clone().unwrap_or_default();
        let alias = node.identifier;
        let names: Vec<(String, SourceLocation)> = self
            .arena
            .iter_list(node.parameters)
            .map(|(_, n)| (n.text.clone().unwrap_or_default(), n.loc))
            .collect();

        let Some(imported) = self.lookup.find_module(&path) else {
            return self.error(CompileErrorKind::UnknownSymbol(path), src);
        };

        if let Some(alias) = alias {
            let name = self.node_text(alias);
            let id = imported.id;
            self.imports.insert(name, Imported::Module(id));
            self.module_paths.insert(id, path);
            return Ok(());
        }

        let module_name = imported.name.clone();
        let module_id = imported.id;
        let mut resolved = Vec::new();
        for (name, name_src) in names {
            // Exported data slot?
            if let Some(slot) = imported.find_slot(&name) {
                let ty = imported.slot(slot).map(|s| s.ty).unwrap_or_default();
                resolved.push((name, Imported::Data { module: module_id, slot, ty }));
                continue;
            }
            // Exported function?
            let fqn = format!("{}::{}", module_name, name);
            let func = imported
                .functions
                .iter()
                .filter_map(|id| self.funcs.get(*id))
                .find(|f| f.fully_qualified_name == fqn && f.access == AccessModifier::Public);
            if let Some(func) = func {
                resolved.push((name, Imported::Function(func.id)));
                continue;
            }
            // Exported type?
            if let Some(ty) = imported
                .types
                .iter()
                .filter_map(|id| self.types.get(*id))
                .find(|t| t.name == name)
            {
                resolved.push((name, Imported::Type(ty.id)));
                continue;
            }
            return self.error(
                CompileErrorKind::SymbolNotInModule(module_name.clone(), name),
                name_src,
            );
        }
        for (name, imported) in resolved {
            self.imports.insert(name, imported);
        }
        Ok(())
    }

    // ----- types ----------------------------------------------------------

    fn reserve_class(&mut self, node_id: NodeId, _exported: bool) -> CResult<TypeId> {
        let node = self.arena.get(node_id);
        let src = node.loc;
        let name = self.ident_text(node.identifier);
        let fqn = self.fqn(&name);
        match self.types.insert_incomplete(&name, &fqn) {
            Ok(id) => {
                self.module.types.push(id);
                self.new_types.push(id);
                Ok(id)
            }
            Err(_) => self.error(CompileErrorKind::DuplicateDeclaration(name), src),
        }
    }

    fn define_enum(&mut self, node_id: NodeId, exported: bool) -> CResult<TypeId> {
        let node = self.arena.get(node_id);
        let src = node.loc;
        let name = self.ident_text(node.identifier);
        let body = node.body;
        let fqn = self.fqn(&name);

        let mut enumerators = Vec::new();
        let mut next = 0i64;
        let mut cursor = body;
        while let Some(e_id) = cursor {
            let e = self.arena.get(e_id);
            cursor = e.next;
            let e_name = self.ident_text(e.identifier);
            let value = match e.initializer {
                Some(init) => match &self.arena.get(init).value {
                    Some(Literal::Signed(v, _)) => *v,
                    Some(Literal::Unsigned(v, _)) => *v as i64,
                    _ => {
                        let loc = self.arena.get(init).loc;
                        return self.error(
                            CompileErrorKind::NoImplicitConversion(
                                "expression".into(),
                                "enum value".into(),
                            ),
                            loc,
                        );
                    }
                },
                None => next,
            };
            next = value + 1;
            enumerators.push((e_name, value));
        }

        let mut dt = tern_ffi::DataType::new(
            name.clone(),
            fqn,
            tern_ffi::TypeMeta {
                size: 4,
                is_pod: true,
                is_trivially_constructible: true,
                is_trivially_copyable: true,
                is_trivially_destructible: true,
                is_integral: true,
                ..Default::default()
            },
        );
        dt.enumerators = enumerators;
        dt.access = if exported {
            AccessModifier::Public
        } else {
            AccessModifier::Private
        };

        match self.types.insert(dt) {
            Ok(id) => {
                self.module.types.push(id);
                self.new_types.push(id);
                Ok(id)
            }
            Err(_) => self.error(CompileErrorKind::DuplicateDeclaration(name), src),
        }
    }

    fn define_alias(&mut self, node_id: NodeId, exported: bool) -> CResult<TypeId> {
        let node = self.arena.get(node_id);
        let src = node.loc;
        let name = self.ident_text(node.identifier);
        let Some(target_node) = node.data_type else {
            return self.error(CompileErrorKind::UnknownType(name), src);
        };
        let target = self.resolve_type(target_node)?;

        let mut dt = tern_ffi::DataType::new(
            name.clone(),
            self.fqn(&name),
            tern_ffi::TypeMeta {
                is_alias: true,
                ..Default::default()
            },
        );
        dt.alias_of = Some(target);
        dt.access = if exported {
            AccessModifier::Public
        } else {
            AccessModifier::Private
        };

        match self.types.insert(dt) {
            Ok(id) => {
                self.module.types.push(id);
                self.new_types.push(id);
                Ok(id)
            }
            Err(_) => self.error(CompileErrorKind::DuplicateDeclaration(name), src),
        }
    }

    /// Fill in a reserved class type: layout, bases, method signatures.
    /// Method bodies are queued on `pending`.
    pub(crate) fn define_class(
        &mut self,
        node_id: NodeId,
        exported: bool,
        pending: &mut Vec<PendingFunction>,
    ) -> CResult<TypeId> {
        let node = self.arena.get(node_id);
        let name = self.ident_text(node.identifier);
        let bases_head = node.modifier;
        let members_head = node.body;
        let fqn = self.fqn(&name);
        let type_id = TypeId::from_fqn(&fqn);

        // Base classes first: their size determines member offsets
        let mut bases = Vec::new();
        let mut offset = 0u32;
        let mut cursor = bases_head;
        while let Some(base_node) = cursor {
            cursor = self.arena.get(base_node).next;
            let base_ty = self.resolve_type(base_node)?;
            let base_src = self.arena.get(base_node).loc;
            let base_size = match self.types.resolve(base_ty) {
                Some(dt) if !self.types.is_incomplete(dt.id) => dt.size(),
                _ => {
                    let base_name = self
                        .types
                        .get(base_ty)
                        .map(|t| t.name.clone())
                        .unwrap_or_default();
                    return self.error(CompileErrorKind::IncompleteType(base_name), base_src);
                }
            };
            bases.push(tern_ffi::BaseClass {
                ty: base_ty,
                offset,
            });
            offset += base_size;
        }

        let mut props = Vec::new();
        let mut methods = Vec::new();
        let mut destructor = None;
        let mut method_nodes = Vec::new();

        let mut cursor = members_head;
        while let Some(member_id) = cursor {
            let member = self.arena.get(member_id);
            cursor = member.next;
            match member.kind {
                NodeKind::ClassProperty => {
                    let prop_name = self.ident_text(member.identifier);
                    let is_private = member.flags.is_private;
                    let is_static = member.flags.is_static;
                    let Some(ty_node) = member.data_type else { continue };
                    let prop_ty = self.resolve_type(ty_node)?;
                    let size = self
                        .types
                        .resolve(prop_ty)
                        .map(|t| t.size().max(1))
                        .unwrap_or(8);
                    let aligned = offset.div_ceil(size.min(8)) * size.min(8);
                    let mut prop = tern_ffi::Property::field(prop_name, prop_ty, aligned);
                    prop.is_static = is_static;
                    prop.access = if is_private {
                        AccessModifier::Private
                    } else {
                        AccessModifier::Public
                    };
                    if !is_static {
                        offset = aligned + size;
                    }
                    props.push(prop);
                }
                NodeKind::FunctionDecl => method_nodes.push(member_id),
                _ => {}
            }
        }

        // Accessor properties: get/set methods surface as properties
        for &m in &method_nodes {
            let member = self.arena.get(m);
            if member.flags.is_getter || member.flags.is_setter {
                let prop_name = self.ident_text(member.identifier);
                if !props.iter().any(|p: &tern_ffi::Property| p.name == prop_name) {
                    let Some(ret_node) = member.data_type.or_else(|| {
                        self.arena
                            .iter_list(member.parameters)
                            .next()
                            .and_then(|(_, p)| p.data_type)
                    }) else {
                        continue;
                    };
                    let prop_ty = self.resolve_type(ret_node)?;
                    let mut prop = tern_ffi::Property::field(prop_name, prop_ty, 0);
                    prop.can_read = false;
                    prop.can_write = false;
                    props.push(prop);
                }
            }
        }

        let size = offset.max(1);
        let mut dt = tern_ffi::DataType::new(
            name.clone(),
            fqn,
            tern_ffi::TypeMeta {
                size,
                is_pod: false,
                ..Default::default()
            },
        );
        dt.bases = bases;
        dt.props = props;
        dt.access = if exported {
            AccessModifier::Public
        } else {
            AccessModifier::Private
        };

        // Method signatures, now that the layout exists
        let prev_class = self.current_class.replace(type_id);
        for &m in &method_nodes {
            let member = self.arena.get(m);
            let method_name = self.ident_text(member.identifier);
            let is_getter = member.flags.is_getter;
            let is_setter = member.flags.is_setter;
            match self.declare_function(m, true, Some(type_id)) {
                Ok(p) => {
                    let fid = p.id;
                    if self
                        .funcs
                        .get(fid)
                        .map(|f| f.kind == FunctionKind::Destructor)
                        .unwrap_or(false)
                    {
                        destructor = Some(fid);
                    } else {
                        methods.push(fid);
                    }
                    if is_getter || is_setter {
                        if let Some(prop) = dt.props.iter_mut().find(|pr| pr.name == method_name) {
                            if is_getter {
                                prop.getter = Some(fid);
                                prop.can_read = true;
                            } else {
                                prop.setter = Some(fid);
                                prop.can_write = true;
                            }
                        }
                    }
                    pending.push(p);
                }
                Err(()) => {}
            }
        }
        self.current_class = prev_class;

        dt.methods = methods;
        dt.destructor = destructor;
        if self.types.complete(dt).is_err() {
            let node_src = self.arena.get(node_id).loc;
            return self.error(CompileErrorKind::DuplicateDeclaration(name), node_src);
        }
        Ok(type_id)
    }

    // ----- functions ------------------------------------------------------

    /// Build a `FunctionDef` and register the `Function` record for one
    /// declaration, without compiling the body.
    pub(crate) fn declare_function(
        &mut self,
        node_id: NodeId,
        exported: bool,
        class: Option<TypeId>,
    ) -> CResult<PendingFunction> {
        let node = self.arena.get(node_id);
        let src = node.loc;
        let name = self.ident_text(node.identifier);
        let params_head = node.parameters;
        let ret_node = node.data_type;
        let body = node.body;
        let is_private = node.flags.is_private;
        let is_getter = node.flags.is_getter;
        let is_setter = node.flags.is_setter;

        let kind = match (&name[..], class) {
            ("constructor", Some(_)) => FunctionKind::Constructor,
            ("destructor", Some(_)) => FunctionKind::Destructor,
            (_, Some(_)) => FunctionKind::Method,
            (_, None) => FunctionKind::Function,
        };

        let reg_name = if is_getter {
            format!("$get_{name}")
        } else if is_setter {
            format!("$set_{name}")
        } else {
            name.clone()
        };

        let owner_fqn = match class.and_then(|c| self.types.get(c)) {
            Some(dt) => format!("{}::{}", dt.fully_qualified_name, reg_name),
            None => self.fqn(&reg_name),
        };

        let mut fd = FunctionDef::new(reg_name.clone(), owner_fqn.clone(), src);
        fd.kind = kind;
        if let Some(class_ty) = class {
            fd.set_this_type(class_ty);
        }

        // Arguments
        let mut sig_args = Vec::new();
        if let Some(class_ty) = class {
            sig_args.push(Argument::pointer(class_ty));
        }
        let mut cursor = params_head;
        while let Some(p_id) = cursor {
            let p = self.arena.get(p_id);
            cursor = p.next;
            let p_name = self.ident_text(p.identifier);
            let Some(ty_node) = p.data_type else {
                let loc = p.loc;
                return self.error(CompileErrorKind::UnknownType(p_name), loc);
            };
            let p_ty = self.resolve_type(ty_node)?;
            let by_pointer = !self
                .types
                .resolve(p_ty)
                .map(|t| t.is_register_sized())
                .unwrap_or(false);
            fd.add_arg(&p_name, p_ty, by_pointer);
            sig_args.push(if by_pointer {
                Argument::pointer(p_ty)
            } else {
                Argument::value(p_ty)
            });
        }

        // Return type
        let ret = match ret_node {
            Some(r) => {
                let ty = self.resolve_type(r)?;
                let void = self.builtin("void");
                let ty = if ty == void { None } else { Some(ty) };
                fd.set_return_type(ty, true);
                ty
            }
            None => {
                fd.set_return_type(None, false);
                None
            }
        };
        if matches!(kind, FunctionKind::Constructor | FunctionKind::Destructor) && ret.is_some() {
            return self.error(
                CompileErrorKind::VoidReturnValue(if kind == FunctionKind::Constructor {
                    "a constructor"
                } else {
                    "a destructor"
                }),
                src,
            );
        }

        let signature = FunctionSignature::new(ret, sig_args);
        let sig_type = self.types.signature_type(&signature);
        let mut func = Function::new(reg_name, owner_fqn, kind, signature, sig_type);
        func.this_type = class;
        func.implicit_args = if class.is_some() { 1 } else { 0 };
        func.access = if is_private {
            AccessModifier::Private
        } else if exported {
            AccessModifier::Public
        } else {
            AccessModifier::Private
        };
        fd.access = func.access;

        let id = match self.funcs.register(func) {
            Ok(id) => id,
            Err(_) => {
                let name = self.ident_text(self.arena.get(node_id).identifier);
                return self.error(CompileErrorKind::DuplicateDeclaration(name), src);
            }
        };
        self.module.functions.push(id);

        let Some(body) = body else {
            return self.error(CompileErrorKind::UnknownSymbol("function body".into()), src);
        };
        Ok(PendingFunction {
            fd,
            id,
            body,
            class,
        })
    }

    fn compile_function_body(&mut self, p: PendingFunction) {
        let PendingFunction {
            fd,
            id,
            body,
            class,
        } = p;
        let prev_class = self.current_class;
        self.current_class = class;
        self.fds.push(fd);
        self.scopes.push(ScopeKind::Function);

        // Arguments become named locals
        let args: Vec<(String, Value, SourceLocation)> = {
            let fd = self.fd_ref();
            (0..fd.args.len())
                .filter_map(|i| {
                    let info = &fd.args[i];
                    fd.arg(i).map(|v| (info.name.clone(), v, fd.src))
                })
                .collect()
        };
        for (name, value, src) in args {
            let _ = self.scopes.declare(LocalSymbol {
                name,
                value,
                is_const: false,
                decl_src: src,
            });
        }

        let result = self.compile_block_body(body);

        if result.is_ok() {
            // Implicit return on falling off the end
            let needs_ret = self
                .fd_ref()
                .code
                .last()
                .map(|i| i.op != Op::Ret)
                .unwrap_or(true);
            if needs_ret {
                let _ = self.emit_return(None, self.fd_ref().src);
            }
        }

        self.record_scope_lifetimes();
        self.scopes.pop();
        self.current_class = prev_class;
        let mut fd = self.fds.pop().expect("function stack imbalance");
        if result.is_err() {
            // Abort this function's emission; leave a bare terminator so the
            // def stays well formed
            fd.code.clear();
            fd.add(Instruction::new(Op::Term, fd.src));
        }
        self.out_functions.push(CompiledFunction { id, def: fd });
    }

    fn compile_module_init(&mut self, stmts: &[NodeId]) {
        let src = stmts
            .first()
            .map(|&s| self.arena.get(s).loc)
            .unwrap_or_default();
        let mut fd = FunctionDef::new("$init", self.fqn("$init"), src);
        fd.set_return_type(None, true);

        let signature = FunctionSignature::new(None, Vec::new());
        let sig_type = self.types.signature_type(&signature);
        let func = Function::new("$init", self.fqn("$init"), FunctionKind::Function, signature, sig_type);
        let id = match self.funcs.register(func) {
            Ok(id) => id,
            Err(_) => return,
        };
        self.module.functions.push(id);

        self.fds.push(fd);
        self.scopes.push(ScopeKind::Function);

        let mut ok = true;
        for &stmt in stmts {
            if self.compile_module_level_stmt(stmt).is_err() {
                ok = false;
                break;
            }
        }
        if ok {
            let src = self.fd_ref().src;
            let _ = self.emit_return(None, src);
        }

        self.record_scope_lifetimes();
        self.scopes.pop();
        let mut fd = self.fds.pop().expect("function stack imbalance");
        if !ok {
            fd.code.clear();
            fd.add(Instruction::new(Op::Term, fd.src));
        }
        self.out_functions.push(CompiledFunction { id, def: fd });
    }

    fn record_scope_lifetimes(&mut self) {
        let end = self
            .fd_ref()
            .code
            .last()
            .map(|i| i.src)
            .unwrap_or_default();
        if let Some(scope) = self.scopes.top() {
            for sym in scope.symbols() {
                self.symbol_lifetimes.push(SymbolLifetime {
                    name: sym.name.clone(),
                    reg: sym.value.reg_id(),
                    begin: sym.decl_src,
                    end,
                });
            }
        }
    }
}
