//! The embedding context.
//!
//! A [`Context`] owns the type and function registries, the compiled
//! modules, the encoded program, and one VM. It drives the whole pipeline:
//! lex → parse → compile → optimize → allocate → encode, then runs the
//! module initializer. Hosts bind symbols first, compile modules second,
//! and call script functions last.

use crate::bytecode::{DataResolver, EncodeError, Encoder, Program, FP_COUNT, GP_COUNT};
use crate::config::Config;
use crate::vm::{Vm, VmError};
use rustc_hash::FxHashMap;
use std::path::Path;
use tern_compiler::compile::TemplateStore;
use tern_compiler::ir::CodeHolder;
use tern_compiler::persist::{self, ApiVersions, PersistError};
use tern_compiler::{
    CompiledFunction, Compiler, ModuleLookup, OptimizationGroup, OptimizeContext,
    RegisterAllocator,
};
use tern_ffi::{
    BindError, Bindings, FfiPrimitive, FunctionId, FunctionRegistry, Module, ModuleId,
    TypeRegistry,
};
use tern_parser::{
    parse_module, Logger, LogMessage, ModuleSource, NodeArena, ParseContext, SourceLocation,
};
use thiserror::Error;

/// Host API version stamped into persisted modules.
pub const API_VERSION: u32 = 4;
/// Builtin table version stamped into persisted modules.
pub const BUILTIN_API_VERSION: u32 = 2;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("module '{0}' failed to compile with {1} error(s)")]
    CompileFailed(String, usize),
    #[error("module '{0}' is not loaded")]
    UnknownModule(String),
    #[error("function '{0}' not found")]
    UnknownFunction(String),
    #[error("script exception: {message}")]
    Exception {
        message: String,
        /// Captured script locations, innermost first.
        call_stack: Vec<SourceLocation>,
    },
    #[error(transparent)]
    Bind(#[from] BindError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Persist(#[from] PersistError),
    #[error(transparent)]
    Vm(#[from] VmError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One compiled module with everything needed to re-encode or persist it.
pub struct LoadedModule {
    pub module: Module,
    pub functions: Vec<CompiledFunction>,
    pub templates: TemplateStore,
    pub arena: NodeArena,
}

struct ModuleMap<'a>(&'a FxHashMap<String, LoadedModule>);

impl<'a> ModuleLookup for ModuleMap<'a> {
    fn find_module(&self, path: &str) -> Option<&Module> {
        self.0.get(path).map(|m| &m.module)
    }
}

struct SlotResolver<'a>(&'a FxHashMap<String, LoadedModule>);

impl<'a> DataResolver for SlotResolver<'a> {
    fn slot_address(&self, module: ModuleId, slot: u32) -> Option<*const u8> {
        self.0
            .values()
            .find(|m| m.module.id == module)
            .and_then(|m| m.module.slot(slot))
            .map(|s| s.ptr())
    }
}

/// One embedding context: registries, modules, program, and VM.
pub struct Context {
    config: Config,
    types: TypeRegistry,
    funcs: FunctionRegistry,
    modules: FxHashMap<String, LoadedModule>,
    program: Program,
    vm: Vm,
    log: Logger,
}

impl Context {
    pub fn new(config: Config) -> Self {
        let mut log = Logger::new();
        log.set_debug_enabled(config.debug_logging);
        Self {
            config,
            types: TypeRegistry::new(),
            funcs: FunctionRegistry::new(),
            modules: FxHashMap::default(),
            program: Program::new(),
            vm: Vm::new(),
            log,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    pub fn functions(&self) -> &FunctionRegistry {
        &self.funcs
    }

    /// Accumulated diagnostics.
    pub fn messages(&self) -> &[LogMessage] {
        self.log.messages()
    }

    /// Register host bindings. Must happen before compiling modules that use
    /// them.
    pub fn bindings(&mut self) -> Bindings<'_> {
        Bindings::new(&mut self.types, &mut self.funcs)
    }

    pub fn module(&self, path: &str) -> Option<&LoadedModule> {
        self.modules.get(path)
    }

    /// Compile `source` as the module at `path`, then run its initializer.
    ///
    /// On failure the module is stored empty with its log and an error is
    /// returned; other modules stay usable.
    pub fn compile_module(&mut self, path: &str, source: &str) -> Result<ModuleId, EngineError> {
        let name = Path::new(path)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(path)
            .to_string();
        let src = ModuleSource::new(path, source);

        let errors_before = self.log.error_count();
        let type_names: Vec<String> = self.types.iter().map(|t| t.name.clone()).collect();
        let mut parsed = parse_module(&src, ParseContext::with_type_names(type_names), &mut self.log);

        let mut module = Module::new(name.clone(), path);
        let mut templates = TemplateStore::new();
        let lookup = ModuleMap(&self.modules);
        let output = Compiler::new(
            &mut parsed.arena,
            &mut self.types,
            &mut self.funcs,
            &mut module,
            &mut templates,
            &lookup,
            self.config.trusted_modules,
            &mut self.log,
        )
        .compile(parsed.root);

        let module_id = module.id;
        module.log = self.log.messages()[..].to_vec();

        if !module.compiled {
            let errors = self.log.error_count() - errors_before;
            // An uncompiled module keeps only its log
            let empty = LoadedModule {
                module,
                functions: Vec::new(),
                templates,
                arena: parsed.arena,
            };
            self.modules.insert(path.to_string(), empty);
            return Err(EngineError::CompileFailed(name, errors));
        }

        let loaded = LoadedModule {
            module,
            functions: output.functions,
            templates,
            arena: parsed.arena,
        };
        self.modules.insert(path.to_string(), loaded);
        self.lower_module(path)?;
        self.run_initializer(path)?;
        Ok(module_id)
    }

    /// Optimize, allocate, and encode every function of a loaded module,
    /// then publish the entry addresses.
    fn lower_module(&mut self, path: &str) -> Result<(), EngineError> {
        let Some(loaded) = self.modules.get(path) else {
            return Err(EngineError::UnknownModule(path.to_string()));
        };

        let mut lowered: Vec<(FunctionId, u32)> = Vec::new();
        {
            let resolver = SlotResolver(&self.modules);
            let encoder = Encoder::new(&self.types, &resolver);
            let mut group = OptimizationGroup::default_pipeline();

            for cf in &loaded.functions {
                let mut holder = CodeHolder::new(cf.def.code.clone()).with_owner(cf.id);
                {
                    let mut octx = OptimizeContext {
                        types: &self.types,
                        log: &mut self.log,
                        enabled: !self.config.disable_optimizations,
                    };
                    group.process(&mut holder, &mut octx);
                }
                holder.strip_meta(&self.types);
                let alloc = RegisterAllocator::new(GP_COUNT, FP_COUNT).process(&mut holder, &self.types);
                let entry = encoder.encode_function(&cf.def, &holder, &alloc, &mut self.program)?;
                lowered.push((cf.id, entry));
                if self.config.debug_logging {
                    self.log.debug(
                        2,
                        format!("encoded {} at {}", cf.def.fully_qualified_name, entry),
                    );
                }
            }
        }
        for (fid, entry) in lowered {
            if let Some(f) = self.funcs.get_mut(fid) {
                f.entry = Some(entry);
            }
        }
        Ok(())
    }

    fn run_initializer(&mut self, path: &str) -> Result<(), EngineError> {
        if self.config.disable_execution {
            return Ok(());
        }
        let Some(init) = self.find_function(path, "$init") else {
            return Ok(());
        };
        self.call_raw(init, &[]).map(|_| ())
    }

    /// Look up a function by unqualified name within a module.
    pub fn find_function(&self, path: &str, name: &str) -> Option<FunctionId> {
        let loaded = self.modules.get(path)?;
        loaded
            .module
            .functions
            .iter()
            .copied()
            .find(|fid| self.funcs.get(*fid).map(|f| f.name == name).unwrap_or(false))
    }

    /// Call a script (or host) function with raw argument words, returning
    /// the raw return word. Pushes a fresh execution context for the call;
    /// a raised exception surfaces as [`EngineError::Exception`].
    pub fn call_raw(&mut self, fid: FunctionId, args: &[u64]) -> Result<u64, EngineError> {
        if self.config.disable_execution {
            return Ok(0);
        }
        tern_ffi::push_context();
        let result = self
            .vm
            .call_function(&self.program, &self.types, &self.funcs, fid, args);
        let ectx = tern_ffi::pop_context().unwrap_or_default();

        match result {
            Ok(word) => Ok(word),
            Err(err) => {
                if ectx.has_exception() {
                    Err(EngineError::Exception {
                        message: ectx.message().to_string(),
                        call_stack: ectx.call_stack().to_vec(),
                    })
                } else {
                    Err(err.into())
                }
            }
        }
    }

    /// Typed convenience over [`Context::call_raw`].
    pub fn call<R: FfiPrimitive>(&mut self, fid: FunctionId, args: &[u64]) -> Result<R, EngineError> {
        self.call_raw(fid, args).map(R::from_word)
    }

    /// Disassembled program listing, for the debug log.
    pub fn program_listing(&self) -> String {
        self.program.listing()
    }

    // ----- persistence ----------------------------------------------------

    fn versions() -> ApiVersions {
        ApiVersions {
            api_version: API_VERSION,
            builtin_api_version: BUILTIN_API_VERSION,
        }
    }

    /// Serialize a compiled module to an opaque byte buffer.
    pub fn save_module(&self, path: &str) -> Result<Vec<u8>, EngineError> {
        let loaded = self
            .modules
            .get(path)
            .ok_or_else(|| EngineError::UnknownModule(path.to_string()))?;
        Ok(persist::write_module(
            &loaded.module,
            &loaded.functions,
            &self.types,
            &loaded.templates,
            &loaded.arena,
            Self::versions(),
        ))
    }

    /// Restore a module from bytes produced by [`Context::save_module`],
    /// lower it, and run its initializer. Version mismatches surface as
    /// [`PersistError`]s whose `invalidates_cache` is true; the host then
    /// recompiles from source.
    pub fn load_module(&mut self, bytes: &[u8]) -> Result<ModuleId, EngineError> {
        let mut templates = TemplateStore::new();
        let mut arena = NodeArena::new();
        let (module, functions) = persist::read_module(
            bytes,
            &mut self.types,
            &mut self.funcs,
            &mut templates,
            &mut arena,
            Self::versions(),
        )?;

        let path = module.path.clone();
        let module_id = module.id;
        self.modules.insert(
            path.clone(),
            LoadedModule {
                module,
                functions,
                templates,
                arena,
            },
        );
        self.lower_module(&path)?;
        self.run_initializer(&path)?;
        Ok(module_id)
    }

    /// Persist a module into the support directory.
    pub fn save_module_to_disk(&self, path: &str) -> Result<std::path::PathBuf, EngineError> {
        let bytes = self.save_module(path)?;
        std::fs::create_dir_all(&self.config.support_dir)?;
        let file = self
            .config
            .support_dir
            .join(format!("{:08x}.tnc", ModuleId::from_path(path).as_u32()));
        std::fs::write(&file, bytes)?;
        Ok(file)
    }

    /// Load a module image previously written to the support directory.
    pub fn load_module_from_disk(&mut self, path: &str) -> Result<ModuleId, EngineError> {
        let file = self
            .config
            .support_dir
            .join(format!("{:08x}.tnc", ModuleId::from_path(path).as_u32()));
        let bytes = std::fs::read(file)?;
        self.load_module(&bytes)
    }
}
