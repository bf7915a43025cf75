//! Compiled-module persistence.
//!
//! A compiled module serializes to an opaque byte buffer: header, the types
//! and functions it introduced (script functions with their IR and source
//! map), data-slot descriptors with initial contents, and the template
//! contexts (AST plus captured imports). On restore, every `type_id` and
//! `function_id` reference is checked against the live registries; host
//! symbols must have been re-bound by the embedder first. Version mismatches
//! invalidate the cache and the caller recompiles from source.

mod format;

pub use format::{ByteReader, ByteWriter, PersistError, FORMAT_VERSION, MODULE_MAGIC};

use crate::compile::{CompiledFunction, Imported, TemplateDecl, TemplateKind, TemplateStore};
use crate::ir::{
    FunctionDef, Immediate, Instruction, Op, Value, ValueFlags, ValueKind,
};
use rustc_hash::FxHashMap;
use tern_ffi::{
    AccessModifier, Argument, ArgType, BaseClass, DataType, Function, FunctionId, FunctionKind,
    FunctionRegistry, FunctionSignature, Module, ModuleId, Property, TypeId, TypeMeta,
    TypeRegistry,
};
use tern_parser::{
    IntSuffix, Literal, NodeArena, NodeId, NodeKind, OperatorKind, ParseNode, SourceLocation,
};

/// Host-supplied versioning for cache invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiVersions {
    pub api_version: u32,
    pub builtin_api_version: u32,
}

/// Serialize one compiled module.
pub fn write_module(
    module: &Module,
    functions: &[CompiledFunction],
    types: &TypeRegistry,
    templates: &TemplateStore,
    arena: &NodeArena,
    versions: ApiVersions,
) -> Vec<u8> {
    let mut w = ByteWriter::new();

    // Header
    w.u32(MODULE_MAGIC);
    w.u16(FORMAT_VERSION);
    w.u32(versions.api_version);
    w.u32(versions.builtin_api_version);
    w.u32(module.id.as_u32());
    w.str(&module.name);
    w.str(&module.path);
    w.u64(module.modified_on);

    // Types introduced by this module
    w.u32(module.types.len() as u32);
    for &ty in &module.types {
        if let Some(dt) = types.get(ty) {
            write_data_type(&mut w, dt);
        } else {
            // Unreachable with a coherent registry; keep the count honest
            write_data_type(&mut w, &DataType::new("", "", TypeMeta::default()));
        }
    }

    // Script functions with IR
    w.u32(functions.len() as u32);
    for cf in functions {
        w.u32(cf.id.as_u32());
        write_function_def(&mut w, &cf.def);
    }

    // Data slots (with initial contents, which hold literal data)
    w.u32(module.data_slots.len() as u32);
    for slot in &module.data_slots {
        w.str(&slot.name);
        w.u32(slot.ty.as_u32());
        write_access(&mut w, slot.access);
        w.bytes(slot.bytes());
    }

    // Template contexts
    let decls: Vec<&TemplateDecl> = templates.declarations().collect();
    w.u32(decls.len() as u32);
    for decl in decls {
        write_template(&mut w, decl, arena);
    }

    w.finish()
}

/// Restore a module serialized by [`write_module`].
///
/// Types and script functions are re-registered; references to symbols that
/// should already exist (host bindings, builtins) are validated against the
/// live registries.
pub fn read_module(
    bytes: &[u8],
    types: &mut TypeRegistry,
    funcs: &mut FunctionRegistry,
    templates: &mut TemplateStore,
    arena: &mut NodeArena,
    versions: ApiVersions,
) -> Result<(Module, Vec<CompiledFunction>), PersistError> {
    let mut r = ByteReader::new(bytes)?;

    if r.u32()? != MODULE_MAGIC {
        return Err(PersistError::BadMagic);
    }
    let format = r.u16()?;
    if format != FORMAT_VERSION {
        return Err(PersistError::FormatVersion {
            expected: FORMAT_VERSION,
            found: format,
        });
    }
    let api = r.u32()?;
    if api != versions.api_version {
        return Err(PersistError::ApiVersion {
            expected: versions.api_version,
            found: api,
        });
    }
    let builtin = r.u32()?;
    if builtin != versions.builtin_api_version {
        return Err(PersistError::BuiltinApiVersion {
            expected: versions.builtin_api_version,
            found: builtin,
        });
    }

    let _module_id = r.u32()?;
    let name = r.str()?;
    let path = r.str()?;
    let modified_on = r.u64()?;
    let mut module = Module::new(name, path);
    module.modified_on = modified_on;

    // Serialized-id → live-id fixups (ids are name-derived, so a fixup only
    // diverges when the registry already holds the symbol)
    let mut type_fixup: FxHashMap<u32, TypeId> = FxHashMap::default();

    let type_count = r.u32()?;
    for _ in 0..type_count {
        let dt = read_data_type(&mut r)?;
        let serialized_id = dt.id.as_u32();
        let live = match types.by_fqn(&dt.fully_qualified_name) {
            Some(existing) => existing.id,
            None => {
                let id = dt.id;
                types
                    .insert(dt)
                    .map_err(|_| PersistError::Corrupt("duplicate type in image"))?;
                id
            }
        };
        type_fixup.insert(serialized_id, live);
        module.types.push(live);
    }

    let func_count = r.u32()?;
    let mut functions = Vec::with_capacity(func_count as usize);
    for _ in 0..func_count {
        let id = FunctionId(r.u32()?);
        let def = read_function_def(&mut r)?;
        let func = function_record_from_def(&def, types)?;
        let live_id = if funcs.index_of(id).is_some() {
            id
        } else {
            debug_assert_eq!(func.id, id, "function id must be content-stable");
            funcs
                .register(func)
                .map_err(|_| PersistError::Corrupt("duplicate function in image"))?
        };
        module.functions.push(live_id);
        functions.push(CompiledFunction { id: live_id, def });
    }

    let slot_count = r.u32()?;
    for _ in 0..slot_count {
        let name = r.str()?;
        let ty_raw = r.u32()?;
        let access = read_access(&mut r)?;
        let contents = r.bytes()?;
        let ty = *type_fixup
            .get(&ty_raw)
            .or(types.get(TypeId(ty_raw)).map(|t| &t.id))
            .ok_or(PersistError::UnknownTypeRef(ty_raw))?;
        let slot = module.add_data_slot(name, ty, contents.len() as u32, access);
        if let Some(s) = module.slot_mut(slot) {
            s.bytes_mut().copy_from_slice(&contents);
        }
    }

    let template_count = r.u32()?;
    for _ in 0..template_count {
        read_template(&mut r, templates, arena)?;
    }

    Ok((module, functions))
}

// ----- types ---------------------------------------------------------------

fn write_access(w: &mut ByteWriter, access: AccessModifier) {
    w.u8(match access {
        AccessModifier::Public => 0,
        AccessModifier::Private => 1,
        AccessModifier::Trusted => 2,
    });
}

fn read_access(r: &mut ByteReader) -> Result<AccessModifier, PersistError> {
    Ok(match r.u8()? {
        0 => AccessModifier::Public,
        1 => AccessModifier::Private,
        2 => AccessModifier::Trusted,
        _ => return Err(PersistError::Corrupt("bad access modifier")),
    })
}

fn write_meta(w: &mut ByteWriter, meta: &TypeMeta) {
    w.u32(meta.size);
    let flags = (meta.is_pod as u16)
        | ((meta.is_trivially_constructible as u16) << 1)
        | ((meta.is_trivially_copyable as u16) << 2)
        | ((meta.is_trivially_destructible as u16) << 3)
        | ((meta.is_primitive as u16) << 4)
        | ((meta.is_floating_point as u16) << 5)
        | ((meta.is_integral as u16) << 6)
        | ((meta.is_unsigned as u16) << 7)
        | ((meta.is_function as u16) << 8)
        | ((meta.is_template as u16) << 9)
        | ((meta.is_alias as u16) << 10)
        | ((meta.is_host as u16) << 11)
        | ((meta.is_anonymous as u16) << 12);
    w.u16(flags);
    w.u64(meta.host_hash);
}

fn read_meta(r: &mut ByteReader) -> Result<TypeMeta, PersistError> {
    let size = r.u32()?;
    let flags = r.u16()?;
    let host_hash = r.u64()?;
    Ok(TypeMeta {
        size,
        is_pod: flags & 1 != 0,
        is_trivially_constructible: flags & (1 << 1) != 0,
        is_trivially_copyable: flags & (1 << 2) != 0,
        is_trivially_destructible: flags & (1 << 3) != 0,
        is_primitive: flags & (1 << 4) != 0,
        is_floating_point: flags & (1 << 5) != 0,
        is_integral: flags & (1 << 6) != 0,
        is_unsigned: flags & (1 << 7) != 0,
        is_function: flags & (1 << 8) != 0,
        is_template: flags & (1 << 9) != 0,
        is_alias: flags & (1 << 10) != 0,
        is_host: flags & (1 << 11) != 0,
        is_anonymous: flags & (1 << 12) != 0,
        host_hash,
    })
}

fn write_signature(w: &mut ByteWriter, sig: &FunctionSignature) {
    w.opt_u32(sig.return_type.map(|t| t.as_u32()));
    w.bool(sig.returns_via_pointer);
    w.u32(sig.args.len() as u32);
    for arg in &sig.args {
        w.u8(match arg.arg_type {
            ArgType::ContextPtr => 0,
            ArgType::Value => 1,
            ArgType::Pointer => 2,
        });
        w.u32(arg.ty.as_u32());
    }
}

fn read_signature(r: &mut ByteReader) -> Result<FunctionSignature, PersistError> {
    let return_type = r.opt_u32()?.map(TypeId);
    let returns_via_pointer = r.bool()?;
    let count = r.u32()?;
    let mut args = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let arg_type = match r.u8()? {
            0 => ArgType::ContextPtr,
            1 => ArgType::Value,
            2 => ArgType::Pointer,
            _ => return Err(PersistError::Corrupt("bad argument kind")),
        };
        args.push(Argument {
            arg_type,
            ty: TypeId(r.u32()?),
        });
    }
    let mut sig = FunctionSignature::new(return_type, args);
    sig.returns_via_pointer = returns_via_pointer;
    Ok(sig)
}

fn write_data_type(w: &mut ByteWriter, dt: &DataType) {
    w.u32(dt.id.as_u32());
    w.str(&dt.name);
    w.str(&dt.fully_qualified_name);
    write_meta(w, &dt.meta);
    write_access(w, dt.access);

    w.u32(dt.props.len() as u32);
    for p in &dt.props {
        w.str(&p.name);
        w.u32(p.ty.as_u32());
        w.u32(p.offset);
        write_access(w, p.access);
        w.bool(p.can_read);
        w.bool(p.can_write);
        w.bool(p.is_static);
        w.opt_u32(p.getter.map(|f| f.as_u32()));
        w.opt_u32(p.setter.map(|f| f.as_u32()));
    }

    w.u32(dt.bases.len() as u32);
    for b in &dt.bases {
        w.u32(b.ty.as_u32());
        w.u32(b.offset);
    }

    w.u32(dt.methods.len() as u32);
    for m in &dt.methods {
        w.u32(m.as_u32());
    }
    w.opt_u32(dt.destructor.map(|f| f.as_u32()));

    match &dt.signature {
        Some(sig) => {
            w.bool(true);
            write_signature(w, sig);
        }
        None => w.bool(false),
    }
    w.opt_u32(dt.alias_of.map(|t| t.as_u32()));

    w.u32(dt.enumerators.len() as u32);
    for (name, value) in &dt.enumerators {
        w.str(name);
        w.i64(*value);
    }
}

fn read_data_type(r: &mut ByteReader) -> Result<DataType, PersistError> {
    let id = TypeId(r.u32()?);
    let name = r.str()?;
    let fqn = r.str()?;
    let meta = read_meta(r)?;
    let access = read_access(r)?;

    let mut dt = DataType::new(name, fqn, meta);
    debug_assert_eq!(dt.id, id, "type id must be content-stable");
    dt.access = access;

    let prop_count = r.u32()?;
    for _ in 0..prop_count {
        let name = r.str()?;
        let ty = TypeId(r.u32()?);
        let offset = r.u32()?;
        let access = read_access(r)?;
        let can_read = r.bool()?;
        let can_write = r.bool()?;
        let is_static = r.bool()?;
        let getter = r.opt_u32()?.map(FunctionId);
        let setter = r.opt_u32()?.map(FunctionId);
        dt.props.push(Property {
            name,
            ty,
            offset,
            access,
            can_read,
            can_write,
            is_static,
            getter,
            setter,
        });
    }

    let base_count = r.u32()?;
    for _ in 0..base_count {
        dt.bases.push(BaseClass {
            ty: TypeId(r.u32()?),
            offset: r.u32()?,
        });
    }

    let method_count = r.u32()?;
    for _ in 0..method_count {
        dt.methods.push(FunctionId(r.u32()?));
    }
    dt.destructor = r.opt_u32()?.map(FunctionId);

    if r.bool()? {
        dt.signature = Some(read_signature(r)?);
    }
    dt.alias_of = r.opt_u32()?.map(TypeId);

    let enum_count = r.u32()?;
    for _ in 0..enum_count {
        let name = r.str()?;
        let value = r.i64()?;
        dt.enumerators.push((name, value));
    }

    Ok(dt)
}

// ----- IR ------------------------------------------------------------------

fn write_src(w: &mut ByteWriter, src: &SourceLocation) {
    w.u32(src.offset);
    w.u32(src.length);
    w.u32(src.line);
    w.u32(src.column);
    w.u32(src.end_line);
    w.u32(src.end_column);
}

fn read_src(r: &mut ByteReader) -> Result<SourceLocation, PersistError> {
    Ok(SourceLocation {
        offset: r.u32()?,
        length: r.u32()?,
        line: r.u32()?,
        column: r.u32()?,
        end_line: r.u32()?,
        end_column: r.u32()?,
    })
}

fn write_value(w: &mut ByteWriter, v: &Value) {
    match &v.kind {
        ValueKind::Register(reg) => {
            w.u8(0);
            w.u32(*reg);
        }
        ValueKind::Imm(imm) => {
            w.u8(1);
            match imm {
                Immediate::Int(x) => {
                    w.u8(0);
                    w.i64(*x);
                }
                Immediate::UInt(x) => {
                    w.u8(1);
                    w.u64(*x);
                }
                Immediate::F32(x) => {
                    w.u8(2);
                    w.f32(*x);
                }
                Immediate::F64(x) => {
                    w.u8(3);
                    w.f64(*x);
                }
                Immediate::Func(f) => {
                    w.u8(4);
                    w.u32(f.as_u32());
                }
                Immediate::Module(m) => {
                    w.u8(5);
                    w.u32(m.as_u32());
                }
            }
        }
        ValueKind::StackAlloc(a) => {
            w.u8(2);
            w.u32(*a);
        }
        ValueKind::ModuleData { module, slot } => {
            w.u8(3);
            w.u32(module.as_u32());
            w.u32(*slot);
        }
        ValueKind::Poison => w.u8(4),
        ValueKind::Null => w.u8(5),
    }
    w.u32(v.ty.as_u32());
    let flags = (v.flags.readable as u8)
        | ((v.flags.writable as u8) << 1)
        | ((v.flags.is_static as u8) << 2)
        | ((v.flags.is_pointer as u8) << 3)
        | ((v.flags.is_heap as u8) << 4);
    w.u8(flags);
    w.opt_u32(v.stack_ref);
    w.opt_str(v.label.as_deref());
}

fn read_value(r: &mut ByteReader) -> Result<Value, PersistError> {
    let kind = match r.u8()? {
        0 => ValueKind::Register(r.u32()?),
        1 => {
            let imm = match r.u8()? {
                0 => Immediate::Int(r.i64()?),
                1 => Immediate::UInt(r.u64()?),
                2 => Immediate::F32(r.f32()?),
                3 => Immediate::F64(r.f64()?),
                4 => Immediate::Func(FunctionId(r.u32()?)),
                5 => Immediate::Module(ModuleId(r.u32()?)),
                _ => return Err(PersistError::Corrupt("bad immediate kind")),
            };
            ValueKind::Imm(imm)
        }
        2 => ValueKind::StackAlloc(r.u32()?),
        3 => ValueKind::ModuleData {
            module: ModuleId(r.u32()?),
            slot: r.u32()?,
        },
        4 => ValueKind::Poison,
        5 => ValueKind::Null,
        _ => return Err(PersistError::Corrupt("bad value kind")),
    };
    let ty = TypeId(r.u32()?);
    let flags = r.u8()?;
    let stack_ref = r.opt_u32()?;
    let label = r.opt_str()?;
    Ok(Value {
        kind,
        ty,
        flags: ValueFlags {
            readable: flags & 1 != 0,
            writable: flags & (1 << 1) != 0,
            is_static: flags & (1 << 2) != 0,
            is_pointer: flags & (1 << 3) != 0,
            is_heap: flags & (1 << 4) != 0,
        },
        stack_ref,
        label,
    })
}

fn write_instruction(w: &mut ByteWriter, instr: &Instruction) {
    w.u8(instr.op.index());
    for operand in &instr.operands {
        match operand {
            Some(v) => {
                w.bool(true);
                write_value(w, v);
            }
            None => w.bool(false),
        }
    }
    for label in &instr.labels {
        w.opt_u32(*label);
    }
    write_src(w, &instr.src);
}

fn read_instruction(r: &mut ByteReader) -> Result<Instruction, PersistError> {
    let op = Op::from_index(r.u8()?).ok_or(PersistError::Corrupt("bad opcode"))?;
    let mut instr = Instruction::new(op, SourceLocation::default());
    for i in 0..3 {
        if r.bool()? {
            instr.operands[i] = Some(read_value(r)?);
        }
    }
    for i in 0..3 {
        instr.labels[i] = r.opt_u32()?;
    }
    instr.src = read_src(r)?;
    Ok(instr)
}

fn write_function_def(w: &mut ByteWriter, def: &FunctionDef) {
    w.str(&def.name);
    w.str(&def.fully_qualified_name);
    w.u8(match def.kind {
        FunctionKind::Function => 0,
        FunctionKind::Method => 1,
        FunctionKind::Constructor => 2,
        FunctionKind::Destructor => 3,
    });
    write_access(w, def.access);
    w.opt_u32(def.return_type.map(|t| t.as_u32()));
    w.bool(def.return_type_explicit);
    w.opt_u32(def.this_type.map(|t| t.as_u32()));
    w.u8(def.implicit_arg_count);
    write_src(w, &def.src);

    w.u32(def.args.len() as u32);
    for arg in &def.args {
        w.str(&arg.name);
        w.u32(arg.ty.as_u32());
        w.u32(arg.reg);
        w.bool(arg.is_pointer);
    }

    w.u32(def.reg_count());
    w.u32(def.label_count());
    w.u32(def.alloc_count());

    w.u32(def.code.len() as u32);
    for instr in &def.code {
        write_instruction(w, instr);
    }
}

fn read_function_def(r: &mut ByteReader) -> Result<FunctionDef, PersistError> {
    let name = r.str()?;
    let fqn = r.str()?;
    let kind = match r.u8()? {
        0 => FunctionKind::Function,
        1 => FunctionKind::Method,
        2 => FunctionKind::Constructor,
        3 => FunctionKind::Destructor,
        _ => return Err(PersistError::Corrupt("bad function kind")),
    };
    let access = read_access(r)?;
    let return_type = r.opt_u32()?.map(TypeId);
    let return_type_explicit = r.bool()?;
    let this_type = r.opt_u32()?.map(TypeId);
    let implicit_arg_count = r.u8()?;
    let src = read_src(r)?;

    let mut def = FunctionDef::new(name, fqn, src);
    def.kind = kind;
    def.access = access;
    if let Some(ty) = this_type {
        def.set_this_type(ty);
    }
    def.set_return_type(return_type, return_type_explicit);
    debug_assert_eq!(def.implicit_arg_count, implicit_arg_count);
    def.implicit_arg_count = implicit_arg_count;

    let arg_count = r.u32()?;
    for _ in 0..arg_count {
        let name = r.str()?;
        let ty = TypeId(r.u32()?);
        let _reg = r.u32()?;
        let is_pointer = r.bool()?;
        def.add_arg(name, ty, is_pointer);
    }

    let regs = r.u32()?;
    let labels = r.u32()?;
    let allocs = r.u32()?;
    def.restore_counters(regs, labels, allocs);

    let code_len = r.u32()?;
    let mut code = Vec::with_capacity(code_len as usize);
    for _ in 0..code_len {
        code.push(read_instruction(r)?);
    }
    def.code = code;
    Ok(def)
}

/// Rebuild the registry record for a deserialized script function.
fn function_record_from_def(
    def: &FunctionDef,
    types: &mut TypeRegistry,
) -> Result<Function, PersistError> {
    let mut sig_args = Vec::new();
    if let Some(this) = def.this_type {
        sig_args.push(Argument::pointer(this));
    }
    for arg in &def.args {
        if types.get(arg.ty).is_none() {
            return Err(PersistError::UnknownTypeRef(arg.ty.as_u32()));
        }
        sig_args.push(if arg.is_pointer {
            Argument::pointer(arg.ty)
        } else {
            Argument::value(arg.ty)
        });
    }
    let signature = FunctionSignature::new(def.return_type, sig_args);
    let sig_type = types.signature_type(&signature);
    let mut func = Function::new(
        def.name.clone(),
        def.fully_qualified_name.clone(),
        def.kind,
        signature,
        sig_type,
    );
    func.this_type = def.this_type;
    func.implicit_args = if def.this_type.is_some() { 1 } else { 0 };
    func.access = def.access;
    Ok(func)
}

// ----- templates -----------------------------------------------------------

fn write_template(w: &mut ByteWriter, decl: &TemplateDecl, arena: &NodeArena) {
    w.str(&decl.name);
    w.u8(match decl.kind {
        TemplateKind::Class => 0,
        TemplateKind::Function => 1,
    });
    w.u32(decl.params.len() as u32);
    for p in &decl.params {
        w.str(p);
    }
    write_node(w, arena, Some(decl.node));

    w.u32(decl.captured_imports.len() as u32);
    for (name, imported) in &decl.captured_imports {
        w.str(name);
        match imported {
            Imported::Function(f) => {
                w.u8(0);
                w.u32(f.as_u32());
            }
            Imported::Data { module, slot, ty } => {
                w.u8(1);
                w.u32(module.as_u32());
                w.u32(*slot);
                w.u32(ty.as_u32());
            }
            Imported::Type(t) => {
                w.u8(2);
                w.u32(t.as_u32());
            }
            Imported::Module(m) => {
                w.u8(3);
                w.u32(m.as_u32());
            }
        }
    }
}

fn read_template(
    r: &mut ByteReader,
    templates: &mut TemplateStore,
    arena: &mut NodeArena,
) -> Result<(), PersistError> {
    let name = r.str()?;
    let kind = match r.u8()? {
        0 => TemplateKind::Class,
        1 => TemplateKind::Function,
        _ => return Err(PersistError::Corrupt("bad template kind")),
    };
    let param_count = r.u32()?;
    let mut params = Vec::with_capacity(param_count as usize);
    for _ in 0..param_count {
        params.push(r.str()?);
    }
    let node = read_node(r, arena)?.ok_or(PersistError::Corrupt("template without AST"))?;

    let import_count = r.u32()?;
    let mut captured = FxHashMap::default();
    for _ in 0..import_count {
        let name = r.str()?;
        let imported = match r.u8()? {
            0 => Imported::Function(FunctionId(r.u32()?)),
            1 => Imported::Data {
                module: ModuleId(r.u32()?),
                slot: r.u32()?,
                ty: TypeId(r.u32()?),
            },
            2 => Imported::Type(TypeId(r.u32()?)),
            3 => Imported::Module(ModuleId(r.u32()?)),
            _ => return Err(PersistError::Corrupt("bad import kind")),
        };
        captured.insert(name, imported);
    }

    let decl = TemplateDecl {
        name,
        kind,
        params,
        node,
        captured_imports: captured,
    };
    templates.restore(decl);
    Ok(())
}

// ----- AST subtrees ---------------------------------------------------------

fn node_kind_to_u8(kind: NodeKind) -> u8 {
    use NodeKind::*;
    match kind {
        Root => 0,
        Import => 1,
        Export => 2,
        TypeDecl => 3,
        EnumDecl => 4,
        Enumerator => 5,
        ClassDecl => 6,
        ClassProperty => 7,
        FunctionDecl => 8,
        Parameter => 9,
        VariableDecl => 10,
        TypeIdentifier => 11,
        Identifier => 12,
        Literal => 13,
        This => 14,
        Sizeof => 15,
        ArrayLiteral => 16,
        Expression => 17,
        Block => 18,
        If => 19,
        For => 20,
        While => 21,
        DoWhile => 22,
        Return => 23,
        Break => 24,
        Continue => 25,
        Delete => 26,
        Switch => 27,
        SwitchCase => 28,
        Empty => 29,
    }
}

fn node_kind_from_u8(v: u8) -> Option<NodeKind> {
    use NodeKind::*;
    Some(match v {
        0 => Root,
        1 => Import,
        2 => Export,
        3 => TypeDecl,
        4 => EnumDecl,
        5 => Enumerator,
        6 => ClassDecl,
        7 => ClassProperty,
        8 => FunctionDecl,
        9 => Parameter,
        10 => VariableDecl,
        11 => TypeIdentifier,
        12 => Identifier,
        13 => Literal,
        14 => This,
        15 => Sizeof,
        16 => ArrayLiteral,
        17 => Expression,
        18 => Block,
        19 => If,
        20 => For,
        21 => While,
        22 => DoWhile,
        23 => Return,
        24 => Break,
        25 => Continue,
        26 => Delete,
        27 => Switch,
        28 => SwitchCase,
        29 => Empty,
        _ => return None,
    })
}

fn operator_to_u8(op: OperatorKind) -> u8 {
    use OperatorKind::*;
    match op {
        Add => 0,
        Sub => 1,
        Mul => 2,
        Div => 3,
        Mod => 4,
        BitAnd => 5,
        BitOr => 6,
        BitXor => 7,
        Shl => 8,
        Shr => 9,
        LogicalAnd => 10,
        LogicalOr => 11,
        Eq => 12,
        NotEq => 13,
        Less => 14,
        LessEq => 15,
        Greater => 16,
        GreaterEq => 17,
        Not => 18,
        BitNot => 19,
        Negate => 20,
        Assign => 21,
        AddAssign => 22,
        SubAssign => 23,
        MulAssign => 24,
        DivAssign => 25,
        ModAssign => 26,
        BitAndAssign => 27,
        BitOrAssign => 28,
        BitXorAssign => 29,
        ShlAssign => 30,
        ShrAssign => 31,
        Conditional => 32,
        Call => 33,
        Index => 34,
        Member => 35,
        New => 36,
        Cast => 37,
    }
}

fn operator_from_u8(v: u8) -> Option<OperatorKind> {
    use OperatorKind::*;
    Some(match v {
        0 => Add,
        1 => Sub,
        2 => Mul,
        3 => Div,
        4 => Mod,
        5 => BitAnd,
        6 => BitOr,
        7 => BitXor,
        8 => Shl,
        9 => Shr,
        10 => LogicalAnd,
        11 => LogicalOr,
        12 => Eq,
        13 => NotEq,
        14 => Less,
        15 => LessEq,
        16 => Greater,
        17 => GreaterEq,
        18 => Not,
        19 => BitNot,
        20 => Negate,
        21 => Assign,
        22 => AddAssign,
        23 => SubAssign,
        24 => MulAssign,
        25 => DivAssign,
        26 => ModAssign,
        27 => BitAndAssign,
        28 => BitOrAssign,
        29 => BitXorAssign,
        30 => ShlAssign,
        31 => ShrAssign,
        32 => Conditional,
        33 => Call,
        34 => Index,
        35 => Member,
        36 => New,
        37 => Cast,
        _ => return None,
    })
}

fn suffix_to_u8(s: IntSuffix) -> u8 {
    match s {
        IntSuffix::None => 0,
        IntSuffix::I8 => 1,
        IntSuffix::U8 => 2,
        IntSuffix::I16 => 3,
        IntSuffix::U16 => 4,
        IntSuffix::U32 => 5,
        IntSuffix::I64 => 6,
        IntSuffix::U64 => 7,
    }
}

fn suffix_from_u8(v: u8) -> Option<IntSuffix> {
    Some(match v {
        0 => IntSuffix::None,
        1 => IntSuffix::I8,
        2 => IntSuffix::U8,
        3 => IntSuffix::I16,
        4 => IntSuffix::U16,
        5 => IntSuffix::U32,
        6 => IntSuffix::I64,
        7 => IntSuffix::U64,
        _ => return None,
    })
}

fn write_literal(w: &mut ByteWriter, lit: &Literal) {
    match lit {
        Literal::Signed(v, s) => {
            w.u8(0);
            w.i64(*v);
            w.u8(suffix_to_u8(*s));
        }
        Literal::Unsigned(v, s) => {
            w.u8(1);
            w.u64(*v);
            w.u8(suffix_to_u8(*s));
        }
        Literal::F32(v) => {
            w.u8(2);
            w.f32(*v);
        }
        Literal::F64(v) => {
            w.u8(3);
            w.f64(*v);
        }
        Literal::Str(s) => {
            w.u8(4);
            w.str(s);
        }
        Literal::Bool(v) => {
            w.u8(5);
            w.bool(*v);
        }
        Literal::Null => w.u8(6),
    }
}

fn read_literal(r: &mut ByteReader) -> Result<Literal, PersistError> {
    Ok(match r.u8()? {
        0 => {
            let v = r.i64()?;
            let s = suffix_from_u8(r.u8()?).ok_or(PersistError::Corrupt("bad suffix"))?;
            Literal::Signed(v, s)
        }
        1 => {
            let v = r.u64()?;
            let s = suffix_from_u8(r.u8()?).ok_or(PersistError::Corrupt("bad suffix"))?;
            Literal::Unsigned(v, s)
        }
        2 => Literal::F32(r.f32()?),
        3 => Literal::F64(r.f64()?),
        4 => Literal::Str(r.str()?),
        5 => Literal::Bool(r.bool()?),
        6 => Literal::Null,
        _ => return Err(PersistError::Corrupt("bad literal kind")),
    })
}

/// Serialize a subtree (child slots and `next` chains) recursively.
fn write_node(w: &mut ByteWriter, arena: &NodeArena, node: Option<NodeId>) {
    let Some(id) = node else {
        w.bool(false);
        return;
    };
    w.bool(true);
    let n = arena.get(id);
    w.u8(node_kind_to_u8(n.kind));
    write_src(w, &n.loc);

    let flags = (n.flags.is_const as u8)
        | ((n.flags.is_static as u8) << 1)
        | ((n.flags.is_private as u8) << 2)
        | ((n.flags.is_getter as u8) << 3)
        | ((n.flags.is_setter as u8) << 4)
        | ((n.flags.is_operator as u8) << 5);
    w.u8(flags);

    match n.op {
        Some(op) => {
            w.bool(true);
            w.u8(operator_to_u8(op));
        }
        None => w.bool(false),
    }
    w.opt_str(n.text.as_deref());
    match &n.value {
        Some(lit) => {
            w.bool(true);
            write_literal(w, lit);
        }
        None => w.bool(false),
    }

    write_node(w, arena, n.data_type);
    write_node(w, arena, n.identifier);
    write_node(w, arena, n.initializer);
    write_node(w, arena, n.condition);
    write_node(w, arena, n.body);
    write_node(w, arena, n.else_body);
    write_node(w, arena, n.lvalue);
    write_node(w, arena, n.rvalue);
    write_node(w, arena, n.callee);
    write_node(w, arena, n.arguments);
    write_node(w, arena, n.parameters);
    write_node(w, arena, n.template_params);
    write_node(w, arena, n.modifier);
    write_node(w, arena, n.next);
}

fn read_node(r: &mut ByteReader, arena: &mut NodeArena) -> Result<Option<NodeId>, PersistError> {
    if !r.bool()? {
        return Ok(None);
    }
    let kind = node_kind_from_u8(r.u8()?).ok_or(PersistError::Corrupt("bad node kind"))?;
    let loc = read_src(r)?;
    let flags = r.u8()?;

    let mut node = ParseNode::new(kind, loc);
    node.flags.is_const = flags & 1 != 0;
    node.flags.is_static = flags & (1 << 1) != 0;
    node.flags.is_private = flags & (1 << 2) != 0;
    node.flags.is_getter = flags & (1 << 3) != 0;
    node.flags.is_setter = flags & (1 << 4) != 0;
    node.flags.is_operator = flags & (1 << 5) != 0;

    if r.bool()? {
        node.op = Some(operator_from_u8(r.u8()?).ok_or(PersistError::Corrupt("bad operator"))?);
    }
    node.text = r.opt_str()?;
    if r.bool()? {
        node.value = Some(read_literal(r)?);
    }

    node.data_type = read_node(r, arena)?;
    node.identifier = read_node(r, arena)?;
    node.initializer = read_node(r, arena)?;
    node.condition = read_node(r, arena)?;
    node.body = read_node(r, arena)?;
    node.else_body = read_node(r, arena)?;
    node.lvalue = read_node(r, arena)?;
    node.rvalue = read_node(r, arena)?;
    node.callee = read_node(r, arena)?;
    node.arguments = read_node(r, arena)?;
    node.parameters = read_node(r, arena)?;
    node.template_params = read_node(r, arena)?;
    node.modifier = read_node(r, arena)?;
    node.next = read_node(r, arena)?;

    Ok(Some(arena.alloc(node)))
}
