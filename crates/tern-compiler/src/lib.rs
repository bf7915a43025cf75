//! Middle end of the Tern toolchain: the typed three-address IR, the AST→IR
//! compiler, the optimizer, the linear-scan register allocator, and compiled
//! module persistence.

pub mod compile;
pub mod error;
pub mod ir;
pub mod optimize;
pub mod persist;
pub mod regalloc;

pub use compile::{
    CompiledFunction, Compiler, CompilerOutput, Imported, MatchFlags, ModuleLookup, ScopeManager,
    SymbolLifetime, TemplateStore,
};
pub use error::{CompileErrorKind, CompileWarning};
pub use ir::{
    AllocId, CodeHolder, ControlFlowGraph, FunctionDef, Immediate, Instruction, LabelId,
    LivenessData, Op, RegInterval, VRegId, Value, ValueKind,
};
pub use optimize::{OptimizationGroup, OptimizationStep, OptimizeContext};
pub use persist::{ApiVersions, PersistError};
pub use regalloc::{AllocationResult, FrameLayout, RegAssignment, RegisterAllocator, StackManager};
