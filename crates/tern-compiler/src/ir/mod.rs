//! Typed three-address IR: values, instructions, in-progress functions, and
//! the per-function analyses (label map, CFG, liveness).

mod cfg;
mod code_holder;
mod function_def;
mod instr;
mod liveness;
mod op;
mod value;

pub use cfg::{BasicBlock, ControlFlowGraph};
pub use code_holder::{CodeHolder, LabelMap};
pub use function_def::{ArgInfo, FunctionDef};
pub use instr::Instruction;
pub use liveness::{LivenessData, RegInterval};
pub use op::Op;
pub use value::{AllocId, Immediate, LabelId, VRegId, Value, ValueFlags, ValueKind};
