//! Instruction encoding for the VM backend.

mod encode;
mod opcode;

pub use encode::{
    convert_bits, DataResolver, EncodeError, EncodedInstruction, Encoder, Program,
};
pub use opcode::{NumKind, VmOp, VmRegister, FP_COUNT, GP_COUNT, REGISTER_COUNT};
