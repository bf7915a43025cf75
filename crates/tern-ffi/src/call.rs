//! Call framing and argument marshalling.
//!
//! Every bound host function is reachable through one wrapper shape:
//! `Fn(&mut CallContext)`. The caller classifies each declared argument from
//! its type meta, packs it into a 64-bit slot (value bits for primitives, an
//! address for everything else), and the wrapper decodes the slots back into
//! native values. Primitive round-trips are bitwise-exact, NaN payloads
//! included.

use crate::exec::ExecutionContext;
use crate::types::{FunctionId, TypeMeta};
use std::sync::Arc;

/// FFI classification of one argument slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgClass {
    Integer,
    Float,
    Pointer,
}

/// Classify a type for call framing. Non-primitives always travel by
/// pointer, whatever the surface syntax said.
pub fn classify(meta: &TypeMeta) -> ArgClass {
    if !meta.is_primitive {
        ArgClass::Pointer
    } else if meta.is_floating_point {
        ArgClass::Float
    } else {
        ArgClass::Integer
    }
}

/// Per-call state handed to a host wrapper.
pub struct CallContext<'a> {
    pub ectx: &'a mut ExecutionContext,
    pub func: FunctionId,
    /// Return storage; at least 8 bytes, or the full object size for
    /// pointer-returned values. Null for void calls.
    pub ret_ptr: *mut u8,
    /// `this` for methods/constructors/destructors, null otherwise.
    pub this_ptr: *mut u8,
    /// Capture block for closure invocations, null otherwise.
    pub capture_ptr: *mut u8,
    /// One slot per explicit argument, in declaration order.
    pub args: &'a [u64],
}

impl<'a> CallContext<'a> {
    /// Write a primitive return value.
    ///
    /// # Safety
    /// `ret_ptr` must point to storage valid for `T`.
    pub unsafe fn write_ret<T: FfiPrimitive>(&mut self, value: T) {
        debug_assert!(!self.ret_ptr.is_null());
        std::ptr::write_unaligned(self.ret_ptr as *mut u64, value.to_word());
    }

    /// Read the typed `this` pointer.
    ///
    /// # Safety
    /// `this_ptr` must point to a live, properly-initialized `T`.
    pub unsafe fn this_as<T>(&mut self) -> &'a mut T {
        debug_assert!(!self.this_ptr.is_null());
        &mut *(self.this_ptr as *mut T)
    }
}

/// The single wrapper shape every bound host callable reduces to.
pub type HostFn = Arc<dyn Fn(&mut CallContext) + Send + Sync>;

/// Primitive types that pass by value in one slot.
///
/// `to_word`/`from_word` must round-trip every bit pattern.
pub trait FfiPrimitive: Copy + 'static {
    /// Script-level type name, matching the builtin registry.
    const SCRIPT_NAME: &'static str;

    fn to_word(self) -> u64;
    fn from_word(word: u64) -> Self;
}

macro_rules! int_primitive {
    ($t:ty, $name:literal) => {
        impl FfiPrimitive for $t {
            const SCRIPT_NAME: &'static str = $name;

            fn to_word(self) -> u64 {
                self as u64
            }

            fn from_word(word: u64) -> Self {
                word as $t
            }
        }
    };
}

int_primitive!(i8, "i8");
int_primitive!(u8, "u8");
int_primitive!(i16, "i16");
int_primitive!(u16, "u16");
int_primitive!(i32, "i32");
int_primitive!(u32, "u32");
int_primitive!(i64, "i64");
int_primitive!(u64, "u64");

impl FfiPrimitive for bool {
    const SCRIPT_NAME: &'static str = "bool";

    fn to_word(self) -> u64 {
        self as u64
    }

    fn from_word(word: u64) -> Self {
        word != 0
    }
}

impl FfiPrimitive for f32 {
    const SCRIPT_NAME: &'static str = "f32";

    fn to_word(self) -> u64 {
        self.to_bits() as u64
    }

    fn from_word(word: u64) -> Self {
        f32::from_bits(word as u32)
    }
}

impl FfiPrimitive for f64 {
    const SCRIPT_NAME: &'static str = "f64";

    fn to_word(self) -> u64 {
        self.to_bits()
    }

    fn from_word(word: u64) -> Self {
        f64::from_bits(word)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_by_meta() {
        assert_eq!(classify(&TypeMeta::primitive(4, false, true, false)), ArgClass::Integer);
        assert_eq!(classify(&TypeMeta::primitive(8, true, false, false)), ArgClass::Float);
        let object = TypeMeta {
            size: 24,
            ..Default::default()
        };
        assert_eq!(classify(&object), ArgClass::Pointer);
    }

    #[test]
    fn primitive_words_round_trip_bitwise() {
        assert_eq!(i8::from_word((-5i8).to_word()), -5);
        assert_eq!(u64::from_word(u64::MAX.to_word()), u64::MAX);
        assert_eq!(i32::from_word((-123456789i32).to_word()), -123456789);
        assert!(bool::from_word(true.to_word()));

        // NaN payloads survive
        let nan = f64::from_bits(0x7ff8_0000_dead_beef);
        assert_eq!(f64::from_word(nan.to_word()).to_bits(), nan.to_bits());
        let nan32 = f32::from_bits(0x7fc0_1234);
        assert_eq!(f32::from_word(nan32.to_word()).to_bits(), nan32.to_bits());
    }

    #[test]
    fn negative_int_narrowing_is_exact() {
        let w = (-1i16).to_word();
        assert_eq!(i16::from_word(w), -1);
        // Upper bits are sign-extended into the word but decode truncates
        assert_eq!(u16::from_word(w), u16::MAX);
    }
}
