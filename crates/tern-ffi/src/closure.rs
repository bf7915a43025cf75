//! Reference-counted closures.
//!
//! A closure binds a target function, an optional `self` pointer, and a block
//! of captured data. Capture blocks come from a pooled allocator and use the
//! layout `u32 count, u32 pad | (u32 type_id, u32 byte_len, bytes padded to
//! 8)*` so that generic destruction can walk the fields without the registry.
//! Field destructors are resolved to thunks at capture time; they run exactly
//! once, when the refcount reaches zero.

use crate::types::{FunctionId, TypeId};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Destructor thunk for one captured field. For host types this wraps the
/// bound destructor; for script types the engine supplies a VM dispatch.
pub type FieldDtor = Arc<dyn Fn(*mut u8) + Send + Sync>;

const HEADER_WORDS: usize = 1;
const FIELD_HEADER_WORDS: usize = 1;

/// Fixed-size block classes for capture data, in u64 words.
const POOL_CLASSES: [usize; 4] = [4, 8, 16, 32];
const POOL_MAX_PER_CLASS: usize = 64;

static CAPTURE_POOL: Lazy<CapturePool> = Lazy::new(CapturePool::default);

#[derive(Default)]
struct CapturePool {
    classes: Mutex<[Vec<Vec<u64>>; 4]>,
}

impl CapturePool {
    fn class_of(words: usize) -> Option<usize> {
        POOL_CLASSES.iter().position(|&c| words <= c)
    }

    fn alloc(&self, words: usize) -> Vec<u64> {
        match Self::class_of(words) {
            Some(class) => {
                let mut lists = self.classes.lock();
                match lists[class].pop() {
                    Some(mut block) => {
                        block.iter_mut().for_each(|w| *w = 0);
                        block
                    }
                    None => vec![0u64; POOL_CLASSES[class]],
                }
            }
            // Oversized captures bypass the pool
            None => vec![0u64; words],
        }
    }

    fn release(&self, block: Vec<u64>) {
        if let Some(class) = POOL_CLASSES.iter().position(|&c| block.len() == c) {
            let mut lists = self.classes.lock();
            if lists[class].len() < POOL_MAX_PER_CLASS {
                lists[class].push(block);
            }
        }
    }
}

struct CaptureSlot {
    ty: TypeId,
    /// Byte offset of the field payload within the block.
    offset: usize,
    len: usize,
    dtor: Option<FieldDtor>,
}

struct ClosureInner {
    target: FunctionId,
    self_ptr: *mut u8,
    slots: Vec<CaptureSlot>,
    data: Vec<u64>,
    refs: AtomicU32,
}

impl ClosureInner {
    fn destroy_captures(&mut self) {
        let base = self.data.as_mut_ptr() as *mut u8;
        for slot in self.slots.iter().rev() {
            if let Some(dtor) = &slot.dtor {
                // Offsets are 8-aligned within an 8-aligned block
                dtor(unsafe { base.add(slot.offset) });
            }
        }
    }
}

/// Builds a closure's capture block.
pub struct ClosureBuilder {
    target: FunctionId,
    self_ptr: *mut u8,
    fields: Vec<(TypeId, Vec<u8>, Option<FieldDtor>)>,
}

impl ClosureBuilder {
    pub fn new(target: FunctionId) -> Self {
        Self {
            target,
            self_ptr: std::ptr::null_mut(),
            fields: Vec::new(),
        }
    }

    pub fn with_self(mut self, self_ptr: *mut u8) -> Self {
        self.self_ptr = self_ptr;
        self
    }

    /// Capture one field by value. `bytes` are copied into the block.
    pub fn capture(mut self, ty: TypeId, bytes: &[u8], dtor: Option<FieldDtor>) -> Self {
        self.fields.push((ty, bytes.to_vec(), dtor));
        self
    }

    pub fn build(self) -> ClosureRef {
        // count | per field: (type_id, byte_len) | payload padded to 8
        let mut words = HEADER_WORDS;
        for (_, bytes, _) in &self.fields {
            words += FIELD_HEADER_WORDS + bytes.len().div_ceil(8);
        }

        let mut data = CAPTURE_POOL.alloc(words);
        data[0] = self.fields.len() as u64;

        let mut slots = Vec::with_capacity(self.fields.len());
        let mut word = HEADER_WORDS;
        for (ty, bytes, dtor) in self.fields {
            data[word] = (ty.as_u32() as u64) | ((bytes.len() as u64) << 32);
            word += FIELD_HEADER_WORDS;
            let offset = word * 8;
            let payload_words = bytes.len().div_ceil(8);
            unsafe {
                std::ptr::copy_nonoverlapping(
                    bytes.as_ptr(),
                    (data.as_mut_ptr() as *mut u8).add(offset),
                    bytes.len(),
                );
            }
            word += payload_words;
            slots.push(CaptureSlot {
                ty,
                offset,
                len: bytes.len(),
                dtor,
            });
        }

        let inner = Box::new(ClosureInner {
            target: self.target,
            self_ptr: self.self_ptr,
            slots,
            data,
            refs: AtomicU32::new(1),
        });
        ClosureRef {
            inner: Box::into_raw(inner),
        }
    }
}

/// A refcounted handle to a closure. Cloning increments the count; dropping
/// the last handle runs captured-field destructors and returns the block to
/// the pool.
pub struct ClosureRef {
    inner: *mut ClosureInner,
}

impl ClosureRef {
    fn inner(&self) -> &ClosureInner {
        unsafe { &*self.inner }
    }

    pub fn target(&self) -> FunctionId {
        self.inner().target
    }

    pub fn self_ptr(&self) -> *mut u8 {
        self.inner().self_ptr
    }

    pub fn field_count(&self) -> usize {
        self.inner().slots.len()
    }

    pub fn field_type(&self, index: usize) -> Option<TypeId> {
        self.inner().slots.get(index).map(|s| s.ty)
    }

    /// Raw pointer to the capture block, handed to wrappers as
    /// `CallContext::capture_ptr`.
    pub fn capture_ptr(&self) -> *mut u8 {
        self.inner().data.as_ptr() as *mut u8
    }

    /// Pointer to one captured field's payload.
    pub fn field_ptr(&self, index: usize) -> Option<*mut u8> {
        let inner = self.inner();
        inner.slots.get(index).map(|s| {
            let base = inner.data.as_ptr() as *mut u8;
            unsafe { base.add(s.offset) }
        })
    }

    pub fn field_bytes(&self, index: usize) -> Option<&[u8]> {
        let inner = self.inner();
        inner.slots.get(index).map(|s| {
            let base = inner.data.as_ptr() as *const u8;
            unsafe { std::slice::from_raw_parts(base.add(s.offset), s.len) }
        })
    }

    pub fn ref_count(&self) -> u32 {
        self.inner().refs.load(Ordering::Acquire)
    }
}

impl Clone for ClosureRef {
    fn clone(&self) -> Self {
        self.inner().refs.fetch_add(1, Ordering::Relaxed);
        Self { inner: self.inner }
    }
}

impl Drop for ClosureRef {
    fn drop(&mut self) {
        if self.inner().refs.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let mut inner = unsafe { Box::from_raw(self.inner) };
        inner.destroy_captures();
        let data = std::mem::take(&mut inner.data);
        CAPTURE_POOL.release(data);
    }
}

impl std::fmt::Debug for ClosureRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClosureRef")
            .field("target", &self.target())
            .field("fields", &self.field_count())
            .field("refs", &self.ref_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_dtor(counter: Arc<AtomicUsize>) -> FieldDtor {
        Arc::new(move |_ptr| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn capture_block_layout() {
        let ty_a = TypeId(0x11);
        let ty_b = TypeId(0x22);
        let closure = ClosureBuilder::new(FunctionId(1))
            .capture(ty_a, &42i32.to_le_bytes(), None)
            .capture(ty_b, &7.5f64.to_le_bytes(), None)
            .build();

        assert_eq!(closure.field_count(), 2);
        assert_eq!(closure.field_type(0), Some(ty_a));
        assert_eq!(closure.field_bytes(0).unwrap(), &42i32.to_le_bytes());
        assert_eq!(closure.field_bytes(1).unwrap(), &7.5f64.to_le_bytes());

        // Header word carries the count
        let count = unsafe { *(closure.capture_ptr() as *const u64) };
        assert_eq!(count, 2);
    }

    #[test]
    fn dropping_k_refs_destroys_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let closure = ClosureBuilder::new(FunctionId(1))
            .capture(TypeId(1), &[1, 2, 3, 4], Some(counting_dtor(counter.clone())))
            .capture(TypeId(2), &[5, 6, 7, 8], Some(counting_dtor(counter.clone())))
            .build();

        let refs: Vec<ClosureRef> = (0..5).map(|_| closure.clone()).collect();
        assert_eq!(closure.ref_count(), 6);
        drop(closure);
        assert_eq!(counter.load(Ordering::SeqCst), 0, "captures still alive");

        // Drop in scrambled order
        for r in refs.into_iter().rev() {
            drop(r);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 2, "each field destroyed exactly once");
    }

    #[test]
    fn pooled_blocks_are_reused() {
        let first = ClosureBuilder::new(FunctionId(1))
            .capture(TypeId(1), &[0u8; 8], None)
            .build();
        let first_ptr = first.capture_ptr() as usize;
        drop(first);

        let second = ClosureBuilder::new(FunctionId(2))
            .capture(TypeId(1), &[0u8; 8], None)
            .build();
        // Same size class, freshly released block comes back zeroed
        assert_eq!(second.capture_ptr() as usize, first_ptr);
        assert_eq!(second.field_bytes(0).unwrap(), &[0u8; 8]);
    }
}
