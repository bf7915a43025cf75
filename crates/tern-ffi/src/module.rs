//! Compiled modules and module-global data slots.

use crate::types::{FunctionId, ModuleId, TypeId};
use crate::AccessModifier;
use tern_parser::LogMessage;

/// Module-global storage cell. Lifetime equals the module lifetime.
#[derive(Debug)]
pub struct DataSlot {
    pub name: String,
    pub ty: TypeId,
    pub access: AccessModifier,
    storage: Box<[u8]>,
}

impl DataSlot {
    pub fn new(name: impl Into<String>, ty: TypeId, size: u32, access: AccessModifier) -> Self {
        Self {
            name: name.into(),
            ty,
            access,
            storage: vec![0u8; size as usize].into_boxed_slice(),
        }
    }

    pub fn size(&self) -> u32 {
        self.storage.len() as u32
    }

    pub fn ptr(&self) -> *const u8 {
        self.storage.as_ptr()
    }

    pub fn ptr_mut(&mut self) -> *mut u8 {
        self.storage.as_mut_ptr()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.storage
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.storage
    }
}

/// A compiled (or failed) module: the scoped container for its types,
/// functions, and module-level data.
#[derive(Debug)]
pub struct Module {
    pub id: ModuleId,
    pub name: String,
    pub path: String,
    /// Key/value metadata carried from the script header, if any.
    pub metadata: Vec<(String, String)>,
    pub data_slots: Vec<DataSlot>,
    pub functions: Vec<FunctionId>,
    pub types: Vec<TypeId>,
    /// False when compilation emitted errors; such a module is empty apart
    /// from its log.
    pub compiled: bool,
    /// Diagnostics accumulated while producing this module.
    pub log: Vec<LogMessage>,
    /// Source timestamp recorded for cache invalidation.
    pub modified_on: u64,
}

impl Module {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            id: ModuleId::from_path(&path),
            name: name.into(),
            path,
            metadata: Vec::new(),
            data_slots: Vec::new(),
            functions: Vec::new(),
            types: Vec::new(),
            compiled: false,
            log: Vec::new(),
            modified_on: 0,
        }
    }

    /// Reserve a data slot, returning its index.
    pub fn add_data_slot(
        &mut self,
        name: impl Into<String>,
        ty: TypeId,
        size: u32,
        access: AccessModifier,
    ) -> u32 {
        let slot = self.data_slots.len() as u32;
        self.data_slots.push(DataSlot::new(name, ty, size, access));
        slot
    }

    pub fn slot(&self, index: u32) -> Option<&DataSlot> {
        self.data_slots.get(index as usize)
    }

    pub fn slot_mut(&mut self, index: u32) -> Option<&mut DataSlot> {
        self.data_slots.get_mut(index as usize)
    }

    pub fn find_slot(&self, name: &str) -> Option<u32> {
        self.data_slots
            .iter()
            .position(|s| s.name == name)
            .map(|i| i as u32)
    }

    /// Run destructors for the data slots, in reverse declaration order.
    /// The caller supplies the dispatcher since running a script destructor
    /// needs the VM.
    pub fn teardown(&mut self, mut run_destructor: impl FnMut(TypeId, *mut u8)) {
        for slot in self.data_slots.iter_mut().rev() {
            run_destructor(slot.ty, slot.ptr_mut());
        }
        self.data_slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_id_derives_from_path() {
        let a = Module::new("m", "scripts/m.tn");
        let b = Module::new("other", "scripts/m.tn");
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn data_slots_are_zeroed_and_addressable() {
        let mut m = Module::new("m", "m.tn");
        let ty = TypeId::from_fqn("i32");
        let slot = m.add_data_slot("counter", ty, 4, AccessModifier::Public);
        assert_eq!(slot, 0);
        assert_eq!(m.slot(slot).unwrap().bytes(), &[0, 0, 0, 0]);
        m.slot_mut(slot).unwrap().bytes_mut()[0] = 7;
        assert_eq!(m.slot(slot).unwrap().bytes()[0], 7);
    }

    #[test]
    fn teardown_runs_in_reverse_order() {
        let mut m = Module::new("m", "m.tn");
        let ty = TypeId::from_fqn("T");
        m.add_data_slot("first", ty, 4, AccessModifier::Public);
        m.add_data_slot("second", ty, 4, AccessModifier::Public);

        let p0 = m.slot(0).unwrap().ptr() as usize;
        let p1 = m.slot(1).unwrap().ptr() as usize;
        let mut order = Vec::new();
        m.teardown(|_, ptr| order.push(ptr as usize));
        assert_eq!(order, vec![p1, p0]);
    }
}
