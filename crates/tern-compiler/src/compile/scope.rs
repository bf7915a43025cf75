//! Lexical scopes and teardown duties.
//!
//! A scope owns the named values declared in it, the destructor duties for
//! stack objects constructed in it, and the stack allocations to free on
//! exit. Teardown runs destructors in reverse construction order, then frees
//! allocations in reverse order.

use crate::ir::{AllocId, LabelId, Value};
use rustc_hash::FxHashMap;
use tern_ffi::{FunctionId, TypeId};
use tern_parser::SourceLocation;

/// One named local.
#[derive(Debug, Clone)]
pub struct LocalSymbol {
    pub name: String,
    pub value: Value,
    pub is_const: bool,
    pub decl_src: SourceLocation,
}

/// What kind of construct opened a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Function,
    Block,
    Loop {
        continue_label: LabelId,
        break_label: LabelId,
    },
    /// Type-alias-only scope used during template instantiation.
    TypeBindings,
}

/// A pending destructor call for a scope-owned object.
#[derive(Debug, Clone)]
pub struct DtorDuty {
    pub object: Value,
    pub dtor: FunctionId,
}

#[derive(Debug, Default)]
pub struct Scope {
    pub kind_tag: Option<ScopeKind>,
    symbols: Vec<LocalSymbol>,
    /// In construction order; run in reverse.
    pub dtors: Vec<DtorDuty>,
    /// In allocation order; freed in reverse.
    pub allocs: Vec<Value>,
    /// Template parameter bindings visible in this scope.
    pub type_aliases: FxHashMap<String, TypeId>,
}

impl Scope {
    fn new(kind: ScopeKind) -> Self {
        Self {
            kind_tag: Some(kind),
            ..Default::default()
        }
    }

    pub fn kind(&self) -> ScopeKind {
        self.kind_tag.unwrap_or(ScopeKind::Block)
    }

    pub fn symbols(&self) -> &[LocalSymbol] {
        &self.symbols
    }
}

/// Stack of scopes for the function currently being compiled.
#[derive(Debug, Default)]
pub struct ScopeManager {
    stack: Vec<Scope>,
}

impl ScopeManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, kind: ScopeKind) {
        self.stack.push(Scope::new(kind));
    }

    pub fn pop(&mut self) -> Option<Scope> {
        self.stack.pop()
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn top(&self) -> Option<&Scope> {
        self.stack.last()
    }

    pub fn top_mut(&mut self) -> Option<&mut Scope> {
        self.stack.last_mut()
    }

    pub fn scope(&self, index: usize) -> &Scope {
        &self.stack[index]
    }

    /// Declare a symbol in the innermost scope. Fails when the name is
    /// already taken in that scope.
    pub fn declare(&mut self, symbol: LocalSymbol) -> Result<(), ()> {
        let scope = self.stack.last_mut().ok_or(())?;
        if scope.symbols.iter().any(|s| s.name == symbol.name) {
            return Err(());
        }
        scope.symbols.push(symbol);
        Ok(())
    }

    /// Innermost-first lookup.
    pub fn lookup(&self, name: &str) -> Option<&LocalSymbol> {
        self.stack
            .iter()
            .rev()
            .flat_map(|s| s.symbols.iter().rev())
            .find(|s| s.name == name)
    }

    pub fn lookup_mut(&mut self, name: &str) -> Option<&mut LocalSymbol> {
        self.stack
            .iter_mut()
            .rev()
            .flat_map(|s| s.symbols.iter_mut().rev())
            .find(|s| s.name == name)
    }

    /// Innermost template-parameter binding for `name`.
    pub fn lookup_type_alias(&self, name: &str) -> Option<TypeId> {
        self.stack
            .iter()
            .rev()
            .find_map(|s| s.type_aliases.get(name).copied())
    }

    pub fn bind_type_alias(&mut self, name: impl Into<String>, ty: TypeId) {
        if let Some(scope) = self.stack.last_mut() {
            scope.type_aliases.insert(name.into(), ty);
        }
    }

    /// Record a destructor duty in the innermost scope.
    pub fn add_dtor_duty(&mut self, object: Value, dtor: FunctionId) {
        if let Some(scope) = self.stack.last_mut() {
            scope.dtors.push(DtorDuty { object, dtor });
        }
    }

    /// Record a stack allocation to free on scope exit.
    pub fn add_alloc(&mut self, value: Value) {
        if let Some(scope) = self.stack.last_mut() {
            scope.allocs.push(value);
        }
    }

    /// Cancel teardown for one allocation in any scope (ownership moved).
    /// Returns true when something was cancelled.
    pub fn release_alloc(&mut self, alloc: AllocId) -> bool {
        let mut found = false;
        for scope in self.stack.iter_mut().rev() {
            let had = scope.allocs.len() + scope.dtors.len();
            scope.allocs.retain(|v| v.stack_ref != Some(alloc));
            scope.dtors.retain(|d| d.object.stack_ref != Some(alloc));
            if scope.allocs.len() + scope.dtors.len() != had {
                found = true;
                break;
            }
        }
        found
    }

    /// Index of the innermost loop scope, if any.
    pub fn innermost_loop(&self) -> Option<(usize, LabelId, LabelId)> {
        self.stack.iter().enumerate().rev().find_map(|(i, s)| match s.kind() {
            ScopeKind::Loop {
                continue_label,
                break_label,
            } => Some((i, continue_label, break_label)),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_ffi::TypeId;

    fn sym(name: &str, reg: u32) -> LocalSymbol {
        LocalSymbol {
            name: name.to_string(),
            value: Value::reg(reg, TypeId::from_fqn("i32")),
            is_const: false,
            decl_src: SourceLocation::default(),
        }
    }

    #[test]
    fn shadowing_resolves_innermost() {
        let mut scopes = ScopeManager::new();
        scopes.push(ScopeKind::Function);
        scopes.declare(sym("x", 0)).unwrap();
        scopes.push(ScopeKind::Block);
        scopes.declare(sym("x", 1)).unwrap();

        assert_eq!(scopes.lookup("x").unwrap().value.reg_id(), Some(1));
        scopes.pop();
        assert_eq!(scopes.lookup("x").unwrap().value.reg_id(), Some(0));
    }

    #[test]
    fn duplicate_in_same_scope_rejected() {
        let mut scopes = ScopeManager::new();
        scopes.push(ScopeKind::Function);
        scopes.declare(sym("x", 0)).unwrap();
        assert!(scopes.declare(sym("x", 1)).is_err());
    }

    #[test]
    fn release_alloc_cancels_teardown() {
        let mut scopes = ScopeManager::new();
        scopes.push(ScopeKind::Function);
        let obj = Value::stack(3, TypeId::from_fqn("T"));
        scopes.add_alloc(obj.clone());
        scopes.add_dtor_duty(obj, FunctionId(1));
        assert!(scopes.release_alloc(3));
        let top = scopes.top().unwrap();
        assert!(top.allocs.is_empty() && top.dtors.is_empty());
        assert!(!scopes.release_alloc(3));
    }

    #[test]
    fn innermost_loop_lookup() {
        let mut scopes = ScopeManager::new();
        scopes.push(ScopeKind::Function);
        scopes.push(ScopeKind::Loop {
            continue_label: 1,
            break_label: 2,
        });
        scopes.push(ScopeKind::Block);
        let (idx, cont, brk) = scopes.innermost_loop().unwrap();
        assert_eq!((idx, cont, brk), (1, 1, 2));
    }
}
