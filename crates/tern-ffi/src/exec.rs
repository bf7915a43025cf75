//! Per-thread execution contexts.
//!
//! Each thread keeps its own stack of contexts; the topmost is "current".
//! Runtime failures set the exception bit on the current context and the VM
//! unwinds to the nearest host boundary, where the host inspects the state.

use std::cell::RefCell;
use tern_parser::SourceLocation;

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<ExecutionContext>> = const { RefCell::new(Vec::new()) };
}

/// Runtime state for one host→script call.
#[derive(Debug, Default, Clone)]
pub struct ExecutionContext {
    exception_raised: bool,
    message: String,
    call_stack: Vec<SourceLocation>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise a runtime exception: sets the exception bit, records the
    /// message, and pushes `src` onto the captured call stack.
    pub fn raise_exception(&mut self, message: impl Into<String>, src: SourceLocation) {
        self.exception_raised = true;
        self.message = message.into();
        self.call_stack.push(src);
    }

    /// Append a frame to the captured call stack without raising.
    pub fn push_frame(&mut self, src: SourceLocation) {
        self.call_stack.push(src);
    }

    pub fn has_exception(&self) -> bool {
        self.exception_raised
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn call_stack(&self) -> &[SourceLocation] {
        &self.call_stack
    }

    pub fn clear(&mut self) {
        self.exception_raised = false;
        self.message.clear();
        self.call_stack.clear();
    }
}

/// Push a fresh context; it becomes current for this thread.
pub fn push_context() {
    CONTEXT_STACK.with(|s| s.borrow_mut().push(ExecutionContext::new()));
}

/// Pop and return the current context. Popping destroys it.
pub fn pop_context() -> Option<ExecutionContext> {
    CONTEXT_STACK.with(|s| s.borrow_mut().pop())
}

/// Run `f` with the current context, pushing one if the stack is empty.
pub fn with_current<R>(f: impl FnOnce(&mut ExecutionContext) -> R) -> R {
    CONTEXT_STACK.with(|s| {
        let mut stack = s.borrow_mut();
        if stack.is_empty() {
            stack.push(ExecutionContext::new());
        }
        // Non-empty by construction
        f(stack.last_mut().unwrap())
    })
}

/// Raise an exception on the current context.
pub fn raise_exception(message: impl Into<String>, src: SourceLocation) {
    with_current(|ectx| ectx.raise_exception(message, src));
}

/// Whether the current context has its exception bit set.
pub fn has_exception() -> bool {
    with_current(|ectx| ectx.has_exception())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contexts_stack_per_thread() {
        push_context();
        push_context();
        raise_exception("inner failure", SourceLocation::default());
        assert!(has_exception());

        let inner = pop_context().unwrap();
        assert!(inner.has_exception());
        assert_eq!(inner.message(), "inner failure");
        assert_eq!(inner.call_stack().len(), 1);

        // The outer context is untouched
        assert!(!has_exception());
        pop_context();
    }

    #[test]
    fn threads_are_isolated() {
        push_context();
        raise_exception("main thread", SourceLocation::default());

        let handle = std::thread::spawn(|| {
            push_context();
            let clean = !has_exception();
            pop_context();
            clean
        });
        assert!(handle.join().unwrap());

        assert!(has_exception());
        pop_context();
    }

    #[test]
    fn clear_resets_state() {
        let mut ectx = ExecutionContext::new();
        ectx.raise_exception("bad", SourceLocation::default());
        ectx.clear();
        assert!(!ectx.has_exception());
        assert!(ectx.call_stack().is_empty());
        assert_eq!(ectx.message(), "");
    }
}
