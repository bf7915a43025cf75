//! Structured diagnostic log shared by the whole pipeline.
//!
//! The core never exits the process or prints on its own: every stage appends
//! [`LogMessage`]s here and the host decides how to render them. Transactions
//! allow speculative work (template instantiation attempts, overload probing)
//! to discard its messages on failure.

use crate::source::SourceLocation;
use serde::{Deserialize, Serialize};

/// Message severity, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Debug => write!(f, "debug"),
            Severity::Info => write!(f, "info"),
            Severity::Warn => write!(f, "warn"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// Stable numeric code for a diagnostic.
///
/// Ranges: 100–199 lexer, 200–299 parser, 300–399 compiler, 400–499 runtime,
/// 500–599 persistence, 600–699 binding.
pub type DiagCode = u32;

/// One diagnostic record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogMessage {
    pub severity: Severity,
    pub code: DiagCode,
    pub message: String,
    pub src: Option<SourceLocation>,
}

impl std::fmt::Display for LogMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.src {
            Some(src) => write!(f, "[{} T{:04}] {} at {}", self.severity, self.code, self.message, src),
            None => write!(f, "[{} T{:04}] {}", self.severity, self.code, self.message),
        }
    }
}

/// Accumulating diagnostic logger with nested transactions.
#[derive(Debug, Default)]
pub struct Logger {
    messages: Vec<LogMessage>,
    transactions: Vec<usize>,
    debug_enabled: bool,
}

impl Logger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable `Severity::Debug` messages; they are dropped otherwise.
    pub fn set_debug_enabled(&mut self, enabled: bool) {
        self.debug_enabled = enabled;
    }

    pub fn submit(&mut self, severity: Severity, code: DiagCode, message: impl Into<String>, src: Option<SourceLocation>) {
        if severity == Severity::Debug && !self.debug_enabled {
            return;
        }
        self.messages.push(LogMessage {
            severity,
            code,
            message: message.into(),
            src,
        });
    }

    pub fn debug(&mut self, code: DiagCode, message: impl Into<String>) {
        self.submit(Severity::Debug, code, message, None);
    }

    pub fn warn(&mut self, code: DiagCode, message: impl Into<String>, src: Option<SourceLocation>) {
        self.submit(Severity::Warn, code, message, src);
    }

    pub fn error(&mut self, code: DiagCode, message: impl Into<String>, src: Option<SourceLocation>) {
        self.submit(Severity::Error, code, message, src);
    }

    /// Open a transaction. Messages submitted after this point are discarded
    /// by [`Logger::revert`] or kept by [`Logger::commit`].
    pub fn begin_transaction(&mut self) {
        self.transactions.push(self.messages.len());
    }

    /// Keep everything submitted since the matching `begin_transaction`.
    pub fn commit(&mut self) {
        let popped = self.transactions.pop();
        debug_assert!(popped.is_some(), "commit without begin_transaction");
    }

    /// Discard everything submitted since the matching `begin_transaction`.
    pub fn revert(&mut self) {
        if let Some(mark) = self.transactions.pop() {
            self.messages.truncate(mark);
        }
    }

    pub fn messages(&self) -> &[LogMessage] {
        &self.messages
    }

    pub fn has_errors(&self) -> bool {
        self.messages.iter().any(|m| m.severity == Severity::Error)
    }

    pub fn error_count(&self) -> usize {
        self.messages.iter().filter(|m| m.severity == Severity::Error).count()
    }

    /// Move every accumulated message out, leaving the logger empty.
    pub fn take_messages(&mut self) -> Vec<LogMessage> {
        debug_assert!(self.transactions.is_empty());
        std::mem::take(&mut self.messages)
    }

    /// Render the accumulated messages as JSON for host-side aggregation.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(&self.messages).unwrap_or_else(|_| "[]".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revert_discards_nested_messages() {
        let mut log = Logger::new();
        log.error(301, "outer", None);
        log.begin_transaction();
        log.error(302, "inner", None);
        log.begin_transaction();
        log.warn(303, "innermost", None);
        log.commit();
        log.revert();
        assert_eq!(log.messages().len(), 1);
        assert_eq!(log.messages()[0].message, "outer");
    }

    #[test]
    fn commit_keeps_messages() {
        let mut log = Logger::new();
        log.begin_transaction();
        log.error(301, "kept", None);
        log.commit();
        assert_eq!(log.messages().len(), 1);
        assert!(log.has_errors());
    }

    #[test]
    fn json_dump_includes_fields() {
        let mut log = Logger::new();
        log.error(303, "no matching overload for 'f'", None);
        let json = log.to_json();
        assert!(json.contains("\"code\": 303"));
        assert!(json.contains("no matching overload"));
        assert!(json.contains("Error"));
    }

    #[test]
    fn debug_dropped_unless_enabled() {
        let mut log = Logger::new();
        log.debug(1, "invisible");
        assert!(log.messages().is_empty());
        log.set_debug_enabled(true);
        log.debug(1, "visible");
        assert_eq!(log.messages().len(), 1);
    }
}
