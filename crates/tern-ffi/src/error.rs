//! Binding errors.

use thiserror::Error;

/// Errors raised while registering host bindings.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BindError {
    #[error("type '{0}' is already registered")]
    DuplicateType(String),
    #[error("function '{0}' is already registered")]
    DuplicateFunction(String),
    #[error("type '{0}' is not registered")]
    UnknownType(String),
    #[error("host type for this argument is not bound")]
    UnboundHostType,
    #[error("type '{0}' is not an incomplete placeholder")]
    NotIncomplete(String),
}

impl BindError {
    /// Stable diagnostic code (600-range).
    pub fn code(&self) -> u32 {
        match self {
            BindError::DuplicateType(_) => 600,
            BindError::DuplicateFunction(_) => 601,
            BindError::UnknownType(_) => 602,
            BindError::UnboundHostType => 603,
            BindError::NotIncomplete(_) => 604,
        }
    }
}
