//! Compile diagnostics.

use thiserror::Error;

/// Compile-time error categories (300-range codes). These abort the current
/// function's emission but not the whole module.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileErrorKind {
    #[error("unknown symbol '{0}'")]
    UnknownSymbol(String),
    #[error("unknown type '{0}'")]
    UnknownType(String),
    #[error("ambiguous call to '{0}'")]
    AmbiguousOverload(String),
    #[error("no matching overload for '{0}'")]
    NoMatchingOverload(String),
    #[error("expression is not assignable")]
    NotAssignable,
    #[error("expression is not callable")]
    NotCallable,
    #[error("type '{0}' has no property or method '{1}'")]
    NoSuchMember(String, String),
    #[error("duplicate declaration of '{0}'")]
    DuplicateDeclaration(String),
    #[error("cannot implicitly convert from '{0}' to '{1}'")]
    NoImplicitConversion(String, String),
    #[error("property '{0}' is {1}")]
    RestrictedProperty(String, &'static str),
    #[error("type '{0}' is incomplete here")]
    IncompleteType(String),
    #[error("type '{0}' requires a subtype argument")]
    SubtypeRequired(String),
    #[error("type '{0}' does not accept subtype arguments")]
    UnexpectedSubtype(String),
    #[error("module '{0}' has no exported symbol '{1}'")]
    SymbolNotInModule(String, String),
    #[error("type '{0}' has no default constructor")]
    NoDefaultConstructor(String),
    #[error("{0} cannot return a value")]
    VoidReturnValue(&'static str),
    #[error("delete requires a heap allocation")]
    IllegalDelete,
    #[error("'this' is only valid inside a method")]
    ThisOutsideMethod,
    #[error("'{0}' is only valid inside a loop")]
    NotInLoop(&'static str),
    #[error("symbol '{0}' is not accessible here")]
    AccessDenied(String),
}

impl CompileErrorKind {
    /// Stable diagnostic code (300-range).
    pub fn code(&self) -> u32 {
        use CompileErrorKind::*;
        match self {
            UnknownSymbol(_) => 300,
            UnknownType(_) => 301,
            AmbiguousOverload(_) => 302,
            NoMatchingOverload(_) => 303,
            NotAssignable => 304,
            NotCallable => 305,
            NoSuchMember(_, _) => 306,
            DuplicateDeclaration(_) => 307,
            NoImplicitConversion(_, _) => 308,
            RestrictedProperty(_, _) => 309,
            IncompleteType(_) => 310,
            SubtypeRequired(_) => 311,
            UnexpectedSubtype(_) => 312,
            SymbolNotInModule(_, _) => 313,
            NoDefaultConstructor(_) => 314,
            VoidReturnValue(_) => 315,
            IllegalDelete => 316,
            ThisOutsideMethod => 317,
            NotInLoop(_) => 318,
            AccessDenied(_) => 319,
        }
    }
}

/// Warning categories (350-range codes).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileWarning {
    #[error("implicit conversion from '{0}' to '{1}' may truncate")]
    Truncation(String, String),
    #[error("unreachable code")]
    UnreachableCode,
}

impl CompileWarning {
    pub fn code(&self) -> u32 {
        match self {
            CompileWarning::Truncation(_, _) => 350,
            CompileWarning::UnreachableCode => 351,
        }
    }
}
