use thiserror::Error;

pub type Result<T> = std::result::Result<T, CaveatError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CaveatError {
    #[error("Caveat not found: {0}")]
    UnknownCaveat(String),

    #[error("Caveat {caveat} references undeclared parameter {parameter}")]
    UnknownParameter { caveat: String, parameter: String },

    #[error("Parameter {parameter} expected {expected}, got {found}")]
    TypeMismatch {
        parameter: String,
        expected: String,
        found: String,
    },

    #[error("Malformed caveat expression for {0}")]
    MalformedExpression(String),

    #[error("Invalid literal in caveat {caveat}: {literal}")]
    InvalidLiteral { caveat: String, literal: String },
}
