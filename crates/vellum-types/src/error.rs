use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("domain part {part:?} must not contain the pattern separator '|'")]
    InvalidDomainPart { part: String },
}
