// Domain Error Types

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Invalid worker state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Unknown queue class: {0}")]
    UnknownQueueClass(String),
}

pub type Result<T> = std::result::Result<T, DomainError>;
