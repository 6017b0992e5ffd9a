// Central Error Type for the Application

use thiserror::Error;

/// Application-level error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Domain error: {0}")]
    Domain(#[from] crate::domain::DomainError),

    #[error("Broker error: {0}")]
    Broker(#[from] crate::port::BrokerError),

    #[error("Processing error: {0}")]
    Processing(#[from] crate::port::ProcessingError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// True when the broker connection dropped underneath a consumer.
    ///
    /// Recoverable: the pool replaces the consumer on a later tick.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, AppError::Broker(crate::port::BrokerError::ConnectionLost(_)))
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
