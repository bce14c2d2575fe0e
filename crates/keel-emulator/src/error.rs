//! Errors raised by the local emulator and database clients

use thiserror::Error;

/// Local client error
#[derive(Debug, Error)]
pub enum EmulatorError {
    /// HTTP transport error talking to the emulator
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Error from the local database server
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Unexpected emulator response
    #[error("emulator returned {status}: {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Response body
        message: String,
    },

    /// No endpoint configured for a local service
    #[error("no local endpoint configured for {0}")]
    NotConfigured(String),

    /// Name rejected before reaching the server
    #[error("invalid name '{0}'")]
    InvalidName(String),
}

impl EmulatorError {
    /// Convert into the graph-level provider error
    pub fn into_provider(self, provider: &str) -> keel_common::Error {
        keel_common::Error::provider(provider, self.to_string())
    }
}

/// Result type for local client calls
pub type EmulatorResult<T> = std::result::Result<T, EmulatorError>;
