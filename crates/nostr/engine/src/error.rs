//! Engine error types

use thiserror::Error;

/// Engine error type
#[derive(Error, Debug)]
pub enum ClientError {
    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// URL parse error
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// Timeout error
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// Not connected
    #[error("Not connected to relay")]
    NotConnected,

    /// Invalid request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Signing failed
    #[error("Signer error: {0}")]
    Signer(#[from] crate::signer::SignerError),

    /// Persistence failed
    #[error("Store error: {0}")]
    Store(#[from] crate::store::StoreError),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// A background context is gone
    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),
}

/// Engine result type
pub type Result<T> = std::result::Result<T, ClientError>;
