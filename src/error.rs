use thiserror::Error;

/// Errors that can occur during session operations
#[derive(Error, Debug)]
pub enum Error {
    /// Transport could not connect or subscribe
    #[error("connection error: {0}")]
    Connection(String),

    /// Inbound bytes were not a well-formed envelope
    #[error("decode error: {0}")]
    Decode(#[source] serde_json::Error),

    /// Outbound payload could not be serialized
    #[error("encode error: {0}")]
    Encode(#[source] serde_json::Error),

    /// No matching reply arrived within the request timeout
    #[error("request to {topic} timed out")]
    Timeout { topic: String },

    /// `send`/`request` was called before `init`
    #[error("session not initialized")]
    NotInitialized,

    /// `reply` was called with an envelope that carries no request id
    #[error("envelope is not a request (no request id)")]
    NotARequest,

    /// The session was closed while the operation was in flight
    #[error("session closed")]
    Closed,

    /// Transport-level failure after the connection was established
    #[error("transport error: {0}")]
    Transport(String),

    /// Required configuration value missing
    #[error("missing required configuration: {0}")]
    MissingConfig(String),
}

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, Error>;
