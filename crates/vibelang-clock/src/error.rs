//! Error types for vibe-clock

use thiserror::Error;

/// Result type alias for vibe-clock operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in vibe-clock
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration file error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The transport server could not be reached (retried by the connection task)
    #[error("Transport server unavailable: {0}")]
    ServerUnavailable(String),

    /// A session was opened but could not be activated
    #[error("Cannot activate client: {0}")]
    Activation(String),

    /// A command needed the transport server but no session is active
    #[error("Not connected to the transport server")]
    NotConnected,

    /// Loop region with begin >= end
    #[error("Invalid loop region {begin}..{end}: reverse playing not supported")]
    InvalidLoopRegion { begin: u32, end: u32 },

    /// Freewheel requested on a session that does not drive the host audio
    #[error("Freewheel mode requires the host audio to run through {server}")]
    FreewheelUnsupported { server: String },

    /// The transport server rejected a request
    #[error("Transport request failed: {0}")]
    Transport(String),

    /// Command message could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),

    /// JACK error
    #[error("JACK error: {0}")]
    Jack(#[from] jack::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl Error {
    /// Whether the connection task should keep retrying after this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ServerUnavailable(_) | Error::Jack(_))
    }
}
