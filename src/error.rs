//! Error types for YawIO

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// YawIO error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Attempted to connect to a device that is not available
    #[error("Device is not available")]
    DeviceUnavailable,

    /// Device is reserved by another session
    #[error("Device is in use from: {ip} with game: {game}")]
    DeviceReserved {
        /// Game name reported by the reserving session
        game: String,
        /// IP address of the reserving session
        ip: String,
    },

    /// Transport-level connect or send failure
    #[error("Transport failure: {0}")]
    Transport(String),

    /// No reply to a control command within the timeout window
    #[error("Command timeout")]
    CommandTimeout,

    /// Malformed protocol payload
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Operation requested in an incompatible controller state
    #[error("{0}")]
    NotConnected(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}
