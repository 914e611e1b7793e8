use thiserror::Error;

/// Error types shared by every honeypot component: protocol emulators,
/// the simulation engine, the agent control loop, and the server.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum HoneypotError {
    /// Configuration or initialization error.
    #[error("configuration error: {0}")]
    Config(String),

    /// A declarative profile failed to parse or resolve.
    #[error("profile error: {0}")]
    Profile(String),

    /// A profile name was requested that does not exist in the store.
    #[error("profile not found: {0}")]
    ProfileNotFound(String),

    /// Binding a device's TCP listener failed because the port is taken.
    #[error("port {0} already in use")]
    PortInUse(u16),

    /// A wire-level frame could not be parsed far enough to produce a
    /// protocol-level error response; the connection must be closed.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Transport failure talking to the central server.
    #[error("transport error: {0}")]
    Transport(String),

    /// The server has no record of the given agent.
    #[error("agent not found: {0}")]
    AgentNotFound(String),

    /// A rename would collide with an existing node_id.
    #[error("node_id already exists: {0}")]
    RenameCollision(String),

    /// Generic I/O failure, stringified (the underlying `std::io::Error`
    /// does not implement `Clone`/`PartialEq`, so it is not nested here).
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for HoneypotError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Convenience alias for honeypot operations.
pub type HoneypotResult<T> = Result<T, HoneypotError>;
