//! Error taxonomy shared by every dae crate

use std::path::PathBuf;
use thiserror::Error;

/// Everything that can go wrong between daemons
#[derive(Error, Debug)]
pub enum DaeError {
    /// No bindable port left between the start port and 65535
    #[error("no free port found starting at {start}")]
    BindExhausted { start: u16 },

    /// A scan candidate never answered the `dae` probe
    #[error("probe on port {port} went unanswered")]
    ProbeUnresponsive { port: u16 },

    /// Bytes without a separator or without a name
    #[error("malformed packet")]
    MalformedPacket,

    /// Reply with an unknown secret, or a known secret claimed under another name
    #[error("untrusted reply from '{name}' (spoofed: {spoofed})")]
    UntrustedReply { name: String, spoofed: bool },

    #[error("registry contract violation: {0}")]
    RegistryContractViolation(String),

    #[error("peer not found: {0}")]
    PeerNotFound(String),

    #[error("process supervisor unavailable: {0}")]
    SupervisorUnavailable(String),

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    /// Client lookups need a root daemon to ask
    #[error("daemon was not spawned by a root daemon")]
    NoParent,

    #[error("not an executable file: {0}")]
    InvalidExecutable(PathBuf),

    #[error("invalid packet name '{0}'")]
    InvalidPacketName(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("timed out")]
    Timeout,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Alias for dae results
pub type Result<T> = std::result::Result<T, DaeError>;
