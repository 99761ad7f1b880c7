use std::fmt;

use thiserror::Error;

/// Errors that can occur during RPC and device-link operations
#[derive(Error, Debug)]
pub enum RpcError {
    /// The requested method is not exposed by the server
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// The remote method raised an error; `kind` is the original error kind
    #[error("server exception ({kind}): {message}")]
    ServerException {
        kind: RemoteErrorKind,
        message: String,
    },

    /// The remote method rejected its arguments
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// Decode, framing or checksum failure
    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    /// No response arrived within the deadline
    #[error("request timed out")]
    Timeout,

    /// The server refused, reset or did not answer the connection attempt
    #[error("server not found: {0}")]
    ServerNotFound(String),

    /// The connection dropped while a request was outstanding
    #[error("connection lost")]
    ConnectionLost,

    /// The device answered a request with an error packet
    #[error("device reported an error for request {}", .0.id)]
    DeviceError(crate::protocol::LinkPacket),

    /// Every correlation id is currently in flight
    #[error("correlation id pool exhausted")]
    IdPoolExhausted,

    /// The owning component was stopped while the operation was pending
    #[error("shut down")]
    Shutdown,

    /// The listening port is already bound by another process
    #[error("port {0} already in use")]
    PortInUse(u16),

    /// Operation not valid in the component's current state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Socket I/O failure not covered by a more specific variant
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RpcError {
    // ---

    /// Whether a reconnect-and-resend attempt may succeed.
    ///
    /// Only a dropped connection qualifies; timeouts are left to the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RpcError::ConnectionLost)
    }
}

/// Result type alias for labwire operations
pub type Result<T> = std::result::Result<T, RpcError>;

/// Error kind carried by a [`RpcError::ServerException`].
///
/// Remote peers report the kind by name. Names with a local equivalent map to
/// a dedicated variant; anything else is preserved verbatim as `Runtime`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RemoteErrorKind {
    InvalidArgument,
    NotFound,
    Unsupported,
    Io,
    Timeout,
    Panic,
    Runtime(String),
}

impl RemoteErrorKind {
    // ---

    /// Map a remote error-kind name to a local kind.
    pub fn from_name(name: &str) -> Self {
        // ---
        match name {
            "InvalidArgument" | "ValueError" | "TypeError" => Self::InvalidArgument,
            "NotFound" | "KeyError" | "IndexError" | "LookupError" => Self::NotFound,
            "Unsupported" | "NotImplementedError" => Self::Unsupported,
            "Io" | "IOError" | "OSError" => Self::Io,
            "Timeout" | "TimeoutError" => Self::Timeout,
            "Panic" => Self::Panic,
            other => Self::Runtime(other.to_string()),
        }
    }

    /// Canonical wire name of this kind.
    pub fn name(&self) -> &str {
        // ---
        match self {
            Self::InvalidArgument => "InvalidArgument",
            Self::NotFound => "NotFound",
            Self::Unsupported => "Unsupported",
            Self::Io => "Io",
            Self::Timeout => "Timeout",
            Self::Panic => "Panic",
            Self::Runtime(name) => name,
        }
    }
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
