//! Error types for service-swarm.

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Opening a transport connection failed.
    #[error("connect error: {0}")]
    Connect(String),

    /// The underlying link closed before or during an operation.
    #[error("link closed")]
    LinkClosed,

    /// The authorization handshake was rejected.
    #[error("authorization rejected")]
    Unauthorized,

    /// A remote call failed.
    #[error("call `{method}` failed: {message}")]
    Call {
        /// Wire-level method name that was invoked.
        method: String,
        /// Remote failure description.
        message: String,
    },

    /// A proxy was invoked with a method its descriptor does not list.
    #[error("unknown method `{method}` on service `{service}`")]
    UnknownMethod {
        /// Name of the service the proxy stands in for.
        service: String,
        /// Requested method name.
        method: String,
    },

    /// Payload encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The owning node or connection manager went away.
    #[error("shut down")]
    Shutdown,
}

impl Error {
    /// Create a connect error.
    pub fn connect<S: Into<String>>(msg: S) -> Self {
        Self::Connect(msg.into())
    }

    /// Create a call error.
    pub fn call<M: Into<String>, S: Into<String>>(method: M, msg: S) -> Self {
        Self::Call {
            method: method.into(),
            message: msg.into(),
        }
    }
}
