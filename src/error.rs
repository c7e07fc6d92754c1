//! Error types for the cyclone reactor.
//!
//! Mirrors the error taxonomy of the system this crate implements: a
//! small, closed set of kinds rather than one-error-type-per-module, so
//! that callers can match on `category()` for metrics without needing to
//! enumerate every variant.

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the reactor, transport, and TLS layers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Wrapped OS-level I/O failure.
    #[error("I/O error: {source}")]
    Io {
        /// underlying error
        #[from]
        source: std::io::Error,
    },

    /// An invariant was violated (e.g. the acceptor manager was armed
    /// for a write event). Always fatal: the multiplexer shuts down.
    #[error("runtime invariant violated: {message}")]
    Runtime {
        /// what invariant was broken
        message: String,
    },

    /// A non-temporary I/O failure on a specific socket. The manager
    /// that owns the socket is deleted; the multiplexer keeps running.
    #[error("socket operation failed: {message}")]
    SocketOperationFailed {
        /// description, usually wrapping `last_socket_error_as_string`
        message: String,
    },

    /// Bad input from a caller (e.g. a zero port where one is forbidden).
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// description
        message: String,
    },

    /// A config file or endpoint string failed to parse.
    #[error("parse error: {message}")]
    Parser {
        /// description, ideally naming the offending token
        message: String,
    },

    /// The TLS engine reported a hard failure.
    #[cfg(feature = "tls")]
    #[error("tls error: {message}")]
    Tls {
        /// description
        message: String,
    },
}

impl Error {
    /// Construct a [`Error::Runtime`].
    pub fn runtime<S: Into<String>>(message: S) -> Self {
        Self::Runtime {
            message: message.into(),
        }
    }

    /// Construct a [`Error::SocketOperationFailed`].
    pub fn socket_operation_failed<S: Into<String>>(message: S) -> Self {
        Self::SocketOperationFailed {
            message: message.into(),
        }
    }

    /// Construct a [`Error::InvalidArgument`].
    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Construct a [`Error::Parser`].
    pub fn parser<S: Into<String>>(message: S) -> Self {
        Self::Parser {
            message: message.into(),
        }
    }

    /// Construct a [`Error::Tls`].
    #[cfg(feature = "tls")]
    pub fn tls<S: Into<String>>(message: S) -> Self {
        Self::Tls {
            message: message.into(),
        }
    }

    /// Category label for logging/metrics call sites.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Io { .. } => "io",
            Self::Runtime { .. } => "runtime",
            Self::SocketOperationFailed { .. } => "socket",
            Self::InvalidArgument { .. } => "invalid_argument",
            Self::Parser { .. } => "parser",
            #[cfg(feature = "tls")]
            Self::Tls { .. } => "tls",
        }
    }

    /// Whether the caller might reasonably retry instead of tearing
    /// down the connection. Only parser/invalid-argument errors, which
    /// never touch live connection state, qualify.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::InvalidArgument { .. } | Self::Parser { .. })
    }
}
