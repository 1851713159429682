//! Error types for the RTSP server library.

use std::fmt;

/// Errors that can occur in the RTSP server library.
///
/// Variants map to the failure kinds of the propagation policy: config
/// errors are fatal at startup, [`PublisherConflict`](Self::PublisherConflict),
/// [`NoSuchStream`](Self::NoSuchStream), [`Sequencing`](Self::Sequencing),
/// [`Unauthorized`](Self::Unauthorized) and [`Forbidden`](Self::Forbidden) are
/// reported to the RTSP peer without tearing down the session, [`Io`](Self::Io)
/// tears the session down, and [`Terminated`](Self::Terminated) is the synthetic
/// reply handed to in-flight requests during shutdown drain.
#[derive(Debug, thiserror::Error)]
pub enum RtspError {
    /// Underlying I/O or socket error. Session-terminating.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration file or value. Fatal at startup.
    #[error("config error: {0}")]
    Config(String),

    /// Failed to parse an RTSP request message (RFC 2326 §6).
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// ANNOUNCE to a path that already has a publisher.
    #[error("someone is already publishing on path '{0}'")]
    PublisherConflict(String),

    /// DESCRIBE / SETUP-play / PLAY1 when no ready publisher exists on the path.
    #[error("no one is publishing to path '{0}'")]
    NoSuchStream(String),

    /// PLAY1 with track count mismatch, or a SETUP beyond the track count.
    #[error("sequencing error: {0}")]
    Sequencing(String),

    /// Missing or incorrect publish/read credentials.
    #[error("unauthorized")]
    Unauthorized,

    /// Remote IP not present in the configured allow-list.
    #[error("forbidden")]
    Forbidden,

    /// The dispatcher is in drain mode; in-flight requests get this instead of
    /// a real answer so producers can unblock and the server can finish shutting down.
    #[error("server is terminating")]
    Terminated,

    /// No path registered at the requested path (distinct from
    /// [`NoSuchStream`](Self::NoSuchStream): the path itself is unknown
    /// to the configuration, not merely unpublished).
    #[error("path not found: {0}")]
    PathNotFound(String),
}

/// Specific kind of RTSP parse failure.
#[derive(Debug)]
pub enum ParseErrorKind {
    /// Input was empty (no request line).
    EmptyRequest,
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
    /// `Content-Length` present but the body could not be read in full.
    TruncatedBody,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "empty request"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::TruncatedBody => write!(f, "truncated body"),
        }
    }
}

/// Convenience alias for `Result<T, RtspError>`.
pub type Result<T> = std::result::Result<T, RtspError>;

/// Validation helper: turn a condition into `Ok(())` or a config error.
pub(crate) fn vc(condition: bool, message: impl Into<String>) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(RtspError::Config(message.into()))
    }
}
