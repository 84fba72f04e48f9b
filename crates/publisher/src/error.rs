//! Publishing errors.
//!
//! Every failure maps onto one [`ErrorKind`], which decides how the retry
//! engine, the task handlers and the transport treat it.

use std::fmt;

use herald_common::AppError;
use herald_queue::QueueError;
use thiserror::Error;

/// Publisher result type.
pub type PublishResult<T> = Result<T, PublishError>;

/// Known platform error codes.
pub mod codes {
    /// The platform is temporarily overloaded.
    pub const SERVER_BUSY: i64 = -1;
    /// The credential secret or token was rejected.
    pub const INVALID_CREDENTIAL: i64 = 40001;
    /// The access token is malformed or revoked.
    pub const INVALID_TOKEN: i64 = 40014;
    /// The access token expired.
    pub const TOKEN_EXPIRED: i64 = 42001;
    /// Call quota exceeded.
    pub const RATE_EXCEEDED: i64 = 45009;
    /// Platform-side internal error.
    pub const INTERNAL_ERROR: i64 = 50001;
    /// The request never got a platform answer (connect, timeout, TLS).
    pub const TRANSPORT_FAILURE: i64 = -1000;
    /// The platform answered with something we could not decode.
    pub const MALFORMED_RESPONSE: i64 = -1001;

    /// Codes retried unless configuration says otherwise.
    pub const DEFAULT_RETRYABLE: [i64; 7] = [
        SERVER_BUSY,
        INVALID_CREDENTIAL,
        INVALID_TOKEN,
        TOKEN_EXPIRED,
        RATE_EXCEEDED,
        INTERNAL_ERROR,
        TRANSPORT_FAILURE,
    ];

    /// Codes meaning the current token must be dropped.
    pub const fn is_auth(code: i64) -> bool {
        matches!(code, INVALID_CREDENTIAL | INVALID_TOKEN | TOKEN_EXPIRED)
    }
}

/// An error reported by, or on the way to, the external platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalError {
    /// Platform error code.
    pub code: i64,
    /// Platform message.
    pub message: String,
    /// Set by the retry engine from its allow-list.
    pub retryable: bool,
}

impl ExternalError {
    /// A platform error, not yet classified.
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: false,
        }
    }

    /// The request did not reach the platform or got no answer.
    pub fn transport(err: impl fmt::Display) -> Self {
        Self::new(codes::TRANSPORT_FAILURE, err.to_string())
    }

    /// The platform answer could not be decoded.
    pub fn malformed(err: impl fmt::Display) -> Self {
        Self::new(codes::MALFORMED_RESPONSE, err.to_string())
    }

    /// Whether the error invalidates the current token.
    #[must_use]
    pub const fn is_auth_error(&self) -> bool {
        codes::is_auth(self.code)
    }
}

impl fmt::Display for ExternalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "platform error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for ExternalError {}

/// Failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Allow-listed platform code; worth retrying later.
    TransientExternal,
    /// Platform rejected the request for good.
    PermanentExternal,
    /// Broker, database or file storage unreachable.
    Infrastructure,
    /// Item missing or already in a terminal state.
    Logic,
    /// The caller cancelled while waiting.
    Cancelled,
}

/// Publisher error.
#[derive(Debug, Error)]
pub enum PublishError {
    /// A single platform call failed.
    #[error("{0}")]
    External(ExternalError),

    /// The retry engine gave up.
    #[error("{source} (after {attempts} attempts)")]
    Failed {
        /// Attempts made, including the first.
        attempts: u32,
        /// The last platform error, unchanged.
        source: ExternalError,
    },

    /// Waiting between attempts was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// Content item not found.
    #[error("Content item not found: {0}")]
    NotFound(String),

    /// The requested transition is not valid for the item's state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A concurrent run staged its own draft first; this run withdrew.
    #[error("Content item {0} was staged by a concurrent run")]
    Superseded(String),

    /// Domain store, asset store or file storage failure.
    #[error(transparent)]
    Store(#[from] AppError),

    /// Task broker failure.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Rejected configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl From<ExternalError> for PublishError {
    fn from(err: ExternalError) -> Self {
        Self::External(err)
    }
}

impl PublishError {
    /// Map onto the failure taxonomy.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::External(e) | Self::Failed { source: e, .. } => {
                if e.retryable {
                    ErrorKind::TransientExternal
                } else {
                    ErrorKind::PermanentExternal
                }
            }
            Self::Cancelled => ErrorKind::Cancelled,
            Self::NotFound(_) | Self::InvalidState(_) | Self::Superseded(_) => ErrorKind::Logic,
            Self::Store(e) => {
                if e.is_logic() {
                    ErrorKind::Logic
                } else {
                    ErrorKind::Infrastructure
                }
            }
            Self::Queue(_) | Self::Config(_) => ErrorKind::Infrastructure,
        }
    }

    /// The platform error underneath, if any.
    #[must_use]
    pub const fn external(&self) -> Option<&ExternalError> {
        match self {
            Self::External(e) | Self::Failed { source: e, .. } => Some(e),
            _ => None,
        }
    }
}

impl From<PublishError> for AppError {
    fn from(err: PublishError) -> Self {
        match err {
            PublishError::Store(e) => e,
            PublishError::NotFound(msg) => Self::NotFound(msg),
            PublishError::InvalidState(msg) => Self::Conflict(msg),
            err @ PublishError::Superseded(_) => Self::Conflict(err.to_string()),
            PublishError::Config(msg) => Self::Config(msg),
            PublishError::Queue(e) => e.into(),
            other => Self::ExternalService(other.to_string()),
        }
    }
}
