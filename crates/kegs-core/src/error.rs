use std::sync::Arc;

use thiserror::Error;

pub type KegResult<T> = Result<T, KegError>;

/// HTTP-style status the remote store uses for a locked blob range.
pub const STATUS_LOCKED: u16 = 423;

#[derive(Debug, Clone, Error)]
pub enum KegError {
    /// Network-level failure; retried locally up to a fixed bound.
    #[error("transport error: {0}")]
    Transport(String),

    /// The connection to the store is gone; never retried as transient.
    #[error("disconnected from remote store")]
    Disconnected,

    /// Locked resource. The byte-range token must be re-derived and the
    /// whole chunk fetched again; a plain transport retry will not help.
    #[error("resource locked: {0}")]
    Locked(String),

    #[error("server error {code} ({}): {message}", status_label(.code))]
    Server { code: u16, message: String },

    #[error("anti-tamper check failed: {0}")]
    TamperDetected(String),

    #[error("version conflict on keg {id}: version {sent} rejected")]
    VersionConflict { id: String, sent: u64 },

    #[error("cancelled")]
    Cancelled,

    #[error("chunk size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("config error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("{0}")]
    Other(String),
}

impl KegError {
    /// Map a server status code to the matching error kind.
    pub fn from_status(code: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            STATUS_LOCKED => KegError::Locked(message),
            _ => KegError::Server { code, message },
        }
    }

    /// Errors worth retrying at the transport layer.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            KegError::Transport(_) | KegError::SizeMismatch { .. } | KegError::Io(_)
        )
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, KegError::Disconnected)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, KegError::Cancelled)
    }

    /// Short name of the server status, if any.
    pub fn status_name(code: u16) -> &'static str {
        match code {
            400 => "genericServerError",
            404 => "notFound",
            406 => "malformedRequest",
            410 => "apiVersionError",
            413 => "quotaExceeded",
            STATUS_LOCKED => "locked",
            425 => "accountThrottled",
            _ => "unknownServerError",
        }
    }
}

fn status_label(code: &u16) -> &'static str {
    KegError::status_name(*code)
}

impl From<std::io::Error> for KegError {
    fn from(e: std::io::Error) -> Self {
        KegError::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for KegError {
    fn from(e: serde_json::Error) -> Self {
        KegError::Serialization(e.to_string())
    }
}

impl From<anyhow::Error> for KegError {
    fn from(e: anyhow::Error) -> Self {
        KegError::Other(format!("{e:#}"))
    }
}
