//! Crate-wide error taxonomy.
//!
//! Mirrors the daemon's `DaemonError`/`EnvironmentError` split: one enum of
//! causes, matched against by callers that need to special-case a daemon
//! 404 or a cancelled wait. No `IntoResponse` impl here — there is no HTTP
//! surface in this crate, the CLI front-end owns that translation.

use thiserror::Error;

/// The exit status a cancelled or exited container operation maps to.
pub const CANCELLED_EXIT_STATUS: i64 = 128;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Daemon reported "no such container/image/volume". Surfaced verbatim.
    #[error("{0}")]
    NotFound(String),

    /// Daemon reported "invalid reference format". Surfaced verbatim.
    #[error("{0}")]
    InvalidReference(String),

    /// The engine's exit signal fired mid-operation.
    #[error("operation cancelled")]
    Cancelled,

    /// Socket dial/read failure.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Socket dial/read failure at the hyper layer.
    #[error("transport error: {0}")]
    Hyper(#[from] hyper::Error),

    /// Malformed JSON from the daemon, or an unexpected >=500 status with a
    /// non-JSON body.
    #[error("{0}")]
    Protocol(String),

    /// JSON (de)serialization failure on a structured request/response body.
    #[error("protocol error: {0}")]
    Json(#[from] serde_json::Error),

    /// Missing expected tar entry, or a short read while building one.
    #[error("tar error: {0}")]
    Tar(String),

    /// Non-zero exit status from a staged build or helper container.
    #[error("container exited with status {0}")]
    Workflow(i64),

    /// Catch-all for conditions that don't fit the above but aren't
    /// recoverable by the caller (e.g. a stream already closed).
    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// True if the daemon body looked like `{"message": "no such container"}`
    /// or similar "not found" phrasing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }

    /// Classify a daemon error body (already extracted `message` field, or
    /// the raw body if it wasn't JSON-shaped) into a typed error.
    pub fn from_daemon_message(status: u16, message: String) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("no such container")
            || lower.contains("no such image")
            || lower.contains("no such volume")
        {
            EngineError::NotFound(message)
        } else if lower.contains("invalid reference format") {
            EngineError::InvalidReference(message)
        } else {
            EngineError::Protocol(format!("HTTP({}) {}", status, message))
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
