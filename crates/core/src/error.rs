use std::time::Duration;

use serde::{Deserialize, Serialize};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Stable discriminant of [`Error`], safe to hand to callers and serialize.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SchemaUnknown,
    IdentityIncomplete,
    InvalidDocument,
    Transport,
    ImmutableFieldConflict,
    WaitTimeout,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::SchemaUnknown => "schema_unknown",
            ErrorKind::IdentityIncomplete => "identity_incomplete",
            ErrorKind::InvalidDocument => "invalid_document",
            ErrorKind::Transport => "transport",
            ErrorKind::ImmutableFieldConflict => "immutable_field_conflict",
            ErrorKind::WaitTimeout => "wait_timeout",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("schema unknown: no kind {kind} served at {api_version}")]
    SchemaUnknown { api_version: String, kind: String },
    #[error("identity incomplete: {0}")]
    IdentityIncomplete(String),
    #[error("invalid document: {0}")]
    InvalidDocument(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("immutable field conflict on {target}: {message}")]
    ImmutableFieldConflict { target: String, message: String },
    #[error("timed out after {waited:?} waiting for {target}")]
    WaitTimeout { target: String, waited: Duration },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::SchemaUnknown { .. } => ErrorKind::SchemaUnknown,
            Error::IdentityIncomplete(_) => ErrorKind::IdentityIncomplete,
            Error::InvalidDocument(_) => ErrorKind::InvalidDocument,
            Error::Transport(_) => ErrorKind::Transport,
            Error::ImmutableFieldConflict { .. } => ErrorKind::ImmutableFieldConflict,
            Error::WaitTimeout { .. } => ErrorKind::WaitTimeout,
        }
    }
}

/// Failure reported by a transport. Caller-retryable; never used to signal absence.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
#[error("transport error{}: {message}", .status.map(|s| format!(" ({})", s)).unwrap_or_default())]
pub struct TransportError {
    /// HTTP-style status when the cluster answered; `None` for connection/process failures.
    pub status: Option<u16>,
    /// Machine-readable reason from the API (`NotFound`, `Invalid`, `AlreadyExists`, ...).
    pub reason: Option<String>,
    pub message: String,
}

impl TransportError {
    pub fn new(status: Option<u16>, reason: Option<&str>, message: impl Into<String>) -> Self {
        Self { status, reason: reason.map(|r| r.to_string()), message: message.into() }
    }

    /// Failure before any answer from the cluster (connect, spawn, decode).
    pub fn io(message: impl Into<String>) -> Self {
        Self::new(None, None, message)
    }

    pub fn is_not_found(&self) -> bool {
        self.status == Some(404)
    }

    pub fn is_conflict(&self) -> bool {
        self.status == Some(409)
    }

    /// 422 rejections that name an immutable field.
    pub fn is_immutable_conflict(&self) -> bool {
        self.status == Some(422) && self.message.to_ascii_lowercase().contains("immutable")
    }
}
