//! Layered error taxonomy for the volume manager.

use crate::protocol::{codes, FrameError};
use crate::wire::WireError;
use std::io;
use thiserror::Error;

/// Failures raised by the resource store. Not-found and duplicate-key are
/// distinguished from everything else so handlers can map them onto the
/// protocol's `ENOENT` / `EEXIST` codes; any other backend failure becomes
/// an internal error that carries entity kind + key for the server log
/// without leaking detail to remote callers.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: String },
    #[error("{kind} {key} already exists")]
    Exists { kind: &'static str, key: String },
    #[error("snapshot I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("snapshot serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn not_found(kind: &'static str, key: impl Into<String>) -> Self {
        StoreError::NotFound {
            kind,
            key: key.into(),
        }
    }

    pub fn exists(kind: &'static str, key: impl Into<String>) -> Self {
        StoreError::Exists {
            kind,
            key: key.into(),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            StoreError::NotFound { .. } => codes::ENOENT,
            StoreError::Exists { .. } => codes::EEXIST,
            _ => codes::SEINTERNAL,
        }
    }
}

/// A handler failure: the numeric code that becomes the final return code,
/// plus an optional human-readable explanation sent as `MSG_ERR` first.
#[derive(Debug, Error)]
#[error("request failed with code {code}")]
pub struct HandlerError {
    pub code: i32,
    pub message: Option<String>,
}

impl HandlerError {
    pub fn code(code: i32) -> Self {
        Self {
            code,
            message: None,
        }
    }

    pub fn with_text(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }

    pub fn einval(message: impl Into<String>) -> Self {
        Self::with_text(codes::EINVAL, message)
    }
}

impl From<StoreError> for HandlerError {
    fn from(err: StoreError) -> Self {
        HandlerError::code(err.code())
    }
}

impl From<WireError> for HandlerError {
    fn from(_: WireError) -> Self {
        HandlerError::code(codes::EINVAL)
    }
}

/// Client-side failures.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("server error {code}{}", .message.as_deref().map(|m| format!(": {m}")).unwrap_or_default())]
    Remote { code: i32, message: Option<String> },
    #[error("volume manager not active, gave up after {attempts} attempts")]
    RetriesExhausted { attempts: usize },
    #[error("wire decode error: {0}")]
    Wire(#[from] WireError),
}

impl From<FrameError> for ClientError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(err) => ClientError::Io(err),
            FrameError::BadMagic(magic) => {
                ClientError::Protocol(format!("unexpected magic 0x{magic:08x}"))
            }
            FrameError::BadType(raw) => ClientError::Protocol(format!("unknown reply type {raw}")),
            FrameError::Oversized(len) => {
                ClientError::Protocol(format!("oversized payload ({len} bytes)"))
            }
        }
    }
}

impl ClientError {
    /// Numeric final return code of a remote failure, if that is what this is.
    pub fn remote_code(&self) -> Option<i32> {
        match self {
            ClientError::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }
}
