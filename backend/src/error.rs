//! Error taxonomy shared by storage, registry and orchestrator

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Why a target name could not be claimed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictReason {
    /// Another queued or running job owns the name
    Active { job_id: String },
    /// A stored file with that name already exists
    Exists,
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active { job_id } => write!(f, "active job {}", job_id),
            Self::Exists => f.write_str("exists"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// Unsafe or malformed name or URL
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("conflict on {name}: {reason}")]
    Conflict { name: String, reason: ConflictReason },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidTarget(message.into())
    }

    /// Stable tag reported to clients
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidTarget(_) => "InvalidTarget",
            Self::Conflict { .. } => "Conflict",
            Self::NotFound(_) => "NotFound",
            Self::Io(_) => "IOError",
        }
    }
}

/// Classification of a failed transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchErrorKind {
    InvalidUrl,
    InvalidTarget,
    ConnectFailed,
    Timeout,
    WriteFailed,
    ProcessError,
}

impl FetchErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidUrl => "InvalidUrl",
            Self::InvalidTarget => "InvalidTarget",
            Self::ConnectFailed => "ConnectFailed",
            Self::Timeout => "Timeout",
            Self::WriteFailed => "WriteFailed",
            Self::ProcessError => "ProcessError",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "InvalidUrl" => Some(Self::InvalidUrl),
            "InvalidTarget" => Some(Self::InvalidTarget),
            "ConnectFailed" => Some(Self::ConnectFailed),
            "Timeout" => Some(Self::Timeout),
            "WriteFailed" => Some(Self::WriteFailed),
            "ProcessError" => Some(Self::ProcessError),
            _ => None,
        }
    }
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure of a single transfer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct FetchFailure {
    pub kind: FetchErrorKind,
    pub message: String,
}

impl FetchFailure {
    pub fn new(kind: FetchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}
