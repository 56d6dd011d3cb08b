//! Download job record

use crate::error::{FetchErrorKind, FetchFailure};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Whether `self -> next` is a legal move
    pub fn can_become(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running)
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::Failed)
        )
    }
}

/// A single requested download and its outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadJob {
    pub id: String,
    pub source_url: String,
    pub target_name: String,
    pub state: JobState,
    pub bytes_transferred: u64,
    /// Expected size, when the source announced one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<FetchErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl DownloadJob {
    /// Create a new queued job
    pub fn new(source_url: String, target_name: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source_url,
            target_name,
            state: JobState::Queued,
            bytes_transferred: 0,
            total_bytes: None,
            error_kind: None,
            error_detail: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    /// The failure recorded on a failed job
    pub fn failure(&self) -> Option<FetchFailure> {
        match (self.state, self.error_kind) {
            (JobState::Failed, Some(kind)) => Some(FetchFailure::new(
                kind,
                self.error_detail.clone().unwrap_or_default(),
            )),
            _ => None,
        }
    }
}
