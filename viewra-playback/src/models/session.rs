use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{TranscodeProgress, TranscodeRequest};

/// Session lifecycle state. Transitions are strictly forward:
/// queued → running → {completed, failed, cancelled}. A queued session may
/// also terminate directly (stop before start, dedup fast path).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    const fn rank(self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Running => 1,
            Self::Completed | Self::Failed | Self::Cancelled => 2,
        }
    }

    /// Forward-only ordering; terminal states are absorbing
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Artifacts produced by a completed session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResult {
    pub content_hash: String,
    /// The artifact a player requests first (manifest or output file)
    pub primary_artifact: String,
    /// Paths relative to the content entry
    pub artifacts: Vec<String>,
    pub total_bytes: u64,
}

/// Durable record of a single transcoding invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: Uuid,
    pub provider_id: String,
    pub status: SessionStatus,
    pub request: TranscodeRequest,
    pub progress: TranscodeProgress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<SessionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub last_accessed: DateTime<Utc>,
    /// Workspace directory name: `{container}_{provider}_{id}`
    pub directory_path: String,
}

impl SessionRecord {
    /// Workspace directory name for a session
    #[must_use]
    pub fn directory_name(request: &TranscodeRequest, provider_id: &str, id: Uuid) -> String {
        format!("{}_{}_{}", request.container.as_str(), provider_id, id)
    }
}

/// Filter for `list_by_provider`
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub status: Option<SessionStatus>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

/// Aggregated per-provider counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderStats {
    pub provider_id: String,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub bytes_processed: u64,
}
