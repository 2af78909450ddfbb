use serde::{Deserialize, Serialize};

/// Pipeline stage a session is currently in
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscodeStage {
    #[default]
    Queued,
    Encoding,
    Packaging,
    Publishing,
    Done,
}

impl TranscodeStage {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Encoding => "encoding",
            Self::Packaging => "packaging",
            Self::Publishing => "publishing",
            Self::Done => "done",
        }
    }

    const fn rank(self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Encoding => 1,
            Self::Packaging => 2,
            Self::Publishing => 3,
            Self::Done => 4,
        }
    }
}

/// Observable progress of a running session. Monotonic within a session;
/// the store rejects regressions from late out-of-order reports.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranscodeProgress {
    /// 0-100
    pub percent: f32,
    pub elapsed_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub throughput_fps: Option<f32>,
    pub stage: TranscodeStage,
}

impl TranscodeProgress {
    #[must_use]
    pub fn at(percent: f32, stage: TranscodeStage) -> Self {
        Self {
            percent: percent.clamp(0.0, 100.0),
            stage,
            ..Self::default()
        }
    }

    /// Merge a new report, never moving percent or stage backwards
    #[must_use]
    pub fn merged_with(&self, update: &Self) -> Self {
        Self {
            percent: update.percent.clamp(0.0, 100.0).max(self.percent),
            elapsed_seconds: update.elapsed_seconds.max(self.elapsed_seconds),
            remaining_seconds: update.remaining_seconds.or(self.remaining_seconds),
            throughput_fps: update.throughput_fps.or(self.throughput_fps),
            stage: if update.stage.rank() >= self.stage.rank() {
                update.stage
            } else {
                self.stage
            },
        }
    }
}
