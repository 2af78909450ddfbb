use serde::{Deserialize, Serialize};

use super::TranscodeRequest;

/// Outcome of playback planning: serve the source directly, or transcode.
/// Exactly one of `direct_play_url` / `transcode_request` is set; the
/// constructors are the only way to build one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackDecision {
    pub should_transcode: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direct_play_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcode_request: Option<TranscodeRequest>,
    /// Human-readable, stable for a fixed input
    pub reason: String,
}

impl PlaybackDecision {
    #[must_use]
    pub fn direct_play(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            should_transcode: false,
            direct_play_url: Some(url.into()),
            transcode_request: None,
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn transcode(request: TranscodeRequest, reason: impl Into<String>) -> Self {
        Self {
            should_transcode: true,
            direct_play_url: None,
            transcode_request: Some(request),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContainerFormat, SpeedPriority};
    use std::path::PathBuf;

    #[test]
    fn test_exactly_one_side_set() {
        let direct = PlaybackDecision::direct_play("/media/a.mp4", "compatible");
        assert!(!direct.should_transcode);
        assert!(direct.direct_play_url.is_some());
        assert!(direct.transcode_request.is_none());

        let request = TranscodeRequest {
            input_path: PathBuf::from("/media/a.mkv"),
            media_id: "m".to_string(),
            container: ContainerFormat::Mp4,
            video_codec: "h264".to_string(),
            audio_codec: "aac".to_string(),
            resolution: None,
            quality: 60,
            speed_priority: SpeedPriority::Balanced,
            seek_seconds: 0.0,
            duration_seconds: None,
            enable_abr: false,
            prefer_hardware: false,
            hardware_type: None,
            max_video_bitrate_kbps: None,
            max_audio_bitrate_kbps: None,
        };
        let transcode = PlaybackDecision::transcode(request, "container change");
        assert!(transcode.should_transcode);
        assert!(transcode.direct_play_url.is_none());
        assert!(transcode.transcode_request.is_some());
    }
}
