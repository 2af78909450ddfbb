//! Media probing
//!
//! The planner sees sources through the `MediaProber` seam; production
//! uses ffprobe's JSON output, tests mock the trait.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;

use crate::models::Resolution;
use crate::{Error, Result};

/// What the planner needs to know about a source file
#[derive(Debug, Clone, Default)]
pub struct MediaInfo {
    /// Normalized container name: "mp4", "mkv", "webm", or the raw demuxer
    /// name when unrecognized
    pub container: String,
    pub video_codec: String,
    pub audio_codec: String,
    pub resolution: Option<Resolution>,
    /// Overall bitrate, bits per second; 0 when unknown
    pub bitrate: u64,
    pub hdr: bool,
    pub duration_seconds: Option<f64>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaProber: Send + Sync {
    /// Probe a media file; failure is fatal to the planning call
    async fn probe(&self, path: &Path) -> Result<MediaInfo>;
}

/// Production prober shelling out to ffprobe
pub struct FfprobeProber {
    ffprobe_path: String,
}

impl FfprobeProber {
    #[must_use]
    pub fn new(ffprobe_path: impl Into<String>) -> Self {
        Self {
            ffprobe_path: ffprobe_path.into(),
        }
    }
}

#[async_trait]
impl MediaProber for FfprobeProber {
    async fn probe(&self, path: &Path) -> Result<MediaInfo> {
        let output = tokio::process::Command::new(&self.ffprobe_path)
            .args([
                "-v",
                "error",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(path)
            .output()
            .await
            .map_err(|e| Error::MediaUnreadable(format!("ffprobe failed to start: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::MediaUnreadable(format!(
                "{}: {}",
                path.display(),
                stderr.trim()
            )));
        }

        let parsed: FfprobeOutput = serde_json::from_slice(&output.stdout)
            .map_err(|e| Error::MediaUnreadable(format!("unparseable probe output: {e}")))?;
        Ok(parsed.into_media_info(path))
    }
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    format: FfprobeFormat,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Default, Deserialize)]
struct FfprobeFormat {
    #[serde(default)]
    format_name: String,
    duration: Option<String>,
    bit_rate: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FfprobeStream {
    #[serde(default)]
    codec_type: String,
    #[serde(default)]
    codec_name: String,
    width: Option<u32>,
    height: Option<u32>,
    color_transfer: Option<String>,
    color_primaries: Option<String>,
    bits_per_raw_sample: Option<String>,
}

impl FfprobeOutput {
    fn into_media_info(self, path: &Path) -> MediaInfo {
        let video = self.streams.iter().find(|s| s.codec_type == "video");
        let audio = self.streams.iter().find(|s| s.codec_type == "audio");

        let resolution = video.and_then(|v| match (v.width, v.height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => Some(Resolution::new(w, h)),
            _ => None,
        });

        MediaInfo {
            container: normalize_container(&self.format.format_name, path),
            video_codec: video.map(|v| v.codec_name.clone()).unwrap_or_default(),
            audio_codec: audio.map(|a| a.codec_name.clone()).unwrap_or_default(),
            resolution,
            bitrate: self
                .format
                .bit_rate
                .as_deref()
                .and_then(|b| b.parse().ok())
                .unwrap_or(0),
            hdr: video.is_some_and(is_hdr_stream),
            duration_seconds: self
                .format
                .duration
                .as_deref()
                .and_then(|d| d.parse().ok())
                .filter(|d: &f64| *d > 0.0),
        }
    }
}

/// HDR when the transfer function is PQ/HLG, the primaries are bt2020, or
/// the stream exceeds 8 bits per sample
fn is_hdr_stream(stream: &FfprobeStream) -> bool {
    if let Some(transfer) = &stream.color_transfer {
        if ["smpte2084", "arib-std-b67", "smpte2086"]
            .iter()
            .any(|t| transfer.contains(t))
        {
            return true;
        }
    }
    if let Some(primaries) = &stream.color_primaries {
        if primaries.contains("bt2020") {
            return true;
        }
    }
    stream
        .bits_per_raw_sample
        .as_deref()
        .and_then(|b| b.parse::<u32>().ok())
        .is_some_and(|bits| bits > 8)
}

/// ffprobe reports demuxer lists like "matroska,webm"; map them to the
/// container names the planner reasons about
fn normalize_container(format_name: &str, path: &Path) -> String {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();
    if format_name.contains("matroska") {
        return if extension == "webm" { "webm" } else { "mkv" }.to_string();
    }
    if format_name.contains("mp4") || format_name.contains("mov") {
        return "mp4".to_string();
    }
    if format_name.contains("webm") {
        return "webm".to_string();
    }
    format_name
        .split(',')
        .next()
        .unwrap_or(format_name)
        .to_string()
}
