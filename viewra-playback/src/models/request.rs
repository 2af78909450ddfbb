use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::{Error, Result};

/// Output container format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerFormat {
    Mp4,
    Dash,
    Hls,
    Webm,
    Mkv,
}

impl ContainerFormat {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Dash => "dash",
            Self::Hls => "hls",
            Self::Webm => "webm",
            Self::Mkv => "mkv",
        }
    }

    /// Segmented output with a manifest, as opposed to a single progressive file
    #[must_use]
    pub const fn is_adaptive(self) -> bool {
        matches!(self, Self::Dash | Self::Hls)
    }

    /// The artifact a player requests first
    #[must_use]
    pub const fn primary_artifact(self) -> &'static str {
        match self {
            Self::Mp4 => "output.mp4",
            Self::Dash => "manifest.mpd",
            Self::Hls => "playlist.m3u8",
            Self::Webm => "output.webm",
            Self::Mkv => "output.mkv",
        }
    }
}

impl std::str::FromStr for ContainerFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "mp4" => Ok(Self::Mp4),
            "dash" | "mpd" => Ok(Self::Dash),
            "hls" | "m3u8" => Ok(Self::Hls),
            "webm" => Ok(Self::Webm),
            "mkv" | "matroska" => Ok(Self::Mkv),
            other => Err(Error::validation(
                "container",
                format!("unknown container format: {other}"),
            )),
        }
    }
}

impl std::fmt::Display for ContainerFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encoder speed/quality trade-off
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeedPriority {
    #[default]
    Balanced,
    Quality,
    Fastest,
}

impl SpeedPriority {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Balanced => "balanced",
            Self::Quality => "quality",
            Self::Fastest => "fastest",
        }
    }
}

/// Video frame dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Standard ladder resolution for a target height, 16:9 width
    #[must_use]
    pub fn for_height(height: u32) -> Self {
        // round(height * 16 / 9), kept even for encoder alignment
        let width = (f64::from(height) * 16.0 / 9.0).round() as u32;
        Self {
            width: width & !1,
            height,
        }
    }
}

/// A fully-specified transcoding request. Immutable once dispatched;
/// the session row stores it serialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodeRequest {
    pub input_path: PathBuf,
    pub media_id: String,
    pub container: ContainerFormat,
    pub video_codec: String,
    pub audio_codec: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
    /// Quality tier, 0-100
    pub quality: u8,
    pub speed_priority: SpeedPriority,
    /// Start offset into the source, seconds
    #[serde(default)]
    pub seek_seconds: f64,
    /// Source duration when known, seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    /// Produce an adaptive bitrate ladder instead of a single variant
    #[serde(default)]
    pub enable_abr: bool,
    #[serde(default)]
    pub prefer_hardware: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hardware_type: Option<String>,
    /// Video bitrate cap, kbps
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_video_bitrate_kbps: Option<u32>,
    /// Audio bitrate cap, kbps
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_audio_bitrate_kbps: Option<u32>,
}

impl TranscodeRequest {
    /// Per-field validation applied before dispatch
    pub fn validate(&self) -> Result<()> {
        if self.input_path.as_os_str().is_empty() {
            return Err(Error::validation("input_path", "must not be empty"));
        }
        if self.media_id.is_empty() {
            return Err(Error::validation("media_id", "must not be empty"));
        }
        if self.quality > 100 {
            return Err(Error::validation("quality", "must be within 0-100"));
        }
        if self.video_codec.is_empty() {
            return Err(Error::validation("video_codec", "must not be empty"));
        }
        if !self.seek_seconds.is_finite() || self.seek_seconds < 0.0 {
            return Err(Error::validation("seek", "must be a non-negative number"));
        }
        if let Some(duration) = self.duration_seconds {
            if !duration.is_finite() || duration <= 0.0 {
                return Err(Error::validation("duration", "must be a positive number"));
            }
        }
        if let Some(res) = self.resolution {
            if res.width == 0 || res.height == 0 {
                return Err(Error::validation("resolution", "dimensions must be non-zero"));
            }
        }
        Ok(())
    }
}
