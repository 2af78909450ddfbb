use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Client categories the planner distinguishes when picking containers
/// and speed priorities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    Chromium,
    Firefox,
    Safari,
    Ios,
    Tv,
    Other,
}

impl ClientKind {
    /// Browsers get webm support and the fastest speed priority
    #[must_use]
    pub const fn is_browser(self) -> bool {
        matches!(self, Self::Chromium | Self::Firefox | Self::Safari)
    }

    /// Clients that require HLS for adaptive playback
    #[must_use]
    pub const fn requires_hls(self) -> bool {
        matches!(self, Self::Safari | Self::Ios | Self::Tv)
    }
}

/// Capabilities of the requesting client, one per request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub user_agent: String,
    /// Codec names, matched case-insensitively
    pub supported_codecs: Vec<String>,
    /// "480p".."2160p"; empty disables the resolution cap
    #[serde(default)]
    pub max_resolution: String,
    /// Bits per second; 0 disables the cap
    #[serde(default)]
    pub max_bitrate: u64,
    #[serde(default)]
    pub supports_hdr: bool,
    #[serde(default)]
    pub supports_hevc: bool,
}

impl DeviceProfile {
    /// Basic shape validation; an empty codec list is allowed and handled
    /// by the planner's default fallback
    pub fn validate(&self) -> Result<()> {
        if self.user_agent.is_empty() {
            return Err(Error::ProfileInvalid("user_agent must not be empty".to_string()));
        }
        if !self.max_resolution.is_empty() && self.resolution_level().is_none() {
            return Err(Error::ProfileInvalid(format!(
                "unrecognized max_resolution: {}",
                self.max_resolution
            )));
        }
        Ok(())
    }

    /// Normalized resolution cap as a ladder height, `None` when uncapped
    #[must_use]
    pub fn resolution_level(&self) -> Option<u32> {
        normalize_resolution(&self.max_resolution)
    }

    #[must_use]
    pub fn supports_codec(&self, codec: &str) -> bool {
        self.supported_codecs
            .iter()
            .any(|c| c.eq_ignore_ascii_case(codec))
    }

    /// Classify the client from its user agent string
    #[must_use]
    pub fn client_kind(&self) -> ClientKind {
        let ua = self.user_agent.to_lowercase();
        if ua.contains("iphone") || ua.contains("ipad") || ua.contains("ios") {
            ClientKind::Ios
        } else if ua.contains("smart-tv")
            || ua.contains("smarttv")
            || ua.contains("appletv")
            || ua.contains("tizen")
            || ua.contains("webos")
            || ua.contains("roku")
        {
            ClientKind::Tv
        } else if ua.contains("firefox") {
            ClientKind::Firefox
        } else if ua.contains("safari") && !ua.contains("chrome") && !ua.contains("chromium") {
            ClientKind::Safari
        } else if ua.contains("chrome") || ua.contains("chromium") || ua.contains("edg") {
            ClientKind::Chromium
        } else {
            ClientKind::Other
        }
    }

    #[must_use]
    pub fn is_mobile(&self) -> bool {
        let ua = self.user_agent.to_lowercase();
        ua.contains("mobile") || ua.contains("android") || ua.contains("iphone")
    }

}

/// Normalize a resolution label to a ladder height
///
/// Accepts "1080p", "1080", "4k", "uhd" variants; anything else is `None`.
#[must_use]
pub fn normalize_resolution(value: &str) -> Option<u32> {
    let trimmed = value.trim().to_lowercase();
    if trimmed.is_empty() {
        return None;
    }
    let height = match trimmed.as_str() {
        "4k" | "uhd" | "2160" | "2160p" => 2160,
        "2k" | "1440" | "1440p" | "qhd" => 1440,
        "1080" | "1080p" | "fhd" => 1080,
        "720" | "720p" | "hd" => 720,
        "480" | "480p" | "sd" => 480,
        other => {
            // Raw heights snap down to the nearest ladder rung
            let parsed: u32 = other.strip_suffix('p').unwrap_or(other).parse().ok()?;
            match parsed {
                h if h >= 2160 => 2160,
                h if h >= 1440 => 1440,
                h if h >= 1080 => 1080,
                h if h >= 720 => 720,
                _ => 480,
            }
        }
    };
    Some(height)
}
