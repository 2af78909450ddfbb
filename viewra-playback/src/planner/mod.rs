//! Playback planning
//!
//! Decides direct play versus transcode from the probed source and the
//! client's capabilities. The decision, including its `reason` string, is
//! a pure function of the inputs.

pub mod probe;

pub use probe::{FfprobeProber, MediaInfo, MediaProber};

use std::path::Path;
use std::sync::Arc;
use tracing::warn;

use crate::models::{
    profile::normalize_resolution, ClientKind, ContainerFormat, DeviceProfile,
    PlaybackDecision, Resolution, SpeedPriority, TranscodeRequest,
};
use crate::Result;

/// Declared client bandwidth at or above this counts as HD+ and enables
/// adaptive output for desktop browsers
const HD_BANDWIDTH_BPS: u64 = 8_000_000;

/// Bitrate ladder keyed by target height, kbps
const fn ladder_bitrate_kbps(height: u32) -> u32 {
    match height {
        h if h >= 2160 => 25000,
        h if h >= 1440 => 12000,
        h if h >= 1080 => 6000,
        h if h >= 720 => 3000,
        _ => 1500,
    }
}

/// Quality tier derived from the target bitrate
const fn quality_for_bitrate(kbps: u32) -> u8 {
    match kbps {
        b if b >= 25000 => 90,
        b if b >= 12000 => 80,
        b if b >= 6000 => 70,
        b if b >= 3000 => 60,
        b if b >= 1500 => 50,
        _ => 40,
    }
}

pub struct PlaybackPlanner {
    prober: Arc<dyn MediaProber>,
    prefer_hardware: bool,
    hardware_type: Option<String>,
}

impl PlaybackPlanner {
    #[must_use]
    pub fn new(prober: Arc<dyn MediaProber>) -> Self {
        Self {
            prober,
            prefer_hardware: false,
            hardware_type: None,
        }
    }

    /// Default hardware preference applied to produced transcode requests
    #[must_use]
    pub fn with_hardware_preference(mut self, prefer: bool, kind: Option<String>) -> Self {
        self.prefer_hardware = prefer;
        self.hardware_type = kind;
        self
    }

    /// Probe the source and decide. Probe failure is fatal to the call.
    pub async fn decide(
        &self,
        media_path: &Path,
        profile: &DeviceProfile,
    ) -> Result<PlaybackDecision> {
        profile.validate()?;
        let media = self.prober.probe(media_path).await?;
        Ok(self.decide_media(media_path, &media, profile))
    }

    /// Pure decision from already-probed media. Repeated calls with equal
    /// inputs yield equal decisions including `reason`.
    #[must_use]
    pub fn decide_media(
        &self,
        media_path: &Path,
        media: &MediaInfo,
        profile: &DeviceProfile,
    ) -> PlaybackDecision {
        let kind = profile.client_kind();
        let codecs_declared = !profile.supported_codecs.is_empty();

        let container_ok = container_supported(&media.container, kind);
        let codec_ok = codecs_declared && profile.supports_codec(&media.video_codec);
        let bitrate_ok = profile.max_bitrate == 0 || media.bitrate <= profile.max_bitrate;
        let resolution_ok = match (profile.resolution_level(), media_level(media)) {
            (Some(cap), Some(level)) => level <= cap,
            _ => true,
        };
        let hdr_ok = !media.hdr || profile.supports_hdr;

        if container_ok && codec_ok && bitrate_ok && resolution_ok && hdr_ok {
            return PlaybackDecision::direct_play(
                media_path.to_string_lossy(),
                "Media is compatible with client capabilities",
            );
        }

        // Target parameters, tie-broken in specification order
        let video_codec = choose_codec(profile, kind, codecs_declared);
        let target_height = target_height(media, profile);
        let resolution = Resolution::for_height(target_height);

        let mut bitrate_kbps = ladder_bitrate_kbps(target_height);
        if profile.max_bitrate > 0 {
            bitrate_kbps = bitrate_kbps.min((profile.max_bitrate / 1000) as u32);
        }
        let quality = quality_for_bitrate(bitrate_kbps);
        let container = choose_container(profile, kind);
        let speed_priority = if kind.is_browser() {
            SpeedPriority::Fastest
        } else {
            SpeedPriority::Balanced
        };

        let mut reasons = Vec::new();
        if !container_ok {
            reasons.push(format!(
                "container change: {}→{}",
                media.container,
                container.as_str()
            ));
        }
        if codecs_declared && !codec_ok {
            reasons.push(format!(
                "video codec change: {}→{}",
                media.video_codec, video_codec
            ));
        }
        if !bitrate_ok {
            reasons.push(format!(
                "bitrate {} kbps exceeds client limit {} kbps",
                media.bitrate / 1000,
                profile.max_bitrate / 1000
            ));
        }
        if !resolution_ok {
            reasons.push(format!("downscaling to {target_height}p"));
        }
        if !hdr_ok {
            reasons.push("HDR tone-mapping required".to_string());
        }
        if !codecs_declared {
            warn!(user_agent = %profile.user_agent, "profile declares no codecs");
            reasons.push("no supported codecs declared; defaulting to h264".to_string());
        }

        let request = TranscodeRequest {
            input_path: media_path.to_path_buf(),
            media_id: String::new(),
            container,
            video_codec,
            audio_codec: "aac".to_string(),
            resolution: Some(resolution),
            quality,
            speed_priority,
            seek_seconds: 0.0,
            duration_seconds: media.duration_seconds,
            enable_abr: container.is_adaptive(),
            prefer_hardware: self.prefer_hardware,
            hardware_type: self.hardware_type.clone(),
            max_video_bitrate_kbps: Some(bitrate_kbps),
            max_audio_bitrate_kbps: None,
        };

        PlaybackDecision::transcode(request, reasons.join("; "))
    }
}

/// Source container acceptance per client: mp4 universally, webm only in
/// browsers, mkv nowhere a browser is involved
fn container_supported(container: &str, kind: ClientKind) -> bool {
    match container {
        "mp4" => true,
        "webm" => kind.is_browser(),
        "mkv" => !kind.is_browser() && !matches!(kind, ClientKind::Ios),
        _ => false,
    }
}

/// Codec preference ladder: h264, then hevc where supported, then vp9/vp8
/// for browsers, h264 as the final default
fn choose_codec(profile: &DeviceProfile, kind: ClientKind, codecs_declared: bool) -> String {
    if !codecs_declared {
        return "h264".to_string();
    }
    if profile.supports_codec("h264") {
        return "h264".to_string();
    }
    if profile.supports_hevc && profile.supports_codec("hevc") {
        return "hevc".to_string();
    }
    if kind.is_browser() {
        if profile.supports_codec("vp9") {
            return "vp9".to_string();
        }
        if profile.supports_codec("vp8") {
            return "vp8".to_string();
        }
    }
    "h264".to_string()
}

/// min(source, profile cap), on the normalized ladder
fn target_height(media: &MediaInfo, profile: &DeviceProfile) -> u32 {
    let source = media_level(media).unwrap_or(1080);
    match profile.resolution_level() {
        Some(cap) => source.min(cap),
        None => source,
    }
}

/// Source height snapped onto the ladder
fn media_level(media: &MediaInfo) -> Option<u32> {
    media
        .resolution
        .and_then(|r| normalize_resolution(&r.height.to_string()))
}

/// Adaptive for mobile clients, TVs and declared HD+ bandwidth; within
/// adaptive, DASH for Chromium/Firefox and HLS for the Apple/TV world.
/// Everything else gets progressive mp4.
fn choose_container(profile: &DeviceProfile, kind: ClientKind) -> ContainerFormat {
    let adaptive =
        profile.is_mobile() || kind == ClientKind::Tv || profile.max_bitrate >= HD_BANDWIDTH_BPS;
    if !adaptive {
        return ContainerFormat::Mp4;
    }
    match kind {
        ClientKind::Chromium | ClientKind::Firefox => ContainerFormat::Dash,
        k if k.requires_hls() => ContainerFormat::Hls,
        _ => ContainerFormat::Mp4,
    }
}
