//! Encoder and packager command construction
//!
//! Pure functions from a request to argv. Keyframe placement, segment
//! duration and GOP structure are pinned so fingerprint-equal runs produce
//! interchangeable artifact sets.

use crate::models::{ContainerFormat, Resolution, SpeedPriority, TranscodeRequest};
use crate::{Error, Result};

/// Ladder bitrate in kbps for a target height
#[must_use]
pub const fn bitrate_for_height(height: u32) -> u32 {
    match height {
        h if h >= 2160 => 25000,
        h if h >= 1440 => 12000,
        h if h >= 1080 => 6000,
        h if h >= 720 => 3000,
        _ => 1500,
    }
}

/// Audio bitrate in kbps derived from the quality tier
#[must_use]
pub const fn audio_bitrate_for_quality(quality: u8) -> u32 {
    match quality {
        q if q >= 80 => 192,
        q if q >= 60 => 160,
        _ => 128,
    }
}

/// One quality variant of an adaptive ladder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantSpec {
    /// e.g. "1080p"
    pub name: String,
    pub resolution: Resolution,
    pub video_bitrate_kbps: u32,
    pub audio_bitrate_kbps: u32,
}

impl VariantSpec {
    #[must_use]
    pub fn for_height(height: u32, request: &TranscodeRequest) -> Self {
        let mut bitrate = bitrate_for_height(height);
        if let Some(cap) = request.max_video_bitrate_kbps {
            if cap > 0 {
                bitrate = bitrate.min(cap);
            }
        }
        let mut audio = audio_bitrate_for_quality(request.quality);
        if let Some(cap) = request.max_audio_bitrate_kbps {
            if cap > 0 {
                audio = audio.min(cap);
            }
        }
        Self {
            name: format!("{height}p"),
            resolution: Resolution::for_height(height),
            video_bitrate_kbps: bitrate,
            audio_bitrate_kbps: audio,
        }
    }

    /// Intermediate encode filename under `encoded/`
    #[must_use]
    pub fn encoded_filename(&self) -> String {
        format!("{}.mp4", self.name)
    }
}

const LADDER_HEIGHTS: [u32; 5] = [2160, 1440, 1080, 720, 480];

/// Quality variants for a request. Without ABR this is the single target
/// variant; with ABR, every ladder rung at or below the target height.
#[must_use]
pub fn variant_ladder(request: &TranscodeRequest) -> Vec<VariantSpec> {
    let target_height = request.resolution.map_or(1080, |r| r.height);
    if !request.enable_abr {
        return vec![VariantSpec::for_height(target_height, request)];
    }
    let mut ladder: Vec<VariantSpec> = LADDER_HEIGHTS
        .iter()
        .filter(|h| **h <= target_height)
        .map(|h| VariantSpec::for_height(*h, request))
        .collect();
    if ladder.is_empty() {
        ladder.push(VariantSpec::for_height(480, request));
    }
    ladder
}

/// Map a codec name to the software encoder ffmpeg exposes
pub fn software_encoder(codec: &str) -> Result<&'static str> {
    match codec.to_lowercase().as_str() {
        "h264" | "avc" => Ok("libx264"),
        "hevc" | "h265" => Ok("libx265"),
        "vp9" => Ok("libvpx-vp9"),
        "vp8" => Ok("libvpx"),
        "av1" => Ok("libaom-av1"),
        other => Err(Error::validation(
            "video_codec",
            format!("no software encoder for {other}"),
        )),
    }
}

/// Map a codec name to the encoder for a hardware accelerator family
pub fn hardware_encoder(codec: &str, accel: &str) -> Result<String> {
    let family = match codec.to_lowercase().as_str() {
        "h264" | "avc" => "h264",
        "hevc" | "h265" => "hevc",
        other => {
            return Err(Error::validation(
                "video_codec",
                format!("no hardware encoder for {other}"),
            ))
        }
    };
    match accel.to_lowercase().as_str() {
        "vaapi" => Ok(format!("{family}_vaapi")),
        "nvenc" | "cuda" => Ok(format!("{family}_nvenc")),
        "videotoolbox" => Ok(format!("{family}_videotoolbox")),
        "qsv" => Ok(format!("{family}_qsv")),
        other => Err(Error::validation(
            "hardware_type",
            format!("unknown accelerator {other}"),
        )),
    }
}

/// Encoder preset from the speed/quality trade-off
#[must_use]
pub const fn preset_for(speed: SpeedPriority) -> &'static str {
    match speed {
        SpeedPriority::Fastest => "veryfast",
        SpeedPriority::Balanced => "medium",
        SpeedPriority::Quality => "slow",
    }
}

/// Scale preserving aspect ratio, padded to the exact variant dimensions
#[must_use]
pub fn scale_filter(resolution: Resolution) -> String {
    format!(
        "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2",
        w = resolution.width,
        h = resolution.height
    )
}

/// Common head: quiet output plus the machine-readable progress stream
fn base_args(request: &TranscodeRequest, input: &str) -> Vec<String> {
    let mut args = vec![
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        "-nostats".to_string(),
        "-progress".to_string(),
        "pipe:1".to_string(),
        "-y".to_string(),
    ];
    if request.seek_seconds > 0.0 {
        args.push("-ss".to_string());
        args.push(format!("{:.3}", request.seek_seconds));
    }
    args.push("-i".to_string());
    args.push(input.to_string());
    if let Some(duration) = request.duration_seconds {
        args.push("-t".to_string());
        args.push(format!("{duration:.3}"));
    }
    args
}

/// Keyframes at exact segment boundaries, scene-cut insertion disabled
fn gop_args(segment_duration: u32) -> Vec<String> {
    vec![
        "-force_key_frames".to_string(),
        format!("expr:gte(t,n_forced*{segment_duration})"),
        "-sc_threshold".to_string(),
        "0".to_string(),
    ]
}

fn audio_args(request: &TranscodeRequest, bitrate_kbps: u32) -> Vec<String> {
    vec![
        "-c:a".to_string(),
        match request.audio_codec.to_lowercase().as_str() {
            "opus" => "libopus".to_string(),
            "vorbis" => "libvorbis".to_string(),
            _ => "aac".to_string(),
        },
        "-b:a".to_string(),
        format!("{bitrate_kbps}k"),
        "-ar".to_string(),
        "48000".to_string(),
        "-ac".to_string(),
        "2".to_string(),
    ]
}

/// Stage-1 encode of one ladder variant into an intermediate file
pub fn encode_variant_args(
    request: &TranscodeRequest,
    variant: &VariantSpec,
    input: &str,
    output: &str,
    segment_duration: u32,
) -> Result<Vec<String>> {
    let mut args = base_args(request, input);
    args.extend([
        "-map".to_string(),
        "0:v:0".to_string(),
        "-map".to_string(),
        "0:a:0?".to_string(),
        "-c:v".to_string(),
        software_encoder(&request.video_codec)?.to_string(),
        "-preset".to_string(),
        preset_for(request.speed_priority).to_string(),
        "-b:v".to_string(),
        format!("{}k", variant.video_bitrate_kbps),
        "-maxrate".to_string(),
        format!("{}k", variant.video_bitrate_kbps),
        "-bufsize".to_string(),
        format!("{}k", variant.video_bitrate_kbps * 2),
        "-vf".to_string(),
        scale_filter(variant.resolution),
    ]);
    args.extend(gop_args(segment_duration));
    args.extend(audio_args(request, variant.audio_bitrate_kbps));
    args.push(output.to_string());
    Ok(args)
}

/// Single-stage progressive encode producing `output.{ext}` directly
pub fn progressive_args(
    request: &TranscodeRequest,
    input: &str,
    output: &str,
    segment_duration: u32,
    accel: Option<&str>,
) -> Result<Vec<String>> {
    let variant = variant_ladder(request)
        .into_iter()
        .next()
        .ok_or_else(|| Error::Internal("empty variant ladder".to_string()))?;

    let mut args = base_args(request, input);

    if let Some(accel) = accel {
        // Hardware path: upload frames to the device and scale there
        if accel.eq_ignore_ascii_case("vaapi") {
            args.extend([
                "-vaapi_device".to_string(),
                "/dev/dri/renderD128".to_string(),
            ]);
        }
        args.extend([
            "-map".to_string(),
            "0:v:0".to_string(),
            "-map".to_string(),
            "0:a:0?".to_string(),
            "-c:v".to_string(),
            hardware_encoder(&request.video_codec, accel)?,
            "-b:v".to_string(),
            format!("{}k", variant.video_bitrate_kbps),
        ]);
        if accel.eq_ignore_ascii_case("vaapi") {
            args.extend([
                "-vf".to_string(),
                format!(
                    "format=nv12,hwupload,scale_vaapi=w={}:h={}",
                    variant.resolution.width, variant.resolution.height
                ),
            ]);
        } else {
            args.extend(["-vf".to_string(), scale_filter(variant.resolution)]);
        }
    } else {
        args.extend([
            "-map".to_string(),
            "0:v:0".to_string(),
            "-map".to_string(),
            "0:a:0?".to_string(),
            "-c:v".to_string(),
            software_encoder(&request.video_codec)?.to_string(),
            "-preset".to_string(),
            preset_for(request.speed_priority).to_string(),
            "-b:v".to_string(),
            format!("{}k", variant.video_bitrate_kbps),
            "-maxrate".to_string(),
            format!("{}k", variant.video_bitrate_kbps),
            "-bufsize".to_string(),
            format!("{}k", variant.video_bitrate_kbps * 2),
            "-vf".to_string(),
            scale_filter(variant.resolution),
        ]);
    }

    args.extend(gop_args(segment_duration));
    args.extend(audio_args(request, variant.audio_bitrate_kbps));

    if request.container == ContainerFormat::Mp4 {
        args.extend(["-movflags".to_string(), "+faststart".to_string()]);
    }
    args.push(output.to_string());
    Ok(args)
}

/// Stage-2 packaging of encoded variants into segments plus a manifest.
///
/// Stream descriptors follow the shaka-packager syntax: per-variant video
/// streams under `video/{n}/`, one audio stream under `audio/`. Paths are
/// relative to the packager's working directory (the session workspace).
pub fn package_args(
    container: ContainerFormat,
    variants: &[VariantSpec],
    segment_duration: u32,
) -> Result<Vec<String>> {
    if variants.is_empty() {
        return Err(Error::Internal("packaging requires at least one variant".to_string()));
    }
    let segment_ext = match container {
        ContainerFormat::Hls => "ts",
        ContainerFormat::Dash => "m4s",
        other => {
            return Err(Error::validation(
                "container",
                format!("{other} is not an adaptive container"),
            ))
        }
    };

    let mut args = Vec::new();
    for (index, variant) in variants.iter().enumerate() {
        let mut descriptor = format!(
            "in=encoded/{input},stream=video,init_segment=packaged/video/{index}/init.mp4,segment_template=packaged/video/{index}/$Number$.{segment_ext}",
            input = variant.encoded_filename(),
        );
        if container == ContainerFormat::Hls {
            descriptor.push_str(&format!(",playlist_name=video/{index}/stream.m3u8"));
        }
        args.push(descriptor);
    }

    // Audio comes from the top variant's intermediate
    let top = &variants[0];
    let mut audio = format!(
        "in=encoded/{input},stream=audio,init_segment=packaged/audio/init.mp4,segment_template=packaged/audio/$Number$.{segment_ext}",
        input = top.encoded_filename(),
    );
    if container == ContainerFormat::Hls {
        audio.push_str(",playlist_name=audio/stream.m3u8,hls_group_id=audio,hls_name=main");
    }
    args.push(audio);

    args.push("--segment_duration".to_string());
    args.push(segment_duration.to_string());

    match container {
        ContainerFormat::Dash => {
            args.push("--generate_static_live_mpd".to_string());
            args.push("--mpd_output".to_string());
            args.push("packaged/manifest.mpd".to_string());
        }
        ContainerFormat::Hls => {
            args.push("--hls_master_playlist_output".to_string());
            args.push("packaged/playlist.m3u8".to_string());
        }
        _ => unreachable!("validated above"),
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn request(abr: bool) -> TranscodeRequest {
        TranscodeRequest {
            input_path: PathBuf::from("/media/movie.mkv"),
            media_id: "m".to_string(),
            container: if abr { ContainerFormat::Dash } else { ContainerFormat::Mp4 },
            video_codec: "h264".to_string(),
            audio_codec: "aac".to_string(),
            resolution: Some(Resolution::for_height(1080)),
            quality: 70,
            speed_priority: SpeedPriority::Fastest,
            seek_seconds: 0.0,
            duration_seconds: Some(600.0),
            enable_abr: abr,
            prefer_hardware: false,
            hardware_type: None,
            max_video_bitrate_kbps: None,
            max_audio_bitrate_kbps: None,
        }
    }

    #[test]
    fn test_bitrate_table() {
        assert_eq!(bitrate_for_height(480), 1500);
        assert_eq!(bitrate_for_height(720), 3000);
        assert_eq!(bitrate_for_height(1080), 6000);
        assert_eq!(bitrate_for_height(1440), 12000);
        assert_eq!(bitrate_for_height(2160), 25000);
    }

    #[test]
    fn test_ladder_respects_target_height() {
        let ladder = variant_ladder(&request(true));
        let names: Vec<&str> = ladder.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["1080p", "720p", "480p"]);

        let single = variant_ladder(&request(false));
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].name, "1080p");
        assert_eq!(single[0].video_bitrate_kbps, 6000);
    }

    #[test]
    fn test_ladder_honors_bitrate_cap() {
        let mut req = request(true);
        req.max_video_bitrate_kbps = Some(4000);
        let ladder = variant_ladder(&req);
        assert!(ladder.iter().all(|v| v.video_bitrate_kbps <= 4000));
    }

    #[test]
    fn test_encoder_mapping() {
        assert_eq!(software_encoder("h264").expect("h264"), "libx264");
        assert_eq!(software_encoder("HEVC").expect("hevc"), "libx265");
        assert_eq!(software_encoder("vp9").expect("vp9"), "libvpx-vp9");
        assert!(software_encoder("prores").is_err());

        assert_eq!(hardware_encoder("h264", "vaapi").expect("vaapi"), "h264_vaapi");
        assert_eq!(hardware_encoder("hevc", "nvenc").expect("nvenc"), "hevc_nvenc");
        assert!(hardware_encoder("vp9", "vaapi").is_err());
    }

    #[test]
    fn test_encode_args_are_deterministic_and_pinned() {
        let req = request(true);
        let variant = VariantSpec::for_height(720, &req);
        let a = encode_variant_args(&req, &variant, "in.mkv", "encoded/720p.mp4", 4)
            .expect("args");
        let b = encode_variant_args(&req, &variant, "in.mkv", "encoded/720p.mp4", 4)
            .expect("args");
        assert_eq!(a, b);

        let joined = a.join(" ");
        assert!(joined.contains("-force_key_frames expr:gte(t,n_forced*4)"));
        assert!(joined.contains("-sc_threshold 0"));
        assert!(joined.contains("-b:v 3000k"));
        assert!(joined.contains("-preset veryfast"));
        assert!(joined.contains("-progress pipe:1"));
    }

    #[test]
    fn test_seek_and_duration_propagate() {
        let mut req = request(false);
        req.seek_seconds = 90.5;
        let args = progressive_args(&req, "in.mkv", "packaged/output.mp4", 4, None)
            .expect("args");
        let joined = args.join(" ");
        assert!(joined.contains("-ss 90.500"));
        assert!(joined.contains("-t 600.000"));
        assert!(joined.contains("-movflags +faststart"));
    }

    #[test]
    fn test_hardware_progressive_args() {
        let mut req = request(false);
        req.prefer_hardware = true;
        let args = progressive_args(&req, "in.mkv", "packaged/output.mp4", 4, Some("vaapi"))
            .expect("args");
        let joined = args.join(" ");
        assert!(joined.contains("-c:v h264_vaapi"));
        assert!(joined.contains("-vaapi_device"));
        assert!(joined.contains("scale_vaapi"));
    }

    #[test]
    fn test_package_args_dash_layout() {
        let req = request(true);
        let ladder = variant_ladder(&req);
        let args = package_args(ContainerFormat::Dash, &ladder, 4).expect("args");
        let joined = args.join(" ");
        assert!(joined.contains("segment_template=packaged/video/0/$Number$.m4s"));
        assert!(joined.contains("segment_template=packaged/audio/$Number$.m4s"));
        assert!(joined.contains("--mpd_output packaged/manifest.mpd"));
        // One descriptor per variant plus audio
        let descriptors = args.iter().filter(|a| a.starts_with("in=")).count();
        assert_eq!(descriptors, ladder.len() + 1);
    }

    #[test]
    fn test_package_args_hls_layout() {
        let req = request(true);
        let ladder = variant_ladder(&req);
        let args = package_args(ContainerFormat::Hls, &ladder, 4).expect("args");
        let joined = args.join(" ");
        assert!(joined.contains("$Number$.ts"));
        assert!(joined.contains("--hls_master_playlist_output packaged/playlist.m3u8"));
    }

    #[test]
    fn test_package_rejects_progressive_container() {
        let req = request(true);
        let ladder = variant_ladder(&req);
        assert!(package_args(ContainerFormat::Mp4, &ladder, 4).is_err());
    }
}
