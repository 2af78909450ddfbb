use sha2::{Digest, Sha256};
use std::path::Path;

use crate::models::TranscodeRequest;
use crate::{Error, Result};

/// Stable identity of a source file: size plus mtime. Path alone would
/// dedup across edits of the same file; hashing multi-gigabyte sources on
/// every request is too expensive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceIdentity {
    pub size: u64,
    pub mtime_unix: i64,
}

impl SourceIdentity {
    /// Read size and mtime from the filesystem
    pub async fn of(path: &Path) -> Result<Self> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| Error::MediaUnreadable(format!("{}: {e}", path.display())))?;
        if !meta.is_file() {
            return Err(Error::MediaUnreadable(format!(
                "{}: not a regular file",
                path.display()
            )));
        }
        let mtime_unix = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_secs() as i64);
        Ok(Self {
            size: meta.len(),
            mtime_unix,
        })
    }
}

/// Content hash over the canonical serialization of the source identity and
/// the output-affecting request parameters. Equal fingerprints mean the
/// produced artifact sets are interchangeable.
#[must_use]
pub fn fingerprint(request: &TranscodeRequest, source: SourceIdentity) -> String {
    let canonical = canonical_string(request, source);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Canonical key=value serialization, one field per line, fixed order.
/// Fields that do not affect the output bytes (media id, hardware
/// preference without a type) are excluded.
fn canonical_string(request: &TranscodeRequest, source: SourceIdentity) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(256);
    let _ = writeln!(out, "input={}", request.input_path.display());
    let _ = writeln!(out, "size={}", source.size);
    let _ = writeln!(out, "mtime={}", source.mtime_unix);
    let _ = writeln!(out, "container={}", request.container.as_str());
    let _ = writeln!(out, "vcodec={}", request.video_codec.to_lowercase());
    let _ = writeln!(out, "acodec={}", request.audio_codec.to_lowercase());
    match request.resolution {
        Some(res) => {
            let _ = writeln!(out, "resolution={}x{}", res.width, res.height);
        }
        None => {
            let _ = writeln!(out, "resolution=source");
        }
    }
    let _ = writeln!(
        out,
        "vmax={}",
        request.max_video_bitrate_kbps.unwrap_or(0)
    );
    let _ = writeln!(
        out,
        "amax={}",
        request.max_audio_bitrate_kbps.unwrap_or(0)
    );
    let _ = writeln!(out, "quality={}", request.quality);
    let _ = writeln!(out, "speed={}", request.speed_priority.as_str());
    // Seek kept at millisecond precision so float noise cannot split entries
    let _ = writeln!(out, "seek={}", (request.seek_seconds * 1000.0).round() as i64);
    let _ = writeln!(
        out,
        "duration={}",
        request
            .duration_seconds
            .map_or(-1, |d| (d * 1000.0).round() as i64)
    );
    let _ = writeln!(out, "abr={}", request.enable_abr);
    // Hardware encoders produce different bitstreams than software, so the
    // accelerator type is part of the identity, but only when preferred.
    if request.prefer_hardware {
        let _ = writeln!(out, "hw={}", request.hardware_type.as_deref().unwrap_or(""));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContainerFormat, Resolution, SpeedPriority};
    use std::path::PathBuf;

    fn request() -> TranscodeRequest {
        TranscodeRequest {
            input_path: PathBuf::from("/media/movie.mkv"),
            media_id: "media-1".to_string(),
            container: ContainerFormat::Hls,
            video_codec: "h264".to_string(),
            audio_codec: "aac".to_string(),
            resolution: Some(Resolution::new(1920, 1080)),
            quality: 70,
            speed_priority: SpeedPriority::Balanced,
            seek_seconds: 0.0,
            duration_seconds: Some(5400.0),
            enable_abr: true,
            prefer_hardware: false,
            hardware_type: None,
            max_video_bitrate_kbps: Some(6000),
            max_audio_bitrate_kbps: None,
        }
    }

    const SOURCE: SourceIdentity = SourceIdentity {
        size: 1_234_567,
        mtime_unix: 1_700_000_000,
    };

    #[test]
    fn test_fingerprint_is_deterministic() {
        assert_eq!(fingerprint(&request(), SOURCE), fingerprint(&request(), SOURCE));
        assert_eq!(fingerprint(&request(), SOURCE).len(), 64);
    }

    #[test]
    fn test_media_id_does_not_affect_fingerprint() {
        let a = request();
        let mut b = request();
        b.media_id = "different".to_string();
        assert_eq!(fingerprint(&a, SOURCE), fingerprint(&b, SOURCE));
    }

    #[test]
    fn test_codec_case_does_not_affect_fingerprint() {
        let a = request();
        let mut b = request();
        b.video_codec = "H264".to_string();
        assert_eq!(fingerprint(&a, SOURCE), fingerprint(&b, SOURCE));
    }

    #[test]
    fn test_source_edit_changes_fingerprint() {
        let edited = SourceIdentity {
            size: SOURCE.size,
            mtime_unix: SOURCE.mtime_unix + 60,
        };
        assert_ne!(fingerprint(&request(), SOURCE), fingerprint(&request(), edited));
    }

    #[test]
    fn test_output_parameters_change_fingerprint() {
        let base = fingerprint(&request(), SOURCE);

        let mut b = request();
        b.container = ContainerFormat::Dash;
        assert_ne!(base, fingerprint(&b, SOURCE));

        let mut b = request();
        b.quality = 80;
        assert_ne!(base, fingerprint(&b, SOURCE));

        let mut b = request();
        b.seek_seconds = 30.0;
        assert_ne!(base, fingerprint(&b, SOURCE));
    }

    #[test]
    fn test_hardware_type_only_counts_when_preferred() {
        let mut a = request();
        a.hardware_type = Some("vaapi".to_string());
        // Not preferred: accelerator hint is ignored
        assert_eq!(fingerprint(&request(), SOURCE), fingerprint(&a, SOURCE));

        let mut b = a.clone();
        b.prefer_hardware = true;
        assert_ne!(fingerprint(&a, SOURCE), fingerprint(&b, SOURCE));
    }
}
