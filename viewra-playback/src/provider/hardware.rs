//! Hardware-accelerated provider
//!
//! Single-pass progressive encodes through vaapi/nvenc/videotoolbox.
//! Availability is probed once at construction; an unavailable accelerator
//! still registers but never wins the hardware selection bonus.

use async_trait::async_trait;
use std::path::Path;
use tracing::info;

use super::command;
use super::exec;
use super::traits::{
    collect_artifacts, HardwareAccel, JobContext, JobOutput, ProviderInfo, TranscodeProvider,
};
use crate::config::EncoderConfig;
use crate::models::{ContainerFormat, TranscodeStage};
use crate::{Error, Result};

const VAAPI_RENDER_NODE: &str = "/dev/dri/renderD128";

pub struct HardwareProvider {
    id: String,
    accel: String,
    device: Option<String>,
    available: bool,
    priority: i32,
    ffmpeg_path: String,
    segment_duration: u32,
}

impl HardwareProvider {
    /// Build a provider for one accelerator family, probing availability
    #[must_use]
    pub fn new(encoder: &EncoderConfig, accel: &str) -> Self {
        let (available, device) = probe_accelerator(accel);
        if !available {
            info!(accel, "hardware accelerator not available on this host");
        }
        Self {
            id: format!("hw-{}", accel.to_lowercase()),
            accel: accel.to_lowercase(),
            device,
            available,
            // Below the software pipeline's 50 by less than the selection
            // bonus, so hardware wins exactly when the request prefers it
            // and the accelerator is actually available
            priority: 48,
            ffmpeg_path: encoder.ffmpeg_path.clone(),
            segment_duration: encoder.segment_duration_seconds,
        }
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        self.available
    }
}

#[async_trait]
impl TranscodeProvider for HardwareProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: self.id.clone(),
            name: format!("Hardware ({})", self.accel),
            priority: self.priority,
            // Hardware paths produce progressive output only; adaptive
            // ladders go through the software pipeline
            supported_formats: vec![ContainerFormat::Mp4, ContainerFormat::Mkv],
            accelerators: vec![HardwareAccel {
                kind: self.accel.clone(),
                device: self.device.clone(),
                available: self.available,
            }],
        }
    }

    async fn run(&self, ctx: &JobContext) -> Result<JobOutput> {
        if !self.available {
            return Err(Error::ProviderBusy(format!(
                "accelerator {} is not available",
                self.accel
            )));
        }

        let packaged = ctx.workspace.join("packaged");
        tokio::fs::create_dir_all(&packaged).await?;

        let output = format!("packaged/{}", ctx.request.container.primary_artifact());
        let args = command::progressive_args(
            &ctx.request,
            &ctx.request.input_path.to_string_lossy(),
            &output,
            self.segment_duration,
            Some(&self.accel),
        )?;

        let (status, stderr_tail) = exec::run_encoder(
            ctx,
            &self.ffmpeg_path,
            args,
            0.0,
            100.0,
            TranscodeStage::Encoding,
        )
        .await?;
        if !status.success() {
            return Err(Error::EncoderFailed {
                exit_code: status.code().unwrap_or(-1),
                stderr_tail,
            });
        }

        let (artifacts, total_bytes) = collect_artifacts(&packaged).await?;
        if artifacts.is_empty() {
            return Err(Error::Internal("hardware encode produced no artifacts".to_string()));
        }
        Ok(JobOutput {
            output_dir: packaged,
            artifacts,
            primary_artifact: ctx.request.container.primary_artifact().to_string(),
            total_bytes,
        })
    }
}

/// Cheap host probe per accelerator family
fn probe_accelerator(accel: &str) -> (bool, Option<String>) {
    match accel.to_lowercase().as_str() {
        "vaapi" => {
            let present = Path::new(VAAPI_RENDER_NODE).exists();
            (present, present.then(|| VAAPI_RENDER_NODE.to_string()))
        }
        "nvenc" | "cuda" => (Path::new("/proc/driver/nvidia/version").exists(), None),
        "videotoolbox" => (cfg!(target_os = "macos"), None),
        _ => (false, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_accelerator_is_unavailable() {
        let provider = HardwareProvider::new(&EncoderConfig::default(), "quantum");
        assert!(!provider.is_available());
        assert_eq!(provider.info().id, "hw-quantum");
    }

    #[test]
    fn test_info_exposes_accelerator() {
        let provider = HardwareProvider::new(&EncoderConfig::default(), "vaapi");
        let info = provider.info();
        assert_eq!(info.accelerators.len(), 1);
        assert_eq!(info.accelerators[0].kind, "vaapi");
        assert!(info.supported_formats.contains(&ContainerFormat::Mp4));
        assert!(!info.supported_formats.contains(&ContainerFormat::Hls));
    }
}
