//! Synthetic provider
//!
//! Produces deterministic fake artifacts with scripted progress, honoring
//! cancellation. Backs the integration tests and local development
//! without an encoder installed.

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use super::traits::{
    collect_artifacts, JobContext, JobOutput, ProviderInfo, TranscodeProvider,
};
use crate::models::{ContainerFormat, TranscodeProgress, TranscodeStage};
use crate::{Error, Result};

pub struct SyntheticProvider {
    id: String,
    priority: i32,
    /// Delay between progress steps; keep small in tests
    step_delay: Duration,
    /// Fail after the encode phase with this message instead of producing
    /// output
    fail_with: Option<String>,
}

impl SyntheticProvider {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            priority: 10,
            step_delay: Duration::from_millis(5),
            fail_with: None,
        }
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub const fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    #[must_use]
    pub fn failing_with(mut self, message: impl Into<String>) -> Self {
        self.fail_with = Some(message.into());
        self
    }

    async fn step(&self, ctx: &JobContext, percent: f32, stage: TranscodeStage) -> Result<()> {
        tokio::select! {
            () = ctx.cancel.cancelled() => {
                Err(Error::Internal("job cancelled".to_string()))
            }
            () = tokio::time::sleep(self.step_delay) => {
                ctx.progress.report(TranscodeProgress::at(percent, stage));
                Ok(())
            }
        }
    }
}

#[async_trait]
impl TranscodeProvider for SyntheticProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: self.id.clone(),
            name: "Synthetic".to_string(),
            priority: self.priority,
            supported_formats: vec![
                ContainerFormat::Mp4,
                ContainerFormat::Dash,
                ContainerFormat::Hls,
                ContainerFormat::Webm,
                ContainerFormat::Mkv,
            ],
            accelerators: Vec::new(),
        }
    }

    async fn run(&self, ctx: &JobContext) -> Result<JobOutput> {
        debug!(session = %ctx.session_id, "synthetic job starting");

        for percent in [10.0, 30.0, 50.0, 70.0] {
            self.step(ctx, percent, TranscodeStage::Encoding).await?;
        }

        if let Some(message) = &self.fail_with {
            return Err(Error::EncoderFailed {
                exit_code: 1,
                stderr_tail: message.clone(),
            });
        }

        self.step(ctx, 85.0, TranscodeStage::Packaging).await?;

        let packaged = ctx.workspace.join("packaged");
        tokio::fs::create_dir_all(&packaged).await?;

        // Deterministic payload derived from the output-affecting fields,
        // so fingerprint-equal runs produce identical bytes
        let payload = format!(
            "synthetic artifact\ninput={}\ncontainer={}\ncodec={}\nquality={}\n",
            ctx.request.input_path.display(),
            ctx.request.container,
            ctx.request.video_codec,
            ctx.request.quality,
        );

        let primary = ctx.request.container.primary_artifact();
        tokio::fs::write(packaged.join(primary), payload.as_bytes()).await?;
        if ctx.request.container.is_adaptive() {
            let video = packaged.join("video").join("0");
            tokio::fs::create_dir_all(&video).await?;
            tokio::fs::write(video.join("001.m4s"), b"synthetic segment").await?;
        }

        self.step(ctx, 95.0, TranscodeStage::Packaging).await?;

        let (artifacts, total_bytes) = collect_artifacts(&packaged).await?;
        Ok(JobOutput {
            output_dir: packaged,
            artifacts,
            primary_artifact: primary.to_string(),
            total_bytes,
        })
    }
}
