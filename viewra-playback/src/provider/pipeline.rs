//! Software pipeline provider
//!
//! Adaptive output runs two stages: per-variant encodes into
//! `{workspace}/encoded/` (0-70% of session progress), then a packager
//! pass into `{workspace}/packaged/` (70-100%). Progressive output is a
//! single encoder invocation producing `output.{ext}`.

use async_trait::async_trait;
use tracing::{debug, info};

use super::command::{self, VariantSpec};
use super::exec;
use super::traits::{
    collect_artifacts, JobContext, JobOutput, ProviderInfo, TranscodeProvider,
};
use crate::config::EncoderConfig;
use crate::models::{ContainerFormat, TranscodeProgress, TranscodeStage};
use crate::supervisor::ProcessSpec;
use crate::{Error, Result};

/// Share of session progress spent encoding; the rest is packaging
const ENCODE_PROGRESS_CEILING: f32 = 70.0;

pub struct PipelineProvider {
    id: String,
    priority: i32,
    ffmpeg_path: String,
    packager_path: String,
    segment_duration: u32,
}

impl PipelineProvider {
    #[must_use]
    pub fn new(encoder: &EncoderConfig) -> Self {
        Self {
            id: "software".to_string(),
            priority: 50,
            ffmpeg_path: encoder.ffmpeg_path.clone(),
            packager_path: encoder.packager_path.clone(),
            segment_duration: encoder.segment_duration_seconds,
        }
    }

    async fn run_progressive(&self, ctx: &JobContext) -> Result<JobOutput> {
        let packaged = ctx.workspace.join("packaged");
        tokio::fs::create_dir_all(&packaged).await?;

        let output = format!("packaged/{}", ctx.request.container.primary_artifact());
        let args = command::progressive_args(
            &ctx.request,
            &ctx.request.input_path.to_string_lossy(),
            &output,
            self.segment_duration,
            None,
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

        finish_output(&packaged, ctx.request.container).await
    }

    async fn run_adaptive(&self, ctx: &JobContext) -> Result<JobOutput> {
        let encoded = ctx.workspace.join("encoded");
        tokio::fs::create_dir_all(&encoded).await?;

        // Stage 1: one encoder pass per ladder variant
        let ladder = command::variant_ladder(&ctx.request);
        let per_variant = ENCODE_PROGRESS_CEILING / ladder.len() as f32;
        for (index, variant) in ladder.iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                return Err(Error::Internal("job cancelled".to_string()));
            }
            debug!(
                session = %ctx.session_id,
                variant = %variant.name,
                "encoding ladder variant"
            );
            let output = format!("encoded/{}", variant.encoded_filename());
            let args = command::encode_variant_args(
                &ctx.request,
                variant,
                &ctx.request.input_path.to_string_lossy(),
                &output,
                self.segment_duration,
            )?;

            let floor = per_variant * index as f32;
            let (status, stderr_tail) = exec::run_encoder(
                ctx,
                &self.ffmpeg_path,
                args,
                floor,
                floor + per_variant,
                TranscodeStage::Encoding,
            )
            .await?;
            if !status.success() {
                return Err(Error::EncoderFailed {
                    exit_code: status.code().unwrap_or(-1),
                    stderr_tail,
                });
            }
        }

        // Stage 2: package the intermediates into segments + manifest
        self.run_packager(ctx, &ladder).await?;

        let packaged = ctx.workspace.join("packaged");
        finish_output(&packaged, ctx.request.container).await
    }

    async fn run_packager(&self, ctx: &JobContext, ladder: &[VariantSpec]) -> Result<()> {
        let packaged = ctx.workspace.join("packaged");
        for index in 0..ladder.len() {
            tokio::fs::create_dir_all(packaged.join("video").join(index.to_string())).await?;
        }
        tokio::fs::create_dir_all(packaged.join("audio")).await?;

        ctx.progress.report(TranscodeProgress::at(
            ENCODE_PROGRESS_CEILING,
            TranscodeStage::Packaging,
        ));

        let args = command::package_args(ctx.request.container, ladder, self.segment_duration)?;
        let mut spec = ProcessSpec::new(&self.packager_path, args);
        spec.workdir = Some(ctx.workspace.clone());
        spec.session_id = Some(ctx.session_id);

        let mut process = ctx.supervisor.spawn(&spec)?;
        let status = tokio::select! {
            () = ctx.cancel.cancelled() => {
                ctx.supervisor.stop(&mut process).await?;
                return Err(Error::Internal("job cancelled".to_string()));
            }
            status = process.reap() => status?,
        };
        if !status.success() {
            return Err(Error::PackagerFailed {
                exit_code: status.code().unwrap_or(-1),
                stderr_tail: process.stderr_tail(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl TranscodeProvider for PipelineProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: self.id.clone(),
            name: "Software pipeline".to_string(),
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
        info!(
            session = %ctx.session_id,
            container = %ctx.request.container,
            abr = ctx.request.enable_abr,
            "pipeline job starting"
        );
        if ctx.request.container.is_adaptive() {
            self.run_adaptive(ctx).await
        } else {
            self.run_progressive(ctx).await
        }
    }
}

async fn finish_output(packaged: &std::path::Path, container: ContainerFormat) -> Result<JobOutput> {
    let dir = packaged.to_path_buf();
    let (artifacts, total_bytes) = collect_artifacts(&dir).await?;
    if artifacts.is_empty() {
        return Err(Error::Internal("pipeline produced no artifacts".to_string()));
    }
    Ok(JobOutput {
        output_dir: dir,
        artifacts,
        primary_artifact: container.primary_artifact().to_string(),
        total_bytes,
    })
}
