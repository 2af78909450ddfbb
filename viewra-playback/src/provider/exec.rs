//! Shared encoder execution loop
//!
//! Spawns one supervised encoder invocation, pumps its progress stream
//! into the job's sink mapped onto a session progress range, and honors
//! cancellation with graceful-then-forced termination.

use std::process::ExitStatus;
use std::time::Instant;

use super::traits::JobContext;
use crate::models::{TranscodeProgress, TranscodeStage};
use crate::supervisor::{EncoderProgress, ProcessSpec};
use crate::{Error, Result};

/// Run an encoder to completion. Returns the exit status and the stderr
/// tail for failure reports.
pub(super) async fn run_encoder(
    ctx: &JobContext,
    program: &str,
    args: Vec<String>,
    floor: f32,
    ceiling: f32,
    stage: TranscodeStage,
) -> Result<(ExitStatus, String)> {
    let mut spec = ProcessSpec::new(program, args);
    spec.workdir = Some(ctx.workspace.clone());
    spec.session_id = Some(ctx.session_id);
    spec.quit_sequence = Some(b"q");
    spec.parse_progress = true;

    let mut process = ctx.supervisor.spawn(&spec)?;
    let mut reports = process.progress_watch();
    let started = Instant::now();
    let duration = ctx.request.duration_seconds.filter(|d| *d > 0.0);
    let mut saw_report = false;
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(2));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let status = loop {
        tokio::select! {
            () = ctx.cancel.cancelled() => {
                ctx.supervisor.stop(&mut process).await?;
                return Err(Error::Internal("job cancelled".to_string()));
            }
            changed = reports.changed() => {
                if changed.is_err() {
                    // Output drained; the process is exiting
                    break process.reap().await?;
                }
                let report = *reports.borrow_and_update();
                if let Some(report) = report {
                    saw_report = true;
                    let within = duration.map_or(0.0, |d| report.percent_of(d));
                    ctx.progress.report(TranscodeProgress {
                        percent: map_range(within, floor, ceiling),
                        elapsed_seconds: started.elapsed().as_secs_f64(),
                        remaining_seconds: remaining_estimate(&report, duration),
                        throughput_fps: report.fps,
                        stage,
                    });
                }
            }
            _ = ticker.tick() => {
                // Linear elapsed/duration estimate until (or unless) the
                // encoder's progress stream produces reports
                if !saw_report {
                    if let Some(d) = duration {
                        let within = ((started.elapsed().as_secs_f64() / d) * 100.0)
                            .clamp(0.0, 95.0) as f32;
                        ctx.progress.report(TranscodeProgress {
                            percent: map_range(within, floor, ceiling),
                            elapsed_seconds: started.elapsed().as_secs_f64(),
                            remaining_seconds: None,
                            throughput_fps: None,
                            stage,
                        });
                    }
                }
            }
        }
    };
    Ok((status, process.stderr_tail()))
}

fn remaining_estimate(report: &EncoderProgress, duration: Option<f64>) -> Option<f64> {
    let duration = duration?;
    let speed = f64::from(report.speed?);
    if speed <= 0.0 {
        return None;
    }
    Some(((duration - report.out_time_seconds) / speed).max(0.0))
}

/// Map a 0-100 stage-local percentage onto a session progress range
pub(super) fn map_range(within: f32, floor: f32, ceiling: f32) -> f32 {
    floor + (within / 100.0) * (ceiling - floor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_range() {
        assert_eq!(map_range(0.0, 0.0, 70.0), 0.0);
        assert_eq!(map_range(100.0, 0.0, 70.0), 70.0);
        assert_eq!(map_range(50.0, 70.0, 100.0), 85.0);
    }

    #[test]
    fn test_remaining_estimate_uses_speed() {
        let report = EncoderProgress {
            out_time_seconds: 30.0,
            speed: Some(2.0),
            ..EncoderProgress::default()
        };
        let remaining = remaining_estimate(&report, Some(90.0)).expect("estimate");
        assert!((remaining - 30.0).abs() < 1e-9);

        assert!(remaining_estimate(&report, None).is_none());
    }
}
