//! Parser for the encoder's machine-readable progress stream
//!
//! ffmpeg with `-progress pipe:1 -nostats` emits key=value lines and a
//! `progress=continue|end` terminator per report block.

/// One progress report from the encoder
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EncoderProgress {
    /// Output timestamp reached so far, seconds
    pub out_time_seconds: f64,
    pub fps: Option<f32>,
    /// Encode speed relative to realtime (1.0 = realtime)
    pub speed: Option<f32>,
    pub finished: bool,
}

impl EncoderProgress {
    /// Percent of `duration` encoded, clamped to [0, 100]
    #[must_use]
    pub fn percent_of(&self, duration_seconds: f64) -> f32 {
        if self.finished {
            return 100.0;
        }
        if duration_seconds <= 0.0 {
            return 0.0;
        }
        ((self.out_time_seconds / duration_seconds) * 100.0).clamp(0.0, 100.0) as f32
    }
}

/// Incremental line parser; emits a report on each `progress=` terminator
#[derive(Debug, Default)]
pub struct ProgressParser {
    current: EncoderProgress,
}

impl ProgressParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line; returns a completed report when the block ends
    pub fn feed_line(&mut self, line: &str) -> Option<EncoderProgress> {
        let (key, value) = line.trim().split_once('=')?;
        match key {
            "out_time_us" | "out_time_ms" => {
                // Both keys carry microseconds in practice
                if let Ok(us) = value.parse::<i64>() {
                    self.current.out_time_seconds = us.max(0) as f64 / 1_000_000.0;
                }
            }
            "out_time" => {
                if let Some(seconds) = parse_clock(value) {
                    self.current.out_time_seconds = seconds;
                }
            }
            "fps" => {
                self.current.fps = value.parse::<f32>().ok().filter(|f| *f > 0.0);
            }
            "speed" => {
                self.current.speed = value
                    .trim_end_matches('x')
                    .parse::<f32>()
                    .ok()
                    .filter(|s| *s > 0.0);
            }
            "progress" => {
                self.current.finished = value == "end";
                return Some(self.current);
            }
            _ => {}
        }
        None
    }
}

/// Parse `HH:MM:SS.ffffff` into seconds
fn parse_clock(value: &str) -> Option<f64> {
    let mut parts = value.split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_progress_block() {
        let mut parser = ProgressParser::new();
        assert!(parser.feed_line("frame=123").is_none());
        assert!(parser.feed_line("fps=48.20").is_none());
        assert!(parser.feed_line("out_time_us=12500000").is_none());
        assert!(parser.feed_line("speed=1.92x").is_none());

        let report = parser.feed_line("progress=continue").expect("report");
        assert!((report.out_time_seconds - 12.5).abs() < 1e-9);
        assert_eq!(report.fps, Some(48.2));
        assert_eq!(report.speed, Some(1.92));
        assert!(!report.finished);
    }

    #[test]
    fn test_end_block_marks_finished() {
        let mut parser = ProgressParser::new();
        parser.feed_line("out_time_us=60000000");
        let report = parser.feed_line("progress=end").expect("report");
        assert!(report.finished);
        assert_eq!(report.percent_of(120.0), 100.0);
    }

    #[test]
    fn test_out_time_clock_fallback() {
        let mut parser = ProgressParser::new();
        parser.feed_line("out_time=00:01:30.500000");
        let report = parser.feed_line("progress=continue").expect("report");
        assert!((report.out_time_seconds - 90.5).abs() < 1e-9);
    }

    #[test]
    fn test_percent_is_clamped() {
        let report = EncoderProgress {
            out_time_seconds: 150.0,
            ..EncoderProgress::default()
        };
        assert_eq!(report.percent_of(100.0), 100.0);
        assert_eq!(report.percent_of(0.0), 0.0);
    }

    #[test]
    fn test_garbage_lines_ignored() {
        let mut parser = ProgressParser::new();
        assert!(parser.feed_line("").is_none());
        assert!(parser.feed_line("not a key value").is_none());
        assert!(parser.feed_line("fps=fast").is_none());
        let report = parser.feed_line("progress=continue").expect("report");
        assert_eq!(report.fps, None);
    }
}
