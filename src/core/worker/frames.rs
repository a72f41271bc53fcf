//! Incremental parsing of sentinel-delimited output frames from a worker's
//! stdout. Anything outside the markers is diagnostic noise; malformed JSON
//! between markers is skipped; the last valid frame wins.

use tracing::debug;

use crate::core::store::AgentOutput;

pub const OUTPUT_START: &str = "---CORECLAW_OUTPUT_START---";
pub const OUTPUT_END: &str = "---CORECLAW_OUTPUT_END---";

/// Cap on a single buffered frame. Overflowing frames are discarded whole;
/// parsing continues with the next frame.
const MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

#[derive(Default)]
pub struct FrameParser {
    in_frame: bool,
    overflowed: bool,
    buffer: String,
    last_valid: Option<AgentOutput>,
    valid_frames: usize,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one stdout line (without trailing newline). Returns the decoded
    /// frame when this line closed a valid one.
    pub fn feed_line(&mut self, line: &str) -> Option<AgentOutput> {
        let trimmed = line.trim_end_matches('\r');
        if trimmed == OUTPUT_START {
            // A start inside a frame abandons the partial frame.
            self.in_frame = true;
            self.overflowed = false;
            self.buffer.clear();
            return None;
        }
        if trimmed == OUTPUT_END {
            if !self.in_frame {
                return None;
            }
            self.in_frame = false;
            let raw = std::mem::take(&mut self.buffer);
            if self.overflowed {
                debug!("Skipping oversized output frame");
                self.overflowed = false;
                return None;
            }
            match serde_json::from_str::<AgentOutput>(&raw) {
                Ok(output) if !output.summary.is_empty() => {
                    self.valid_frames += 1;
                    self.last_valid = Some(output.clone());
                    Some(output)
                }
                Ok(_) => {
                    debug!("Skipping frame with empty summary");
                    None
                }
                Err(e) => {
                    debug!("Skipping malformed output frame: {}", e);
                    None
                }
            }
        } else {
            if self.in_frame {
                if self.buffer.len() + trimmed.len() > MAX_FRAME_BYTES {
                    self.overflowed = true;
                    self.buffer.clear();
                } else if !self.overflowed {
                    self.buffer.push_str(trimmed);
                    self.buffer.push('\n');
                }
            }
            None
        }
    }

    /// The canonical result so far: the most recent valid frame.
    pub fn last_valid(&self) -> Option<&AgentOutput> {
        self.last_valid.as_ref()
    }

    pub fn into_last_valid(self) -> Option<AgentOutput> {
        self.last_valid
    }

    pub fn valid_frames(&self) -> usize {
        self.valid_frames
    }
}

/// Convenience for tests and offline diagnostics: parse a full captured
/// stdout buffer in one pass.
pub fn parse_stdout(stdout: &str) -> Option<AgentOutput> {
    let mut parser = FrameParser::new();
    for line in stdout.lines() {
        parser.feed_line(line);
    }
    parser.into_last_valid()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::OutputStatus;

    fn frame(json: &str) -> String {
        format!("{}\n{}\n{}\n", OUTPUT_START, json, OUTPUT_END)
    }

    const OK_FRAME: &str = r#"{"status":"completed","priority":"normal","summary":"ok","needsReview":false,"outputs":[],"metadata":{}}"#;

    #[test]
    fn parses_single_frame_with_surrounding_noise() {
        let stdout = format!("debug\n{}", frame(OK_FRAME));
        let output = parse_stdout(&stdout).expect("frame should parse");
        assert_eq!(output.status, OutputStatus::Completed);
        assert_eq!(output.summary, "ok");
    }

    #[test]
    fn last_valid_frame_wins() {
        let second = r#"{"status":"completed","priority":"high","summary":"second","needsReview":true,"outputs":[],"metadata":{}}"#;
        let stdout = format!("{}{}", frame(OK_FRAME), frame(second));
        let output = parse_stdout(&stdout).unwrap();
        assert_eq!(output.summary, "second");
        assert!(output.needs_review);
    }

    #[test]
    fn invalid_second_frame_keeps_first() {
        let stdout = format!("{}{}", frame(OK_FRAME), frame("{not json"));
        let output = parse_stdout(&stdout).unwrap();
        assert_eq!(output.summary, "ok");
    }

    #[test]
    fn frame_with_wrong_shape_is_skipped() {
        let stdout = frame(r#"{"status":"completed"}"#);
        assert!(parse_stdout(&stdout).is_none());
    }

    #[test]
    fn end_without_start_is_ignored() {
        let stdout = format!("{}\n{}", OUTPUT_END, frame(OK_FRAME));
        assert!(parse_stdout(&stdout).is_some());
    }

    #[test]
    fn restart_marker_abandons_partial_frame() {
        let stdout = format!(
            "{}\n{{\"partial\":\n{}\n{}\n{}\n",
            OUTPUT_START, OUTPUT_START, OK_FRAME, OUTPUT_END
        );
        let output = parse_stdout(&stdout).unwrap();
        assert_eq!(output.summary, "ok");
    }

    #[test]
    fn multiline_json_inside_frame() {
        let json = "{\n  \"status\": \"partial\",\n  \"priority\": \"low\",\n  \"summary\": \"multi line\",\n  \"needsReview\": false,\n  \"outputs\": [],\n  \"metadata\": {}\n}";
        let output = parse_stdout(&frame(json)).unwrap();
        assert_eq!(output.status, OutputStatus::Partial);
        assert_eq!(output.summary, "multi line");
    }
}
