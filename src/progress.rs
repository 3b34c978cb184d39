//! Index build progress reporting.
//!
//! Reports observable progress during `threadline index build` so users see
//! how many conversations are done and how many chunks are written.
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;

use threadline_core::index::BuildObserver;

/// Human-friendly progress on stderr: "index build  embedding  120 / 5,000 conversations  (1,234 chunks)".
pub struct StderrProgress;

impl BuildObserver for StderrProgress {
    fn batch_committed(&self, conversations_done: usize, conversations_total: usize, chunks_written: usize) {
        let line = format!(
            "index build  embedding  {} / {} conversations  ({} chunks)\n",
            format_number(conversations_done as u64),
            format_number(conversations_total as u64),
            format_number(chunks_written as u64)
        );
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl BuildObserver for JsonProgress {
    fn batch_committed(&self, conversations_done: usize, conversations_total: usize, chunks_written: usize) {
        let obj = serde_json::json!({
            "event": "progress",
            "phase": "embedding",
            "conversations_done": conversations_done,
            "conversations_total": conversations_total,
            "chunks_written": chunks_written,
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    /// Build an observer for this mode to hand to the indexer.
    pub fn observer(&self) -> Box<dyn BuildObserver> {
        match self {
            ProgressMode::Off => Box::new(()),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }
}
