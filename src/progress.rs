//! Sync progress reporting.
//!
//! Reports observable progress during a sync so callers see what is being
//! indexed and how much is left. Progress is emitted on **stderr** so
//! stdout remains parseable for scripts; library embedders can supply
//! their own reporter instead.

use std::io::Write;

/// Reports sync progress. Implementations write to stderr (human or JSON)
/// or forward updates to a host process.
pub trait SyncProgressReporter: Send + Sync {
    /// `completed` of `total` work items done; `label` names the current one.
    fn report(&self, completed: u64, total: u64, label: &str);
}

/// Human-friendly progress: `sync  12 / 48  memory/2024-06-01.md`.
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, completed: u64, total: u64, label: &str) {
        let line = format!(
            "sync  {} / {}  {}\n",
            format_number(completed),
            format_number(total),
            label
        );
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl SyncProgressReporter for JsonProgress {
    fn report(&self, completed: u64, total: u64, label: &str) {
        let obj = serde_json::json!({
            "event": "progress",
            "completed": completed,
            "total": total,
            "label": label,
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _completed: u64, _total: u64, _label: &str) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
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

    pub fn reporter(&self) -> Box<dyn SyncProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1234), "1,234");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }
}
