//! Time-window hints from ambient context files.
//!
//! When the agent runtime loads date-scoped memory files
//! (`memory/2024-06-01.md`) into its context, searches should prefer that
//! period. This module turns the loaded paths into an
//! `[updated_after, updated_before]` window the retriever applies as a
//! plain filter.

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};

/// An optional half-open-or-closed time window over chunk update times.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecencyWindow {
    pub updated_after: Option<DateTime<Utc>>,
    pub updated_before: Option<DateTime<Utc>>,
}

impl RecencyWindow {
    pub fn is_empty(&self) -> bool {
        self.updated_after.is_none() && self.updated_before.is_none()
    }
}

/// Extract a window from the ambient context file paths.
///
/// Every `memory/YYYY-MM-DD.md` path contributes its UTC day; multiple
/// matches widen to the enclosing union. With no date-scoped files but a
/// `MEMORY.md` present, the window defaults to the trailing 30 days.
pub fn window_from_context_paths(paths: &[String], now: DateTime<Utc>) -> RecencyWindow {
    let mut window = RecencyWindow::default();
    let mut saw_memory_md = false;

    for path in paths {
        let normalized = path.replace('\\', "/");
        let file_name = normalized.rsplit('/').next().unwrap_or(&normalized);

        if file_name.eq_ignore_ascii_case("MEMORY.md") {
            saw_memory_md = true;
            continue;
        }

        let Some(date) = date_scoped_file(&normalized, file_name) else {
            continue;
        };
        let start = Utc
            .with_ymd_and_hms(date.year(), date.month(), date.day(), 0, 0, 0)
            .single();
        let end = Utc
            .with_ymd_and_hms(date.year(), date.month(), date.day(), 23, 59, 59)
            .single();
        let (Some(start), Some(end)) = (start, end) else {
            continue;
        };

        window.updated_after = Some(match window.updated_after {
            Some(existing) => existing.min(start),
            None => start,
        });
        window.updated_before = Some(match window.updated_before {
            Some(existing) => existing.max(end),
            None => end,
        });
    }

    if window.is_empty() && saw_memory_md {
        window.updated_after = Some(now - chrono::Duration::days(30));
    }

    window
}

/// `memory/YYYY-MM-DD.md` (possibly nested under a longer prefix).
fn date_scoped_file(path: &str, file_name: &str) -> Option<NaiveDate> {
    let parent_is_memory = path
        .rsplit('/')
        .nth(1)
        .map(|dir| dir == "memory")
        .unwrap_or(false);
    if !parent_is_memory {
        return None;
    }
    let stem = file_name.strip_suffix(".md")?;
    NaiveDate::parse_from_str(stem, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn single_dated_file_spans_its_day() {
        let window =
            window_from_context_paths(&["memory/2024-06-01.md".to_string()], now());
        assert_eq!(
            window.updated_after,
            Some(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(
            window.updated_before,
            Some(Utc.with_ymd_and_hms(2024, 6, 1, 23, 59, 59).unwrap())
        );
    }

    #[test]
    fn multiple_dates_union_to_enclosing_range() {
        let window = window_from_context_paths(
            &[
                "memory/2024-06-10.md".to_string(),
                "memory/2024-06-01.md".to_string(),
                "memory/2024-06-05.md".to_string(),
            ],
            now(),
        );
        assert_eq!(
            window.updated_after,
            Some(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(
            window.updated_before,
            Some(Utc.with_ymd_and_hms(2024, 6, 10, 23, 59, 59).unwrap())
        );
    }

    #[test]
    fn memory_md_alone_defaults_to_trailing_30_days() {
        let window = window_from_context_paths(&["MEMORY.md".to_string()], now());
        assert_eq!(window.updated_after, Some(now() - chrono::Duration::days(30)));
        assert_eq!(window.updated_before, None);
    }

    #[test]
    fn dated_files_beat_memory_md_default() {
        let window = window_from_context_paths(
            &["MEMORY.md".to_string(), "memory/2024-06-01.md".to_string()],
            now(),
        );
        assert_eq!(
            window.updated_before,
            Some(Utc.with_ymd_and_hms(2024, 6, 1, 23, 59, 59).unwrap())
        );
    }

    #[test]
    fn unrelated_paths_yield_empty_window() {
        let window = window_from_context_paths(
            &[
                "notes/2024-06-01.md".to_string(),
                "memory/not-a-date.md".to_string(),
                "memory/2024-06-01.txt".to_string(),
            ],
            now(),
        );
        assert!(window.is_empty());
    }

    #[test]
    fn nested_workspace_prefix_accepted() {
        let window = window_from_context_paths(
            &["/home/agent/workspace/memory/2024-06-01.md".to_string()],
            now(),
        );
        assert!(!window.is_empty());
    }
}
