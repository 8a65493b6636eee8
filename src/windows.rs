//! Adaptive query-window partitioning.
//!
//! The remote search truncates result lists beyond a count threshold and
//! offers no cursor across an arbitrary span — only pagination inside one
//! filter is reliable. Discovery therefore splits the requested span into
//! contiguous sub-windows, recursively narrowing any window whose match
//! count exceeds the threshold until it fits or hits the one-day floor.
//!
//! Every candidate window is resolved with its own count query before any
//! pagination starts; pagination parameters depend on the resolved window.

use chrono::Duration;

use crate::client::{FetchError, QuerySource};
use crate::models::TimeWindow;

/// A window whose match count has been resolved against the remote source.
///
/// Resolved windows are contiguous and cover the requested span exactly,
/// including zero-count windows (which pagination skips).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedWindow {
    pub window: TimeWindow,
    /// Point-in-time match count reported by the remote source.
    pub match_count: u64,
    /// The window reached the narrowing floor with a count still above the
    /// threshold. Records beyond the result cap may be missed; accepted as
    /// a data-loss risk, not fatal.
    pub capped: bool,
}

/// Narrowing parameters, taken from `[query]` configuration.
#[derive(Debug, Clone, Copy)]
pub struct PartitionOptions {
    pub threshold: u64,
    pub initial_window_days: i64,
    pub min_window_days: i64,
}

/// Render the filter expression for one project/window pair.
pub fn render_filter(template: &str, project: &str, window: &TimeWindow) -> String {
    template
        .replace("{project}", project)
        .replace("{start}", &window.start.format("%Y-%m-%d").to_string())
        .replace("{end}", &window.end.format("%Y-%m-%d").to_string())
}

/// Partition `span` into contiguous windows whose match counts fit under
/// `opts.threshold`.
///
/// Starts each candidate at the current cursor with the configured initial
/// width, halving the width (start fixed) while the count query reports
/// more than the threshold. A candidate at the floor is accepted as-is and
/// flagged [`ResolvedWindow::capped`] with a warning.
pub async fn partition(
    source: &dyn QuerySource,
    template: &str,
    project: &str,
    span: TimeWindow,
    opts: &PartitionOptions,
) -> Result<Vec<ResolvedWindow>, FetchError> {
    let mut windows = Vec::new();
    let mut cursor = span.start;

    while cursor < span.end {
        let mut end = (cursor + Duration::days(opts.initial_window_days)).min(span.end);

        loop {
            let candidate = TimeWindow { start: cursor, end };
            let filter = render_filter(template, project, &candidate);
            let count = source.query(&filter, 0).await?.match_count;

            if count <= opts.threshold {
                windows.push(ResolvedWindow {
                    window: candidate,
                    match_count: count,
                    capped: false,
                });
                break;
            }

            let width = candidate.width_days();
            if width <= opts.min_window_days {
                eprintln!(
                    "Warning: window {}..{} for {} still reports {} matches at the {}-day floor; records beyond the result cap may be missed",
                    candidate.start, candidate.end, project, count, opts.min_window_days
                );
                windows.push(ResolvedWindow {
                    window: candidate,
                    match_count: count,
                    capped: true,
                });
                break;
            }

            // Halve the candidate width, keeping the start fixed.
            end = cursor + Duration::days((width / 2).max(opts.min_window_days));
        }

        cursor = end;
    }

    Ok(windows)
}
