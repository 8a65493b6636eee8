//! Record discovery orchestration.
//!
//! Coordinates one project's full discovery flow: window partitioning →
//! per-window pagination → dedup/order → table write. Projects are
//! independent: a failure in one is logged and the run continues, except a
//! fatal session error, which cancels every not-yet-started project
//! sharing the session.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::client::{FetchError, QuerySource};
use crate::config::Config;
use crate::models::{RecordSummary, TimeWindow};
use crate::pager;
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::windows::{self, PartitionOptions};

/// What one project's discovery produced.
#[derive(Debug)]
pub struct DiscoveryOutcome {
    pub windows: usize,
    pub capped_windows: usize,
    pub records: usize,
    pub output: PathBuf,
}

/// Discover every requested project over `span` and write one table each.
pub async fn run_discover(
    config: &Config,
    source: &dyn QuerySource,
    projects: &[String],
    span: TimeWindow,
    progress: &dyn ProgressReporter,
) -> Result<()> {
    std::fs::create_dir_all(&config.output.dir).with_context(|| {
        format!(
            "Failed to create output directory: {}",
            config.output.dir.display()
        )
    })?;

    let mut failed = 0usize;
    for project in projects {
        match discover_project(config, source, project, span, progress).await {
            Ok(outcome) => {
                println!("discover {}", project);
                println!(
                    "  windows: {} ({} capped)",
                    outcome.windows, outcome.capped_windows
                );
                println!("  records: {}", outcome.records);
                println!("  output: {}", outcome.output.display());
            }
            Err(e) => {
                // A dead session fails every later project identically.
                if e.downcast_ref::<FetchError>()
                    .is_some_and(FetchError::is_fatal_session)
                {
                    return Err(e.context(format!("discovery aborted at project {}", project)));
                }
                eprintln!("Warning: discovery failed for {}: {:#}", project, e);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("discovery failed for {} of {} projects", failed, projects.len());
    }
    println!("ok");
    Ok(())
}

/// Discover one project: resolve windows, page each, dedup, order, write.
pub async fn discover_project(
    config: &Config,
    source: &dyn QuerySource,
    project: &str,
    span: TimeWindow,
    progress: &dyn ProgressReporter,
) -> Result<DiscoveryOutcome> {
    if project.trim().is_empty() {
        anyhow::bail!("project key must not be empty");
    }

    progress.report(ProgressEvent::Resolving {
        project: project.to_string(),
    });

    let opts = PartitionOptions {
        threshold: config.query.threshold,
        initial_window_days: config.query.initial_window_days,
        min_window_days: config.query.min_window_days,
    };
    let resolved = windows::partition(
        source,
        &config.query.filter_template,
        project,
        span,
        &opts,
    )
    .await?;

    let mut records: Vec<RecordSummary> = Vec::new();
    for w in &resolved {
        if w.match_count == 0 {
            continue;
        }
        let filter = windows::render_filter(&config.query.filter_template, project, &w.window);
        let batch = pager::collect_window(source, &filter, config.query.page_size).await?;
        records.extend(batch);
        progress.report(ProgressEvent::Collecting {
            project: project.to_string(),
            records: records.len() as u64,
        });
    }

    let records = order_records(records);
    let output = config.output.dir.join(format!("{}.csv", project));
    write_table(&output, &records)?;

    Ok(DiscoveryOutcome {
        windows: resolved.len(),
        capped_windows: resolved.iter().filter(|w| w.capped).count(),
        records: records.len(),
        output,
    })
}

/// Dedup by key (first occurrence wins) and order by ordinal ascending.
///
/// Windows are visited in span order but rows arrive newest-first within
/// each window; the ordinal sort makes the table creation-ordered and
/// deterministic regardless of arrival order.
pub fn order_records(records: Vec<RecordSummary>) -> Vec<RecordSummary> {
    let mut seen = HashSet::new();
    let mut out: Vec<RecordSummary> = records
        .into_iter()
        .filter(|r| seen.insert(r.key.clone()))
        .collect();
    out.sort_by_key(|r| r.ordinal);
    out
}

/// Write the full table, replacing any previous run's output.
fn write_table(path: &Path, records: &[RecordSummary]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to open table for writing: {}", path.display()))?;
    writer.write_record(["ordinal", "key", "title", "url"])?;
    for r in records {
        writer.write_record([
            r.ordinal.to_string().as_str(),
            r.key.as_str(),
            r.title.as_str(),
            r.url.as_str(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(ordinal: i64, key: &str) -> RecordSummary {
        RecordSummary {
            ordinal,
            key: key.to_string(),
            title: format!("t{}", ordinal),
            url: format!("https://t/browse/{}", key),
        }
    }

    #[test]
    fn orders_by_ordinal_regardless_of_arrival() {
        let out = order_records(vec![rec(30, "P-30"), rec(10, "P-10"), rec(20, "P-20")]);
        assert_eq!(out.iter().map(|r| r.ordinal).collect::<Vec<_>>(), vec![10, 20, 30]);
    }

    #[test]
    fn dedups_by_key_keeping_first() {
        let mut dup = rec(11, "P-10");
        dup.title = "seen again".to_string();
        let out = order_records(vec![rec(10, "P-10"), dup, rec(20, "P-20")]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].ordinal, 10);
        assert_eq!(out[0].title, "t10");
    }

    #[test]
    fn table_rewrite_replaces_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("OPS.csv");

        write_table(&path, &[rec(1, "OPS-1"), rec(2, "OPS-2")]).unwrap();
        write_table(&path, &[rec(3, "OPS-3")]).unwrap();

        let body = std::fs::read_to_string(&path).unwrap();
        assert_eq!(body, "ordinal,key,title,url\n3,OPS-3,t3,https://t/browse/OPS-3\n");
    }
}
