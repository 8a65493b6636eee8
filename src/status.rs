//! Environment health overview.
//!
//! A quick summary of what the configuration points at: tracker address,
//! session state age, and what the archive already holds. Used by
//! `trawl status` to verify a setup before running a long discovery.

use anyhow::Result;
use walkdir::WalkDir;

use crate::config::Config;
use crate::session;

pub fn run_status(config: &Config) -> Result<()> {
    println!("issuetrawl — status");
    println!("===================");
    println!();
    println!("  tracker:     {}", config.tracker.base_url);

    let output_note = if config.output.dir.is_dir() {
        "OK"
    } else {
        "missing (created on first discover)"
    };
    println!(
        "  output:      {} — {}",
        config.output.dir.display(),
        output_note
    );

    let session_note = match session::state_saved_at(&config.session.state_path) {
        Some(ts) => format!("captured {}", format_ts_relative(ts)),
        None => "not captured — run `trawl login`".to_string(),
    };
    println!(
        "  session:     {} — {}",
        config.session.state_path.display(),
        session_note
    );

    if config.output.dir.is_dir() {
        let (tables, manifests) = archive_counts(config);
        println!();
        println!("  tables:      {}", tables);
        println!("  manifests:   {}", manifests);
    }

    println!();
    Ok(())
}

fn archive_counts(config: &Config) -> (usize, usize) {
    let mut tables = 0;
    let mut manifests = 0;
    for entry in WalkDir::new(&config.output.dir).into_iter().flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        match entry.path().extension().and_then(|e| e.to_str()) {
            Some("csv") => tables += 1,
            Some("xml") => manifests += 1,
            _ => {}
        }
    }
    (tables, manifests)
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
