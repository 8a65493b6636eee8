//! # issuetrawl CLI (`trawl`)
//!
//! The `trawl` binary drives the discovery and sync pipelines against a
//! configured tracker instance.
//!
//! ## Usage
//!
//! ```bash
//! trawl --config ./config/trawl.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `trawl login` | Capture an authenticated session interactively |
//! | `trawl discover --project OPS` | Discover records and write one table per project |
//! | `trawl export archive/*.csv` | Fetch manifest documents for discovered records |
//! | `trawl sync 'archive/OPS/*.xml'` | Synchronize attachments listed in manifests |
//! | `trawl status` | Show configuration, session, and archive health |
//!
//! ## Examples
//!
//! ```bash
//! # One-time session capture
//! trawl login
//!
//! # Two years of records for two projects
//! trawl discover --project OPS --project INFRA
//!
//! # Narrow span
//! trawl discover --project OPS --start-date 2023-01-01 --end-date 2023-07-01
//!
//! # Manifests, then attachments (idempotent; re-run to resume)
//! trawl export archive/OPS.csv
//! trawl sync archive/OPS --dry-run
//! trawl sync archive/OPS
//! ```

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use issuetrawl::client::{OfflineByteSource, TrackerClient};
use issuetrawl::config;
use issuetrawl::discover;
use issuetrawl::export;
use issuetrawl::models::{SyncMode, TimeWindow};
use issuetrawl::progress::ProgressMode;
use issuetrawl::session::{CachedSession, InteractiveSession, SessionProvider};
use issuetrawl::status;
use issuetrawl::sync;

/// issuetrawl — windowed issue discovery and attachment sync for
/// result-capped trackers.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/trawl.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "trawl",
    about = "Windowed issue discovery and attachment sync for result-capped trackers",
    version,
    long_about = "issuetrawl extracts a catalog of records from a tracker whose search caps \
    results per query, by adaptively partitioning a date span into windows that fit under the \
    cap, then incrementally mirrors the attachments referenced by each record's manifest into \
    a local archive using timestamp fidelity to skip unchanged files."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/trawl.toml")]
    config: PathBuf,

    /// Progress output on stderr: auto, off, human, or json.
    #[arg(long, global = true, default_value = "auto")]
    progress: String,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Capture an authenticated session interactively.
    ///
    /// Prompts for the `Cookie` header of a logged-in browser session and
    /// persists it to the configured state file. All other commands replay
    /// the captured session.
    Login,

    /// Discover records per project and write one table each.
    ///
    /// Partitions the date span into windows whose match counts fit under
    /// the configured threshold, paginates each window, and writes a
    /// creation-ordered CSV table per project. The table is fully
    /// rewritten on every run.
    Discover {
        /// Project key to discover. Repeat the flag for multiple projects.
        #[arg(long = "project", required = true)]
        projects: Vec<String>,

        /// Start of the date span, YYYY-MM-DD (default: two years before the end).
        #[arg(long)]
        start_date: Option<String>,

        /// End of the date span, exclusive, YYYY-MM-DD (default: today).
        #[arg(long)]
        end_date: Option<String>,
    },

    /// Fetch manifest documents for previously discovered records.
    ///
    /// Reads record keys from discovery tables and stores each record's
    /// XML manifest under `<output>/<PROJECT>/<KEY>.xml`. Records whose
    /// manifest cannot be fetched are skipped with a warning.
    Export {
        /// Discovery tables (CSV) to export manifests for.
        #[arg(required = true)]
        tables: Vec<PathBuf>,
    },

    /// Synchronize attachments referenced by manifest documents.
    ///
    /// Accepts manifest files, directories (walked for `*.xml`), or glob
    /// patterns. Files whose mtime already matches the manifest creation
    /// time are skipped, making re-runs cheap and resumable.
    Sync {
        /// Manifest files, directories, or glob patterns.
        #[arg(required = true)]
        patterns: Vec<String>,

        /// Report intended actions and sizes without downloading.
        #[arg(long)]
        dry_run: bool,

        /// Download every attachment regardless of existing timestamps.
        #[arg(long, conflicts_with = "dry_run")]
        force: bool,
    },

    /// Show configuration, session, and archive health.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    let reporter = ProgressMode::from_flag(&cli.progress)?.reporter();

    match cli.command {
        Commands::Login => {
            InteractiveSession::new(&cfg.session.state_path)
                .resolve()
                .await?;
        }
        Commands::Discover {
            projects,
            start_date,
            end_date,
        } => {
            let span = parse_span(start_date.as_deref(), end_date.as_deref())?;
            let session = CachedSession::new(&cfg.session.state_path).resolve().await?;
            let client = TrackerClient::new(&cfg, session)?;
            discover::run_discover(&cfg, &client, &projects, span, reporter.as_ref()).await?;
        }
        Commands::Export { tables } => {
            let session = CachedSession::new(&cfg.session.state_path).resolve().await?;
            let client = TrackerClient::new(&cfg, session)?;
            export::run_export(&cfg, &client, &tables, reporter.as_ref()).await?;
        }
        Commands::Sync {
            patterns,
            dry_run,
            force,
        } => {
            let mode = if dry_run {
                SyncMode::DryRun
            } else if force {
                SyncMode::Force
            } else {
                SyncMode::Normal
            };
            if mode == SyncMode::DryRun {
                // Dry runs have no network effect and need no session.
                sync::run_sync(&cfg, &OfflineByteSource, &patterns, mode, reporter.as_ref())
                    .await?;
            } else {
                let session = CachedSession::new(&cfg.session.state_path).resolve().await?;
                let client = TrackerClient::new(&cfg, session)?;
                sync::run_sync(&cfg, &client, &patterns, mode, reporter.as_ref()).await?;
            }
        }
        Commands::Status => {
            status::run_status(&cfg)?;
        }
    }

    Ok(())
}

/// Resolve the discovery span from the optional CLI dates.
fn parse_span(start: Option<&str>, end: Option<&str>) -> Result<TimeWindow> {
    let end = match end {
        Some(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .with_context(|| format!("Invalid --end-date: {}", s))?,
        None => Utc::now().date_naive(),
    };
    let start = match start {
        Some(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .with_context(|| format!("Invalid --start-date: {}", s))?,
        None => end - Duration::days(365 * 2),
    };
    if start >= end {
        anyhow::bail!("start date {} must be before end date {}", start, end);
    }
    Ok(TimeWindow { start, end })
}
