//! Incremental attachment synchronization.
//!
//! For each manifest, every attachment entry goes through the same
//! decision: reject malformed entries, skip files whose local mtime
//! already matches the manifest creation time, otherwise fetch and stamp
//! the file's mtime with that creation time. The stamp is what the next
//! run's skip check reads, so a completed sync re-run in normal mode is a
//! no-op beyond the comparison cost.
//!
//! Failure handling is per entry, with one exception: a session rejection
//! (HTTP 401/403) means every further authenticated fetch would fail the
//! same way, so it cancels all not-yet-started entries in the invocation.
//! Files written before the abort stay on disk; a later run resumes past
//! them via the timestamp check.

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset};
use filetime::FileTime;
use std::path::{Path, PathBuf};

use crate::client::{uri_encode, ByteSource, FetchError};
use crate::config::Config;
use crate::manifest::{self, AttachmentRaw};
use crate::models::{SyncMode, SyncReport};
use crate::progress::{ProgressEvent, ProgressReporter};

/// Allowed drift between local mtime and manifest creation time.
pub const MTIME_TOLERANCE_SECS: i64 = 1;

/// A validated attachment entry with its derived archive path.
#[derive(Debug, Clone)]
pub struct PlannedEntry {
    pub id: String,
    pub name: String,
    pub size_bytes: u64,
    pub created: DateTime<FixedOffset>,
    pub target: PathBuf,
}

/// Validate one raw manifest entry and derive its archive path.
///
/// Rejects entries missing `id`, `name`, or `created`, and entries whose
/// `created` is not RFC 2822. The name is reduced to its final path
/// component so a manifest cannot write outside the archive directory.
pub fn plan_entry(
    raw: &AttachmentRaw,
    manifest_dir: &Path,
    record_key: &str,
) -> Result<PlannedEntry, String> {
    let Some(id) = raw.id.as_deref().filter(|v| !v.is_empty()) else {
        return Err("missing id".to_string());
    };
    let Some(name) = raw.name.as_deref().filter(|v| !v.is_empty()) else {
        return Err("missing name".to_string());
    };
    let Some(created_raw) = raw.created.as_deref().filter(|v| !v.is_empty()) else {
        return Err("missing created timestamp".to_string());
    };

    let created = DateTime::parse_from_rfc2822(created_raw)
        .map_err(|e| format!("bad created timestamp '{}': {}", created_raw, e))?;

    let Some(name) = file_name_component(name) else {
        return Err(format!("unusable attachment name '{}'", name));
    };
    let Some(key) = file_name_component(record_key) else {
        return Err(format!("unusable record key '{}'", record_key));
    };

    let target = manifest_dir
        .join("attachments")
        .join(&key)
        .join(format!("ID-{}__{}", id, name));

    Ok(PlannedEntry {
        id: id.to_string(),
        name,
        size_bytes: raw.size_bytes,
        created,
        target,
    })
}

/// Whether an existing file is already synchronized with `created`.
pub fn is_fresh(existing_mtime_secs: i64, created: &DateTime<FixedOffset>) -> bool {
    (existing_mtime_secs - created.timestamp()).abs() <= MTIME_TOLERANCE_SECS
}

/// Byte-fetch URL for one attachment.
pub fn attachment_url(base_url: &str, id: &str, name: &str) -> String {
    format!(
        "{}/secure/attachment/{}/{}",
        base_url,
        uri_encode(id),
        uri_encode(name)
    )
}

/// Resolve manifests, synchronize them, print the run summary.
///
/// Returns the report; a fatal session abort surfaces as an error after
/// the summary, with all completed downloads preserved on disk.
pub async fn run_sync(
    config: &Config,
    source: &dyn ByteSource,
    patterns: &[String],
    mode: SyncMode,
    progress: &dyn ProgressReporter,
) -> Result<SyncReport> {
    let paths = manifest::resolve_manifest_paths(patterns)?;
    if paths.is_empty() {
        eprintln!("No manifest files match the given patterns.");
        return Ok(SyncReport::default());
    }

    let (report, fatal) = sync_all(config, source, &paths, mode, progress).await;

    match mode {
        SyncMode::DryRun => {
            println!("sync (dry-run)");
            println!("  manifests: {}", paths.len());
            println!("  attachments: {}", report.planned + report.failed);
            println!(
                "  would fetch: {} ({})",
                report.planned,
                format_bytes(report.bytes_estimated)
            );
        }
        SyncMode::Normal | SyncMode::Force => {
            println!("sync");
            println!("  manifests: {}", paths.len());
            println!(
                "  downloaded: {} ({})",
                report.downloaded,
                format_bytes(report.bytes_fetched)
            );
            println!("  skipped: {}", report.skipped);
            println!("  failed: {}", report.failed);
            if report.aborted > 0 {
                println!("  aborted: {}", report.aborted);
            }
        }
    }

    if let Some(e) = fatal {
        return Err(anyhow::Error::new(e)
            .context("sync aborted; finished downloads are kept and a normal-mode re-run resumes"));
    }
    println!("ok");
    Ok(report)
}

/// Synchronize a list of manifest files against the byte source.
///
/// Returns the accumulated report plus the fatal error, if one cut the
/// run short. Manifests after the fatal point contribute only to the
/// aborted count.
pub async fn sync_all(
    config: &Config,
    source: &dyn ByteSource,
    paths: &[PathBuf],
    mode: SyncMode,
    progress: &dyn ProgressReporter,
) -> (SyncReport, Option<FetchError>) {
    let mut report = SyncReport::default();
    let mut fatal: Option<FetchError> = None;

    for path in paths {
        if fatal.is_some() {
            report.aborted += manifest_entry_count(path);
            continue;
        }
        match sync_manifest(config, source, path, mode, progress, &mut report).await {
            Ok(None) => {}
            Ok(Some(e)) => fatal = Some(e),
            Err(e) => {
                eprintln!("Warning: skipping manifest {}: {:#}", path.display(), e);
            }
        }
    }

    (report, fatal)
}

/// Entries a manifest would have contributed, for abort accounting.
fn manifest_entry_count(path: &Path) -> u64 {
    std::fs::read(path)
        .ok()
        .and_then(|bytes| manifest::parse_manifest(&bytes).ok())
        .map(|m| m.attachments.len() as u64)
        .unwrap_or(0)
}

/// Synchronize one manifest. `Ok(Some(err))` signals a fatal session
/// error; `Err` is a manifest-level problem the caller logs and skips.
async fn sync_manifest(
    config: &Config,
    source: &dyn ByteSource,
    path: &Path,
    mode: SyncMode,
    progress: &dyn ProgressReporter,
    report: &mut SyncReport,
) -> Result<Option<FetchError>> {
    let bytes = std::fs::read(path).context("unreadable file")?;
    let manifest = manifest::parse_manifest(&bytes)?;
    let manifest_dir = path.parent().unwrap_or_else(|| Path::new("."));

    let total = manifest.attachments.len() as u64;
    let mut handled = 0u64;

    for (index, raw) in manifest.attachments.iter().enumerate() {
        report.bytes_estimated += raw.size_bytes;

        let planned = match plan_entry(raw, manifest_dir, &manifest.record_key) {
            Ok(p) => p,
            Err(reason) => {
                eprintln!(
                    "Warning: malformed attachment entry in {}: {}",
                    path.display(),
                    reason
                );
                report.failed += 1;
                continue;
            }
        };

        if mode == SyncMode::DryRun {
            println!(
                "  queued {} ({})",
                planned.target.display(),
                format_bytes(planned.size_bytes)
            );
            report.planned += 1;
            continue;
        }

        if mode != SyncMode::Force {
            if let Some(mtime_secs) = existing_mtime_secs(&planned.target) {
                if is_fresh(mtime_secs, &planned.created) {
                    report.skipped += 1;
                    handled += 1;
                    progress.report(ProgressEvent::Fetching {
                        label: manifest.record_key.clone(),
                        n: handled,
                        total,
                    });
                    continue;
                }
            }
        }

        let url = attachment_url(&config.tracker.base_url, &planned.id, &planned.name);
        match source.fetch(&url).await {
            Ok(body) => match store_attachment(&planned, &body) {
                Ok(()) => {
                    report.downloaded += 1;
                    report.bytes_fetched += body.len() as u64;
                }
                Err(e) => {
                    eprintln!(
                        "Warning: failed to store {}: {:#}",
                        planned.target.display(),
                        e
                    );
                    report.failed += 1;
                }
            },
            Err(e) if e.is_fatal_session() => {
                eprintln!(
                    "Error: {} while fetching {} — aborting remaining downloads",
                    e, planned.name
                );
                report.failed += 1;
                report.aborted += (manifest.attachments.len() - index - 1) as u64;
                return Ok(Some(e));
            }
            Err(e) => {
                eprintln!("Warning: failed to fetch {}: {}", planned.name, e);
                report.failed += 1;
            }
        }

        handled += 1;
        progress.report(ProgressEvent::Fetching {
            label: manifest.record_key.clone(),
            n: handled,
            total,
        });
    }

    Ok(None)
}

/// Write the fetched bytes, then stamp the file's mtime with the
/// manifest creation time — the fingerprint the skip check reads.
fn store_attachment(planned: &PlannedEntry, body: &[u8]) -> Result<()> {
    if let Some(parent) = planned.target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&planned.target, body)?;
    let mtime = FileTime::from_unix_time(
        planned.created.timestamp(),
        planned.created.timestamp_subsec_nanos(),
    );
    filetime::set_file_mtime(&planned.target, mtime)?;
    Ok(())
}

fn existing_mtime_secs(path: &Path) -> Option<i64> {
    let metadata = std::fs::metadata(path).ok()?;
    Some(FileTime::from_last_modification_time(&metadata).unix_seconds())
}

/// Final path component of a name, rejecting empty and dot-only names.
fn file_name_component(name: &str) -> Option<String> {
    let trimmed = name.trim();
    let component = Path::new(trimmed)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())?;
    if component.is_empty() {
        None
    } else {
        Some(component)
    }
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;
    use async_trait::async_trait;
    use std::collections::HashMap;

    const CREATED: &str = "Mon, 02 Jan 2023 10:00:00 +0000";
    const CREATED_SECS: i64 = 1672653600;

    fn raw(id: &str, name: &str, size: u64) -> AttachmentRaw {
        AttachmentRaw {
            id: Some(id.to_string()),
            name: Some(name.to_string()),
            size_bytes: size,
            created: Some(CREATED.to_string()),
        }
    }

    #[test]
    fn plan_entry_derives_archive_path() {
        let planned = plan_entry(&raw("20001", "bootstrap.log", 10), Path::new("/a/OPS"), "OPS-7")
            .unwrap();
        assert_eq!(
            planned.target,
            Path::new("/a/OPS/attachments/OPS-7/ID-20001__bootstrap.log")
        );
        assert_eq!(planned.created.timestamp(), CREATED_SECS);
    }

    #[test]
    fn plan_entry_rejects_missing_fields() {
        let dir = Path::new(".");
        let mut no_id = raw("x", "n", 0);
        no_id.id = None;
        assert!(plan_entry(&no_id, dir, "K-1").is_err());

        let mut no_name = raw("x", "n", 0);
        no_name.name = Some(String::new());
        assert!(plan_entry(&no_name, dir, "K-1").is_err());

        let mut no_created = raw("x", "n", 0);
        no_created.created = None;
        assert!(plan_entry(&no_created, dir, "K-1").is_err());

        let mut bad_created = raw("x", "n", 0);
        bad_created.created = Some("2023-01-02 10:00".to_string());
        assert!(plan_entry(&bad_created, dir, "K-1").is_err());
    }

    #[test]
    fn plan_entry_strips_path_components_from_name() {
        let planned = plan_entry(
            &raw("1", "../../etc/passwd", 0),
            Path::new("/a/OPS"),
            "OPS-7",
        )
        .unwrap();
        assert_eq!(
            planned.target,
            Path::new("/a/OPS/attachments/OPS-7/ID-1__passwd")
        );
    }

    #[test]
    fn freshness_tolerates_one_second() {
        let created = DateTime::parse_from_rfc2822(CREATED).unwrap();
        assert!(is_fresh(CREATED_SECS, &created));
        assert!(is_fresh(CREATED_SECS + 1, &created));
        assert!(is_fresh(CREATED_SECS - 1, &created));
        assert!(!is_fresh(CREATED_SECS + 2, &created));
    }

    #[test]
    fn attachment_url_percent_encodes_name() {
        assert_eq!(
            attachment_url("https://t", "20002", "report (final).pdf"),
            "https://t/secure/attachment/20002/report%20%28final%29.pdf"
        );
    }

    #[test]
    fn format_bytes_scales() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    // ---- end-to-end over a fake byte source ----

    enum Served {
        Body(Vec<u8>),
        Status(u16),
    }

    struct FakeBytes {
        responses: HashMap<String, Served>,
    }

    #[async_trait]
    impl ByteSource for FakeBytes {
        async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
            match self.responses.get(url) {
                Some(Served::Body(b)) => Ok(b.clone()),
                Some(Served::Status(401)) => Err(FetchError::Session(401)),
                Some(Served::Status(403)) => Err(FetchError::Session(403)),
                Some(Served::Status(s)) => Err(FetchError::Remote(*s)),
                None => Err(FetchError::Remote(404)),
            }
        }
    }

    fn test_config(dir: &Path) -> Config {
        let path = dir.join("trawl.toml");
        std::fs::write(
            &path,
            "[tracker]\nbase_url = \"https://t\"\n[output]\ndir = \"out\"\n",
        )
        .unwrap();
        crate::config::load_config(&path).unwrap()
    }

    fn write_manifest(dir: &Path, key: &str, attachments: &str) -> PathBuf {
        let path = dir.join(format!("{}.xml", key));
        std::fs::write(
            &path,
            format!(
                "<rss><channel><item><key id=\"1\">{}</key><attachments>{}</attachments></item></channel></rss>",
                key, attachments
            ),
        )
        .unwrap();
        path
    }

    fn block_on<F: std::future::Future>(f: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(f)
    }

    #[test]
    fn downloads_and_stamps_mtime() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let path = write_manifest(
            tmp.path(),
            "OPS-7",
            &format!("<attachment id=\"20001\" name=\"a.log\" size=\"5\" created=\"{}\"/>", CREATED),
        );

        let source = FakeBytes {
            responses: HashMap::from([(
                attachment_url("https://t", "20001", "a.log"),
                Served::Body(b"hello".to_vec()),
            )]),
        };

        let (report, fatal) = block_on(sync_all(
            &config,
            &source,
            &[path.clone()],
            SyncMode::Normal,
            &NoProgress,
        ));
        assert!(fatal.is_none());
        assert_eq!(report.downloaded, 1);
        assert_eq!(report.bytes_fetched, 5);

        let target = tmp.path().join("attachments/OPS-7/ID-20001__a.log");
        assert_eq!(std::fs::read(&target).unwrap(), b"hello");
        let mtime = existing_mtime_secs(&target).unwrap();
        assert!((mtime - CREATED_SECS).abs() <= 1);

        // Second run in normal mode: zero downloads, file untouched.
        let (second, fatal) = block_on(sync_all(
            &config,
            &source,
            &[path],
            SyncMode::Normal,
            &NoProgress,
        ));
        assert!(fatal.is_none());
        assert_eq!(second.downloaded, 0);
        assert_eq!(second.skipped, 1);
    }

    #[test]
    fn force_redownloads_fresh_files() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let path = write_manifest(
            tmp.path(),
            "OPS-7",
            &format!("<attachment id=\"20001\" name=\"a.log\" size=\"5\" created=\"{}\"/>", CREATED),
        );
        let source = FakeBytes {
            responses: HashMap::from([(
                attachment_url("https://t", "20001", "a.log"),
                Served::Body(b"hello".to_vec()),
            )]),
        };

        let (_, _) = block_on(sync_all(&config, &source, &[path.clone()], SyncMode::Normal, &NoProgress));
        let (again, _) = block_on(sync_all(&config, &source, &[path], SyncMode::Force, &NoProgress));
        assert_eq!(again.downloaded, 1);
        assert_eq!(again.skipped, 0);
    }

    #[test]
    fn dry_run_touches_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let path = write_manifest(
            tmp.path(),
            "OPS-7",
            &format!(
                "<attachment id=\"1\" name=\"a.log\" size=\"100\" created=\"{}\"/><attachment id=\"2\" name=\"b.log\" size=\"200\" created=\"{}\"/>",
                CREATED, CREATED
            ),
        );
        // No responses: any fetch would fail, proving none happens.
        let source = FakeBytes {
            responses: HashMap::new(),
        };

        let (report, fatal) = block_on(sync_all(
            &config,
            &source,
            &[path],
            SyncMode::DryRun,
            &NoProgress,
        ));
        assert!(fatal.is_none());
        assert_eq!(report.planned, 2);
        assert_eq!(report.bytes_estimated, 300);
        assert_eq!(report.downloaded, 0);
        assert!(!tmp.path().join("attachments").exists());
    }

    #[test]
    fn session_rejection_aborts_remaining_queue() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let first = write_manifest(
            tmp.path(),
            "OPS-1",
            &format!(
                "<attachment id=\"1\" name=\"a.log\" size=\"1\" created=\"{}\"/><attachment id=\"2\" name=\"b.log\" size=\"1\" created=\"{}\"/><attachment id=\"3\" name=\"c.log\" size=\"1\" created=\"{}\"/>",
                CREATED, CREATED, CREATED
            ),
        );
        let second = write_manifest(
            tmp.path(),
            "OPS-2",
            &format!("<attachment id=\"4\" name=\"d.log\" size=\"1\" created=\"{}\"/>", CREATED),
        );

        let source = FakeBytes {
            responses: HashMap::from([
                (
                    attachment_url("https://t", "1", "a.log"),
                    Served::Body(b"x".to_vec()),
                ),
                (
                    attachment_url("https://t", "2", "b.log"),
                    Served::Status(401),
                ),
            ]),
        };

        let (report, fatal) = block_on(sync_all(
            &config,
            &source,
            &[first, second],
            SyncMode::Normal,
            &NoProgress,
        ));
        assert!(fatal.as_ref().is_some_and(FetchError::is_fatal_session));
        assert_eq!(report.downloaded, 1);
        assert_eq!(report.failed, 1);
        // c.log from the first manifest plus the entire second manifest.
        assert_eq!(report.aborted, 2);

        // The file completed before the abort stays on disk.
        assert!(tmp.path().join("attachments/OPS-1/ID-1__a.log").exists());
        assert!(!tmp.path().join("attachments/OPS-1/ID-3__c.log").exists());
        assert!(!tmp.path().join("attachments/OPS-2/ID-4__d.log").exists());
    }

    #[test]
    fn plain_remote_error_is_per_item() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let path = write_manifest(
            tmp.path(),
            "OPS-1",
            &format!(
                "<attachment id=\"1\" name=\"a.log\" size=\"1\" created=\"{}\"/><attachment id=\"2\" name=\"b.log\" size=\"1\" created=\"{}\"/>",
                CREATED, CREATED
            ),
        );
        let source = FakeBytes {
            responses: HashMap::from([
                (
                    attachment_url("https://t", "1", "a.log"),
                    Served::Status(404),
                ),
                (
                    attachment_url("https://t", "2", "b.log"),
                    Served::Body(b"y".to_vec()),
                ),
            ]),
        };

        let (report, fatal) = block_on(sync_all(
            &config,
            &source,
            &[path],
            SyncMode::Normal,
            &NoProgress,
        ));
        assert!(fatal.is_none());
        assert_eq!(report.failed, 1);
        assert_eq!(report.downloaded, 1);
        assert_eq!(report.aborted, 0);
    }

    #[test]
    fn malformed_entries_fail_without_stopping_batch() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let path = write_manifest(
            tmp.path(),
            "OPS-1",
            &format!(
                "<attachment name=\"noid.log\" size=\"1\"/><attachment id=\"2\" name=\"ok.log\" size=\"1\" created=\"{}\"/>",
                CREATED
            ),
        );
        let source = FakeBytes {
            responses: HashMap::from([(
                attachment_url("https://t", "2", "ok.log"),
                Served::Body(b"z".to_vec()),
            )]),
        };

        let (report, fatal) = block_on(sync_all(
            &config,
            &source,
            &[path],
            SyncMode::Normal,
            &NoProgress,
        ));
        assert!(fatal.is_none());
        assert_eq!(report.failed, 1);
        assert_eq!(report.downloaded, 1);
    }
}
