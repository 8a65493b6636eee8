//! Manifest document export.
//!
//! Reads previously written discovery tables, fetches each record's XML
//! manifest document from the tracker, and stores it in the archive as
//! `<output>/<PROJECT>/<KEY>.xml` — the tree the attachment synchronizer
//! later consumes. A record whose document cannot be fetched is skipped
//! with a warning; only a session rejection stops the run.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::client::{uri_encode, ByteSource};
use crate::config::Config;
use crate::progress::{ProgressEvent, ProgressReporter};

/// Manifest document URL for one record key.
pub fn manifest_url(base_url: &str, key: &str) -> String {
    format!(
        "{}/si/jira.issueviews:issue-xml/{}/{}.xml",
        base_url,
        uri_encode(key),
        uri_encode(key)
    )
}

/// Fetch manifest documents for every key listed in the given tables.
pub async fn run_export(
    config: &Config,
    source: &dyn ByteSource,
    tables: &[PathBuf],
    progress: &dyn ProgressReporter,
) -> Result<()> {
    let keys = load_tables(tables)?;
    if keys.is_empty() {
        eprintln!("No record keys found in the given tables.");
        return Ok(());
    }

    let total = keys.len() as u64;
    let mut saved = 0u64;
    let mut skipped = 0u64;

    for (n, (project, key)) in keys.iter().enumerate() {
        let url = manifest_url(&config.tracker.base_url, key);
        match source.fetch(&url).await {
            Ok(body) => {
                let dir = config.output.dir.join(project);
                std::fs::create_dir_all(&dir).with_context(|| {
                    format!("Failed to create manifest directory: {}", dir.display())
                })?;
                let path = dir.join(format!("{}.xml", key));
                std::fs::write(&path, &body)
                    .with_context(|| format!("Failed to write manifest: {}", path.display()))?;
                saved += 1;
            }
            Err(e) if e.is_fatal_session() => {
                println!("export");
                println!("  manifests saved: {}", saved);
                println!("  skipped: {}", skipped);
                return Err(anyhow::Error::new(e).context(format!(
                    "export aborted at {}; saved manifests are kept",
                    key
                )));
            }
            Err(e) => {
                eprintln!("Warning: failed to fetch manifest for {}: {}", key, e);
                skipped += 1;
            }
        }
        progress.report(ProgressEvent::Fetching {
            label: project.clone(),
            n: n as u64 + 1,
            total,
        });
    }

    println!("export");
    println!("  manifests saved: {}", saved);
    println!("  skipped: {}", skipped);
    println!("ok");
    Ok(())
}

/// Load `(project, key)` pairs from discovery tables.
///
/// The project is the table's file stem, uppercased; keys come from the
/// table's `key` column. Rows without a key are dropped with a warning.
fn load_tables(tables: &[PathBuf]) -> Result<Vec<(String, String)>> {
    let mut keys = Vec::new();

    for table in tables {
        let project = project_of(table);
        let mut reader = csv::Reader::from_path(table)
            .with_context(|| format!("Failed to read table: {}", table.display()))?;

        let headers = reader.headers()?.clone();
        let Some(key_index) = headers.iter().position(|h| h == "key") else {
            anyhow::bail!("table {} has no 'key' column", table.display());
        };

        for record in reader.records() {
            let record = record?;
            match record.get(key_index).filter(|k| !k.is_empty()) {
                Some(key) => keys.push((project.clone(), key.to_string())),
                None => {
                    eprintln!("Warning: row without key in {}", table.display());
                }
            }
        }
    }

    Ok(keys)
}

fn project_of(table: &Path) -> String {
    table
        .file_stem()
        .map(|s| s.to_string_lossy().to_uppercase())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_url_shape() {
        assert_eq!(
            manifest_url("https://t", "OPS-7"),
            "https://t/si/jira.issueviews:issue-xml/OPS-7/OPS-7.xml"
        );
    }

    #[test]
    fn load_tables_reads_keys_and_project_from_stem() {
        let dir = tempfile::tempdir().unwrap();
        let table = dir.path().join("ops.csv");
        std::fs::write(
            &table,
            "ordinal,key,title,url\n10,OPS-1,first,https://t/browse/OPS-1\n20,OPS-2,second,https://t/browse/OPS-2\n",
        )
        .unwrap();

        let keys = load_tables(&[table]).unwrap();
        assert_eq!(
            keys,
            vec![
                ("OPS".to_string(), "OPS-1".to_string()),
                ("OPS".to_string(), "OPS-2".to_string())
            ]
        );
    }

    #[test]
    fn table_without_key_column_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let table = dir.path().join("ops.csv");
        std::fs::write(&table, "ordinal,title\n1,x\n").unwrap();
        assert!(load_tables(&[table]).is_err());
    }
}
