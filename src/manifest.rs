//! Manifest documents: locating them on disk and parsing them.
//!
//! A manifest is one record's XML export. The synchronizer needs only the
//! record key and the `<attachment>` elements; everything else in the
//! document is ignored. Attachment elements are passed through raw —
//! validation (and the malformed-entry bookkeeping) happens at sync time.

use anyhow::{Context, Result};
use globset::{Glob, GlobSetBuilder};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Parsed manifest: the record key plus its attachment listing.
#[derive(Debug, Clone)]
pub struct Manifest {
    pub record_key: String,
    pub attachments: Vec<AttachmentRaw>,
}

/// One `<attachment>` element as it appears in the manifest.
///
/// Fields are optional because the document does not guarantee them;
/// entries missing `id`, `name`, or `created` are rejected per entry by
/// the synchronizer.
#[derive(Debug, Clone, Default)]
pub struct AttachmentRaw {
    pub id: Option<String>,
    pub name: Option<String>,
    pub size_bytes: u64,
    /// Authoritative creation timestamp, RFC 2822 formatted.
    pub created: Option<String>,
}

/// Manifest parse error.
#[derive(Debug)]
pub enum ManifestError {
    Xml(String),
    MissingKey,
}

impl std::fmt::Display for ManifestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ManifestError::Xml(e) => write!(f, "manifest XML parse failed: {}", e),
            ManifestError::MissingKey => write!(f, "manifest has no record key"),
        }
    }
}

impl std::error::Error for ManifestError {}

/// Parse a manifest document.
///
/// The record key is the text of the first `<key>` element; attachments
/// are the attribute sets of every `<attachment>` element.
pub fn parse_manifest(xml: &[u8]) -> Result<Manifest, ManifestError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    let mut record_key: Option<String> = None;
    let mut attachments = Vec::new();
    let mut in_key = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => match e.local_name().as_ref() {
                b"key" if record_key.is_none() => in_key = true,
                b"attachment" => attachments.push(attachment_from_attrs(&e)),
                _ => {}
            },
            Ok(quick_xml::events::Event::Empty(e)) => {
                if e.local_name().as_ref() == b"attachment" {
                    attachments.push(attachment_from_attrs(&e));
                }
            }
            Ok(quick_xml::events::Event::Text(t)) => {
                if in_key {
                    let text = t.unescape().unwrap_or_default().trim().to_string();
                    if !text.is_empty() {
                        record_key = Some(text);
                    }
                }
            }
            Ok(quick_xml::events::Event::End(e)) => {
                if e.local_name().as_ref() == b"key" {
                    in_key = false;
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(ManifestError::Xml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    let Some(record_key) = record_key else {
        return Err(ManifestError::MissingKey);
    };

    Ok(Manifest {
        record_key,
        attachments,
    })
}

fn attachment_from_attrs(e: &quick_xml::events::BytesStart<'_>) -> AttachmentRaw {
    let mut raw = AttachmentRaw::default();
    for attr in e.attributes().flatten() {
        let value = attr.unescape_value().unwrap_or_default().into_owned();
        match attr.key.local_name().as_ref() {
            b"id" => raw.id = Some(value),
            b"name" => raw.name = Some(value),
            b"size" => raw.size_bytes = value.parse().unwrap_or(0),
            b"created" => raw.created = Some(value),
            _ => {}
        }
    }
    raw
}

/// Resolve manifest arguments into concrete file paths.
///
/// Each argument may be an existing file, a directory (walked recursively
/// for `*.xml`), or a glob pattern rooted at its first wildcard-free
/// prefix. The result is sorted and deduplicated.
pub fn resolve_manifest_paths(patterns: &[String]) -> Result<Vec<PathBuf>> {
    let mut paths: Vec<PathBuf> = Vec::new();

    for pattern in patterns {
        let as_path = Path::new(pattern);
        if as_path.is_file() {
            paths.push(as_path.to_path_buf());
            continue;
        }
        if as_path.is_dir() {
            for entry in WalkDir::new(as_path) {
                let entry = entry?;
                if entry.file_type().is_file()
                    && entry.path().extension().is_some_and(|e| e == "xml")
                {
                    paths.push(entry.path().to_path_buf());
                }
            }
            continue;
        }

        let glob = Glob::new(pattern)
            .with_context(|| format!("Invalid manifest pattern: {}", pattern))?;
        let set = GlobSetBuilder::new().add(glob).build()?;
        let root = glob_root(as_path);
        if !root.exists() {
            continue;
        }
        for entry in WalkDir::new(&root) {
            let entry = entry?;
            if entry.file_type().is_file() && set.is_match(entry.path()) {
                paths.push(entry.path().to_path_buf());
            }
        }
    }

    paths.sort();
    paths.dedup();
    Ok(paths)
}

/// Longest leading path prefix with no glob metacharacters.
fn glob_root(pattern: &Path) -> PathBuf {
    let mut root = PathBuf::new();
    for component in pattern.components() {
        let text = component.as_os_str().to_string_lossy();
        if text.contains(['*', '?', '[', '{']) {
            break;
        }
        match component {
            Component::CurDir => root.push("."),
            _ => root.push(component.as_os_str()),
        }
    }
    if root.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        root
    }
}
