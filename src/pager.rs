//! Offset pagination within one resolved window.
//!
//! The offset advances by the remote source's native page size after each
//! non-empty page. A page with fewer rows than the page size is not a
//! terminal signal by itself — only an explicitly empty page, or the
//! absence of the "more results" affordance, ends pagination. A fresh call
//! always re-fetches from offset 0.

use crate::client::{FetchError, QuerySource};
use crate::models::{RawRow, RecordSummary};

/// Collect every record summary the filter yields, in page order.
///
/// Rows missing a required field (ordinal id, key, or url) are dropped
/// with a warning, never fatal.
pub async fn collect_window(
    source: &dyn QuerySource,
    filter: &str,
    page_size: u64,
) -> Result<Vec<RecordSummary>, FetchError> {
    let mut records = Vec::new();
    let mut offset = 0u64;

    loop {
        let page = source.query(filter, offset).await?;
        if page.rows.is_empty() {
            break;
        }

        for raw in page.rows {
            match validate_row(raw) {
                Ok(record) => records.push(record),
                Err(reason) => {
                    eprintln!("Warning: dropping result row ({}) at offset {}", reason, offset);
                }
            }
        }

        if !page.more {
            break;
        }
        offset += page_size;
    }

    Ok(records)
}

fn validate_row(raw: RawRow) -> Result<RecordSummary, &'static str> {
    let Some(ordinal) = raw.ordinal else {
        return Err("missing ordinal id");
    };
    let Some(key) = raw.key.filter(|k| !k.is_empty()) else {
        return Err("missing key");
    };
    let Some(url) = raw.url.filter(|u| !u.is_empty()) else {
        return Err("missing url");
    };
    Ok(RecordSummary {
        ordinal,
        key,
        title: raw.title.map(|t| t.trim().to_string()).unwrap_or_default(),
        url,
    })
}
