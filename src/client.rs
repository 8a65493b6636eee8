//! HTTP client for the remote tracker.
//!
//! Implements the two narrow collaborator interfaces the pipelines need:
//! [`QuerySource`] (windowed/paginated search) and [`ByteSource`]
//! (authenticated byte fetch). Requests carry the session cookie header
//! and are awaited one at a time — the remote endpoint is session-bound
//! and rate-sensitive, so there is never more than one in-flight request
//! per [`SessionHandle`].
//!
//! # Retry strategy
//!
//! - HTTP 429 or 5xx → retry with exponential backoff
//! - HTTP 401/403 → fail immediately as [`FetchError::Session`]
//! - other HTTP 4xx → fail immediately as [`FetchError::Remote`]
//! - network error / timeout → retry

use async_trait::async_trait;
use std::time::Duration;

use crate::config::Config;
use crate::models::{QueryPage, RawRow};
use crate::session::SessionHandle;

/// Transport error taxonomy.
///
/// [`FetchError::Session`] is the fatal class: on an authenticated
/// endpoint it means the session is lost, and every subsequent request is
/// expected to fail identically, so callers abort remaining work. All
/// other variants are scoped to the current item.
#[derive(Debug)]
pub enum FetchError {
    /// 401/403 — the session is invalid or expired.
    Session(u16),
    /// Any other non-success status that survived the retry policy.
    Remote(u16),
    /// Network-level failure (DNS, connect, timeout) after retries.
    Transport(String),
    /// The response body did not have the expected shape.
    Parse(String),
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::Session(status) => {
                write!(f, "session rejected (HTTP {}) — log in again", status)
            }
            FetchError::Remote(status) => write!(f, "remote error (HTTP {})", status),
            FetchError::Transport(e) => write!(f, "transport error: {}", e),
            FetchError::Parse(e) => write!(f, "unexpected response shape: {}", e),
        }
    }
}

impl std::error::Error for FetchError {}

impl FetchError {
    /// Whether this error invalidates the whole session (abort remaining work).
    pub fn is_fatal_session(&self) -> bool {
        matches!(self, FetchError::Session(_))
    }
}

/// Windowed/paginated record search.
#[async_trait]
pub trait QuerySource: Send + Sync {
    /// Run `filter` against the remote source starting at `offset`.
    ///
    /// Returns one page of rows plus the total match count the source
    /// reports for the filter at this instant.
    async fn query(&self, filter: &str, offset: u64) -> Result<QueryPage, FetchError>;
}

/// Authenticated raw byte fetch.
#[async_trait]
pub trait ByteSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// Byte source for runs that must not touch the network (dry-run).
///
/// Every fetch fails; callers that honor dry-run semantics never call it.
pub struct OfflineByteSource;

#[async_trait]
impl ByteSource for OfflineByteSource {
    async fn fetch(&self, _url: &str) -> Result<Vec<u8>, FetchError> {
        Err(FetchError::Transport(
            "network access is disabled for this run".to_string(),
        ))
    }
}

/// Production client speaking to a tracker instance over HTTP.
pub struct TrackerClient {
    base_url: String,
    page_size: u64,
    max_retries: u32,
    session: SessionHandle,
    client: reqwest::Client,
}

impl TrackerClient {
    pub fn new(config: &Config, session: SessionHandle) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http.timeout_secs))
            .build()?;

        Ok(Self {
            base_url: config.tracker.base_url.clone(),
            page_size: config.query.page_size,
            max_retries: config.http.max_retries,
            session,
            client,
        })
    }

    /// URL of the search document view for `filter` at `offset`.
    fn search_url(&self, filter: &str, offset: u64) -> String {
        format!(
            "{}/sr/jira.issueviews:searchrequest-xml/temp/SearchRequest.xml?jqlQuery={}&pager/start={}&tempMax={}",
            self.base_url,
            uri_encode(filter),
            offset,
            self.page_size
        )
    }

    /// GET `url` with the session cookie, applying the retry policy.
    async fn get_with_retry(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let mut last_err: Option<FetchError> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .get(url)
                .header("Cookie", self.session.cookie_header())
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let bytes = response
                            .bytes()
                            .await
                            .map_err(|e| FetchError::Transport(e.to_string()))?;
                        return Ok(bytes.to_vec());
                    }

                    if status.as_u16() == 401 || status.as_u16() == 403 {
                        return Err(FetchError::Session(status.as_u16()));
                    }

                    // Rate limited or server error — retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(FetchError::Remote(status.as_u16()));
                        continue;
                    }

                    // Other client error — don't retry
                    return Err(FetchError::Remote(status.as_u16()));
                }
                Err(e) => {
                    last_err = Some(FetchError::Transport(e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| FetchError::Transport("retries exhausted".to_string())))
    }
}

#[async_trait]
impl QuerySource for TrackerClient {
    async fn query(&self, filter: &str, offset: u64) -> Result<QueryPage, FetchError> {
        let url = self.search_url(filter, offset);
        let body = self.get_with_retry(&url).await?;
        parse_search_page(&body)
    }
}

#[async_trait]
impl ByteSource for TrackerClient {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.get_with_retry(url).await
    }
}

/// Parse a search document page.
///
/// The counter element `<issue start=".." end=".." total="..">` carries
/// both the authoritative match count and the "more results" affordance
/// (`end < total`). Each `<item>` holds `<key id="..">KEY</key>`,
/// `<summary>`, and `<link>`.
pub fn parse_search_page(xml: &[u8]) -> Result<QueryPage, FetchError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    let mut counter: Option<(u64, u64)> = None; // (end, total)
    let mut rows = Vec::new();
    let mut in_item = false;
    let mut row = RawRow::default();
    let mut capture: Option<&'static str> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => match e.local_name().as_ref() {
                b"issue" => {
                    if let Some(c) = parse_counter_attrs(&e) {
                        counter = Some(c);
                    }
                }
                b"item" => {
                    in_item = true;
                    row = RawRow::default();
                }
                b"key" if in_item => {
                    row.ordinal = parse_id_attr(&e);
                    capture = Some("key");
                }
                b"summary" if in_item => capture = Some("summary"),
                b"link" if in_item => capture = Some("link"),
                _ => {}
            },
            // Self-closing elements carry attributes but no text to capture.
            Ok(quick_xml::events::Event::Empty(e)) => match e.local_name().as_ref() {
                b"issue" => {
                    if let Some(c) = parse_counter_attrs(&e) {
                        counter = Some(c);
                    }
                }
                b"key" if in_item => row.ordinal = parse_id_attr(&e),
                _ => {}
            },
            Ok(quick_xml::events::Event::Text(t)) => {
                if let Some(field) = capture {
                    let text = t.unescape().unwrap_or_default().into_owned();
                    match field {
                        "key" => row.key = Some(text),
                        "summary" => row.title = Some(text),
                        "link" => row.url = Some(text),
                        _ => {}
                    }
                }
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"item" => {
                    in_item = false;
                    rows.push(std::mem::take(&mut row));
                }
                b"key" | b"summary" | b"link" => capture = None,
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(FetchError::Parse(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    let Some((end, total)) = counter else {
        return Err(FetchError::Parse(
            "search page is missing the result counter element".to_string(),
        ));
    };

    Ok(QueryPage {
        match_count: total,
        rows,
        more: end < total,
    })
}

/// `(end, total)` from a result counter element's attributes.
fn parse_counter_attrs(e: &quick_xml::events::BytesStart<'_>) -> Option<(u64, u64)> {
    let mut end = None;
    let mut total = None;
    for attr in e.attributes().flatten() {
        let value = attr.unescape_value().unwrap_or_default();
        match attr.key.local_name().as_ref() {
            b"end" => end = value.parse::<u64>().ok(),
            b"total" => total = value.parse::<u64>().ok(),
            _ => {}
        }
    }
    Some((end?, total?))
}

/// Numeric `id` attribute of a key element, when present and numeric.
fn parse_id_attr(e: &quick_xml::events::BytesStart<'_>) -> Option<i64> {
    for attr in e.attributes().flatten() {
        if attr.key.local_name().as_ref() == b"id" {
            return attr
                .unescape_value()
                .ok()
                .and_then(|v| v.parse::<i64>().ok());
        }
    }
    None
}

/// Percent-encode a string per RFC 3986.
///
/// Encodes all characters except unreserved characters:
/// `A-Z a-z 0-9 - _ . ~`
pub fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}
