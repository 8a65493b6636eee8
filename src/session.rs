//! Authenticated session acquisition and replay.
//!
//! The tracker endpoints are session-bound: every request must carry the
//! cookies of a logged-in browser session. Acquisition is an injectable
//! [`SessionProvider`] with two variants — [`CachedSession`] replays a
//! previously captured state file, [`InteractiveSession`] captures a new
//! one from the user. Which variant runs is the caller's choice; nothing
//! in the core probes the state file to decide.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::BufRead;
use std::path::{Path, PathBuf};

/// Opaque handle to an authenticated session.
///
/// Holds the `Cookie` header value replayed on every request. One handle
/// means one logical session: requests using it must stay sequential.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    cookie_header: String,
}

impl SessionHandle {
    pub fn cookie_header(&self) -> &str {
        &self.cookie_header
    }
}

/// Persisted session state file contents.
#[derive(Debug, Serialize, Deserialize)]
struct SessionState {
    cookies: Vec<SessionCookie>,
    saved_at: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionCookie {
    name: String,
    value: String,
}

/// Source of authenticated sessions.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Resolve an authenticated session.
    ///
    /// May block on interactive user action; idempotent once a session
    /// has been captured.
    async fn resolve(&self) -> Result<SessionHandle>;
}

/// Replays a previously captured session from the state file.
pub struct CachedSession {
    state_path: PathBuf,
}

impl CachedSession {
    pub fn new(state_path: impl Into<PathBuf>) -> Self {
        Self {
            state_path: state_path.into(),
        }
    }
}

#[async_trait]
impl SessionProvider for CachedSession {
    async fn resolve(&self) -> Result<SessionHandle> {
        let raw = std::fs::read_to_string(&self.state_path).with_context(|| {
            format!(
                "No cached session at {} — run `trawl login` first",
                self.state_path.display()
            )
        })?;
        let state: SessionState = serde_json::from_str(&raw).with_context(|| {
            format!(
                "Failed to parse session state: {}",
                self.state_path.display()
            )
        })?;
        if state.cookies.is_empty() {
            anyhow::bail!(
                "Session state {} holds no cookies — run `trawl login` again",
                self.state_path.display()
            );
        }
        Ok(SessionHandle {
            cookie_header: cookie_header(&state.cookies),
        })
    }
}

/// Captures a session interactively and persists it for later cached use.
///
/// The user logs in with a normal browser, copies the request `Cookie`
/// header from its developer tools, and pastes it at the prompt.
pub struct InteractiveSession {
    state_path: PathBuf,
}

impl InteractiveSession {
    pub fn new(state_path: impl Into<PathBuf>) -> Self {
        Self {
            state_path: state_path.into(),
        }
    }
}

#[async_trait]
impl SessionProvider for InteractiveSession {
    async fn resolve(&self) -> Result<SessionHandle> {
        eprintln!("Log in to the tracker in your browser, then paste the value of the");
        eprintln!("`Cookie` request header here (from the browser's developer tools):");
        eprint!("> ");

        let mut line = String::new();
        std::io::stdin()
            .lock()
            .read_line(&mut line)
            .context("Failed to read cookie header from stdin")?;

        let cookies = parse_cookie_header(&line)?;
        let state = SessionState {
            cookies,
            saved_at: chrono::Utc::now().timestamp(),
        };

        if let Some(parent) = self.state_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.state_path, serde_json::to_string_pretty(&state)?).with_context(
            || {
                format!(
                    "Failed to write session state: {}",
                    self.state_path.display()
                )
            },
        )?;
        eprintln!("Saved session state to {}", self.state_path.display());

        Ok(SessionHandle {
            cookie_header: cookie_header(&state.cookies),
        })
    }
}

/// When the state file was captured (Unix seconds), if it exists and parses.
pub fn state_saved_at(state_path: &Path) -> Option<i64> {
    let raw = std::fs::read_to_string(state_path).ok()?;
    let state: SessionState = serde_json::from_str(&raw).ok()?;
    Some(state.saved_at)
}

fn cookie_header(cookies: &[SessionCookie]) -> String {
    cookies
        .iter()
        .map(|c| format!("{}={}", c.name, c.value))
        .collect::<Vec<_>>()
        .join("; ")
}

fn parse_cookie_header(raw: &str) -> Result<Vec<SessionCookie>> {
    let mut cookies = Vec::new();
    for pair in raw.trim().split(';') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let Some(eq) = pair.find('=') else {
            anyhow::bail!("Invalid cookie pair (no '='): {}", pair);
        };
        cookies.push(SessionCookie {
            name: pair[..eq].to_string(),
            value: pair[eq + 1..].to_string(),
        });
    }
    if cookies.is_empty() {
        anyhow::bail!("No cookies found in the pasted header");
    }
    Ok(cookies)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_header_round_trip() {
        let cookies = parse_cookie_header("JSESSIONID=abc123; atlassian.xsrf.token=tok-42\n").unwrap();
        assert_eq!(cookies.len(), 2);
        assert_eq!(
            cookie_header(&cookies),
            "JSESSIONID=abc123; atlassian.xsrf.token=tok-42"
        );
    }

    #[test]
    fn cookie_value_may_contain_equals() {
        let cookies = parse_cookie_header("token=a=b=c").unwrap();
        assert_eq!(cookies[0].name, "token");
        assert_eq!(cookies[0].value, "a=b=c");
    }

    #[test]
    fn empty_header_rejected() {
        assert!(parse_cookie_header("   \n").is_err());
    }

    #[test]
    fn cached_session_reads_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth_state.json");
        std::fs::write(
            &path,
            r#"{"cookies":[{"name":"sid","value":"s3cret"}],"saved_at":1700000000}"#,
        )
        .unwrap();

        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let handle = rt.block_on(CachedSession::new(&path).resolve()).unwrap();
        assert_eq!(handle.cookie_header(), "sid=s3cret");
        assert_eq!(state_saved_at(&path), Some(1700000000));
    }

    #[test]
    fn cached_session_missing_file_is_error() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let err = rt
            .block_on(CachedSession::new("/nonexistent/auth_state.json").resolve())
            .unwrap_err();
        assert!(err.to_string().contains("trawl login"));
    }
}
