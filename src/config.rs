use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub tracker: TrackerConfig,
    pub output: OutputConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TrackerConfig {
    /// Base address of the tracker instance, e.g. `https://issues.example.com`.
    pub base_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    /// Directory receiving discovery tables and the manifest/attachment tree.
    pub dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            state_path: default_state_path(),
        }
    }
}

fn default_state_path() -> PathBuf {
    PathBuf::from("./auth_state.json")
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryConfig {
    /// Maximum result count the remote source returns reliably for one filter.
    #[serde(default = "default_threshold")]
    pub threshold: u64,
    /// Native page size of the remote source.
    #[serde(default = "default_page_size")]
    pub page_size: u64,
    /// Initial candidate window width, in days.
    #[serde(default = "default_initial_window_days")]
    pub initial_window_days: i64,
    /// Narrowing floor, in days. A window this small is accepted even when
    /// its match count is still above the threshold.
    #[serde(default = "default_min_window_days")]
    pub min_window_days: i64,
    /// Filter expression template with `{project}`, `{start}`, `{end}`
    /// placeholders.
    #[serde(default = "default_filter_template")]
    pub filter_template: String,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            page_size: default_page_size(),
            initial_window_days: default_initial_window_days(),
            min_window_days: default_min_window_days(),
            filter_template: default_filter_template(),
        }
    }
}

fn default_threshold() -> u64 {
    500
}
fn default_page_size() -> u64 {
    50
}
fn default_initial_window_days() -> i64 {
    180
}
fn default_min_window_days() -> i64 {
    1
}
fn default_filter_template() -> String {
    "project = {project} AND created >= \"{start}\" AND created < \"{end}\" ORDER BY created DESC"
        .to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Retries for transient failures (429/5xx/network) before giving up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate tracker
    if config.tracker.base_url.trim().is_empty() {
        anyhow::bail!("tracker.base_url must not be empty");
    }
    while config.tracker.base_url.ends_with('/') {
        config.tracker.base_url.pop();
    }

    // Validate output
    if config.output.dir.as_os_str().is_empty() {
        anyhow::bail!("output.dir must not be empty");
    }

    // Validate query
    if config.query.threshold == 0 {
        anyhow::bail!("query.threshold must be > 0");
    }
    if config.query.page_size == 0 {
        anyhow::bail!("query.page_size must be > 0");
    }
    if config.query.min_window_days < 1 {
        anyhow::bail!("query.min_window_days must be >= 1");
    }
    if config.query.initial_window_days < config.query.min_window_days {
        anyhow::bail!("query.initial_window_days must be >= query.min_window_days");
    }
    for placeholder in ["{project}", "{start}", "{end}"] {
        if !config.query.filter_template.contains(placeholder) {
            anyhow::bail!("query.filter_template must contain {}", placeholder);
        }
    }

    // Validate http
    if config.http.timeout_secs == 0 {
        anyhow::bail!("http.timeout_secs must be > 0");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(body.as_bytes()).unwrap();
        f
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let f = write_config(
            "[tracker]\nbase_url = \"https://issues.example.com/\"\n[output]\ndir = \"./archive\"\n",
        );
        let cfg = load_config(f.path()).unwrap();
        assert_eq!(cfg.tracker.base_url, "https://issues.example.com");
        assert_eq!(cfg.query.threshold, 500);
        assert_eq!(cfg.query.page_size, 50);
        assert_eq!(cfg.query.initial_window_days, 180);
        assert_eq!(cfg.http.timeout_secs, 30);
    }

    #[test]
    fn empty_base_url_rejected() {
        let f = write_config("[tracker]\nbase_url = \"\"\n[output]\ndir = \"./archive\"\n");
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn zero_threshold_rejected() {
        let f = write_config(
            "[tracker]\nbase_url = \"https://t\"\n[output]\ndir = \"o\"\n[query]\nthreshold = 0\n",
        );
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn filter_template_placeholders_required() {
        let f = write_config(
            "[tracker]\nbase_url = \"https://t\"\n[output]\ndir = \"o\"\n[query]\nfilter_template = \"project = {project}\"\n",
        );
        assert!(load_config(f.path()).is_err());
    }
}
