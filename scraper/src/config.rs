use crate::Result;
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

#[derive(Debug, Deserialize)]
pub struct Config {
    /// Root of the archive tree
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Snapshot file of the record store. Default: `<data_dir>/store.json`
    #[serde(default)]
    store_path: Option<PathBuf>,

    /// Repositories imported by `import` when none are given on the command line
    #[serde(default)]
    pub repositories: Vec<String>,

    pub github: GithubConfig,

    #[serde(default)]
    pub shell_parser: ShellParserConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        if config.github.tokens.is_empty() {
            return Err("github.tokens must contain at least one token".into());
        }
        Ok(config)
    }

    pub fn store_path(&self) -> PathBuf {
        self.store_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("store.json"))
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct GithubConfig {
    /// Pool used to list runs and download logs
    pub tokens: Vec<String>,

    /// Used for ETag polling. ETags are tied to the token that obtained them,
    /// so this is usually a single token. Default: `tokens`
    #[serde(default)]
    poll_tokens: Vec<String>,

    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default = "default_github_max_attempts")]
    pub max_attempts: usize,
}

impl GithubConfig {
    pub fn poll_tokens(&self) -> &[String] {
        if self.poll_tokens.is_empty() {
            &self.tokens
        } else {
            &self.poll_tokens
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ShellParserConfig {
    #[serde(default = "default_shell_parser_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_shell_parser_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_shell_parser_max_attempts")]
    pub max_attempts: u32,
}

impl ShellParserConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ShellParserConfig {
    fn default() -> Self {
        Self {
            endpoint: default_shell_parser_endpoint(),
            timeout_secs: default_shell_parser_timeout(),
            max_attempts: default_shell_parser_max_attempts(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct OrchestratorConfig {
    /// Runs kept per workflow
    #[serde(default = "default_retention")]
    pub retention: usize,

    /// Ceiling on a downloaded log archive, in bytes
    #[serde(default = "default_max_archive_size")]
    pub max_archive_size: usize,

    /// Job logs larger than this are not parsed, in bytes
    #[serde(default = "default_max_log_size")]
    pub max_log_size: u64,

    /// Logs of older runs were deleted by the platform
    #[serde(default = "default_max_run_age_days")]
    pub max_run_age_days: i64,

    /// A previously extracted command among these forces a reparse
    #[serde(default = "default_reprocess_denylist")]
    pub reprocess_denylist: Vec<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retention: default_retention(),
            max_archive_size: default_max_archive_size(),
            max_log_size: default_max_log_size(),
            max_run_age_days: default_max_run_age_days(),
            reprocess_denylist: default_reprocess_denylist(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct DiscoveryConfig {
    /// Pause between two sweeps over the selected repositories
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Always list the whole history instead of the runs since the latest one stored
    #[serde(default)]
    pub force_scrape_all: bool,

    #[serde(default = "default_max_runs")]
    pub max_runs: usize,

    #[serde(default = "default_history_days")]
    pub history_days: i64,
}

impl DiscoveryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            force_scrape_all: false,
            max_runs: default_max_runs(),
            history_days: default_history_days(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_github_max_attempts() -> usize {
    5
}

fn default_shell_parser_endpoint() -> String {
    "http://bash-command-extractor-api".to_owned()
}

fn default_shell_parser_timeout() -> u64 {
    10
}

fn default_shell_parser_max_attempts() -> u32 {
    3
}

fn default_retention() -> usize {
    5
}

fn default_max_archive_size() -> usize {
    github::client::DEFAULT_MAX_LOGS_SIZE
}

fn default_max_log_size() -> u64 {
    100_000_000
}

fn default_max_run_age_days() -> i64 {
    github::client::DEFAULT_HISTORY_DAYS
}

fn default_reprocess_denylist() -> Vec<String> {
    vec!["npm".to_owned()]
}

fn default_interval_secs() -> u64 {
    300
}

fn default_max_runs() -> usize {
    10_000
}

fn default_history_days() -> i64 {
    github::client::DEFAULT_HISTORY_DAYS
}

#[cfg(test)]
mod test {
    use super::Config;
    use std::path::Path;

    #[test]
    fn defaults() {
        let config = Config::from_toml(
            r#"
            [github]
            tokens = ["a", "b"]
            "#,
        )
        .unwrap();

        assert_eq!(config.store_path(), Path::new("data/store.json"));
        assert_eq!(config.logs_dir(), Path::new("data/logs"));
        assert_eq!(config.github.poll_tokens(), ["a", "b"]);
        assert_eq!(config.github.max_attempts, 5);
        assert_eq!(config.shell_parser.endpoint, "http://bash-command-extractor-api");
        assert_eq!(config.orchestrator.retention, 5);
        assert_eq!(config.orchestrator.max_archive_size, 20_000_000);
        assert_eq!(config.orchestrator.reprocess_denylist, ["npm"]);
        assert_eq!(config.discovery.max_runs, 10_000);
        assert!(!config.discovery.force_scrape_all);
    }

    #[test]
    fn overrides() {
        let config = Config::from_toml(
            r#"
            data_dir = "/srv/scraper"
            repositories = ["octocat/hello-world"]

            [github]
            tokens = ["a", "b"]
            poll_tokens = ["c"]

            [orchestrator]
            retention = 3
            reprocess_denylist = []

            [discovery]
            force_scrape_all = true
            "#,
        )
        .unwrap();

        assert_eq!(config.store_path(), Path::new("/srv/scraper/store.json"));
        assert_eq!(config.github.poll_tokens(), ["c"]);
        assert_eq!(config.orchestrator.retention, 3);
        assert!(config.orchestrator.reprocess_denylist.is_empty());
        assert_eq!(config.orchestrator.max_log_size, 100_000_000);
        assert!(config.discovery.force_scrape_all);
        assert_eq!(config.repositories, ["octocat/hello-world"]);
    }

    #[test]
    fn tokens_are_required() {
        assert!(Config::from_toml("[github]\ntokens = []").is_err());
        assert!(Config::from_toml("data_dir = \"x\"").is_err());
    }
}
