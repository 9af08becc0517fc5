use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// Configuration for the whole engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// URL for the WebDriver instance
    #[serde(default = "default_webdriver_url")]
    pub webdriver_url: String,

    /// Upper bound for navigation plus network quiescence
    #[serde(default = "default_navigation_timeout_secs")]
    pub navigation_timeout_secs: u64,

    /// Timeout for fetching robots.txt
    #[serde(default = "default_policy_timeout_secs")]
    pub policy_timeout_secs: u64,

    /// Whether to honor robots.txt blanket disallows
    #[serde(default = "default_true")]
    pub respect_robots: bool,

    /// Admissions allowed per client in any trailing minute
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: usize,

    /// Retry policy for failed crawl attempts
    #[serde(default)]
    pub recovery: RecoveryConfig,

    /// How failures of scheduled jobs are handled
    #[serde(default)]
    pub scheduled_failure_policy: ScheduledFailurePolicy,

    /// User agents rotated across rendering sessions
    #[serde(default = "default_user_agents")]
    pub user_agents: Vec<String>,

    /// JSON file backing the job store (in-memory when unset)
    #[serde(default)]
    pub job_store_path: Option<PathBuf>,

    /// Spans longer than this are reported by maintenance
    #[serde(default = "default_slow_span_threshold_secs")]
    pub slow_span_threshold_secs: f64,

    /// Completed spans older than this are evicted by maintenance
    #[serde(default = "default_metrics_max_age_hours")]
    pub metrics_max_age_hours: u64,
}

/// Bounded-retry settings for the error recovery manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Delay before each retry, indexed by attempt; the last entry repeats
    #[serde(default = "default_retry_delays_secs")]
    pub retry_delays_secs: Vec<u64>,
}

/// What happens when a scheduled run fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduledFailurePolicy {
    /// Record the failure on the job and wait for the next cron tick
    #[default]
    NextTick,
    /// Retry the run through the error recovery manager before giving up
    BoundedRetry,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delays_secs: default_retry_delays_secs(),
        }
    }
}

impl RecoveryConfig {
    /// Delay before retry number `attempt` (zero based)
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let secs = self
            .retry_delays_secs
            .get(attempt)
            .or_else(|| self.retry_delays_secs.last())
            .copied()
            .unwrap_or(0);
        Duration::from_secs(secs)
    }
}

/// Default value for webdriver_url
fn default_webdriver_url() -> String {
    "http://localhost:4444".to_string()
}

/// Longest navigation timeout a request or the engine may ask for
pub const MAX_TIMEOUT_SECS: u64 = 600;

fn default_navigation_timeout_secs() -> u64 {
    30
}

fn default_policy_timeout_secs() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_requests_per_minute() -> usize {
    60
}

fn default_max_retries() -> usize {
    3
}

fn default_retry_delays_secs() -> Vec<u64> {
    vec![5, 15, 30]
}

fn default_slow_span_threshold_secs() -> f64 {
    1.0
}

fn default_metrics_max_age_hours() -> u64 {
    24
}

/// Desktop browser identities rotated per session
fn default_user_agents() -> Vec<String> {
    vec![
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36".to_string(),
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36".to_string(),
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:89.0) Gecko/20100101 Firefox/89.0".to_string(),
    ]
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            webdriver_url: default_webdriver_url(),
            navigation_timeout_secs: default_navigation_timeout_secs(),
            policy_timeout_secs: default_policy_timeout_secs(),
            respect_robots: true,
            requests_per_minute: default_requests_per_minute(),
            recovery: RecoveryConfig::default(),
            scheduled_failure_policy: ScheduledFailurePolicy::default(),
            user_agents: default_user_agents(),
            job_store_path: None,
            slow_span_threshold_secs: default_slow_span_threshold_secs(),
            metrics_max_age_hours: default_metrics_max_age_hours(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;

        Self::from_json(&contents)
    }

    /// Load configuration from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Override the WebDriver URL with an environment variable if provided
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(webdriver_url) = std::env::var("WEBDRIVER_URL") {
            if !webdriver_url.is_empty() {
                self.webdriver_url = webdriver_url;
            }
        }
        self
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.requests_per_minute == 0 {
            return Err(Error::Validation(
                "requests_per_minute must be at least 1".into(),
            ));
        }
        if !(1..=MAX_TIMEOUT_SECS).contains(&self.navigation_timeout_secs) {
            return Err(Error::Validation(format!(
                "navigation_timeout_secs must be between 1 and {}",
                MAX_TIMEOUT_SECS
            )));
        }
        if self.user_agents.is_empty() {
            return Err(Error::Validation("user_agents must not be empty".into()));
        }
        if self.recovery.max_retries > 0 && self.recovery.retry_delays_secs.is_empty() {
            return Err(Error::Validation(
                "retry_delays_secs must not be empty when retries are enabled".into(),
            ));
        }
        Ok(())
    }

    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_secs(self.navigation_timeout_secs)
    }

    pub fn policy_timeout(&self) -> Duration {
        Duration::from_secs(self.policy_timeout_secs)
    }
}

/// Extraction modes supported by the executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlMode {
    Headless,
    Structured,
    ApiDiscovery,
}

impl CrawlMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrawlMode::Headless => "headless",
            CrawlMode::Structured => "structured",
            CrawlMode::ApiDiscovery => "api_discovery",
        }
    }
}

impl fmt::Display for CrawlMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CrawlMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "headless" => Ok(CrawlMode::Headless),
            "structured" => Ok(CrawlMode::Structured),
            "api_discovery" => Ok(CrawlMode::ApiDiscovery),
            other => Err(Error::Validation(format!("unknown crawl mode: {}", other))),
        }
    }
}

/// Options for headless mode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeadlessOptions {
    /// Capture a screenshot of the rendered page
    #[serde(default = "default_true")]
    pub screenshot: bool,

    /// Per-request navigation timeout override
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for HeadlessOptions {
    fn default() -> Self {
        Self {
            screenshot: true,
            timeout_secs: None,
        }
    }
}

/// Options for structured mode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StructuredOptions {
    /// Collect `<meta name>` pairs
    #[serde(default = "default_true")]
    pub meta_tags: bool,

    /// Collect Open Graph properties
    #[serde(default = "default_true")]
    pub open_graph: bool,

    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for StructuredOptions {
    fn default() -> Self {
        Self {
            meta_tags: true,
            open_graph: true,
            timeout_secs: None,
        }
    }
}

/// Options for api discovery mode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiDiscoveryOptions {
    /// Request types reported as API calls
    #[serde(default = "default_api_resource_types")]
    pub resource_types: Vec<String>,

    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_api_resource_types() -> Vec<String> {
    vec!["xmlhttprequest".to_string(), "fetch".to_string()]
}

impl Default for ApiDiscoveryOptions {
    fn default() -> Self {
        Self {
            resource_types: default_api_resource_types(),
            timeout_secs: None,
        }
    }
}

/// Mode selection together with the options recognized by that mode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ModeOptions {
    Headless(HeadlessOptions),
    Structured(StructuredOptions),
    ApiDiscovery(ApiDiscoveryOptions),
}

impl Default for ModeOptions {
    fn default() -> Self {
        ModeOptions::Headless(HeadlessOptions::default())
    }
}

impl ModeOptions {
    /// Build mode options from a mode and a free-form JSON object, rejecting unknown keys
    pub fn from_parts(mode: CrawlMode, options: Option<serde_json::Value>) -> Result<Self> {
        let mut map = match options {
            None | Some(serde_json::Value::Null) => serde_json::Map::new(),
            Some(serde_json::Value::Object(map)) => map,
            Some(other) => {
                return Err(Error::Validation(format!(
                    "options must be a JSON object, got {}",
                    other
                )));
            }
        };
        if map.contains_key("mode") {
            return Err(Error::Validation("options must not contain `mode`".into()));
        }
        map.insert(
            "mode".to_string(),
            serde_json::Value::String(mode.as_str().to_string()),
        );
        let options: Self = serde_json::from_value(serde_json::Value::Object(map))
            .map_err(|e| Error::Validation(format!("invalid {} options: {}", mode, e)))?;
        options.validate()?;
        Ok(options)
    }

    pub fn mode(&self) -> CrawlMode {
        match self {
            ModeOptions::Headless(_) => CrawlMode::Headless,
            ModeOptions::Structured(_) => CrawlMode::Structured,
            ModeOptions::ApiDiscovery(_) => CrawlMode::ApiDiscovery,
        }
    }

    /// Reject options no crawl can run with
    pub fn validate(&self) -> Result<()> {
        match self.timeout_secs() {
            Some(secs) if !(1..=MAX_TIMEOUT_SECS).contains(&secs) => Err(Error::Validation(format!(
                "timeout_secs must be between 1 and {}, got {}",
                MAX_TIMEOUT_SECS, secs
            ))),
            _ => Ok(()),
        }
    }

    fn timeout_secs(&self) -> Option<u64> {
        match self {
            ModeOptions::Headless(o) => o.timeout_secs,
            ModeOptions::Structured(o) => o.timeout_secs,
            ModeOptions::ApiDiscovery(o) => o.timeout_secs,
        }
    }
}

/// A single crawl: target URL plus extraction mode and options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlRequest {
    pub url: Url,

    #[serde(default)]
    pub options: ModeOptions,
}

impl CrawlRequest {
    pub fn new(url: Url, options: ModeOptions) -> Self {
        Self { url, options }
    }

    /// Parse the URL and build the request, accepting only http(s) targets
    pub fn parse(url: &str, options: ModeOptions) -> Result<Self> {
        let url = Url::parse(url)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::Validation(format!(
                "unsupported URL scheme: {}",
                url.scheme()
            )));
        }
        options.validate()?;
        Ok(Self::new(url, options))
    }

    pub fn mode(&self) -> CrawlMode {
        self.options.mode()
    }

    /// Navigation timeout for this request, falling back to `default`
    pub fn timeout(&self, default: Duration) -> Duration {
        self.options
            .timeout_secs()
            .map(|secs| Duration::from_secs(secs.clamp(1, MAX_TIMEOUT_SECS)))
            .unwrap_or(default)
    }
}
