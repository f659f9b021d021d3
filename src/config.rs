use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Environment variable that replaces `upstream.api_url` when set.
pub const API_URL_ENV: &str = "GITHUB_API_BASE_URL";

/// Config file read when `--config` is not given.  It may be absent.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/forgeauth/config.yaml";

/// Longest accepted `cache.ttl`: one year.
const MAX_CACHE_TTL_SECS: u64 = 365 * 24 * 60 * 60;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Organisation whose members are authorised.  May be supplied with
    /// `--org` instead of in the file.
    #[serde(default)]
    pub org: String,
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            org: String::new(),
            listen: default_listen(),
            upstream: UpstreamConfig::default(),
            cache: CacheConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Upstream
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the GitHub REST API.
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_api_url() -> String {
    "https://api.github.com".to_string()
}

fn default_user_agent() -> String {
    concat!("forgeauth/", env!("CARGO_PKG_VERSION")).to_string()
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            user_agent: default_user_agent(),
        }
    }
}

// ---------------------------------------------------------------------------
// Result cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Lifetime of a cached validation result in seconds.  0 disables the
    /// cache.
    #[serde(default = "default_cache_ttl")]
    pub ttl: u64,
    /// Maximum number of cached results.
    #[serde(default = "default_cache_max_size")]
    pub max_size: usize,
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_cache_max_size() -> usize {
    1000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: default_cache_ttl(),
            max_size: default_cache_max_size(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl)
    }
}

// ---------------------------------------------------------------------------
// Auth policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Refuse classic (non fine-grained) personal access tokens.
    #[serde(default = "default_reject_classic_pats")]
    pub reject_classic_pats: bool,
    /// Deadline in seconds for one validation, upstream calls included.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
}

fn default_reject_classic_pats() -> bool {
    true
}

fn default_request_timeout() -> u64 {
    10
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            reject_classic_pats: default_reject_classic_pats(),
            request_timeout: default_request_timeout(),
        }
    }
}

impl AuthConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Values given on the command line, which take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub org: Option<String>,
    pub listen: Option<String>,
    pub api_url: Option<String>,
    pub cache_ttl: Option<u64>,
    pub cache_max_size: Option<usize>,
    pub reject_classic_pats: Option<bool>,
}

impl ConfigOverrides {
    /// Take `api_url` from [`API_URL_ENV`] when it is set and non-blank.
    pub fn with_env(mut self) -> Self {
        if let Some(url) = std::env::var(API_URL_ENV).ok().filter(|v| !v.trim().is_empty()) {
            self.api_url = Some(url);
        }
        self
    }
}

impl Config {
    fn apply(&mut self, overrides: ConfigOverrides) {
        if let Some(org) = overrides.org {
            self.org = org;
        }
        if let Some(listen) = overrides.listen {
            self.listen = listen;
        }
        if let Some(api_url) = overrides.api_url {
            self.upstream.api_url = api_url;
        }
        if let Some(ttl) = overrides.cache_ttl {
            self.cache.ttl = ttl;
        }
        if let Some(max_size) = overrides.cache_max_size {
            self.cache.max_size = max_size;
        }
        if let Some(reject) = overrides.reject_classic_pats {
            self.auth.reject_classic_pats = reject;
        }
        self.upstream.api_url = self.upstream.api_url.trim_end_matches('/').to_string();
    }
}

pub fn load_config<P: AsRef<Path>>(path: P, overrides: ConfigOverrides) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config = parse_config(&contents, overrides)
        .with_context(|| format!("invalid config file: {}", path.display()))?;
    Ok(config)
}

/// Like [`load_config`], but a missing file means "all defaults".
///
/// Used for [`DEFAULT_CONFIG_PATH`] so that the service can run on flags
/// alone.
pub fn load_config_if_present<P: AsRef<Path>>(path: P, overrides: ConfigOverrides) -> Result<Config> {
    let path = path.as_ref();
    match std::fs::read_to_string(path) {
        Ok(contents) => parse_config(&contents, overrides)
            .with_context(|| format!("invalid config file: {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            parse_config("", overrides).context("invalid command-line configuration")
        }
        Err(e) => {
            Err(e).with_context(|| format!("failed to read config file: {}", path.display()))
        }
    }
}

/// Parse YAML, apply `overrides` and validate.
pub fn parse_config(contents: &str, overrides: ConfigOverrides) -> Result<Config> {
    // An empty document deserialises as null, not as an empty mapping.
    let mut config: Config = if contents.trim().is_empty() {
        Config::default()
    } else {
        serde_yaml::from_str(contents).context("failed to parse YAML")?
    };
    config.apply(overrides);
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        !config.org.trim().is_empty(),
        "org is required (set it in the config file or pass --org)"
    );
    config
        .listen
        .parse::<SocketAddr>()
        .with_context(|| format!("listen address is not a socket address: {}", config.listen))?;
    anyhow::ensure!(
        config.upstream.api_url.starts_with("http://") || config.upstream.api_url.starts_with("https://"),
        "upstream.api_url must be an http(s) URL, got {}",
        config.upstream.api_url
    );
    anyhow::ensure!(
        config.cache.ttl <= MAX_CACHE_TTL_SECS,
        "cache.ttl must be at most {MAX_CACHE_TTL_SECS} seconds, got {}",
        config.cache.ttl
    );
    anyhow::ensure!(config.cache.max_size > 0, "cache.max_size must be positive");
    anyhow::ensure!(config.auth.request_timeout > 0, "auth.request_timeout must be positive");
    Ok(())
}
