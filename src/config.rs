//! Runtime configuration, assembled from command-line flags and environment.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, ValueEnum};

use crate::cache::{CachePaths, DEFAULT_LOCK_TIMEOUT};
use crate::upstream::Endpoints;

/// How snapshots are kept on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Layout {
    /// `<branch>.zip`, served as-is
    Zip,
    /// Extracted `<branch>/` trees
    Dir,
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layout::Zip => write!(f, "zip"),
            Layout::Dir => write!(f, "dir"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub cache_dir: PathBuf,
    /// Identity used when a request names no user.
    pub default_user: String,
    pub layout: Layout,
    /// Snapshots not read for this long are evicted.
    pub ttl: Duration,
    pub sweep_interval: Duration,
    pub workers: usize,
    pub lock_timeout: Duration,
    pub request_timeout: Duration,
    pub endpoints: Endpoints,
    /// Token for upstream calls when a request carries none.
    pub default_token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            cache_dir: CachePaths::default().root().to_path_buf(),
            default_user: "default".to_string(),
            layout: Layout::Zip,
            ttl: Duration::from_secs(7 * 24 * 60 * 60),
            sweep_interval: Duration::from_secs(10 * 60),
            workers: 8,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            request_timeout: Duration::from_secs(10 * 60),
            endpoints: Endpoints::default(),
            default_token: None,
        }
    }
}

/// `GITHUB_TOKEN`, falling back to `GH_TOKEN`.
pub fn token_from_env() -> Option<String> {
    ["GITHUB_TOKEN", "GH_TOKEN"]
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
}

/// Flags shared by every command that opens the cache.
#[derive(Debug, Clone, Args)]
pub struct CacheArgs {
    /// Cache root (default: the platform cache dir + "ghmirror")
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Snapshot layout
    #[arg(long, value_enum, default_value_t = Layout::Zip)]
    pub layout: Layout,

    /// Seconds to wait for another request working on the same key
    #[arg(long, default_value_t = 300)]
    pub lock_timeout_secs: u64,

    /// GitHub REST API base URL
    #[arg(long)]
    pub api_base: Option<String>,

    /// Archive download base URL
    #[arg(long)]
    pub codeload_base: Option<String>,

    /// Git remote base URL for mirrors
    #[arg(long)]
    pub git_base: Option<String>,
}

impl CacheArgs {
    pub fn apply(&self, config: &mut Config) {
        if let Some(dir) = &self.cache_dir {
            config.cache_dir = dir.clone();
        }
        config.layout = self.layout;
        config.lock_timeout = Duration::from_secs(self.lock_timeout_secs);
        if let Some(base) = &self.api_base {
            config.endpoints.api_base = base.trim_end_matches('/').to_string();
        }
        if let Some(base) = &self.codeload_base {
            config.endpoints.codeload_base = base.trim_end_matches('/').to_string();
        }
        if let Some(base) = &self.git_base {
            config.endpoints.git_base = base.trim_end_matches('/').to_string();
        }
        config.default_token = token_from_env();
    }

    pub fn to_config(&self) -> Config {
        let mut config = Config::default();
        self.apply(&mut config);
        config
    }
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub listen: String,

    /// User namespace for requests that name none
    #[arg(long, default_value = "default")]
    pub default_user: String,

    /// Evict snapshots not read for this many seconds
    #[arg(long, default_value_t = 7 * 24 * 60 * 60)]
    pub ttl_secs: u64,

    /// Seconds between janitor sweeps
    #[arg(long, default_value_t = 600)]
    pub sweep_interval_secs: u64,

    /// Request handling threads
    #[arg(long, default_value_t = 8)]
    pub workers: usize,

    /// Per-request deadline in seconds
    #[arg(long, default_value_t = 600)]
    pub request_timeout_secs: u64,

    #[command(flatten)]
    pub cache: CacheArgs,
}

impl ServeArgs {
    pub fn to_config(&self) -> Config {
        let mut config = self.cache.to_config();
        config.listen = self.listen.clone();
        config.default_user = self.default_user.clone();
        config.ttl = Duration::from_secs(self.ttl_secs);
        config.sweep_interval = Duration::from_secs(self.sweep_interval_secs.max(1));
        config.workers = self.workers.max(1);
        config.request_timeout = Duration::from_secs(self.request_timeout_secs);
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Wrapper {
        #[command(flatten)]
        serve: ServeArgs,
    }

    #[test]
    fn serve_defaults() {
        let config = Wrapper::parse_from(["ghmirror"]).serve.to_config();
        assert_eq!(config.listen, "127.0.0.1:8080");
        assert_eq!(config.default_user, "default");
        assert_eq!(config.layout, Layout::Zip);
        assert_eq!(config.ttl, Duration::from_secs(604_800));
        assert_eq!(config.sweep_interval, Duration::from_secs(600));
        assert_eq!(config.lock_timeout, Duration::from_secs(300));
        assert_eq!(config.workers, 8);
        assert!(config.cache_dir.ends_with("ghmirror"));
    }

    #[test]
    fn serve_overrides() {
        let config = Wrapper::parse_from([
            "ghmirror",
            "--layout",
            "dir",
            "--cache-dir",
            "/srv/cache",
            "--workers",
            "0",
            "--api-base",
            "http://127.0.0.1:9000/",
        ])
        .serve
        .to_config();
        assert_eq!(config.layout, Layout::Dir);
        assert_eq!(config.cache_dir, PathBuf::from("/srv/cache"));
        assert_eq!(config.workers, 1);
        assert_eq!(config.endpoints.api_base, "http://127.0.0.1:9000");
    }

    #[test]
    fn layout_names() {
        assert_eq!(Layout::Zip.to_string(), "zip");
        assert_eq!(Layout::Dir.to_string(), "dir");
    }
}
