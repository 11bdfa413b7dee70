//! Load config from file and environment.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use meshchat_core::discovery::DEFAULT_MAX_DIAL_FAILURES;
use meshchat_core::seen::{DEFAULT_SEEN_CAPACITY, DEFAULT_SEEN_MAX_AGE};

/// Node configuration. File: ~/.config/meshchat/config.toml or /etc/meshchat/config.toml.
/// Env overrides: MESHCHAT_LISTEN_PORT, MESHCHAT_BIND_HOST, MESHCHAT_NICKNAME.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// TCP listen port (default 5000).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Address to bind the listener on (default 0.0.0.0).
    #[serde(default = "default_bind_host")]
    pub bind_host: IpAddr,
    /// Display name; a name derived from the node ID is used when unset.
    #[serde(default)]
    pub nickname: Option<String>,
    /// Peers dialed at start-up.
    #[serde(default)]
    pub peers: Vec<SocketAddr>,
    /// Where the binary saves received files; files are only reported when unset.
    #[serde(default)]
    pub download_dir: Option<PathBuf>,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    #[serde(default = "default_seen_capacity")]
    pub seen_capacity: usize,
    #[serde(default = "default_seen_max_age_secs")]
    pub seen_max_age_secs: u64,
    #[serde(default = "default_max_dial_failures")]
    pub max_dial_failures: u32,
}

fn default_listen_port() -> u16 {
    5000
}
fn default_bind_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_handshake_timeout_ms() -> u64 {
    5_000
}
fn default_dial_timeout_ms() -> u64 {
    10_000
}
fn default_seen_capacity() -> usize {
    DEFAULT_SEEN_CAPACITY
}
fn default_seen_max_age_secs() -> u64 {
    DEFAULT_SEEN_MAX_AGE.as_secs()
}
fn default_max_dial_failures() -> u32 {
    DEFAULT_MAX_DIAL_FAILURES
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            bind_host: default_bind_host(),
            nickname: None,
            peers: Vec::new(),
            download_dir: None,
            handshake_timeout_ms: default_handshake_timeout_ms(),
            dial_timeout_ms: default_dial_timeout_ms(),
            seen_capacity: default_seen_capacity(),
            seen_max_age_secs: default_seen_max_age_secs(),
            max_dial_failures: default_max_dial_failures(),
        }
    }
}

impl Config {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn seen_max_age(&self) -> Duration {
        Duration::from_secs(self.seen_max_age_secs)
    }

    fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(s) = var("MESHCHAT_LISTEN_PORT") {
            match s.parse::<u16>() {
                Ok(p) => self.listen_port = p,
                Err(e) => tracing::warn!(value = %s, error = %e, "ignoring MESHCHAT_LISTEN_PORT"),
            }
        }
        if let Some(s) = var("MESHCHAT_BIND_HOST") {
            match s.parse::<IpAddr>() {
                Ok(h) => self.bind_host = h,
                Err(e) => tracing::warn!(value = %s, error = %e, "ignoring MESHCHAT_BIND_HOST"),
            }
        }
        if let Some(s) = var("MESHCHAT_NICKNAME") {
            let s = s.trim();
            if !s.is_empty() {
                self.nickname = Some(s.to_string());
            }
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file(&config_paths()).unwrap_or_default();
    c.apply_env(|k| std::env::var(k).ok());
    c
}

/// Load from an explicit path, then apply env vars.
pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
    let mut c = parse_file(path)?;
    c.apply_env(|k| std::env::var(k).ok());
    Ok(c)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/meshchat/config.toml"));
    }
    out.push(PathBuf::from("/etc/meshchat/config.toml"));
    out
}

fn parse_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str::<Config>(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn load_file(paths: &[PathBuf]) -> Option<Config> {
    let path = paths.iter().find(|p| p.exists())?;
    match parse_file(path) {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!(error = %e, "using default config");
            None
        }
    }
}
