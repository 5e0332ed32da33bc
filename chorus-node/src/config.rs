//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

/// Node configuration. File: ~/.config/chorus/config.toml or /etc/chorus/config.toml.
/// Env overrides: CHORUS_LISTEN_PORT, CHORUS_CYCLE_MS, CHORUS_SEGMENT_TIMEOUT_SECS,
/// CHORUS_PEERS (comma separated), CHORUS_SHARE_DIR, CHORUS_DOWNLOAD_DIR.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// TCP listen port (default 7700). 0 picks an ephemeral port.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Cycle scheduler period in milliseconds (default 200).
    #[serde(default = "default_cycle_interval_ms")]
    pub cycle_interval_ms: u64,
    /// Seconds a peer has to answer a segment request (default 10).
    #[serde(default = "default_segment_timeout_secs")]
    pub segment_timeout_secs: u64,
    /// `host:service` pairs dialled at startup.
    #[serde(default)]
    pub peers: Vec<String>,
    /// Root directory of files served to peers.
    #[serde(default = "default_share_dir")]
    pub share_dir: PathBuf,
    /// Where fetched files are written.
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Segment count asked of serving peers. `None` lets them pick the segment size.
    #[serde(default = "default_segment_count")]
    pub default_segment_count: Option<u32>,
}

fn default_listen_port() -> u16 {
    7700
}
fn default_cycle_interval_ms() -> u64 {
    200
}
fn default_segment_timeout_secs() -> u64 {
    10
}
fn default_share_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_download_dir() -> PathBuf {
    PathBuf::from("./received")
}
fn default_segment_count() -> Option<u32> {
    Some(100)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            cycle_interval_ms: default_cycle_interval_ms(),
            segment_timeout_secs: default_segment_timeout_secs(),
            peers: Vec::new(),
            share_dir: default_share_dir(),
            download_dir: default_download_dir(),
            default_segment_count: default_segment_count(),
        }
    }
}

impl Config {
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.cycle_interval_ms.max(1))
    }

    pub fn segment_timeout(&self) -> Duration {
        Duration::from_secs(self.segment_timeout_secs)
    }

    /// Apply overrides from `lookup` (normally the process environment).
    /// Unparseable values are ignored with a warning.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(p) = parse_var(&lookup, "CHORUS_LISTEN_PORT") {
            self.listen_port = p;
        }
        if let Some(ms) = parse_var(&lookup, "CHORUS_CYCLE_MS") {
            self.cycle_interval_ms = ms;
        }
        if let Some(secs) = parse_var(&lookup, "CHORUS_SEGMENT_TIMEOUT_SECS") {
            self.segment_timeout_secs = secs;
        }
        if let Some(s) = lookup("CHORUS_PEERS") {
            self.peers = s
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(s) = lookup("CHORUS_SHARE_DIR") {
            self.share_dir = PathBuf::from(s);
        }
        if let Some(s) = lookup("CHORUS_DOWNLOAD_DIR") {
            self.download_dir = PathBuf::from(s);
        }
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}

/// Split `host:service` at the last colon. Bracketed IPv6 hosts lose their brackets.
pub fn split_host_service(s: &str) -> Option<(&str, &str)> {
    let (host, service) = s.rsplit_once(':')?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() || service.is_empty() {
        return None;
    }
    Some((host, service))
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> anyhow::Result<Config> {
    let mut c = match config_paths().into_iter().find(|p| p.exists()) {
        Some(path) => load_file(&path)?,
        None => Config::default(),
    };
    c.apply_env(|k| std::env::var(k).ok());
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/chorus/config.toml"));
    }
    out.push(PathBuf::from("/etc/chorus/config.toml"));
    out
}

pub fn load_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let c = toml::from_str::<Config>(&s)
        .with_context(|| format!("parsing config {}", path.display()))?;
    tracing::debug!(path = %path.display(), "loaded config file");
    Ok(c)
}
