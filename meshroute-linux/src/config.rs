//! Load config from file and environment.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use meshroute_core::RawId;
use serde::Deserialize;

/// Daemon configuration. File: `--config PATH`, else ~/.config/meshroute/config.toml
/// or /etc/meshroute/config.toml.
/// Env overrides: MESHROUTE_LISTEN, MESHROUTE_REMOTES (comma separated),
/// MESHROUTE_GROUP, MESHROUTE_SHARDS, MESHROUTE_NODE_KEY, MESHROUTE_LOG.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Addresses this node listens on and announces, in announcement order.
    /// Peers must be configured with the same number of addresses.
    #[serde(default = "default_listen")]
    pub listen: Vec<SocketAddr>,
    /// Group this node belongs to (default 1).
    #[serde(default = "default_group")]
    pub group_id: u32,
    /// Node id is the SHA-512 of this key; random per start when unset.
    #[serde(default)]
    pub node_key: Option<String>,
    #[serde(default)]
    pub indexes_shard_count: u32,
    /// Peers to look up and join at startup.
    #[serde(default)]
    pub remotes: Vec<SocketAddr>,
    /// Seconds between reconnect attempts to a remote (default 5).
    #[serde(default = "default_reconnect_secs")]
    pub reconnect_secs: u64,
    /// Largest accepted payload in bytes (default 16 MiB).
    #[serde(default = "default_max_payload")]
    pub max_payload: u64,
    /// Highest backend id accepted from peers; unlimited when unset.
    #[serde(default)]
    pub max_backend_id: Option<u32>,
    /// Tracing filter directive (default "info"); RUST_LOG wins when set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

/// One local backend. Its ids are the explicit `ids`, then one per `keys` entry
/// (SHA-512 of the key), then `random_ids` fresh random ids.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    pub backend_id: u32,
    #[serde(default = "default_group")]
    pub group_id: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub ids: Vec<RawId>,
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub random_ids: usize,
}

impl BackendConfig {
    pub fn resolve_ids(&self) -> Vec<RawId> {
        let mut out = Vec::with_capacity(self.ids.len() + self.keys.len() + self.random_ids);
        out.extend_from_slice(&self.ids);
        out.extend(self.keys.iter().map(|k| RawId::from_key(k.as_bytes())));
        out.extend((0..self.random_ids).map(|_| RawId::random()));
        out
    }
}

fn default_listen() -> Vec<SocketAddr> {
    vec![SocketAddr::from(([127, 0, 0, 1], 1025))]
}
fn default_group() -> u32 {
    1
}
fn default_reconnect_secs() -> u64 {
    5
}
fn default_max_payload() -> u64 {
    16 * 1024 * 1024
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_enabled() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            group_id: default_group(),
            node_key: None,
            indexes_shard_count: 0,
            remotes: Vec::new(),
            reconnect_secs: default_reconnect_secs(),
            max_payload: default_max_payload(),
            max_backend_id: None,
            log_level: default_log_level(),
            backends: Vec::new(),
        }
    }
}

impl Config {
    pub fn node_id(&self) -> RawId {
        match &self.node_key {
            Some(key) => RawId::from_key(key.as_bytes()),
            None => RawId::random(),
        }
    }
}

/// Load config: default, then config file, then env vars.
/// An explicit path must exist and parse; the search paths are optional.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(p) => load_file(p)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(p) => load_file(&p)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |k| std::env::var(k).ok())?;
    validate(&c)?;
    Ok(c)
}

/// Listen addresses are announced to peers, so each must be one they can dial.
fn validate(c: &Config) -> anyhow::Result<()> {
    if let Some(a) = c.listen.iter().find(|a| a.ip().is_unspecified()) {
        anyhow::bail!("listen address {} is unspecified; configure the concrete address peers reach", a);
    }
    Ok(())
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
    if let Some(s) = var("MESHROUTE_LISTEN") {
        c.listen = parse_addrs(&s).context("MESHROUTE_LISTEN")?;
    }
    if let Some(s) = var("MESHROUTE_REMOTES") {
        c.remotes = parse_addrs(&s).context("MESHROUTE_REMOTES")?;
    }
    if let Some(s) = var("MESHROUTE_GROUP") {
        c.group_id = s.trim().parse().context("MESHROUTE_GROUP")?;
    }
    if let Some(s) = var("MESHROUTE_SHARDS") {
        c.indexes_shard_count = s.trim().parse().context("MESHROUTE_SHARDS")?;
    }
    if let Some(s) = var("MESHROUTE_NODE_KEY") {
        c.node_key = Some(s);
    }
    if let Some(s) = var("MESHROUTE_LOG") {
        c.log_level = s;
    }
    Ok(())
}

fn parse_addrs(s: &str) -> anyhow::Result<Vec<SocketAddr>> {
    s.split(',')
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(|a| a.parse().with_context(|| format!("bad address {:?}", a)))
        .collect()
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/meshroute/config.toml"));
    }
    out.push(PathBuf::from("/etc/meshroute/config.toml"));
    out
}

fn load_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing {}", path.display()))
}
