//! Load config from file and environment.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ipmsg_core::{CenterConfig, RefuseRule, DEFAULT_PORT};
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/ipmsg/config.toml or /etc/ipmsg/config.toml.
/// Env overrides: IPMSG_PORT, IPMSG_USER_NAME, IPMSG_GROUP_NAME, IPMSG_DOWNLOAD_DIR,
/// IPMSG_LOG_FILE.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// UDP and TCP port (default 2425).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Login name; defaults to $USER.
    #[serde(default = "default_login_name")]
    pub login_name: String,
    /// Host name; defaults to $HOSTNAME or /etc/hostname.
    #[serde(default = "default_host_name")]
    pub host_name: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub group_name: String,
    #[serde(default = "default_broadcast")]
    pub broadcast: Vec<IpAddr>,
    #[serde(default)]
    pub dialup: bool,
    /// Seconds between resends.
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,
    #[serde(default = "default_retry_ceiling")]
    pub retry_ceiling: u32,
    #[serde(default = "default_absence_message")]
    pub absence_message: String,
    /// Where downloaded attachments are saved.
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// JSON-lines message log; disabled when unset.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    /// Run without encryption even if key generation would succeed.
    #[serde(default)]
    pub disable_encryption: bool,
    #[serde(default)]
    pub refuse: Vec<RefuseRule>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_login_name() -> String {
    std::env::var("USER").unwrap_or_else(|_| "ipmsg".into())
}
fn default_host_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".into())
}
fn default_broadcast() -> Vec<IpAddr> {
    vec![IpAddr::from([255, 255, 255, 255])]
}
fn default_retry_interval() -> u64 {
    1
}
fn default_retry_ceiling() -> u32 {
    3
}
fn default_absence_message() -> String {
    CenterConfig::default().absence_message
}
fn default_download_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(|h| PathBuf::from(h).join("Downloads"))
        .unwrap_or_else(|| PathBuf::from("."))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            login_name: default_login_name(),
            host_name: default_host_name(),
            user_name: String::new(),
            group_name: String::new(),
            broadcast: default_broadcast(),
            dialup: false,
            retry_interval_secs: default_retry_interval(),
            retry_ceiling: default_retry_ceiling(),
            absence_message: default_absence_message(),
            download_dir: default_download_dir(),
            log_file: None,
            disable_encryption: false,
            refuse: Vec::new(),
        }
    }
}

impl Config {
    /// Engine configuration derived from the daemon settings.
    pub fn center(&self) -> CenterConfig {
        CenterConfig {
            login_name: self.login_name.clone(),
            host_name: self.host_name.clone(),
            user_name: self.user_name.clone(),
            group_name: self.group_name.clone(),
            port: self.port,
            broadcast_addresses: self.broadcast.clone(),
            dialup: self.dialup,
            refuse: self.refuse.clone(),
            retry_interval: Duration::from_secs(self.retry_interval_secs.max(1)),
            retry_ceiling: self.retry_ceiling,
            absence_message: self.absence_message.clone(),
            version: format!("ipmsg-linux {}", env!("CARGO_PKG_VERSION")),
            ..CenterConfig::default()
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> anyhow::Result<Config> {
    let mut c = match config_paths().into_iter().find(|p| p.exists()) {
        Some(path) => load_file(&path)?,
        None => Config::default(),
    };
    apply_env(&mut c, |k| std::env::var(k).ok());
    Ok(c)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = var("IPMSG_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.port = p;
    }
    if let Some(s) = var("IPMSG_USER_NAME") {
        c.user_name = s;
    }
    if let Some(s) = var("IPMSG_GROUP_NAME") {
        c.group_name = s;
    }
    if let Some(s) = var("IPMSG_DOWNLOAD_DIR") {
        c.download_dir = PathBuf::from(s);
    }
    if let Some(s) = var("IPMSG_LOG_FILE") {
        c.log_file = Some(PathBuf::from(s));
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/ipmsg/config.toml"));
    }
    out.push(PathBuf::from("/etc/ipmsg/config.toml"));
    out
}

fn load_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)?;
    toml::from_str::<Config>(&s).map_err(|e| anyhow::anyhow!("{}: {e}", path.display()))
}
