//! Daemon configuration: TOML file layered under command-line flags

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cli::DaemonOpts;
use crate::connection::Role;
use crate::protocol::{MIRROR_PORT, PRIMARY_PORT};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub bind: String,
    /// Root of the served tree; `None` means the invoking user's home
    pub home: Option<PathBuf>,
    pub role: Role,
    pub mirror_host: String,
    pub mirror_port: u16,
    /// Where transient archives are spooled; `None` means the system temp dir
    pub spool_dir: Option<PathBuf>,
    /// 0 disables the idle timeout
    pub idle_timeout_secs: u64,
    pub log_file: Option<PathBuf>,
    pub log_level: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: format!("0.0.0.0:{}", PRIMARY_PORT),
            home: None,
            role: Role::Primary,
            mirror_host: "localhost".to_string(),
            mirror_port: MIRROR_PORT,
            spool_dir: None,
            idle_timeout_secs: 0,
            log_file: None,
            log_level: None,
        }
    }
}

impl ServerConfig {
    pub fn from_toml_str(data: &str) -> Result<Self> {
        toml::from_str(data).context("parse daemon config")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&data).with_context(|| format!("in {}", path.display()))
    }

    /// Config file (if any) with explicit flags applied on top
    pub fn from_opts(opts: &DaemonOpts) -> Result<Self> {
        let mut cfg = match &opts.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        cfg.apply(opts);
        Ok(cfg)
    }

    fn apply(&mut self, opts: &DaemonOpts) {
        if let Some(bind) = &opts.bind {
            self.bind = bind.clone();
        }
        if let Some(home) = &opts.home {
            self.home = Some(home.clone());
        }
        if let Some(role) = opts.role {
            self.role = role;
        }
        if let Some(host) = &opts.mirror_host {
            self.mirror_host = host.clone();
        }
        if let Some(port) = opts.mirror_port {
            self.mirror_port = port;
        }
        if let Some(dir) = &opts.spool_dir {
            self.spool_dir = Some(dir.clone());
        }
        if let Some(secs) = opts.idle_timeout_secs {
            self.idle_timeout_secs = secs;
        }
        if let Some(file) = &opts.log_file {
            self.log_file = Some(file.clone());
        }
        if let Some(level) = &opts.log_level {
            self.log_level = Some(level.clone());
        }
    }

    /// Canonical served root; must exist and be a directory
    pub fn resolve_home(&self) -> Result<PathBuf> {
        let home = match &self.home {
            Some(h) => h.clone(),
            None => dirs::home_dir().context("cannot determine the user's home directory")?,
        };
        if !home.is_dir() {
            anyhow::bail!("home is not a directory: {}", home.display());
        }
        std::fs::canonicalize(&home)
            .with_context(|| format!("canonicalize home {}", home.display()))
    }

    pub fn resolve_spool_dir(&self) -> PathBuf {
        self.spool_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}
