//! Shared CLI helpers and small reusable Clap fragments

use clap::Parser;
use std::path::PathBuf;

use crate::connection::Role;
use crate::protocol::PRIMARY_PORT;

/// Daemon options for treefetchd; unset flags fall back to the config file, then defaults
#[derive(Clone, Debug, Default, Parser)]
#[command(author, version, about = "Serve filtered archives of a home directory")]
pub struct DaemonOpts {
    /// TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Bind address (host:port) [default: 0.0.0.0:65001]
    #[arg(long)]
    pub bind: Option<String>,

    /// Directory tree to serve [default: the invoking user's home]
    #[arg(long)]
    pub home: Option<PathBuf>,

    /// Whether this instance redirects overflow (primary) or only serves (mirror)
    #[arg(long, value_enum)]
    pub role: Option<Role>,

    /// Host announced in redirects [default: localhost]
    #[arg(long)]
    pub mirror_host: Option<String>,

    /// Port announced in redirects [default: 65002]
    #[arg(long)]
    pub mirror_port: Option<u16>,

    /// Directory for transient archive files [default: system temp dir]
    #[arg(long)]
    pub spool_dir: Option<PathBuf>,

    /// Close sessions idle for this many seconds (0 disables)
    #[arg(long)]
    pub idle_timeout_secs: Option<u64>,

    /// Append log lines to this file instead of stderr
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Client options for the interactive treefetch shell
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "Request filtered archives from a treefetch daemon")]
pub struct ClientOpts {
    /// Server host
    #[arg(long, default_value = "localhost")]
    pub host: String,

    /// Server port
    #[arg(long, default_value_t = PRIMARY_PORT)]
    pub port: u16,

    /// Where received archives are stored and extracted
    #[arg(long, default_value = ".")]
    pub download_dir: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long)]
    pub log_level: Option<String>,
}
