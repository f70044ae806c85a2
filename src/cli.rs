//! Shared CLI helpers and small reusable Clap fragments

use clap::Parser;
use std::path::PathBuf;

/// Daemon options used by skiffd
#[derive(Clone, Debug, Parser)]
pub struct DaemonOpts {
    /// Bind address (host:port)
    #[arg(long, default_value = "0.0.0.0:4000")]
    pub bind: String,

    /// Root directory to serve (created if missing)
    #[arg(long, default_value = "./shared")]
    pub root: PathBuf,

    /// Maximum concurrent sessions
    #[arg(long, default_value_t = 6)]
    pub max_sessions: usize,

    /// Idle timeout in milliseconds before a session is evicted
    #[arg(long, default_value_t = 120_000)]
    pub idle_timeout_ms: u64,

    /// Append-only event log file
    #[arg(long, default_value = "./skiffd.log")]
    pub log_file: PathBuf,

    /// Stats snapshot file, overwritten on every tick
    #[arg(long, default_value = "./skiffd_stats.json")]
    pub stats_file: PathBuf,

    /// Seconds between stats snapshots
    #[arg(long, default_value_t = 30)]
    pub stats_interval_secs: u64,
}

/// Client options used by the interactive skiff binary
#[derive(Clone, Debug, Parser)]
pub struct ClientOpts {
    /// Server address (host:port)
    #[arg(long, default_value = "127.0.0.1:4000")]
    pub server: String,

    /// Username to announce (defaults to user_<pid>)
    #[arg(long)]
    pub username: Option<String>,

    /// Role to request: admin or read
    #[arg(long, default_value = "read")]
    pub role: String,

    /// Directory for downloaded files (created if missing)
    #[arg(long, default_value = "./downloads")]
    pub downloads: PathBuf,
}
