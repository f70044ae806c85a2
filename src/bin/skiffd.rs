use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;

use skiff::cli::DaemonOpts;
use skiff::logger::TextLogger;
use skiff::server::{Server, ServerConfig};

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();

    // Bootstrap and validate the served directory
    if !opts.root.exists() {
        std::fs::create_dir_all(&opts.root)
            .with_context(|| format!("create root directory {}", opts.root.display()))?;
    }
    if !opts.root.is_dir() {
        anyhow::bail!("Error: Root path is not a directory: {}", opts.root.display());
    }

    // Canonicalize the path for better logging
    let canonical_root = std::fs::canonicalize(&opts.root)
        .with_context(|| format!("Failed to canonicalize root path: {}", opts.root.display()))?;

    println!("Starting skiff daemon:");
    println!("  Root: {}", canonical_root.display());
    println!("  Bind: {}", opts.bind);
    println!("  Max sessions: {}", opts.max_sessions);
    println!("  Idle timeout: {} ms", opts.idle_timeout_ms);
    println!("  Log: {}", opts.log_file.display());
    println!("  Stats: {}", opts.stats_file.display());

    if opts.bind.starts_with("0.0.0.0") {
        eprintln!("WARNING: Binding to 0.0.0.0 exposes the daemon to all network interfaces");
        eprintln!("   This protocol is unencrypted and roles are self-declared");
        eprintln!("   Only use on trusted networks (LAN)");
    }

    let log = Arc::new(TextLogger::new(&opts.log_file).context("open log file")?);

    let cfg = ServerConfig {
        bind: opts.bind.clone(),
        root: canonical_root,
        max_sessions: opts.max_sessions,
        idle_timeout: Duration::from_millis(opts.idle_timeout_ms),
        stats_interval: Duration::from_secs(opts.stats_interval_secs),
        stats_path: Some(opts.stats_file.clone()),
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(Server::new(cfg, log).run())
}
