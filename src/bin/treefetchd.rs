use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use treefetch::cli::DaemonOpts;
use treefetch::config::ServerConfig;
use treefetch::connection::Role;
use treefetch::logger;
use treefetch::server::Server;

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();
    let config = ServerConfig::from_opts(&opts)?;

    logger::init(
        config.log_level.as_deref(),
        config.log_file.as_deref(),
        log::Level::Info,
    )?;

    let home = config.resolve_home()?;

    println!("Starting treefetch daemon:");
    println!("  Home: {}", home.display());
    println!("  Bind: {}", config.bind);
    println!("  Role: {}", config.role);
    if config.role == Role::Primary {
        println!("  Mirror: {}:{}", config.mirror_host, config.mirror_port);
    }

    if config.bind.starts_with("0.0.0.0") {
        eprintln!("WARNING: Binding to 0.0.0.0 exposes the home directory to all network interfaces");
        eprintln!("   The protocol is unencrypted and unauthenticated; only use on trusted networks");
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(serve(config, home))
}

async fn serve(config: ServerConfig, home: PathBuf) -> Result<()> {
    let server = Server::bind(&config, home).await?;
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::warn!("cannot listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
        .context("daemon stopped")
}
