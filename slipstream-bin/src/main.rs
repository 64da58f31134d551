use anyhow::{Context, Result};
use clap::Parser;
use slipstream_core::{logging, ConfigFile};
use slipstream_netstack::Supervisor;
use std::fs;
use tracing::{error, info};

/// Slipstream - tunnel device traffic through an encrypted WebSocket relay
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Test configuration and exit
    #[arg(short, long)]
    test_config: bool,

    /// TUN file descriptor handed over by the host tooling
    #[arg(long)]
    tun_fd: Option<i32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_content = fs::read_to_string(&args.config)
        .with_context(|| format!("failed to read {}", args.config))?;
    let file: ConfigFile =
        serde_yaml::from_str(&config_content).context("failed to parse configuration")?;
    let log_level = file.log_level.clone();
    let config = file
        .into_proxy_config()
        .context("configuration validation failed")?;

    if args.test_config {
        println!("Configuration test passed!");
        return Ok(());
    }

    logging::init_logging(&log_level);
    info!("slipstream starting, relay {}", config.relay_url());

    let tun_fd = args
        .tun_fd
        .context("--tun-fd is required (the host provisions the TUN interface)")?;

    let mut supervisor = Supervisor::new(config);
    let revoke = supervisor.revoke_handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            revoke.revoke();
        }
    });

    if let Err(e) = supervisor.run(tun_fd).await {
        error!("supervisor exited with error: {}", e);
        return Err(e.into());
    }

    info!("slipstream stopped");
    Ok(())
}
