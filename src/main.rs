//! Stub Mock Server - CLI Entry Point

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use stub_mock_server::{MockServer, MockServerConfig};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(
    name = "stub-mock-server",
    about = "Stub-driven HTTP mock server - request matching and templated responses",
    version
)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "mock-server.yaml")]
    config: PathBuf,

    /// Interface to bind (overrides the configuration file)
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for an OS-assigned port (overrides the configuration file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// Print the example bookstore configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if args.print_config {
        let example_config = include_str!("../demos/bookstore.yaml");
        println!("{}", example_config);
        return Ok(());
    }

    // Load configuration
    let mut config = if args.config.exists() {
        info!(path = ?args.config, "Loading configuration");
        MockServerConfig::from_file(&args.config)?
    } else if args.validate {
        anyhow::bail!("Configuration file not found: {:?}", args.config);
    } else {
        info!("Using default configuration (no stubs)");
        MockServerConfig::default()
    };

    if args.validate {
        config.validate()?;
        println!("Configuration is valid ({} stubs defined)", config.stubs.len());
        return Ok(());
    }

    if let Some(host) = args.host {
        config.settings.host = host;
    }
    if let Some(port) = args.port {
        config.settings.port = port;
    }

    let server = MockServer::from_config(config)?;
    let base_url = server.start().await?;
    println!("{}", base_url);

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl-C, shutting down");
    server.stop().await;

    Ok(())
}
