//! Tandem coordinator — entry point.
//!
//! ```text
//! tandem-coordinator                  Run in the foreground
//! tandem-coordinator --config <path>  Load a custom config TOML
//! tandem-coordinator --port <port>    Override the listen port
//! tandem-coordinator --gen-config     Write default config to stdout
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tandem_coordinator::config::CoordinatorConfig;
use tandem_coordinator::service::CoordinatorService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "tandem-coordinator", about = "Multi-device recording session coordinator")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "tandem-coordinator.toml")]
    config: PathBuf,

    /// Override the device listen port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&CoordinatorConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let mut config = CoordinatorConfig::load(&cli.config);
    if let Some(port) = cli.port {
        config.network.listen_port = port;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("tandem-coordinator v{}", env!("CARGO_PKG_VERSION"));
    info!("listen: {}:{}", config.network.listen_host, config.network.listen_port);
    info!("clock probe interval: {}ms", config.clock.probe_interval_ms);
    info!("heartbeat window: {}ms x {}", config.fault.heartbeat_interval_ms, config.fault.heartbeat_miss_limit);

    let service = CoordinatorService::new(config);
    let stop = service.stop_handle();

    // Ctrl-C handler.
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received — shutting down");
        stop.cancel();
    });

    service.run().await?;

    Ok(())
}
