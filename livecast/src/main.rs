mod config;
mod logging;
mod server;

use anyhow::Result;
use clap::Parser;
use livecast_sfu::{LocalEngine, Supervisor};
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::server::AppState;

#[derive(Parser, Debug)]
#[command(name = "livecast")]
#[command(about = "LiveCast media relay", long_about = None)]
struct Args {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long, env = "LIVECAST_CONFIG_PATH")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let config = Config::load(args.config.as_deref())?;

    // Fail fast on misconfiguration
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("LiveCast relay starting...");
    info!("HTTP address: {}", config.http_address());

    // 3. Start the media engine and its supervisor
    let (engine, events) = LocalEngine::new();
    let supervisor = Supervisor::initialize(
        config.sfu.clone(),
        Arc::new(engine),
        events,
        Supervisor::exit_process_handler(),
    )?;
    info!(
        rtc_min_port = config.sfu.rtc_min_port,
        rtc_max_port = config.sfu.rtc_max_port,
        announced_ip = ?config.sfu.announced_ip,
        "Media engine ready"
    );

    // 4. Serve signaling
    let state = AppState::new(Arc::clone(supervisor.relay()));
    server::serve(&config.http_address(), state).await?;

    info!("LiveCast relay stopped");
    Ok(())
}
