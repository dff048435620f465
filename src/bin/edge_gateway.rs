//! edge_gateway - live stream fan-out and notebook hub control service
//!
//! This daemon:
//! 1. Loads the gateway configuration (file + environment)
//! 2. Serves the HTTP/WebSocket API
//! 3. Starts RTSP ingest and the MQTT subscriber on first viewer or explicit start
//! 4. Stops everything on Ctrl-C

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use edge_gateway::{
    api::{ApiConfig, ApiServer, AppState},
    GatewayConfig,
};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Fan out a camera stream and its detections to browser viewers"
)]
struct Args {
    /// JSON configuration file.
    #[arg(long, env = "EDGE_GATEWAY_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Address the API listens on. Overrides the configuration file.
    #[arg(long, env = "EDGE_GATEWAY_API_ADDR", value_name = "HOST:PORT")]
    addr: Option<String>,

    /// Start RTSP and MQTT services immediately instead of on first viewer.
    #[arg(long)]
    start_stream: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = GatewayConfig::load_from(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.api_addr = addr;
    }
    log::info!(
        "edge_gateway {} (rtsp {}, mqtt {} topic {})",
        env!("CARGO_PKG_VERSION"),
        config.rtsp.url,
        config.mqtt.broker_addr,
        config.mqtt.topic
    );

    let api_config = ApiConfig {
        addr: config.api_addr.clone(),
    };
    let state = AppState::new(config);
    let session = state.session.clone();
    if args.start_stream {
        if let Err(e) = session.start() {
            log::warn!("stream services not started: {:#}", e);
        }
    }

    let api_handle = ApiServer::new(api_config, state).spawn()?;
    log::info!("edge_gateway running, waiting for shutdown signal (Ctrl-C)...");
    let served = api_handle.wait();

    log::info!("shutting down stream services...");
    session.stop();
    served
}
