use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use synthflow_core::wire::DEFAULT_MAX_FRAME_BYTES;
use synthflow_hub::{serve, HubConfig, HubState, DEFAULT_HUB_ADDR};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "synthflow-hub")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
    /// Forward every workflow's events to every connected socket.
    #[arg(long, default_value_t = false)]
    cross_post: bool,
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_BYTES)]
    max_frame_bytes: usize,
    #[arg(long, default_value_t = 5)]
    write_timeout: u64,
}

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    hub: HubConfig,
}

#[tokio::main]
async fn main() {
    let config = load_config();
    init_logging(config.hub.debug);
    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };
    if !addr.ip().is_loopback() {
        error!(event = "invalid_addr", addr = %config.addr);
        return;
    }

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "hub_error", error = %err);
            return;
        }
    };
    let hub = Arc::new(HubState::new(config.hub.clone()));

    info!(
        event = "hub_start",
        addr = %config.addr,
        cross_post = config.hub.cross_post
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    if let Err(err) = serve(listener, hub, shutdown).await {
        error!(event = "hub_error", error = %err);
    }
}

fn load_config() -> Config {
    let args = Args::parse();
    let addr = resolve_addr(&args.addr);
    let debug = args.debug || env_true("SYNTHFLOW_HUB_DEBUG");
    let cross_post = args.cross_post || env_true("SYNTHFLOW_HUB_CROSS_POST");
    Config {
        addr,
        hub: HubConfig {
            debug,
            cross_post,
            max_frame_bytes: args.max_frame_bytes,
            write_timeout: std::time::Duration::from_secs(args.write_timeout),
        },
    }
}

fn resolve_addr(arg: &str) -> String {
    if !arg.is_empty() {
        return arg.to_string();
    }
    if let Ok(value) = std::env::var("SYNTHFLOW_HUB_ADDR") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    DEFAULT_HUB_ADDR.to_string()
}

fn env_true(key: &str) -> bool {
    std::env::var(key)
        .map(|value| is_truthy(&value))
        .unwrap_or(false)
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn init_logging(debug: bool) {
    let level = if debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("SYNTHFLOW_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
