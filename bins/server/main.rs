//! # Market Broker Server
//!
//! TCP broker for a small marketplace of fungible goods. Sellers register
//! and offer time-limited sales from their stock; buyers list open sales
//! and purchase from them; the broker owns all state and pushes inventory
//! changes to connected clients.
//!
//! ## Command-line Options
//! - `--host`: Listen address (default `127.0.0.1`).
//! - `--port` / `-p`: Listen port (default `5000`).
//! - `--log-level` / `-l`: Log level (`error`, `warn`, `info`, `debug`, `trace`).

use std::sync::Arc;

use market_broker::errors::CliError;
use market_broker::market::Market;
use market_broker::server::MarketServer;
use structopt::StructOpt;

/// Command-line options for the market broker
#[derive(Debug, StructOpt)]
#[structopt(name = "market_broker", about = "TCP broker for a marketplace of goods")]
struct Opt {
    /// Listen address
    #[structopt(long, default_value = "127.0.0.1")]
    host: String,

    /// Listen port
    #[structopt(short, long, default_value = "5000")]
    port: u16,

    /// Log level: error, warn, info, debug, trace
    #[structopt(short, long, default_value = "info")]
    log_level: String,
}

/// Initializes the logger using env_logger with the given level
fn init_logger(level: &str) {
    let mut builder = env_logger::Builder::new();

    let log_level = match level.to_lowercase().as_str() {
        "error" => log::LevelFilter::Error,
        "warn" => log::LevelFilter::Warn,
        "info" => log::LevelFilter::Info,
        "debug" => log::LevelFilter::Debug,
        "trace" => log::LevelFilter::Trace,
        _ => log::LevelFilter::Info,
    };

    builder.filter_level(log_level);
    builder.format_timestamp_micros();
    builder.format_module_path(false);
    builder.format_target(false);
    builder.init();
}

fn main() -> Result<(), CliError> {
    let opt = Opt::from_args();

    init_logger(&opt.log_level);

    log::info!("Starting market broker");
    log::debug!("Command line options: {:?}", opt);

    let market = Arc::new(Market::new());

    let addr = format!("{}:{}", opt.host, opt.port);
    let server = MarketServer::new(&addr, market)?;

    log::info!("Market broker initialized. Waiting for client connections...");

    // Run server (blocking call)
    server.start()?;

    log::info!("Broker shutdown complete");
    Ok(())
}
