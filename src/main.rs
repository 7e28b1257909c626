mod aggregate;
mod aging;
mod api;
mod config;
mod daemon;
mod error;
mod event_loop;
mod interface;
mod kernel;
mod rdisc;
mod rip;
mod routes;
mod timers;

use anyhow::Context;
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use config::Config;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let config = Config::load()?;

    // Initialize logging
    let filter = EnvFilter::default().add_directive(LevelFilter::from(config.log_level).into());
    match &config.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }

    tracing::info!("ripd starting...");

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    tracing::info!("Host: {}", hostname);
    for ifc in &config.interfaces {
        tracing::info!(
            "Interface {}: {}/{} metric {}",
            ifc.name,
            ifc.addr,
            ifc.mask.count_ones(),
            ifc.metric
        );
    }
    if config.interfaces.is_empty() {
        tracing::warn!("No interfaces configured; only listening");
    }

    event_loop::run(config).await
}
