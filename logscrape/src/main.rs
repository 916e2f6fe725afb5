//! Tails local and SSH logs, parses them against a declared schema, and exposes derived
//! Prometheus metrics over HTTP.

use std::{net::SocketAddr, sync::Arc};

use logscrape_exporter::MetricsExporter;
use logscrape_metrics::Registry;
use tokio::sync::{watch, Mutex};
use tracing_subscriber::EnvFilter;

mod config;
mod health;
mod parser;
mod supervisor;
mod tail;

const BIND_ADDRESS: &str = "0.0.0.0:5000";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = config::load_from_env().await?;
    let ttl = config.ttl;
    let registry = Arc::new(Registry::new(config.prefix.clone(), ttl)?);
    let supervisor = Arc::new(Mutex::new(supervisor::Supervisor::new(
        &config,
        Arc::clone(&registry),
    )));

    let (stop_sender, mut stop_receiver) = watch::channel(());
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("received shutdown signal");
        stop_sender.send_replace(());
    });

    tokio::spawn(health::run(
        Arc::clone(&registry),
        Arc::clone(&supervisor),
        ttl,
    ));
    tokio::spawn(reload_loop(Arc::clone(&registry), Arc::clone(&supervisor)));

    let mut exporter_stop = stop_receiver.clone();
    let exporter = MetricsExporter::new(Arc::clone(&registry)).with_graceful_shutdown(async move {
        exporter_stop.changed().await.ok();
    });
    let bind_address = std::env::var("LOGSCRAPE_BIND").unwrap_or_else(|_| BIND_ADDRESS.to_owned());
    let bind_address: SocketAddr = bind_address.parse().expect("bind address is valid");
    let server = exporter.bind(bind_address).await?;
    tracing::info!(local_addr = %server.local_addr(), "metrics exporter listening");
    println!("local_addr={}", server.local_addr());
    let exporter_task = tokio::spawn(server.start());

    stop_receiver.changed().await.ok();
    exporter_task.await??;
    Ok(())
}

/// Re-reads configuration from the declared script (if any) every `reload-interval`, reconciling
/// the running tailing workers against it.
async fn reload_loop(registry: Arc<Registry>, supervisor: Arc<Mutex<supervisor::Supervisor>>) {
    loop {
        let wait = supervisor.lock().await.reload_interval();
        tokio::time::sleep(wait).await;
        let mut supervisor = supervisor.lock().await;
        supervisor
            .reload_from_script(registry.process_metrics())
            .await;
    }
}
