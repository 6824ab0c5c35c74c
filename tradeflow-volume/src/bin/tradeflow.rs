use rustls::crypto::ring::default_provider;
use std::{process::ExitCode, sync::Arc};
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tradeflow_data::connection::socket::TungsteniteConnector;
use tradeflow_volume::{Config, VolumeReport, run};

#[tokio::main]
async fn main() -> ExitCode {
    // rustls needs a process-wide crypto provider before any wss/https connection
    let _ = default_provider().install_default();

    init_logging();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(error) => {
            error!(%error, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    info!(
        exchanges = config.exchanges.len(),
        interval_ms = config.aggregator.interval_ms,
        lookback = %config.lookback,
        "starting tradeflow volume monitor"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("ctrl-c received, shutting down"),
            Err(error) => error!(%error, "failed to listen for ctrl-c, shutting down"),
        }
        let _ = shutdown_tx.send(true);
    });

    let (reports_tx, reports_rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_reports(reports_rx));

    let result = run(
        config,
        Arc::new(TungsteniteConnector),
        reports_tx,
        shutdown_rx,
    )
    .await;

    // Runtime dropped its report sender, so the printer drains and ends
    let _ = printer.await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(%error, "failed to start tradeflow");
            ExitCode::FAILURE
        }
    }
}

async fn print_reports(mut reports_rx: mpsc::UnboundedReceiver<VolumeReport>) {
    while let Some(report) = reports_rx.recv().await {
        info!("\n{report}");
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
