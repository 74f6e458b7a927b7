//! A stub tracing backend that serves the query, API v3, and sampling surfaces, recording a trace for every correlated
//! request it receives.

#![deny(warnings)]
#![deny(missing_docs)]

use std::{net::SocketAddr, time::Duration};

use anyhow::Context as _;
use axum::{http::HeaderName, Router};
use clap::Parser;
use tokio::{
    net::TcpListener,
    select,
    signal::unix::{signal, SignalKind},
    sync::watch,
};
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

mod app;
use crate::app::{initialize_query_router, initialize_sampling_router, BackendSettings, BackendState};

/// Stub tracing backend.
#[derive(Parser)]
#[command(about)]
struct Cli {
    /// Address to serve the query UI, REST API, and API v3 gateway on.
    #[arg(long, default_value = "0.0.0.0:16686")]
    query_addr: SocketAddr,

    /// Address to serve sampling strategies on.
    #[arg(long, default_value = "0.0.0.0:5778")]
    sampling_addr: SocketAddr,

    /// Service that recorded traces belong to.
    #[arg(long, default_value = "jaeger-query")]
    service: String,

    /// Header that marks a request as correlated.
    #[arg(long, default_value = "jaeger-debug-id")]
    correlation_header: HeaderName,

    /// Delay, in milliseconds, before a recorded trace becomes searchable.
    #[arg(long, default_value_t = 2000)]
    indexing_delay_ms: u64,

    /// Sampling rate to report for every service.
    #[arg(long, default_value_t = 1.0)]
    sampling_rate: f64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .compact()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_ansi(true)
        .with_target(true)
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => info!("trace-intake stopped."),
        Err(e) => {
            error!("{:?}", e);
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<(), anyhow::Error> {
    info!("trace-intake starting...");

    let state = BackendState::new(BackendSettings {
        service: cli.service,
        correlation_header: cli.correlation_header,
        indexing_delay: Duration::from_millis(cli.indexing_delay_ms),
        sampling_rate: cli.sampling_rate,
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handlers(shutdown_tx).context("Failed to configure signal handlers.")?;

    let query_listener = TcpListener::bind(cli.query_addr)
        .await
        .with_context(|| format!("Failed to bind query listener to {}.", cli.query_addr))?;
    let sampling_listener = TcpListener::bind(cli.sampling_addr)
        .await
        .with_context(|| format!("Failed to bind sampling listener to {}.", cli.sampling_addr))?;

    info!(
        "trace-intake started: query API on {}, sampling API on {}",
        cli.query_addr, cli.sampling_addr
    );

    tokio::try_join!(
        serve(query_listener, initialize_query_router(state.clone()), shutdown_rx.clone()),
        serve(sampling_listener, initialize_sampling_router(state), shutdown_rx),
    )?;

    Ok(())
}

async fn serve(
    listener: TcpListener, router: Router, mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), anyhow::Error> {
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            // A dropped sender also means shutdown.
            let _ = shutdown_rx.wait_for(|shutdown| *shutdown).await;
        })
        .await
        .map_err(Into::into)
}

fn spawn_signal_handlers(shutdown_tx: watch::Sender<bool>) -> Result<(), anyhow::Error> {
    let mut sigint_handler = signal(SignalKind::interrupt()).context("Failed to set up SIGINT handler.")?;
    let mut sigterm_handler = signal(SignalKind::terminate()).context("Failed to set up SIGTERM handler.")?;

    tokio::spawn(async move {
        select! {
            _ = sigint_handler.recv() => {
                info!("Received SIGINT, shutting down...");
            }
            _ = sigterm_handler.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }

        if let Err(e) = shutdown_tx.send(true) {
            error!("Failed to send shutdown signal: {:?}", e);
        }
    });

    Ok(())
}
