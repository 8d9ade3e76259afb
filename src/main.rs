//! Endpoint adapter daemon entry point.
//!
//! Parses the command line, connects the bus side, then hands control to
//! the selected transport backend until it finishes or a termination
//! signal arrives. Everything runs on one cooperative loop thread; only
//! the CAN backend spawns helpers.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::Instrument;
use tracing_subscriber::EnvFilter;

use epad::bus::BusLink;
use epad::cli::Cli;
use epad::core::config::AdapterContext;
use epad::core::metrics::Metrics;
use epad::endpoint;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let cfg = match cli.into_config() {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            tracing::error!("invalid configuration: {}", e);
            return ExitCode::from(2);
        }
    };

    if !cfg.startup_delay.is_zero() {
        tracing::debug!("startup delayed by {:?}", cfg.startup_delay);
        tokio::time::sleep(cfg.startup_delay).await;
    }

    let bus = match BusLink::connect(&cfg).await {
        Ok(bus) => bus,
        Err(e) => {
            tracing::error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let metrics = Arc::new(Metrics::new(cfg.name.clone()));
    let mut ctx = AdapterContext {
        cfg: cfg.clone(),
        metrics,
        bus,
    };
    let mut backend = endpoint::create(&cfg.mode);

    tracing::info!("adapter {} starting ({:?})", cfg.name, cfg.mode);

    // every log line below carries the adapter identity as a span field
    let run = backend
        .run(&mut ctx)
        .instrument(tracing::info_span!("adapter", name = %cfg.name));

    tokio::select! {
        result = run => match result {
            Ok(()) => {
                tracing::info!("adapter {} finished", cfg.name);
                ExitCode::SUCCESS
            }
            Err(e) => {
                tracing::error!("adapter {} failed: {}", cfg.name, e);
                ExitCode::FAILURE
            }
        },
        sig = shutdown_signal() => {
            tracing::info!("received {}, shutting down", sig);
            ExitCode::SUCCESS
        }
    }
}

/// Wait for SIGINT, SIGTERM, or SIGQUIT.
async fn shutdown_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("cannot install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
            unreachable!()
        }
    };
    let mut quit = match signal(SignalKind::quit()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("cannot install SIGQUIT handler: {}", e);
            std::future::pending::<()>().await;
            unreachable!()
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = term.recv() => "SIGTERM",
        _ = quit.recv() => "SIGQUIT",
    }
}
