//! switchbot-actions server
//!
//! Loads configuration, wires the component graph, and supervises it until
//! shutdown. SIGHUP reloads the configuration with rollback; SIGTERM and
//! SIGINT shut down gracefully.
//!
//! Exit codes: 0 on clean shutdown, 1 on fatal configuration or startup
//! errors, 2 when a reload rollback fails.

mod app;
mod cli;
mod logging;
mod pipeline;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use sb_config::Settings;
use sb_scanner::SourceFactory;

use app::{Application, UnavailableController};
use cli::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let overrides = cli.overrides();

    let settings = match Settings::load_with_overrides(&cli.config, &overrides) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            return ExitCode::from(1);
        }
    };

    if cli.check {
        println!("Configuration is valid.");
        return ExitCode::SUCCESS;
    }

    let log_handle = logging::init(&settings.logging);

    let source_factory: SourceFactory = Arc::new(sb_scanner::system_source);
    let mut application = Application::new(
        cli.config.clone(),
        overrides,
        settings,
        source_factory,
        Arc::new(UnavailableController),
        Some(log_handle),
    );

    if let Err(e) = application.start().await {
        error!("Application failed to start: {:#}", e);
        application.stop().await;
        return ExitCode::from(1);
    }
    info!("Application started successfully. Waiting for signals...");

    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(e) => {
            error!("Failed to install SIGHUP handler: {}", e);
            application.stop().await;
            return ExitCode::from(1);
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            application.stop().await;
            return ExitCode::from(1);
        }
    };

    loop {
        tokio::select! {
            _ = sighup.recv() => {
                info!("SIGHUP received, reloading configuration");
                if let Err(e) = application.reload().await {
                    error!("Reload rollback failed, exiting: {:#}", e);
                    application.stop().await;
                    return ExitCode::from(2);
                }
            }
            _ = sigterm.recv() => {
                info!("Shutdown signal received. Initiating graceful shutdown...");
                break;
            }
            result = tokio::signal::ctrl_c() => {
                if result.is_ok() {
                    info!("Shutdown signal received. Initiating graceful shutdown...");
                }
                break;
            }
        }
    }

    application.stop().await;
    info!("Shutdown complete");
    ExitCode::SUCCESS
}
