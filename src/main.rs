//! # trend-monitor — Binary Entrypoint
//!
//! Loads configuration, initializes tracing, wires the real collaborators
//! (Gemini extractor, output sink) and runs the supervisor until SIGINT.
//! The chat-network listener is an external process feeding the intake
//! handle; without one attached, the engine idles and serves the control
//! surface.

use std::process::ExitCode;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use trend_monitor::app::{self, IntakeHandle};
use trend_monitor::config::Config;
use trend_monitor::extract::GeminiProvider;
use trend_monitor::sender::LogSink;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .compact()
        .init();

    let cfg = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("configuration error: {e}");
            return ExitCode::from(2);
        }
    };

    let provider = Arc::new(GeminiProvider::new(&cfg.gemini_api_key, &cfg.gemini_model));
    let sink = Arc::new(LogSink);
    let (intake, intake_rx) = IntakeHandle::channel();

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            signal_cancel.cancel();
        }
    });

    // The listener process owns the other end of this handle; keep ours
    // alive so the pipeline channel stays open for the whole run.
    let _intake = intake;

    match app::run(cfg, provider, sink, intake_rx, cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}
