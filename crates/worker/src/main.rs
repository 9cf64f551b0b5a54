//! llmrelay worker - main entry point
//!
//! Loads configuration, waits for the inference engine, then hands the job
//! handler to the host and serves until shutdown.

use std::sync::Arc;

use llmrelay_common::{RelayConfig, RelayError, Result};
use llmrelay_worker::liveness::{exit_on_startup_failure, ProcessExit, Terminator};
use llmrelay_worker::WorkerContext;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "llmrelay_worker=info,llmrelay_host=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting llmrelay worker");

    let terminator: Arc<dyn Terminator> = Arc::new(ProcessExit);

    let config = RelayConfig::load().map_err(|e| startup_failed(e, terminator.as_ref()))?;

    info!(
        "Worker configuration loaded: engine={}, bind={}:{}",
        config.engine.base_url, config.bind_address, config.port
    );

    let context = WorkerContext::build(&config, Arc::clone(&terminator))
        .await
        .map(Arc::new)
        .map_err(|e| startup_failed(e, terminator.as_ref()))?;

    let options = context.serverless_options();
    let addr = config.addr();

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = llmrelay_host::start(options, &addr) => {
            result?;
        }
    }

    info!("llmrelay worker shutdown complete");
    Ok(())
}

/// Exit on a start-up failure. Returns the error only when the terminator
/// itself returns, which [`ProcessExit`] never does.
fn startup_failed(err: RelayError, terminator: &dyn Terminator) -> RelayError {
    exit_on_startup_failure(&err, terminator);
    err
}
