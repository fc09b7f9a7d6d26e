// Boto Sapiens entry point.
//
// Startup sequence:
// 1. Load config (copying defaults on first run)
// 2. Initialize tracing (stdout and logs/boto-sapiens.log)
// 3. Build the application (store, transport, LLM, scheduler, relay)
// 4. Install the Ctrl+C handler
// 5. Run until shutdown

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info};

use sapiens_bot::app::App;
use sapiens_core::config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Load config. Tracing is not up yet, so failures go to stderr via anyhow.
    let config = config::load_config().context("failed to load configuration")?;

    // 2. Initialize tracing
    init_tracing(&config.logging.level)?;
    info!("Boto Sapiens starting up");
    info!(
        "Config loaded: store={:?}, daily report at {} {}",
        config.store.backend, config.report.time, config.report.timezone
    );

    // 3. Build the application
    let app = App::build(config).context("failed to initialize application")?;

    // 4. Ctrl+C flips the shutdown flag
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl+C received, shutting down"),
            Err(e) => error!("Failed to listen for Ctrl+C: {e}"),
        }
        let _ = shutdown_tx.send(true);
    });

    // 5. Run
    app.run(shutdown_rx).await?;

    info!("Boto Sapiens shut down cleanly");
    Ok(())
}

/// Log to stdout and to `logs/boto-sapiens.log`. `RUST_LOG` overrides the
/// configured level.
fn init_tracing(level: &str) -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let log_dir = std::env::current_dir()?.join("logs");
    std::fs::create_dir_all(&log_dir)?;

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("boto-sapiens.log"))
        .context("failed to open log file")?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "sapiens_bot={level},sapiens_core={level},sapiens_llm={level},warn"
        ))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .with(
            fmt::layer()
                .with_writer(Arc::new(log_file))
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true),
        )
        .try_init()
        .context("failed to set tracing subscriber")?;

    Ok(())
}
