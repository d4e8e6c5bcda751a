//! Process bootstrap: load config, open the Store, rebuild the Queue
//! Manager, spawn the Heartbeat Monitor, serve HTTP until shutdown.

use std::process::ExitCode as ProcessExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use controller::artifact::LocalArtifactStore;
use controller::config::{Config, ExitCode};
use controller::queue::QueueManager;
use controller::state::AppState;
use controller::store::Store;

fn main() -> ProcessExitCode {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting tracing default failed");

    let config = Config::parse();
    if let Err(err) = config.validate() {
        tracing::error!(error = ?err, "invalid configuration");
        return ProcessExitCode::from(ExitCode::ConfigError as u8);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(err) => {
            tracing::error!(error = ?err, "failed to start tokio runtime");
            return ProcessExitCode::from(ExitCode::ConfigError as u8);
        }
    };

    let exit = runtime.block_on(async_main(config));
    runtime.shutdown_timeout(std::time::Duration::from_secs(5));

    match exit {
        Ok(()) => ProcessExitCode::from(ExitCode::Normal as u8),
        Err(code) => ProcessExitCode::from(code as u8),
    }
}

/// Runs the service until a shutdown signal is observed. Returns the
/// specific exit code a failure maps to; a successful run to completion
/// is represented by the caller as `ExitCode::Normal`.
async fn async_main(config: Config) -> Result<(), ExitCode> {
    let config = Arc::new(config);

    let store = Store::connect(&config.db_path).await.map_err(|err| {
        tracing::error!(error = ?err, "failed to open database");
        ExitCode::DatabaseError
    })?;
    store.migrate().await.map_err(|err| {
        tracing::error!(error = ?err, "failed to apply migrations");
        ExitCode::DatabaseError
    })?;
    tracing::info!("connected to store and applied migrations");

    tokio::fs::create_dir_all(&config.storage_path)
        .await
        .map_err(|err| {
            tracing::error!(error = ?err, "failed to create artifact storage root");
            ExitCode::ConfigError
        })?;
    let artifacts = Arc::new(LocalArtifactStore::new(config.storage_path.clone()));

    // Startup reconciliation: the queue is rebuilt from the Store's
    // `pending` rows in submission order. Builds that were `assigned` or
    // `building` at crash time are left alone — they are reclaimed by
    // the Heartbeat Monitor, not requeued.
    let queue = QueueManager::reconcile(store.clone()).await.map_err(|err| {
        tracing::error!(error = ?err, "failed to reconcile queue manager from store");
        ExitCode::DatabaseError
    })?;
    tracing::info!(pending = queue.stats().await.pending, "queue reconciled");

    let state = AppState::new(store.clone(), artifacts, queue, config.clone());

    let listener = tokio::net::TcpListener::bind(config.address())
        .await
        .map_err(|err| {
            tracing::error!(error = ?err, address = %config.address(), "failed to bind listener");
            ExitCode::BindError
        })?;
    tracing::info!(address = %config.address(), "listening");

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let monitor = tokio::spawn(controller::heartbeat::run(
        store,
        config.clone(),
        shutdown_rx,
    ));

    let app = controller::http::router(state);
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed");

    tracing::info!("http listener closed, signaling heartbeat monitor to stop");
    let _ = shutdown_tx.send(true);
    if let Err(err) = monitor.await {
        tracing::error!(error = ?err, "heartbeat monitor task panicked");
    }

    result.map_err(|err| {
        tracing::error!(error = ?err, "http server exited with an error");
        ExitCode::BindError
    })
}

/// Resolves when SIGINT or SIGTERM is observed, so the server starts its
/// graceful shutdown (close listener, then stop the monitor).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
