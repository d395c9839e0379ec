//! Daemon lifecycle: singleton enforcement, wiring, and shutdown.
//!
//! The orchestrator owns the root cancellation token. Everything else —
//! collector runners, the update consumer, the IPC server, the health
//! loop — runs on child tokens and unwinds in order when the root is
//! cancelled by a signal or a QUIT command.

/// Health file publication and reading.
pub mod health;
/// Unix-socket command server.
pub mod ipc;
/// PID file lock.
pub mod pid;

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::collectors::claude::ClaudeCollector;
use crate::collectors::runtime::CollectorRuntime;
use crate::config::Config;
use crate::store::CacheStore;
use crate::store::banner::BannerCache;
use crate::utils::fs::ensure_dir;

use ipc::IpcState;

/// Run the daemon until a shutdown signal or QUIT command.
///
/// # Errors
///
/// Returns an error on startup failure — most commonly another live
/// instance holding the PID lock.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let started_at = Utc::now();
    let start_instant = Instant::now();

    let runtime_dir = config.runtime_dir();
    ensure_dir(&runtime_dir, 0o700).with_context(|| {
        format!("failed to create runtime directory {}", runtime_dir.display())
    })?;
    let store = CacheStore::new(config.cache_dir())?;

    let pid_file = config.pid_path();
    pid::acquire(&pid_file).context("failed to acquire daemon lock")?;

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let runtime = Arc::new(CollectorRuntime::new(shutdown.child_token()));
    if config.claude.enabled {
        let collector = ClaudeCollector::new(
            config.claude.accounts(),
            config.claude.stagger(),
            config.claude.interval(),
            shutdown.child_token(),
        )?;
        runtime.register(Arc::new(collector));
    }

    let updates = runtime.start()?;
    let consumer = spawn_update_consumer(updates, store, shutdown.child_token());

    let ipc_state = Arc::new(IpcState {
        health_path: config.health_path(),
        banner: BannerCache::new(config.banner_path()),
        runtime: Arc::clone(&runtime),
        shutdown: shutdown.clone(),
    });
    let ipc = tokio::spawn(ipc::run_ipc_server(
        config.socket_path(),
        ipc_state,
        shutdown.child_token(),
    ));

    tracing::info!(
        pid = std::process::id(),
        runtime_dir = %runtime_dir.display(),
        cache_dir = %config.cache_dir().display(),
        "Daemon started"
    );

    // Health publish loop; the first tick fires immediately so external
    // readers see a document within moments of startup.
    let health_path = config.health_path();
    let mut ticker = tokio::time::interval(config.health_interval());
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                publish_health(&health_path, started_at, start_instant, &runtime);
            }
        }
    }

    tracing::info!("Shutting down");
    runtime.stop().await;
    let _ = consumer.await;
    match ipc.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "IPC server exited with error"),
        Err(e) => tracing::warn!(error = %e, "IPC server task failed"),
    }
    pid::release(&pid_file);
    tracing::info!("Daemon stopped");
    Ok(())
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let sigterm = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            () = sigterm => {}
        }
        tracing::info!("Shutdown signal received");
        shutdown.cancel();
    });
}

/// Drain the update stream into the cache store, one file per collector,
/// refreshing the `meta` summary after each write.
fn spawn_update_consumer(
    mut updates: tokio::sync::mpsc::Receiver<crate::collectors::CollectResult>,
    store: CacheStore,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let result = tokio::select! {
                () = cancel.cancelled() => break,
                received = updates.recv() => match received {
                    Some(result) => result,
                    None => break,
                },
            };

            let key = result.collector.clone();
            if let Err(e) = store.set(&key, &result) {
                tracing::error!(collector = %key, error = %e, "Failed to persist snapshot");
                continue;
            }
            tracing::debug!(collector = %key, "Persisted snapshot");

            match store.meta() {
                Ok(meta) => {
                    if let Err(e) = store.set("meta", &meta) {
                        tracing::warn!(error = %e, "Failed to write cache summary");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Failed to compute cache summary"),
            }
        }
        tracing::debug!("Update consumer exited");
    })
}

/// Build and write the current health document; failures are logged,
/// never fatal — the next tick retries.
fn publish_health(
    path: &std::path::Path,
    started_at: DateTime<Utc>,
    start_instant: Instant,
    runtime: &CollectorRuntime,
) {
    let status = health::HealthStatus {
        pid: std::process::id(),
        started_at,
        uptime_ns: start_instant.elapsed().as_nanos() as u64,
        last_update: Utc::now(),
        collectors: runtime.statuses(),
    };

    if let Err(e) = health::write(path, &status) {
        tracing::warn!(error = %e, "Failed to publish health");
    }
}
