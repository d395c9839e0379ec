//! Unix-socket command server.
//!
//! One line-framed command per connection, one JSON reply, then the
//! connection closes. Handlers serve HEALTH and BANNER from the
//! published files — they never reach into live collector state — and
//! REFRESH/QUIT poke the runtime through shared handles.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use crate::collectors::runtime::CollectorRuntime;
use crate::daemon::health;
use crate::store::banner::BannerCache;

/// Delay between the QUIT reply and the actual shutdown, so the caller
/// reads its acknowledgment before the socket goes away.
const QUIT_REPLY_GRACE: Duration = Duration::from_millis(100);

/// Shared state the command handlers operate on.
pub struct IpcState {
    /// Where the daemon publishes its health document.
    pub health_path: PathBuf,
    /// The pre-rendered banner cache.
    pub banner: BannerCache,
    /// Runtime handle for REFRESH.
    pub runtime: Arc<CollectorRuntime>,
    /// Root shutdown token; QUIT cancels it.
    pub shutdown: CancellationToken,
}

impl std::fmt::Debug for IpcState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcState")
            .field("health_path", &self.health_path)
            .finish_non_exhaustive()
    }
}

/// Run the command socket server until `cancel` fires.
///
/// The socket is (re)created at `socket_path` with mode 0600 and removed
/// again on exit.
///
/// # Errors
///
/// Returns an error if the socket cannot be bound or chmodded.
pub async fn run_ipc_server(
    socket_path: PathBuf,
    state: Arc<IpcState>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    // A leftover socket from a crashed daemon would block the bind
    if socket_path.exists() {
        tokio::fs::remove_file(&socket_path)
            .await
            .context("failed to remove stale socket")?;
    }
    if let Some(parent) = socket_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .context("failed to create runtime directory")?;
    }

    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("failed to bind {}", socket_path.display()))?;
    std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))
        .context("failed to chmod socket")?;

    tracing::info!(socket = %socket_path.display(), "Command socket listening");

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, state).await {
                                tracing::warn!(error = %e, "Command connection error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Command accept error");
                    }
                }
            }
        }
    }

    let _ = std::fs::remove_file(&socket_path);
    tracing::debug!("Command socket closed");
    Ok(())
}

async fn handle_connection(stream: UnixStream, state: Arc<IpcState>) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    let bytes_read = reader.read_line(&mut line).await?;
    if bytes_read == 0 {
        return Ok(());
    }

    let (response, quit) = dispatch(line.trim(), &state).await;
    let payload = serde_json::to_string(&response)?;
    writer.write_all(payload.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;

    if quit {
        tokio::time::sleep(QUIT_REPLY_GRACE).await;
        tracing::info!("QUIT received, shutting down");
        state.shutdown.cancel();
    }

    Ok(())
}

/// Execute one command line. Returns the JSON reply and whether the
/// daemon should shut down after sending it.
async fn dispatch(line: &str, state: &IpcState) -> (serde_json::Value, bool) {
    let mut parts = line.split_whitespace();
    let verb = parts.next().unwrap_or("").to_uppercase();
    let args: Vec<&str> = parts.collect();

    match verb.as_str() {
        "HEALTH" => (handle_health(&state.health_path), false),
        "BANNER" => (handle_banner(&args, &state.banner), false),
        "REFRESH" => (handle_refresh(&args, state).await, false),
        "QUIT" => (json!({"status": "ok"}), true),
        other => (json!({"error": format!("unknown command: {other}")}), false),
    }
}

fn handle_health(health_path: &Path) -> serde_json::Value {
    match health::read(health_path) {
        // Re-serialize compactly; the file on disk is indented
        Ok(status) => serde_json::to_value(&status)
            .unwrap_or_else(|e| json!({"error": format!("health serialization failed: {e}")})),
        Err(e) => json!({"error": e.to_string()}),
    }
}

fn handle_banner(args: &[&str], banner: &BannerCache) -> serde_json::Value {
    let (Some(width), Some(height), Some(protocol)) = (
        args.first().and_then(|s| s.parse::<u16>().ok()),
        args.get(1).and_then(|s| s.parse::<u16>().ok()),
        args.get(2),
    ) else {
        return json!({"error": "usage: BANNER <width> <height> <protocol>"});
    };

    match banner.get(width, height, protocol) {
        Ok(Some(entry)) => serde_json::to_value(&entry)
            .unwrap_or_else(|e| json!({"error": format!("banner serialization failed: {e}")})),
        Ok(None) => json!({"error": format!("no banner cached for {width}x{height} {protocol}")}),
        Err(e) => json!({"error": format!("banner cache read failed: {e:#}")}),
    }
}

async fn handle_refresh(args: &[&str], state: &IpcState) -> serde_json::Value {
    let known = state.runtime.collector_names();

    let targets: Vec<String> = match args.first() {
        Some(name) => {
            let name = name.to_lowercase();
            if !known.contains(&name) {
                return json!({"error": format!("unknown collector: {name}")});
            }
            vec![name]
        }
        None => known,
    };

    // Fire and acknowledge; the refresh lands in the cache when it lands
    for name in targets {
        let runtime = Arc::clone(&state.runtime);
        tokio::spawn(async move {
            if let Err(e) = runtime.run_once(&name).await {
                tracing::warn!(collector = %name, error = %e, "Requested refresh failed");
            }
        });
    }

    json!({"status": "ok", "message": "refresh triggered"})
}

/// Send one command to a running daemon and return its raw JSON reply.
///
/// # Errors
///
/// Returns an error if the daemon is unreachable or the reply is not a
/// single line of text.
pub async fn send_command(socket_path: &Path, command: &str) -> anyhow::Result<String> {
    let stream = UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("daemon not reachable at {}", socket_path.display()))?;
    let (reader, mut writer) = stream.into_split();

    writer.write_all(command.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;

    let mut reply = String::new();
    BufReader::new(reader).read_line(&mut reply).await?;
    Ok(reply.trim_end().to_owned())
}
