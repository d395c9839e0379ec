use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};

use prompt_pulse::config::Config;
use prompt_pulse::daemon::{self, health, ipc};
use prompt_pulse::utils;

#[derive(Parser)]
#[command(name = "prompt-pulse")]
#[command(version)]
#[command(about = "Background agent collecting usage and system signals for shell prompts")]
#[command(long_about = "\
prompt-pulse runs a user-level daemon that periodically collects signals
(Claude usage quotas, billing, mesh and cluster status) and keeps the
latest snapshot of each on disk for shell prompts, startup banners, and
dashboards to read.

The daemon owns the cache directory exclusively; readers only ever see
complete snapshots thanks to atomic writes.")]
#[command(after_long_help = "\
QUICK START:
    prompt-pulse daemon          # run in the foreground (use a service manager)
    prompt-pulse health          # exit 0 when the daemon is alive and fresh
    prompt-pulse refresh claude  # force an immediate collection

ENVIRONMENT VARIABLES:
    RUST_LOG                  Log level filter (default: prompt_pulse=info)
    XDG_RUNTIME_DIR           Runtime dir for socket/PID/health files
    XDG_CACHE_HOME            Parent of the snapshot cache directory
    PROMPT_PULSE_CACHE_DIR    Cache directory override
    PROMPT_PULSE_RUNTIME_DIR  Runtime directory override
    ANTHROPIC_API_KEY         API key for api-type accounts (or any var
                              named by an account's api_key_env; *_FILE
                              variants name a file holding the secret)

FILE LOCATIONS:
    ~/.config/prompt-pulse/config.toml   Configuration
    ~/.cache/prompt-pulse/<key>.json     Collector snapshots
    $XDG_RUNTIME_DIR/prompt-pulse.pid    Daemon PID lock
    $XDG_RUNTIME_DIR/prompt-pulse.sock   Command socket
    $XDG_RUNTIME_DIR/prompt-pulse-health.json  Health document")]
struct Cli {
    /// Path to an alternate config file
    #[arg(long, global = true)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the collector daemon in the foreground
    ///
    /// Acquires the PID lock, starts all configured collectors, and
    /// serves the command socket until SIGINT/SIGTERM or QUIT.
    Daemon,

    /// Check daemon health (exit 0 = healthy, 1 = stale or unreachable)
    Health,

    /// Trigger an immediate collection, all collectors or one by name
    Refresh {
        /// Collector to refresh (default: all)
        name: Option<String>,
    },

    /// Ask a running daemon to shut down
    Quit,

    /// Print the pre-rendered banner for a terminal geometry
    Banner {
        /// Terminal width in columns
        width: u16,
        /// Terminal height in rows
        height: u16,
        /// Image protocol (kitty, sixel, none)
        protocol: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let is_daemon = matches!(cli.command, Commands::Daemon);

    if is_daemon {
        initialize_daemon_logging()?;
    } else {
        initialize_cli_logging();
    }

    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Daemon => {
            daemon::run(config).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Health => Ok(check_health(&config)),
        Commands::Refresh { name } => {
            let command = match name {
                Some(name) => format!("REFRESH {name}"),
                None => "REFRESH".to_owned(),
            };
            let reply = ipc::send_command(&config.socket_path(), &command).await?;
            println!("{reply}");
            Ok(exit_for_reply(&reply))
        }
        Commands::Quit => {
            let reply = ipc::send_command(&config.socket_path(), "QUIT").await?;
            println!("{reply}");
            Ok(exit_for_reply(&reply))
        }
        Commands::Banner {
            width,
            height,
            protocol,
        } => {
            let reply = ipc::send_command(
                &config.socket_path(),
                &format!("BANNER {width} {height} {protocol}"),
            )
            .await?;
            println!("{reply}");
            Ok(exit_for_reply(&reply))
        }
    }
}

/// Evaluate the published health file: 0 = healthy, 1 = stale/unreachable.
fn check_health(config: &Config) -> ExitCode {
    match health::read(&config.health_path()) {
        Ok(status) => {
            if status.is_stale(config.health_stale_after()) {
                println!(
                    "stale: health last published {}",
                    status.last_update.to_rfc3339()
                );
                return ExitCode::from(1);
            }

            let unhealthy: Vec<&str> = status
                .collectors
                .values()
                .filter(|c| !c.healthy)
                .map(|c| c.name.as_str())
                .collect();
            if unhealthy.is_empty() {
                println!("healthy: pid {}", status.pid);
            } else {
                println!(
                    "healthy: pid {} (degraded collectors: {})",
                    status.pid,
                    unhealthy.join(", ")
                );
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            println!("unreachable: {e}");
            ExitCode::from(1)
        }
    }
}

/// Map a JSON reply to an exit code: any `error` field is a failure.
fn exit_for_reply(reply: &str) -> ExitCode {
    let is_error = serde_json::from_str::<serde_json::Value>(reply)
        .map(|v| v.get("error").is_some())
        .unwrap_or(true);
    if is_error { ExitCode::from(1) } else { ExitCode::SUCCESS }
}

/// Filter applied to CLI invocations when `RUST_LOG` is unset.
const CLI_LOG_FILTER: &str = "prompt_pulse=warn";

/// Filter applied to the daemon when `RUST_LOG` is unset.
const DAEMON_LOG_FILTER: &str = "prompt_pulse=info";

/// Resolve the active filter spec: `RUST_LOG` wins, `fallback` otherwise.
fn log_filter(fallback: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback))
}

/// Logging for CLI invocations: warnings to stderr, nothing on disk.
fn initialize_cli_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(CLI_LOG_FILTER))
        .with_writer(std::io::stderr)
        .init();
}

/// Logging for the daemon: console plus a timestamped file per start,
/// with a `latest.log` symlink and pruning of aged files.
fn initialize_daemon_logging() -> anyhow::Result<()> {
    let logs_dir = utils::paths::logs_dir();
    std::fs::create_dir_all(&logs_dir)?;

    // Prune before the subscriber exists; the outcome is reported below
    let prune_outcome = utils::log_cleanup::prune_old_logs(
        &logs_dir,
        utils::paths::LOG_FILE_PREFIX,
        utils::log_cleanup::DEFAULT_RETENTION,
    );

    let timestamp = chrono::Local::now().format("%Y-%m-%dT%H-%M-%S");
    let log_filename = format!("{}{timestamp}.log", utils::paths::LOG_FILE_PREFIX);
    let file_appender = tracing_appender::rolling::never(&logs_dir, &log_filename);

    #[cfg(unix)]
    {
        use std::os::unix::fs::symlink;
        let _ = std::fs::remove_file(logs_dir.join("latest.log"));
        let _ = symlink(&log_filename, logs_dir.join("latest.log"));
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(log_filter(DAEMON_LOG_FILTER)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_filter(log_filter(DAEMON_LOG_FILTER)),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        log = %logs_dir.join(&log_filename).display(),
        "prompt-pulse daemon starting"
    );

    match prune_outcome {
        Ok(outcome) => {
            if !outcome.removed.is_empty() {
                tracing::info!(count = outcome.removed.len(), "Pruned aged log files");
            }
            for name in &outcome.failed {
                tracing::warn!(file = %name, "Could not prune aged log file");
            }
        }
        Err(e) => tracing::warn!(error = %e, "Log pruning failed"),
    }

    Ok(())
}
