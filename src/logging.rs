//! Daemon vs. one-shot CLI tracing setup (§1 ambient logging).
//!
//! Mirrors the teacher's `initialize_daemon_logging`/`initialize_cli_logging`
//! split: the long-running daemon gets console output plus rolling file
//! appenders (info/debug/error), while a one-shot CLI invocation (`vt
//! create`, `vt list`, ...) only needs console output and exits quickly
//! enough that file rotation would be pure overhead.

use std::path::{Path, PathBuf};

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

const DEFAULT_CLI_FILTER: &str = "vibetunnel_core=warn";
const DEFAULT_DAEMON_FILTER: &str = "vibetunnel_core=info";

/// Initialize console-only logging for one-shot CLI commands.
pub fn init_cli() {
    let env_filter = tracing_subscriber::EnvFilter::new(std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_CLI_FILTER.into()));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_filter(env_filter))
        .init();
}

/// Initialize full daemon logging: console plus rolling file appenders
/// under `logs_dir`, named with an instance-start timestamp.
///
/// # Errors
///
/// Returns an IO error if `logs_dir` cannot be created.
pub fn init_daemon(logs_dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(logs_dir)?;

    let timestamp = chrono::Utc::now().format("%Y-%m-%dT%H-%M-%S");
    let log_filename = format!("vibetunnel.{timestamp}.log");
    let debug_log_filename = format!("vibetunnel.{timestamp}.debug.log");
    let error_log_filename = format!("vibetunnel.{timestamp}.error.log");

    let file_appender = tracing_appender::rolling::never(logs_dir, &log_filename);
    let debug_file_appender = tracing_appender::rolling::never(logs_dir, &debug_log_filename);
    let error_file_appender = tracing_appender::rolling::never(logs_dir, &error_log_filename);

    #[cfg(unix)]
    symlink_latest(logs_dir, &log_filename, &debug_log_filename, &error_log_filename);

    let rust_log_value = std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_DAEMON_FILTER.into());
    let console_filter = tracing_subscriber::EnvFilter::new(&rust_log_value);
    let file_filter = tracing_subscriber::EnvFilter::new(&rust_log_value);
    let debug_filter = tracing_subscriber::EnvFilter::new("vibetunnel_core=debug");
    let error_filter = tracing_subscriber::EnvFilter::new("vibetunnel_core=warn");

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_target(cfg!(debug_assertions))
        .with_thread_ids(cfg!(debug_assertions));

    tracing_subscriber::registry()
        .with(console_layer.with_filter(console_filter))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(debug_file_appender)
                .with_ansi(false)
                .with_filter(debug_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(error_file_appender)
                .with_ansi(false)
                .with_filter(error_filter),
        )
        .init();

    tracing::info!(pid = std::process::id(), logs_dir = %logs_dir.display(), "vibetunnel daemon starting");
    Ok(())
}

#[cfg(unix)]
fn symlink_latest(logs_dir: &Path, log: &str, debug_log: &str, error_log: &str) {
    use std::os::unix::fs::symlink;
    for (target, link_name) in [(log, "latest.log"), (debug_log, "latest.debug.log"), (error_log, "latest.error.log")] {
        let link: PathBuf = logs_dir.join(link_name);
        let _ = std::fs::remove_file(&link);
        let _ = symlink(target, link);
    }
}
