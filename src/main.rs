//! `vt`: a minimal CLI wiring the core together (§6 CLI surface).
//!
//! Flag parsing for the full terminal-sharing server (HTTP bind address,
//! TLS, mDNS, GUI) is explicitly out of scope for this crate; `vt` exists
//! only to exercise the PTY/session/control-socket core end-to-end, the
//! same thin role the teacher's `main.rs` plays over `clauderon::*`.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use vibetunnel_core::aggregator::{Aggregator, NoRemoteSnapshotSource};
use vibetunnel_core::errors::FatalError;
use vibetunnel_core::git_ops::CliGitOps;
use vibetunnel_core::manager::SessionManager;
use vibetunnel_core::remote::RemoteRegistry;
use vibetunnel_core::session::{SessionConfig, TitleMode};
use vibetunnel_core::{control, logging, paths, wiring};

#[derive(Parser)]
#[command(name = "vt")]
#[command(version)]
#[command(about = "PTY session, streaming, and federation engine for terminal-sharing")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon: session manager, control socket, and (when
    /// configured) HQ registration.
    Daemon,
    /// Create a new session running `argv` in the current directory.
    Create {
        /// Command and arguments to run under a PTY.
        argv: Vec<String>,
    },
    /// List known sessions.
    List,
    /// Print the path to a session's asciinema stream for attaching.
    Attach {
        /// Session id.
        id: String,
    },
    /// Send `SIGTERM` (or `--signal`) to a session.
    Kill {
        /// Session id.
        id: String,
        /// Signal number to send.
        #[arg(long, default_value_t = libc::SIGTERM)]
        signal: i32,
    },
    /// Remove exited sessions older than `--max-age-secs`.
    Cleanup {
        /// Minimum age, in seconds, before an exited session is removed.
        #[arg(long, default_value_t = 86_400)]
        max_age_secs: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon => run_daemon().await,
        other => {
            logging::init_cli();
            run_one_shot(other).await
        }
    }
}

async fn run_daemon() -> anyhow::Result<()> {
    logging::init_daemon(&wiring::logs_dir())?;

    let killed = wiring::enforce_single_instance();
    if !killed.is_empty() {
        tracing::warn!(?killed, "terminated conflicting instances of this binary");
        tokio::time::sleep(wiring::SINGLE_INSTANCE_SETTLE_DELAY).await;
    }

    let control_dir = paths::control_dir();
    std::fs::create_dir_all(&control_dir).map_err(|source| FatalError::ControlDirUnavailable {
        path: control_dir.clone(),
        source,
    })?;

    let config_store = vibetunnel_core::config::ConfigStore::load(paths::config_path()).await?;
    let _watcher = config_store.spawn_watcher()?;

    let manager = Arc::new(SessionManager::new(control_dir.clone()).await?);
    let git = Arc::new(CliGitOps::new());
    let event_sink = Arc::new(control::socket::NoGitEventSink);
    let socket = Arc::new(control::socket::ControlSocket::new(Arc::clone(&manager), git, event_sink));

    // Materializer + stream watcher are started per-session inside
    // `SessionManager::create`; the aggregator multiplexes whatever
    // sessions exist over those feeds for the external transport layer to
    // consume (§4.G, §4.M).
    let remotes = Arc::new(RemoteRegistry::new());
    let _aggregator = Aggregator::new(Arc::clone(&manager), Arc::new(NoRemoteSnapshotSource), Arc::clone(&remotes));

    if let Some(hq_client) = wiring::hq_client_from_env() {
        tokio::spawn(async move {
            if let Err(err) = hq_client.register(wiring::HQ_REGISTER_MAX_ATTEMPTS).await {
                tracing::warn!(error = %err, "giving up on HQ registration, running un-federated");
            } else {
                tracing::info!("registered with HQ");
            }
        });
    }

    tracing::info!(control_dir = %control_dir.display(), "vibetunnel daemon ready");

    let socket_path = paths::control_socket_path();
    socket.serve(&socket_path).await?;
    Ok(())
}

async fn run_one_shot(command: Commands) -> anyhow::Result<()> {
    let manager = Arc::new(SessionManager::new(paths::control_dir()).await?);

    match command {
        Commands::Daemon => unreachable!("handled in main"),
        Commands::Create { argv } => {
            let cwd = std::env::current_dir()?;
            let config = SessionConfig {
                argv,
                cwd,
                env: Vec::new(),
                name: "vt".to_owned(),
                cols: 80,
                rows: 24,
                title_mode: TitleMode::None,
                git: None,
            };
            let id = manager.create(config).await?;
            println!("{id}");
        }
        Commands::List => {
            for info in manager.list().await? {
                println!("{}\t{:?}\t{}", info.session.id, info.derived_status, info.session.name);
            }
        }
        Commands::Attach { id } => {
            let path = manager.attach(&id).await?;
            println!("{}", path.display());
        }
        Commands::Kill { id, signal } => {
            manager.kill(&id, signal).await?;
        }
        Commands::Cleanup { max_age_secs } => {
            let removed = manager.cleanup(Duration::from_secs(max_age_secs)).await?;
            for id in removed {
                println!("{id}");
            }
        }
    }
    Ok(())
}

