//! Durable JSON config store (§4.L): `<controlDir>/config.json`.
//!
//! Loading follows the teacher's `FeatureFlags::load` layering (defaults →
//! on-disk file → validation), generalized here to a single JSON document
//! rather than TOML-plus-env-plus-CLI, since §4.L's config is runtime state
//! mutated through `updateQuickStartCommands`-style calls, not a
//! restart-only flag set. Validation failure replaces the on-disk content
//! with defaults rather than refusing to start (§4.L). Mutations go through
//! one serialized writer; a `notify` watcher (shared with §4.E's tailing
//! approach) reloads on external edits once the file has been stable for
//! ~500ms, then invokes registered change callbacks, catching and logging
//! any callback panic/error the way the teacher's own flag loader isolates
//! TOML-parse failures from the rest of startup.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::errors::ValidationError;

/// Current config schema version (§3, §6).
pub const SCHEMA_VERSION: u32 = 1;

/// Debounce window before treating an external edit as settled (§4.L).
pub const RELOAD_STABILITY_WINDOW: Duration = Duration::from_millis(500);

/// One entry in `quickStartCommands` (§3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuickStartCommand {
    /// The shell command to run. Must be non-empty.
    pub command: String,
    /// Optional display name.
    pub name: Option<String>,
}

/// The persisted config document (§3, §6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Schema version of this document.
    pub schema_version: u32,
    /// Base path new sessions default their working directory under.
    pub repository_base_path: Option<String>,
    /// Ordered quick-start commands offered by the caller's UI.
    pub quick_start_commands: Vec<QuickStartCommand>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            repository_base_path: None,
            quick_start_commands: Vec::new(),
        }
    }
}

impl Config {
    /// Validate this document against the schema (§3, §8 property 6).
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::EmptyQuickStartCommand`] if any entry's
    /// `command` is empty.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (index, entry) in self.quick_start_commands.iter().enumerate() {
            if entry.command.trim().is_empty() {
                return Err(ValidationError::EmptyQuickStartCommand { index });
            }
        }
        Ok(())
    }
}

/// A registered callback, invoked with the newly loaded config after a
/// reload. Exceptions (panics) are caught so one bad callback cannot take
/// down the reload loop (§4.L).
pub type ChangeCallback = Arc<dyn Fn(&Config) + Send + Sync>;

/// Owns the on-disk config, its in-memory mirror, and the reload watcher.
pub struct ConfigStore {
    path: PathBuf,
    current: RwLock<Config>,
    writer_lock: Mutex<()>,
    callbacks: RwLock<Vec<ChangeCallback>>,
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore").field("path", &self.path).finish_non_exhaustive()
    }
}

impl ConfigStore {
    /// Load the config at `path`, validating it and replacing invalid or
    /// missing content with defaults (§4.L).
    ///
    /// # Errors
    ///
    /// Returns an IO error if the defaulted document could not be written
    /// back to disk.
    pub async fn load(path: PathBuf) -> std::io::Result<Arc<Self>> {
        let loaded = Self::read_or_default(&path).await?;
        let store = Arc::new(Self {
            path,
            current: RwLock::new(loaded),
            writer_lock: Mutex::new(()),
            callbacks: RwLock::new(Vec::new()),
        });
        Ok(store)
    }

    async fn read_or_default(path: &PathBuf) -> std::io::Result<Config> {
        let Ok(raw) = tokio::fs::read_to_string(path).await else {
            let config = Config::default();
            Self::write_atomic(path, &config).await?;
            return Ok(config);
        };

        let parsed = serde_json::from_str::<Config>(&raw).ok().filter(|c| c.validate().is_ok());
        match parsed {
            Some(config) => Ok(config),
            None => {
                let config = Config::default();
                Self::write_atomic(path, &config).await?;
                Ok(config)
            }
        }
    }

    async fn write_atomic(path: &PathBuf, config: &Config) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(config)?;
        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, json).await?;
        tokio::fs::rename(&tmp_path, path).await
    }

    /// The current in-memory config.
    pub async fn current(&self) -> Config {
        self.current.read().await.clone()
    }

    /// Replace `quickStartCommands` atomically. On validation failure the
    /// on-disk file is left untouched and the in-memory mirror is not
    /// updated (§8 property 6).
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if `commands` contains an empty command,
    /// or wraps an IO error if the write fails.
    pub async fn update_quick_start_commands(
        &self,
        commands: Vec<QuickStartCommand>,
    ) -> Result<(), UpdateConfigError> {
        let _guard = self.writer_lock.lock().await;
        let mut next = self.current.read().await.clone();
        next.quick_start_commands = commands;
        next.validate()?;
        Self::write_atomic(&self.path, &next).await.map_err(UpdateConfigError::Io)?;
        *self.current.write().await = next;
        Ok(())
    }

    /// Register a callback invoked after every successful external reload.
    pub async fn on_change(&self, callback: ChangeCallback) {
        self.callbacks.write().await.push(callback);
    }

    /// Start a `notify`-based watcher that reloads the config after an
    /// external edit settles for [`RELOAD_STABILITY_WINDOW`] (§4.L).
    #[must_use]
    pub fn spawn_watcher(self: &Arc<Self>) -> std::io::Result<RecommendedWatcher> {
        let (tx, mut rx) = mpsc::channel(16);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if res.is_ok() {
                let _ = tx.try_send(());
            }
        })
        .map_err(|e| std::io::Error::other(e.to_string()))?;
        watcher.watch(&self.path, RecursiveMode::NonRecursive).map_err(|e| std::io::Error::other(e.to_string()))?;

        let store = Arc::clone(self);
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                // Drain any further events that arrive within the stability
                // window so rapid successive writes settle into one reload.
                loop {
                    tokio::select! {
                        _ = rx.recv() => continue,
                        () = tokio::time::sleep(RELOAD_STABILITY_WINDOW) => break,
                    }
                }
                store.reload().await;
            }
        });

        Ok(watcher)
    }

    async fn reload(&self) {
        let Ok(loaded) = Self::read_or_default(&self.path).await else {
            return;
        };
        *self.current.write().await = loaded.clone();
        for callback in self.callbacks.read().await.iter() {
            let callback = Arc::clone(callback);
            let config = loaded.clone();
            // Isolate a panicking callback from the reload loop (§4.L:
            // "callbacks' exceptions are caught and logged").
            if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(&config))) {
                tracing::warn!(?panic, "config change callback panicked");
            }
        }
    }
}

/// Failure updating the config through [`ConfigStore::update_quick_start_commands`].
#[derive(Debug, thiserror::Error)]
pub enum UpdateConfigError {
    /// The proposed document failed validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// The write to disk failed.
    #[error("failed to persist config: {0}")]
    Io(std::io::Error),
}
