//! Hot reload support for configuration changes.
//!
//! The watcher holds the active configuration behind an `ArcSwap`. A new
//! configuration is applied in two phases: every registered listener first
//! prepares it, and only when all of them accept are their commits run and
//! the snapshot published. A single refusal leaves every listener and the
//! snapshot on the previous configuration.

use crate::loader::{ConfigError, ConfigLoader, DEFAULT_ENV_PREFIX};
use crate::schema::GatewayConfig;
use arc_swap::ArcSwap;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Deferred change a listener makes once every listener has accepted
pub type ReloadCommit = Box<dyn FnOnce() + Send>;

/// Prepares a candidate configuration, returning its commit or a refusal
pub type ReloadListener = Arc<dyn Fn(&GatewayConfig) -> Result<ReloadCommit, String> + Send + Sync>;

/// Quiet period after the last file event before reloading
const DEBOUNCE: Duration = Duration::from_millis(500);

/// Configuration watcher for hot reload
pub struct ConfigWatcher {
    config: Arc<ArcSwap<GatewayConfig>>,
    listeners: Arc<RwLock<Vec<ReloadListener>>>,
    env_prefix: String,
    _watcher: Option<RecommendedWatcher>,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl ConfigWatcher {
    /// Create a new config watcher with the given initial configuration
    #[must_use]
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config: Arc::new(ArcSwap::from_pointee(config)),
            listeners: Arc::new(RwLock::new(Vec::new())),
            env_prefix: DEFAULT_ENV_PREFIX.to_string(),
            _watcher: None,
            shutdown_tx: None,
        }
    }

    /// Use a different environment override prefix on reload
    #[must_use]
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Register a listener
    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&GatewayConfig) -> Result<ReloadCommit, String> + Send + Sync + 'static,
    {
        self.listeners.write().push(Arc::new(listener));
    }

    /// Get the shared configuration handle
    #[must_use]
    pub fn config(&self) -> Arc<ArcSwap<GatewayConfig>> {
        Arc::clone(&self.config)
    }

    /// Get a snapshot of the current configuration
    #[must_use]
    pub fn load(&self) -> Arc<GatewayConfig> {
        self.config.load_full()
    }

    /// Offer a configuration to listeners and publish it if all accept
    ///
    /// # Errors
    /// Returns `ConfigError::Validation` with the first listener's reason
    pub fn update(&self, new_config: GatewayConfig) -> Result<(), ConfigError> {
        apply(&self.config, &self.listeners, new_config)?;
        info!("Configuration updated");
        Ok(())
    }

    /// Start watching a configuration file for changes
    ///
    /// # Errors
    /// Returns error if file watching cannot be started
    pub fn watch_file(&mut self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref().to_path_buf();
        let config = Arc::clone(&self.config);
        let listeners = Arc::clone(&self.listeners);
        let env_prefix = self.env_prefix.clone();

        let (tx, mut rx) = mpsc::channel::<()>(16);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let file_name = path.file_name().map(ToOwned::to_owned);
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
            Ok(event) => {
                let relevant = (event.kind.is_modify() || event.kind.is_create())
                    && event
                        .paths
                        .iter()
                        .any(|p| p.file_name().map(ToOwned::to_owned) == file_name);
                if relevant {
                    debug!(paths = ?event.paths, "Configuration file changed");
                    // A full channel already guarantees a pending reload.
                    let _ = tx.try_send(());
                }
            }
            Err(e) => error!(error = %e, "File watch error"),
        })
        .map_err(|e| ConfigError::Io(std::io::Error::other(e)))?;

        let watch_path = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        watcher
            .watch(watch_path, RecursiveMode::NonRecursive)
            .map_err(|e| ConfigError::Io(std::io::Error::other(e)))?;

        info!(path = %path.display(), "Watching configuration file");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(()) = rx.recv() => {
                        // Wait for the writer to go quiet, then collapse queued events.
                        tokio::time::sleep(DEBOUNCE).await;
                        while rx.try_recv().is_ok() {}

                        info!(path = %path.display(), "Reloading configuration");
                        match reload_config(&path, &env_prefix).await {
                            Ok(new_config) => match apply(&config, &listeners, new_config) {
                                Ok(()) => info!("Configuration reloaded successfully"),
                                Err(e) => error!(error = %e, "Reloaded configuration refused, keeping previous"),
                            },
                            Err(e) => error!(error = %e, "Failed to reload configuration, keeping previous"),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Configuration watcher shutting down");
                        break;
                    }
                }
            }
        });

        self._watcher = Some(watcher);
        self.shutdown_tx = Some(shutdown_tx);

        Ok(())
    }

    /// Stop watching for configuration changes
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        self._watcher = None;
    }

    /// Manually trigger a configuration reload
    ///
    /// # Errors
    /// Returns error if loading fails or a listener refuses the result
    pub async fn reload(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let new_config = reload_config(path.as_ref(), &self.env_prefix).await?;
        apply(&self.config, &self.listeners, new_config)?;
        info!("Configuration manually reloaded");
        Ok(())
    }
}

impl std::fmt::Debug for ConfigWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigWatcher")
            .field("listeners", &self.listeners.read().len())
            .field("watching", &self._watcher.is_some())
            .finish()
    }
}

async fn reload_config(path: &Path, env_prefix: &str) -> Result<GatewayConfig, ConfigError> {
    ConfigLoader::new()
        .with_file(path.to_string_lossy().to_string())
        .with_env_prefix(env_prefix)
        .load()
        .await
}

fn apply(
    config: &ArcSwap<GatewayConfig>,
    listeners: &RwLock<Vec<ReloadListener>>,
    new_config: GatewayConfig,
) -> Result<(), ConfigError> {
    let listeners: Vec<ReloadListener> = listeners.read().clone();
    let mut commits = Vec::with_capacity(listeners.len());
    for listener in &listeners {
        match listener(&new_config) {
            Ok(commit) => commits.push(commit),
            Err(reason) => {
                warn!(reason = %reason, "Configuration refused by listener");
                return Err(ConfigError::Validation(reason));
            }
        }
    }
    for commit in commits {
        commit();
    }
    config.store(Arc::new(new_config));
    Ok(())
}

/// Watch `path` and return the watcher; the path also seeds the initial configuration
///
/// # Errors
/// Returns error if the initial load or the file watch fails
pub async fn watch_path(path: impl Into<PathBuf>) -> Result<ConfigWatcher, ConfigError> {
    let path = path.into();
    let initial = reload_config(&path, DEFAULT_ENV_PREFIX).await?;
    let mut watcher = ConfigWatcher::new(initial);
    watcher.watch_file(&path)?;
    Ok(watcher)
}
