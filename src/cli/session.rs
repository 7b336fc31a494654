use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{Level, debug};
use tracing_appender::non_blocking::WorkerGuard;

use crate::core::config::LoopConfig;
use crate::core::orchestrator::{AnnotationController, Collaborators, LoopSettings};
use crate::core::store::{RetryPolicy, RetryingStore, SqliteStore, Store};
use crate::logging::{init_logging, parse_level};
use crate::platform::{NativePlatform, Platform};

/// Everything a command needs: the data directory, its configuration and a
/// retrying store over the SQLite database.
pub(crate) struct Session {
    pub data_dir: PathBuf,
    pub config: LoopConfig,
    pub store: Arc<dyn Store>,
    _log_guard: WorkerGuard,
}

impl Session {
    pub async fn open(verbose: bool) -> Result<Self> {
        let data_dir = NativePlatform::data_dir();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("creating data directory {}", data_dir.display()))?;
        NativePlatform::restrict_dir_permissions(&data_dir);

        let config = LoopConfig::load(&data_dir).await?;
        let level = if verbose {
            Level::DEBUG
        } else {
            parse_level(&config.log_level)?
        };
        let log_guard = init_logging(level, &data_dir, verbose)?;
        debug!("Using data directory {}", data_dir.display());

        let sqlite = SqliteStore::open(&data_dir).await?;
        let policy = RetryPolicy::from_config(&config.retry);
        let store: Arc<dyn Store> = Arc::new(RetryingStore::new(sqlite, policy));
        Ok(Self {
            data_dir,
            config,
            store,
            _log_guard: log_guard,
        })
    }

    /// Build the configured collaborators and restore the controller state.
    pub async fn controller(&self) -> Result<AnnotationController> {
        let collaborators = Collaborators::from_config(&self.config, self.store.clone())?;
        let settings = LoopSettings::from_config(&self.config, &self.data_dir);
        AnnotationController::load(collaborators, settings).await
    }
}
