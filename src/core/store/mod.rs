mod artifacts;
mod experiments;
mod iterations;
mod retry;
mod samples;

pub use retry::{RetryPolicy, RetryingStore, is_transient};

use iterations::IterationKey;
use samples::SampleFilter;

use anyhow::Result;
use async_trait::async_trait;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::core::dataset::{Annotation, Sample};
use crate::core::metrics::MetricReport;
use crate::core::model::AnnotationModel;
use crate::core::orchestrator::{Experiment, Iteration};
use crate::platform::{NativePlatform, Platform};

pub const DB_FILE: &str = "labelloop.db";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A failure worth retrying (lost connection, busy database).
    #[error("transient store failure: {0}")]
    Transient(String),
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },
    #[error("corrupt {entity} row: {reason}")]
    Corrupt { entity: &'static str, reason: String },
}

/// Persistence operations the controller depends on.
///
/// Implementations do not retry; wrap them in [`RetryingStore`] for that.
#[async_trait]
pub trait Store: Send + Sync {
    async fn save_experiment(&self, experiment: &Experiment) -> Result<()>;
    /// The most recently saved experiment row, which is the authoritative one.
    async fn latest_experiment(&self) -> Result<Option<Experiment>>;

    async fn save_iteration(&self, iteration: &Iteration) -> Result<String>;
    async fn update_iteration(&self, iteration: &Iteration) -> Result<()>;
    async fn get_iteration(&self, id: &str) -> Result<Option<Iteration>>;
    async fn iteration_at(&self, position: u32) -> Result<Option<Iteration>>;
    async fn list_iterations(&self) -> Result<Vec<Iteration>>;

    async fn save_samples(&self, samples: &[Sample]) -> Result<()>;
    async fn get_sample(&self, id: &str) -> Result<Option<Sample>>;
    /// Samples without an accepted label.
    async fn pending_samples(&self) -> Result<Vec<Sample>>;
    /// One sample of the iteration whose proposed annotation awaits a decision.
    async fn pending_annotation(&self, iteration_id: &str) -> Result<Option<Sample>>;
    async fn iteration_annotations(&self, iteration_id: &str) -> Result<Vec<Annotation>>;
    async fn save_annotations(&self, annotations: &[Annotation]) -> Result<()>;
    /// Persist the judgment carried by the sample's current annotation.
    async fn update_annotation(&self, sample: &Sample) -> Result<()>;
    /// Persist the sample row itself: its current label and `validated` flag.
    async fn save_sample_annotation(&self, sample: &Sample) -> Result<()>;
    /// Validated samples in (`is_gold == true`) or out of the gold set.
    async fn golden_samples(&self, is_gold: bool) -> Result<Vec<Sample>>;

    async fn save_model(&self, model: &dyn AnnotationModel) -> Result<String>;
    async fn load_model(&self, kind: &str, id: &str) -> Result<Box<dyn AnnotationModel>>;

    async fn save_metric_report(&self, report: &MetricReport) -> Result<()>;
    async fn latest_metric_report(&self) -> Result<Option<MetricReport>>;
}

pub struct SqliteStore {
    db: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    pub async fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        if !data_dir.exists() {
            tokio::fs::create_dir_all(&data_dir).await?;
        }
        NativePlatform::restrict_dir_permissions(&data_dir);

        let db_path = data_dir.join(DB_FILE);
        let db = Connection::open(&db_path)?;
        NativePlatform::restrict_file_permissions(&db_path);
        db.busy_timeout(std::time::Duration::from_secs(5))?;
        create_schema(&db)?;
        info!("Opened store at {}", db_path.display());

        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            path: Some(db_path),
        })
    }

    /// A private in-memory database. Nothing touches the filesystem.
    pub fn open_in_memory() -> Result<Self> {
        let db = Connection::open_in_memory()?;
        create_schema(&db)?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn create_schema(db: &Connection) -> Result<()> {
    db.execute_batch(
        "CREATE TABLE IF NOT EXISTS experiments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            iteration_id TEXT,
            position INTEGER NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS iterations (
            iteration_id TEXT PRIMARY KEY,
            position INTEGER NOT NULL UNIQUE,
            start_time TEXT NOT NULL,
            end_time TEXT,
            model_id TEXT,
            sample_ids_json TEXT NOT NULL,
            status TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS samples (
            sample_id TEXT PRIMARY KEY,
            text TEXT NOT NULL,
            annotation_json TEXT,
            validated INTEGER NOT NULL DEFAULT 0,
            is_gold INTEGER NOT NULL DEFAULT 0,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS annotations (
            annotation_id TEXT PRIMARY KEY,
            sample_id TEXT NOT NULL,
            iteration_id TEXT,
            kind TEXT NOT NULL,
            payload_json TEXT NOT NULL,
            is_valid INTEGER,
            annotator_id TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS models (
            model_id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            artifact BLOB NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS metric_reports (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            report_json TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_annotations_sample_iteration
            ON annotations(sample_id, iteration_id);
        CREATE INDEX IF NOT EXISTS idx_annotations_iteration_valid
            ON annotations(iteration_id, is_valid);
        CREATE INDEX IF NOT EXISTS idx_samples_validated_gold
            ON samples(validated, is_gold);",
    )?;
    Ok(())
}

#[async_trait]
impl Store for SqliteStore {
    async fn save_experiment(&self, experiment: &Experiment) -> Result<()> {
        self.insert_experiment(experiment).await
    }

    async fn latest_experiment(&self) -> Result<Option<Experiment>> {
        self.select_latest_experiment().await
    }

    async fn save_iteration(&self, iteration: &Iteration) -> Result<String> {
        self.insert_iteration(iteration).await
    }

    async fn update_iteration(&self, iteration: &Iteration) -> Result<()> {
        self.write_iteration(iteration).await
    }

    async fn get_iteration(&self, id: &str) -> Result<Option<Iteration>> {
        self.select_iteration(IterationKey::Id(id)).await
    }

    async fn iteration_at(&self, position: u32) -> Result<Option<Iteration>> {
        self.select_iteration(IterationKey::Position(position))
            .await
    }

    async fn list_iterations(&self) -> Result<Vec<Iteration>> {
        self.select_all_iterations().await
    }

    async fn save_samples(&self, samples: &[Sample]) -> Result<()> {
        self.insert_samples(samples).await
    }

    async fn get_sample(&self, id: &str) -> Result<Option<Sample>> {
        self.select_sample(id).await
    }

    async fn pending_samples(&self) -> Result<Vec<Sample>> {
        self.select_samples(SampleFilter::Pending).await
    }

    async fn pending_annotation(&self, iteration_id: &str) -> Result<Option<Sample>> {
        self.select_pending_annotation(iteration_id).await
    }

    async fn iteration_annotations(&self, iteration_id: &str) -> Result<Vec<Annotation>> {
        self.select_iteration_annotations(iteration_id).await
    }

    async fn save_annotations(&self, annotations: &[Annotation]) -> Result<()> {
        self.upsert_annotations(annotations).await
    }

    async fn update_annotation(&self, sample: &Sample) -> Result<()> {
        self.write_judgment(sample).await
    }

    async fn save_sample_annotation(&self, sample: &Sample) -> Result<()> {
        self.write_sample_label(sample).await
    }

    async fn golden_samples(&self, is_gold: bool) -> Result<Vec<Sample>> {
        self.select_samples(SampleFilter::Validated { gold: is_gold })
            .await
    }

    async fn save_model(&self, model: &dyn AnnotationModel) -> Result<String> {
        self.insert_model(model).await
    }

    async fn load_model(&self, kind: &str, id: &str) -> Result<Box<dyn AnnotationModel>> {
        self.select_model(kind, id).await
    }

    async fn save_metric_report(&self, report: &MetricReport) -> Result<()> {
        self.insert_report(report).await
    }

    async fn latest_metric_report(&self) -> Result<Option<MetricReport>> {
        self.select_latest_report().await
    }
}

pub(crate) fn parse_time(
    entity: &'static str,
    value: &str,
) -> Result<chrono::DateTime<chrono::Utc>, StoreError> {
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&chrono::Utc))
        .map_err(|e| StoreError::Corrupt {
            entity,
            reason: format!("bad timestamp '{}': {}", value, e),
        })
}
