use anyhow::Result;
use rusqlite::params;

use super::{SqliteStore, StoreError};
use crate::core::metrics::MetricReport;
use crate::core::model::{AnnotationModel, restore_model};

impl SqliteStore {
    pub(super) async fn insert_model(&self, model: &dyn AnnotationModel) -> Result<String> {
        let model_id = uuid::Uuid::new_v4().to_string();
        let artifact = model.to_bytes()?;
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO models (model_id, kind, artifact) VALUES (?1, ?2, ?3)",
            params![model_id, model.kind(), artifact],
        )?;
        Ok(model_id)
    }

    pub(super) async fn select_model(&self, kind: &str, id: &str) -> Result<Box<dyn AnnotationModel>> {
        let found: Option<(String, Vec<u8>)> = {
            let db = self.db.lock().await;
            let mut stmt = db.prepare("SELECT kind, artifact FROM models WHERE model_id = ?1")?;
            let mut rows = stmt.query(params![id])?;
            match rows.next()? {
                Some(row) => Some((row.get(0)?, row.get(1)?)),
                None => None,
            }
        };
        let (stored_kind, artifact) = found.ok_or_else(|| StoreError::NotFound {
            entity: "model",
            id: id.to_string(),
        })?;
        if stored_kind != kind {
            return Err(StoreError::Corrupt {
                entity: "model",
                reason: format!("'{}' is a {} model, expected {}", id, stored_kind, kind),
            }
            .into());
        }
        restore_model(kind, &artifact)
    }

    pub(super) async fn insert_report(&self, report: &MetricReport) -> Result<()> {
        let json = serde_json::to_string(report)?;
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO metric_reports (report_json) VALUES (?1)",
            params![json],
        )?;
        Ok(())
    }

    pub(super) async fn select_latest_report(&self) -> Result<Option<MetricReport>> {
        let json: Option<String> = {
            let db = self.db.lock().await;
            let mut stmt =
                db.prepare("SELECT report_json FROM metric_reports ORDER BY id DESC LIMIT 1")?;
            let mut rows = stmt.query([])?;
            match rows.next()? {
                Some(row) => Some(row.get(0)?),
                None => None,
            }
        };
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json).map_err(|e| {
                StoreError::Corrupt {
                    entity: "metric report",
                    reason: e.to_string(),
                }
            })?)),
            None => Ok(None),
        }
    }
}
