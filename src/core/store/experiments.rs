use anyhow::Result;
use rusqlite::params;

use super::{SqliteStore, parse_time};
use crate::core::orchestrator::Experiment;

impl SqliteStore {
    pub(super) async fn insert_experiment(&self, experiment: &Experiment) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO experiments (iteration_id, position, status, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                experiment.current_iteration_id,
                experiment.position,
                experiment.status,
                experiment.created_at.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// Rows are append-only, so the highest rowid is the latest state.
    pub(super) async fn select_latest_experiment(&self) -> Result<Option<Experiment>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT iteration_id, position, status, created_at FROM experiments ORDER BY id DESC LIMIT 1",
        )?;
        let mut rows = stmt.query([])?;
        if let Some(row) = rows.next()? {
            let created_at: String = row.get(3)?;
            Ok(Some(Experiment {
                current_iteration_id: row.get(0)?,
                position: row.get(1)?,
                status: row.get(2)?,
                created_at: parse_time("experiment", &created_at)?,
            }))
        } else {
            Ok(None)
        }
    }
}
