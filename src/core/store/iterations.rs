use anyhow::Result;
use rusqlite::types::Value;
use rusqlite::{Row, params};
use std::collections::BTreeSet;

use super::{SqliteStore, StoreError, parse_time};
use crate::core::orchestrator::{Iteration, IterationState};

pub(super) enum IterationKey<'a> {
    Id(&'a str),
    Position(u32),
}

const ITERATION_COLUMNS: &str =
    "iteration_id, position, start_time, end_time, model_id, sample_ids_json, status";

struct IterationRow {
    id: String,
    position: u32,
    start_time: String,
    end_time: Option<String>,
    model_id: Option<String>,
    sample_ids_json: String,
    status: String,
}

impl IterationRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            position: row.get(1)?,
            start_time: row.get(2)?,
            end_time: row.get(3)?,
            model_id: row.get(4)?,
            sample_ids_json: row.get(5)?,
            status: row.get(6)?,
        })
    }

    fn into_iteration(self) -> Result<Iteration> {
        let status = IterationState::from_status(&self.status).ok_or_else(|| StoreError::Corrupt {
            entity: "iteration",
            reason: format!("unknown status '{}'", self.status),
        })?;
        let sample_ids: BTreeSet<String> = serde_json::from_str(&self.sample_ids_json)?;
        let end_time = match self.end_time {
            Some(t) => Some(parse_time("iteration", &t)?),
            None => None,
        };
        Ok(Iteration::restore(
            self.id,
            self.position,
            parse_time("iteration", &self.start_time)?,
            end_time,
            self.model_id,
            sample_ids,
            status,
        ))
    }
}

impl SqliteStore {
    /// Fails if a row already exists for the iteration's position.
    pub(super) async fn insert_iteration(&self, iteration: &Iteration) -> Result<String> {
        let sample_ids = serde_json::to_string(iteration.sample_ids())?;
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO iterations (iteration_id, position, start_time, end_time, model_id, sample_ids_json, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                iteration.id,
                iteration.position,
                iteration.start_time.to_rfc3339(),
                iteration.end_time.map(|t| t.to_rfc3339()),
                iteration.model_id,
                sample_ids,
                iteration.status.as_str()
            ],
        )?;
        Ok(iteration.id.clone())
    }

    /// Updates the mutable columns only; the sample set is never rewritten.
    pub(super) async fn write_iteration(&self, iteration: &Iteration) -> Result<()> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE iterations SET end_time = ?1, model_id = ?2, status = ?3 WHERE iteration_id = ?4",
            params![
                iteration.end_time.map(|t| t.to_rfc3339()),
                iteration.model_id,
                iteration.status.as_str(),
                iteration.id
            ],
        )?;
        if rows == 0 {
            return Err(StoreError::NotFound {
                entity: "iteration",
                id: iteration.id.clone(),
            }
            .into());
        }
        Ok(())
    }

    pub(super) async fn select_iteration(&self, key: IterationKey<'_>) -> Result<Option<Iteration>> {
        let (clause, param) = match key {
            IterationKey::Id(id) => ("iteration_id = ?1", Value::Text(id.to_string())),
            IterationKey::Position(position) => ("position = ?1", Value::Integer(position.into())),
        };
        let row = {
            let db = self.db.lock().await;
            let mut stmt = db.prepare(&format!(
                "SELECT {} FROM iterations WHERE {} LIMIT 1",
                ITERATION_COLUMNS, clause
            ))?;
            let mut rows = stmt.query(params![param])?;
            match rows.next()? {
                Some(row) => Some(IterationRow::read(row)?),
                None => None,
            }
        };
        row.map(IterationRow::into_iteration).transpose()
    }

    pub(super) async fn select_all_iterations(&self) -> Result<Vec<Iteration>> {
        let rows = {
            let db = self.db.lock().await;
            let mut stmt = db.prepare(&format!(
                "SELECT {} FROM iterations ORDER BY position ASC",
                ITERATION_COLUMNS
            ))?;
            let mapped = stmt.query_map([], IterationRow::read)?;
            let mut out = Vec::new();
            for row in mapped {
                out.push(row?);
            }
            out
        };
        rows.into_iter().map(IterationRow::into_iteration).collect()
    }
}
