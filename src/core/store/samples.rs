use anyhow::Result;
use rusqlite::{Row, params};

use super::{SqliteStore, StoreError};
use crate::core::dataset::{Annotation, LabelPayload, Sample};

pub(super) enum SampleFilter {
    /// No accepted label yet.
    Pending,
    Validated { gold: bool },
}

const SAMPLE_COLUMNS: &str = "sample_id, text, annotation_json, validated, is_gold";
const ANNOTATION_COLUMNS: &str =
    "a.annotation_id, a.sample_id, a.iteration_id, a.payload_json, a.is_valid, a.annotator_id";

struct SampleRow {
    id: String,
    text: String,
    annotation_json: Option<String>,
    validated: bool,
    is_gold: bool,
}

impl SampleRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            text: row.get(1)?,
            annotation_json: row.get(2)?,
            validated: row.get(3)?,
            is_gold: row.get(4)?,
        })
    }

    fn into_sample(self) -> Result<Sample> {
        let annotation = match self.annotation_json {
            Some(json) => Some(serde_json::from_str::<Annotation>(&json).map_err(|e| {
                StoreError::Corrupt {
                    entity: "sample",
                    reason: format!("annotation of '{}': {}", self.id, e),
                }
            })?),
            None => None,
        };
        Ok(Sample {
            id: self.id,
            text: self.text,
            annotation,
            validated: self.validated,
            is_gold: self.is_gold,
        })
    }
}

struct AnnotationRow {
    id: String,
    sample_id: String,
    iteration_id: Option<String>,
    payload_json: String,
    is_valid: Option<bool>,
    annotator_id: Option<String>,
}

impl AnnotationRow {
    /// Reads the annotation columns starting at `offset`.
    fn read_at(row: &Row<'_>, offset: usize) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(offset)?,
            sample_id: row.get(offset + 1)?,
            iteration_id: row.get(offset + 2)?,
            payload_json: row.get(offset + 3)?,
            is_valid: row.get(offset + 4)?,
            annotator_id: row.get(offset + 5)?,
        })
    }

    fn into_annotation(self) -> Result<Annotation> {
        let payload: LabelPayload =
            serde_json::from_str(&self.payload_json).map_err(|e| StoreError::Corrupt {
                entity: "annotation",
                reason: format!("payload of '{}': {}", self.id, e),
            })?;
        Ok(Annotation {
            id: self.id,
            sample_id: self.sample_id,
            payload,
            is_valid: self.is_valid,
            annotator_id: self.annotator_id,
            iteration_id: self.iteration_id,
        })
    }
}

impl SqliteStore {
    /// Inserts or refreshes samples. A labeled sample also gets its import-time
    /// annotation row, replacing any earlier one.
    pub(super) async fn insert_samples(&self, samples: &[Sample]) -> Result<()> {
        let mut encoded = Vec::with_capacity(samples.len());
        for sample in samples {
            let annotation_json = sample
                .annotation
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            let payload_json = sample
                .annotation
                .as_ref()
                .map(|a| serde_json::to_string(&a.payload))
                .transpose()?;
            encoded.push((sample, annotation_json, payload_json));
        }

        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        for (sample, annotation_json, payload_json) in &encoded {
            tx.execute(
                "INSERT INTO samples (sample_id, text, annotation_json, validated, is_gold)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(sample_id) DO UPDATE SET
                    text = excluded.text,
                    annotation_json = excluded.annotation_json,
                    validated = excluded.validated,
                    is_gold = excluded.is_gold",
                params![
                    sample.id,
                    sample.text,
                    annotation_json,
                    sample.validated,
                    sample.is_gold
                ],
            )?;
            if let (Some(annotation), Some(payload_json)) = (&sample.annotation, payload_json) {
                tx.execute(
                    "DELETE FROM annotations WHERE sample_id = ?1 AND iteration_id IS ?2",
                    params![sample.id, annotation.iteration_id],
                )?;
                tx.execute(
                    "INSERT INTO annotations (annotation_id, sample_id, iteration_id, kind, payload_json, is_valid, annotator_id)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        annotation.id,
                        sample.id,
                        annotation.iteration_id,
                        annotation.kind().as_str(),
                        payload_json,
                        annotation.is_valid,
                        annotation.annotator_id
                    ],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub(super) async fn select_sample(&self, id: &str) -> Result<Option<Sample>> {
        let row = {
            let db = self.db.lock().await;
            let mut stmt = db.prepare(&format!(
                "SELECT {} FROM samples WHERE sample_id = ?1",
                SAMPLE_COLUMNS
            ))?;
            let mut rows = stmt.query(params![id])?;
            match rows.next()? {
                Some(row) => Some(SampleRow::read(row)?),
                None => None,
            }
        };
        row.map(SampleRow::into_sample).transpose()
    }

    /// Results keep import order.
    pub(super) async fn select_samples(&self, filter: SampleFilter) -> Result<Vec<Sample>> {
        let (clause, gold) = match filter {
            SampleFilter::Pending => ("validated = 0", None),
            SampleFilter::Validated { gold } => ("validated = 1 AND is_gold = ?1", Some(gold)),
        };
        let rows = {
            let db = self.db.lock().await;
            let mut stmt = db.prepare(&format!(
                "SELECT {} FROM samples WHERE {} ORDER BY rowid ASC",
                SAMPLE_COLUMNS, clause
            ))?;
            let mapped = match gold {
                Some(gold) => stmt.query_map(params![gold], SampleRow::read)?,
                None => stmt.query_map([], SampleRow::read)?,
            };
            let mut out = Vec::new();
            for row in mapped {
                out.push(row?);
            }
            out
        };
        rows.into_iter().map(SampleRow::into_sample).collect()
    }

    /// The sample comes back carrying the proposed annotation, not its stored label.
    pub(super) async fn select_pending_annotation(&self, iteration_id: &str) -> Result<Option<Sample>> {
        let found = {
            let db = self.db.lock().await;
            let mut stmt = db.prepare(&format!(
                "SELECT s.sample_id, s.text, s.annotation_json, s.validated, s.is_gold, {}
                 FROM annotations a JOIN samples s ON s.sample_id = a.sample_id
                 WHERE a.iteration_id = ?1 AND a.is_valid IS NULL
                 ORDER BY a.rowid ASC LIMIT 1",
                ANNOTATION_COLUMNS
            ))?;
            let mut rows = stmt.query(params![iteration_id])?;
            match rows.next()? {
                Some(row) => Some((SampleRow::read(row)?, AnnotationRow::read_at(row, 5)?)),
                None => None,
            }
        };
        let Some((sample_row, annotation_row)) = found else {
            return Ok(None);
        };
        let mut sample = sample_row.into_sample()?;
        sample.annotation = Some(annotation_row.into_annotation()?);
        Ok(Some(sample))
    }

    pub(super) async fn select_iteration_annotations(&self, iteration_id: &str) -> Result<Vec<Annotation>> {
        let rows = {
            let db = self.db.lock().await;
            let mut stmt = db.prepare(&format!(
                "SELECT {} FROM annotations a WHERE a.iteration_id = ?1 ORDER BY a.rowid ASC",
                ANNOTATION_COLUMNS
            ))?;
            let mapped = stmt.query_map(params![iteration_id], |row| AnnotationRow::read_at(row, 0))?;
            let mut out = Vec::new();
            for row in mapped {
                out.push(row?);
            }
            out
        };
        rows.into_iter().map(AnnotationRow::into_annotation).collect()
    }

    /// One row per (sample, iteration). Re-saving replaces an undecided proposal
    /// and leaves a decided one alone, so re-running annotation is harmless.
    pub(super) async fn upsert_annotations(&self, annotations: &[Annotation]) -> Result<()> {
        let mut encoded = Vec::with_capacity(annotations.len());
        for annotation in annotations {
            encoded.push((annotation, serde_json::to_string(&annotation.payload)?));
        }

        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        for (annotation, payload_json) in &encoded {
            // NULL iteration ids never conflict, so replace those rows explicitly.
            if annotation.iteration_id.is_none() {
                tx.execute(
                    "DELETE FROM annotations WHERE sample_id = ?1 AND iteration_id IS NULL",
                    params![annotation.sample_id],
                )?;
            }
            tx.execute(
                "INSERT INTO annotations (annotation_id, sample_id, iteration_id, kind, payload_json, is_valid, annotator_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(sample_id, iteration_id) DO UPDATE SET
                    kind = excluded.kind,
                    payload_json = excluded.payload_json,
                    is_valid = excluded.is_valid,
                    annotator_id = excluded.annotator_id
                 WHERE annotations.is_valid IS NULL",
                params![
                    annotation.id,
                    annotation.sample_id,
                    annotation.iteration_id,
                    annotation.kind().as_str(),
                    payload_json,
                    annotation.is_valid,
                    annotation.annotator_id
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Matches on (sample, iteration) so a proposal re-saved after a restart
    /// is still found even though it kept its first id.
    pub(super) async fn write_judgment(&self, sample: &Sample) -> Result<()> {
        let annotation = sample.annotation.as_ref().ok_or_else(|| StoreError::NotFound {
            entity: "annotation",
            id: sample.id.clone(),
        })?;
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE annotations SET is_valid = ?1, annotator_id = ?2
             WHERE sample_id = ?3 AND iteration_id IS ?4",
            params![
                annotation.is_valid,
                annotation.annotator_id,
                sample.id,
                annotation.iteration_id
            ],
        )?;
        if rows == 0 {
            return Err(StoreError::NotFound {
                entity: "annotation",
                id: annotation.id.clone(),
            }
            .into());
        }
        Ok(())
    }

    pub(super) async fn write_sample_label(&self, sample: &Sample) -> Result<()> {
        let annotation_json = sample
            .annotation
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE samples SET annotation_json = ?1, validated = ?2 WHERE sample_id = ?3",
            params![annotation_json, sample.validated, sample.id],
        )?;
        if rows == 0 {
            return Err(StoreError::NotFound {
                entity: "sample",
                id: sample.id.clone(),
            }
            .into());
        }
        Ok(())
    }
}
