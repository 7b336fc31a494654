use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

use super::{LabelPayload, Sample, Span};

/// Annotator id recorded on labels that arrive with an imported dataset.
const IMPORT_ANNOTATOR: &str = "import";

#[derive(Debug, Deserialize)]
struct RawRecord {
    #[serde(default)]
    id: Option<serde_json::Value>,
    text: String,
    #[serde(default)]
    label: Option<RawLabel>,
    #[serde(default)]
    gold: bool,
}

/// Doccano-style labels: a single class, a list of classes (first wins) or a
/// list of `[start, end, label]` triples.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawLabel {
    Class(String),
    Spans(Vec<(usize, usize, String)>),
    Classes(Vec<String>),
}

impl RawLabel {
    fn into_payload(self) -> Option<LabelPayload> {
        match self {
            RawLabel::Class(label) => Some(LabelPayload::Classification { label }),
            RawLabel::Classes(labels) => labels
                .into_iter()
                .next()
                .map(|label| LabelPayload::Classification { label }),
            RawLabel::Spans(triples) => Some(LabelPayload::SequenceLabeling {
                spans: triples
                    .into_iter()
                    .map(|(start, end, label)| Span::new(start, end, label))
                    .collect(),
            }),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub total: usize,
    pub labeled: usize,
    pub pending: usize,
    pub gold: usize,
}

impl ImportSummary {
    pub fn of(samples: &[Sample]) -> Self {
        let labeled = samples.iter().filter(|s| s.validated).count();
        Self {
            total: samples.len(),
            labeled,
            pending: samples.len() - labeled,
            gold: samples.iter().filter(|s| s.is_gold).count(),
        }
    }
}

/// Reads a dataset file (JSON array or JSON lines) into samples.
pub struct DatasetLoader {
    path: PathBuf,
    all_gold: bool,
}

impl DatasetLoader {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            all_gold: false,
        }
    }

    /// Mark every labeled record as part of the held-out gold set.
    pub fn gold(mut self, all_gold: bool) -> Self {
        self.all_gold = all_gold;
        self
    }

    pub async fn load(&self) -> Result<Vec<Sample>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading dataset {}", self.path.display()))?;
        let samples = self.parse(&content)?;
        info!(
            "Loaded {} records from {}",
            samples.len(),
            self.path.display()
        );
        Ok(samples)
    }

    pub fn parse(&self, content: &str) -> Result<Vec<Sample>> {
        let trimmed = content.trim_start();
        let records: Vec<RawRecord> = if trimmed.starts_with('[') {
            serde_json::from_str(trimmed).context("parsing JSON array dataset")?
        } else {
            let mut out = Vec::new();
            for (lineno, line) in content.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let record = serde_json::from_str(line)
                    .with_context(|| format!("parsing JSON line {}", lineno + 1))?;
                out.push(record);
            }
            out
        };

        records
            .into_iter()
            .map(|record| self.to_sample(record))
            .collect()
    }

    fn to_sample(&self, record: RawRecord) -> Result<Sample> {
        let payload = record.label.and_then(RawLabel::into_payload);
        if let Some(LabelPayload::SequenceLabeling { spans }) = &payload
            && let Some(bad) = spans
                .iter()
                .find(|s| s.start > s.end || s.end > record.text.len())
        {
            return Err(anyhow!(
                "span {}..{} ({}) is outside text of length {}",
                bad.start,
                bad.end,
                bad.label,
                record.text.len()
            ));
        }

        let mut sample = match payload {
            Some(payload) => Sample::labeled(record.text, payload, IMPORT_ANNOTATOR)
                .gold(record.gold || self.all_gold),
            None => Sample::pending(record.text),
        };
        if let Some(id) = record.id {
            let id = match id {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            sample = sample.with_id(id);
        }
        Ok(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dataset::AnnotationKind;

    #[test]
    fn parses_json_lines_with_mixed_labels() {
        let content = r#"
{"id": 1, "text": "Alice met Bob", "label": [[0, 5, "PER"], [10, 13, "PER"]]}
{"id": "two", "text": "no label here"}
{"text": "great product", "label": ["positive"], "gold": true}
"#;
        let samples = DatasetLoader::new("unused").parse(content).unwrap();
        assert_eq!(samples.len(), 3);

        assert_eq!(samples[0].id, "1");
        assert!(samples[0].validated);
        assert_eq!(
            samples[0].annotation.as_ref().unwrap().kind(),
            AnnotationKind::SequenceLabeling
        );
        assert_eq!(samples[0].annotation.as_ref().unwrap().sample_id, "1");

        assert_eq!(samples[1].id, "two");
        assert!(!samples[1].validated);
        assert!(samples[1].annotation.is_none());

        assert!(samples[2].is_gold);
        assert_eq!(
            samples[2].payload(),
            Some(&LabelPayload::Classification {
                label: "positive".into()
            })
        );
    }

    #[test]
    fn gold_flag_only_applies_to_labeled_records() {
        let content = r#"[{"text": "a", "label": "x"}, {"text": "b"}]"#;
        let samples = DatasetLoader::new("unused").gold(true).parse(content).unwrap();
        let summary = ImportSummary::of(&samples);
        assert_eq!(
            summary,
            ImportSummary {
                total: 2,
                labeled: 1,
                pending: 1,
                gold: 1
            }
        );
    }

    #[test]
    fn rejects_span_past_end_of_text() {
        let content = r#"[{"text": "short", "label": [[0, 40, "ORG"]]}]"#;
        let err = DatasetLoader::new("unused").parse(content).unwrap_err();
        assert!(err.to_string().contains("outside text"));
    }

    #[tokio::test]
    async fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.jsonl");
        std::fs::write(&path, "{\"text\": \"hello\"}\n").unwrap();
        let samples = DatasetLoader::new(&path).load().await.unwrap();
        assert_eq!(samples.len(), 1);
    }
}
