use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use super::{AnnotationModel, accepted};
use crate::core::dataset::{AnnotationKind, LabelPayload, Sample, Span};

/// Remembers every surface form a human tagged and tags all later occurrences
/// of it with its most frequent category. Longer forms win over overlapping
/// shorter ones; matches must sit on word boundaries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GazetteerTagger {
    entries: BTreeMap<String, BTreeMap<String, u32>>,
}

impl GazetteerTagger {
    pub const KIND: &'static str = "gazetteer";

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).context("decoding gazetteer model")
    }

    fn category(labels: &BTreeMap<String, u32>) -> Option<&str> {
        labels
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(label, _)| label.as_str())
    }
}

fn on_word_boundary(text: &str, start: usize, end: usize) -> bool {
    let before = text[..start].chars().next_back();
    let after = text[end..].chars().next();
    !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
}

impl AnnotationModel for GazetteerTagger {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn annotation_kind(&self) -> AnnotationKind {
        AnnotationKind::SequenceLabeling
    }

    fn fork(&self) -> Box<dyn AnnotationModel> {
        Box::new(self.clone())
    }

    fn finetune(&mut self, samples: &[Sample]) -> Result<()> {
        self.entries.clear();
        for (sample, payload) in accepted(samples) {
            let LabelPayload::SequenceLabeling { spans } = payload else {
                continue;
            };
            for span in spans {
                let Some(surface) = sample.text.get(span.start..span.end) else {
                    continue;
                };
                let surface = surface.trim();
                if surface.is_empty() {
                    continue;
                }
                *self
                    .entries
                    .entry(surface.to_string())
                    .or_default()
                    .entry(span.label.clone())
                    .or_default() += 1;
            }
        }
        debug!("gazetteer trained: {} surface forms", self.entries.len());
        Ok(())
    }

    fn predict(&self, text: &str) -> LabelPayload {
        let mut forms: Vec<(&String, &BTreeMap<String, u32>)> = self.entries.iter().collect();
        forms.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(b.0)));

        let mut spans: Vec<Span> = Vec::new();
        for (surface, labels) in forms {
            let Some(label) = Self::category(labels) else {
                continue;
            };
            for (start, matched) in text.match_indices(surface.as_str()) {
                let end = start + matched.len();
                if !on_word_boundary(text, start, end) {
                    continue;
                }
                if spans.iter().any(|s| start < s.end && s.start < end) {
                    continue;
                }
                spans.push(Span::new(start, end, label));
            }
        }
        spans.sort();
        LabelPayload::SequenceLabeling { spans }
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}
