use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use super::{AnnotationModel, accepted, tokens};
use crate::core::dataset::{AnnotationKind, LabelPayload, Sample};

/// Label proposed before any classification label has been seen.
pub const UNKNOWN_LABEL: &str = "unknown";

/// Classifies by letting every token vote for the labels it co-occurred with.
/// Falls back to the most frequent label when no token has been seen.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeywordVoteClassifier {
    votes: BTreeMap<String, BTreeMap<String, u32>>,
    label_counts: BTreeMap<String, u32>,
}

impl KeywordVoteClassifier {
    pub const KIND: &'static str = "keyword_vote";

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).context("decoding keyword_vote model")
    }

    fn majority_label(&self) -> Option<&str> {
        self.label_counts
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(label, _)| label.as_str())
    }
}

impl AnnotationModel for KeywordVoteClassifier {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn annotation_kind(&self) -> AnnotationKind {
        AnnotationKind::Classification
    }

    fn fork(&self) -> Box<dyn AnnotationModel> {
        Box::new(self.clone())
    }

    fn finetune(&mut self, samples: &[Sample]) -> Result<()> {
        self.votes.clear();
        self.label_counts.clear();
        for (sample, payload) in accepted(samples) {
            let LabelPayload::Classification { label } = payload else {
                continue;
            };
            *self.label_counts.entry(label.clone()).or_default() += 1;
            let distinct: BTreeSet<String> = tokens(&sample.text).collect();
            for token in distinct {
                *self
                    .votes
                    .entry(token)
                    .or_default()
                    .entry(label.clone())
                    .or_default() += 1;
            }
        }
        debug!(
            "keyword_vote trained: {} labels, {} tokens",
            self.label_counts.len(),
            self.votes.len()
        );
        Ok(())
    }

    fn predict(&self, text: &str) -> LabelPayload {
        let mut scores: BTreeMap<&str, u32> = BTreeMap::new();
        for token in tokens(text).collect::<BTreeSet<_>>() {
            if let Some(labels) = self.votes.get(&token) {
                for (label, count) in labels {
                    *scores.entry(label.as_str()).or_default() += count;
                }
            }
        }
        // Ties go to the more frequent label, then to the alphabetically first.
        let best = scores
            .into_iter()
            .max_by(|a, b| {
                a.1.cmp(&b.1)
                    .then_with(|| self.label_counts.get(a.0).cmp(&self.label_counts.get(b.0)))
                    .then_with(|| b.0.cmp(a.0))
            })
            .map(|(label, _)| label)
            .or_else(|| self.majority_label())
            .unwrap_or(UNKNOWN_LABEL);
        LabelPayload::Classification {
            label: best.to_string(),
        }
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}
