use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::core::config::ConfigError;
use crate::core::dataset::{Annotation, LabelPayload, Sample, Span};

/// Scores predictions against the golden labels.
pub trait Metric: Send + Sync {
    fn name(&self) -> &'static str;

    /// `None` when there is nothing to score.
    fn evaluate(&self, pairs: &[GoldPair<'_>]) -> Option<f64>;
}

/// A golden sample with its label and the model's prediction for it, if any.
pub struct GoldPair<'a> {
    pub text: &'a str,
    pub gold: &'a LabelPayload,
    pub predicted: Option<&'a LabelPayload>,
}

/// Pair each labeled golden sample with the prediction made for it.
pub fn pair_predictions<'a>(gold: &'a [Sample], predicted: &'a [Annotation]) -> Vec<GoldPair<'a>> {
    let by_sample: HashMap<&str, &LabelPayload> = predicted
        .iter()
        .map(|a| (a.sample_id.as_str(), &a.payload))
        .collect();
    gold.iter()
        .filter_map(|s| {
            s.payload().map(|payload| GoldPair {
                text: &s.text,
                gold: payload,
                predicted: by_sample.get(s.id.as_str()).copied(),
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricReport {
    pub golden_size: usize,
    pub values: BTreeMap<String, f64>,
    pub created_at: DateTime<Utc>,
}

impl Default for MetricReport {
    fn default() -> Self {
        Self {
            golden_size: 0,
            values: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }
}

impl MetricReport {
    pub fn compute(metrics: &[Box<dyn Metric>], pairs: &[GoldPair<'_>]) -> Self {
        let mut report = Self {
            golden_size: pairs.len(),
            ..Self::default()
        };
        for metric in metrics {
            if let Some(value) = metric.evaluate(pairs) {
                report.values.insert(metric.name().to_string(), value);
            }
        }
        report
    }
}

pub const METRIC_KINDS: &[&str] = &[Accuracy::KIND, SpanF1::KIND];

pub fn build_metric(kind: &str) -> Result<Box<dyn Metric>, ConfigError> {
    match kind {
        Accuracy::KIND => Ok(Box::new(Accuracy)),
        SpanF1::KIND => Ok(Box::new(SpanF1)),
        other => Err(ConfigError::UnknownMetric(other.to_string())),
    }
}

pub fn build_metrics(kinds: &[String]) -> Result<Vec<Box<dyn Metric>>, ConfigError> {
    kinds.iter().map(|k| build_metric(k)).collect()
}

fn span_set(text: &str, payload: &LabelPayload) -> BTreeSet<Span> {
    payload.spans(text).into_iter().collect()
}

/// Share of golden samples whose prediction matches exactly. Span order is ignored.
pub struct Accuracy;

impl Accuracy {
    pub const KIND: &'static str = "accuracy";
}

impl Metric for Accuracy {
    fn name(&self) -> &'static str {
        Self::KIND
    }

    fn evaluate(&self, pairs: &[GoldPair<'_>]) -> Option<f64> {
        if pairs.is_empty() {
            return None;
        }
        let correct = pairs
            .iter()
            .filter(|p| match p.predicted {
                Some(predicted) => {
                    predicted.kind() == p.gold.kind()
                        && span_set(p.text, predicted) == span_set(p.text, p.gold)
                }
                None => false,
            })
            .count();
        Some(correct as f64 / pairs.len() as f64)
    }
}

/// Micro-averaged F1 over exact (start, end, label) matches.
pub struct SpanF1;

impl SpanF1 {
    pub const KIND: &'static str = "span_f1";
}

impl Metric for SpanF1 {
    fn name(&self) -> &'static str {
        Self::KIND
    }

    fn evaluate(&self, pairs: &[GoldPair<'_>]) -> Option<f64> {
        if pairs.is_empty() {
            return None;
        }
        let (mut tp, mut fp, mut fn_) = (0usize, 0usize, 0usize);
        for pair in pairs {
            let gold = span_set(pair.text, pair.gold);
            let predicted = pair
                .predicted
                .map(|p| span_set(pair.text, p))
                .unwrap_or_default();
            let hits = gold.intersection(&predicted).count();
            tp += hits;
            fp += predicted.len() - hits;
            fn_ += gold.len() - hits;
        }
        let denominator = 2 * tp + fp + fn_;
        if denominator == 0 {
            // Nothing to find and nothing proposed.
            return Some(1.0);
        }
        Some(2.0 * tp as f64 / denominator as f64)
    }
}
