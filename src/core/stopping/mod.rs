use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::core::config::{ConfigError, StoppingConditionConfig};
use crate::core::orchestrator::Iteration;
use crate::core::store::Store;

/// Decides whether the loop may stop after `iteration`.
#[async_trait]
pub trait StopCondition: Send + Sync {
    fn name(&self) -> &'static str;

    async fn evaluate(&self, iteration: &Iteration) -> Result<bool>;
}

pub const STOP_CONDITION_KINDS: &[&str] = &[AcceptanceRateCondition::KIND];

pub fn build_stop_condition(
    config: &StoppingConditionConfig,
    store: Arc<dyn Store>,
) -> Result<Box<dyn StopCondition>, ConfigError> {
    match config.kind.as_str() {
        AcceptanceRateCondition::KIND => {
            let threshold = config.threshold.ok_or_else(|| ConfigError::MissingParameter {
                owner: AcceptanceRateCondition::KIND.to_string(),
                param: "threshold".to_string(),
            })?;
            Ok(Box::new(AcceptanceRateCondition::new(store, threshold)?))
        }
        other => Err(ConfigError::UnknownStoppingCondition(other.to_string())),
    }
}

pub fn build_stop_conditions(
    configs: &[StoppingConditionConfig],
    store: Arc<dyn Store>,
) -> Result<Vec<Box<dyn StopCondition>>, ConfigError> {
    configs
        .iter()
        .map(|c| build_stop_condition(c, store.clone()))
        .collect()
}

/// Satisfied once the share of accepted proposals among all of the
/// iteration's proposals reaches the threshold. Undecided proposals count
/// against the rate. An iteration without proposals is not satisfied.
pub struct AcceptanceRateCondition {
    store: Arc<dyn Store>,
    threshold: f64,
}

impl AcceptanceRateCondition {
    pub const KIND: &'static str = "acceptance_rate";

    pub fn new(store: Arc<dyn Store>, threshold: f64) -> Result<Self, ConfigError> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::InvalidValue {
                param: "threshold".into(),
                reason: format!("{} is outside [0, 1]", threshold),
            });
        }
        Ok(Self { store, threshold })
    }
}

#[async_trait]
impl StopCondition for AcceptanceRateCondition {
    fn name(&self) -> &'static str {
        Self::KIND
    }

    async fn evaluate(&self, iteration: &Iteration) -> Result<bool> {
        let annotations = self.store.iteration_annotations(&iteration.id).await?;
        if annotations.is_empty() {
            debug!("Acceptance rate undecidable for iteration {}", iteration.position);
            return Ok(false);
        }
        let accepted = annotations
            .iter()
            .filter(|a| a.is_valid == Some(true))
            .count();
        let rate = accepted as f64 / annotations.len() as f64;
        debug!(
            "Acceptance rate for iteration {}: {}/{} = {:.3} (threshold {})",
            iteration.position,
            accepted,
            annotations.len(),
            rate,
            self.threshold
        );
        Ok(rate >= self.threshold)
    }
}
