use anyhow::Result;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use super::{Store, StoreError};
use crate::core::config::RetryConfig;
use crate::core::dataset::{Annotation, Sample};
use crate::core::metrics::MetricReport;
use crate::core::model::AnnotationModel;
use crate::core::orchestrator::{Experiment, Iteration};

/// Bounded retries with exponential backoff. Only transient failures are retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
        }
    }

    /// Delay before retry number `attempt` (1-based): base * 2^(attempt-1), capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub async fn run<T, F, Fut>(&self, op: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if is_transient(&e) && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        "Store call '{}' failed (attempt {}/{}), retrying in {:?}: {:#}",
                        op, attempt, self.max_attempts, delay, e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if is_transient(&e) => {
                    return Err(e.context(format!("{} failed after {} attempts", op, attempt)));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Transient means `StoreError::Transient` or SQLite reporting a busy or locked database.
pub fn is_transient(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if let Some(StoreError::Transient(_)) = cause.downcast_ref::<StoreError>() {
            return true;
        }
        if let Some(rusqlite::Error::SqliteFailure(failure, _)) = cause.downcast_ref::<rusqlite::Error>() {
            return matches!(
                failure.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            );
        }
        false
    })
}

/// A [`Store`] that applies a [`RetryPolicy`] to every call of the wrapped store.
pub struct RetryingStore<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S: Store> RetryingStore<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: Store> Store for RetryingStore<S> {
    async fn save_experiment(&self, experiment: &Experiment) -> Result<()> {
        self.policy
            .run("save_experiment", || self.inner.save_experiment(experiment))
            .await
    }

    async fn latest_experiment(&self) -> Result<Option<Experiment>> {
        self.policy
            .run("latest_experiment", || self.inner.latest_experiment())
            .await
    }

    async fn save_iteration(&self, iteration: &Iteration) -> Result<String> {
        self.policy
            .run("save_iteration", || self.inner.save_iteration(iteration))
            .await
    }

    async fn update_iteration(&self, iteration: &Iteration) -> Result<()> {
        self.policy
            .run("update_iteration", || self.inner.update_iteration(iteration))
            .await
    }

    async fn get_iteration(&self, id: &str) -> Result<Option<Iteration>> {
        self.policy
            .run("get_iteration", || self.inner.get_iteration(id))
            .await
    }

    async fn iteration_at(&self, position: u32) -> Result<Option<Iteration>> {
        self.policy
            .run("iteration_at", || self.inner.iteration_at(position))
            .await
    }

    async fn list_iterations(&self) -> Result<Vec<Iteration>> {
        self.policy
            .run("list_iterations", || self.inner.list_iterations())
            .await
    }

    async fn save_samples(&self, samples: &[Sample]) -> Result<()> {
        self.policy
            .run("save_samples", || self.inner.save_samples(samples))
            .await
    }

    async fn get_sample(&self, id: &str) -> Result<Option<Sample>> {
        self.policy
            .run("get_sample", || self.inner.get_sample(id))
            .await
    }

    async fn pending_samples(&self) -> Result<Vec<Sample>> {
        self.policy
            .run("pending_samples", || self.inner.pending_samples())
            .await
    }

    async fn pending_annotation(&self, iteration_id: &str) -> Result<Option<Sample>> {
        self.policy
            .run("pending_annotation", || self.inner.pending_annotation(iteration_id))
            .await
    }

    async fn iteration_annotations(&self, iteration_id: &str) -> Result<Vec<Annotation>> {
        self.policy
            .run("iteration_annotations", || {
                self.inner.iteration_annotations(iteration_id)
            })
            .await
    }

    async fn save_annotations(&self, annotations: &[Annotation]) -> Result<()> {
        self.policy
            .run("save_annotations", || self.inner.save_annotations(annotations))
            .await
    }

    async fn update_annotation(&self, sample: &Sample) -> Result<()> {
        self.policy
            .run("update_annotation", || self.inner.update_annotation(sample))
            .await
    }

    async fn save_sample_annotation(&self, sample: &Sample) -> Result<()> {
        self.policy
            .run("save_sample_annotation", || {
                self.inner.save_sample_annotation(sample)
            })
            .await
    }

    async fn golden_samples(&self, is_gold: bool) -> Result<Vec<Sample>> {
        self.policy
            .run("golden_samples", || self.inner.golden_samples(is_gold))
            .await
    }

    async fn save_model(&self, model: &dyn AnnotationModel) -> Result<String> {
        self.policy
            .run("save_model", || self.inner.save_model(model))
            .await
    }

    async fn load_model(&self, kind: &str, id: &str) -> Result<Box<dyn AnnotationModel>> {
        self.policy
            .run("load_model", || self.inner.load_model(kind, id))
            .await
    }

    async fn save_metric_report(&self, report: &MetricReport) -> Result<()> {
        self.policy
            .run("save_metric_report", || self.inner.save_metric_report(report))
            .await
    }

    async fn latest_metric_report(&self) -> Result<Option<MetricReport>> {
        self.policy
            .run("latest_metric_report", || self.inner.latest_metric_report())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::SqliteStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn delay_doubles_up_to_cap() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let value = fast_policy(5)
            .run("flaky", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(anyhow::Error::from(StoreError::Transient(
                        "connection reset".into(),
                    )))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_attempts_propagate_the_error() {
        let calls = AtomicU32::new(0);
        let err = fast_policy(3)
            .run("down", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(anyhow::Error::from(StoreError::Transient(
                    "unreachable".into(),
                )))
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(is_transient(&err));
        assert!(format!("{:#}", err).contains("down failed after 3 attempts"));
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result = fast_policy(5)
            .run("missing", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(anyhow::Error::from(StoreError::NotFound {
                    entity: "sample",
                    id: "s1".into(),
                }))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wrapper_passes_calls_through() {
        let store = RetryingStore::new(SqliteStore::open_in_memory().unwrap(), fast_policy(2));
        store
            .save_experiment(&Experiment::new(None, 0, "STARTED"))
            .await
            .unwrap();
        let latest = store.latest_experiment().await.unwrap().unwrap();
        assert_eq!(latest.status, "STARTED");
        assert!(store.inner().path().is_none());
    }
}
