use anyhow::{Result, anyhow};
use async_trait::async_trait;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::core::config::ConfigError;
use crate::core::dataset::Sample;
use crate::core::store::Store;

/// Picks the samples the next iteration works on.
#[async_trait]
pub trait SampleSelector: Send + Sync {
    fn name(&self) -> &'static str;

    /// Up to `n` distinct pending samples. Fewer when the pool is smaller.
    async fn select(&self, n: usize) -> Result<Vec<Sample>>;
}

pub const SELECTOR_KINDS: &[&str] = &[RandomSampleSelector::KIND];

pub fn build_selector(kind: &str, store: Arc<dyn Store>) -> Result<Box<dyn SampleSelector>, ConfigError> {
    match kind {
        RandomSampleSelector::KIND => Ok(Box::new(RandomSampleSelector::new(store))),
        other => Err(ConfigError::UnknownSelector(other.to_string())),
    }
}

/// Uniform draw without replacement from the pending pool.
pub struct RandomSampleSelector {
    store: Arc<dyn Store>,
    rng: Mutex<StdRng>,
}

impl RandomSampleSelector {
    pub const KIND: &'static str = "random";

    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn with_seed(store: Arc<dyn Store>, seed: u64) -> Self {
        Self {
            store,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

#[async_trait]
impl SampleSelector for RandomSampleSelector {
    fn name(&self) -> &'static str {
        Self::KIND
    }

    async fn select(&self, n: usize) -> Result<Vec<Sample>> {
        let pool = self.store.pending_samples().await?;
        if pool.len() <= n {
            debug!("Selecting the whole pending pool ({} samples)", pool.len());
            return Ok(pool);
        }
        let mut rng = self
            .rng
            .lock()
            .map_err(|_| anyhow!("selector rng lock poisoned"))?;
        Ok(pool.choose_multiple(&mut *rng, n).cloned().collect())
    }
}
