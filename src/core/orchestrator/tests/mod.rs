mod controller;
mod resume;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::core::dataset::{Annotation, LabelPayload, Sample};
use crate::core::metrics::{MetricReport, build_metrics};
use crate::core::model::{AnnotationModel, KeywordVoteClassifier};
use crate::core::orchestrator::{
    AnnotationController, Collaborators, Experiment, Iteration, IterationState, LoopSettings,
};
use crate::core::selection::RandomSampleSelector;
use crate::core::stopping::{AcceptanceRateCondition, StopCondition};
use crate::core::store::{SqliteStore, Store};

pub(super) fn spam() -> LabelPayload {
    LabelPayload::Classification {
        label: "spam".to_string(),
    }
}

/// `pending` unlabeled samples `p0..` plus `gold` labeled golden samples `g0..`.
pub(super) async fn seeded_store(pending: usize, gold: usize) -> Arc<dyn Store> {
    let store = SqliteStore::open_in_memory().unwrap();
    let mut samples: Vec<Sample> = (0..pending)
        .map(|i| Sample::pending(format!("free prize number {}", i)).with_id(format!("p{}", i)))
        .collect();
    samples.extend((0..gold).map(|i| {
        Sample::labeled(format!("win a free prize {}", i), spam(), "import")
            .with_id(format!("g{}", i))
            .gold(true)
    }));
    store.save_samples(&samples).await.unwrap();
    Arc::new(store)
}

pub(super) struct Setup {
    pub max_iterations: u32,
    pub sample_size: usize,
    pub threshold: Option<f64>,
    pub report_path: Option<PathBuf>,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            max_iterations: 1,
            sample_size: 10,
            threshold: Some(0.5),
            report_path: None,
        }
    }
}

pub(super) async fn controller(store: Arc<dyn Store>, setup: Setup) -> AnnotationController {
    let stop_conditions: Vec<Box<dyn StopCondition>> = setup
        .threshold
        .map(|t| {
            Box::new(AcceptanceRateCondition::new(store.clone(), t).unwrap()) as Box<dyn StopCondition>
        })
        .into_iter()
        .collect();
    let collaborators = Collaborators {
        store: store.clone(),
        model: Box::new(KeywordVoteClassifier::default()),
        selector: Box::new(RandomSampleSelector::with_seed(store.clone(), 11)),
        stop_conditions,
        metrics: build_metrics(&["accuracy".to_string(), "span_f1".to_string()]).unwrap(),
    };
    let settings = LoopSettings {
        max_iterations: setup.max_iterations,
        sample_size: setup.sample_size,
        report_path: setup.report_path,
    };
    AnnotationController::load(collaborators, settings)
        .await
        .unwrap()
}

/// Decide every open proposal of the iteration under review when called.
/// Iterations the background driver starts meanwhile are left alone.
pub(super) async fn review_all(
    controller: &AnnotationController,
    store: &Arc<dyn Store>,
    accept: bool,
) -> usize {
    let Some(iteration_id) = controller.snapshot().iteration_id else {
        return 0;
    };
    let mut decided = 0;
    while let Some(mut sample) = store.pending_annotation(&iteration_id).await.unwrap() {
        controller
            .validate_annotation(&mut sample, accept, "ana")
            .await
            .unwrap();
        decided += 1;
    }
    decided
}

pub(super) async fn open_iterations(store: &Arc<dyn Store>) -> usize {
    store
        .list_iterations()
        .await
        .unwrap()
        .iter()
        .filter(|it| it.status != IterationState::Complete)
        .count()
}

/// Delegates to `inner`, except that `save_annotations` fails while
/// `fail_annotations` is set.
pub(super) struct FailingStore {
    inner: Arc<dyn Store>,
    fail_annotations: AtomicBool,
}

impl FailingStore {
    pub fn new(inner: Arc<dyn Store>) -> Self {
        Self {
            inner,
            fail_annotations: AtomicBool::new(true),
        }
    }

    pub fn heal(&self) {
        self.fail_annotations.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Store for FailingStore {
    async fn save_experiment(&self, experiment: &Experiment) -> Result<()> {
        self.inner.save_experiment(experiment).await
    }
    async fn latest_experiment(&self) -> Result<Option<Experiment>> {
        self.inner.latest_experiment().await
    }
    async fn save_iteration(&self, iteration: &Iteration) -> Result<String> {
        self.inner.save_iteration(iteration).await
    }
    async fn update_iteration(&self, iteration: &Iteration) -> Result<()> {
        self.inner.update_iteration(iteration).await
    }
    async fn get_iteration(&self, id: &str) -> Result<Option<Iteration>> {
        self.inner.get_iteration(id).await
    }
    async fn iteration_at(&self, position: u32) -> Result<Option<Iteration>> {
        self.inner.iteration_at(position).await
    }
    async fn list_iterations(&self) -> Result<Vec<Iteration>> {
        self.inner.list_iterations().await
    }
    async fn save_samples(&self, samples: &[Sample]) -> Result<()> {
        self.inner.save_samples(samples).await
    }
    async fn get_sample(&self, id: &str) -> Result<Option<Sample>> {
        self.inner.get_sample(id).await
    }
    async fn pending_samples(&self) -> Result<Vec<Sample>> {
        self.inner.pending_samples().await
    }
    async fn pending_annotation(&self, iteration_id: &str) -> Result<Option<Sample>> {
        self.inner.pending_annotation(iteration_id).await
    }
    async fn iteration_annotations(&self, iteration_id: &str) -> Result<Vec<Annotation>> {
        self.inner.iteration_annotations(iteration_id).await
    }
    async fn save_annotations(&self, annotations: &[Annotation]) -> Result<()> {
        if self.fail_annotations.load(Ordering::SeqCst) {
            return Err(anyhow!("disk full"));
        }
        self.inner.save_annotations(annotations).await
    }
    async fn update_annotation(&self, sample: &Sample) -> Result<()> {
        self.inner.update_annotation(sample).await
    }
    async fn save_sample_annotation(&self, sample: &Sample) -> Result<()> {
        self.inner.save_sample_annotation(sample).await
    }
    async fn golden_samples(&self, is_gold: bool) -> Result<Vec<Sample>> {
        self.inner.golden_samples(is_gold).await
    }
    async fn save_model(&self, model: &dyn AnnotationModel) -> Result<String> {
        self.inner.save_model(model).await
    }
    async fn load_model(&self, kind: &str, id: &str) -> Result<Box<dyn AnnotationModel>> {
        self.inner.load_model(kind, id).await
    }
    async fn save_metric_report(&self, report: &MetricReport) -> Result<()> {
        self.inner.save_metric_report(report).await
    }
    async fn latest_metric_report(&self) -> Result<Option<MetricReport>> {
        self.inner.latest_metric_report().await
    }
}
