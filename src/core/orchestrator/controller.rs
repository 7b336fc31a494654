use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::runner::{BackgroundTask, TaskRunner, run_blocking};
use super::types::{
    Continuation, ContinueReason, Experiment, Iteration, IterationSnapshot, IterationState,
    LoopError, PROCESS_COMPLETE, PROCESS_STARTED,
};
use super::{can_transition, next_step};
use crate::core::config::{ConfigError, LoopConfig};
use crate::core::dataset::{AUTO_ANNOTATOR, Sample};
use crate::core::metrics::{Metric, MetricReport, build_metrics, pair_predictions};
use crate::core::model::{AnnotationModel, build_model};
use crate::core::selection::{SampleSelector, build_selector};
use crate::core::stopping::{StopCondition, build_stop_conditions};
use crate::core::store::Store;

/// The pluggable parts the controller drives.
pub struct Collaborators {
    pub store: Arc<dyn Store>,
    /// Production model used until an iteration produces a better one.
    pub model: Box<dyn AnnotationModel>,
    pub selector: Box<dyn SampleSelector>,
    pub stop_conditions: Vec<Box<dyn StopCondition>>,
    pub metrics: Vec<Box<dyn Metric>>,
}

impl Collaborators {
    /// Build every component named in `config`. Unknown names fail here, before anything runs.
    pub fn from_config(config: &LoopConfig, store: Arc<dyn Store>) -> Result<Self, ConfigError> {
        Ok(Self {
            model: build_model(&config.model)?,
            selector: build_selector(&config.selector, store.clone())?,
            stop_conditions: build_stop_conditions(&config.stopping_conditions, store.clone())?,
            metrics: build_metrics(&config.metrics)?,
            store,
        })
    }
}

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub max_iterations: u32,
    pub sample_size: usize,
    /// Where the final metric report is also written as JSON.
    pub report_path: Option<PathBuf>,
}

impl LoopSettings {
    pub fn from_config(config: &LoopConfig, data_dir: &Path) -> Self {
        Self {
            max_iterations: config.max_iterations,
            sample_size: config.sample_size,
            report_path: config.report_path.as_ref().map(|p| data_dir.join(p)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// No prior experiment; a fresh run was recorded.
    Started,
    /// Picked up from the persisted state.
    Resumed,
    /// A driver already holds the transition lock.
    AlreadyRunning,
    AlreadyComplete,
}

/// Owned by the transition lock. Nothing else mutates it.
#[derive(Default)]
struct ProcessState {
    experiment: Option<Experiment>,
    iteration: Option<Iteration>,
}

impl ProcessState {
    fn position(&self) -> u32 {
        self.experiment.as_ref().map(|e| e.position).unwrap_or(0)
    }

    fn finalized(&self) -> bool {
        self.experiment.as_ref().is_some_and(Experiment::is_complete)
    }

    fn snapshot(&self) -> IterationSnapshot {
        IterationSnapshot {
            iteration_id: self.iteration.as_ref().map(|it| it.id.clone()),
            status: self.iteration.as_ref().map(|it| it.status),
            position: self.position(),
            sample_count: self.iteration.as_ref().map(|it| it.sample_ids().len()).unwrap_or(0),
            finished: self.finalized(),
        }
    }
}

struct Inner {
    store: Arc<dyn Store>,
    model: RwLock<Arc<dyn AnnotationModel>>,
    selector: Box<dyn SampleSelector>,
    stop_conditions: Vec<Box<dyn StopCondition>>,
    metrics: Vec<Box<dyn Metric>>,
    settings: LoopSettings,
    state: Mutex<ProcessState>,
    snapshot: watch::Sender<IterationSnapshot>,
    runner: TaskRunner,
}

/// Drives the labeling loop. Cheap to clone; clones share one run.
#[derive(Clone)]
pub struct AnnotationController {
    inner: Arc<Inner>,
}

impl AnnotationController {
    /// Restore the run from the latest experiment, or prepare a fresh one.
    pub async fn load(collaborators: Collaborators, settings: LoopSettings) -> Result<Self> {
        let Collaborators {
            store,
            model,
            selector,
            stop_conditions,
            metrics,
        } = collaborators;

        let experiment = store.latest_experiment().await?;
        let iteration = match experiment.as_ref().and_then(|e| e.current_iteration_id.clone()) {
            Some(id) => Some(
                store
                    .get_iteration(&id)
                    .await?
                    .ok_or(LoopError::MissingIteration(id))?,
            ),
            None => None,
        };

        let mut model: Arc<dyn AnnotationModel> = Arc::from(model);
        let latest_model_id = store
            .list_iterations()
            .await?
            .into_iter()
            .rev()
            .find_map(|it| it.model_id);
        if let Some(model_id) = latest_model_id {
            model = Arc::from(store.load_model(model.kind(), &model_id).await?);
            debug!("Restored production model {}", model_id);
        }

        let state = ProcessState {
            experiment,
            iteration,
        };
        match (&state.experiment, &state.iteration) {
            (Some(e), Some(it)) => info!(
                "Resuming experiment at position {} (iteration {} is {})",
                e.position, it.id, it.status
            ),
            (Some(e), None) => info!("Resuming experiment at position {} ({})", e.position, e.status),
            _ => info!("No experiment recorded yet"),
        }

        let (snapshot, _) = watch::channel(state.snapshot());
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                model: RwLock::new(model),
                selector,
                stop_conditions,
                metrics,
                settings,
                state: Mutex::new(state),
                snapshot,
                runner: TaskRunner::new(),
            }),
        })
    }

    /// Start or resume the loop in the background. Calling it while a driver
    /// is active, or after finalization, changes nothing.
    pub async fn run_process(&self) -> Result<StartOutcome> {
        let (outcome, _driver) = self.start().await?;
        Ok(outcome)
    }

    /// [`run_process`](Self::run_process), then wait until the loop blocks on
    /// human review or finishes. Returns the driver's error, if any.
    pub async fn run_until_idle(&self) -> Result<StartOutcome> {
        let (outcome, driver) = self.start().await?;
        if let Some(driver) = driver {
            driver.join().await?;
        }
        self.wait_idle().await;
        Ok(outcome)
    }

    async fn start(&self) -> Result<(StartOutcome, Option<BackgroundTask<()>>)> {
        let outcome = {
            let Ok(mut state) = self.inner.state.try_lock() else {
                debug!("run_process ignored: a driver is already active");
                return Ok((StartOutcome::AlreadyRunning, None));
            };
            if state.finalized() {
                return Ok((StartOutcome::AlreadyComplete, None));
            }
            if state.experiment.is_none() {
                let experiment = Experiment::new(None, 0, PROCESS_STARTED);
                self.inner.store.save_experiment(&experiment).await?;
                state.experiment = Some(experiment);
                self.publish(&state);
                info!("Started a new experiment");
                StartOutcome::Started
            } else {
                StartOutcome::Resumed
            }
        };
        Ok((outcome, Some(self.kick())))
    }

    fn kick(&self) -> BackgroundTask<()> {
        let this = self.clone();
        self.inner
            .runner
            .spawn("drive", move |token| async move { this.drive(token).await })
    }

    /// The single transition function. Holds the transition lock while it
    /// advances the run, and returns once the run blocks on humans or ends.
    async fn drive(&self, cancel: CancellationToken) -> Result<()> {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        loop {
            if cancel.is_cancelled() {
                return Err(LoopError::Cancelled.into());
            }
            if state.finalized() {
                debug!("Driver found the process already finalized");
                return Ok(());
            }
            match state.iteration.as_ref().map(|it| it.status) {
                None | Some(IterationState::Complete) => match self.continuation(state).await? {
                    Continuation::Continue(reason) => {
                        if !self.start_iteration(state, reason).await? {
                            info!("Nothing left to select, finalizing");
                            return self.finalize_process(state, &cancel).await;
                        }
                    }
                    Continuation::Finalize => return self.finalize_process(state, &cancel).await,
                },
                Some(IterationState::Initialized) | Some(IterationState::Finetuning) => {
                    self.finetune_step(state, &cancel).await?
                }
                Some(IterationState::Annotating) => self.annotate_step(state, &cancel).await?,
                Some(IterationState::Validating) => {
                    if !self.complete_if_validated(state).await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn continuation(&self, state: &ProcessState) -> Result<Continuation> {
        let position = state.position();
        let max = self.inner.settings.max_iterations;
        if position < max {
            return Ok(Continuation::Continue(ContinueReason::IterationBudget));
        }
        let stop_satisfied = self.stop_satisfied(state.iteration.as_ref()).await?;
        let pending = if stop_satisfied {
            self.inner.store.pending_samples().await?.len()
        } else {
            0
        };
        let step = next_step(position, max, stop_satisfied, pending);
        debug!(
            "Continuation at position {}/{}: stop_satisfied={}, pending={} -> {:?}",
            position, max, stop_satisfied, pending, step
        );
        Ok(step)
    }

    /// Any satisfied condition stops the loop. With none configured, or
    /// without an iteration to judge, nothing is satisfied and only an empty
    /// selection ends the run past the budget.
    async fn stop_satisfied(&self, iteration: Option<&Iteration>) -> Result<bool> {
        let Some(iteration) = iteration else {
            return Ok(false);
        };
        for condition in &self.inner.stop_conditions {
            if condition.evaluate(iteration).await? {
                debug!("Stopping condition '{}' satisfied", condition.name());
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Returns `false` when there is nothing to work on.
    async fn start_iteration(&self, state: &mut ProcessState, reason: ContinueReason) -> Result<bool> {
        let position = state.position() + 1;
        let iteration = match self.inner.store.iteration_at(position).await? {
            Some(orphan) => {
                info!(
                    "Adopting iteration {} already recorded at position {}",
                    orphan.id, position
                );
                orphan
            }
            None => {
                let samples = self.inner.selector.select(self.inner.settings.sample_size).await?;
                if samples.is_empty() {
                    return Ok(false);
                }
                let iteration = Iteration::new(position, samples.into_iter().map(|s| s.id));
                self.inner.store.save_iteration(&iteration).await?;
                iteration
            }
        };
        info!(
            "Iteration {} started at position {} with {} samples ({:?})",
            iteration.id,
            position,
            iteration.sample_ids().len(),
            reason
        );
        self.record(state, iteration).await?;
        Ok(true)
    }

    async fn finetune_step(&self, state: &mut ProcessState, cancel: &CancellationToken) -> Result<()> {
        if current_status(state)? == IterationState::Initialized {
            self.transition(state, IterationState::Finetuning, None).await?;
        }

        let mut training = self.inner.store.golden_samples(true).await?;
        training.extend(self.inner.store.golden_samples(false).await?);
        let candidate = self.production_model()?.fork();
        let size = training.len();
        let trained = run_blocking(cancel, move || {
            let mut candidate = candidate;
            candidate.finetune(&training)?;
            Ok(candidate)
        })
        .await?;
        debug!("Fine-tuned {} model on {} samples", trained.kind(), size);

        let model_id = self.inner.store.save_model(trained.as_ref()).await?;
        self.transition(state, IterationState::Annotating, Some(model_id))
            .await?;
        self.swap_model(trained)
    }

    async fn annotate_step(&self, state: &mut ProcessState, cancel: &CancellationToken) -> Result<()> {
        let iteration = state
            .iteration
            .clone()
            .ok_or_else(|| anyhow!("no iteration in flight"))?;
        let mut samples = Vec::with_capacity(iteration.sample_ids().len());
        for id in iteration.sample_ids() {
            match self.inner.store.get_sample(id).await? {
                Some(sample) => samples.push(sample),
                None => warn!("Sample {} of iteration {} no longer exists", id, iteration.id),
            }
        }

        let model = self.production_model()?;
        let iteration_id = iteration.id.clone();
        let proposals = run_blocking(cancel, move || {
            Ok(model.annotate(&samples, Some(iteration_id.as_str())))
        })
        .await?;
        self.inner.store.save_annotations(&proposals).await?;
        debug!("Saved {} proposals for iteration {}", proposals.len(), iteration.id);

        self.transition(state, IterationState::Validating, None).await
    }

    /// Closes the iteration once nothing awaits a decision. The status check
    /// under the lock makes the COMPLETE transition happen at most once.
    async fn complete_if_validated(&self, state: &mut ProcessState) -> Result<bool> {
        let iteration = state
            .iteration
            .as_ref()
            .ok_or_else(|| anyhow!("no iteration in flight"))?;
        if iteration.status != IterationState::Validating {
            debug!("Iteration {} is already {}", iteration.id, iteration.status);
            return Ok(false);
        }
        if self.inner.store.pending_annotation(&iteration.id).await?.is_some() {
            return Ok(false);
        }
        self.transition(state, IterationState::Complete, None).await?;
        Ok(true)
    }

    /// Label the tail of the pool without review, score a model fine-tuned on
    /// the golden set, and close the experiment.
    async fn finalize_process(&self, state: &mut ProcessState, cancel: &CancellationToken) -> Result<()> {
        if state.finalized() {
            return Err(LoopError::AlreadyFinalized.into());
        }

        let pending = self.inner.store.pending_samples().await?;
        if !pending.is_empty() {
            let model = self.production_model()?;
            let labeled = run_blocking(cancel, move || Ok(force_label(model.as_ref(), pending))).await?;
            let annotations: Vec<_> = labeled.iter().filter_map(|s| s.annotation.clone()).collect();
            self.inner.store.save_annotations(&annotations).await?;
            for sample in &labeled {
                self.inner.store.save_sample_annotation(sample).await?;
            }
            info!("Auto-labeled {} remaining samples", labeled.len());
        }

        let golden = self.inner.store.golden_samples(true).await?;
        let candidate = self.production_model()?.fork();
        let training = golden.clone();
        let predictions = run_blocking(cancel, move || {
            let mut candidate = candidate;
            candidate.finetune(&training)?;
            Ok(candidate.annotate(&training, None))
        })
        .await?;
        let report = MetricReport::compute(&self.inner.metrics, &pair_predictions(&golden, &predictions));
        self.inner.store.save_metric_report(&report).await?;
        if let Some(path) = &self.inner.settings.report_path {
            let json = serde_json::to_string_pretty(&report)?;
            tokio::fs::write(path, json)
                .await
                .with_context(|| format!("writing metric report to {}", path.display()))?;
        }

        let experiment = Experiment::new(
            state.iteration.as_ref().map(|it| it.id.clone()),
            state.position(),
            PROCESS_COMPLETE,
        );
        self.inner.store.save_experiment(&experiment).await?;
        state.experiment = Some(experiment);
        self.publish(state);
        info!(
            "Process complete after {} iterations, golden set of {}: {:?}",
            state.position(),
            report.golden_size,
            report.values
        );
        Ok(())
    }

    /// Persist a forward move of the current iteration, then mirror it in a new experiment row.
    async fn transition(
        &self,
        state: &mut ProcessState,
        to: IterationState,
        model_id: Option<String>,
    ) -> Result<()> {
        let current = state
            .iteration
            .as_ref()
            .ok_or_else(|| anyhow!("no iteration in flight"))?;
        if !can_transition(current.status, to) {
            return Err(LoopError::IllegalTransition {
                from: current.status,
                to,
            }
            .into());
        }
        let mut next = current.clone();
        next.status = to;
        if model_id.is_some() {
            next.model_id = model_id;
        }
        if to == IterationState::Complete {
            next.end_time = Some(Utc::now());
        }
        self.inner.store.update_iteration(&next).await?;
        info!(
            "Iteration {} (position {}): {} -> {}",
            next.id, next.position, current.status, to
        );
        self.record(state, next).await
    }

    async fn record(&self, state: &mut ProcessState, iteration: Iteration) -> Result<()> {
        let experiment = Experiment::new(
            Some(iteration.id.clone()),
            iteration.position,
            iteration.status.as_str(),
        );
        self.inner.store.save_experiment(&experiment).await?;
        state.experiment = Some(experiment);
        state.iteration = Some(iteration);
        self.publish(state);
        Ok(())
    }

    fn publish(&self, state: &ProcessState) {
        self.inner.snapshot.send_replace(state.snapshot());
    }

    fn production_model(&self) -> Result<Arc<dyn AnnotationModel>> {
        let model = self
            .inner
            .model
            .read()
            .map_err(|_| anyhow!("model lock poisoned"))?;
        Ok(model.clone())
    }

    fn swap_model(&self, model: Box<dyn AnnotationModel>) -> Result<()> {
        let mut current = self
            .inner
            .model
            .write()
            .map_err(|_| anyhow!("model lock poisoned"))?;
        *current = Arc::from(model);
        Ok(())
    }

    /// Record a human decision on `sample`'s current annotation. Rejected
    /// samples stay in the pending pool. May complete the iteration, in the
    /// background.
    pub async fn validate_annotation(&self, sample: &mut Sample, accept: bool, annotator: &str) -> Result<()> {
        if self.snapshot().finished {
            return Err(LoopError::AlreadyFinalized.into());
        }
        if !sample.apply_judgment(accept, annotator) {
            return Err(LoopError::NothingToValidate(sample.id.clone()).into());
        }
        self.inner.store.update_annotation(sample).await?;
        if accept {
            self.inner.store.save_sample_annotation(sample).await?;
        }
        info!(
            "Sample {} {} by {}",
            sample.id,
            if accept { "accepted" } else { "rejected" },
            annotator
        );
        self.check_iteration_complete().await
    }

    /// Look up the current iteration's proposal for `sample_id` and validate it.
    pub async fn validate_sample(&self, sample_id: &str, accept: bool, annotator: &str) -> Result<Sample> {
        let mut sample = self.proposal_for(sample_id).await?;
        self.validate_annotation(&mut sample, accept, annotator).await?;
        Ok(sample)
    }

    async fn proposal_for(&self, sample_id: &str) -> Result<Sample> {
        let missing = || LoopError::NothingToValidate(sample_id.to_string());
        let iteration_id = self.snapshot().iteration_id.ok_or_else(missing)?;
        let mut sample = self
            .inner
            .store
            .get_sample(sample_id)
            .await?
            .ok_or_else(missing)?;
        let proposal = self
            .inner
            .store
            .iteration_annotations(&iteration_id)
            .await?
            .into_iter()
            .find(|a| a.sample_id == sample_id)
            .ok_or_else(missing)?;
        sample.annotation = Some(proposal);
        Ok(sample)
    }

    /// Kick a driver once the current iteration has no undecided proposal.
    /// Safe to call any number of times; the driver re-checks under the lock.
    async fn check_iteration_complete(&self) -> Result<()> {
        let snapshot = self.snapshot();
        let waiting = snapshot.waiting_for_review();
        let Some(iteration_id) = snapshot.iteration_id.filter(|_| waiting) else {
            debug!("No iteration waiting for review");
            return Ok(());
        };
        if self.inner.store.pending_annotation(&iteration_id).await?.is_none() {
            debug!("Iteration {} fully reviewed, scheduling completion", iteration_id);
            self.kick();
        }
        Ok(())
    }

    /// One proposal of the current iteration still awaiting a decision.
    pub async fn next_for_review(&self) -> Result<Option<Sample>> {
        let snapshot = self.snapshot();
        let waiting = snapshot.waiting_for_review();
        match snapshot.iteration_id.filter(|_| waiting) {
            Some(id) => self.inner.store.pending_annotation(&id).await,
            None => Ok(None),
        }
    }

    pub fn snapshot(&self) -> IterationSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<IterationSnapshot> {
        self.inner.snapshot.subscribe()
    }

    pub async fn metric_report(&self) -> Result<Option<MetricReport>> {
        self.inner.store.latest_metric_report().await
    }

    pub async fn wait_idle(&self) {
        self.inner.runner.wait_idle().await;
    }

    pub async fn shutdown(&self) {
        self.inner.runner.shutdown().await;
    }
}

fn current_status(state: &ProcessState) -> Result<IterationState> {
    state
        .iteration
        .as_ref()
        .map(|it| it.status)
        .ok_or_else(|| anyhow!("no iteration in flight"))
}

/// Accept the model's proposal for every sample, attributed to the automatic annotator.
fn force_label(model: &dyn AnnotationModel, samples: Vec<Sample>) -> Vec<Sample> {
    let proposals = model.annotate(&samples, None);
    samples
        .into_iter()
        .zip(proposals)
        .map(|(mut sample, mut annotation)| {
            annotation.is_valid = Some(true);
            annotation.annotator_id = Some(AUTO_ANNOTATOR.to_string());
            sample.annotation = Some(annotation);
            sample.validated = true;
            sample
        })
        .collect()
}
