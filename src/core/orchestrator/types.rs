use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

/// Experiment status written once finalization has finished.
pub const PROCESS_COMPLETE: &str = "PROCESS COMPLETE";
/// Experiment status of the row written when a run starts.
pub const PROCESS_STARTED: &str = "STARTED";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IterationState {
    Initialized,
    Finetuning,
    Annotating,
    Validating,
    Complete,
}

impl IterationState {
    pub fn as_str(self) -> &'static str {
        match self {
            IterationState::Initialized => "INITIALIZED",
            IterationState::Finetuning => "FINETUNING",
            IterationState::Annotating => "ANNOTATING",
            IterationState::Validating => "VALIDATING",
            IterationState::Complete => "COMPLETE",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value.trim() {
            "INITIALIZED" => Some(IterationState::Initialized),
            "FINETUNING" => Some(IterationState::Finetuning),
            "ANNOTATING" => Some(IterationState::Annotating),
            "VALIDATING" => Some(IterationState::Validating),
            "COMPLETE" => Some(IterationState::Complete),
            _ => None,
        }
    }

    pub fn is_open(self) -> bool {
        self != IterationState::Complete
    }
}

impl std::fmt::Display for IterationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Iteration {
    pub id: String,
    pub position: u32,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub model_id: Option<String>,
    sample_ids: BTreeSet<String>,
    pub status: IterationState,
}

impl Iteration {
    pub fn new(position: u32, sample_ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            position,
            start_time: Utc::now(),
            end_time: None,
            model_id: None,
            sample_ids: sample_ids.into_iter().collect(),
            status: IterationState::Initialized,
        }
    }

    /// Rebuild a persisted iteration. Only the store constructs iterations this way.
    pub(crate) fn restore(
        id: String,
        position: u32,
        start_time: DateTime<Utc>,
        end_time: Option<DateTime<Utc>>,
        model_id: Option<String>,
        sample_ids: BTreeSet<String>,
        status: IterationState,
    ) -> Self {
        Self {
            id,
            position,
            start_time,
            end_time,
            model_id,
            sample_ids,
            status,
        }
    }

    /// The sample set fixed at creation. There is no mutable accessor.
    pub fn sample_ids(&self) -> &BTreeSet<String> {
        &self.sample_ids
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Experiment {
    pub current_iteration_id: Option<String>,
    pub position: u32,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl Experiment {
    pub fn new(current_iteration_id: Option<String>, position: u32, status: impl Into<String>) -> Self {
        Self {
            current_iteration_id,
            position,
            status: status.into(),
            created_at: Utc::now(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == PROCESS_COMPLETE
    }
}

/// Read-only view of where the run is, published after every transition.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct IterationSnapshot {
    pub iteration_id: Option<String>,
    pub status: Option<IterationState>,
    pub position: u32,
    pub sample_count: usize,
    pub finished: bool,
}

impl IterationSnapshot {
    pub fn waiting_for_review(&self) -> bool {
        self.status == Some(IterationState::Validating)
    }
}

/// Why the top-level loop decided to start another iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinueReason {
    IterationBudget,
    StopConditionUnmet,
    Backlog,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    Continue(ContinueReason),
    Finalize,
}

#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    #[error("background work was cancelled")]
    Cancelled,
    #[error("iteration {0} not found in store")]
    MissingIteration(String),
    #[error("illegal iteration transition {from} -> {to}")]
    IllegalTransition {
        from: IterationState,
        to: IterationState,
    },
    #[error("sample {0} has no annotation to validate")]
    NothingToValidate(String),
    #[error("the process has already been finalized")]
    AlreadyFinalized,
}
