mod controller;
mod runner;
pub mod types;

pub use controller::{AnnotationController, Collaborators, LoopSettings, StartOutcome};
pub use runner::{BackgroundTask, TaskRunner};
pub use types::{
    Continuation, ContinueReason, Experiment, Iteration, IterationSnapshot, IterationState,
    LoopError, PROCESS_COMPLETE, PROCESS_STARTED,
};

/// Iterations only move forward, one state at a time. Re-entering the current
/// state is allowed so a resumed step can re-run its action.
pub fn can_transition(from: IterationState, to: IterationState) -> bool {
    if from == to {
        return true;
    }
    match from {
        IterationState::Initialized => to == IterationState::Finetuning,
        IterationState::Finetuning => to == IterationState::Annotating,
        IterationState::Annotating => to == IterationState::Validating,
        IterationState::Validating => to == IterationState::Complete,
        IterationState::Complete => false,
    }
}

/// The continuation rule of the top-level loop. Any one reason to keep going
/// wins; the checks are ordered budget, stop condition, backlog.
pub fn next_step(
    position: u32,
    max_iterations: u32,
    stop_satisfied: bool,
    pending_samples: usize,
) -> Continuation {
    if position < max_iterations {
        Continuation::Continue(ContinueReason::IterationBudget)
    } else if !stop_satisfied {
        Continuation::Continue(ContinueReason::StopConditionUnmet)
    } else if pending_samples > 0 {
        Continuation::Continue(ContinueReason::Backlog)
    } else {
        Continuation::Finalize
    }
}

#[cfg(test)]
mod tests;
