use std::sync::Arc;

use super::{FailingStore, Setup, controller, open_iterations, seeded_store, spam};
use crate::core::store::Store;
use crate::core::dataset::Annotation;
use crate::core::orchestrator::{Experiment, Iteration, IterationState, PROCESS_STARTED, StartOutcome};

fn sample_ids(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("p{}", i)).collect()
}

#[tokio::test]
async fn resumes_annotating_iteration_without_duplicating_it() {
    let store = seeded_store(3, 1).await;
    let mut iteration = Iteration::new(1, sample_ids(3));
    iteration.status = IterationState::Annotating;
    store.save_iteration(&iteration).await.unwrap();
    store
        .save_experiment(&Experiment::new(
            Some(iteration.id.clone()),
            1,
            IterationState::Annotating.as_str(),
        ))
        .await
        .unwrap();

    let controller = controller(store.clone(), Setup::default()).await;
    let snapshot = controller.snapshot();
    assert_eq!(snapshot.position, 1);
    assert_eq!(snapshot.status, Some(IterationState::Annotating));
    assert_eq!(snapshot.iteration_id.as_deref(), Some(iteration.id.as_str()));

    assert_eq!(controller.run_until_idle().await.unwrap(), StartOutcome::Resumed);

    let iterations = store.list_iterations().await.unwrap();
    assert_eq!(iterations.len(), 1);
    assert_eq!(iterations[0].id, iteration.id);
    assert_eq!(iterations[0].position, 1);
    assert_eq!(iterations[0].status, IterationState::Validating);
    assert_eq!(store.iteration_annotations(&iteration.id).await.unwrap().len(), 3);
}

#[tokio::test]
async fn reannotating_keeps_decisions_made_before_the_crash() {
    let store = seeded_store(2, 0).await;
    let mut iteration = Iteration::new(1, sample_ids(2));
    iteration.status = IterationState::Annotating;
    store.save_iteration(&iteration).await.unwrap();
    store
        .save_experiment(&Experiment::new(Some(iteration.id.clone()), 1, "ANNOTATING"))
        .await
        .unwrap();

    let mut decided = Annotation::new("p0", spam()).for_iteration(Some(iteration.id.as_str()));
    decided.is_valid = Some(false);
    decided.annotator_id = Some("ana".into());
    store.save_annotations(&[decided]).await.unwrap();

    let controller = controller(store.clone(), Setup::default()).await;
    controller.run_until_idle().await.unwrap();

    let annotations = store.iteration_annotations(&iteration.id).await.unwrap();
    assert_eq!(annotations.len(), 2);
    let p0 = annotations.iter().find(|a| a.sample_id == "p0").unwrap();
    assert_eq!(p0.is_valid, Some(false));
    let pending = controller.next_for_review().await.unwrap().unwrap();
    assert_eq!(pending.id, "p1");
}

#[tokio::test]
async fn orphaned_iteration_row_is_adopted() {
    let store = seeded_store(2, 0).await;
    store
        .save_experiment(&Experiment::new(None, 0, PROCESS_STARTED))
        .await
        .unwrap();
    // Crash between creating the iteration and recording it in the experiment.
    let orphan = Iteration::new(1, sample_ids(1));
    store.save_iteration(&orphan).await.unwrap();

    let controller = controller(store.clone(), Setup::default()).await;
    assert_eq!(controller.snapshot().iteration_id, None);
    assert_eq!(controller.run_until_idle().await.unwrap(), StartOutcome::Resumed);

    let iterations = store.list_iterations().await.unwrap();
    assert_eq!(iterations.len(), 1);
    assert_eq!(iterations[0].id, orphan.id);
    assert_eq!(iterations[0].sample_ids().len(), 1);
    assert_eq!(controller.snapshot().iteration_id.as_deref(), Some(orphan.id.as_str()));
}

#[tokio::test]
async fn fully_reviewed_iteration_completes_on_resume() {
    let store = seeded_store(2, 1).await;
    let mut iteration = Iteration::new(1, sample_ids(2));
    iteration.status = IterationState::Validating;
    store.save_iteration(&iteration).await.unwrap();
    store
        .save_experiment(&Experiment::new(Some(iteration.id.clone()), 1, "VALIDATING"))
        .await
        .unwrap();
    for id in sample_ids(2) {
        let mut sample = store.get_sample(&id).await.unwrap().unwrap();
        let annotation = Annotation::new(id.clone(), spam()).for_iteration(Some(iteration.id.as_str()));
        store.save_annotations(&[annotation.clone()]).await.unwrap();
        sample.annotation = Some(annotation);
        sample.apply_judgment(true, "ana");
        store.update_annotation(&sample).await.unwrap();
        store.save_sample_annotation(&sample).await.unwrap();
    }

    let controller = controller(store.clone(), Setup::default()).await;
    controller.run_until_idle().await.unwrap();

    let reloaded = store.get_iteration(&iteration.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, IterationState::Complete);
    assert_eq!(open_iterations(&store).await, 0);
    assert!(controller.snapshot().finished);
}

#[tokio::test]
async fn restart_restores_snapshot_and_model() {
    let store = seeded_store(2, 2).await;
    let first = controller(store.clone(), Setup::default()).await;
    first.run_until_idle().await.unwrap();
    let before = first.snapshot();
    first.shutdown().await;
    drop(first);

    let second = controller(store.clone(), Setup::default()).await;
    assert_eq!(second.snapshot(), before);
    assert_eq!(second.run_until_idle().await.unwrap(), StartOutcome::Resumed);
    assert_eq!(store.list_iterations().await.unwrap().len(), 1);
    assert!(second.next_for_review().await.unwrap().is_some());
}

#[tokio::test]
async fn failed_annotation_save_keeps_the_iteration_annotating() {
    let inner = seeded_store(3, 1).await;
    let failing = Arc::new(FailingStore::new(inner.clone()));
    let store: Arc<dyn Store> = failing.clone();
    let controller = controller(store.clone(), Setup::default()).await;

    let err = controller.run_until_idle().await.unwrap_err();
    assert!(format!("{:#}", err).contains("disk full"));

    let iterations = inner.list_iterations().await.unwrap();
    assert_eq!(iterations.len(), 1);
    assert_eq!(iterations[0].status, IterationState::Annotating);
    assert!(iterations[0].model_id.is_some());
    assert!(inner.iteration_annotations(&iterations[0].id).await.unwrap().is_empty());
    let experiment = inner.latest_experiment().await.unwrap().unwrap();
    assert_eq!(experiment.status, IterationState::Annotating.as_str());
    assert_eq!(controller.snapshot().status, Some(IterationState::Annotating));

    failing.heal();
    assert_eq!(controller.run_until_idle().await.unwrap(), StartOutcome::Resumed);

    let iterations = inner.list_iterations().await.unwrap();
    assert_eq!(iterations.len(), 1);
    assert_eq!(iterations[0].status, IterationState::Validating);
    assert_eq!(inner.iteration_annotations(&iterations[0].id).await.unwrap().len(), 3);
    assert!(controller.snapshot().waiting_for_review());
}

#[tokio::test]
async fn restart_after_a_failed_step_finishes_it() {
    let inner = seeded_store(2, 0).await;
    let failing: Arc<dyn Store> = Arc::new(FailingStore::new(inner.clone()));
    let first = controller(failing, Setup::default()).await;
    assert!(first.run_until_idle().await.is_err());
    first.shutdown().await;
    drop(first);

    let second = controller(inner.clone(), Setup::default()).await;
    assert_eq!(second.snapshot().status, Some(IterationState::Annotating));
    assert_eq!(second.run_until_idle().await.unwrap(), StartOutcome::Resumed);

    let iterations = inner.list_iterations().await.unwrap();
    assert_eq!(iterations.len(), 1);
    assert_eq!(iterations[0].position, 1);
    assert_eq!(iterations[0].status, IterationState::Validating);
    assert_eq!(open_iterations(&inner).await, 1);
    assert!(second.next_for_review().await.unwrap().is_some());
}
