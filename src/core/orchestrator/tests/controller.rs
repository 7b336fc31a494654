use super::{Setup, controller, open_iterations, review_all, seeded_store};
use crate::core::orchestrator::{IterationState, LoopError, PROCESS_COMPLETE, StartOutcome};

#[tokio::test]
async fn concurrent_triggers_start_one_iteration() {
    let store = seeded_store(6, 2).await;
    let controller = controller(
        store.clone(),
        Setup {
            max_iterations: 3,
            sample_size: 2,
            ..Setup::default()
        },
    )
    .await;

    let triggers: Vec<_> = (0..8)
        .map(|_| {
            let controller = controller.clone();
            tokio::spawn(async move { controller.run_process().await.unwrap() })
        })
        .collect();
    for trigger in triggers {
        trigger.await.unwrap();
    }
    controller.wait_idle().await;

    let iterations = store.list_iterations().await.unwrap();
    assert_eq!(iterations.len(), 1);
    assert_eq!(open_iterations(&store).await, 1);
    assert_eq!(iterations[0].status, IterationState::Validating);
    assert_eq!(iterations[0].sample_ids().len(), 2);
    assert!(iterations[0].model_id.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_validations_complete_the_iteration_once() {
    let store = seeded_store(6, 1).await;
    let controller = controller(
        store.clone(),
        Setup {
            max_iterations: 2,
            ..Setup::default()
        },
    )
    .await;
    controller.run_until_idle().await.unwrap();
    let first_id = controller.snapshot().iteration_id.unwrap();
    let mut ids: Vec<String> = store
        .get_iteration(&first_id)
        .await
        .unwrap()
        .unwrap()
        .sample_ids()
        .iter()
        .cloned()
        .collect();
    ids.sort();
    assert_eq!(ids.len(), 6);

    let validations: Vec<_> = ids
        .iter()
        .enumerate()
        .map(|(i, id)| {
            let controller = controller.clone();
            let id = id.clone();
            tokio::spawn(async move { controller.validate_sample(&id, i != 0, "ana").await })
        })
        .collect();
    for validation in validations {
        validation.await.unwrap().unwrap();
    }
    controller.wait_idle().await;

    let iterations = store.list_iterations().await.unwrap();
    let completed: Vec<_> = iterations
        .iter()
        .filter(|it| it.status == IterationState::Complete)
        .collect();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].id, first_id);
    assert!(open_iterations(&store).await <= 1);

    let positions: Vec<u32> = iterations.iter().map(|it| it.position).collect();
    assert_eq!(positions, vec![1, 2]);
    // Only the rejected sample goes back into the pool.
    assert_eq!(iterations[1].sample_ids().len(), 1);
    assert!(iterations[1].sample_ids().contains(&ids[0]));
}

#[tokio::test]
async fn run_stops_at_human_review_with_tagged_proposals() {
    let store = seeded_store(3, 2).await;
    let controller = controller(store.clone(), Setup::default()).await;

    assert_eq!(controller.run_until_idle().await.unwrap(), StartOutcome::Started);

    let snapshot = controller.snapshot();
    assert!(snapshot.waiting_for_review());
    assert_eq!(snapshot.position, 1);
    assert_eq!(snapshot.sample_count, 3);
    assert!(!snapshot.finished);

    let iteration_id = snapshot.iteration_id.unwrap();
    let proposals = store.iteration_annotations(&iteration_id).await.unwrap();
    assert_eq!(proposals.len(), 3);
    assert!(proposals.iter().all(|a| !a.is_decided()));

    let experiment = store.latest_experiment().await.unwrap().unwrap();
    assert_eq!(experiment.current_iteration_id.as_deref(), Some(iteration_id.as_str()));
    assert_eq!(experiment.status, "VALIDATING");
}

#[tokio::test]
async fn iteration_stays_open_while_a_sample_is_undecided() {
    let store = seeded_store(3, 0).await;
    let controller = controller(store.clone(), Setup::default()).await;
    controller.run_until_idle().await.unwrap();
    let iteration_id = controller.snapshot().iteration_id.unwrap();

    for accept in [true, false] {
        let mut sample = controller.next_for_review().await.unwrap().unwrap();
        controller
            .validate_annotation(&mut sample, accept, "ana")
            .await
            .unwrap();
    }
    controller.wait_idle().await;

    let iteration = store.get_iteration(&iteration_id).await.unwrap().unwrap();
    assert_eq!(iteration.status, IterationState::Validating);
    assert!(iteration.end_time.is_none());
    assert!(controller.next_for_review().await.unwrap().is_some());
}

#[tokio::test]
async fn repeated_validation_changes_nothing() {
    let store = seeded_store(2, 0).await;
    let controller = controller(store.clone(), Setup::default()).await;
    controller.run_until_idle().await.unwrap();
    let iteration_id = controller.snapshot().iteration_id.unwrap();

    let first = controller.next_for_review().await.unwrap().unwrap();
    let once = controller.validate_sample(&first.id, true, "ana").await.unwrap();
    let twice = controller.validate_sample(&first.id, true, "ana").await.unwrap();
    controller.wait_idle().await;
    assert_eq!(once, twice);

    let annotations = store.iteration_annotations(&iteration_id).await.unwrap();
    assert_eq!(annotations.len(), 2);
    assert_eq!(annotations.iter().filter(|a| a.is_decided()).count(), 1);
    assert_eq!(controller.snapshot().status, Some(IterationState::Validating));

    let stored = store.get_sample(&first.id).await.unwrap().unwrap();
    assert!(stored.validated);
}

#[tokio::test]
async fn rejected_samples_return_to_the_pool() {
    let store = seeded_store(2, 0).await;
    let controller = controller(
        store.clone(),
        Setup {
            max_iterations: 2,
            ..Setup::default()
        },
    )
    .await;
    controller.run_until_idle().await.unwrap();

    assert_eq!(review_all(&controller, &store, false).await, 2);
    controller.wait_idle().await;

    let iterations = store.list_iterations().await.unwrap();
    assert_eq!(iterations.len(), 2);
    assert_eq!(iterations[0].status, IterationState::Complete);
    assert!(iterations[0].end_time.is_some());
    assert_eq!(iterations[1].status, IterationState::Validating);
    assert_eq!(iterations[1].sample_ids(), iterations[0].sample_ids());
    assert_eq!(open_iterations(&store).await, 1);
}

#[tokio::test]
async fn full_run_finalizes_with_metrics() {
    let dir = tempfile::tempdir().unwrap();
    let report_path = dir.path().join("metrics.json");
    let store = seeded_store(3, 2).await;
    let controller = controller(
        store.clone(),
        Setup {
            report_path: Some(report_path.clone()),
            ..Setup::default()
        },
    )
    .await;
    controller.run_until_idle().await.unwrap();

    assert_eq!(review_all(&controller, &store, true).await, 3);
    controller.wait_idle().await;

    let snapshot = controller.snapshot();
    assert!(snapshot.finished);
    assert_eq!(snapshot.status, Some(IterationState::Complete));
    assert_eq!(open_iterations(&store).await, 0);

    let experiment = store.latest_experiment().await.unwrap().unwrap();
    assert_eq!(experiment.status, PROCESS_COMPLETE);

    let report = controller.metric_report().await.unwrap().unwrap();
    assert_eq!(report.golden_size, 2);
    assert_eq!(report.values["accuracy"], 1.0);
    assert!(report.values.contains_key("span_f1"));
    assert!(report_path.exists());

    assert!(store.pending_samples().await.unwrap().is_empty());
    assert_eq!(
        controller.run_process().await.unwrap(),
        StartOutcome::AlreadyComplete
    );
}

#[tokio::test]
async fn validation_after_finalization_is_refused() {
    let store = seeded_store(1, 1).await;
    let controller = controller(store.clone(), Setup::default()).await;
    controller.run_until_idle().await.unwrap();
    let sample = controller.next_for_review().await.unwrap().unwrap();
    controller
        .validate_sample(&sample.id, true, "ana")
        .await
        .unwrap();
    controller.wait_idle().await;
    assert!(controller.snapshot().finished);

    let err = controller
        .validate_sample(&sample.id, false, "ana")
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<LoopError>(),
        Some(LoopError::AlreadyFinalized)
    ));
}

#[tokio::test]
async fn empty_pool_finalizes_without_iterations() {
    let store = seeded_store(0, 2).await;
    let controller = controller(
        store.clone(),
        Setup {
            max_iterations: 3,
            ..Setup::default()
        },
    )
    .await;
    controller.run_until_idle().await.unwrap();

    assert!(controller.snapshot().finished);
    assert!(store.list_iterations().await.unwrap().is_empty());
    let report = controller.metric_report().await.unwrap().unwrap();
    assert_eq!(report.golden_size, 2);
}

#[tokio::test]
async fn unmet_stop_condition_outlasts_the_budget() {
    let store = seeded_store(2, 0).await;
    let controller = controller(
        store.clone(),
        Setup {
            max_iterations: 1,
            threshold: Some(0.9),
            ..Setup::default()
        },
    )
    .await;
    controller.run_until_idle().await.unwrap();

    // One of two accepted: 0.5 < 0.9, so the loop continues past max_iterations.
    let first = controller.next_for_review().await.unwrap().unwrap();
    controller.validate_sample(&first.id, true, "ana").await.unwrap();
    let second = controller.next_for_review().await.unwrap().unwrap();
    controller.validate_sample(&second.id, false, "ana").await.unwrap();
    controller.wait_idle().await;

    let iterations = store.list_iterations().await.unwrap();
    assert_eq!(iterations.len(), 2);
    assert_eq!(iterations[1].sample_ids().len(), 1);
    assert!(iterations[1].sample_ids().contains(&second.id));
    assert!(!controller.snapshot().finished);
}

#[tokio::test]
async fn snapshot_subscribers_see_transitions() {
    let store = seeded_store(1, 0).await;
    let controller = controller(store.clone(), Setup::default()).await;
    let mut updates = controller.subscribe();
    assert_eq!(updates.borrow_and_update().status, None);

    controller.run_until_idle().await.unwrap();
    assert!(updates.has_changed().unwrap());
    assert!(updates.borrow_and_update().waiting_for_review());
}

#[tokio::test]
async fn shutdown_stops_the_runner() {
    let store = seeded_store(1, 0).await;
    let controller = controller(store.clone(), Setup::default()).await;
    controller.shutdown().await;
    let outcome = controller.run_process().await.unwrap();
    assert_eq!(outcome, StartOutcome::Started);
    controller.wait_idle().await;
    // The driver was cancelled before doing any work.
    assert!(store.list_iterations().await.unwrap().is_empty());
}
