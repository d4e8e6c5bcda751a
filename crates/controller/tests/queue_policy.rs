//! A transient assignment failure (the polling worker is already
//! `building`) must retain the build in place rather than dropping it
//! from the queue, and a second, idle worker must still be able to
//! claim it afterwards.

mod support;

use controller::assignment::AssignmentService;
use controller::domain::{BuildStatus, WorkerStatus};
use controller::queue::{DequeueOutcome, QueueManager};
use controller::store::WorkerPatch;

#[tokio::test]
async fn worker_busy_retains_build_for_the_next_poller() {
    let store = support::connect().await;
    let assignment = AssignmentService::new(store.clone());

    let run_id = uuid::Uuid::new_v4();
    let build_id = format!("retain-{run_id}-build");
    let busy_worker = format!("retain-{run_id}-busy-worker");
    let idle_worker = format!("retain-{run_id}-idle-worker");

    support::seed_pending_build(&store, &build_id).await;
    support::seed_idle_worker(&store, &busy_worker).await;
    support::seed_idle_worker(&store, &idle_worker).await;

    // Simulate `busy_worker` already mid-build on something else.
    store
        .update_worker(
            store.pool(),
            &busy_worker,
            WorkerPatch::default().status(WorkerStatus::Building),
        )
        .await
        .expect("force worker into building state");

    let queue = QueueManager::reconcile(store.clone())
        .await
        .expect("reconcile queue");
    assert_eq!(queue.stats().await.pending, 1);

    match queue.dequeue_for_worker(&assignment, &busy_worker).await {
        DequeueOutcome::Transient(_) => {}
        _ => panic!("expected a transient worker_busy outcome"),
    }

    // The build must still be pending, and the queue must not have
    // dropped it.
    let build = store
        .get_build(&build_id)
        .await
        .expect("get_build")
        .expect("build exists");
    assert_eq!(build.status, BuildStatus::Pending);
    assert_eq!(queue.stats().await.pending, 1);

    match queue.dequeue_for_worker(&assignment, &idle_worker).await {
        DequeueOutcome::Assigned(build) => {
            assert_eq!(build.id, build_id);
            assert_eq!(build.worker_id.as_deref(), Some(idle_worker.as_str()));
        }
        _ => panic!("the idle worker should have claimed the retained build"),
    }
    assert_eq!(queue.stats().await.pending, 0);
}
