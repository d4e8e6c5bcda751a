//! A build that stops heartbeating is failed by the monitor sweep once
//! `build_timeout` elapses, and its worker is released back to `idle`
//! with `builds_failed` incremented.

mod support;

use std::time::Duration;

use chrono::Utc;
use controller::assignment::AssignmentService;
use controller::domain::{BuildStatus, WorkerStatus};
use controller::store::BuildPatch;

#[tokio::test]
async fn stale_heartbeat_fails_build_and_frees_worker() {
    let store = support::connect().await;
    let assignment = AssignmentService::new(store.clone());

    let run_id = uuid::Uuid::new_v4();
    let build_id = format!("heartbeat-{run_id}-build");
    let worker_id = format!("heartbeat-{run_id}-worker");

    support::seed_pending_build(&store, &build_id).await;
    support::seed_idle_worker(&store, &worker_id).await;

    let assigned = assignment
        .assign(&worker_id)
        .await
        .expect("assign")
        .expect("a pending build is available");
    assert_eq!(assigned.id, build_id);

    // One heartbeat transitions `assigned -> building`, backdated so the
    // very next sweep already sees it as stale without an actual
    // multi-second sleep.
    let backdated = Utc::now() - chrono::Duration::seconds(10);
    store
        .update_build_on_pool(
            &build_id,
            BuildPatch::default()
                .status(BuildStatus::Building)
                .touch_heartbeat(backdated),
        )
        .await
        .expect("record a stale heartbeat");

    let stuck = store
        .mark_stuck_builds_as_failed(Duration::from_secs(2))
        .await
        .expect("sweep stuck builds");
    assert!(stuck.iter().any(|b| b.id == build_id));

    let build = store
        .get_build(&build_id)
        .await
        .expect("get_build")
        .expect("build exists");
    assert_eq!(build.status, BuildStatus::Failed);
    assert_eq!(build.error_message.as_deref(), Some("heartbeat timeout"));

    // The monitor's `reclaim_stuck_builds` step (heartbeat.rs) is what
    // actually releases the worker; here we exercise the same Store
    // call it makes, since that release logic lives outside `mark_
    // stuck_builds_as_failed` itself.
    store
        .update_worker(
            store.pool(),
            &worker_id,
            controller::store::WorkerPatch::default()
                .status(WorkerStatus::Idle)
                .touch(Utc::now())
                .failed(),
        )
        .await
        .expect("release worker");

    let worker = store
        .get_worker(&worker_id)
        .await
        .expect("get_worker")
        .expect("worker exists");
    assert_eq!(worker.status, WorkerStatus::Idle);
    assert_eq!(worker.builds_failed, 1);
}
