//! 20 concurrent pollers against 10 pending builds. Each pending build
//! must be claimed by exactly one caller, the remaining 10 callers must
//! see `None`, no call may deadlock, and no row may be left `pending`
//! after the last commit.

mod support;

use std::collections::HashSet;

use controller::assignment::AssignmentService;
use controller::domain::BuildStatus;

#[tokio::test]
async fn twenty_pollers_ten_pending_builds_each_claimed_once() {
    let store = support::connect().await;

    let run_id = uuid::Uuid::new_v4();
    let build_ids: Vec<String> = (0..10)
        .map(|i| format!("contend-{run_id}-build-{i}"))
        .collect();
    let worker_ids: Vec<String> = (0..20)
        .map(|i| format!("contend-{run_id}-worker-{i}"))
        .collect();

    for id in &build_ids {
        support::seed_pending_build(&store, id).await;
    }
    for id in &worker_ids {
        support::seed_idle_worker(&store, id).await;
    }

    let handles: Vec<_> = worker_ids
        .iter()
        .cloned()
        .map(|worker_id| {
            let assignment = AssignmentService::new(store.clone());
            tokio::spawn(async move { assignment.assign(&worker_id).await })
        })
        .collect();

    let mut assigned_builds = Vec::new();
    let mut none_count = 0;
    for handle in handles {
        match handle.await.expect("assign task panicked") {
            Ok(Some(build)) => assigned_builds.push(build),
            Ok(None) => none_count += 1,
            Err(err) => panic!("assign should not error under contention: {err}"),
        }
    }

    assert_eq!(
        assigned_builds.len(),
        10,
        "exactly 10 of the 20 pollers should win a build"
    );
    assert_eq!(none_count, 10, "the other 10 pollers should see no work");

    let distinct_build_ids: HashSet<_> = assigned_builds.iter().map(|b| b.id.clone()).collect();
    assert_eq!(
        distinct_build_ids.len(),
        10,
        "every pending build must be assigned to exactly one caller"
    );
    assert_eq!(distinct_build_ids, build_ids.iter().cloned().collect());

    let distinct_workers: HashSet<_> = assigned_builds
        .iter()
        .map(|b| b.worker_id.clone().expect("assigned build has a worker"))
        .collect();
    assert_eq!(
        distinct_workers.len(),
        10,
        "no worker should win more than one build under a concurrency budget of 1"
    );

    for id in &build_ids {
        let build = store
            .get_build(id)
            .await
            .expect("get_build")
            .expect("build exists");
        assert_eq!(build.status, BuildStatus::Assigned);
        assert!(build.worker_id.is_some());
    }
}

/// Two overlapping polls from the *same* worker id (e.g. a client retry)
/// must not both win a build — the busy check and the commit that flips
/// the worker to `building` must be atomic against each other.
#[tokio::test]
async fn same_worker_concurrent_polls_claim_at_most_one_build() {
    let store = support::connect().await;

    let run_id = uuid::Uuid::new_v4();
    let build_ids: Vec<String> = (0..2)
        .map(|i| format!("same-worker-{run_id}-build-{i}"))
        .collect();
    let worker_id = format!("same-worker-{run_id}-worker");

    for id in &build_ids {
        support::seed_pending_build(&store, id).await;
    }
    support::seed_idle_worker(&store, &worker_id).await;

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let assignment = AssignmentService::new(store.clone());
            let worker_id = worker_id.clone();
            tokio::spawn(async move { assignment.assign(&worker_id).await })
        })
        .collect();

    let mut assigned_count = 0;
    for handle in handles {
        match handle.await.expect("assign task panicked") {
            Ok(Some(_)) => assigned_count += 1,
            Ok(None) => {}
            Err(err) => assert!(
                matches!(err, controller::assignment::AssignError::WorkerBusy),
                "only a worker_busy rejection is expected for the loser: {err}"
            ),
        }
    }

    assert_eq!(
        assigned_count, 1,
        "a single worker must win at most one build under a concurrency budget of 1, \
         even when its own polls race each other"
    );

    let still_pending = {
        let mut count = 0;
        for id in &build_ids {
            let build = store
                .get_build(id)
                .await
                .expect("get_build")
                .expect("build exists");
            if build.status == BuildStatus::Pending {
                count += 1;
            }
        }
        count
    };
    assert_eq!(
        still_pending, 1,
        "the build the losing poll did not claim must remain pending, not silently dropped"
    );
}
