//! After a restart, the Queue Manager must reconstruct its pending set
//! from the Store alone, in submission order, with nothing serialized
//! to disk in between.

mod support;

#[tokio::test]
async fn queue_reconciles_pending_builds_in_submission_order() {
    let store = support::connect().await;

    let run_id = uuid::Uuid::new_v4();
    let build_ids: Vec<String> = (0..5).map(|i| format!("crash-{run_id}-build-{i}")).collect();

    for id in &build_ids {
        support::seed_pending_build(&store, id).await;
        // submitted_at has second-level granularity relevance only;
        // inserts are already strictly ordered by insertion order here.
    }

    // Simulate a restart: a brand new `QueueManager` reading only from
    // the Store, as `main` does on startup.
    let queue = controller::queue::QueueManager::reconcile(store.clone())
        .await
        .expect("reconcile queue from store");

    assert_eq!(queue.stats().await.pending, build_ids.len());

    let stats = store.stats().await.expect("stats");
    assert!(stats.builds_queued as usize >= build_ids.len());
}
