//! Integration tests for the generation task state machine

use batchwork::{
    BatchworkError, BulkAction, TaskConfig,
    clock::MockClock,
    task::{
        BatchStats, BatchStatus, CasOutcome, GenerationTask, InMemoryTaskStore, ItemResult,
        ItemStatus, NewTask, TaskEvent, TaskFilter, TaskId, TaskStateMachine, TaskStatus,
        TaskStore, transition,
    },
};
use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use std::{sync::Arc, time::Duration};

fn machine() -> (MockClock, Arc<InMemoryTaskStore>, TaskStateMachine) {
    let clock = MockClock::new();
    let store = Arc::new(InMemoryTaskStore::with_clock(
        clock.clone(),
        Duration::from_secs(7 * 86400),
    ));
    let machine = TaskStateMachine::new(store.clone(), Arc::new(clock.clone()));
    (clock, store, machine)
}

fn items(prefix: &str, count: usize) -> Vec<String> {
    (0..count).map(|i| format!("{}-{}", prefix, i)).collect()
}

async fn started(machine: &TaskStateMachine, new: NewTask) -> TaskId {
    let task = machine.create_task(new).await.unwrap();
    machine.start_task(task.id).await.unwrap();
    task.id
}

#[tokio::test]
async fn test_progress_counts_completed_items() {
    let (_, _, machine) = machine();
    let task_id = started(
        &machine,
        NewTask::new("posts", items("post", 50)).with_batch_size(10),
    )
    .await;

    let task = machine.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.total_items, 50);
    assert_eq!(task.batches.len(), 5);

    // 6 in the first batch, 4 in the third
    let first = task.batches[0].clone();
    let third = task.batches[2].clone();
    for item in first.item_ids().into_iter().take(6) {
        machine
            .record_item_result(task_id, first.batch_id, ItemResult::completed(item))
            .await
            .unwrap();
    }
    let results = third
        .item_ids()
        .into_iter()
        .take(4)
        .map(ItemResult::completed)
        .collect();
    machine
        .update_batch(task_id, third.batch_id, results)
        .await
        .unwrap();

    let task = machine.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.processed_count(), 10);
    assert_eq!(task.progress(), 20.0);
    assert_eq!(task.status, TaskStatus::Processing);
}

#[tokio::test]
async fn test_mixed_batch_completes_with_errors() {
    let (_, _, machine) = machine();
    let task_id = started(&machine, NewTask::new("posts", items("post", 3))).await;
    let batch_id = machine.get_task(task_id).await.unwrap().unwrap().batches[0].batch_id;

    machine
        .update_batch(
            task_id,
            batch_id,
            vec![
                ItemResult::completed("post-0"),
                ItemResult::failed("post-1", "model refused"),
                ItemResult::completed("post-2"),
            ],
        )
        .await
        .unwrap();

    let task = machine.get_task(task_id).await.unwrap().unwrap();
    let batch = &task.batches[0];
    assert_eq!(batch.status, BatchStatus::CompletedWithErrors);
    assert_eq!(
        batch.stats,
        BatchStats {
            total: 3,
            completed: 2,
            failed: 1
        }
    );
    assert_eq!(batch.items[1].status, ItemStatus::Failed);
    assert_eq!(batch.items[1].error.as_deref(), Some("model refused"));
    assert_eq!(task.status, TaskStatus::CompletedWithErrors);
}

#[tokio::test]
async fn test_cancel_processing_task_cancels_open_batches() {
    let (_, _, machine) = machine();
    let task_id = started(
        &machine,
        NewTask::new("posts", items("post", 4)).with_batch_size(2),
    )
    .await;
    let first = machine.get_task(task_id).await.unwrap().unwrap().batches[0].batch_id;
    machine
        .update_batch(
            task_id,
            first,
            vec![ItemResult::completed("post-0"), ItemResult::completed("post-1")],
        )
        .await
        .unwrap();

    let cancelled = machine.cancel_task(task_id).await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert!(cancelled.cancelled_at.is_some());
    assert_eq!(cancelled.batches[0].status, BatchStatus::Completed);
    assert_eq!(cancelled.batches[1].status, BatchStatus::Cancelled);
    assert!(
        cancelled.batches[1]
            .items
            .iter()
            .all(|item| item.status == ItemStatus::Cancelled)
    );
    assert!(!machine.polling().is_queued(task_id).await);
}

#[tokio::test]
async fn test_cancel_completed_task_is_noop() {
    let (_, _, machine) = machine();
    let task_id = started(&machine, NewTask::new("posts", vec!["only".into()])).await;
    let batch_id = machine.get_task(task_id).await.unwrap().unwrap().batches[0].batch_id;
    let completed = machine
        .record_item_result(task_id, batch_id, ItemResult::completed("only"))
        .await
        .unwrap();
    assert_eq!(completed.status, TaskStatus::Completed);

    let after = machine.cancel_task(task_id).await.unwrap();
    assert_eq!(after.status, TaskStatus::Completed);
    assert_eq!(after.version, completed.version);
    assert!(after.cancelled_at.is_none());
}

#[tokio::test]
async fn test_pause_and_resume_restore_status() {
    let (clock, _, machine) = machine();
    let task_id = started(
        &machine,
        NewTask::new("posts", items("post", 4)).with_batch_size(2),
    )
    .await;
    let first = machine.get_task(task_id).await.unwrap().unwrap().batches[0].batch_id;
    machine
        .record_item_result(task_id, first, ItemResult::completed("post-0"))
        .await
        .unwrap();

    let paused = machine.pause_task(task_id).await.unwrap();
    assert_eq!(paused.status, TaskStatus::Paused);
    assert_eq!(paused.paused_from_status, Some(TaskStatus::Processing));
    assert!(paused.paused_at.is_some());

    // Results for a paused task are not applied
    let ignored = machine
        .record_item_result(task_id, first, ItemResult::completed("post-1"))
        .await
        .unwrap();
    assert_eq!(ignored.version, paused.version);

    clock.advance(ChronoDuration::minutes(10));
    let resumed = machine.resume_task(task_id).await.unwrap();
    assert_eq!(resumed.status, TaskStatus::Processing);
    assert!(resumed.paused_at.is_none());
    assert!(resumed.paused_from_status.is_none());

    // Completed items inside the partial batch survive the pause
    assert_eq!(resumed.batches[0].items[0].status, ItemStatus::Completed);
    assert_eq!(resumed.batches[0].pending_item_ids(), vec!["post-1".to_string()]);
    assert_eq!(resumed.processed_count(), 1);
}

#[tokio::test]
async fn test_retry_until_failed_permanent() {
    let (_, _, machine) = machine();
    let task_id = started(
        &machine,
        NewTask::new("posts", items("post", 2)).with_max_retries(3),
    )
    .await;

    for expected_retry in 1..=2 {
        let failed = machine.fail_task(task_id, "provider outage").await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        let retried = machine.retry_task(task_id).await.unwrap();
        assert_eq!(retried.retry_count, expected_retry);
        assert_eq!(retried.status, TaskStatus::Retrying);
    }

    let failed = machine.fail_task(task_id, "provider outage").await.unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.retry_count, 2);

    let retried = machine.retry_task(task_id).await.unwrap();
    assert_eq!(retried.retry_count, 3);
    assert_eq!(retried.status, TaskStatus::Retrying);

    let exhausted = machine.fail_task(task_id, "provider outage").await.unwrap();
    assert_eq!(exhausted.status, TaskStatus::FailedPermanent);
    assert!(exhausted.status.is_terminal());
    assert!(matches!(
        machine.retry_task(task_id).await,
        Err(BatchworkError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn test_retry_keeps_completed_items() {
    let (_, _, machine) = machine();
    let task_id = started(&machine, NewTask::new("posts", items("post", 3))).await;
    let batch_id = machine.get_task(task_id).await.unwrap().unwrap().batches[0].batch_id;

    let failed = machine
        .update_batch(
            task_id,
            batch_id,
            vec![
                ItemResult::failed("post-0", "x"),
                ItemResult::failed("post-1", "x"),
                ItemResult::failed("post-2", "x"),
            ],
        )
        .await
        .unwrap();
    assert_eq!(failed.batches[0].status, BatchStatus::Failed);
    assert_eq!(failed.status, TaskStatus::Failed);

    let retried = machine.retry_task(task_id).await.unwrap();
    assert_eq!(retried.batches[0].status, BatchStatus::Pending);
    assert_eq!(retried.batches[0].pending_item_ids().len(), 3);

    // First result back moves the task into processing
    let running = machine
        .record_item_result(task_id, batch_id, ItemResult::completed("post-0"))
        .await
        .unwrap();
    assert_eq!(running.status, TaskStatus::Processing);
    assert_eq!(running.progress(), 100.0 / 3.0);
}

#[tokio::test]
async fn test_timeout_applies_to_stuck_tasks_only() {
    let (clock, _, machine) = machine();
    let machine = machine.with_config(TaskConfig {
        timeout_threshold: Duration::from_secs(3600),
        ..TaskConfig::default()
    });
    let stuck = started(&machine, NewTask::new("posts", items("post", 2))).await;
    let waiting = machine
        .create_task(NewTask::new("posts", items("post", 2)))
        .await
        .unwrap()
        .id;

    clock.advance(ChronoDuration::minutes(30));
    assert!(machine.check_timeouts().await.unwrap().is_empty());

    clock.advance(ChronoDuration::minutes(31));
    assert_eq!(machine.check_timeouts().await.unwrap(), vec![stuck]);

    let task = machine.get_task(stuck).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::TimedOut);
    assert!(task.timed_out_at.is_some());
    assert_eq!(
        machine.get_task(waiting).await.unwrap().unwrap().status,
        TaskStatus::Pending
    );
}

#[tokio::test]
async fn test_paused_time_does_not_count_towards_timeout() {
    let (clock, _, machine) = machine();
    let task_id = started(&machine, NewTask::new("posts", items("post", 2))).await;

    let started_at = machine.get_task(task_id).await.unwrap().unwrap().started_at;

    clock.advance(ChronoDuration::minutes(50));
    machine.pause_task(task_id).await.unwrap();
    clock.advance(ChronoDuration::hours(5));
    let resumed = machine.resume_task(task_id).await.unwrap();
    assert_eq!(resumed.started_at, started_at);
    clock.advance(ChronoDuration::minutes(5));

    assert!(machine.check_timeouts().await.unwrap().is_empty());

    clock.advance(ChronoDuration::minutes(6));
    assert_eq!(machine.check_timeouts().await.unwrap(), vec![task_id]);
}

/// Store that refuses every write to one task.
struct ContendedStore {
    inner: InMemoryTaskStore,
    contended: std::sync::Mutex<Option<TaskId>>,
}

#[async_trait]
impl TaskStore for ContendedStore {
    async fn insert(&self, task: &GenerationTask) -> batchwork::Result<GenerationTask> {
        self.inner.insert(task).await
    }

    async fn load(&self, task_id: TaskId) -> batchwork::Result<Option<GenerationTask>> {
        self.inner.load(task_id).await
    }

    async fn compare_and_swap(
        &self,
        task: &GenerationTask,
        expected_version: u64,
    ) -> batchwork::Result<CasOutcome> {
        let contended = *self.contended.lock().unwrap() == Some(task.id);
        if contended {
            return Ok(CasOutcome::Conflict(self.inner.load(task.id).await?));
        }
        self.inner.compare_and_swap(task, expected_version).await
    }

    async fn delete(&self, task_id: TaskId, expected_version: u64) -> batchwork::Result<bool> {
        self.inner.delete(task_id, expected_version).await
    }

    async fn list(&self, filter: &TaskFilter) -> batchwork::Result<Vec<GenerationTask>> {
        self.inner.list(filter).await
    }

    async fn purge_expired(&self) -> batchwork::Result<u64> {
        self.inner.purge_expired().await
    }
}

#[tokio::test]
async fn test_timeout_sweep_survives_a_conflicting_task() {
    let clock = MockClock::new();
    let store = Arc::new(ContendedStore {
        inner: InMemoryTaskStore::with_clock(clock.clone(), Duration::from_secs(7 * 86400)),
        contended: std::sync::Mutex::new(None),
    });
    let machine = TaskStateMachine::new(store.clone(), Arc::new(clock.clone())).with_config(
        TaskConfig {
            timeout_threshold: Duration::from_secs(3600),
            ..TaskConfig::default()
        },
    );

    let busy = started(&machine, NewTask::new("posts", items("busy", 2))).await;
    let stuck = started(&machine, NewTask::new("posts", items("stuck", 2))).await;
    *store.contended.lock().unwrap() = Some(busy);

    clock.advance(ChronoDuration::minutes(61));
    assert_eq!(machine.check_timeouts().await.unwrap(), vec![stuck]);
    assert_eq!(
        machine.get_task(busy).await.unwrap().unwrap().status,
        TaskStatus::Processing
    );
}

#[tokio::test]
async fn test_versions_increase_on_every_write() {
    let (_, store, machine) = machine();
    let task = machine
        .create_task(NewTask::new("posts", items("post", 2)))
        .await
        .unwrap();
    assert_eq!(task.version, 1);

    let mut versions = vec![task.version];
    versions.push(machine.start_task(task.id).await.unwrap().version);
    versions.push(machine.set_priority(task.id, 3).await.unwrap().version);
    versions.push(machine.pause_task(task.id).await.unwrap().version);
    versions.push(machine.resume_task(task.id).await.unwrap().version);
    assert!(versions.windows(2).all(|pair| pair[1] > pair[0]));

    let stale = store.load(task.id).await.unwrap().unwrap();
    let mut winner = stale.clone();
    winner.priority = 1;
    assert!(matches!(
        store.compare_and_swap(&winner, stale.version).await.unwrap(),
        CasOutcome::Stored(_)
    ));

    let mut loser = stale.clone();
    loser.priority = 99;
    match store.compare_and_swap(&loser, stale.version).await.unwrap() {
        CasOutcome::Conflict(Some(current)) => assert_eq!(current.priority, 1),
        other => panic!("expected conflict, got {:?}", other),
    }
}

#[tokio::test]
async fn test_concurrent_results_are_not_lost() {
    let (_, _, machine) = machine();
    let machine = Arc::new(machine);
    let task_id = started(
        &machine,
        NewTask::new("posts", items("post", 20)).with_batch_size(20),
    )
    .await;
    let batch_id = machine.get_task(task_id).await.unwrap().unwrap().batches[0].batch_id;

    let mut handles = Vec::new();
    for item in items("post", 10) {
        let machine = machine.clone();
        handles.push(tokio::spawn(async move {
            machine
                .record_item_result(task_id, batch_id, ItemResult::completed(item))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let task = machine.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.processed_count(), 10);
    assert_eq!(task.progress(), 50.0);
}

#[tokio::test]
async fn test_bulk_run_is_status_gated() {
    let (_, _, machine) = machine();
    let pending = machine
        .create_task(NewTask::new("posts", items("a", 2)))
        .await
        .unwrap()
        .id;

    let cancelled = machine
        .create_task(NewTask::new("posts", items("b", 2)))
        .await
        .unwrap()
        .id;
    machine.cancel_task(cancelled).await.unwrap();

    let failed = started(&machine, NewTask::new("posts", items("c", 2))).await;
    machine.fail_task(failed, "boom").await.unwrap();

    let running = started(&machine, NewTask::new("posts", items("d", 2))).await;
    let missing = uuid::Uuid::new_v4();

    let report = machine
        .bulk_action(BulkAction::Run, &[pending, cancelled, failed, running, missing])
        .await
        .unwrap();

    assert_eq!(report.applied, vec![pending, cancelled, failed]);
    assert_eq!(report.skipped, vec![(running, TaskStatus::Processing)]);
    assert_eq!(report.missing, vec![missing]);
    assert!(report.failed.is_empty());
    assert_eq!(report.total(), 5);

    assert_eq!(
        machine.get_task(pending).await.unwrap().unwrap().status,
        TaskStatus::Processing
    );
    assert_eq!(
        machine.get_task(cancelled).await.unwrap().unwrap().status,
        TaskStatus::Processing
    );
    assert_eq!(
        machine.get_task(failed).await.unwrap().unwrap().status,
        TaskStatus::Retrying
    );
}

#[tokio::test]
async fn test_bulk_actions_cover_every_operation() {
    let (_, _, machine) = machine();
    let a = started(&machine, NewTask::new("posts", items("a", 2))).await;
    let b = started(&machine, NewTask::new("posts", items("b", 2))).await;

    let report = machine.bulk_action(BulkAction::Pause, &[a, b]).await.unwrap();
    assert_eq!(report.applied.len(), 2);

    let report = machine
        .bulk_action(BulkAction::Priority(2), &[a, b])
        .await
        .unwrap();
    assert_eq!(report.applied.len(), 2);
    assert_eq!(machine.get_task(a).await.unwrap().unwrap().priority, 2);

    let report = machine.bulk_action(BulkAction::Resume, &[a]).await.unwrap();
    assert_eq!(report.applied, vec![a]);

    let report = machine.bulk_action(BulkAction::Cancel, &[a, b]).await.unwrap();
    assert_eq!(report.applied, vec![a]);
    assert_eq!(report.skipped, vec![(b, TaskStatus::Paused)]);

    let report = machine.bulk_action(BulkAction::Retry, &[a]).await.unwrap();
    assert_eq!(report.skipped, vec![(a, TaskStatus::Cancelled)]);

    let report = machine.bulk_action(BulkAction::Delete, &[a, b]).await.unwrap();
    assert_eq!(report.applied, vec![a, b]);
    assert!(machine.get_task(a).await.unwrap().is_none());
    assert!(
        machine
            .list_tasks(&TaskFilter::new())
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_delete_running_task_is_rejected() {
    let (_, _, machine) = machine();
    let task_id = started(&machine, NewTask::new("posts", items("a", 1))).await;

    assert!(matches!(
        machine.delete_task(task_id).await,
        Err(BatchworkError::InvalidTransition { .. })
    ));
    machine.cancel_task(task_id).await.unwrap();
    assert!(machine.delete_task(task_id).await.unwrap());
    assert!(!machine.delete_task(task_id).await.unwrap());
}

#[tokio::test]
async fn test_expired_tasks_are_purged() {
    let clock = MockClock::new();
    let store = Arc::new(InMemoryTaskStore::with_clock(
        clock.clone(),
        Duration::from_secs(3600),
    ));
    let machine = TaskStateMachine::new(store, Arc::new(clock.clone()));
    let task = machine
        .create_task(NewTask::new("posts", items("a", 1)))
        .await
        .unwrap();

    clock.advance(ChronoDuration::minutes(59));
    assert!(machine.get_task(task.id).await.unwrap().is_some());

    clock.advance(ChronoDuration::minutes(2));
    assert!(machine.get_task(task.id).await.unwrap().is_none());
    assert_eq!(machine.purge_expired().await.unwrap(), 1);
}

#[test]
fn test_transition_is_pure() {
    let now = chrono::Utc::now();
    let task = GenerationTask::new(NewTask::new("posts", items("a", 3)), 10, 3, now);

    let first = transition(&task, &TaskEvent::Start, now).unwrap();
    let second = transition(&task, &TaskEvent::Start, now).unwrap();
    assert_eq!(first, second);
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(first.task.status, TaskStatus::Processing);
    assert!(first.changed);
}
