//! Integration tests for the in-memory job store and handler dispatch

use batchwork::{
    BatchworkError, HandlerRegistry, JobOutcome, JobStatus, JobStore, MemoryQueue, QueueOptions,
    RetryStrategy,
    clock::{Clock, MockClock},
    handler_fn,
};
use chrono::Duration as ChronoDuration;
use serde_json::json;
use std::{sync::Arc, time::Duration};

fn setup() -> (MockClock, Arc<MemoryQueue>, HandlerRegistry) {
    let clock = MockClock::new();
    let queue = Arc::new(MemoryQueue::with_clock(clock.clone()));
    let registry = HandlerRegistry::new(queue.clone(), Arc::new(clock.clone()))
        .unwrap()
        .with_retry_strategy(RetryStrategy::fixed(Duration::from_secs(30)));
    (clock, queue, registry)
}

#[tokio::test]
async fn test_delayed_job_becomes_ready_after_delay() {
    let (clock, queue, _) = setup();

    let job_id = queue
        .queue_job(
            "export",
            json!({"report": "monthly"}),
            QueueOptions::new()
                .with_priority(5)
                .with_delay(Duration::from_secs(10)),
        )
        .await
        .unwrap();
    assert!(!job_id.to_string().is_empty());

    assert!(queue.get_ready_jobs(3).await.unwrap().is_empty());

    clock.advance(ChronoDuration::seconds(9));
    assert!(queue.get_ready_jobs(3).await.unwrap().is_empty());

    clock.advance(ChronoDuration::seconds(1));
    let ready = queue.get_ready_jobs(3).await.unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].id, job_id);
    assert_eq!(ready[0].priority, 5);
    assert_eq!(ready[0].status, JobStatus::Queued);
    assert_eq!(ready[0].attempts, 0);
}

#[tokio::test]
async fn test_huge_delay_is_never_ready() {
    let (clock, queue, _) = setup();

    let forever = queue
        .queue_job(
            "export",
            json!({}),
            QueueOptions::new().with_delay(Duration::from_secs(u64::MAX)),
        )
        .await
        .unwrap();
    let far = queue
        .queue_job(
            "export",
            json!({}),
            QueueOptions::new().with_delay(Duration::from_secs(9_000_000_000_000)),
        )
        .await
        .unwrap();

    clock.advance(ChronoDuration::days(365));
    let ready: Vec<_> = queue
        .get_ready_jobs(3)
        .await
        .unwrap()
        .into_iter()
        .map(|job| job.id)
        .collect();
    assert!(!ready.contains(&forever));
    assert!(!ready.contains(&far));
}

#[tokio::test]
async fn test_ready_jobs_follow_priority_then_schedule() {
    let (clock, queue, _) = setup();

    let mut expected = Vec::new();
    let background = queue
        .queue_job("a", json!({}), QueueOptions::new().with_priority(20))
        .await
        .unwrap();
    clock.advance(ChronoDuration::seconds(1));
    let first_normal = queue
        .queue_job("a", json!({}), QueueOptions::new())
        .await
        .unwrap();
    clock.advance(ChronoDuration::seconds(1));
    let urgent = queue
        .queue_job("a", json!({}), QueueOptions::new().with_priority(1))
        .await
        .unwrap();
    clock.advance(ChronoDuration::seconds(1));
    let second_normal = queue
        .queue_job("a", json!({}), QueueOptions::new())
        .await
        .unwrap();

    expected.extend([urgent, first_normal, second_normal, background]);

    let order: Vec<_> = queue
        .get_ready_jobs(10)
        .await
        .unwrap()
        .into_iter()
        .map(|job| job.id)
        .collect();
    assert_eq!(order, expected);

    let limited = queue.get_ready_jobs(2).await.unwrap();
    assert_eq!(limited.len(), 2);
    assert_eq!(limited[0].id, urgent);
}

#[tokio::test]
async fn test_attempts_never_exceed_max_attempts() {
    let (clock, queue, registry) = setup();
    registry.register_handler(
        "flaky",
        handler_fn(|_| async { Err(BatchworkError::Processing("upstream down".into())) }),
    );

    let job_id = queue
        .queue_job("flaky", json!({}), QueueOptions::new().with_max_attempts(2))
        .await
        .unwrap();

    let job = queue.get_job(job_id).await.unwrap().unwrap();
    let outcome = registry.process_job(job).await.unwrap();
    assert!(matches!(outcome, JobOutcome::Retrying { attempts: 1, .. }));

    let job = queue.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Retrying);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.scheduled_at, clock.now() + ChronoDuration::seconds(30));
    assert!(queue.get_ready_jobs(3).await.unwrap().is_empty());

    clock.advance(ChronoDuration::seconds(30));
    let job = queue.get_ready_jobs(3).await.unwrap().remove(0);
    let outcome = registry.process_job(job).await.unwrap();
    assert_eq!(outcome, JobOutcome::Failed { attempts: 2 });

    let job = queue.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 2);
    assert!(job.attempts <= job.max_attempts);
    assert_eq!(job.error_message.as_deref(), Some("Processing error: upstream down"));

    clock.advance(ChronoDuration::hours(1));
    assert!(queue.get_ready_jobs(3).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unregistered_handler_follows_retry_branch() {
    let (_, queue, registry) = setup();

    let job_id = queue
        .queue_job("nobody_home", json!({}), QueueOptions::new())
        .await
        .unwrap();
    let job = queue.get_job(job_id).await.unwrap().unwrap();

    let outcome = registry.process_job(job).await.unwrap();
    assert!(matches!(outcome, JobOutcome::Retrying { attempts: 1, .. }));

    let job = queue.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Retrying);
    assert!(job.error_message.unwrap().contains("nobody_home"));
}

#[tokio::test]
async fn test_timed_out_handler_is_never_success() {
    let (_, queue, registry) = setup();
    let registry = registry.with_job_timeout(Duration::from_millis(20));
    registry.register_handler(
        "slow",
        handler_fn(|_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }),
    );

    let job_id = queue
        .queue_job("slow", json!({}), QueueOptions::new())
        .await
        .unwrap();
    let job = queue.get_job(job_id).await.unwrap().unwrap();

    let outcome = registry.process_job(job).await.unwrap();
    assert!(matches!(outcome, JobOutcome::Retrying { attempts: 1, .. }));

    let job = queue.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Retrying);
    assert!(job.error_message.unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_progress_updates_persist_immediately() {
    let (_, queue, registry) = setup();
    let observer = queue.clone();
    registry.register_handler(
        "report",
        handler_fn(move |ctx| {
            let observer = observer.clone();
            async move {
                ctx.update_progress(40, Some("halfway-ish")).await?;
                let seen = observer.get_job(ctx.job_id).await?.map(|job| job.progress);
                assert_eq!(seen, Some(40));
                Ok(())
            }
        }),
    );

    let job_id = queue
        .queue_job("report", json!({}), QueueOptions::new())
        .await
        .unwrap();
    let job = queue.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(registry.process_job(job).await.unwrap(), JobOutcome::Completed);

    let job = queue.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100);
    assert_eq!(job.progress_message.as_deref(), Some("halfway-ish"));
}

#[tokio::test]
async fn test_cancel_during_run_is_not_resurrected() {
    let (_, queue, registry) = setup();
    let canceller = queue.clone();
    registry.register_handler(
        "long",
        handler_fn(move |ctx| {
            let canceller = canceller.clone();
            async move {
                canceller.cancel_job(ctx.job_id).await?;
                Ok(())
            }
        }),
    );

    let job_id = queue
        .queue_job("long", json!({}), QueueOptions::new())
        .await
        .unwrap();
    let job = queue.get_job(job_id).await.unwrap().unwrap();

    assert_eq!(registry.process_job(job).await.unwrap(), JobOutcome::Skipped);
    assert_eq!(
        queue.get_job(job_id).await.unwrap().unwrap().status,
        JobStatus::Cancelled
    );
}

#[tokio::test]
async fn test_cancel_job_is_idempotent() {
    let (_, queue, _) = setup();
    let job_id = queue
        .queue_job("a", json!({}), QueueOptions::new())
        .await
        .unwrap();

    assert!(queue.cancel_job(job_id).await.unwrap());
    assert!(queue.cancel_job(job_id).await.unwrap());
    assert!(!queue.cancel_job(uuid::Uuid::new_v4()).await.unwrap());
    assert!(queue.get_ready_jobs(3).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cleanup_respects_retention_window() {
    let (clock, queue, registry) = setup();
    registry.register_handler("ok", handler_fn(|_| async { Ok(()) }));

    let done = queue
        .queue_job("ok", json!({}), QueueOptions::new())
        .await
        .unwrap();
    let waiting = queue
        .queue_job("ok", json!({}), QueueOptions::new().with_delay(Duration::from_secs(172800)))
        .await
        .unwrap();
    let job = queue.get_job(done).await.unwrap().unwrap();
    registry.process_job(job).await.unwrap();

    clock.advance(ChronoDuration::hours(23));
    assert_eq!(
        queue
            .cleanup_completed_jobs(Duration::from_secs(86400))
            .await
            .unwrap(),
        0
    );

    clock.advance(ChronoDuration::hours(2));
    assert_eq!(
        queue
            .cleanup_completed_jobs(Duration::from_secs(86400))
            .await
            .unwrap(),
        1
    );
    assert!(queue.get_job(done).await.unwrap().is_none());
    assert!(queue.get_job(waiting).await.unwrap().is_some());
}

#[tokio::test]
async fn test_statistics_count_by_status() {
    let (clock, queue, registry) = setup();
    registry.register_handler("ok", handler_fn(|_| async { Ok(()) }));

    let old = queue
        .queue_job("ok", json!({}), QueueOptions::new())
        .await
        .unwrap();
    clock.advance(ChronoDuration::hours(30));

    let completed = queue
        .queue_job("ok", json!({}), QueueOptions::new())
        .await
        .unwrap();
    let cancelled = queue
        .queue_job("ok", json!({}), QueueOptions::new())
        .await
        .unwrap();
    queue
        .queue_job("ok", json!({}), QueueOptions::new())
        .await
        .unwrap();

    let job = queue.get_job(completed).await.unwrap().unwrap();
    registry.process_job(job).await.unwrap();
    queue.cancel_job(cancelled).await.unwrap();

    let stats = queue
        .get_statistics(Duration::from_secs(86400))
        .await
        .unwrap();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.count(JobStatus::Completed), 1);
    assert_eq!(stats.count(JobStatus::Cancelled), 1);
    assert_eq!(stats.count(JobStatus::Queued), 1);
    assert!(queue.get_job(old).await.unwrap().is_some());
}
