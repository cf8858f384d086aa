//! Generation tasks: multi-batch work with a versioned lifecycle.
//!
//! A [`GenerationTask`] splits a list of item ids into ordered [`Batch`]es. The
//! [`TaskStateMachine`] owns every status change, running the pure
//! [`transition`] function and persisting its result through a compare-and-swap
//! on the task's `version`. Batches are driven either by queued
//! `generation.batch` jobs ([`JobQueueDispatcher`] + [`GenerationBatchHandler`]) or
//! directly by the caller ([`ManualDispatcher`]); the state-machine contract is
//! the same either way.
//!
//! ```text
//! pending -> processing -> completed | completed_with_errors | failed | cancelled | timed_out
//! processing <-> paused
//! failed -> retrying -> processing      (while retry_count < max_retries)
//! failed (retries exhausted) -> failed_permanent
//! ```
//!
//! # Examples
//!
//! ```rust
//! use batchwork::clock::system_clock;
//! use batchwork::task::{InMemoryTaskStore, ItemResult, NewTask, TaskStateMachine, TaskStatus};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let machine = TaskStateMachine::new(Arc::new(InMemoryTaskStore::new()), system_clock());
//!
//! let task = machine
//!     .create_task(NewTask::new("posts", vec!["a".into(), "b".into()]))
//!     .await?;
//! let task = machine.start_task(task.id).await?;
//! let batch_id = task.batches[0].batch_id;
//!
//! machine.record_item_result(task.id, batch_id, ItemResult::completed("a")).await?;
//! let task = machine.record_item_result(task.id, batch_id, ItemResult::completed("b")).await?;
//!
//! assert_eq!(task.status, TaskStatus::Completed);
//! assert_eq!(task.progress(), 100.0);
//! # Ok(())
//! # }
//! ```

pub mod dispatch;
pub mod handler;
pub mod machine;
pub mod model;
pub mod store;
pub mod transition;

pub use dispatch::{
    BATCH_JOB_TYPE, BatchDispatcher, BatchJobPayload, JobQueueDispatcher, ManualDispatcher,
};
pub use handler::{GenerationBatchHandler, ItemProcessor};
pub use machine::{BulkAction, BulkActionReport, TaskStateMachine};
pub use model::{
    Batch, BatchId, BatchItem, BatchStats, BatchStatus, GenerationTask, ItemStatus, NewTask,
    TaskId, TaskStatus,
};
pub use store::{CasOutcome, InMemoryTaskStore, TaskFilter, TaskStore};
pub use transition::{Effect, ItemResult, TaskEvent, Transition, transition};
