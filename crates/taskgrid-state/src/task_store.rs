//! The storage contract the scheduler, backends and workers depend on.

use crate::error::StateResult;
use crate::types::{Task, TaskState, Worker, WorkerId};

/// Selection for [`TaskStore::list_tasks`].
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    /// Tasks in any of these states. Empty matches every state.
    pub states: Vec<TaskState>,
    /// Only tasks whose id sorts after this one.
    pub after: Option<String>,
    /// Zero means unlimited.
    pub limit: usize,
}

/// One page of the scheduling queue.
#[derive(Debug, Clone, Default)]
pub struct QueueChunk {
    /// Queued tasks in insertion order.
    pub tasks: Vec<Task>,
    /// Pass back to `read_queue` to continue after this chunk.
    pub cursor: Option<u64>,
}

/// Persistent task and worker state.
///
/// Every method is atomic. Implementations must serialize writers per task
/// id so that the state machine in [`crate::transition`] is never bypassed
/// by a concurrent update.
pub trait TaskStore: Send + Sync {
    // ── Tasks ──────────────────────────────────────────────────────

    /// Assign an id if empty, set state QUEUED and enqueue.
    fn create_task(&self, task: Task) -> StateResult<Task>;

    fn get_task(&self, id: &str) -> StateResult<Option<Task>>;

    /// Overwrite a task record. The state must match the stored state.
    fn put_task(&self, task: &Task) -> StateResult<()>;

    fn list_tasks(&self, filter: &TaskFilter) -> StateResult<Vec<Task>>;

    /// Move a task through the state machine.
    fn transition_task(&self, id: &str, target: TaskState) -> StateResult<Task>;

    /// Return a terminal task to the queue with a fresh attempt history.
    fn restart_task(&self, id: &str, max_restarts: u32) -> StateResult<Task>;

    /// Up to `n` queued tasks strictly after `cursor`, in insertion order.
    fn read_queue(&self, cursor: Option<u64>, n: usize) -> StateResult<QueueChunk>;

    /// The worker a task is currently assigned to.
    fn task_worker(&self, task_id: &str) -> StateResult<Option<WorkerId>>;

    // ── Workers ────────────────────────────────────────────────────

    /// Assign a task to a worker, creating the worker record from `worker`
    /// if none exists (template capacity). Returns the updated worker.
    fn assign_task(&self, task_id: &str, worker: &Worker) -> StateResult<Worker>;

    /// A worker with each assigned task's state refreshed from the task table.
    fn get_worker(&self, id: &str) -> StateResult<Option<Worker>>;

    fn list_workers(&self) -> StateResult<Vec<Worker>>;

    /// Merge a worker's heartbeat report. See [`crate::StateStore`] for the
    /// merge rules.
    fn update_worker(&self, report: &Worker) -> StateResult<Worker>;

    /// Upsert a worker record verbatim, skipping the heartbeat merge and the
    /// version check. Only for seeding records; live workers report through
    /// [`TaskStore::update_worker`].
    fn put_worker(&self, worker: &Worker) -> StateResult<()>;

    /// Remove a worker and release its task assignments. Returns true if it
    /// existed.
    fn delete_worker(&self, id: &str) -> StateResult<bool>;
}
