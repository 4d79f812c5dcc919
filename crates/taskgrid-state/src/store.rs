//! StateStore — redb-backed persistence for TaskGrid.
//!
//! Implements [`TaskStore`] over the tables in [`crate::tables`]. Each
//! operation opens one transaction; mutating operations open every table
//! they touch through [`WriteTables`] so that a task, its queue entry, its
//! assignment and its worker are always updated together.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, Table, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::task_store::{QueueChunk, TaskFilter, TaskStore};
use crate::transition::{Transition, transition};
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        WriteTables::open(&txn)?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Cancel a task. Shorthand for a transition to CANCELED.
    pub fn cancel_task(&self, id: &str) -> StateResult<Task> {
        self.transition_task(id, TaskState::Canceled)
    }
}

// ── Table helpers ──────────────────────────────────────────────────

fn read_record<T, R>(table: &R, key: &str) -> StateResult<Option<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let Some(guard) = table.get(key).map_err(map_err!(Read))? else {
        return Ok(None);
    };
    let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
    Ok(Some(value))
}

fn read_assignment<R>(table: &R, task_id: &str) -> StateResult<Option<WorkerId>>
where
    R: ReadableTable<&'static str, &'static str>,
{
    Ok(table
        .get(task_id)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value().to_string()))
}

/// Replace each assigned task's state (and executors) with the task table's.
fn refresh_assignments<R>(tasks: &R, worker: &mut Worker) -> StateResult<()>
where
    R: ReadableTable<&'static str, &'static [u8]>,
{
    for (task_id, assigned) in worker.tasks.iter_mut() {
        if let Some(task) = read_record::<Task, _>(tasks, task_id)? {
            assigned.state = task.state;
            assigned.executors = task.executors;
        }
    }
    Ok(())
}

/// Every table a mutating operation may touch, opened once per transaction.
struct WriteTables<'txn> {
    tasks: Table<'txn, &'static str, &'static [u8]>,
    queue: Table<'txn, u64, &'static str>,
    queue_index: Table<'txn, &'static str, u64>,
    task_workers: Table<'txn, &'static str, &'static str>,
    workers: Table<'txn, &'static str, &'static [u8]>,
    meta: Table<'txn, &'static str, u64>,
}

impl<'txn> WriteTables<'txn> {
    fn open(txn: &'txn WriteTransaction) -> StateResult<Self> {
        Ok(Self {
            tasks: txn.open_table(TASKS).map_err(map_err!(Table))?,
            queue: txn.open_table(QUEUE).map_err(map_err!(Table))?,
            queue_index: txn.open_table(QUEUE_INDEX).map_err(map_err!(Table))?,
            task_workers: txn.open_table(TASK_WORKERS).map_err(map_err!(Table))?,
            workers: txn.open_table(WORKERS).map_err(map_err!(Table))?,
            meta: txn.open_table(META).map_err(map_err!(Table))?,
        })
    }

    fn load_task(&self, id: &str) -> StateResult<Option<Task>> {
        read_record(&self.tasks, id)
    }

    fn require_task(&self, id: &str) -> StateResult<Task> {
        self.load_task(id)?
            .ok_or_else(|| StateError::NotFound(format!("task {id}")))
    }

    fn save_task(&mut self, task: &Task) -> StateResult<()> {
        write_record(&mut self.tasks, &task.id, task)
    }

    fn load_worker(&self, id: &str) -> StateResult<Option<Worker>> {
        read_record(&self.workers, id)
    }

    fn save_worker(&mut self, worker: &Worker) -> StateResult<()> {
        write_record(&mut self.workers, &worker.id, worker)
    }

    fn assignment(&self, task_id: &str) -> StateResult<Option<WorkerId>> {
        read_assignment(&self.task_workers, task_id)
    }

    /// Drop the task→worker entry if it still points at `worker_id`.
    fn release(&mut self, task_id: &str, worker_id: &str) -> StateResult<()> {
        if self.assignment(task_id)?.as_deref() == Some(worker_id) {
            self.task_workers
                .remove(task_id)
                .map_err(map_err!(Write))?;
        }
        Ok(())
    }

    /// Append a task to the tail of the queue.
    fn enqueue(&mut self, task_id: &str) -> StateResult<u64> {
        let last = self
            .meta
            .get(QUEUE_SEQ_KEY)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value())
            .unwrap_or(0);
        let seq = last + 1;
        self.meta
            .insert(QUEUE_SEQ_KEY, seq)
            .map_err(map_err!(Write))?;
        self.queue.insert(seq, task_id).map_err(map_err!(Write))?;
        self.queue_index
            .insert(task_id, seq)
            .map_err(map_err!(Write))?;
        Ok(seq)
    }

    /// Remove a task's queue entry. Absent entries are ignored.
    fn dequeue(&mut self, task_id: &str) -> StateResult<()> {
        let seq = self
            .queue_index
            .remove(task_id)
            .map_err(map_err!(Write))?
            .map(|guard| guard.value());
        if let Some(seq) = seq {
            self.queue.remove(seq).map_err(map_err!(Write))?;
        }
        Ok(())
    }

    /// Apply a state-machine decision to a loaded task.
    fn apply(&mut self, task: &mut Task, decision: Transition, now: u64) -> StateResult<bool> {
        let Transition::Apply(target) = decision else {
            return Ok(false);
        };
        task.state = target;
        self.dequeue(&task.id)?;
        if target.is_terminal() {
            task.close_log(target, now);
        } else if let Some(log) = task.logs.last_mut() {
            log.state = target;
        }
        Ok(true)
    }
}

fn write_record<T: Serialize>(
    table: &mut Table<'_, &'static str, &'static [u8]>,
    key: &str,
    value: &T,
) -> StateResult<()> {
    let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
    table
        .insert(key, bytes.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

/// Fold a heartbeat report into the stored record (resources, metadata,
/// zone, ports, state). Task states are handled separately.
fn merge_report(worker: &mut Worker, report: &Worker) {
    if report.resources.cpu_cores != 0 {
        worker.resources.cpu_cores = report.resources.cpu_cores;
    }
    if report.resources.ram_gb != 0.0 {
        worker.resources.ram_gb = report.resources.ram_gb;
    }
    if report.resources.disk_gb != 0.0 {
        worker.resources.disk_gb = report.resources.disk_gb;
    }
    for (key, value) in &report.metadata {
        worker.metadata.insert(key.clone(), value.clone());
    }
    // A real worker has checked in; the record is no longer a template.
    worker.metadata.remove(TEMPLATE_KEY);
    if report.zone.is_some() {
        worker.zone = report.zone.clone();
    }
    worker.active_ports = report.active_ports.clone();
    worker.state = match report.state {
        WorkerState::Uninitialized => WorkerState::Alive,
        reported => reported,
    };
}

/// Replace the worker's latest output on the task's most recent log entry,
/// trimmed to [`MAX_EXECUTOR_LOG_SIZE`] per stream. Returns whether
/// anything changed.
fn record_executor_logs(task: &mut Task, worker_id: &str, reported: &[ExecutorLog]) -> bool {
    if reported.is_empty() {
        return false;
    }
    let Some(log) = task.logs.last_mut().filter(|log| log.worker_id == worker_id) else {
        return false;
    };
    let trimmed: Vec<ExecutorLog> = reported
        .iter()
        .cloned()
        .map(|mut entry| {
            entry.truncate_to_tail(MAX_EXECUTOR_LOG_SIZE);
            entry
        })
        .collect();
    if log.executor_logs == trimmed {
        return false;
    }
    log.executor_logs = trimmed;
    true
}

// ── TaskStore ──────────────────────────────────────────────────────

impl TaskStore for StateStore {
    fn create_task(&self, mut task: Task) -> StateResult<Task> {
        if task.id.is_empty() {
            task.id = Ulid::new().to_string();
        }
        task.state = TaskState::Queued;
        task.logs.clear();
        task.created_at = epoch_secs();

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let seq = {
            let mut t = WriteTables::open(&txn)?;
            if t.load_task(&task.id)?.is_some() {
                return Err(StateError::Write(format!("task {} already exists", task.id)));
            }
            t.save_task(&task)?;
            t.enqueue(&task.id)?
        };
        txn.commit().map_err(map_err!(Transaction))?;
        info!(task_id = %task.id, name = %task.name, seq, "task created");
        Ok(task)
    }

    fn get_task(&self, id: &str) -> StateResult<Option<Task>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TASKS).map_err(map_err!(Table))?;
        read_record(&table, id)
    }

    fn put_task(&self, task: &Task) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = WriteTables::open(&txn)?;
            let stored = t.require_task(&task.id)?;
            if stored.state != task.state {
                return Err(StateError::StateChangeRejected {
                    task_id: task.id.clone(),
                });
            }
            t.save_task(task)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(task_id = %task.id, "task stored");
        Ok(())
    }

    fn list_tasks(&self, filter: &TaskFilter) -> StateResult<Vec<Task>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TASKS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if let Some(after) = filter.after.as_deref() {
                if key.value() <= after {
                    continue;
                }
            }
            let task: Task =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if !filter.states.is_empty() && !filter.states.contains(&task.state) {
                continue;
            }
            results.push(task);
            if filter.limit != 0 && results.len() >= filter.limit {
                break;
            }
        }
        Ok(results)
    }

    fn transition_task(&self, id: &str, target: TaskState) -> StateResult<Task> {
        let now = epoch_secs();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let (task, changed) = {
            let mut t = WriteTables::open(&txn)?;
            let mut task = t.require_task(id)?;
            let decision = transition(task.state, target)?;
            let changed = t.apply(&mut task, decision, now)?;
            if changed {
                t.save_task(&task)?;
            }
            (task, changed)
        };
        txn.commit().map_err(map_err!(Transaction))?;
        if changed {
            info!(task_id = %id, state = %task.state, "task transitioned");
        }
        Ok(task)
    }

    fn restart_task(&self, id: &str, max_restarts: u32) -> StateResult<Task> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let task = {
            let mut t = WriteTables::open(&txn)?;
            let mut task = t.require_task(id)?;
            if !task.state.is_terminal() {
                return Err(StateError::NotRestartable {
                    task_id: id.to_string(),
                    state: task.state,
                });
            }
            if task.restarts >= max_restarts {
                return Err(StateError::MaxRestartsReached {
                    task_id: id.to_string(),
                    restarts: task.restarts,
                });
            }

            if let Some(worker_id) = t.assignment(id)? {
                t.release(id, &worker_id)?;
                if let Some(mut worker) = t.load_worker(&worker_id)? {
                    worker.tasks.remove(id);
                    worker.recompute_available();
                    worker.version += 1;
                    t.save_worker(&worker)?;
                }
            }

            task.logs.clear();
            task.restarts += 1;
            task.state = TaskState::Queued;
            t.dequeue(id)?;
            t.enqueue(id)?;
            t.save_task(&task)?;
            task
        };
        txn.commit().map_err(map_err!(Transaction))?;
        info!(task_id = %id, restarts = task.restarts, "task restarted");
        Ok(task)
    }

    fn read_queue(&self, cursor: Option<u64>, n: usize) -> StateResult<QueueChunk> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let queue = txn.open_table(QUEUE).map_err(map_err!(Table))?;
        let tasks = txn.open_table(TASKS).map_err(map_err!(Table))?;

        let start = cursor.map(|c| c.saturating_add(1)).unwrap_or(0);
        let mut chunk = QueueChunk::default();
        if n == 0 {
            chunk.cursor = cursor;
            return Ok(chunk);
        }
        for entry in queue.range(start..).map_err(map_err!(Read))? {
            let (seq, task_id) = entry.map_err(map_err!(Read))?;
            let seq = seq.value();
            let task_id = task_id.value().to_string();
            chunk.cursor = Some(seq);
            match read_record::<Task, _>(&tasks, &task_id)? {
                Some(task) => chunk.tasks.push(task),
                None => warn!(%task_id, seq, "queue entry without task record"),
            }
            if chunk.tasks.len() >= n {
                break;
            }
        }
        if chunk.cursor.is_none() {
            chunk.cursor = cursor;
        }
        Ok(chunk)
    }

    fn task_worker(&self, task_id: &str) -> StateResult<Option<WorkerId>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TASK_WORKERS).map_err(map_err!(Table))?;
        read_assignment(&table, task_id)
    }

    fn assign_task(&self, task_id: &str, offered: &Worker) -> StateResult<Worker> {
        let now = epoch_secs();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let worker = {
            let mut t = WriteTables::open(&txn)?;
            let mut task = t.require_task(task_id)?;
            if let Some(worker_id) = t.assignment(task_id)? {
                return Err(StateError::AlreadyAssigned {
                    task_id: task_id.to_string(),
                    worker_id,
                });
            }
            let decision = transition(task.state, TaskState::Initializing)?;

            let mut worker = match t.load_worker(&offered.id)? {
                Some(stored) => {
                    if stored.version != 0
                        && offered.version != 0
                        && stored.version != offered.version
                    {
                        return Err(StateError::VersionConflict {
                            worker_id: stored.id,
                            stored: stored.version,
                            submitted: offered.version,
                        });
                    }
                    stored
                }
                None => {
                    // Template capacity: the record comes into existence now.
                    let mut created = offered.clone();
                    created.tasks.clear();
                    if created.state == WorkerState::Uninitialized {
                        created.state = WorkerState::Initializing;
                    }
                    if created.last_heartbeat == 0 {
                        created.last_heartbeat = now;
                    }
                    created
                }
            };

            t.apply(&mut task, decision, now)?;
            t.dequeue(task_id)?;
            task.logs.push(TaskLog {
                worker_id: worker.id.clone(),
                started_at: now,
                ended_at: None,
                state: task.state,
                executor_logs: Vec::new(),
            });

            worker.tasks.insert(
                task_id.to_string(),
                AssignedTask {
                    state: task.state,
                    resources: task.resources.request(),
                    executors: task.executors.clone(),
                    ..Default::default()
                },
            );
            worker.recompute_available();
            worker.version += 1;

            t.save_task(&task)?;
            t.save_worker(&worker)?;
            t.task_workers
                .insert(task_id, worker.id.as_str())
                .map_err(map_err!(Write))?;
            worker
        };
        txn.commit().map_err(map_err!(Transaction))?;
        info!(%task_id, worker_id = %worker.id, version = worker.version, "task assigned");
        Ok(worker)
    }

    fn get_worker(&self, id: &str) -> StateResult<Option<Worker>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let workers = txn.open_table(WORKERS).map_err(map_err!(Table))?;
        let tasks = txn.open_table(TASKS).map_err(map_err!(Table))?;
        let Some(mut worker) = read_record::<Worker, _>(&workers, id)? else {
            return Ok(None);
        };
        refresh_assignments(&tasks, &mut worker)?;
        Ok(Some(worker))
    }

    fn list_workers(&self) -> StateResult<Vec<Worker>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let workers = txn.open_table(WORKERS).map_err(map_err!(Table))?;
        let tasks = txn.open_table(TASKS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in workers.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let mut worker: Worker =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            refresh_assignments(&tasks, &mut worker)?;
            results.push(worker);
        }
        Ok(results)
    }

    /// Merge a heartbeat:
    ///
    /// - versions must agree when both are non-zero;
    /// - non-zero resources overwrite, metadata merges key by key;
    /// - each reported task state goes through the state machine, and a
    ///   rejected transition leaves the server's state in place;
    /// - tasks the worker reports terminal, and terminal tasks it no longer
    ///   reports, are released from the worker;
    /// - `available` is recomputed, `version` bumped, `last_heartbeat` set.
    fn update_worker(&self, report: &Worker) -> StateResult<Worker> {
        let now = epoch_secs();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let worker = {
            let mut t = WriteTables::open(&txn)?;
            let mut worker = match t.load_worker(&report.id)? {
                Some(stored) => {
                    if stored.version != 0
                        && report.version != 0
                        && stored.version != report.version
                    {
                        return Err(StateError::VersionConflict {
                            worker_id: stored.id,
                            stored: stored.version,
                            submitted: report.version,
                        });
                    }
                    stored
                }
                None => {
                    debug!(worker_id = %report.id, "registering worker on first heartbeat");
                    Worker {
                        id: report.id.clone(),
                        ..Default::default()
                    }
                }
            };
            merge_report(&mut worker, report);

            let assigned: Vec<TaskId> = worker.tasks.keys().cloned().collect();
            for task_id in assigned {
                let Some(mut task) = t.load_task(&task_id)? else {
                    warn!(worker_id = %worker.id, %task_id, "assigned task no longer exists");
                    worker.tasks.remove(&task_id);
                    t.release(&task_id, &report.id)?;
                    continue;
                };

                let mut changed = false;
                let reported = report.tasks.get(&task_id).map(|r| r.state);
                if let Some(reported) = reported {
                    match transition(task.state, reported) {
                        Ok(decision) => changed = t.apply(&mut task, decision, now)?,
                        Err(error) => warn!(
                            worker_id = %worker.id,
                            %task_id,
                            stored = %task.state,
                            %reported,
                            %error,
                            "rejected task state from worker"
                        ),
                    }
                }

                if let Some(logs) = report.tasks.get(&task_id).map(|r| &r.logs) {
                    changed |= record_executor_logs(&mut task, &report.id, logs);
                }

                let finished = match reported {
                    Some(state) => state.is_terminal(),
                    None => task.state.is_terminal(),
                };
                if finished {
                    worker.tasks.remove(&task_id);
                    t.release(&task_id, &report.id)?;
                    let open = task.logs.last().is_some_and(|log| log.ended_at.is_none());
                    if open {
                        task.close_log(task.state, now);
                        changed = true;
                    }
                } else if let Some(assigned) = worker.tasks.get_mut(&task_id) {
                    assigned.state = task.state;
                }

                if changed {
                    t.save_task(&task)?;
                }
            }

            for task_id in report.tasks.keys() {
                if !worker.tasks.contains_key(task_id) && t.assignment(task_id)?.is_none() {
                    debug!(worker_id = %worker.id, %task_id, "ignoring report for unassigned task");
                }
            }

            worker.recompute_available();
            worker.last_heartbeat = now;
            worker.version += 1;
            t.save_worker(&worker)?;
            worker
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(worker_id = %worker.id, version = worker.version, "worker updated");
        Ok(worker)
    }

    fn put_worker(&self, worker: &Worker) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = WriteTables::open(&txn)?;
            t.save_worker(worker)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(worker_id = %worker.id, "worker stored");
        Ok(())
    }

    fn delete_worker(&self, id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed = {
            let mut t = WriteTables::open(&txn)?;
            match t.load_worker(id)? {
                Some(worker) => {
                    for task_id in worker.tasks.keys() {
                        t.release(task_id, id)?;
                    }
                    t.workers.remove(id).map_err(map_err!(Write))?;
                    true
                }
                None => false,
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(worker_id = %id, existed, "worker deleted");
        Ok(existed)
    }
}
