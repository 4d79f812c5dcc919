//! Execution engines.
//!
//! An [`ExecutionEngine`] runs the executors of one task to completion.
//! [`ProcessEngine`] spawns each executor as a child process inside a
//! per-task directory, one after another, stopping at the first failure.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use taskgrid_state::{Executor, ExecutorLog, TaskId, TaskState, epoch_secs};

/// How an execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
    /// Every executor exited zero.
    Complete,
    /// An executor exited non-zero or was killed by a signal.
    Failed {
        executor: usize,
        exit_code: Option<i32>,
    },
    Canceled,
    /// The engine itself could not run the task.
    EngineError(String),
}

impl ExecOutcome {
    pub fn task_state(&self) -> TaskState {
        match self {
            ExecOutcome::Complete => TaskState::Complete,
            ExecOutcome::Failed { .. } => TaskState::Error,
            ExecOutcome::Canceled => TaskState::Canceled,
            ExecOutcome::EngineError(_) => TaskState::SystemError,
        }
    }
}

/// What the engine knows about a running or finished execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecMetadata {
    pub task_id: TaskId,
    pub started_at: u64,
    pub finished_at: Option<u64>,
    /// Index of the executor currently (or last) running.
    pub executor: usize,
    pub exit_codes: Vec<Option<i32>>,
    pub outcome: Option<ExecOutcome>,
}

#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Run every executor of the task. Resolves once the execution ends.
    async fn run(&self, task_id: &str, executors: &[Executor]) -> ExecOutcome;

    async fn inspect(&self, task_id: &str) -> Option<ExecMetadata>;

    /// Ask a running execution to stop. Unknown ids are ignored.
    async fn stop(&self, task_id: &str);

    /// Exit code and output tails of every executor started so far, at
    /// most `max_bytes` per stream.
    async fn logs(&self, _task_id: &str, _max_bytes: usize) -> Vec<ExecutorLog> {
        Vec::new()
    }
}

// ── Process engine ─────────────────────────────────────────────────

/// Finished executions kept around for `inspect` by default.
const DEFAULT_RETAINED: usize = 128;

struct Slot {
    meta: ExecMetadata,
    stop: Option<watch::Sender<bool>>,
}

#[derive(Default)]
struct Executions {
    slots: HashMap<TaskId, Slot>,
    /// Finished task ids, oldest first.
    finished: VecDeque<TaskId>,
}

pub struct ProcessEngine {
    work_dir: PathBuf,
    retained: usize,
    executions: Mutex<Executions>,
}

impl ProcessEngine {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            retained: DEFAULT_RETAINED,
            executions: Mutex::new(Executions::default()),
        }
    }

    /// Number of finished executions whose metadata stays inspectable.
    pub fn with_retained(mut self, retained: usize) -> Self {
        self.retained = retained;
        self
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    fn with_slot(&self, task_id: &str, f: impl FnOnce(&mut Slot)) {
        let mut executions = self.executions.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = executions.slots.get_mut(task_id) {
            f(slot);
        }
    }

    fn begin(&self, task_id: &str, stop: watch::Sender<bool>) {
        let mut executions = self.executions.lock().unwrap_or_else(PoisonError::into_inner);
        executions.finished.retain(|id| id != task_id);
        executions.slots.insert(
            task_id.to_string(),
            Slot {
                meta: ExecMetadata {
                    task_id: task_id.to_string(),
                    started_at: epoch_secs(),
                    finished_at: None,
                    executor: 0,
                    exit_codes: Vec::new(),
                    outcome: None,
                },
                stop: Some(stop),
            },
        );
    }

    /// Seal the slot and evict the oldest finished executions past the
    /// retention limit. Running slots are never evicted.
    fn finish(&self, task_id: &str, outcome: ExecOutcome) {
        let mut executions = self.executions.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(slot) = executions.slots.get_mut(task_id) else {
            return;
        };
        slot.meta.finished_at = Some(epoch_secs());
        slot.meta.outcome = Some(outcome);
        slot.stop = None;
        executions.finished.push_back(task_id.to_string());
        while executions.finished.len() > self.retained {
            if let Some(evicted) = executions.finished.pop_front() {
                executions.slots.remove(&evicted);
            }
        }
    }

    async fn run_all(
        &self,
        task_id: &str,
        executors: &[Executor],
        stop: &mut watch::Receiver<bool>,
    ) -> ExecOutcome {
        let task_dir = self.work_dir.join(task_id);
        if let Err(e) = std::fs::create_dir_all(&task_dir) {
            return ExecOutcome::EngineError(format!(
                "creating {}: {e}",
                task_dir.display()
            ));
        }

        for (index, executor) in executors.iter().enumerate() {
            self.with_slot(task_id, |slot| slot.meta.executor = index);
            let mut child = match spawn(&task_dir, index, executor) {
                Ok(child) => child,
                Err(message) => return ExecOutcome::EngineError(message),
            };
            debug!(%task_id, executor = index, pid = ?child.id(), "executor started");

            tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => {
                        self.with_slot(task_id, |slot| slot.meta.exit_codes.push(status.code()));
                        if !status.success() {
                            return ExecOutcome::Failed {
                                executor: index,
                                exit_code: status.code(),
                            };
                        }
                    }
                    Err(e) => {
                        return ExecOutcome::EngineError(format!("waiting on executor {index}: {e}"));
                    }
                },
                _ = stop.changed() => {
                    if let Err(e) = child.kill().await {
                        warn!(%task_id, executor = index, error = %e, "failed to kill executor");
                    }
                    return ExecOutcome::Canceled;
                }
            }
        }
        ExecOutcome::Complete
    }
}

fn spawn(task_dir: &Path, index: usize, executor: &Executor) -> Result<tokio::process::Child, String> {
    let Some((program, args)) = executor.command.split_first() else {
        return Err(format!("executor {index} has no command"));
    };

    let dir = match &executor.workdir {
        Some(workdir) => task_dir.join(workdir),
        None => task_dir.to_path_buf(),
    };
    std::fs::create_dir_all(&dir).map_err(|e| format!("creating {}: {e}", dir.display()))?;

    let stdout = File::create(task_dir.join(format!("executor-{index}.stdout")))
        .map_err(|e| format!("creating stdout log: {e}"))?;
    let stderr = File::create(task_dir.join(format!("executor-{index}.stderr")))
        .map_err(|e| format!("creating stderr log: {e}"))?;

    Command::new(program)
        .args(args)
        .envs(&executor.env)
        .current_dir(&dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("spawning {program}: {e}"))
}

/// Last `max_bytes` of a log file. Missing files read as empty.
fn read_tail(path: &Path, max_bytes: usize) -> String {
    let Ok(mut file) = File::open(path) else {
        return String::new();
    };
    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
    let start = len.saturating_sub(max_bytes as u64);
    let mut bytes = Vec::new();
    if let Err(e) = file
        .seek(SeekFrom::Start(start))
        .and_then(|_| file.read_to_end(&mut bytes))
    {
        debug!(path = %path.display(), error = %e, "reading log tail failed");
        return String::new();
    }
    // Drop a multi-byte character cut by the seek.
    let skip = bytes.iter().take_while(|b| (**b & 0xC0) == 0x80).count();
    String::from_utf8_lossy(&bytes[skip..]).into_owned()
}

/// Seals an execution's slot when `run` returns or its future is dropped.
struct RunGuard<'a> {
    engine: &'a ProcessEngine,
    task_id: &'a str,
    outcome: ExecOutcome,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let outcome = std::mem::replace(&mut self.outcome, ExecOutcome::Canceled);
        self.engine.finish(self.task_id, outcome);
    }
}

#[async_trait]
impl ExecutionEngine for ProcessEngine {
    async fn run(&self, task_id: &str, executors: &[Executor]) -> ExecOutcome {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        self.begin(task_id, stop_tx);
        let mut guard = RunGuard {
            engine: self,
            task_id,
            outcome: ExecOutcome::Canceled,
        };

        let outcome = self.run_all(task_id, executors, &mut stop_rx).await;
        guard.outcome = outcome.clone();
        drop(guard);
        info!(%task_id, ?outcome, "execution finished");
        outcome
    }

    async fn inspect(&self, task_id: &str) -> Option<ExecMetadata> {
        let executions = self.executions.lock().unwrap_or_else(PoisonError::into_inner);
        executions.slots.get(task_id).map(|slot| slot.meta.clone())
    }

    async fn stop(&self, task_id: &str) {
        self.with_slot(task_id, |slot| {
            if let Some(stop) = &slot.stop {
                stop.send_replace(true);
            }
        });
    }

    async fn logs(&self, task_id: &str, max_bytes: usize) -> Vec<ExecutorLog> {
        let Some(meta) = self.inspect(task_id).await else {
            return Vec::new();
        };
        let task_dir = self.work_dir.join(task_id);
        (0..=meta.executor)
            .map(|index| ExecutorLog {
                exit_code: meta.exit_codes.get(index).copied().flatten(),
                stdout: read_tail(&task_dir.join(format!("executor-{index}.stdout")), max_bytes),
                stderr: read_tail(&task_dir.join(format!("executor-{index}.stderr")), max_bytes),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn exec(argv: &[&str]) -> Executor {
        Executor {
            command: argv.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    async fn wait_for_slot(engine: &ProcessEngine, task_id: &str) {
        for _ in 0..50 {
            if engine.inspect(task_id).await.is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn executors_run_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ProcessEngine::new(dir.path());

        let outcome = engine
            .run(
                "t1",
                &[
                    exec(&["sh", "-c", "echo one > out"]),
                    exec(&["sh", "-c", "cat out; echo two >> out"]),
                ],
            )
            .await;
        assert_eq!(outcome, ExecOutcome::Complete);

        let written = std::fs::read_to_string(dir.path().join("t1/out")).unwrap();
        assert_eq!(written, "one\ntwo\n");
        let logged = std::fs::read_to_string(dir.path().join("t1/executor-1.stdout")).unwrap();
        assert_eq!(logged, "one\n");

        let meta = engine.inspect("t1").await.unwrap();
        assert_eq!(meta.exit_codes, vec![Some(0), Some(0)]);
        assert!(meta.finished_at.is_some());
        assert_eq!(meta.outcome, Some(ExecOutcome::Complete));
    }

    #[tokio::test]
    async fn first_failure_stops_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ProcessEngine::new(dir.path());

        let outcome = engine
            .run(
                "t1",
                &[
                    exec(&["sh", "-c", "exit 3"]),
                    exec(&["sh", "-c", "touch never"]),
                ],
            )
            .await;
        assert_eq!(
            outcome,
            ExecOutcome::Failed {
                executor: 0,
                exit_code: Some(3)
            }
        );
        assert_eq!(outcome.task_state(), TaskState::Error);
        assert!(!dir.path().join("t1/never").exists());
    }

    #[tokio::test]
    async fn env_and_workdir_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ProcessEngine::new(dir.path());
        let mut executor = exec(&["sh", "-c", "echo $GREETING > greeting"]);
        executor.env.insert("GREETING".into(), "hello".into());
        executor.workdir = Some("sub".into());

        assert_eq!(engine.run("t1", &[executor]).await, ExecOutcome::Complete);
        let written = std::fs::read_to_string(dir.path().join("t1/sub/greeting")).unwrap();
        assert_eq!(written, "hello\n");
    }

    #[tokio::test]
    async fn missing_program_is_a_system_error() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ProcessEngine::new(dir.path());

        let outcome = engine.run("t1", &[exec(&["/nonexistent/program"])]).await;
        assert!(matches!(outcome, ExecOutcome::EngineError(_)));
        assert_eq!(outcome.task_state(), TaskState::SystemError);

        let outcome = engine.run("t2", &[Executor::default()]).await;
        assert!(matches!(outcome, ExecOutcome::EngineError(_)));
    }

    #[tokio::test]
    async fn stop_kills_the_running_executor() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(ProcessEngine::new(dir.path()));

        let runner = engine.clone();
        let handle =
            tokio::spawn(async move { runner.run("t1", &[exec(&["sleep", "30"])]).await });

        wait_for_slot(&engine, "t1").await;
        engine.stop("t1").await;

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, ExecOutcome::Canceled);
    }

    #[tokio::test]
    async fn finished_executions_are_evicted_past_retention() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ProcessEngine::new(dir.path()).with_retained(4);

        for i in 0..20 {
            let id = format!("t{i}");
            assert_eq!(engine.run(&id, &[exec(&["true"])]).await, ExecOutcome::Complete);
        }

        {
            let executions = engine.executions.lock().unwrap();
            assert_eq!(executions.slots.len(), 4);
            assert_eq!(executions.finished.len(), 4);
        }
        assert!(engine.inspect("t0").await.is_none());
        assert!(engine.inspect("t19").await.is_some());
    }

    #[tokio::test]
    async fn rerun_of_same_task_is_retained_once() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ProcessEngine::new(dir.path()).with_retained(2);

        for _ in 0..3 {
            engine.run("t1", &[exec(&["true"])]).await;
        }
        engine.run("t2", &[exec(&["true"])]).await;

        assert!(engine.inspect("t1").await.is_some());
        assert_eq!(engine.executions.lock().unwrap().finished.len(), 2);
    }

    #[tokio::test]
    async fn dropped_run_is_sealed_as_canceled() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(ProcessEngine::new(dir.path()));

        let runner = engine.clone();
        let handle =
            tokio::spawn(async move { runner.run("t1", &[exec(&["sleep", "30"])]).await });
        wait_for_slot(&engine, "t1").await;
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());

        let meta = engine.inspect("t1").await.unwrap();
        assert_eq!(meta.outcome, Some(ExecOutcome::Canceled));
        assert!(meta.finished_at.is_some());
        assert!(engine.executions.lock().unwrap().slots["t1"].stop.is_none());
    }

    #[tokio::test]
    async fn logs_carry_exit_codes_and_output_tails() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ProcessEngine::new(dir.path());

        engine
            .run(
                "t1",
                &[
                    exec(&["sh", "-c", "echo first"]),
                    exec(&["sh", "-c", "echo 0123456789; echo oops >&2; exit 4"]),
                    exec(&["sh", "-c", "echo never"]),
                ],
            )
            .await;

        let logs = engine.logs("t1", 6).await;
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].exit_code, Some(0));
        assert_eq!(logs[0].stdout, "first\n");
        assert_eq!(logs[1].exit_code, Some(4));
        assert_eq!(logs[1].stdout, "56789\n");
        assert_eq!(logs[1].stderr, "oops\n");
    }

    #[tokio::test]
    async fn unknown_task_has_no_metadata() {
        let engine = ProcessEngine::new("unused");
        assert!(engine.inspect("nope").await.is_none());
        assert!(engine.logs("nope", 100).await.is_empty());
        engine.stop("nope").await;
    }
}
