//! Concurrent task supervision inside a single VM.
//!
//! The supervisor runs every task of a prebuild event at once: one
//! dedicated SSH session and one log-sync loop per task. Output bytes flow
//! from the exec callbacks into a shared buffer (producer) and are drained
//! once a second into contiguous log chunks (consumer).
//!
//! On the first failure, cleanup starts exactly once: unfinished siblings
//! are marked cancelled in memory and every registered session is disposed,
//! which fails their in-flight execs. The failing task persists `ERROR`,
//! the casualties persist `CANCELLED`, and tasks that already succeeded are
//! left alone.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

use crate::db::{Store, VmTask, VmTaskStatus};
use crate::error::{composite, AgentError};
use crate::ssh::{ExecOpts, GuestSession};

use super::scripts;

/// Future resolving to a fresh guest session.
pub type SessionFuture =
    Pin<Box<dyn std::future::Future<Output = Result<Arc<dyn GuestSession>>> + Send>>;

/// Opens a new dedicated session into the VM under supervision.
pub type SessionFactory = Arc<dyn Fn() -> SessionFuture + Send + Sync>;

/// Per-task outcome, aligned with the input task order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskResult {
    Success,
    Error { error: String },
    Cancelled,
}

/// Shared cancellation bookkeeping for one supervisor run.
struct CancelState {
    /// One-shot: set by the first failure, never cleared.
    cleanup_started: bool,
    /// Every task session opened so far; disposed when cleanup starts.
    sessions: Vec<Arc<dyn GuestSession>>,
    /// All task ids of this run.
    all_ids: Vec<i64>,
    /// Tasks whose exec completed cleanly.
    finished: HashSet<i64>,
    /// Tasks marked cancelled when cleanup started.
    cancelled: HashSet<i64>,
}

/// Supervises the concurrent execution of one prebuild event's tasks.
pub struct TaskSupervisor {
    store: Store,
    flush_interval: Duration,
}

impl TaskSupervisor {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            flush_interval: Duration::from_secs(1),
        }
    }

    /// Override the log flush cadence. Tests use a short interval.
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Run all tasks concurrently and return their outcomes in input
    /// order. Task failures are reported in the result list, not raised;
    /// only supervisor-level faults (worker panics) surface as `Error`
    /// entries with no status persisted.
    pub async fn run_tasks(&self, tasks: &[VmTask], make_session: SessionFactory) -> Vec<TaskResult> {
        let state = Arc::new(Mutex::new(CancelState {
            cleanup_started: false,
            sessions: Vec::new(),
            all_ids: tasks.iter().map(|t| t.id).collect(),
            finished: HashSet::new(),
            cancelled: HashSet::new(),
        }));

        let mut handles = Vec::with_capacity(tasks.len());
        for task in tasks {
            let store = self.store.clone();
            let task = task.clone();
            let factory = Arc::clone(&make_session);
            let state = Arc::clone(&state);
            let flush_interval = self.flush_interval;

            handles.push(tokio::spawn(async move {
                run_one_task(store, task, factory, state, flush_interval).await
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(match handle.await {
                Ok(result) => result,
                Err(join_err) => TaskResult::Error {
                    error: format!("task worker panicked: {join_err}"),
                },
            });
        }
        results
    }
}

async fn run_one_task(
    store: Store,
    task: VmTask,
    factory: SessionFactory,
    state: Arc<Mutex<CancelState>>,
    flush_interval: Duration,
) -> TaskResult {
    match drive_task(&store, &task, factory, &state, flush_interval).await {
        Ok(()) => TaskResult::Success,
        Err(err) => conclude_failed_task(&store, &task, &state, err).await,
    }
}

async fn drive_task(
    store: &Store,
    task: &VmTask,
    factory: SessionFactory,
    state: &Arc<Mutex<CancelState>>,
    flush_interval: Duration,
) -> Result<()> {
    let session = factory().await.context("opening task SSH session")?;

    // Register for cancellation. A task that lost the race to an already
    // failed sibling never starts.
    {
        let mut guard = state.lock().await;
        if guard.cleanup_started {
            session.dispose();
            return Err(AgentError::SshDisposed.into());
        }
        guard.sessions.push(Arc::clone(&session));
    }

    let result = run_task_on_session(store, task, &session, state, flush_interval).await;
    session.dispose();
    result
}

async fn run_task_on_session(
    store: &Store,
    task: &VmTask,
    session: &Arc<dyn GuestSession>,
    state: &Arc<Mutex<CancelState>>,
    flush_interval: Duration,
) -> Result<()> {
    store
        .update_task_status(task.id, VmTaskStatus::Running)
        .context("persisting RUNNING status")?;

    let script_file = scripts::script_path(scripts::PREBUILD_TASK_DIR, task.idx);
    let log_file = scripts::log_path(scripts::PREBUILD_TASK_DIR, task.idx);

    session
        .exec(
            &format!("mkdir -p \"{}\"", scripts::PREBUILD_TASK_DIR),
            ExecOpts::default(),
        )
        .await?;
    session
        .write_file(
            &script_file,
            scripts::task_script(&task.command).into_bytes(),
            0o755,
        )
        .await?;

    debug!(task_id = task.id, idx = task.idx, "Starting task exec");

    // Producer/consumer pair: exec callbacks append to the buffer, the
    // sync loop swaps it out and persists a chunk per tick.
    let buffer: Arc<StdMutex<Vec<u8>>> = Arc::new(StdMutex::new(Vec::new()));
    let (done_tx, done_rx) = watch::channel(false);

    let sync_session = Arc::clone(session);
    let sync_store = store.clone();
    let sync_state = Arc::clone(state);
    let sync_buffer = Arc::clone(&buffer);
    let log_group_id = task.log_group_id;
    let sync_handle = tokio::spawn(async move {
        let res = log_sync_loop(
            &sync_store,
            log_group_id,
            &sync_buffer,
            &sync_state,
            done_rx,
            flush_interval,
        )
        .await;
        if res.is_err() {
            // An exec must not outlive its log sync.
            sync_session.dispose();
        }
        res
    });

    let stdout_buffer = Arc::clone(&buffer);
    let stderr_buffer = Arc::clone(&buffer);
    let opts = ExecOpts {
        cwd: Some(scripts::REPO_DIR.to_string()),
        on_stdout: Some(Box::new(move |chunk| {
            if let Ok(mut guard) = stdout_buffer.lock() {
                guard.extend_from_slice(chunk);
            }
        })),
        on_stderr: Some(Box::new(move |chunk| {
            if let Ok(mut guard) = stderr_buffer.lock() {
                guard.extend_from_slice(chunk);
            }
        })),
        ..Default::default()
    };

    let exec_result = session
        .exec(&scripts::foreground_invocation(&script_file, &log_file), opts)
        .await;
    let _ = done_tx.send(true);

    let sync_result = match sync_handle.await {
        Ok(res) => res,
        Err(join_err) => Err(anyhow!("log sync task panicked: {join_err}")),
    };

    // The exec failure is the interesting cause when both fail.
    exec_result?;
    sync_result?;

    {
        let mut guard = state.lock().await;
        let st = &mut *guard;
        st.finished.insert(task.id);
        st.cancelled.remove(&task.id);
    }

    store
        .update_task_status(task.id, VmTaskStatus::Success)
        .context("persisting SUCCESS status")?;

    debug!(task_id = task.id, "Task succeeded");
    Ok(())
}

/// Drain the buffer into log chunks until the exec reports done; abort if
/// cleanup started so the paired exec gets disposed.
async fn log_sync_loop(
    store: &Store,
    log_group_id: i64,
    buffer: &StdMutex<Vec<u8>>,
    state: &Mutex<CancelState>,
    mut done_rx: watch::Receiver<bool>,
    interval: Duration,
) -> Result<()> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = done_rx.changed() => {
                flush_pending(store, log_group_id, buffer)?;
                return Ok(());
            }
            _ = ticker.tick() => {
                flush_pending(store, log_group_id, buffer)?;
                if state.lock().await.cleanup_started {
                    anyhow::bail!("log sync aborted: a sibling task failed");
                }
            }
        }
    }
}

fn flush_pending(store: &Store, log_group_id: i64, buffer: &StdMutex<Vec<u8>>) -> Result<()> {
    let pending = {
        let mut guard = buffer
            .lock()
            .map_err(|_| anyhow!("log buffer mutex poisoned"))?;
        std::mem::take(&mut *guard)
    };

    if pending.is_empty() {
        return Ok(());
    }

    store
        .append_log_chunk(log_group_id, &pending)
        .context("persisting log chunk")?;
    Ok(())
}

/// How a failed task relates to the cleanup protocol.
enum FailureClass {
    /// First failure of the run; triggers cleanup.
    RootCause,
    /// Marked cancelled when the root cause snapshotted unfinished tasks.
    Casualty,
    /// Finished before the snapshot, then failed to persist its status.
    LateFault,
}

/// Classify a failed task and persist its terminal status. The first
/// failure wins the root-cause designation and triggers cleanup; tasks
/// snapshotted as unfinished at that moment are its casualties.
async fn conclude_failed_task(
    store: &Store,
    task: &VmTask,
    state: &Arc<Mutex<CancelState>>,
    err: anyhow::Error,
) -> TaskResult {
    let mut to_dispose: Vec<Arc<dyn GuestSession>> = Vec::new();

    let class = {
        let mut guard = state.lock().await;
        let st = &mut *guard;
        if !st.cleanup_started {
            st.cleanup_started = true;
            for id in &st.all_ids {
                if *id != task.id && !st.finished.contains(id) {
                    st.cancelled.insert(*id);
                }
            }
            to_dispose = st.sessions.clone();
            FailureClass::RootCause
        } else if st.cancelled.contains(&task.id) {
            FailureClass::Casualty
        } else {
            FailureClass::LateFault
        }
    };

    match class {
        FailureClass::RootCause => {
            info!(
                task_id = task.id,
                error = %err,
                "Task failed; cancelling unfinished siblings"
            );
            for session in &to_dispose {
                session.dispose();
            }

            match store.update_task_status(task.id, VmTaskStatus::Error) {
                Ok(()) => TaskResult::Error {
                    error: format!("{err:#}"),
                },
                Err(status_err) => {
                    let joint = composite(vec![err, status_err.into()]);
                    TaskResult::Error {
                        error: format!("{joint:#}"),
                    }
                }
            }
        }
        FailureClass::Casualty => match store.update_task_status(task.id, VmTaskStatus::Cancelled)
        {
            Ok(()) => TaskResult::Cancelled,
            Err(status_err) => {
                let joint = composite(vec![err, status_err.into()]);
                TaskResult::Error {
                    error: format!("{joint:#}"),
                }
            }
        },
        // The task's command completed; only the status write failed. It
        // must not be relabelled CANCELLED, and the write is not retried.
        FailureClass::LateFault => TaskResult::Error {
            error: format!("{err:#}"),
        },
    }
}

/// Launch tasks detached, as workspaces do: each shell backgrounds itself
/// and prints its PID, which is validated and collected.
pub async fn launch_background_tasks(
    session: &dyn GuestSession,
    commands: &[String],
) -> Result<Vec<u32>> {
    session
        .exec(
            &format!("mkdir -p \"{}\"", scripts::WORKSPACE_TASK_DIR),
            ExecOpts::default(),
        )
        .await?;

    let mut pids = Vec::with_capacity(commands.len());
    for (idx, command) in commands.iter().enumerate() {
        let idx = idx as i64;
        let script_file = scripts::script_path(scripts::WORKSPACE_TASK_DIR, idx);
        let log_file = scripts::log_path(scripts::WORKSPACE_TASK_DIR, idx);

        session
            .write_file(&script_file, scripts::task_script(command).into_bytes(), 0o755)
            .await?;

        let output = session
            .exec(
                &scripts::background_invocation(&script_file, &log_file),
                ExecOpts {
                    cwd: Some(scripts::REPO_DIR.to_string()),
                    ..Default::default()
                },
            )
            .await?;

        let printed = output.stdout_trimmed();
        let pid: u32 = printed.parse().map_err(|_| {
            AgentError::ValidationFailed(format!(
                "task {idx} launch printed {printed:?} instead of a PID"
            ))
        })?;
        if pid == 0 {
            return Err(
                AgentError::ValidationFailed(format!("task {idx} launch printed PID 0")).into(),
            );
        }

        debug!(idx, pid, "Background task launched");
        pids.push(pid);
    }

    Ok(pids)
}
