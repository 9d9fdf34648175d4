//! Integration tests for the prebuild task supervisor.
//!
//! These run the real supervisor against a scripted guest session that
//! interprets a small subset of shell: `echo`, `exit`, `sleep`, plus
//! `touch`/`waitfor` as cross-task ordering primitives.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use prebuild_agent::db::{Store, VmTaskStatus};
use prebuild_agent::error::AgentError;
use prebuild_agent::ssh::{ExecOpts, ExecOutput, GuestSession};
use prebuild_agent::tasks::{SessionFactory, TaskResult, TaskSupervisor};

/// Shared state of one mock VM: the files written into it.
#[derive(Default)]
struct MockGuest {
    files: Mutex<HashMap<String, Vec<u8>>>,
}

impl MockGuest {
    fn has_file(&self, path: &str) -> bool {
        self.files.lock().unwrap().contains_key(path)
    }

    fn script_for_command(&self, command: &str) -> Option<String> {
        let files = self.files.lock().unwrap();
        files
            .iter()
            .find(|(path, _)| command.contains(path.as_str()))
            .map(|(_, content)| String::from_utf8_lossy(content).into_owned())
    }
}

/// One SSH session into the mock guest. Disposal flips a flag that any
/// in-flight `sleep`/`waitfor` observes.
struct MockSession {
    guest: Arc<MockGuest>,
    disposed: AtomicBool,
}

impl MockSession {
    fn new(guest: Arc<MockGuest>) -> Self {
        Self {
            guest,
            disposed: AtomicBool::new(false),
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    async fn run_statement(&self, statement: &str, opts: &mut ExecOpts) -> Result<Option<i32>> {
        if let Some(rest) = statement.strip_prefix("echo ") {
            let mut bytes = rest.as_bytes().to_vec();
            bytes.push(b'\n');
            if let Some(sink) = opts.on_stdout.as_mut() {
                sink(&bytes);
            }
        } else if let Some(path) = statement.strip_prefix("touch ") {
            self.guest
                .files
                .lock()
                .unwrap()
                .insert(path.to_string(), Vec::new());
        } else if let Some(path) = statement.strip_prefix("waitfor ") {
            while !self.guest.has_file(path) {
                if self.is_disposed() {
                    return Err(AgentError::SshDisposed.into());
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        } else if let Some(ms) = statement.strip_prefix("sleepms ") {
            tokio::time::sleep(Duration::from_millis(ms.parse().unwrap())).await;
        } else if statement.starts_with("sleep ") {
            // Sleeps only end by cancellation.
            while !self.is_disposed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            return Err(AgentError::SshDisposed.into());
        } else if let Some(code) = statement.strip_prefix("exit ") {
            return Ok(Some(code.parse().unwrap()));
        }
        Ok(None)
    }
}

#[async_trait]
impl GuestSession for MockSession {
    async fn exec(&self, command: &str, mut opts: ExecOpts) -> Result<ExecOutput> {
        if self.is_disposed() {
            return Err(AgentError::SshDisposed.into());
        }

        if command.starts_with("mkdir -p") {
            return Ok(ExecOutput {
                code: 0,
                stdout: Vec::new(),
                stderr: Vec::new(),
            });
        }

        let script = self
            .guest
            .script_for_command(command)
            .ok_or_else(|| anyhow::anyhow!("mock guest: no script matches {command:?}"))?;

        for line in script.lines() {
            for statement in line.split(';').map(str::trim) {
                if self.is_disposed() {
                    return Err(AgentError::SshDisposed.into());
                }
                if let Some(code) = self.run_statement(statement, &mut opts).await? {
                    if code != 0 && !opts.allow_non_zero_exit_code {
                        return Err(AgentError::SshExecFailed {
                            code,
                            stderr: String::new(),
                        }
                        .into());
                    }
                    return Ok(ExecOutput {
                        code,
                        stdout: Vec::new(),
                        stderr: Vec::new(),
                    });
                }
            }
        }

        Ok(ExecOutput {
            code: 0,
            stdout: Vec::new(),
            stderr: Vec::new(),
        })
    }

    async fn write_file(&self, path: &str, content: Vec<u8>, _mode: i32) -> Result<()> {
        if self.is_disposed() {
            return Err(AgentError::SshDisposed.into());
        }
        self.guest
            .files
            .lock()
            .unwrap()
            .insert(path.to_string(), content);
        Ok(())
    }

    async fn put_directory(&self, _local_dir: std::path::PathBuf, _remote_dir: String) -> Result<()> {
        anyhow::bail!("mock guest: put_directory is not scripted")
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }
}

fn mock_factory(guest: &Arc<MockGuest>) -> SessionFactory {
    let guest = Arc::clone(guest);
    Arc::new(move || {
        let guest = Arc::clone(&guest);
        Box::pin(async move { Ok(Arc::new(MockSession::new(guest)) as Arc<dyn GuestSession>) })
    })
}

fn test_supervisor(store: &Store) -> TaskSupervisor {
    TaskSupervisor::new(store.clone()).with_flush_interval(Duration::from_millis(10))
}

fn group_bytes(store: &Store, log_group_id: i64) -> Vec<u8> {
    store.log_chunks(log_group_id).unwrap().concat()
}

#[tokio::test]
async fn test_happy_path_two_tasks() {
    let store = Store::open_in_memory().unwrap();
    let event = store.create_prebuild_event(&["echo A", "echo B"]).unwrap();
    let guest = Arc::new(MockGuest::default());

    let results = test_supervisor(&store)
        .run_tasks(&event.tasks, mock_factory(&guest))
        .await;

    assert_eq!(results, vec![TaskResult::Success, TaskResult::Success]);

    for task in &event.tasks {
        assert_eq!(
            store.get_task(task.id).unwrap().status,
            VmTaskStatus::Success
        );
    }

    assert_eq!(group_bytes(&store, event.tasks[0].log_group_id), b"A\n");
    assert_eq!(group_bytes(&store, event.tasks[1].log_group_id), b"B\n");
}

#[tokio::test]
async fn test_first_failure_cancels_unfinished_siblings() {
    let store = Store::open_in_memory().unwrap();
    let event = store
        .create_prebuild_event(&["sleep 10; echo A", "exit 1"])
        .unwrap();
    let guest = Arc::new(MockGuest::default());

    let results = test_supervisor(&store)
        .run_tasks(&event.tasks, mock_factory(&guest))
        .await;

    assert_eq!(results[0], TaskResult::Cancelled);
    match &results[1] {
        TaskResult::Error { error } => assert!(
            error.contains("exited with code 1"),
            "unexpected error: {error}"
        ),
        other => panic!("expected error outcome, got {other:?}"),
    }

    assert_eq!(
        store.get_task(event.tasks[0].id).unwrap().status,
        VmTaskStatus::Cancelled
    );
    assert_eq!(
        store.get_task(event.tasks[1].id).unwrap().status,
        VmTaskStatus::Error
    );
}

#[tokio::test]
async fn test_completed_tasks_survive_late_failure() {
    let store = Store::open_in_memory().unwrap();
    // Task 1 fails only after task 0 finished; task 2 never finishes.
    let event = store
        .create_prebuild_event(&[
            "echo A; touch /signal/a-done",
            "waitfor /signal/a-done; exit 7",
            "sleep 30",
        ])
        .unwrap();
    let guest = Arc::new(MockGuest::default());

    let results = test_supervisor(&store)
        .run_tasks(&event.tasks, mock_factory(&guest))
        .await;

    assert_eq!(results[0], TaskResult::Success);
    assert!(matches!(results[1], TaskResult::Error { .. }));
    assert_eq!(results[2], TaskResult::Cancelled);

    assert_eq!(
        store.get_task(event.tasks[0].id).unwrap().status,
        VmTaskStatus::Success
    );
    assert_eq!(
        store.get_task(event.tasks[1].id).unwrap().status,
        VmTaskStatus::Error
    );
    assert_eq!(
        store.get_task(event.tasks[2].id).unwrap().status,
        VmTaskStatus::Cancelled
    );
}

#[tokio::test]
async fn test_log_chunks_stay_contiguous_across_flushes() {
    let store = Store::open_in_memory().unwrap();
    // Spread output over several flush ticks.
    let event = store
        .create_prebuild_event(&["echo one; sleepms 40; echo two; sleepms 40; echo three"])
        .unwrap();
    let guest = Arc::new(MockGuest::default());

    let results = test_supervisor(&store)
        .run_tasks(&event.tasks, mock_factory(&guest))
        .await;
    assert_eq!(results, vec![TaskResult::Success]);

    let group = event.tasks[0].log_group_id;
    let indices = store.log_indices(group).unwrap();
    assert!(indices.len() >= 2, "expected multiple chunks, got {indices:?}");
    let expected: Vec<i64> = (0..indices.len() as i64).collect();
    assert_eq!(indices, expected);

    assert_eq!(group_bytes(&store, group), b"one\ntwo\nthree\n");
}

#[tokio::test]
async fn test_all_tasks_reach_terminal_status() {
    let store = Store::open_in_memory().unwrap();
    let event = store
        .create_prebuild_event(&["exit 1", "sleep 10", "sleep 10", "sleep 10"])
        .unwrap();
    let guest = Arc::new(MockGuest::default());

    let results = test_supervisor(&store)
        .run_tasks(&event.tasks, mock_factory(&guest))
        .await;
    assert_eq!(results.len(), 4);

    let mut errors = 0;
    let mut cancelled = 0;
    for task in &event.tasks {
        match store.get_task(task.id).unwrap().status {
            VmTaskStatus::Error => errors += 1,
            VmTaskStatus::Cancelled => cancelled += 1,
            other => panic!("task {} ended non-terminal: {other:?}", task.id),
        }
    }
    // Exactly one root cause; everyone else is a casualty.
    assert_eq!(errors, 1);
    assert_eq!(cancelled, 3);
}
