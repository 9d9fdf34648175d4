//! Prebuild: run a prebuild event's tasks concurrently inside one VM.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::ssh::{GuestSession, SshSession};
use crate::tasks::scripts::DEV_DIR;
use crate::tasks::{SessionFactory, TaskResult, TaskSupervisor};
use crate::vm::ExtraDrive;

use super::ActivityContext;

/// How long each task session may wait for SSH; the VM is already booted
/// when the supervisor opens them.
const TASK_SSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Arguments for Prebuild.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrebuildArgs {
    pub prebuild_event_id: i64,
    pub root_fs_path: PathBuf,
    /// Project drive produced by CheckoutAndInspect.
    pub project_drive_path: PathBuf,
}

/// Run all tasks of the event concurrently and return their outcomes in
/// task order. The activity returns normally even when tasks failed; only
/// supervisor or VM lifecycle faults surface as errors.
pub async fn prebuild(ctx: &ActivityContext, args: PrebuildArgs) -> Result<Vec<TaskResult>> {
    let event = ctx
        .store
        .get_prebuild_event(args.prebuild_event_id)
        .context("loading prebuild event")?;

    info!(
        prebuild_event_id = event.id,
        task_count = event.tasks.len(),
        "Starting prebuild"
    );

    // Deterministic per event, so retries reuse the same host paths.
    let instance_id = format!("prebuild-{}", event.id);

    let mut spec = ctx.vm_spec(
        &instance_id,
        args.root_fs_path.clone(),
        ctx.workspace_credentials(),
    );
    spec.extra_drives = vec![ExtraDrive {
        host_path: args.project_drive_path.clone(),
        mount_point: DEV_DIR.to_string(),
    }];

    let creds = ctx.workspace_credentials();
    let store = ctx.store.clone();
    let tasks = event.tasks;

    ctx.runtime
        .with_vm(spec, |handle, _control| async move {
            let addr = handle.ssh_addr();

            // Each task gets its own session so disposing one interrupts
            // exactly one exec.
            let factory: SessionFactory = Arc::new(move || {
                let creds = creds.clone();
                Box::pin(async move {
                    let session = SshSession::connect(addr, creds, TASK_SSH_TIMEOUT).await?;
                    Ok(Arc::new(session) as Arc<dyn GuestSession>)
                })
            });

            let supervisor = TaskSupervisor::new(store);
            Ok(supervisor.run_tasks(&tasks, factory).await)
        })
        .await
}
