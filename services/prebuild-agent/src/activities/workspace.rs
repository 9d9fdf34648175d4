//! StartWorkspace / StopWorkspace: the long-lived variant of prebuild.
//!
//! A workspace VM backgrounds its tasks, installs the caller's SSH keys,
//! and stays running after the activity returns: `with_vm` is entered with
//! poweroff disabled, and StopWorkspace performs the deferred teardown.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::network::{expose_public, IpBlock};
use crate::ssh::{ExecOpts, GuestSession};
use crate::tasks::launch_background_tasks;
use crate::tasks::scripts::DEV_DIR;
use crate::vm::ExtraDrive;

use super::{home_dir, ActivityContext};

/// Arguments for StartWorkspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartWorkspaceArgs {
    pub instance_id: String,
    pub root_fs_path: PathBuf,
    pub project_drive_path: PathBuf,
    /// Commands launched in the background inside the workspace.
    pub tasks: Vec<String>,
    /// Public keys granted interactive access.
    pub authorized_keys: Vec<String>,
}

/// Result of StartWorkspace. Everything the workflow engine needs to later
/// stop the VM or route users into it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartWorkspaceResult {
    pub instance_id: String,
    pub vm_pid: u32,
    pub vm_ip: String,
    pub ip_block_id: u16,
    pub task_pids: Vec<u32>,
}

/// Arguments for StopWorkspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopWorkspaceArgs {
    pub instance_id: String,
    pub ip_block_id: u16,
}

/// Boot a workspace VM, launch its tasks detached, authorize the caller's
/// keys, and flip the VM to public visibility. The VM keeps running after
/// return; the caller owns the eventual StopWorkspace.
pub async fn start_workspace(
    ctx: &ActivityContext,
    args: StartWorkspaceArgs,
) -> Result<StartWorkspaceResult> {
    let mut spec = ctx.vm_spec(
        &args.instance_id,
        args.root_fs_path.clone(),
        ctx.workspace_credentials(),
    );
    spec.extra_drives = vec![ExtraDrive {
        host_path: args.project_drive_path.clone(),
        mount_point: DEV_DIR.to_string(),
    }];
    spec.should_poweroff = false;

    let user = spec.ssh.user.clone();
    let gateway = Arc::clone(&ctx.gateway);

    ctx.runtime
        .with_vm(spec, |handle, ssh| async move {
            let ssh_dir = format!("{}/.ssh", home_dir(&user));
            ssh.exec(
                &format!("mkdir -p \"{ssh_dir}\" && chmod 700 \"{ssh_dir}\""),
                ExecOpts::default(),
            )
            .await?;

            let mut keys_file = args.authorized_keys.join("\n");
            keys_file.push('\n');
            ssh.write_file(
                &format!("{ssh_dir}/authorized_keys"),
                keys_file.into_bytes(),
                0o600,
            )
            .await
            .context("writing authorized_keys")?;

            let task_pids = launch_background_tasks(&*ssh, &args.tasks)
                .await
                .context("launching workspace tasks")?;

            expose_public(&IpBlock {
                id: handle.ip_block_id,
            })
            .context("exposing workspace to public network")?;

            gateway
                .add_public_keys_to_authorized_keys(&args.authorized_keys)
                .await
                .context("registering keys with SSH gateway")?;

            info!(
                instance_id = %handle.instance_id,
                vm_ip = %handle.vm_ip,
                task_count = task_pids.len(),
                "Workspace started"
            );

            Ok(StartWorkspaceResult {
                instance_id: handle.instance_id.clone(),
                vm_pid: handle.pid,
                vm_ip: handle.vm_ip.to_string(),
                ip_block_id: handle.ip_block_id,
                task_pids,
            })
        })
        .await
}

/// Deferred teardown of a workspace VM started with poweroff disabled.
pub async fn stop_workspace(ctx: &ActivityContext, args: StopWorkspaceArgs) -> Result<()> {
    ctx.runtime
        .shutdown_vm_and_release_resources(&args.instance_id, args.ip_block_id)
        .await
}
