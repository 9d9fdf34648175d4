//! FetchRepository: clone or fetch a git repository into an output drive.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::ssh::{shell_quote, ExecOpts, GuestSession};
use crate::tasks::scripts::{DEV_DIR, REPO_DIR};
use crate::vm::{create_ext4_image, ExtraDrive};

use super::{home_dir, ActivityContext, GIT_SSH_COMMAND};

/// Arguments for FetchRepository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchRepositoryArgs {
    pub instance_id: String,
    /// Root filesystem for the fetch VM. Per-project, since credentials
    /// are embedded in it.
    pub root_fs_path: PathBuf,
    /// Drive that receives the repository; created if missing.
    pub output_drive_path: PathBuf,
    pub output_drive_size_mib: u64,
    pub repo_url: String,
    /// Private key deploying read access to the repository, if any.
    pub ssh_private_key: Option<String>,
}

/// Clone the repository into the output drive, or bring an existing clone
/// up to date. Idempotent: a second invocation with the same arguments
/// takes the fetch path.
pub async fn fetch_repository(ctx: &ActivityContext, args: FetchRepositoryArgs) -> Result<()> {
    let newly_created = !args.output_drive_path.exists();
    if newly_created {
        create_ext4_image(&args.output_drive_path, args.output_drive_size_mib, false)
            .context("creating repository drive")?;
    }

    let mut spec = ctx.vm_spec(
        &args.instance_id,
        args.root_fs_path.clone(),
        ctx.boot_credentials(),
    );
    spec.extra_drives = vec![ExtraDrive {
        host_path: args.output_drive_path.clone(),
        mount_point: DEV_DIR.to_string(),
    }];

    let user = spec.ssh.user.clone();

    ctx.runtime
        .with_vm(spec, |_handle, ssh| async move {
            if newly_created {
                ssh.exec(
                    &format!("sudo chown -R {user}:{user} \"{DEV_DIR}\""),
                    ExecOpts::default(),
                )
                .await
                .context("chowning repository drive")?;
            }

            if let Some(key) = &args.ssh_private_key {
                materialize_deploy_key(ssh.as_ref(), &user, key).await?;
            }

            let git_env = vec![(
                "GIT_SSH_COMMAND".to_string(),
                GIT_SSH_COMMAND.to_string(),
            )];

            let existing = ssh
                .exec(
                    &format!("test -d \"{REPO_DIR}/.git\""),
                    ExecOpts {
                        allow_non_zero_exit_code: true,
                        ..Default::default()
                    },
                )
                .await?;

            if existing.code == 0 {
                info!(repo_url = %args.repo_url, "Repository present; fetching");
                ssh.exec(
                    "git fetch --all",
                    ExecOpts {
                        cwd: Some(REPO_DIR.to_string()),
                        env: git_env,
                        ..Default::default()
                    },
                )
                .await
                .context("git fetch")?;
            } else {
                info!(repo_url = %args.repo_url, "Cloning repository");
                ssh.exec(
                    &format!(
                        "git clone --no-checkout {} project",
                        shell_quote(&args.repo_url)
                    ),
                    ExecOpts {
                        cwd: Some(DEV_DIR.to_string()),
                        env: git_env,
                        ..Default::default()
                    },
                )
                .await
                .context("git clone")?;
            }

            Ok(())
        })
        .await
}

/// Put the deploy key at `~/.ssh/id_rsa` on a tmpfs mount, so it never
/// touches the drive image.
async fn materialize_deploy_key(ssh: &dyn GuestSession, user: &str, key: &str) -> Result<()> {
    let ssh_dir = format!("{}/.ssh", home_dir(user));

    ssh.exec(
        &format!(
            "mkdir -p \"{ssh_dir}\" && \
             sudo mount -t tmpfs -o mode=0700,uid=$(id -u),gid=$(id -g) tmpfs \"{ssh_dir}\""
        ),
        ExecOpts::default(),
    )
    .await
    .context("mounting tmpfs over ~/.ssh")?;

    ssh.write_file(
        &format!("{ssh_dir}/id_rsa"),
        key.as_bytes().to_vec(),
        0o400,
    )
    .await
    .context("writing deploy key")?;

    Ok(())
}
