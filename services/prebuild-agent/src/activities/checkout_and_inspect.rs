//! CheckoutAndInspect: copy a repo drive, check out a branch, and parse
//! the optional project configuration.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;
use validator::Validate;

use crate::error::AgentError;
use crate::ssh::{shell_quote, ExecOpts, GuestSession};
use crate::vm::ExtraDrive;

use super::ActivityContext;

/// Where the copied repo drive is mounted in the inspect VM.
const WORKDIR: &str = "/tmp/workdir";

/// Repository checkout inside the workdir mount.
const WORKDIR_REPO: &str = "/tmp/workdir/project";

/// Project config file, relative to the repository root.
const CONFIG_FILE: &str = "hocus.yml";

/// Arguments for CheckoutAndInspect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutAndInspectArgs {
    pub instance_id: String,
    pub root_fs_path: PathBuf,
    /// Source drive holding the fetched repository. Never written.
    pub repo_drive_path: PathBuf,
    /// Destination for the checked-out copy.
    pub output_drive_path: PathBuf,
    pub target_branch: String,
}

/// A task declared in the project config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ProjectTaskConfig {
    #[validate(length(min = 1))]
    pub init: String,
}

/// Image build settings declared in the project config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ProjectImageConfig {
    #[validate(length(min = 1))]
    pub file: String,
    #[serde(rename = "buildContext", default = "default_build_context")]
    pub build_context: String,
}

fn default_build_context() -> String {
    ".".to_string()
}

/// Schema-validated project configuration loaded from `hocus.yml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ProjectConfig {
    #[validate(nested)]
    #[serde(default)]
    pub image: Option<ProjectImageConfig>,
    #[validate(nested)]
    #[serde(default)]
    pub tasks: Vec<ProjectTaskConfig>,
}

/// Copy the repo drive, check out the target branch, and return the parsed
/// project config, or `None` when the repository carries none. On any
/// failure the output drive is deleted before the error surfaces, so no
/// stale artifact survives.
pub async fn checkout_and_inspect(
    ctx: &ActivityContext,
    args: CheckoutAndInspectArgs,
) -> Result<Option<ProjectConfig>> {
    match run(ctx, &args).await {
        Ok(config) => Ok(config),
        Err(err) => {
            if args.output_drive_path.exists() {
                if let Err(remove_err) = std::fs::remove_file(&args.output_drive_path) {
                    warn!(
                        path = %args.output_drive_path.display(),
                        error = %remove_err,
                        "Failed to delete output drive after checkout failure"
                    );
                }
            }
            Err(err)
        }
    }
}

async fn run(
    ctx: &ActivityContext,
    args: &CheckoutAndInspectArgs,
) -> Result<Option<ProjectConfig>> {
    if args.output_drive_path.exists() {
        warn!(
            path = %args.output_drive_path.display(),
            "Output drive already exists; overwriting"
        );
    }
    std::fs::copy(&args.repo_drive_path, &args.output_drive_path)
        .context("copying repository drive")?;

    let mut spec = ctx.vm_spec(
        &args.instance_id,
        args.root_fs_path.clone(),
        ctx.boot_credentials(),
    );
    spec.extra_drives = vec![ExtraDrive {
        host_path: args.output_drive_path.clone(),
        mount_point: WORKDIR.to_string(),
    }];

    let target_branch = args.target_branch.clone();

    ctx.runtime
        .with_vm(spec, |_handle, ssh| async move {
            ssh.exec(
                &format!("git checkout {}", shell_quote(&target_branch)),
                ExecOpts {
                    cwd: Some(WORKDIR_REPO.to_string()),
                    ..Default::default()
                },
            )
            .await
            .context("git checkout")?;

            let cat = ssh
                .exec(
                    &format!("cat \"{WORKDIR_REPO}/{CONFIG_FILE}\""),
                    ExecOpts {
                        allow_non_zero_exit_code: true,
                        ..Default::default()
                    },
                )
                .await?;

            if cat.code != 0 {
                return Ok(None);
            }

            let config: ProjectConfig = serde_yaml::from_slice(&cat.stdout)
                .map_err(|e| AgentError::ValidationFailed(format!("{CONFIG_FILE}: {e}")))?;
            config
                .validate()
                .map_err(|e| AgentError::ValidationFailed(format!("{CONFIG_FILE}: {e}")))?;

            Ok(Some(config))
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
image:
  file: hocus/Dockerfile
  buildContext: hocus
tasks:
  - init: yarn install
  - init: yarn build
"#;
        let config: ProjectConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.image.as_ref().unwrap().file, "hocus/Dockerfile");
        assert_eq!(config.tasks.len(), 2);
        assert_eq!(config.tasks[0].init, "yarn install");
    }

    #[test]
    fn test_build_context_defaults() {
        let yaml = "image:\n  file: Dockerfile\n";
        let config: ProjectConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.image.unwrap().build_context, ".");
    }

    #[test]
    fn test_empty_task_command_rejected() {
        let yaml = "tasks:\n  - init: \"\"\n";
        let config: ProjectConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }
}
