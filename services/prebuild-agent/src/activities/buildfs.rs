//! BuildFs: turn a Dockerfile into a bootable root filesystem image.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::ssh::{shell_quote, ExecOpts, GuestSession};
use crate::vm::{create_ext4_image, ExtraDrive};

use super::ActivityContext;

/// Where the repository drive is mounted in the builder VM.
const INPUT_DIR: &str = "/tmp/input";

/// Where the output image drive is mounted in the builder VM.
const OUTPUT_DIR: &str = "/tmp/output";

/// Where the buildfs resources are uploaded.
const WORKDIR: &str = "/tmp/workdir";

/// Arguments for BuildFs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildfsArgs {
    pub instance_id: String,
    /// Root filesystem of the disposable builder VM.
    pub builder_root_fs_path: PathBuf,
    /// Drive holding the repository with the Dockerfile.
    pub input_drive_path: PathBuf,
    /// Drive that receives the built filesystem. Always recreated.
    pub output_drive_path: PathBuf,
    pub output_drive_size_mib: u64,
    /// Dockerfile path relative to the input drive root.
    pub dockerfile_path: String,
    /// Build context path relative to the input drive root.
    pub context_path: String,
}

/// Run the Dockerfile build inside a disposable VM, populating the output
/// drive with a bootable ext4 image.
pub async fn buildfs(ctx: &ActivityContext, args: BuildfsArgs) -> Result<()> {
    create_ext4_image(&args.output_drive_path, args.output_drive_size_mib, true)
        .context("creating output image")?;

    let mut spec = ctx.vm_spec(
        &args.instance_id,
        args.builder_root_fs_path.clone(),
        ctx.boot_credentials(),
    );
    spec.extra_drives = vec![
        ExtraDrive {
            host_path: args.input_drive_path.clone(),
            mount_point: INPUT_DIR.to_string(),
        },
        ExtraDrive {
            host_path: args.output_drive_path.clone(),
            mount_point: OUTPUT_DIR.to_string(),
        },
    ];

    let resources = ctx.config.resources_dir.join("buildfs");

    ctx.runtime
        .with_vm(spec, |_handle, ssh| async move {
            ssh.put_directory(resources, WORKDIR.to_string())
                .await
                .context("uploading buildfs resources")?;

            ssh.exec(&format!("chmod +x {WORKDIR}/buildfs.sh"), ExecOpts::default())
                .await?;

            let dockerfile = format!("{INPUT_DIR}/{}", args.dockerfile_path);
            let build_context = format!("{INPUT_DIR}/{}", args.context_path);

            info!(dockerfile = %dockerfile, "Running buildfs");
            ssh.exec(
                &format!(
                    "{WORKDIR}/buildfs.sh {} {} {}",
                    shell_quote(&dockerfile),
                    shell_quote(OUTPUT_DIR),
                    shell_quote(&build_context),
                ),
                ExecOpts::default(),
            )
            .await
            .context("buildfs.sh")?;

            Ok(())
        })
        .await
}
