//! VM lifecycle: boot, teardown, and the scoped `with_vm` primitive.
//!
//! VMs, tap devices, and IP blocks all leak at a distance when a failure
//! interrupts an activity. `with_vm` owns all of them for the duration of a
//! body closure, so every exit path funnels through one teardown that is
//! itself resilient: a failing step never prevents the following steps.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{composite, AgentError};
use crate::network::{create_tap, delete_tap, tap_exists, IpBlock, IpBlockAllocator};
use crate::ssh::{GuestSession, SshCredentials, SshSession};

use super::api::FirecrackerClient;
use super::fc_config::{
    generate_mac_address, BootSource, DriveConfig, MachineConfig, NetworkInterface,
};

/// How long to wait for the VMM control socket to appear.
const SOCKET_WAIT: Duration = Duration::from_secs(5);

/// Grace period between CtrlAltDel and the force kill.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// SSH port inside guests.
const GUEST_SSH_PORT: u16 = 22;

/// An extra drive attached to a VM and mounted inside the guest.
#[derive(Debug, Clone)]
pub struct ExtraDrive {
    pub host_path: PathBuf,
    pub mount_point: String,
}

/// Everything needed to boot one VM.
#[derive(Debug, Clone)]
pub struct VmSpec {
    pub instance_id: String,
    pub kernel_path: PathBuf,
    pub root_fs_path: PathBuf,
    /// Attached in order as vdb, vdc, ...
    pub extra_drives: Vec<ExtraDrive>,
    pub vcpu_count: u8,
    pub mem_size_mib: u32,
    /// When false and the body succeeds, the caller inherits the VM and
    /// must stop it later.
    pub should_poweroff: bool,
    pub ssh: SshCredentials,
    pub ssh_boot_timeout: Duration,
}

/// Handle to a running VM. Alive for the duration of a `with_vm` scope (or
/// until `stop_workspace` for deferred-teardown VMs).
#[derive(Debug, Clone)]
pub struct VmHandle {
    pub instance_id: String,
    pub pid: u32,
    pub vm_ip: Ipv4Addr,
    pub tap_name: String,
    pub ip_block_id: u16,
    pub extra_drive_mounts: Vec<String>,
}

impl VmHandle {
    /// SSH endpoint of the guest.
    pub fn ssh_addr(&self) -> SocketAddr {
        SocketAddr::new(self.vm_ip.into(), GUEST_SSH_PORT)
    }
}

/// Boots and tears down Firecracker VMs.
pub struct VmRuntime {
    firecracker_path: PathBuf,
    allocator: Arc<IpBlockAllocator>,
}

impl VmRuntime {
    pub fn new(firecracker_path: PathBuf, allocator: Arc<IpBlockAllocator>) -> Self {
        Self {
            firecracker_path,
            allocator,
        }
    }

    /// The allocator backing this runtime.
    pub fn allocator(&self) -> &Arc<IpBlockAllocator> {
        &self.allocator
    }

    /// VMM control socket of an instance.
    fn socket_path(instance_id: &str) -> PathBuf {
        PathBuf::from(format!("/tmp/{instance_id}.sock"))
    }

    /// Per-instance scratch directory.
    fn scratch_dir(instance_id: &str) -> PathBuf {
        PathBuf::from(format!("/tmp/{instance_id}"))
    }

    /// Scoped acquisition: allocate an IP block, boot, run `body`, tear
    /// down. Teardown is skipped only when the spec opts out of poweroff
    /// AND the body succeeded; the caller then owns the VM.
    pub async fn with_vm<T, F, Fut>(&self, spec: VmSpec, body: F) -> Result<T>
    where
        F: FnOnce(VmHandle, Arc<SshSession>) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let block = self.allocator.allocate().await?;

        let (handle, ssh) = match self.start_vm(&spec, &block).await {
            Ok(pair) => pair,
            Err(err) => {
                if let Err(release_err) = self.allocator.release(block.id).await {
                    return Err(composite(vec![err, release_err]));
                }
                return Err(err);
            }
        };

        let body_result = body(handle.clone(), Arc::clone(&ssh)).await;

        if !spec.should_poweroff && body_result.is_ok() {
            info!(
                instance_id = %handle.instance_id,
                ip_block_id = handle.ip_block_id,
                "Leaving VM running; caller owns teardown"
            );
            return body_result;
        }

        ssh.dispose();
        let teardown = self
            .shutdown_vm_and_release_resources(&spec.instance_id, block.id)
            .await;

        match (body_result, teardown) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(teardown_err)) => Err(teardown_err),
            (Err(body_err), Ok(())) => Err(body_err),
            (Err(body_err), Err(teardown_err)) => Err(composite(vec![body_err, teardown_err])),
        }
    }

    /// Boot a VM: spawn the VMM, configure it over its control socket,
    /// start the instance, wait for SSH, and mount the extra drives.
    pub async fn start_vm(
        &self,
        spec: &VmSpec,
        block: &IpBlock,
    ) -> Result<(VmHandle, Arc<SshSession>)> {
        let instance_id = &spec.instance_id;
        info!(instance_id = %instance_id, "Starting VM");

        let socket_path = Self::socket_path(instance_id);
        if socket_path.exists() {
            std::fs::remove_file(&socket_path).ok();
        }
        std::fs::create_dir_all(Self::scratch_dir(instance_id))?;

        let tap_name = create_tap(block).context("creating tap device")?;

        let pid = match self.spawn_vmm(instance_id, &socket_path).await {
            Ok(pid) => pid,
            Err(err) => {
                self.destroy_partial(instance_id, block, None);
                return Err(err);
            }
        };

        let client = FirecrackerClient::new(&socket_path);
        if let Err(err) = self.configure_and_boot(&client, spec, block, &tap_name).await {
            self.destroy_partial(instance_id, block, Some(pid));
            return Err(err);
        }

        let ssh = match SshSession::connect(
            SocketAddr::new(block.vm_ip().into(), GUEST_SSH_PORT),
            spec.ssh.clone(),
            spec.ssh_boot_timeout,
        )
        .await
        {
            Ok(session) => Arc::new(session),
            Err(err) => {
                self.destroy_partial(instance_id, block, Some(pid));
                return Err(anyhow::Error::new(AgentError::VmBootTimeout {
                    instance_id: instance_id.clone(),
                    timeout_secs: spec.ssh_boot_timeout.as_secs(),
                })
                .context(format!("{err:#}")));
            }
        };

        let mut extra_drive_mounts = Vec::with_capacity(spec.extra_drives.len());
        for (index, drive) in spec.extra_drives.iter().enumerate() {
            let device = DriveConfig::guest_device(index);
            let command = mount_command(&spec.ssh.user, &device, &drive.mount_point);
            if let Err(err) = ssh.exec(&command, Default::default()).await {
                ssh.dispose();
                self.destroy_partial(instance_id, block, Some(pid));
                return Err(err.context(format!("mounting {} at {}", device, drive.mount_point)));
            }
            extra_drive_mounts.push(drive.mount_point.clone());
        }

        info!(instance_id = %instance_id, vm_ip = %block.vm_ip(), "VM started");

        Ok((
            VmHandle {
                instance_id: instance_id.clone(),
                pid,
                vm_ip: block.vm_ip(),
                tap_name,
                ip_block_id: block.id,
                extra_drive_mounts,
            },
            ssh,
        ))
    }

    /// Graceful shutdown, force kill if unresponsive, then release the
    /// tap device, control socket, scratch directory, and IP block. Every
    /// step runs regardless of earlier failures; failures are reported
    /// jointly at the end.
    pub async fn shutdown_vm_and_release_resources(
        &self,
        instance_id: &str,
        ip_block_id: u16,
    ) -> Result<()> {
        info!(instance_id = %instance_id, "Stopping VM");

        let mut failures: Vec<anyhow::Error> = Vec::new();
        let block = IpBlock { id: ip_block_id };
        let socket_path = Self::socket_path(instance_id);

        let client = FirecrackerClient::new(&socket_path);
        if client.socket_exists() {
            match client.send_ctrl_alt_del().await {
                Ok(()) => {
                    debug!(instance_id = %instance_id, "Sent CtrlAltDel");
                    tokio::time::sleep(SHUTDOWN_GRACE).await;
                }
                Err(err) => {
                    warn!(instance_id = %instance_id, error = %err, "CtrlAltDel failed, will force kill");
                }
            }
        }

        // Kill whatever is still attached to the control socket. No match
        // means the VMM already exited.
        let socket_str = socket_path.to_string_lossy().to_string();
        if let Err(err) = std::process::Command::new("pkill")
            .args(["-9", "-f", &socket_str])
            .status()
        {
            failures.push(anyhow!("pkill failed: {err}"));
        }

        if tap_exists(&block.tap_name()) {
            if let Err(err) = delete_tap(&block) {
                warn!(instance_id = %instance_id, error = %err, "Failed to delete tap device");
                failures.push(err.into());
            }
        }

        if socket_path.exists() {
            if let Err(err) = std::fs::remove_file(&socket_path) {
                failures.push(anyhow!("removing control socket: {err}"));
            }
        }
        let scratch = Self::scratch_dir(instance_id);
        if scratch.exists() {
            if let Err(err) = std::fs::remove_dir_all(&scratch) {
                failures.push(anyhow!("removing scratch dir: {err}"));
            }
        }

        if let Err(err) = self.allocator.release(ip_block_id).await {
            failures.push(err);
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(composite(failures))
        }
    }

    async fn spawn_vmm(&self, instance_id: &str, socket_path: &PathBuf) -> Result<u32> {
        let mut child = Command::new(&self.firecracker_path)
            .arg("--api-sock")
            .arg(socket_path)
            .arg("--id")
            .arg(instance_id)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("spawning {}", self.firecracker_path.display()))?;

        let pid = child
            .id()
            .ok_or_else(|| anyhow!("VMM exited before reporting a PID"))?;

        // Reap the VMM whenever it exits, even after this scope is gone.
        tokio::spawn(async move {
            let _ = child.wait().await;
        });

        // Wait for the control socket to appear.
        let deadline = tokio::time::Instant::now() + SOCKET_WAIT;
        while tokio::time::Instant::now() < deadline {
            if socket_path.exists() {
                return Ok(pid);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        Err(anyhow!("VMM control socket did not appear"))
    }

    async fn configure_and_boot(
        &self,
        client: &FirecrackerClient,
        spec: &VmSpec,
        block: &IpBlock,
        tap_name: &str,
    ) -> Result<()> {
        let machine = MachineConfig::new(spec.vcpu_count.max(1), spec.mem_size_mib.max(128));
        client.put_machine_config(&machine).await?;

        let boot_source = BootSource::new(spec.kernel_path.clone(), block.vm_ip(), block.tap_ip());
        client.put_boot_source(&boot_source).await?;

        let root_drive = DriveConfig::root_disk(spec.root_fs_path.clone());
        client.put_drive(&root_drive).await?;

        for (index, drive) in spec.extra_drives.iter().enumerate() {
            if !drive.host_path.exists() {
                return Err(anyhow!(
                    "extra drive missing at {}",
                    drive.host_path.display()
                ));
            }
            let config = DriveConfig::extra_drive(index, drive.host_path.clone());
            client.put_drive(&config).await?;
        }

        let mac = generate_mac_address(&spec.instance_id);
        let net_iface = NetworkInterface::new("eth0", tap_name).with_mac(&mac);
        client.put_network_interface(&net_iface).await?;

        client.start_instance().await?;
        debug!(instance_id = %spec.instance_id, "Instance start issued");
        Ok(())
    }

    /// Best-effort cleanup of a partially started VM. Boot failures must
    /// not leak the VMM process, tap device, or control socket; the IP
    /// block stays with the caller.
    fn destroy_partial(&self, instance_id: &str, block: &IpBlock, pid: Option<u32>) {
        if let Some(pid) = pid {
            let _ = std::process::Command::new("kill")
                .args(["-KILL", &pid.to_string()])
                .status();
        }
        if let Err(err) = delete_tap(block) {
            warn!(instance_id = %instance_id, error = %err, "Failed to delete tap device");
        }
        let _ = std::fs::remove_file(Self::socket_path(instance_id));
        let _ = std::fs::remove_dir_all(Self::scratch_dir(instance_id));
    }
}

/// Guest command mounting a drive. Non-root users need the image to ship
/// passwordless sudo, which the hocus guest images do.
fn mount_command(user: &str, device: &str, mount_point: &str) -> String {
    let sudo = if user == "root" { "" } else { "sudo " };
    format!("{sudo}mkdir -p \"{mount_point}\" && {sudo}mount \"{device}\" \"{mount_point}\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_and_scratch_layout() {
        assert_eq!(
            VmRuntime::socket_path("prebuild-42"),
            PathBuf::from("/tmp/prebuild-42.sock")
        );
        assert_eq!(
            VmRuntime::scratch_dir("prebuild-42"),
            PathBuf::from("/tmp/prebuild-42")
        );
    }

    #[test]
    fn test_mount_command_sudo() {
        let cmd = mount_command("hocus", "/dev/vdb", "/home/hocus/dev");
        assert!(cmd.starts_with("sudo mkdir -p"));
        assert!(cmd.contains("sudo mount \"/dev/vdb\" \"/home/hocus/dev\""));

        let root_cmd = mount_command("root", "/dev/vdb", "/tmp/workdir");
        assert!(root_cmd.starts_with("mkdir -p"));
    }
}
