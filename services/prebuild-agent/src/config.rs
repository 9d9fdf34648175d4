//! Configuration for the prebuild agent.

use std::path::PathBuf;

use anyhow::Result;

/// Prebuild agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Path to the firecracker binary.
    pub firecracker_path: PathBuf,

    /// Path to the kernel image VMs boot with.
    pub kernel_path: PathBuf,

    /// Data directory for host-local state (busy-IP file, database).
    pub data_dir: PathBuf,

    /// Directory holding guest-side resources (buildfs.sh and friends).
    pub resources_dir: PathBuf,

    /// SSH username for initial-boot activities (fetch, buildfs, checkout).
    pub boot_ssh_user: String,

    /// SSH password matching `boot_ssh_user`.
    pub boot_ssh_password: String,

    /// SSH username for prebuild and workspace activities.
    pub workspace_ssh_user: String,

    /// Private key path matching `workspace_ssh_user`.
    pub workspace_ssh_key_path: PathBuf,

    /// SSH gateway base URL for publishing workspace keys.
    pub gateway_url: String,

    /// vCPUs per VM.
    pub vcpu_count: u8,

    /// Memory per VM in MiB.
    pub mem_size_mib: u32,

    /// How long to wait for SSH after instance start, in seconds.
    pub ssh_boot_timeout_secs: u64,
}

impl AgentConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let firecracker_path = std::env::var("HOCUS_FIRECRACKER_PATH")
            .unwrap_or_else(|_| "/usr/bin/firecracker".to_string())
            .into();

        let kernel_path = std::env::var("HOCUS_KERNEL_PATH")
            .unwrap_or_else(|_| "/var/lib/hocus/kernel/vmlinux".to_string())
            .into();

        let data_dir = std::env::var("HOCUS_DATA_DIR")
            .unwrap_or_else(|_| "/var/lib/hocus".to_string())
            .into();

        let resources_dir = std::env::var("HOCUS_RESOURCES_DIR")
            .unwrap_or_else(|_| "/var/lib/hocus/resources".to_string())
            .into();

        let boot_ssh_user =
            std::env::var("HOCUS_BOOT_SSH_USER").unwrap_or_else(|_| "hocus".to_string());

        let boot_ssh_password =
            std::env::var("HOCUS_BOOT_SSH_PASSWORD").unwrap_or_else(|_| "hocus".to_string());

        let workspace_ssh_user =
            std::env::var("HOCUS_WORKSPACE_SSH_USER").unwrap_or_else(|_| "hocus".to_string());

        let workspace_ssh_key_path = std::env::var("HOCUS_WORKSPACE_SSH_KEY_PATH")
            .unwrap_or_else(|_| "/var/lib/hocus/workspace_id_rsa".to_string())
            .into();

        let gateway_url = std::env::var("HOCUS_GATEWAY_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8822".to_string());

        let vcpu_count = std::env::var("HOCUS_VM_VCPUS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(2);

        let mem_size_mib = std::env::var("HOCUS_VM_MEM_MIB")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(2048);

        let ssh_boot_timeout_secs = std::env::var("HOCUS_SSH_BOOT_TIMEOUT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        Ok(Self {
            firecracker_path,
            kernel_path,
            data_dir,
            resources_dir,
            boot_ssh_user,
            boot_ssh_password,
            workspace_ssh_user,
            workspace_ssh_key_path,
            gateway_url,
            vcpu_count,
            mem_size_mib,
            ssh_boot_timeout_secs,
        })
    }

    /// Path of the busy-IP persistence file.
    pub fn ip_state_path(&self) -> PathBuf {
        self.data_dir.join("busy_ip_blocks.json")
    }
}
