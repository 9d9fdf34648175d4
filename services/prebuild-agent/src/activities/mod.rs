//! The activity surface invoked by the workflow engine.
//!
//! Each activity is a free function taking a typed argument record and
//! returning a typed result record. Records hold only host paths,
//! primitives, and byte-strings, so they survive process restarts between
//! retries. Every activity opens exactly one `with_vm` scope.

pub mod buildfs;
pub mod checkout_and_inspect;
pub mod fetch_repository;
pub mod prebuild;
pub mod workspace;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::config::AgentConfig;
use crate::db::Store;
use crate::gateway::{HttpSshGateway, SshGateway};
use crate::network::IpBlockAllocator;
use crate::ssh::{SshAuth, SshCredentials};
use crate::vm::{VmRuntime, VmSpec};

pub use buildfs::{buildfs, BuildfsArgs};
pub use checkout_and_inspect::{checkout_and_inspect, CheckoutAndInspectArgs, ProjectConfig};
pub use fetch_repository::{fetch_repository, FetchRepositoryArgs};
pub use prebuild::{prebuild, PrebuildArgs};
pub use workspace::{
    start_workspace, stop_workspace, StartWorkspaceArgs, StartWorkspaceResult, StopWorkspaceArgs,
};

/// `GIT_SSH_COMMAND` used for clones and fetches.
// Host keys are not pinned. TODO: accept a per-project known_hosts file
// instead of disabling checking.
pub const GIT_SSH_COMMAND: &str =
    "ssh -o UserKnownHostsFile=/dev/null -o StrictHostKeyChecking=no";

/// Collaborators shared by all activities.
pub struct ActivityContext {
    pub config: AgentConfig,
    pub store: Store,
    pub runtime: Arc<VmRuntime>,
    pub gateway: Arc<dyn SshGateway>,
}

impl ActivityContext {
    pub fn new(
        config: AgentConfig,
        store: Store,
        runtime: Arc<VmRuntime>,
        gateway: Arc<dyn SshGateway>,
    ) -> Self {
        Self {
            config,
            store,
            runtime,
            gateway,
        }
    }

    /// Wire the default collaborators from configuration.
    pub fn from_config(config: AgentConfig) -> Result<Self> {
        let store = Store::open(config.data_dir.join("agent.db"))?;
        let allocator = Arc::new(IpBlockAllocator::open(config.ip_state_path())?);
        let runtime = Arc::new(VmRuntime::new(config.firecracker_path.clone(), allocator));
        let gateway = Arc::new(HttpSshGateway::new(config.gateway_url.clone()));
        Ok(Self::new(config, store, runtime, gateway))
    }

    /// Username/password login used by initial-boot activities.
    pub(crate) fn boot_credentials(&self) -> SshCredentials {
        SshCredentials {
            user: self.config.boot_ssh_user.clone(),
            auth: SshAuth::Password(self.config.boot_ssh_password.clone()),
        }
    }

    /// Key-based login used by prebuild and workspace activities.
    pub(crate) fn workspace_credentials(&self) -> SshCredentials {
        SshCredentials {
            user: self.config.workspace_ssh_user.clone(),
            auth: SshAuth::KeyFile(self.config.workspace_ssh_key_path.clone()),
        }
    }

    /// A VM spec with the agent-wide defaults filled in.
    pub(crate) fn vm_spec(
        &self,
        instance_id: &str,
        root_fs_path: std::path::PathBuf,
        ssh: SshCredentials,
    ) -> VmSpec {
        VmSpec {
            instance_id: instance_id.to_string(),
            kernel_path: self.config.kernel_path.clone(),
            root_fs_path,
            extra_drives: Vec::new(),
            vcpu_count: self.config.vcpu_count,
            mem_size_mib: self.config.mem_size_mib,
            should_poweroff: true,
            ssh,
            ssh_boot_timeout: Duration::from_secs(self.config.ssh_boot_timeout_secs),
        }
    }
}

/// Home directory of a guest user.
pub(crate) fn home_dir(user: &str) -> String {
    if user == "root" {
        "/root".to_string()
    } else {
        format!("/home/{user}")
    }
}
