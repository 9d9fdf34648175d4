//! CheckoutAndInspect must never leave a partially written output drive
//! behind, whatever stage the failure happens at.

use std::path::PathBuf;
use std::sync::Arc;

use prebuild_agent::activities::{checkout_and_inspect, CheckoutAndInspectArgs};
use prebuild_agent::config::AgentConfig;
use prebuild_agent::db::Store;
use prebuild_agent::gateway::HttpSshGateway;
use prebuild_agent::network::IpBlockAllocator;
use prebuild_agent::vm::VmRuntime;
use prebuild_agent::ActivityContext;

fn test_context(data_dir: PathBuf) -> ActivityContext {
    let config = AgentConfig {
        firecracker_path: "/nonexistent/firecracker".into(),
        kernel_path: "/nonexistent/vmlinux".into(),
        data_dir: data_dir.clone(),
        resources_dir: data_dir.join("resources"),
        boot_ssh_user: "hocus".to_string(),
        boot_ssh_password: "hocus".to_string(),
        workspace_ssh_user: "hocus".to_string(),
        workspace_ssh_key_path: data_dir.join("id_rsa"),
        gateway_url: "http://127.0.0.1:1".to_string(),
        vcpu_count: 1,
        mem_size_mib: 128,
        ssh_boot_timeout_secs: 1,
    };

    let store = Store::open_in_memory().unwrap();
    let allocator = Arc::new(IpBlockAllocator::open(config.ip_state_path()).unwrap());
    let runtime = Arc::new(VmRuntime::new(config.firecracker_path.clone(), allocator));
    let gateway = Arc::new(HttpSshGateway::new(config.gateway_url.clone()));

    ActivityContext::new(config, store, runtime, gateway)
}

#[tokio::test]
async fn test_missing_repo_drive_leaves_no_output() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = test_context(dir.path().to_path_buf());

    let output = dir.path().join("checkout.ext4");
    let args = CheckoutAndInspectArgs {
        instance_id: "checkout-test-1".to_string(),
        root_fs_path: "/nonexistent/rootfs.ext4".into(),
        repo_drive_path: dir.path().join("missing.ext4"),
        output_drive_path: output.clone(),
        target_branch: "main".to_string(),
    };

    let result = checkout_and_inspect(&ctx, args).await;
    assert!(result.is_err());
    assert!(!output.exists(), "output drive left behind");
}

#[tokio::test]
async fn test_boot_failure_deletes_copied_output() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = test_context(dir.path().to_path_buf());

    // A source drive exists, so the copy succeeds; the VM boot then fails
    // (the VMM binary does not exist) and the copy must be rolled back.
    let repo_drive = dir.path().join("repo.ext4");
    std::fs::write(&repo_drive, b"pretend-ext4").unwrap();
    let output = dir.path().join("checkout.ext4");

    let args = CheckoutAndInspectArgs {
        instance_id: "checkout-test-2".to_string(),
        root_fs_path: "/nonexistent/rootfs.ext4".into(),
        repo_drive_path: repo_drive,
        output_drive_path: output.clone(),
        target_branch: "main".to_string(),
    };

    let result = checkout_and_inspect(&ctx, args).await;
    assert!(result.is_err());
    assert!(!output.exists(), "output drive left behind after boot failure");

    // No IP block may leak either.
    assert_eq!(ctx.runtime.allocator().busy_count().await, 0);
}
