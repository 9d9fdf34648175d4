//! TAP device creation and management.
//!
//! Each microVM gets a dedicated TAP device carrying its /30. Prebuild VMs
//! stay host-only; a workspace VM is flipped to public visibility by adding
//! forward/masquerade rules for its guest address.

use std::process::Command;

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::ip_alloc::IpBlock;

/// Errors from TAP device operations.
#[derive(Debug, Error)]
pub enum TapError {
    #[error("failed to create TAP device: {0}")]
    CreateFailed(String),

    #[error("failed to configure TAP device: {0}")]
    ConfigFailed(String),

    #[error("failed to change TAP visibility: {0}")]
    VisibilityFailed(String),

    #[error("failed to delete TAP device: {0}")]
    DeleteFailed(String),

    #[error("command execution failed: {0}")]
    CommandFailed(#[from] std::io::Error),
}

/// Create and configure the TAP device for an IP block.
///
/// Sets up the device, its /30 gateway address, and per-interface
/// forwarding. The device starts private: no forward rules towards the
/// outside world exist until [`expose_public`] is called.
pub fn create_tap(block: &IpBlock) -> Result<String, TapError> {
    let tap_name = block.tap_name();

    info!(
        tap = %tap_name,
        cidr = %block.tap_cidr(),
        "Creating TAP device"
    );

    run_ip(&["tuntap", "add", "dev", &tap_name, "mode", "tap"])
        .map_err(|e| TapError::CreateFailed(e.to_string()))?;

    run_ip(&["addr", "add", &block.tap_cidr(), "dev", &tap_name]).map_err(|e| {
        let _ = run_ip(&["link", "delete", &tap_name]);
        TapError::ConfigFailed(format!("gateway address: {}", e))
    })?;

    run_ip(&["link", "set", "dev", &tap_name, "up"]).map_err(|e| {
        let _ = run_ip(&["link", "delete", &tap_name]);
        TapError::ConfigFailed(format!("bring up: {}", e))
    })?;

    // Host must route between the tap and its uplink for public workspaces.
    if let Err(e) = enable_forwarding(&tap_name) {
        warn!(tap = %tap_name, error = %e, "Failed to enable forwarding");
    }

    debug!(tap = %tap_name, "TAP device created and configured");
    Ok(tap_name)
}

/// Flip a VM from private to public visibility: forward its traffic and
/// masquerade its guest address on the way out.
pub fn expose_public(block: &IpBlock) -> Result<(), TapError> {
    let tap_name = block.tap_name();
    let vm_ip = block.vm_ip().to_string();

    info!(tap = %tap_name, vm_ip = %vm_ip, "Exposing VM to public network");

    run_iptables(&["-A", "FORWARD", "-i", &tap_name, "-j", "ACCEPT"])
        .map_err(|e| TapError::VisibilityFailed(e.to_string()))?;
    run_iptables(&["-A", "FORWARD", "-o", &tap_name, "-j", "ACCEPT"])
        .map_err(|e| TapError::VisibilityFailed(e.to_string()))?;
    run_iptables(&[
        "-t",
        "nat",
        "-A",
        "POSTROUTING",
        "-s",
        &vm_ip,
        "-j",
        "MASQUERADE",
    ])
    .map_err(|e| TapError::VisibilityFailed(e.to_string()))?;

    Ok(())
}

/// Delete the TAP device and any visibility rules it accumulated.
///
/// Rule removal is best-effort: the rules may never have been added, and a
/// missing device must not block the rest of teardown.
pub fn delete_tap(block: &IpBlock) -> Result<(), TapError> {
    let tap_name = block.tap_name();
    let vm_ip = block.vm_ip().to_string();

    info!(tap = %tap_name, "Deleting TAP device");

    let _ = run_iptables(&["-D", "FORWARD", "-i", &tap_name, "-j", "ACCEPT"]);
    let _ = run_iptables(&["-D", "FORWARD", "-o", &tap_name, "-j", "ACCEPT"]);
    let _ = run_iptables(&[
        "-t",
        "nat",
        "-D",
        "POSTROUTING",
        "-s",
        &vm_ip,
        "-j",
        "MASQUERADE",
    ]);

    run_ip(&["link", "delete", &tap_name]).map_err(|e| TapError::DeleteFailed(e.to_string()))?;

    debug!(tap = %tap_name, "TAP device deleted");
    Ok(())
}

/// Check if a TAP device exists.
pub fn tap_exists(tap_name: &str) -> bool {
    std::path::Path::new(&format!("/sys/class/net/{}", tap_name)).exists()
}

/// Run an `ip` command and return result.
fn run_ip(args: &[&str]) -> Result<()> {
    let output = Command::new("ip")
        .args(args)
        .output()
        .context("failed to execute ip command")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("ip {} failed: {}", args.join(" "), stderr.trim());
    }

    Ok(())
}

/// Run an `iptables` command and return result.
fn run_iptables(args: &[&str]) -> Result<()> {
    let output = Command::new("iptables")
        .args(args)
        .output()
        .context("failed to execute iptables command")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("iptables {} failed: {}", args.join(" "), stderr.trim());
    }

    Ok(())
}

/// Enable IPv4 forwarding for an interface.
fn enable_forwarding(iface: &str) -> Result<()> {
    let path = format!("/proc/sys/net/ipv4/conf/{}/forwarding", iface);
    std::fs::write(&path, "1").context("failed to enable forwarding")?;
    Ok(())
}
