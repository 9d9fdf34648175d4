//! Firecracker VM configuration structures.
//!
//! These structures map to the Firecracker API configuration objects for
//! machine configuration, boot source, drives, and network interfaces.
//!
//! Reference: https://github.com/firecracker-microvm/firecracker/blob/main/src/api_server/swagger/firecracker.yaml

use std::net::Ipv4Addr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Machine configuration for the microVM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Number of vCPUs (1-32).
    pub vcpu_count: u8,
    /// Memory size in MiB.
    pub mem_size_mib: u32,
    /// Enable simultaneous multithreading.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smt: Option<bool>,
}

impl MachineConfig {
    /// Create a new machine configuration.
    pub fn new(vcpu_count: u8, mem_size_mib: u32) -> Self {
        Self {
            vcpu_count,
            mem_size_mib,
            smt: Some(false),
        }
    }
}

/// Boot source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootSource {
    /// Path to the kernel image.
    pub kernel_image_path: PathBuf,
    /// Kernel boot arguments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot_args: Option<String>,
}

impl BootSource {
    /// Create a boot source whose kernel args assign the guest its /30
    /// address at boot, so no DHCP is needed inside the VM.
    pub fn new(kernel_image_path: PathBuf, vm_ip: Ipv4Addr, tap_ip: Ipv4Addr) -> Self {
        Self {
            kernel_image_path,
            boot_args: Some(format!(
                "console=ttyS0 reboot=k panic=1 pci=off \
                 ip={vm_ip}::{tap_ip}:255.255.255.252::eth0:off"
            )),
        }
    }
}

/// Block device (drive) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveConfig {
    /// Unique drive identifier.
    pub drive_id: String,
    /// Path to the drive image file.
    pub path_on_host: PathBuf,
    /// Whether this is the root device.
    pub is_root_device: bool,
    /// Whether the drive is read-only.
    pub is_read_only: bool,
}

impl DriveConfig {
    /// Create the root disk (vda) configuration. Root disks are writable:
    /// activities stage work under /tmp inside the guest.
    pub fn root_disk(path: PathBuf) -> Self {
        Self {
            drive_id: "rootfs".to_string(),
            path_on_host: path,
            is_root_device: true,
            is_read_only: false,
        }
    }

    /// Create an extra drive configuration. Extra drives are attached in
    /// argument order as vdb, vdc, ...
    pub fn extra_drive(index: usize, path: PathBuf) -> Self {
        Self {
            drive_id: format!("extra-{}", index),
            path_on_host: path,
            is_root_device: false,
            is_read_only: false,
        }
    }

    /// Guest device node for the extra drive at `index` (vdb, vdc, ...).
    pub fn guest_device(index: usize) -> String {
        // vda is the root disk
        let letter = (b'b' + index as u8) as char;
        format!("/dev/vd{}", letter)
    }
}

/// Network interface configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInterface {
    /// Unique interface identifier.
    pub iface_id: String,
    /// Host device name (tap device).
    pub host_dev_name: String,
    /// Guest MAC address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guest_mac: Option<String>,
}

impl NetworkInterface {
    /// Create a new network interface configuration.
    pub fn new(iface_id: &str, host_dev_name: &str) -> Self {
        Self {
            iface_id: iface_id.to_string(),
            host_dev_name: host_dev_name.to_string(),
            guest_mac: None,
        }
    }

    /// Set guest MAC address.
    pub fn with_mac(mut self, mac: &str) -> Self {
        self.guest_mac = Some(mac.to_string());
        self
    }
}

/// Generate a deterministic MAC address from instance ID.
///
/// Uses the locally administered bit (bit 1 of first byte) and unicast
/// (bit 0 = 0), so retries of the same instance produce stable ARP state.
pub fn generate_mac_address(instance_id: &str) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    instance_id.hash(&mut hasher);
    let hash = hasher.finish();

    // Locally administered (bit 1 = 1), unicast (bit 0 = 0)
    let first_byte = ((hash >> 40) as u8 & 0xFC) | 0x02;

    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        first_byte,
        (hash >> 32) as u8,
        (hash >> 24) as u8,
        (hash >> 16) as u8,
        (hash >> 8) as u8,
        hash as u8,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_config() {
        let config = MachineConfig::new(2, 512);
        assert_eq!(config.vcpu_count, 2);
        assert_eq!(config.mem_size_mib, 512);
    }

    #[test]
    fn test_boot_args_carry_guest_ip() {
        let boot = BootSource::new(
            "/var/lib/hocus/kernel/vmlinux".into(),
            Ipv4Addr::new(168, 254, 9, 2),
            Ipv4Addr::new(168, 254, 9, 1),
        );
        let args = boot.boot_args.unwrap();
        assert!(args.contains("ip=168.254.9.2::168.254.9.1:255.255.255.252::eth0:off"));
    }

    #[test]
    fn test_generate_mac_address() {
        let mac1 = generate_mac_address("instance-1");
        let mac2 = generate_mac_address("instance-2");
        let mac1_again = generate_mac_address("instance-1");

        // MAC should be deterministic
        assert_eq!(mac1, mac1_again);
        // Different instances should have different MACs
        assert_ne!(mac1, mac2);
        // Check format (6 groups of 2 hex digits)
        assert_eq!(mac1.len(), 17);
        assert!(mac1.chars().filter(|&c| c == ':').count() == 5);
    }

    #[test]
    fn test_extra_drive_device_nodes() {
        assert_eq!(DriveConfig::guest_device(0), "/dev/vdb");
        assert_eq!(DriveConfig::guest_device(1), "/dev/vdc");

        let drive = DriveConfig::extra_drive(0, "/srv/project.ext4".into());
        assert_eq!(drive.drive_id, "extra-0");
        assert!(!drive.is_root_device);
    }
}
