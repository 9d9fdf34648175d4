//! IP block allocation for microVMs.
//!
//! Each VM gets a /30 out of 168.254.0.0/16: block `id` maps to
//! `168.254.<id>.0/30` with the tap device on `.1` and the guest on `.2`.
//! The busy set is persisted so blocks survive agent restarts; a block that
//! is handed out must be released on every exit path of the owning VM scope.

use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::AgentError;

/// Smallest assignable block id.
pub const MIN_IP_ID: u16 = 1;

/// Largest assignable block id (third octet of the /30).
pub const MAX_IP_ID: u16 = 254;

/// A /30 subnet handed to exactly one VM at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpBlock {
    pub id: u16,
}

impl IpBlock {
    /// Guest-side address.
    pub fn vm_ip(&self) -> Ipv4Addr {
        Ipv4Addr::new(168, 254, self.id as u8, 2)
    }

    /// Host-side tap address.
    pub fn tap_ip(&self) -> Ipv4Addr {
        Ipv4Addr::new(168, 254, self.id as u8, 1)
    }

    /// Tap address with the /30 prefix, as `ip addr add` wants it.
    pub fn tap_cidr(&self) -> String {
        format!("{}/30", self.tap_ip())
    }

    /// Tap device name. Stays well under IFNAMSIZ.
    pub fn tap_name(&self) -> String {
        format!("hocusvm{}", self.id)
    }
}

/// On-disk schema of the busy set.
#[derive(Debug, Serialize, Deserialize, Default)]
struct BusyIpFile {
    #[serde(rename = "busyIpIds")]
    busy_ip_ids: Vec<u16>,
}

/// Allocator over the fixed /30 pool.
///
/// `allocate` and `release` serialize the mutate+persist critical section
/// behind one mutex, so two concurrent allocations can never observe the
/// same free id.
pub struct IpBlockAllocator {
    state_path: PathBuf,
    max_ip_id: u16,
    busy: Mutex<BTreeSet<u16>>,
}

impl IpBlockAllocator {
    /// Open the allocator, loading any persisted busy set.
    pub fn open(state_path: PathBuf) -> Result<Self> {
        Self::with_max_id(state_path, MAX_IP_ID)
    }

    /// Open with a smaller pool. Used to exercise exhaustion in tests.
    pub fn with_max_id(state_path: PathBuf, max_ip_id: u16) -> Result<Self> {
        let busy = if state_path.exists() {
            let raw = fs::read(&state_path)
                .with_context(|| format!("reading busy-IP file {}", state_path.display()))?;
            let file: BusyIpFile =
                serde_json::from_slice(&raw).context("parsing busy-IP file")?;
            file.busy_ip_ids.into_iter().collect()
        } else {
            BTreeSet::new()
        };

        Ok(Self {
            state_path,
            max_ip_id,
            busy: Mutex::new(busy),
        })
    }

    /// Pick a free block, mark it busy, persist, and return it.
    pub async fn allocate(&self) -> Result<IpBlock> {
        let mut busy = self.busy.lock().await;

        let id = (MIN_IP_ID..=self.max_ip_id)
            .find(|id| !busy.contains(id))
            .ok_or(AgentError::NoFreeIpBlock)?;

        busy.insert(id);
        if let Err(err) = self.persist(&busy) {
            busy.remove(&id);
            return Err(err);
        }

        debug!(ip_block_id = id, "Allocated IP block");
        Ok(IpBlock { id })
    }

    /// Return a block to the pool and persist.
    pub async fn release(&self, id: u16) -> Result<()> {
        let mut busy = self.busy.lock().await;

        if !busy.remove(&id) {
            warn!(ip_block_id = id, "Released IP block that was not busy");
            return Ok(());
        }

        self.persist(&busy)?;
        debug!(ip_block_id = id, "Released IP block");
        Ok(())
    }

    /// Number of blocks currently held.
    pub async fn busy_count(&self) -> usize {
        self.busy.lock().await.len()
    }

    /// Write the busy set to a temp file, fsync, then rename into place.
    fn persist(&self, busy: &BTreeSet<u16>) -> Result<()> {
        let file = BusyIpFile {
            busy_ip_ids: busy.iter().copied().collect(),
        };
        let raw = serde_json::to_vec(&file).context("serializing busy-IP file")?;

        let tmp_path = self.state_path.with_extension("json.tmp");
        if let Some(parent) = self.state_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut tmp = fs::File::create(&tmp_path)
            .with_context(|| format!("creating {}", tmp_path.display()))?;
        tmp.write_all(&raw)?;
        tmp.sync_all()?;
        drop(tmp);

        fs::rename(&tmp_path, &self.state_path)
            .with_context(|| format!("renaming into {}", self.state_path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_address_mapping() {
        let block = IpBlock { id: 7 };
        assert_eq!(block.vm_ip(), Ipv4Addr::new(168, 254, 7, 2));
        assert_eq!(block.tap_ip(), Ipv4Addr::new(168, 254, 7, 1));
        assert_eq!(block.tap_cidr(), "168.254.7.1/30");
        assert_eq!(block.tap_name(), "hocusvm7");
    }

    #[test]
    fn test_tap_name_fits_ifnamsiz() {
        let block = IpBlock { id: MAX_IP_ID };
        assert!(block.tap_name().len() <= 15);
    }

    #[tokio::test]
    async fn test_allocate_release_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = IpBlockAllocator::open(dir.path().join("busy.json")).unwrap();

        let block = alloc.allocate().await.unwrap();
        assert_eq!(alloc.busy_count().await, 1);

        alloc.release(block.id).await.unwrap();
        assert_eq!(alloc.busy_count().await, 0);
    }

    #[tokio::test]
    async fn test_exhaustion() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = IpBlockAllocator::with_max_id(dir.path().join("busy.json"), 1).unwrap();

        let block = alloc.allocate().await.unwrap();
        let err = alloc.allocate().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AgentError>(),
            Some(AgentError::NoFreeIpBlock)
        ));

        alloc.release(block.id).await.unwrap();
        alloc.allocate().await.unwrap();
    }

    #[tokio::test]
    async fn test_persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("busy.json");

        let first = IpBlockAllocator::open(path.clone()).unwrap();
        let a = first.allocate().await.unwrap();
        let b = first.allocate().await.unwrap();
        first.release(a.id).await.unwrap();

        // Reopen from disk; only b should still be busy.
        let second = IpBlockAllocator::open(path.clone()).unwrap();
        assert_eq!(second.busy_count().await, 1);
        let c = second.allocate().await.unwrap();
        assert_ne!(c.id, b.id);

        // The file schema is part of the on-host contract.
        let raw = std::fs::read(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert!(parsed.get("busyIpIds").unwrap().is_array());
    }
}
