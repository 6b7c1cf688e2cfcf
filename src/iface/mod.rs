//! Interface registry (C4): a snapshot of the host's network interfaces
//! relevant to time synchronization, keyed by stable opaque ids so renames
//! and hotplug never invalidate a reference held elsewhere (§9's "cyclic
//! ownership" redesign note).

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::{debug, info};

/// Stable across re-insertion of the same physical NIC (derived from PCI
/// bus address or permanent MAC, never from `if_index`, which the kernel is
/// free to reuse).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct NicId(pub u64);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct IfIndex(pub u32);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NicClass {
    Sfc,
    Xnet,
    Other,
}

#[derive(Clone, Debug)]
pub struct TimestampCaps {
    pub hardware_tx: bool,
    pub hardware_rx: bool,
    pub software_tx: bool,
    pub software_rx: bool,
    pub raw_hardware: bool,
}

impl Default for TimestampCaps {
    fn default() -> Self {
        TimestampCaps { hardware_tx: false, hardware_rx: false, software_tx: false, software_rx: false, raw_hardware: false }
    }
}

#[derive(Clone, Debug)]
pub struct Interface {
    pub if_index: IfIndex,
    pub name: String,
    pub permanent_mac: [u8; 6],
    pub pci_id: Option<String>,
    pub driver: String,
    pub fw_version: String,
    pub caps: TimestampCaps,
    /// `None` if this interface has no associated PHC.
    pub phc_index: Option<u32>,
    pub nic_id: NicId,
    pub class: NicClass,
    pub deleted: bool,
    /// When a rename produces a new record for the same `nic_id`, the old
    /// record is kept (marked `deleted`) with this pointer to the new
    /// record's `if_index`, so stale references resolve to the live one.
    pub canonical_alias: Option<IfIndex>,
}

/// Process-wide interface table, guarded by one lock (§5's "process-wide
/// hardware-state mutex"). Readers (servo reconfiguration, sync-module
/// subscription checks) and the single netlink-reconciliation writer all go
/// through this.
#[derive(Default)]
pub struct InterfaceRegistry {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    by_index: HashMap<IfIndex, Interface>,
    nic_id_of_phc: HashMap<u32, NicId>,
}

#[derive(Debug, Eq, PartialEq)]
pub enum ReconcileEvent {
    Added(IfIndex),
    Renamed { old: IfIndex, new: IfIndex },
    Removed(IfIndex),
}

impl InterfaceRegistry {
    pub fn new() -> InterfaceRegistry {
        InterfaceRegistry::default()
    }

    pub fn get(&self, if_index: IfIndex) -> Option<Interface> {
        let inner = self.inner.read();
        let mut current = inner.by_index.get(&if_index)?.clone();
        // Chase the alias pointer so callers holding a stale id still reach
        // the live record.
        let mut hops = 0;
        while let Some(alias) = current.canonical_alias {
            if hops > 8 {
                break; // defends against an accidental alias cycle
            }
            match inner.by_index.get(&alias) {
                Some(next) => current = next.clone(),
                None => break,
            }
            hops += 1;
        }
        Some(current)
    }

    pub fn by_nic_id(&self, nic_id: NicId) -> Vec<Interface> {
        self.inner.read().by_index.values().filter(|i| i.nic_id == nic_id && !i.deleted).cloned().collect()
    }

    pub fn snapshot(&self) -> Vec<Interface> {
        self.inner.read().by_index.values().cloned().collect()
    }

    /// Applies one freshly read netlink link-table entry. Caller (the
    /// netlink reconciliation path) has already resolved `phc_index`,
    /// `nic_id`, and `class` from driver-specific ethtool ioctls; this just
    /// maintains the registry's invariants around renames and re-insertion.
    ///
    /// Two distinct cases both called "rename" informally get different
    /// treatment: the kernel renaming an interface that keeps its
    /// `if_index` (updated in place — no alias needed, nothing else held a
    /// now-stale id), and the same physical NIC reappearing under a new
    /// `if_index` after unplug/replug or a driver reload (the old,
    /// now-deleted record gets a `canonical_alias` pointing at the new
    /// one, so an id captured before the replug still resolves).
    ///
    /// Invariant upheld here: if `phc_index` is set, every live interface
    /// sharing it shares the same `nic_id` (§4.4's interface invariant).
    pub fn apply(&self, incoming: Interface) -> ReconcileEvent {
        let mut inner = self.inner.write();

        if let Some(phc_index) = incoming.phc_index {
            inner.nic_id_of_phc.insert(phc_index, incoming.nic_id);
        }

        if let Some(existing) = inner.by_index.get(&incoming.if_index) {
            if existing.name != incoming.name {
                info!(if_index = incoming.if_index.0, old_name = %existing.name, new_name = %incoming.name, "interface renamed");
            }
            let if_index = incoming.if_index;
            inner.by_index.insert(if_index, incoming);
            return ReconcileEvent::Added(if_index);
        }

        let reinsertion = inner
            .by_index
            .values()
            .find(|i| i.deleted && i.nic_id == incoming.nic_id && i.canonical_alias.is_none())
            .map(|i| i.if_index);

        let if_index = incoming.if_index;
        inner.by_index.insert(if_index, incoming);

        if let Some(old_index) = reinsertion {
            if let Some(old) = inner.by_index.get_mut(&old_index) {
                old.canonical_alias = Some(if_index);
            }
            info!(old = old_index.0, new = if_index.0, "nic reinserted under new if_index");
            ReconcileEvent::Renamed { old: old_index, new: if_index }
        } else {
            debug!(if_index = if_index.0, "new interface");
            ReconcileEvent::Added(if_index)
        }
    }

    /// Marks an interface gone (netlink `RTM_DELLINK`) without erasing its
    /// record, so any component still holding its `if_index` can notice via
    /// [`InterfaceRegistry::get`]'s `deleted` flag rather than crashing on a
    /// dangling id.
    pub fn remove(&self, if_index: IfIndex) -> ReconcileEvent {
        let mut inner = self.inner.write();
        if let Some(entry) = inner.by_index.get_mut(&if_index) {
            entry.deleted = true;
        }
        ReconcileEvent::Removed(if_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(if_index: u32, name: &str, nic_id: u64, phc_index: Option<u32>) -> Interface {
        Interface {
            if_index: IfIndex(if_index),
            name: name.to_string(),
            permanent_mac: [0; 6],
            pci_id: None,
            driver: "sfc".to_string(),
            fw_version: "1.0".to_string(),
            caps: TimestampCaps::default(),
            phc_index,
            nic_id: NicId(nic_id),
            class: NicClass::Sfc,
            deleted: false,
            canonical_alias: None,
        }
    }

    #[test]
    fn new_interface_is_added() {
        let reg = InterfaceRegistry::new();
        let event = reg.apply(iface(1, "eth0", 100, Some(0)));
        assert_eq!(event, ReconcileEvent::Added(IfIndex(1)));
        assert!(reg.get(IfIndex(1)).is_some());
    }

    #[test]
    fn replug_under_new_if_index_aliases_the_old_record() {
        let reg = InterfaceRegistry::new();
        reg.apply(iface(1, "eth0", 100, Some(0)));
        reg.remove(IfIndex(1));
        reg.apply(iface(2, "eth0", 100, Some(0)));

        let resolved = reg.get(IfIndex(1)).unwrap();
        assert_eq!(resolved.name, "eth0");
        assert_eq!(resolved.if_index, IfIndex(2));
    }

    #[test]
    fn rename_in_place_keeps_same_if_index() {
        let reg = InterfaceRegistry::new();
        reg.apply(iface(1, "eth0", 100, Some(0)));
        reg.apply(iface(1, "eth1", 100, Some(0)));
        let entry = reg.get(IfIndex(1)).unwrap();
        assert_eq!(entry.name, "eth1");
        assert!(!entry.deleted);
    }

    #[test]
    fn remove_marks_deleted_without_erasing() {
        let reg = InterfaceRegistry::new();
        reg.apply(iface(1, "eth0", 100, None));
        reg.remove(IfIndex(1));
        let entry = reg.get(IfIndex(1)).unwrap();
        assert!(entry.deleted);
    }

    #[test]
    fn shared_phc_implies_shared_nic_id() {
        let reg = InterfaceRegistry::new();
        reg.apply(iface(1, "eth0", 100, Some(0)));
        reg.apply(iface(2, "eth0_1", 100, Some(0)));
        let a = reg.get(IfIndex(1)).unwrap();
        let b = reg.get(IfIndex(2)).unwrap();
        assert_eq!(a.nic_id, b.nic_id);
    }
}
