//! Addresses owned by this host
//!
//! Used to tell locally originated connections from inbound ones. Seeded
//! with the loopback addresses so the set is never empty.

use crate::collab::AddressSource;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::{debug, warn};

#[derive(Debug)]
pub struct LocalAddressSet {
    addrs: RwLock<BTreeSet<IpAddr>>,
}

impl Default for LocalAddressSet {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalAddressSet {
    pub fn new() -> Self {
        let seed = [IpAddr::V4(Ipv4Addr::LOCALHOST), IpAddr::V6(Ipv6Addr::LOCALHOST)];
        Self {
            addrs: RwLock::new(seed.into_iter().collect()),
        }
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.addrs.read().contains(ip)
    }

    pub fn snapshot(&self) -> Vec<IpAddr> {
        self.addrs.read().iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.addrs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.read().is_empty()
    }

    /// Replace the set with what `source` reports. Returns true if the set
    /// changed. A failed or empty read keeps the previous contents.
    pub fn refresh(&self, source: &dyn AddressSource) -> bool {
        let fresh: BTreeSet<IpAddr> = match source.local_addresses() {
            Ok(addrs) => addrs.into_iter().collect(),
            Err(e) => {
                warn!("Failed to list local addresses: {}", e);
                return false;
            }
        };
        if fresh.is_empty() {
            debug!("Interface listing came back empty, keeping previous addresses");
            return false;
        }

        let mut addrs = self.addrs.write();
        if *addrs == fresh {
            return false;
        }
        debug!("Local addresses changed: {} -> {}", addrs.len(), fresh.len());
        *addrs = fresh;
        true
    }
}
