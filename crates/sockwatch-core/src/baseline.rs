//! Established-connections baseline
//!
//! Sockets that were already established before the probes were attached
//! never produce a create event. They are captured once per family at
//! startup and kept in a separate set that callers consult when the cache
//! misses. Only baseline maintenance mutates the set afterwards.

use crate::collab::{InodeResolver, SocketDumper};
use crate::error::DumpError;
use crate::types::{AddressFamily, FlowKey, Pid, Protocol, SocketIdentity, UNRESOLVED_PID};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// Thread-safe identity → PID snapshot of pre-existing connections
#[derive(Debug, Default)]
pub struct EstablishedBaselineSet {
    entries: RwLock<HashMap<SocketIdentity, Pid>>,
}

impl EstablishedBaselineSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &SocketIdentity) -> Option<Pid> {
        self.entries.read().get(id).copied()
    }

    /// Linear scan by four-tuple; the set is small and rarely queried this way
    pub fn find_by_flow(&self, flow: &FlowKey) -> Option<(SocketIdentity, Pid)> {
        self.entries
            .read()
            .iter()
            .find(|(id, _)| id.flow() == *flow)
            .map(|(id, pid)| (*id, *pid))
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Entries still waiting for a PID
    pub fn unresolved(&self) -> Vec<SocketIdentity> {
        self.entries
            .read()
            .iter()
            .filter(|(_, pid)| **pid == UNRESOLVED_PID)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn snapshot(&self) -> Vec<(SocketIdentity, Pid)> {
        self.entries.read().iter().map(|(id, pid)| (*id, *pid)).collect()
    }

    pub(crate) fn merge(&self, other: HashMap<SocketIdentity, Pid>) {
        self.entries.write().extend(other);
    }

    fn set_pid(&self, id: &SocketIdentity, pid: Pid) -> bool {
        match self.entries.write().get_mut(id) {
            Some(slot) => {
                *slot = pid;
                true
            }
            None => false,
        }
    }

    /// Drop entries of `family` whose identity is not in `alive`
    fn prune_family(&self, family: AddressFamily, alive: &HashSet<SocketIdentity>) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|id, _| id.family != family || alive.contains(id));
        before - entries.len()
    }
}

fn resolve_pid(id: &SocketIdentity, resolver: &dyn InodeResolver) -> Pid {
    match resolver.resolve(id.inode, &id.disambiguation_key()) {
        Ok(pid) => pid,
        Err(e) => {
            debug!("Baseline could not resolve {}: {}", id, e);
            UNRESOLVED_PID
        }
    }
}

fn established(
    family: AddressFamily,
    dumper: &dyn SocketDumper,
) -> Result<Vec<SocketIdentity>, DumpError> {
    Ok(dumper
        .dump(family, Protocol::Tcp)?
        .into_iter()
        .filter(|sock| sock.is_established())
        .map(|sock| sock.identity)
        .collect())
}

/// Capture the established TCP sockets of one family
///
/// A socket whose owner cannot be found is still recorded, with
/// [`UNRESOLVED_PID`], so maintenance can retry it.
pub fn snapshot(
    family: AddressFamily,
    dumper: &dyn SocketDumper,
    resolver: &dyn InodeResolver,
) -> Result<EstablishedBaselineSet, DumpError> {
    let mut entries = HashMap::new();
    for id in established(family, dumper)? {
        entries.insert(id, resolve_pid(&id, resolver));
    }
    Ok(EstablishedBaselineSet {
        entries: RwLock::new(entries),
    })
}

/// Snapshot `family` into `set`. A dump failure leaves the family empty
/// and is not propagated.
pub fn populate(
    set: &EstablishedBaselineSet,
    family: AddressFamily,
    dumper: &dyn SocketDumper,
    resolver: &dyn InodeResolver,
) -> usize {
    match snapshot(family, dumper, resolver) {
        Ok(captured) => {
            let count = captured.len();
            set.merge(captured.entries.into_inner());
            info!("Baseline captured {} established {} connections", count, family);
            count
        }
        Err(e) => {
            warn!("Baseline dump for {} failed, continuing without it: {}", family, e);
            0
        }
    }
}

/// Outcome of one maintenance pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub pruned: usize,
    pub resolved: usize,
}

/// Prune closed sockets and retry unresolved ones
///
/// A family whose dump fails is left untouched rather than emptied.
pub fn maintain(
    set: &EstablishedBaselineSet,
    families: &[AddressFamily],
    dumper: &dyn SocketDumper,
    resolver: &dyn InodeResolver,
) -> MaintenanceReport {
    let mut report = MaintenanceReport::default();

    for &family in families {
        match established(family, dumper) {
            Ok(alive) => {
                let alive: HashSet<_> = alive.into_iter().collect();
                report.pruned += set.prune_family(family, &alive);
            }
            Err(e) => debug!("Baseline maintenance skipped {}: {}", family, e),
        }
    }

    for id in set.unresolved() {
        let pid = resolve_pid(&id, resolver);
        if pid != UNRESOLVED_PID && set.set_pid(&id, pid) {
            report.resolved += 1;
        }
    }

    report
}
