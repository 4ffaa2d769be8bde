//! Connection cache
//!
//! Maps socket identity to owning PID. This is the store every lookup is
//! answered from; the baseline and kernel maps only feed it.
//!
//! Concurrent writers for the same identity are ordered by the kernel
//! sequence number carried on each event. A destroy leaves a tombstone with
//! its sequence so that a create emitted earlier but applied later is
//! rejected instead of resurrecting a closed socket.

use crate::types::{FlowKey, Pid, SocketIdentity};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Live(Pid),
    Tombstone,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    state: SlotState,
    seq: u64,
    revision: u64,
    touched: Instant,
}

#[derive(Debug, Default)]
struct CacheInner {
    slots: HashMap<SocketIdentity, Slot>,
    flows: HashMap<FlowKey, SocketIdentity>,
    next_revision: u64,
}

impl CacheInner {
    fn write(&mut self, id: SocketIdentity, state: SlotState, seq: u64) {
        self.next_revision += 1;
        let slot = Slot {
            state,
            seq,
            revision: self.next_revision,
            touched: Instant::now(),
        };
        self.slots.insert(id, slot);
        match state {
            SlotState::Live(_) => {
                self.flows.insert(id.flow(), id);
            }
            SlotState::Tombstone => self.unlink_flow(&id),
        }
    }

    fn unlink_flow(&mut self, id: &SocketIdentity) {
        let flow = id.flow();
        if self.flows.get(&flow) == Some(id) {
            self.flows.remove(&flow);
        }
    }

    fn remove(&mut self, id: &SocketIdentity) -> Option<Slot> {
        let slot = self.slots.remove(id)?;
        self.unlink_flow(id);
        Some(slot)
    }
}

/// Entry picked up by a sweep, used to evict only if nothing wrote it since
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheEntry {
    pub identity: SocketIdentity,
    pub pid: Pid,
    revision: u64,
}

/// Thread-safe identity → PID store
#[derive(Debug, Default)]
pub struct ConnectionCache {
    inner: RwLock<CacheInner>,
}

impl ConnectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &SocketIdentity) -> Option<Pid> {
        match self.inner.read().slots.get(id)?.state {
            SlotState::Live(pid) => Some(pid),
            SlotState::Tombstone => None,
        }
    }

    /// Look up by four-tuple when the inode is unknown
    pub fn find_by_flow(&self, flow: &FlowKey) -> Option<(SocketIdentity, Pid)> {
        let inner = self.inner.read();
        let id = inner.flows.get(flow)?;
        match inner.slots.get(id)?.state {
            SlotState::Live(pid) => Some((*id, pid)),
            SlotState::Tombstone => None,
        }
    }

    /// Insert or overwrite unconditionally, keeping any sequence already seen
    pub fn put(&self, id: SocketIdentity, pid: Pid) {
        let mut inner = self.inner.write();
        let seq = inner.slots.get(&id).map(|slot| slot.seq).unwrap_or(0);
        inner.write(id, SlotState::Live(pid), seq);
    }

    pub fn remove(&self, id: &SocketIdentity) -> Option<Pid> {
        match self.inner.write().remove(id)?.state {
            SlotState::Live(pid) => Some(pid),
            SlotState::Tombstone => None,
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.slots.clear();
        inner.flows.clear();
    }

    /// Apply a create event. Returns false if a newer write already won.
    pub fn apply_created(&self, id: SocketIdentity, pid: Pid, seq: u64) -> bool {
        let mut inner = self.inner.write();
        if let Some(slot) = inner.slots.get(&id) {
            if seq <= slot.seq {
                return false;
            }
        }
        inner.write(id, SlotState::Live(pid), seq);
        true
    }

    /// Apply a destroy event, leaving a tombstone. Returns false if a newer
    /// create already won.
    pub fn apply_destroyed(&self, id: SocketIdentity, seq: u64) -> bool {
        let mut inner = self.inner.write();
        if let Some(slot) = inner.slots.get(&id) {
            if seq < slot.seq {
                return false;
            }
        }
        inner.write(id, SlotState::Tombstone, seq);
        true
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .slots
            .values()
            .filter(|slot| matches!(slot.state, SlotState::Live(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tombstones(&self) -> usize {
        self.inner
            .read()
            .slots
            .values()
            .filter(|slot| slot.state == SlotState::Tombstone)
            .count()
    }

    /// Live entries not written for at least `age`
    pub fn snapshot_older_than(&self, age: Duration) -> Vec<CacheEntry> {
        let now = Instant::now();
        self.inner
            .read()
            .slots
            .iter()
            .filter(|(_, slot)| now.saturating_duration_since(slot.touched) >= age)
            .filter_map(|(id, slot)| match slot.state {
                SlotState::Live(pid) => Some(CacheEntry {
                    identity: *id,
                    pid,
                    revision: slot.revision,
                }),
                SlotState::Tombstone => None,
            })
            .collect()
    }

    /// Evict an entry from [`snapshot_older_than`](Self::snapshot_older_than)
    /// unless it was written in between
    pub fn remove_if_unchanged(&self, entry: &CacheEntry) -> bool {
        let mut inner = self.inner.write();
        match inner.slots.get(&entry.identity) {
            Some(slot) if slot.revision == entry.revision => {
                inner.remove(&entry.identity);
                true
            }
            _ => false,
        }
    }

    /// Drop tombstones older than `age`, returning how many went
    pub fn prune_tombstones(&self, age: Duration) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.write();
        let before = inner.slots.len();
        inner.slots.retain(|_, slot| {
            slot.state != SlotState::Tombstone
                || now.saturating_duration_since(slot.touched) < age
        });
        before - inner.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Protocol;
    use std::sync::Arc;

    fn id(inode: u64) -> SocketIdentity {
        SocketIdentity::new(
            Protocol::Tcp,
            "192.168.1.20".parse().unwrap(),
            40000 + inode as u16,
            "140.82.112.3".parse().unwrap(),
            443,
            inode,
        )
    }

    #[test]
    fn test_put_then_get() {
        let cache = ConnectionCache::new();
        cache.put(id(1), 1200);
        assert_eq!(cache.get(&id(1)), Some(1200));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_remove_then_get() {
        let cache = ConnectionCache::new();
        cache.put(id(1), 1200);
        assert_eq!(cache.remove(&id(1)), Some(1200));
        assert_eq!(cache.get(&id(1)), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_get_missing() {
        let cache = ConnectionCache::new();
        assert_eq!(cache.get(&id(9)), None);
        assert_eq!(cache.remove(&id(9)), None);
    }

    #[test]
    fn test_find_by_flow() {
        let cache = ConnectionCache::new();
        cache.put(id(3), 77);
        assert_eq!(cache.find_by_flow(&id(3).flow()), Some((id(3), 77)));

        cache.apply_destroyed(id(3), 10);
        assert_eq!(cache.find_by_flow(&id(3).flow()), None);
    }

    #[test]
    fn test_inode_reuse_replaces_flow_index() {
        let cache = ConnectionCache::new();
        let old = id(5);
        let mut new = old;
        new.inode = 500;

        cache.apply_created(old, 10, 1);
        cache.apply_created(new, 20, 2);
        cache.apply_destroyed(old, 3);

        assert_eq!(cache.find_by_flow(&new.flow()), Some((new, 20)));
    }

    #[test]
    fn test_created_then_destroyed() {
        let cache = ConnectionCache::new();
        assert!(cache.apply_created(id(1), 300, 10));
        assert!(cache.apply_destroyed(id(1), 11));
        assert_eq!(cache.get(&id(1)), None);
        assert_eq!(cache.tombstones(), 1);
    }

    #[test]
    fn test_late_create_does_not_resurrect() {
        let cache = ConnectionCache::new();
        assert!(cache.apply_destroyed(id(1), 11));
        assert!(!cache.apply_created(id(1), 300, 10));
        assert_eq!(cache.get(&id(1)), None);
    }

    #[test]
    fn test_same_seq_destroy_wins() {
        let cache = ConnectionCache::new();
        cache.apply_created(id(1), 300, 10);
        assert!(cache.apply_destroyed(id(1), 10));
        assert_eq!(cache.get(&id(1)), None);
    }

    #[test]
    fn test_concurrent_create_destroy_interleavings() {
        for round in 0..200u64 {
            let cache = Arc::new(ConnectionCache::new());
            let target = id(round);

            let creator = {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || cache.apply_created(target, 42, 100))
            };
            let destroyer = {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || cache.apply_destroyed(target, 101))
            };
            creator.join().unwrap();
            destroyer.join().unwrap();

            assert_eq!(cache.get(&target), None, "round {round}");
        }
    }

    #[test]
    fn test_concurrent_writers_distinct_keys() {
        let cache = Arc::new(ConnectionCache::new());
        let handles: Vec<_> = (0..8u64)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..100u64 {
                        cache.apply_created(id(t * 1000 + i), t as Pid, i + 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), 800);
    }

    #[test]
    fn test_put_keeps_sequence() {
        let cache = ConnectionCache::new();
        cache.apply_created(id(1), 1, 50);
        cache.put(id(1), 2);
        assert!(!cache.apply_created(id(1), 3, 40));
        assert_eq!(cache.get(&id(1)), Some(2));
    }

    #[test]
    fn test_remove_if_unchanged() {
        let cache = ConnectionCache::new();
        cache.put(id(1), 1);
        cache.put(id(2), 2);

        let stale = cache.snapshot_older_than(Duration::ZERO);
        assert_eq!(stale.len(), 2);

        // rewritten after the snapshot, must survive
        cache.put(id(2), 22);

        let mut evicted = 0;
        for entry in &stale {
            if cache.remove_if_unchanged(entry) {
                evicted += 1;
            }
        }
        assert_eq!(evicted, 1);
        assert_eq!(cache.get(&id(1)), None);
        assert_eq!(cache.get(&id(2)), Some(22));
    }

    #[test]
    fn test_snapshot_respects_age() {
        let cache = ConnectionCache::new();
        cache.put(id(1), 1);
        assert!(cache
            .snapshot_older_than(Duration::from_secs(3600))
            .is_empty());
    }

    #[test]
    fn test_prune_tombstones() {
        let cache = ConnectionCache::new();
        cache.apply_destroyed(id(1), 5);
        cache.put(id(2), 2);

        assert_eq!(cache.prune_tombstones(Duration::from_secs(3600)), 0);
        assert_eq!(cache.prune_tombstones(Duration::ZERO), 1);
        assert_eq!(cache.tombstones(), 0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_clear() {
        let cache = ConnectionCache::new();
        cache.put(id(1), 1);
        cache.apply_destroyed(id(2), 1);
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.tombstones(), 0);
        assert_eq!(cache.find_by_flow(&id(1).flow()), None);
    }
}
