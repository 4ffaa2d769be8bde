//! Event streamer
//!
//! One reader task per kernel event buffer pulls raw records and hands each
//! one to a decode worker chosen by hashing the record's socket identity.
//! All events for one socket therefore go through the same worker in the
//! order the buffer produced them; ordering across buffers is settled by
//! the sequence check in the cache.

use crate::byte_order::ByteOrder;
use crate::cache::ConnectionCache;
use crate::error::SourceError;
use crate::event::{EventKind, SocketEvent, IDENTITY_RANGES};
use crate::tasks::{StopSignal, TaskGroup};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// A stream of raw event records, typically one per-CPU perf buffer
#[async_trait]
pub trait EventSource: Send {
    fn name(&self) -> String;

    /// Wait for the next batch of records and append them to `out`.
    /// Returns the number of records the kernel reported as lost.
    async fn next_batch(&mut self, out: &mut Vec<Bytes>) -> Result<u64, SourceError>;
}

/// Streamer counters
#[derive(Debug, Default)]
pub struct StreamStats {
    pub received: AtomicU64,
    pub applied: AtomicU64,
    pub superseded: AtomicU64,
    pub malformed: AtomicU64,
    pub lost: AtomicU64,
}

impl StreamStats {
    pub fn snapshot(&self) -> StreamStatsSnapshot {
        StreamStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            superseded: self.superseded.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            lost: self.lost.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStatsSnapshot {
    pub received: u64,
    pub applied: u64,
    pub superseded: u64,
    pub malformed: u64,
    pub lost: u64,
}

/// Worker index for a raw record
pub fn shard_of(raw: &[u8], shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    for range in IDENTITY_RANGES {
        raw.get(range).hash(&mut hasher);
    }
    (hasher.finish() % shards.max(1) as u64) as usize
}

/// Apply a decoded event to the cache. Returns false if it lost to a newer one.
pub fn apply_event(cache: &ConnectionCache, event: &SocketEvent) -> bool {
    match event.kind {
        EventKind::Created => cache.apply_created(event.identity, event.pid, event.seq),
        EventKind::Destroyed => cache.apply_destroyed(event.identity, event.seq),
    }
}

fn handle_record(raw: &[u8], cache: &ConnectionCache, order: ByteOrder, stats: &StreamStats) {
    let event = match SocketEvent::decode(raw, order) {
        Ok(event) => event,
        Err(e) => {
            stats.malformed.fetch_add(1, Ordering::Relaxed);
            warn!("Dropping malformed socket event: {}", e);
            return;
        }
    };

    trace!("{:?} {} pid={}", event.kind, event.identity, event.pid);
    if apply_event(cache, &event) {
        stats.applied.fetch_add(1, Ordering::Relaxed);
    } else {
        stats.superseded.fetch_add(1, Ordering::Relaxed);
    }
}

/// Pull batches from `source` and fan them out to the workers
pub async fn run_reader(
    mut source: Box<dyn EventSource>,
    shards: Vec<mpsc::Sender<Bytes>>,
    stats: Arc<StreamStats>,
    mut stop: StopSignal,
) {
    let name = source.name();
    let mut batch = Vec::new();

    loop {
        batch.clear();
        let lost = tokio::select! {
            biased;
            _ = &mut stop => break,
            result = source.next_batch(&mut batch) => match result {
                Ok(lost) => lost,
                Err(SourceError::Closed) => {
                    debug!("Event source {} closed", name);
                    break;
                }
                Err(e) => {
                    warn!("Event source {} failed: {}", name, e);
                    break;
                }
            },
        };

        if lost > 0 {
            stats.lost.fetch_add(lost, Ordering::Relaxed);
            warn!("Event source {} lost {} events", name, lost);
        }

        for raw in batch.drain(..) {
            stats.received.fetch_add(1, Ordering::Relaxed);
            let shard = shard_of(&raw, shards.len());
            if shards[shard].send(raw).await.is_err() {
                debug!("Worker {} gone, reader {} exiting", shard, name);
                return;
            }
        }
    }
    debug!("Reader {} stopped", name);
}

/// Decode and apply records until stopped
pub async fn run_worker(
    id: usize,
    mut records: mpsc::Receiver<Bytes>,
    cache: Arc<ConnectionCache>,
    order: ByteOrder,
    stats: Arc<StreamStats>,
    mut stop: StopSignal,
) {
    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            record = records.recv() => match record {
                Some(raw) => handle_record(&raw, &cache, order, &stats),
                None => break,
            },
        }
    }
    debug!("Stream worker {} stopped", id);
}

/// Streamer sizing
#[derive(Debug, Clone, Copy)]
pub struct StreamerSettings {
    pub workers: usize,
    pub queue_len: usize,
}

impl Default for StreamerSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_len: 1024,
        }
    }
}

/// Spawn the decode workers and one reader per source into `group`
pub fn spawn_streamer(
    group: &mut TaskGroup,
    sources: Vec<Box<dyn EventSource>>,
    settings: StreamerSettings,
    cache: Arc<ConnectionCache>,
    order: ByteOrder,
    stats: Arc<StreamStats>,
) {
    let workers = settings.workers.max(1);
    let mut shards = Vec::with_capacity(workers);

    for id in 0..workers {
        let (tx, rx) = mpsc::channel(settings.queue_len.max(1));
        shards.push(tx);
        let cache = Arc::clone(&cache);
        let stats = Arc::clone(&stats);
        group.spawn(format!("stream-worker-{id}"), move |stop| {
            run_worker(id, rx, cache, order, stats, stop)
        });
    }

    let readers = sources.len();
    for source in sources {
        let shards = shards.clone();
        let stats = Arc::clone(&stats);
        group.spawn(format!("stream-reader-{}", source.name()), move |stop| {
            run_reader(source, shards, stats, stop)
        });
    }

    debug!("Event streamer started: {} readers, {} workers", readers, workers);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Protocol, SocketIdentity};
    use std::time::Duration;

    struct ChannelSource {
        name: String,
        rx: mpsc::Receiver<(Vec<Bytes>, u64)>,
    }

    #[async_trait]
    impl EventSource for ChannelSource {
        fn name(&self) -> String {
            self.name.clone()
        }

        async fn next_batch(&mut self, out: &mut Vec<Bytes>) -> Result<u64, SourceError> {
            let (batch, lost) = self.rx.recv().await.ok_or(SourceError::Closed)?;
            out.extend(batch);
            Ok(lost)
        }
    }

    fn source(name: &str) -> (mpsc::Sender<(Vec<Bytes>, u64)>, Box<dyn EventSource>) {
        let (tx, rx) = mpsc::channel(16);
        let source = ChannelSource {
            name: name.to_string(),
            rx,
        };
        (tx, Box::new(source))
    }

    fn identity(inode: u64) -> SocketIdentity {
        SocketIdentity::new(
            Protocol::Udp,
            "10.0.0.2".parse().unwrap(),
            33000,
            "1.1.1.1".parse().unwrap(),
            53,
            inode,
        )
    }

    fn record(kind: EventKind, inode: u64, pid: i32, seq: u64) -> Bytes {
        let event = SocketEvent {
            kind,
            identity: identity(inode),
            pid,
            uid: 0,
            seq,
        };
        Bytes::copy_from_slice(&event.encode(ByteOrder::detect()))
    }

    async fn wait_for<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_shard_ignores_kind_and_seq() {
        let created = record(EventKind::Created, 7, 100, 1);
        let destroyed = record(EventKind::Destroyed, 7, 0, 2);
        for shards in 1..8 {
            assert_eq!(shard_of(&created, shards), shard_of(&destroyed, shards));
        }
        assert_eq!(shard_of(&[1, 2, 3], 4), shard_of(&[1, 2, 3], 4));
    }

    #[tokio::test]
    async fn test_malformed_then_valid() {
        let cache = Arc::new(ConnectionCache::new());
        let stats = Arc::new(StreamStats::default());
        let mut group = TaskGroup::new();
        let (tx, src) = source("cpu0");
        spawn_streamer(
            &mut group,
            vec![src],
            StreamerSettings::default(),
            Arc::clone(&cache),
            ByteOrder::detect(),
            Arc::clone(&stats),
        );

        let mut garbage = vec![0xffu8; 64];
        garbage[0] = 42;
        tx.send((
            vec![Bytes::from(garbage), record(EventKind::Created, 1, 900, 5)],
            0,
        ))
        .await
        .unwrap();

        wait_for(|| cache.get(&identity(1)) == Some(900)).await;
        wait_for(|| stats.snapshot().malformed == 1).await;
        assert_eq!(stats.snapshot().applied, 1);

        group.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_destroy_across_buffers() {
        let cache = Arc::new(ConnectionCache::new());
        let stats = Arc::new(StreamStats::default());
        let mut group = TaskGroup::new();
        let (tx0, src0) = source("cpu0");
        let (tx1, src1) = source("cpu1");
        spawn_streamer(
            &mut group,
            vec![src0, src1],
            StreamerSettings {
                workers: 3,
                queue_len: 8,
            },
            Arc::clone(&cache),
            ByteOrder::detect(),
            Arc::clone(&stats),
        );

        // destroy observed on one CPU before the create from another
        tx1.send((vec![record(EventKind::Destroyed, 2, 0, 20)], 0))
            .await
            .unwrap();
        tx0.send((vec![record(EventKind::Created, 2, 77, 10)], 3))
            .await
            .unwrap();

        wait_for(|| stats.snapshot().received == 2).await;
        wait_for(|| stats.snapshot().applied + stats.snapshot().superseded == 2).await;
        assert_eq!(cache.get(&identity(2)), None);
        assert_eq!(stats.snapshot().lost, 3);

        group.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_with_idle_sources() {
        let cache = Arc::new(ConnectionCache::new());
        let mut group = TaskGroup::new();
        let (_tx, src) = source("cpu0");
        spawn_streamer(
            &mut group,
            vec![src],
            StreamerSettings::default(),
            cache,
            ByteOrder::detect(),
            Arc::new(StreamStats::default()),
        );
        assert_eq!(group.len(), 5);
        group.shutdown(Duration::from_secs(1)).await.unwrap();
    }
}
