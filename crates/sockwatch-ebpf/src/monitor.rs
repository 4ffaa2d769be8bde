//! The running resolver
//!
//! [`EbpfMonitor`] owns everything `start` brings up and is the only handle
//! consumers need. Dropping it without `stop` still detaches the probes, but
//! skips the orderly drain.

use crate::interfaces::IfAddrSource;
use crate::loader;
use crate::maps::KernelMapSet;
use crate::perf;
use crate::probe::AyaProbeLoader;
use crate::procfs::{ProcFdResolver, ProcNetDumper};
use aya::maps::perf::AsyncPerfEventArray;
use aya::maps::MapData;
use aya::Ebpf;
use sockwatch_core::baseline;
use sockwatch_core::monitors::{self, MonitorContext};
use sockwatch_core::streamer::{self, StreamStatsSnapshot};
use sockwatch_core::{
    load_with_recovery, resolve_flow, AddressFamily, ByteOrder, ConnectionCache,
    EstablishedBaselineSet, FlowKey, KernelMaps, LocalAddressSet, Pid, ResolvedConnection,
    ShutdownError, SocketIdentity, SockwatchConfig, StartError, StreamStats, TaskGroup,
};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct EbpfMonitor {
    cache: Arc<ConnectionCache>,
    baseline: Arc<EstablishedBaselineSet>,
    local: Arc<LocalAddressSet>,
    maps: Arc<KernelMapSet>,
    stats: Arc<StreamStats>,
    tasks: TaskGroup,
    drain: Duration,
    perf: AsyncPerfEventArray<MapData>,
    ebpf: Ebpf,
}

impl EbpfMonitor {
    /// Bring up probes, baseline, streamer and monitors
    ///
    /// The baseline scan runs on the blocking pool and completes before any
    /// task is spawned.
    pub async fn start(config: &SockwatchConfig) -> Result<Self, StartError> {
        let probe = &config.probe;

        loader::ensure_debugfs(&probe.debugfs_path)?;
        loader::bump_memlock_rlimit();

        let mut probe_loader =
            AyaProbeLoader::new(probe.object_path.clone(), probe.kprobes.clone());
        let mut ebpf = load_with_recovery(&mut probe_loader)?;
        info!("Kernel probes attached from {}", probe.object_path.display());

        let order = ByteOrder::detect();
        debug!("Host byte order: {:?}", order);
        let maps = Arc::new(KernelMapSet::take_from(&mut ebpf, order)?);

        let families = if probe.ipv6 {
            vec![AddressFamily::Inet, AddressFamily::Inet6]
        } else {
            vec![AddressFamily::Inet]
        };
        let dumper = Arc::new(ProcNetDumper::new("/proc", order));
        let resolver = Arc::new(ProcFdResolver::default());
        let baseline = Arc::new(EstablishedBaselineSet::new());
        {
            let (baseline, dumper, resolver) =
                (Arc::clone(&baseline), Arc::clone(&dumper), Arc::clone(&resolver));
            let families = families.clone();
            let scan = tokio::task::spawn_blocking(move || {
                for family in families {
                    baseline::populate(&baseline, family, dumper.as_ref(), resolver.as_ref());
                }
            });
            if let Err(e) = scan.await {
                warn!("Baseline scan did not complete: {}", e);
            }
        }

        let local = Arc::new(LocalAddressSet::new());
        let addresses = Arc::new(IfAddrSource);
        local.refresh(addresses.as_ref());

        let cache = Arc::new(ConnectionCache::new());
        let stats = Arc::new(StreamStats::default());
        let mut tasks = TaskGroup::new();

        let (perf, sources) = perf::open_sources(&mut ebpf, &config.streamer)?;
        streamer::spawn_streamer(
            &mut tasks,
            sources,
            config.streamer.settings(),
            Arc::clone(&cache),
            order,
            Arc::clone(&stats),
        );

        let kernel: Arc<dyn KernelMaps> = maps.clone();
        let ctx = MonitorContext {
            cache: Arc::clone(&cache),
            baseline: Arc::clone(&baseline),
            local: Arc::clone(&local),
            kernel,
            dumper,
            resolver,
            addresses,
            families,
            settings: config.monitors.clone(),
        };
        monitors::spawn_monitors(&mut tasks, &ctx);

        info!(
            "sockwatch started: {} baseline connections, {} local addresses, {} tasks",
            baseline.len(),
            local.len(),
            tasks.len()
        );

        Ok(Self {
            cache,
            baseline,
            local,
            maps,
            stats,
            tasks,
            drain: config.shutdown.drain_timeout(),
            perf,
            ebpf,
        })
    }

    /// Stop every task, then release the cache, maps, perf buffers and the
    /// probe object in that order
    ///
    /// Resources are released even when the drain times out; the timeout is
    /// still reported.
    pub async fn stop(self) -> Result<(), ShutdownError> {
        let Self {
            cache,
            baseline,
            local,
            maps,
            stats,
            tasks,
            drain,
            perf,
            ebpf,
        } = self;

        let drained = tasks.shutdown(drain).await;

        cache.clear();
        drop(maps);
        drop(perf);
        drop(ebpf);
        drop((baseline, local, stats));

        info!("sockwatch stopped");
        drained
    }

    /// Owner of a socket as currently known to the cache
    pub fn lookup(&self, id: &SocketIdentity) -> Option<Pid> {
        self.cache.get(id)
    }

    /// Owner of a socket that predates the probes
    pub fn lookup_established(&self, id: &SocketIdentity) -> Option<Pid> {
        self.baseline.get(id)
    }

    /// Resolve a four-tuple: cache first, then the kernel map, then the
    /// baseline. A kernel map hit is written back into the cache unless a
    /// newer destroy already closed that socket.
    pub fn resolve(&self, flow: &FlowKey) -> Option<ResolvedConnection> {
        resolve_flow(&self.cache, self.maps.as_ref(), &self.baseline, flow)
    }

    pub fn is_local_address(&self, ip: &IpAddr) -> bool {
        self.local.contains(ip)
    }

    pub fn stats(&self) -> StreamStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn baseline_len(&self) -> usize {
        self.baseline.len()
    }
}
