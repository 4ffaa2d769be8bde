//! Background monitors
//!
//! Four periodic passes keep the cache and baseline honest while the probes
//! run: cache sweep, kernel map check, local address tracking and baseline
//! maintenance. Each pass is a plain function over a [`MonitorContext`] so
//! it can be driven directly in tests; [`spawn_monitors`] schedules them.
//! Passes do blocking I/O and run on the blocking pool.

use crate::baseline::{self, EstablishedBaselineSet, MaintenanceReport};
use crate::cache::ConnectionCache;
use crate::collab::{AddressSource, InodeResolver, KernelMaps, SocketDumper};
use crate::config::MonitorSettings;
use crate::local_addrs::LocalAddressSet;
use crate::tasks::{run_periodic, TaskGroup};
use crate::types::{AddressFamily, Protocol};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Everything the monitors read and write
#[derive(Clone)]
pub struct MonitorContext {
    pub cache: Arc<ConnectionCache>,
    pub baseline: Arc<EstablishedBaselineSet>,
    pub local: Arc<LocalAddressSet>,
    pub kernel: Arc<dyn KernelMaps>,
    pub dumper: Arc<dyn SocketDumper>,
    pub resolver: Arc<dyn InodeResolver>,
    pub addresses: Arc<dyn AddressSource>,
    pub families: Vec<AddressFamily>,
    pub settings: MonitorSettings,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub evicted: usize,
    pub tombstones_pruned: usize,
}

/// Evict stale cache entries whose socket is gone
///
/// An entry counts as gone when the kernel map no longer holds its inode
/// and, if the live socket table could be read, the table does not list
/// the inode either.
pub fn sweep_cache(ctx: &MonitorContext) -> SweepReport {
    let mut report = SweepReport::default();
    let stale = ctx
        .cache
        .snapshot_older_than(ctx.settings.cache_entry_ttl());
    report.checked = stale.len();

    let mut live: HashMap<(AddressFamily, Protocol), Option<HashSet<u64>>> = HashMap::new();
    for entry in &stale {
        let id = &entry.identity;
        let in_kernel = ctx
            .kernel
            .lookup(id)
            .is_some_and(|value| value.inode == id.inode);
        if in_kernel {
            continue;
        }

        let inodes = live
            .entry((id.family, id.protocol))
            .or_insert_with(|| match ctx.dumper.dump(id.family, id.protocol) {
                Ok(sockets) => Some(sockets.iter().map(|s| s.identity.inode).collect()),
                Err(e) => {
                    debug!(
                        "Cache sweep without live table for {}/{}: {}",
                        id.protocol, id.family, e
                    );
                    None
                }
            });
        if inodes.as_ref().is_some_and(|set| set.contains(&id.inode)) {
            continue;
        }

        if ctx.cache.remove_if_unchanged(entry) {
            report.evicted += 1;
        }
    }

    report.tombstones_pruned = ctx.cache.prune_tombstones(ctx.settings.tombstone_ttl());

    if report.evicted > 0 {
        info!(
            "Cache sweep evicted {} of {} stale entries",
            report.evicted, report.checked
        );
    } else {
        debug!("Cache sweep: {:?}", report);
    }
    report
}

/// Revalidate kernel map handles, reopening stale ones
pub fn check_maps(ctx: &MonitorContext) -> usize {
    let reopened = ctx.kernel.revalidate();
    if reopened > 0 {
        warn!("Reopened {} kernel map handles", reopened);
    }
    reopened
}

pub fn refresh_local_addresses(ctx: &MonitorContext) -> bool {
    ctx.local.refresh(ctx.addresses.as_ref())
}

pub fn maintain_baseline(ctx: &MonitorContext) -> MaintenanceReport {
    let report = baseline::maintain(
        &ctx.baseline,
        &ctx.families,
        ctx.dumper.as_ref(),
        ctx.resolver.as_ref(),
    );
    if report != MaintenanceReport::default() {
        debug!(
            "Baseline maintenance pruned {}, resolved {}",
            report.pruned, report.resolved
        );
    }
    report
}

async fn on_blocking_pool<F>(name: &'static str, pass: F)
where
    F: FnOnce() + Send + 'static,
{
    if let Err(e) = tokio::task::spawn_blocking(pass).await {
        warn!("{} pass panicked: {}", name, e);
    }
}

fn spawn_monitor<F>(
    group: &mut TaskGroup,
    name: &'static str,
    period: std::time::Duration,
    ctx: &MonitorContext,
    pass: F,
) where
    F: Fn(&MonitorContext) + Copy + Send + Sync + 'static,
{
    let ctx = ctx.clone();
    group.spawn(name, move |stop| async move {
        run_periodic(name, period, stop, || {
            let ctx = ctx.clone();
            on_blocking_pool(name, move || pass(&ctx))
        })
        .await;
    });
}

/// Start all four monitors in `group`
pub fn spawn_monitors(group: &mut TaskGroup, ctx: &MonitorContext) {
    let s = &ctx.settings;
    spawn_monitor(group, "cache-sweep", s.cache_sweep_interval(), ctx, |c| {
        sweep_cache(c);
    });
    spawn_monitor(group, "map-check", s.map_check_interval(), ctx, |c| {
        check_maps(c);
    });
    spawn_monitor(group, "local-addresses", s.local_addr_interval(), ctx, |c| {
        refresh_local_addresses(c);
    });
    spawn_monitor(group, "baseline", s.baseline_interval(), ctx, |c| {
        maintain_baseline(c);
    });
    info!("Background monitors started");
}
