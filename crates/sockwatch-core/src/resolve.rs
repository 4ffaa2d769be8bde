//! Four-tuple resolution across the stores
//!
//! The cache answers first. On a miss the kernel map is consulted and a hit
//! is written back through the sequence check, so a map value left behind
//! by a closed socket cannot override the tombstone its destroy event left.
//! The baseline is the last resort.

use crate::baseline::EstablishedBaselineSet;
use crate::cache::ConnectionCache;
use crate::collab::KernelMaps;
use crate::types::{FlowKey, ResolvedConnection, SocketIdentity};
use tracing::trace;

pub fn resolve_flow(
    cache: &ConnectionCache,
    kernel: &dyn KernelMaps,
    baseline: &EstablishedBaselineSet,
    flow: &FlowKey,
) -> Option<ResolvedConnection> {
    if let Some((id, pid)) = cache.find_by_flow(flow) {
        return Some(ResolvedConnection::new(id, pid));
    }

    // the map key does not include the inode
    let key = SocketIdentity::new(
        flow.protocol,
        flow.src,
        flow.src_port,
        flow.dst,
        flow.dst_port,
        0,
    );
    if let Some(value) = kernel.lookup(&key) {
        let id = SocketIdentity {
            inode: value.inode,
            ..key
        };
        let pid = value.pid();
        if cache.apply_created(id, pid, value.seq) {
            return Some(ResolvedConnection::new(id, pid));
        }
        trace!("Stale map value for {} (seq {})", id.disambiguation_key(), value.seq);
    }

    baseline
        .find_by_flow(flow)
        .map(|(id, pid)| ResolvedConnection::new(id, pid))
}
