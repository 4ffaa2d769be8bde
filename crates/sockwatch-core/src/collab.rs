//! Seams to the outside world
//!
//! The cache, baseline and monitors are written against these traits so
//! they can run against fakes in tests. Linux implementations live in
//! `sockwatch-ebpf`.

use crate::error::{DumpError, ResolutionError};
use crate::layout::MapValue;
use crate::types::{AddressFamily, Pid, Protocol, SocketIdentity};
use std::net::IpAddr;

/// `TCP_ESTABLISHED` from `include/net/tcp_states.h`
pub const TCP_ESTABLISHED: u8 = 1;

/// One socket as reported by a kernel dump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumpedSocket {
    pub identity: SocketIdentity,
    pub state: u8,
    pub uid: u32,
}

impl DumpedSocket {
    pub fn is_established(&self) -> bool {
        self.state == TCP_ESTABLISHED
    }
}

/// Enumerates live sockets for one family and protocol
pub trait SocketDumper: Send + Sync {
    fn dump(
        &self,
        family: AddressFamily,
        protocol: Protocol,
    ) -> Result<Vec<DumpedSocket>, DumpError>;
}

/// Finds the process holding a socket inode
pub trait InodeResolver: Send + Sync {
    /// `key` is [`SocketIdentity::disambiguation_key`]; implementations may
    /// use it to memoize across inode reuse.
    fn resolve(&self, inode: u64, key: &str) -> Result<Pid, ResolutionError>;
}

/// Lists the addresses currently configured on the host
pub trait AddressSource: Send + Sync {
    fn local_addresses(&self) -> std::io::Result<Vec<IpAddr>>;
}

/// Read access to the kernel-resident socket maps
pub trait KernelMaps: Send + Sync {
    fn lookup(&self, id: &SocketIdentity) -> Option<MapValue>;

    /// Check every handle and reopen stale ones. Returns how many were reopened.
    fn revalidate(&self) -> usize;
}
