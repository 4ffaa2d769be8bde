//! Socket identity types shared by every stage
//!
//! A [`SocketIdentity`] names one socket at one point in time. Inode numbers
//! are recycled by the kernel after close, so an identity is only meaningful
//! while the socket it was taken from is alive.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Process ID as reported to consumers
pub type Pid = i32;

/// Sentinel for a socket whose owning process could not be determined
pub const UNRESOLVED_PID: Pid = -1;

/// Address family of a socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    Inet,
    Inet6,
}

impl AddressFamily {
    /// `AF_INET` on Linux
    pub const AF_INET: u8 = 2;
    /// `AF_INET6` on Linux
    pub const AF_INET6: u8 = 10;

    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            Self::AF_INET => Some(Self::Inet),
            Self::AF_INET6 => Some(Self::Inet6),
            _ => None,
        }
    }

    pub fn as_raw(self) -> u8 {
        match self {
            Self::Inet => Self::AF_INET,
            Self::Inet6 => Self::AF_INET6,
        }
    }

    /// Address width in bytes
    pub fn addr_len(self) -> usize {
        match self {
            Self::Inet => 4,
            Self::Inet6 => 16,
        }
    }

    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Self::Inet,
            IpAddr::V6(_) => Self::Inet6,
        }
    }

    /// Unspecified address of this family
    pub fn unspecified(self) -> IpAddr {
        match self {
            Self::Inet => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Self::Inet6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inet => write!(f, "ipv4"),
            Self::Inet6 => write!(f, "ipv6"),
        }
    }
}

/// Transport protocol of a socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub const IPPROTO_TCP: u8 = 6;
    pub const IPPROTO_UDP: u8 = 17;

    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            Self::IPPROTO_TCP => Some(Self::Tcp),
            Self::IPPROTO_UDP => Some(Self::Udp),
            _ => None,
        }
    }

    pub fn as_raw(self) -> u8 {
        match self {
            Self::Tcp => Self::IPPROTO_TCP,
            Self::Udp => Self::IPPROTO_UDP,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

/// One kernel-resident map per (protocol, family) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MapKind {
    Tcp,
    Tcp6,
    Udp,
    Udp6,
}

impl MapKind {
    pub const ALL: [MapKind; 4] = [MapKind::Tcp, MapKind::Tcp6, MapKind::Udp, MapKind::Udp6];

    pub fn new(protocol: Protocol, family: AddressFamily) -> Self {
        match (protocol, family) {
            (Protocol::Tcp, AddressFamily::Inet) => Self::Tcp,
            (Protocol::Tcp, AddressFamily::Inet6) => Self::Tcp6,
            (Protocol::Udp, AddressFamily::Inet) => Self::Udp,
            (Protocol::Udp, AddressFamily::Inet6) => Self::Udp6,
        }
    }

    pub fn protocol(self) -> Protocol {
        match self {
            Self::Tcp | Self::Tcp6 => Protocol::Tcp,
            Self::Udp | Self::Udp6 => Protocol::Udp,
        }
    }

    pub fn family(self) -> AddressFamily {
        match self {
            Self::Tcp | Self::Udp => AddressFamily::Inet,
            Self::Tcp6 | Self::Udp6 => AddressFamily::Inet6,
        }
    }

    /// Name of the map inside the probe object
    pub fn map_name(self) -> &'static str {
        match self {
            Self::Tcp => "tcpMap",
            Self::Tcp6 => "tcpv6Map",
            Self::Udp => "udpMap",
            Self::Udp6 => "udpv6Map",
        }
    }
}

impl fmt::Display for MapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Tcp6 => write!(f, "tcp6"),
            Self::Udp => write!(f, "udp"),
            Self::Udp6 => write!(f, "udp6"),
        }
    }
}

/// Connection tuple without the inode, for callers that only see packets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub protocol: Protocol,
    pub src: IpAddr,
    pub src_port: u16,
    pub dst: IpAddr,
    pub dst_port: u16,
}

impl FlowKey {
    pub fn new(protocol: Protocol, src: IpAddr, src_port: u16, dst: IpAddr, dst_port: u16) -> Self {
        Self {
            protocol,
            src,
            src_port,
            dst,
            dst_port,
        }
    }

    pub fn family(&self) -> AddressFamily {
        AddressFamily::of(&self.src)
    }

    pub fn map_kind(&self) -> MapKind {
        MapKind::new(self.protocol, self.family())
    }
}

/// Identity of one socket: family, protocol, four-tuple and kernel inode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketIdentity {
    pub family: AddressFamily,
    pub protocol: Protocol,
    pub src: IpAddr,
    pub src_port: u16,
    pub dst: IpAddr,
    pub dst_port: u16,
    pub inode: u64,
}

impl SocketIdentity {
    pub fn new(
        protocol: Protocol,
        src: IpAddr,
        src_port: u16,
        dst: IpAddr,
        dst_port: u16,
        inode: u64,
    ) -> Self {
        Self {
            family: AddressFamily::of(&src),
            protocol,
            src,
            src_port,
            dst,
            dst_port,
            inode,
        }
    }

    pub fn flow(&self) -> FlowKey {
        FlowKey::new(self.protocol, self.src, self.src_port, self.dst, self.dst_port)
    }

    pub fn map_kind(&self) -> MapKind {
        MapKind::new(self.protocol, self.family)
    }

    /// Key handed to the inode resolver to tell apart sockets that reused
    /// the same inode number: `"<inode> <src> <sport> <dst> <dport>"`.
    pub fn disambiguation_key(&self) -> String {
        format!(
            "{} {} {} {} {}",
            self.inode, self.src, self.src_port, self.dst, self.dst_port
        )
    }
}

impl fmt::Display for SocketIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {} (inode {})",
            self.protocol,
            std::net::SocketAddr::new(self.src, self.src_port),
            std::net::SocketAddr::new(self.dst, self.dst_port),
            self.inode
        )
    }
}

/// A socket together with the process that owns it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedConnection {
    pub identity: SocketIdentity,
    pub pid: Pid,
}

impl ResolvedConnection {
    pub fn new(identity: SocketIdentity, pid: Pid) -> Self {
        Self { identity, pid }
    }

    pub fn is_resolved(&self) -> bool {
        self.pid != UNRESOLVED_PID
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> SocketIdentity {
        SocketIdentity::new(
            Protocol::Tcp,
            "10.0.0.5".parse().unwrap(),
            51234,
            "93.184.216.34".parse().unwrap(),
            443,
            884422,
        )
    }

    #[test]
    fn test_family_follows_source_address() {
        assert_eq!(identity().family, AddressFamily::Inet);
        let v6 = SocketIdentity::new(
            Protocol::Udp,
            "::1".parse().unwrap(),
            53,
            "::1".parse().unwrap(),
            40000,
            7,
        );
        assert_eq!(v6.family, AddressFamily::Inet6);
        assert_eq!(v6.map_kind(), MapKind::Udp6);
    }

    #[test]
    fn test_disambiguation_key() {
        assert_eq!(
            identity().disambiguation_key(),
            "884422 10.0.0.5 51234 93.184.216.34 443"
        );
    }

    #[test]
    fn test_map_kind_round_trip() {
        for kind in MapKind::ALL {
            assert_eq!(MapKind::new(kind.protocol(), kind.family()), kind);
        }
        assert_eq!(MapKind::Tcp6.map_name(), "tcpv6Map");
    }

    #[test]
    fn test_raw_constants() {
        assert_eq!(AddressFamily::from_raw(2), Some(AddressFamily::Inet));
        assert_eq!(AddressFamily::from_raw(10), Some(AddressFamily::Inet6));
        assert_eq!(AddressFamily::from_raw(1), None);
        assert_eq!(Protocol::from_raw(6), Some(Protocol::Tcp));
        assert_eq!(Protocol::from_raw(17), Some(Protocol::Udp));
        assert_eq!(Protocol::from_raw(1), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(
            identity().to_string(),
            "tcp 10.0.0.5:51234 -> 93.184.216.34:443 (inode 884422)"
        );
    }
}
