//! Socket lifecycle events emitted by the kernel probes
//!
//! Every event is a fixed 64-byte record in host byte order:
//!
//! ```text
//! 0  kind      u8   1 = created, 2 = destroyed
//! 1  family    u8   AF_INET / AF_INET6
//! 2  protocol  u8   IPPROTO_TCP / IPPROTO_UDP
//! 3  pad
//! 4  pid       u32
//! 8  seq       u64  bpf_ktime_get_ns() at emission
//! 16 inode     u64
//! 24 sport     u16
//! 26 dport     u16
//! 28 uid       u32
//! 32 saddr     [u8; 16]  IPv4 in the first 4 bytes
//! 48 daddr     [u8; 16]
//! ```

use crate::byte_order::ByteOrder;
use crate::error::DecodeError;
use crate::types::{AddressFamily, Pid, Protocol, SocketIdentity, UNRESOLVED_PID};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Size of one event record
pub const EVENT_SIZE: usize = 64;

const KIND: usize = 0;
const FAMILY: usize = 1;
const PROTOCOL: usize = 2;
const PID: usize = 4;
const SEQ: usize = 8;
const INODE: usize = 16;
const SPORT: usize = 24;
const DPORT: usize = 26;
const UID: usize = 28;
const SADDR: usize = 32;
const DADDR: usize = 48;

/// Byte ranges that identify the socket an event belongs to
/// (family, protocol, inode, ports, addresses).
pub const IDENTITY_RANGES: [std::ops::Range<usize>; 3] =
    [FAMILY..PROTOCOL + 1, INODE..UID, SADDR..EVENT_SIZE];

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Created = 1,
    Destroyed = 2,
}

impl EventKind {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Created),
            2 => Some(Self::Destroyed),
            _ => None,
        }
    }
}

/// Decoded kernel event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketEvent {
    pub kind: EventKind,
    pub identity: SocketIdentity,
    pub pid: Pid,
    pub uid: u32,
    pub seq: u64,
}

impl SocketEvent {
    pub fn decode(buf: &[u8], order: ByteOrder) -> Result<Self, DecodeError> {
        if buf.len() < EVENT_SIZE {
            return Err(DecodeError::Truncated {
                len: buf.len(),
                expected: EVENT_SIZE,
            });
        }

        let kind = EventKind::from_raw(buf[KIND]).ok_or(DecodeError::UnknownKind(buf[KIND]))?;
        let family =
            AddressFamily::from_raw(buf[FAMILY]).ok_or(DecodeError::UnknownFamily(buf[FAMILY]))?;
        let protocol = Protocol::from_raw(buf[PROTOCOL])
            .ok_or(DecodeError::UnknownProtocol(buf[PROTOCOL]))?;

        // length was checked above, the reads cannot come up short
        let pid = order.read_u32(&buf[PID..]).unwrap_or_default();
        let uid = order.read_u32(&buf[UID..]).unwrap_or_default();
        let identity = SocketIdentity {
            family,
            protocol,
            src: read_addr(&buf[SADDR..DADDR], family),
            src_port: order.read_u16(&buf[SPORT..]).unwrap_or_default(),
            dst: read_addr(&buf[DADDR..EVENT_SIZE], family),
            dst_port: order.read_u16(&buf[DPORT..]).unwrap_or_default(),
            inode: order.read_u64(&buf[INODE..]).unwrap_or_default(),
        };

        Ok(Self {
            kind,
            identity,
            pid: Pid::try_from(pid).unwrap_or(UNRESOLVED_PID),
            uid,
            seq: order.read_u64(&buf[SEQ..]).unwrap_or_default(),
        })
    }

    /// Serialize back to the kernel layout. Used by fake event sources.
    pub fn encode(&self, order: ByteOrder) -> [u8; EVENT_SIZE] {
        let mut buf = [0u8; EVENT_SIZE];
        let id = &self.identity;
        buf[KIND] = self.kind as u8;
        buf[FAMILY] = id.family.as_raw();
        buf[PROTOCOL] = id.protocol.as_raw();
        buf[PID..PID + 4].copy_from_slice(&order.u32_bytes(self.pid as u32));
        buf[SEQ..SEQ + 8].copy_from_slice(&order.u64_bytes(self.seq));
        buf[INODE..INODE + 8].copy_from_slice(&order.u64_bytes(id.inode));
        buf[SPORT..SPORT + 2].copy_from_slice(&order.u16_bytes(id.src_port));
        buf[DPORT..DPORT + 2].copy_from_slice(&order.u16_bytes(id.dst_port));
        buf[UID..UID + 4].copy_from_slice(&order.u32_bytes(self.uid));
        write_addr(&id.src, &mut buf[SADDR..DADDR]);
        write_addr(&id.dst, &mut buf[DADDR..EVENT_SIZE]);
        buf
    }
}

fn read_addr(slot: &[u8], family: AddressFamily) -> IpAddr {
    match family {
        AddressFamily::Inet => IpAddr::V4(Ipv4Addr::new(slot[0], slot[1], slot[2], slot[3])),
        AddressFamily::Inet6 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&slot[..16]);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
    }
}

fn write_addr(ip: &IpAddr, slot: &mut [u8]) {
    match ip {
        IpAddr::V4(addr) => slot[..4].copy_from_slice(&addr.octets()),
        IpAddr::V6(addr) => slot[..16].copy_from_slice(&addr.octets()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn created() -> SocketEvent {
        SocketEvent {
            kind: EventKind::Created,
            identity: SocketIdentity::new(
                Protocol::Tcp,
                "10.1.2.3".parse().unwrap(),
                40000,
                "8.8.8.8".parse().unwrap(),
                53,
                1234,
            ),
            pid: 555,
            uid: 1000,
            seq: 42,
        }
    }

    #[test]
    fn test_decode_v4_layout() {
        let mut buf = [0u8; EVENT_SIZE];
        buf[0] = 1;
        buf[1] = 2;
        buf[2] = 17;
        buf[4..8].copy_from_slice(&77u32.to_le_bytes());
        buf[8..16].copy_from_slice(&9u64.to_le_bytes());
        buf[16..24].copy_from_slice(&31337u64.to_le_bytes());
        buf[24..26].copy_from_slice(&5353u16.to_le_bytes());
        buf[26..28].copy_from_slice(&53u16.to_le_bytes());
        buf[28..32].copy_from_slice(&1000u32.to_le_bytes());
        buf[32..36].copy_from_slice(&[192, 168, 0, 2]);
        buf[48..52].copy_from_slice(&[192, 168, 0, 1]);

        let event = SocketEvent::decode(&buf, ByteOrder::Little).unwrap();
        assert_eq!(event.kind, EventKind::Created);
        assert_eq!(event.pid, 77);
        assert_eq!(event.seq, 9);
        assert_eq!(event.uid, 1000);
        assert_eq!(event.identity.protocol, Protocol::Udp);
        assert_eq!(event.identity.inode, 31337);
        assert_eq!(event.identity.src, "192.168.0.2".parse::<IpAddr>().unwrap());
        assert_eq!(event.identity.dst_port, 53);
    }

    #[test]
    fn test_decode_v6() {
        let mut event = created();
        event.kind = EventKind::Destroyed;
        event.identity = SocketIdentity::new(
            Protocol::Tcp,
            "2001:db8::5".parse().unwrap(),
            443,
            "2001:db8::9".parse().unwrap(),
            60000,
            8,
        );
        let order = ByteOrder::detect();
        assert_eq!(SocketEvent::decode(&event.encode(order), order).unwrap(), event);
    }

    #[test]
    fn test_decode_truncated() {
        let buf = created().encode(ByteOrder::Little);
        assert_eq!(
            SocketEvent::decode(&buf[..40], ByteOrder::Little),
            Err(DecodeError::Truncated {
                len: 40,
                expected: EVENT_SIZE
            })
        );
    }

    #[test]
    fn test_decode_rejects_unknown_fields() {
        let good = created().encode(ByteOrder::Little);

        let mut bad = good;
        bad[0] = 9;
        assert_eq!(
            SocketEvent::decode(&bad, ByteOrder::Little),
            Err(DecodeError::UnknownKind(9))
        );

        let mut bad = good;
        bad[1] = 1;
        assert_eq!(
            SocketEvent::decode(&bad, ByteOrder::Little),
            Err(DecodeError::UnknownFamily(1))
        );

        let mut bad = good;
        bad[2] = 1;
        assert_eq!(
            SocketEvent::decode(&bad, ByteOrder::Little),
            Err(DecodeError::UnknownProtocol(1))
        );
    }

    #[test]
    fn test_identity_ranges_skip_kind_pid_seq_uid() {
        let a = created().encode(ByteOrder::Little);
        let mut other = created();
        other.kind = EventKind::Destroyed;
        other.pid = 1;
        other.seq = 99;
        other.uid = 0;
        let b = other.encode(ByteOrder::Little);
        for range in IDENTITY_RANGES {
            assert_eq!(a[range.clone()], b[range]);
        }
    }
}
