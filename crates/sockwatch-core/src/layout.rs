//! Binary layouts shared with the kernel
//!
//! These layouts mirror the probe object's map definitions and the
//! `bpf(2)` attribute union, and must be kept in sync with them:
//!
//! - lookup request: `map_fd` (u32, padded to 8 bytes so that the following
//!   `__aligned_u64` pointers sit on 8-byte boundaries), key pointer, value
//!   pointer, flags, zero tail; 40 bytes in total
//! - map key: local port (host order), remote port (network order), local
//!   address, remote address; 12 bytes for IPv4, 36 for IPv6
//! - map value: pid, uid, inode, sequence; 24 bytes in host order

use crate::byte_order::ByteOrder;
use crate::types::{AddressFamily, Pid, SocketIdentity, UNRESOLVED_PID};
use std::net::IpAddr;

/// `BPF_MAP_LOOKUP_ELEM` command number
pub const BPF_MAP_LOOKUP_ELEM: u32 = 1;

/// Size passed to the kernel along with the request
pub const LOOKUP_REQUEST_SIZE: usize = 40;

pub const MAP_FD_OFFSET: usize = 0;
pub const KEY_PTR_OFFSET: usize = 8;
pub const VALUE_PTR_OFFSET: usize = 16;
pub const FLAGS_OFFSET: usize = 24;

/// Largest map key (IPv6)
pub const MAX_KEY_SIZE: usize = 36;

/// Size of a map value
pub const MAP_VALUE_SIZE: usize = 24;

/// Fixed-layout `BPF_MAP_LOOKUP_ELEM` request
///
/// Lives on the caller's stack; the kernel only ever sees a pointer to the
/// bytes.
#[derive(Clone, Copy)]
#[repr(C, align(8))]
pub struct LookupRequest {
    bytes: [u8; LOOKUP_REQUEST_SIZE],
}

impl LookupRequest {
    /// Serialize a request. `key` and `value` are user-space addresses.
    pub fn new(map_fd: u32, key: u64, value: u64, order: ByteOrder) -> Self {
        let mut bytes = [0u8; LOOKUP_REQUEST_SIZE];
        bytes[MAP_FD_OFFSET..MAP_FD_OFFSET + 4].copy_from_slice(&order.u32_bytes(map_fd));
        bytes[KEY_PTR_OFFSET..KEY_PTR_OFFSET + 8].copy_from_slice(&order.u64_bytes(key));
        bytes[VALUE_PTR_OFFSET..VALUE_PTR_OFFSET + 8].copy_from_slice(&order.u64_bytes(value));
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; LOOKUP_REQUEST_SIZE] {
        &self.bytes
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.bytes.as_ptr()
    }
}

impl std::fmt::Debug for LookupRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LookupRequest")
            .field("bytes", &self.bytes)
            .finish()
    }
}

/// Length of the map key for a family
pub fn key_len(family: AddressFamily) -> usize {
    4 + 2 * family.addr_len()
}

/// Encode the map key for `id` into `out`, returning the key length
pub fn encode_key(id: &SocketIdentity, order: ByteOrder, out: &mut [u8; MAX_KEY_SIZE]) -> usize {
    let width = id.family.addr_len();
    out[0..2].copy_from_slice(&order.u16_bytes(id.src_port));
    out[2..4].copy_from_slice(&id.dst_port.to_be_bytes());
    write_addr(&id.src, id.family, &mut out[4..4 + width]);
    write_addr(&id.dst, id.family, &mut out[4 + width..4 + 2 * width]);
    key_len(id.family)
}

fn write_addr(ip: &IpAddr, family: AddressFamily, out: &mut [u8]) {
    match (family, ip) {
        (AddressFamily::Inet, IpAddr::V4(addr)) => out.copy_from_slice(&addr.octets()),
        (AddressFamily::Inet, IpAddr::V6(addr)) => {
            let octets = addr.to_ipv4_mapped().map(|a| a.octets()).unwrap_or([0; 4]);
            out.copy_from_slice(&octets);
        }
        (AddressFamily::Inet6, IpAddr::V4(addr)) => {
            out.copy_from_slice(&addr.to_ipv6_mapped().octets())
        }
        (AddressFamily::Inet6, IpAddr::V6(addr)) => out.copy_from_slice(&addr.octets()),
    }
}

/// Value stored by the probes for each socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MapValue {
    pub pid: u32,
    pub uid: u32,
    pub inode: u64,
    pub seq: u64,
}

impl MapValue {
    pub fn decode(buf: &[u8; MAP_VALUE_SIZE], order: ByteOrder) -> Self {
        Self {
            pid: order.read_u32(&buf[0..]).unwrap_or_default(),
            uid: order.read_u32(&buf[4..]).unwrap_or_default(),
            inode: order.read_u64(&buf[8..]).unwrap_or_default(),
            seq: order.read_u64(&buf[16..]).unwrap_or_default(),
        }
    }

    pub fn encode(&self, order: ByteOrder) -> [u8; MAP_VALUE_SIZE] {
        let mut buf = [0u8; MAP_VALUE_SIZE];
        buf[0..4].copy_from_slice(&order.u32_bytes(self.pid));
        buf[4..8].copy_from_slice(&order.u32_bytes(self.uid));
        buf[8..16].copy_from_slice(&order.u64_bytes(self.inode));
        buf[16..24].copy_from_slice(&order.u64_bytes(self.seq));
        buf
    }

    pub fn pid(&self) -> Pid {
        Pid::try_from(self.pid).unwrap_or(UNRESOLVED_PID)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Protocol;

    #[test]
    fn test_request_size_and_alignment() {
        assert_eq!(std::mem::size_of::<LookupRequest>(), 40);
        assert_eq!(std::mem::align_of::<LookupRequest>(), 8);
    }

    #[test]
    fn test_request_field_offsets() {
        let req = LookupRequest::new(
            7,
            0x1122_3344_5566_7788,
            0x99aa_bbcc_ddee_ff00,
            ByteOrder::Little,
        );
        let bytes = req.as_bytes();
        assert_eq!(bytes.len(), LOOKUP_REQUEST_SIZE);
        // descriptor in the first 8 bytes, upper half zero
        assert_eq!(&bytes[0..8], &[7, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(
            &bytes[8..16],
            &[0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
        assert_eq!(
            &bytes[16..24],
            &[0x00, 0xff, 0xee, 0xdd, 0xcc, 0xbb, 0xaa, 0x99]
        );
        assert!(bytes[FLAGS_OFFSET..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_request_big_endian_keeps_fd_in_low_word() {
        let req = LookupRequest::new(0x0102_0304, 0, 0, ByteOrder::Big);
        assert_eq!(&req.as_bytes()[0..8], &[1, 2, 3, 4, 0, 0, 0, 0]);
    }

    #[test]
    fn test_request_native_matches_pointer_values() {
        let key = [0u8; MAX_KEY_SIZE];
        let mut value = [0u8; MAP_VALUE_SIZE];
        let key_ptr = key.as_ptr() as u64;
        let value_ptr = value.as_mut_ptr() as u64;
        let order = ByteOrder::detect();
        let req = LookupRequest::new(3, key_ptr, value_ptr, order);
        assert_eq!(order.read_u32(&req.as_bytes()[0..]), Some(3));
        assert_eq!(order.read_u64(&req.as_bytes()[8..]), Some(key_ptr));
        assert_eq!(order.read_u64(&req.as_bytes()[16..]), Some(value_ptr));
    }

    #[test]
    fn test_encode_v4_key() {
        let id = SocketIdentity::new(
            Protocol::Tcp,
            "192.168.1.10".parse().unwrap(),
            0x1f90,
            "1.2.3.4".parse().unwrap(),
            443,
            99,
        );
        let mut key = [0u8; MAX_KEY_SIZE];
        let len = encode_key(&id, ByteOrder::Little, &mut key);
        assert_eq!(len, 12);
        assert_eq!(&key[0..2], &[0x90, 0x1f]);
        assert_eq!(&key[2..4], &[0x01, 0xbb]);
        assert_eq!(&key[4..8], &[192, 168, 1, 10]);
        assert_eq!(&key[8..12], &[1, 2, 3, 4]);
        assert!(key[12..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_encode_v6_key() {
        let id = SocketIdentity::new(
            Protocol::Udp,
            "fe80::1".parse().unwrap(),
            5353,
            "ff02::fb".parse().unwrap(),
            5353,
            1,
        );
        let mut key = [0u8; MAX_KEY_SIZE];
        let len = encode_key(&id, ByteOrder::Big, &mut key);
        assert_eq!(len, MAX_KEY_SIZE);
        assert_eq!(&key[0..2], &5353u16.to_be_bytes());
        assert_eq!(key[4], 0xfe);
        assert_eq!(key[5], 0x80);
        assert_eq!(key[19], 0x01);
        assert_eq!(key[20], 0xff);
        assert_eq!(key[35], 0xfb);
    }

    #[test]
    fn test_map_value_decode() {
        let value = MapValue {
            pid: 4242,
            uid: 1000,
            inode: 77,
            seq: 123456789,
        };
        let order = ByteOrder::detect();
        let bytes = value.encode(order);
        assert_eq!(MapValue::decode(&bytes, order), value);
        assert_eq!(value.pid(), 4242);
    }

    #[test]
    fn test_map_value_pid_overflow_is_unresolved() {
        let value = MapValue {
            pid: u32::MAX,
            ..Default::default()
        };
        assert_eq!(value.pid(), UNRESOLVED_PID);
    }
}
