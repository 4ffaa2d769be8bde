//! Socket tables and socket ownership from /proc
//!
//! [`ProcNetDumper`] reads `/proc/net/{tcp,tcp6,udp,udp6}` and
//! [`ProcFdResolver`] finds the process holding a socket inode by scanning
//! `/proc/*/fd`. Both take the proc root as a parameter so tests can point
//! them at a fake tree.

use parking_lot::Mutex;
use sockwatch_core::{
    AddressFamily, ByteOrder, DumpError, DumpedSocket, InodeResolver, Pid, Protocol,
    ResolutionError, SocketDumper, SocketIdentity,
};
use std::collections::HashMap;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use tracing::trace;

/// Memoized inode owners kept before the memo is reset
const MAX_MEMO_ENTRIES: usize = 4096;

/// Reads socket tables from `<root>/net`
#[derive(Debug, Clone)]
pub struct ProcNetDumper {
    root: PathBuf,
    order: ByteOrder,
}

impl Default for ProcNetDumper {
    fn default() -> Self {
        Self::new("/proc", ByteOrder::detect())
    }
}

impl ProcNetDumper {
    pub fn new(root: impl Into<PathBuf>, order: ByteOrder) -> Self {
        Self {
            root: root.into(),
            order,
        }
    }

    fn table(&self, family: AddressFamily, protocol: Protocol) -> PathBuf {
        let suffix = match family {
            AddressFamily::Inet => "",
            AddressFamily::Inet6 => "6",
        };
        self.root.join("net").join(format!("{}{}", protocol, suffix))
    }
}

impl SocketDumper for ProcNetDumper {
    fn dump(
        &self,
        family: AddressFamily,
        protocol: Protocol,
    ) -> Result<Vec<DumpedSocket>, DumpError> {
        let path = self.table(family, protocol);
        let content = fs::read_to_string(&path).map_err(|source| DumpError::Io {
            path: path.clone(),
            source,
        })?;

        // first line is the column header
        let sockets: Vec<_> = content
            .lines()
            .skip(1)
            .filter_map(|line| parse_socket_line(line, protocol, self.order))
            .filter(|sock| sock.identity.family == family)
            .collect();
        trace!("{} sockets in {}", sockets.len(), path.display());
        Ok(sockets)
    }
}

/// Parse one table row
///
/// Format: `sl local_address rem_address st tx:rx tr:when retrnsmt uid timeout inode ...`
fn parse_socket_line(line: &str, protocol: Protocol, order: ByteOrder) -> Option<DumpedSocket> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 10 {
        return None;
    }

    let (src, src_port) = parse_hex_endpoint(parts[1], order)?;
    let (dst, dst_port) = parse_hex_endpoint(parts[2], order)?;
    let state = u8::from_str_radix(parts[3], 16).ok()?;
    let uid: u32 = parts[7].parse().ok()?;
    let inode: u64 = parts[9].parse().ok()?;

    Some(DumpedSocket {
        identity: SocketIdentity::new(protocol, src, src_port, dst, dst_port, inode),
        state,
        uid,
    })
}

/// Parse `ADDR:PORT` where ADDR is the raw address printed as 32-bit words
/// in host byte order and PORT is plain hex
fn parse_hex_endpoint(hex: &str, order: ByteOrder) -> Option<(IpAddr, u16)> {
    let (addr, port) = hex.split_once(':')?;
    let port = u16::from_str_radix(port, 16).ok()?;

    let mut octets = [0u8; 16];
    let words = addr.len() / 8;
    if addr.len() % 8 != 0 || !(words == 1 || words == 4) {
        return None;
    }
    for i in 0..words {
        let word = u32::from_str_radix(addr.get(i * 8..i * 8 + 8)?, 16).ok()?;
        octets[i * 4..i * 4 + 4].copy_from_slice(&order.u32_bytes(word));
    }

    let ip = if words == 1 {
        IpAddr::V4(Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]))
    } else {
        IpAddr::V6(Ipv6Addr::from(octets))
    };
    Some((ip, port))
}

/// Finds socket owners by scanning `<root>/<pid>/fd`
#[derive(Debug)]
pub struct ProcFdResolver {
    root: PathBuf,
    memo: Mutex<HashMap<String, Pid>>,
}

impl Default for ProcFdResolver {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcFdResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            memo: Mutex::new(HashMap::new()),
        }
    }

    fn holds_inode(&self, pid: Pid, target: &str) -> bool {
        let fd_dir = self.root.join(pid.to_string()).join("fd");
        fs::read_dir(fd_dir)
            .map(|entries| entries.flatten().any(|fd| is_link_to(&fd.path(), target)))
            .unwrap_or(false)
    }

    fn scan(&self, inode: u64, target: &str) -> Result<Pid, ResolutionError> {
        for entry in fs::read_dir(&self.root)?.flatten() {
            let pid: Pid = match entry.file_name().to_string_lossy().parse() {
                Ok(p) => p,
                Err(_) => continue,
            };
            // permission denied or process exited
            if self.holds_inode(pid, target) {
                return Ok(pid);
            }
        }
        Err(ResolutionError::NotFound(inode))
    }
}

fn is_link_to(path: &Path, target: &str) -> bool {
    fs::read_link(path)
        .map(|link| link.as_os_str() == target)
        .unwrap_or(false)
}

impl InodeResolver for ProcFdResolver {
    fn resolve(&self, inode: u64, key: &str) -> Result<Pid, ResolutionError> {
        let target = format!("socket:[{}]", inode);

        let remembered = self.memo.lock().get(key).copied();
        if let Some(pid) = remembered {
            if self.holds_inode(pid, &target) {
                return Ok(pid);
            }
            self.memo.lock().remove(key);
        }

        let pid = self.scan(inode, &target)?;
        let mut memo = self.memo.lock();
        if memo.len() >= MAX_MEMO_ENTRIES {
            memo.clear();
        }
        memo.insert(key.to_string(), pid);
        Ok(pid)
    }
}
