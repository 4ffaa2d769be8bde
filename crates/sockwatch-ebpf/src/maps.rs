//! Per-protocol kernel map handles

use crate::accessor;
use aya::maps::{Map, MapData};
use aya::Ebpf;
use parking_lot::RwLock;
use sockwatch_core::{ByteOrder, KernelMaps, MapKind, MapValue, SocketIdentity, StartError};
use std::collections::HashMap;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use tracing::{debug, warn};

/// One socket map taken out of the probe object
pub struct KernelMapHandle {
    kind: MapKind,
    data: MapData,
    id: u32,
}

impl KernelMapHandle {
    fn new(kind: MapKind, data: MapData) -> Result<Self, StartError> {
        let id = data
            .info()
            .map_err(|e| StartError::Maps(format!("{}: {}", kind.map_name(), e)))?
            .id();
        Ok(Self { kind, data, id })
    }

    pub fn kind(&self) -> MapKind {
        self.kind
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn raw_fd(&self) -> RawFd {
        self.data.fd().as_fd().as_raw_fd()
    }

    /// The descriptor is open and still refers to the same kernel map
    fn is_valid(&self) -> bool {
        let open = nix::fcntl::fcntl(self.raw_fd(), nix::fcntl::FcntlArg::F_GETFD).is_ok();
        open && self.data.info().map(|info| info.id()).ok() == Some(self.id)
    }
}

/// The four socket maps, each behind its own lock
pub struct KernelMapSet {
    handles: HashMap<MapKind, RwLock<KernelMapHandle>>,
    order: ByteOrder,
}

impl KernelMapSet {
    /// Take every socket map out of `ebpf`
    pub fn take_from(ebpf: &mut Ebpf, order: ByteOrder) -> Result<Self, StartError> {
        let mut handles = HashMap::new();
        for kind in MapKind::ALL {
            let name = kind.map_name();
            let data = match ebpf.take_map(name) {
                Some(Map::HashMap(data)) | Some(Map::LruHashMap(data)) => data,
                Some(_) => return Err(StartError::Maps(format!("{} is not a hash map", name))),
                None => return Err(StartError::Maps(format!("{} not found in probe object", name))),
            };
            let handle = KernelMapHandle::new(kind, data)?;
            debug!("Opened {} (id {})", name, handle.id());
            handles.insert(kind, RwLock::new(handle));
        }
        Ok(Self { handles, order })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl KernelMaps for KernelMapSet {
    fn lookup(&self, id: &SocketIdentity) -> Option<MapValue> {
        let handle = self.handles.get(&id.map_kind())?.read();
        accessor::lookup_or_miss(handle.raw_fd(), id, self.order)
    }

    fn revalidate(&self) -> usize {
        let mut reopened = 0;
        for handle in self.handles.values() {
            let (kind, map_id) = {
                let current = handle.read();
                if current.is_valid() {
                    continue;
                }
                (current.kind, current.id)
            };

            match MapData::from_id(map_id) {
                Ok(data) => {
                    handle.write().data = data;
                    reopened += 1;
                    debug!("Reopened {} by id {}", kind.map_name(), map_id);
                }
                Err(e) => warn!("Failed to reopen {} (id {}): {}", kind.map_name(), map_id, e),
            }
        }
        reopened
    }
}
