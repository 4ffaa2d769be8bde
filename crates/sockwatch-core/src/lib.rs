//! sockwatch core - connection-to-process resolution without a kernel
//!
//! Everything here is platform independent:
//!
//! - **Types**: socket identity, flow keys, resolved connections
//! - **Layouts**: kernel map key/value, lookup request and event records
//! - **Stores**: connection cache, established baseline, local addresses
//! - **Runtime**: task supervision, event streamer, background monitors
//!
//! The Linux implementation of the collaborator traits lives in
//! `sockwatch-ebpf`.

pub mod baseline;
pub mod byte_order;
pub mod cache;
pub mod collab;
pub mod config;
pub mod error;
pub mod event;
pub mod layout;
pub mod local_addrs;
pub mod monitors;
pub mod probe;
pub mod resolve;
pub mod streamer;
pub mod tasks;
pub mod types;

pub use baseline::EstablishedBaselineSet;
pub use byte_order::ByteOrder;
pub use cache::ConnectionCache;
pub use collab::{AddressSource, DumpedSocket, InodeResolver, KernelMaps, SocketDumper};
pub use config::{ConfigError, ConfigLoader, SockwatchConfig};
pub use error::{
    DecodeError, DumpError, LookupError, ProbeError, ResolutionError, ShutdownError, SourceError,
    StartError,
};
pub use event::{EventKind, SocketEvent};
pub use layout::MapValue;
pub use local_addrs::LocalAddressSet;
pub use monitors::MonitorContext;
pub use probe::{load_with_recovery, ProbeLoader};
pub use resolve::resolve_flow;
pub use streamer::{EventSource, StreamStats};
pub use tasks::{StopSignal, TaskGroup};
pub use types::{
    AddressFamily, FlowKey, MapKind, Pid, Protocol, ResolvedConnection, SocketIdentity,
    UNRESOLVED_PID,
};

/// Daemon version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
