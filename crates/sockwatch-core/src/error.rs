//! Error types
//!
//! Startup errors ([`StartError`], [`ProbeError`]) abort the subsystem.
//! Everything else is contained where it happens and only reduces how much
//! the resolver knows.

use crate::types::{AddressFamily, MapKind, Protocol};
use std::path::PathBuf;
use thiserror::Error;

/// Probe object could not be brought up
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Failed to load probe object {path}: {reason}")]
    Load { path: PathBuf, reason: String },

    #[error("Failed to attach kernel probes: {0}")]
    AttachFailed(String),
}

/// Fatal startup failure, reported once to whoever called start
#[derive(Debug, Error)]
pub enum StartError {
    #[error("debugfs unavailable at {path}: {reason}")]
    Mount { path: PathBuf, reason: String },

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error("Kernel map setup failed: {0}")]
    Maps(String),

    #[error("Event streamer setup failed: {0}")]
    Streamer(String),

    #[error("Kernel probes are not supported on this platform")]
    Unsupported,
}

/// Socket enumeration for a whole family failed
#[derive(Debug, Error)]
pub enum DumpError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Socket dump not supported for {protocol}/{family}")]
    Unsupported {
        family: AddressFamily,
        protocol: Protocol,
    },
}

/// Owning process of a single socket could not be found
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("No process owns socket inode {0}")]
    NotFound(u64),

    #[error("Process table scan failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Kernel map lookup failed for reasons other than a missing key
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("bpf() lookup failed: {0}")]
    Syscall(#[from] std::io::Error),

    #[error("No kernel map for {0}")]
    MissingMap(MapKind),
}

/// Raw kernel event could not be decoded
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Event truncated: {len} bytes, expected {expected}")]
    Truncated { len: usize, expected: usize },

    #[error("Unknown event kind {0}")]
    UnknownKind(u8),

    #[error("Unknown address family {0}")]
    UnknownFamily(u8),

    #[error("Unknown protocol {0}")]
    UnknownProtocol(u8),
}

/// Event source stopped producing
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Event source closed")]
    Closed,

    #[error("Event source read failed: {0}")]
    Read(String),
}

/// Coordinated shutdown did not drain in time
#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("Shutdown drain timed out, still running: {pending:?}")]
    DrainTimeout { pending: Vec<String> },
}
