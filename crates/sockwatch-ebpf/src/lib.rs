//! Linux kprobe backend for sockwatch
//!
//! Loads the probe object with aya, reads socket events from per-CPU perf
//! buffers, answers kernel map lookups with a raw `bpf(2)` call and
//! implements the core collaborator traits on top of /proc and getifaddrs.

#[cfg(target_os = "linux")]
pub mod accessor;
#[cfg(target_os = "linux")]
pub mod interfaces;
#[cfg(target_os = "linux")]
pub mod loader;
#[cfg(target_os = "linux")]
pub mod maps;
#[cfg(target_os = "linux")]
mod monitor;
#[cfg(target_os = "linux")]
pub mod perf;
#[cfg(target_os = "linux")]
pub mod probe;
#[cfg(target_os = "linux")]
pub mod procfs;

#[cfg(target_os = "linux")]
pub use monitor::EbpfMonitor;

// Stub for non-Linux platforms
#[cfg(not(target_os = "linux"))]
pub struct EbpfMonitor;

#[cfg(not(target_os = "linux"))]
impl EbpfMonitor {
    pub async fn start(
        _config: &sockwatch_core::SockwatchConfig,
    ) -> Result<Self, sockwatch_core::StartError> {
        Err(sockwatch_core::StartError::Unsupported)
    }

    pub async fn stop(self) -> Result<(), sockwatch_core::ShutdownError> {
        Ok(())
    }
}
