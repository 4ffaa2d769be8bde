//! Loading the probe object with aya

use aya::programs::KProbe;
use aya::Ebpf;
use sockwatch_core::config::KprobeSpec;
use sockwatch_core::{ProbeError, ProbeLoader};
use std::path::PathBuf;
use tracing::{debug, info};

/// Loads the compiled probe object from disk and attaches its kprobes
pub struct AyaProbeLoader {
    path: PathBuf,
    kprobes: Vec<KprobeSpec>,
}

impl AyaProbeLoader {
    pub fn new(path: impl Into<PathBuf>, kprobes: Vec<KprobeSpec>) -> Self {
        Self {
            path: path.into(),
            kprobes,
        }
    }
}

impl ProbeLoader for AyaProbeLoader {
    type Object = Ebpf;

    fn load(&mut self) -> Result<Ebpf, ProbeError> {
        let ebpf = Ebpf::load_file(&self.path).map_err(|e| ProbeError::Load {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        debug!("Loaded probe object {}", self.path.display());
        Ok(ebpf)
    }

    fn enable(&mut self, ebpf: &mut Ebpf) -> Result<(), ProbeError> {
        for kprobe in &self.kprobes {
            let program: &mut KProbe = ebpf
                .program_mut(&kprobe.program)
                .ok_or_else(|| {
                    ProbeError::AttachFailed(format!("{} program not found", kprobe.program))
                })?
                .try_into()
                .map_err(|e| {
                    ProbeError::AttachFailed(format!(
                        "{} is not a kprobe program: {}",
                        kprobe.program, e
                    ))
                })?;

            program.load().map_err(|e| {
                ProbeError::AttachFailed(format!("Failed to load {}: {}", kprobe.program, e))
            })?;
            program.attach(&kprobe.function, 0).map_err(|e| {
                ProbeError::AttachFailed(format!(
                    "Failed to attach {} to {}: {}",
                    kprobe.program, kprobe.function, e
                ))
            })?;
            info!("Attached kprobe {} to {}", kprobe.program, kprobe.function);
        }
        Ok(())
    }
}
