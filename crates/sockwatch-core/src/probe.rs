//! Probe bring-up with one recovery attempt
//!
//! An unclean previous shutdown can leave a kprobe of the same name
//! attached, and enabling then fails. Closing the object and loading it
//! again clears that state, so enabling is retried exactly once on a fresh
//! object before giving up.

use crate::error::ProbeError;
use tracing::{info, warn};

/// Loads and enables a probe object
pub trait ProbeLoader {
    type Object;

    fn load(&mut self) -> Result<Self::Object, ProbeError>;

    fn enable(&mut self, object: &mut Self::Object) -> Result<(), ProbeError>;
}

/// Load and enable, reloading once if enabling fails
pub fn load_with_recovery<L: ProbeLoader>(loader: &mut L) -> Result<L::Object, ProbeError> {
    let mut object = loader.load()?;
    match loader.enable(&mut object) {
        Ok(()) => return Ok(object),
        Err(e) => warn!("Enabling kprobes failed, reloading probe object: {}", e),
    }

    drop(object);
    let mut object = loader.load()?;
    match loader.enable(&mut object) {
        Ok(()) => {
            info!("Kprobes enabled after reload");
            Ok(object)
        }
        Err(e) => Err(match e {
            ProbeError::AttachFailed(_) => e,
            other => ProbeError::AttachFailed(other.to_string()),
        }),
    }
}
