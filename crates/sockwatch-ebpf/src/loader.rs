//! Host preparation before loading probes

use nix::mount::{mount, MsFlags};
use sockwatch_core::StartError;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// Make sure debugfs is mounted at `path`, mounting it if not
pub fn ensure_debugfs(path: &Path) -> Result<(), StartError> {
    if is_mounted("/proc/mounts", path, "debugfs") {
        debug!("debugfs already mounted at {}", path.display());
        return Ok(());
    }

    fs::create_dir_all(path).map_err(|e| StartError::Mount {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    mount(
        Some("debugfs"),
        path,
        Some("debugfs"),
        MsFlags::empty(),
        None::<&str>,
    )
    .map_err(|e| StartError::Mount {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    info!("Mounted debugfs at {}", path.display());
    Ok(())
}

/// Whether `mounts` (a /proc/mounts style table) lists `fstype` at `target`
fn is_mounted(mounts: impl AsRef<Path>, target: &Path, fstype: &str) -> bool {
    let Ok(table) = fs::read_to_string(mounts) else {
        return false;
    };
    table.lines().any(|line| {
        let mut fields = line.split_whitespace();
        let _source = fields.next();
        let mount_point = fields.next();
        let kind = fields.next();
        mount_point.map(Path::new) == Some(target) && kind == Some(fstype)
    })
}

/// Lift the locked-memory limit so map creation does not fail on older kernels
pub fn bump_memlock_rlimit() -> bool {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    // SAFETY: `rlim` is a valid rlimit that outlives the call
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        warn!("Failed to remove limit on locked memory (ret={})", ret);
        false
    } else {
        true
    }
}

/// Check if the BPF filesystem is present
pub fn bpffs_available() -> bool {
    Path::new("/sys/fs/bpf").exists()
}

/// Check kernel version for kprobe support
pub fn kernel_version() -> Option<(u32, u32, u32)> {
    let release = fs::read_to_string("/proc/sys/kernel/osrelease").ok()?;
    parse_kernel_release(&release)
}

fn parse_kernel_release(release: &str) -> Option<(u32, u32, u32)> {
    let parts: Vec<&str> = release.trim().split('.').collect();
    if parts.len() < 2 {
        return None;
    }

    let major = parts[0].parse().ok()?;
    let minor = parts[1].split('-').next()?.parse().ok()?;
    let patch = parts
        .get(2)
        .and_then(|p| p.split('-').next())
        .and_then(|p| p.parse().ok())
        .unwrap_or(0);
    Some((major, minor, patch))
}

pub fn is_root() -> bool {
    nix::unistd::Uid::effective().is_root()
}
