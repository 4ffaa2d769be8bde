//! Direct kernel map lookups
//!
//! Goes straight to `bpf(BPF_MAP_LOOKUP_ELEM)` with a request built on the
//! stack. This sits on the per-packet path, so nothing here allocates.

use sockwatch_core::layout::{
    encode_key, LookupRequest, MapValue, BPF_MAP_LOOKUP_ELEM, LOOKUP_REQUEST_SIZE, MAP_VALUE_SIZE,
    MAX_KEY_SIZE,
};
use sockwatch_core::{ByteOrder, LookupError, SocketIdentity};
use std::os::fd::RawFd;
use tracing::debug;

/// Look up `id` in the map behind `map_fd`. A missing key is `Ok(None)`.
pub fn lookup(
    map_fd: RawFd,
    id: &SocketIdentity,
    order: ByteOrder,
) -> Result<Option<MapValue>, LookupError> {
    let mut key = [0u8; MAX_KEY_SIZE];
    encode_key(id, order, &mut key);
    let mut value = [0u8; MAP_VALUE_SIZE];

    let request = LookupRequest::new(
        map_fd as u32,
        key.as_ptr() as u64,
        value.as_mut_ptr() as u64,
        order,
    );

    // SAFETY: the request points at `key` and `value`, both live stack
    // buffers at least as large as the map's key and value sizes
    let ret = unsafe {
        libc::syscall(
            libc::SYS_bpf,
            libc::c_long::from(BPF_MAP_LOOKUP_ELEM),
            request.as_ptr().cast::<libc::c_void>(),
            LOOKUP_REQUEST_SIZE as libc::c_long,
        )
    };

    if ret == 0 {
        return Ok(Some(MapValue::decode(&value, order)));
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ENOENT) {
        Ok(None)
    } else {
        Err(LookupError::Syscall(err))
    }
}

/// [`lookup`] that folds every failure into a miss
pub fn lookup_or_miss(map_fd: RawFd, id: &SocketIdentity, order: ByteOrder) -> Option<MapValue> {
    match lookup(map_fd, id, order) {
        Ok(value) => value,
        Err(e) => {
            debug!("Kernel map lookup for {} failed: {}", id, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sockwatch_core::Protocol;

    #[test]
    fn test_bad_descriptor_is_an_error_not_a_panic() {
        let id = SocketIdentity::new(
            Protocol::Tcp,
            "127.0.0.1".parse().unwrap(),
            1,
            "127.0.0.1".parse().unwrap(),
            2,
            3,
        );
        // -1 is never a valid map fd; the call fails with EBADF (or EPERM
        // when bpf() is restricted) but never reports a hit
        assert!(lookup_or_miss(-1, &id, ByteOrder::detect()).is_none());
    }
}
