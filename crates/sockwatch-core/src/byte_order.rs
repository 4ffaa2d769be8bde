//! Host byte order
//!
//! Probes write event payloads and map values in the byte order of the
//! machine they run on. The order is detected once at startup and passed
//! to every decoder.

/// Byte order of multi-byte integers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    /// Detect the order of the running machine
    pub fn detect() -> Self {
        if u16::from_ne_bytes([0x01, 0x00]) == 0x0001 {
            Self::Little
        } else {
            Self::Big
        }
    }

    pub fn read_u16(self, buf: &[u8]) -> Option<u16> {
        let bytes: [u8; 2] = buf.get(..2)?.try_into().ok()?;
        Some(match self {
            Self::Little => u16::from_le_bytes(bytes),
            Self::Big => u16::from_be_bytes(bytes),
        })
    }

    pub fn read_u32(self, buf: &[u8]) -> Option<u32> {
        let bytes: [u8; 4] = buf.get(..4)?.try_into().ok()?;
        Some(match self {
            Self::Little => u32::from_le_bytes(bytes),
            Self::Big => u32::from_be_bytes(bytes),
        })
    }

    pub fn read_u64(self, buf: &[u8]) -> Option<u64> {
        let bytes: [u8; 8] = buf.get(..8)?.try_into().ok()?;
        Some(match self {
            Self::Little => u64::from_le_bytes(bytes),
            Self::Big => u64::from_be_bytes(bytes),
        })
    }

    pub fn u16_bytes(self, value: u16) -> [u8; 2] {
        match self {
            Self::Little => value.to_le_bytes(),
            Self::Big => value.to_be_bytes(),
        }
    }

    pub fn u32_bytes(self, value: u32) -> [u8; 4] {
        match self {
            Self::Little => value.to_le_bytes(),
            Self::Big => value.to_be_bytes(),
        }
    }

    pub fn u64_bytes(self, value: u64) -> [u8; 8] {
        match self {
            Self::Little => value.to_le_bytes(),
            Self::Big => value.to_be_bytes(),
        }
    }
}
