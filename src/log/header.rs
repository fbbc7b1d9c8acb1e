//! Log file header.
//!
//! ```text
//! [magic: 4 = "CHLG"][format_version: u16][flags: u16][reserved: 8]
//! ```

use crate::error::{Error, Result};

/// Magic bytes identifying a log file.
pub const LOG_MAGIC: [u8; 4] = *b"CHLG";
/// Current on-disk format version.
pub const LOG_FORMAT_VERSION: u16 = 1;
/// Size of the file header; the first frame starts here.
pub const LOG_HEADER_LEN: usize = 16;

/// Decoded file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogHeader {
    /// Frame format version.
    pub format_version: u16,
    /// Feature flags; none are defined yet.
    pub flags: u16,
}

impl Default for LogHeader {
    fn default() -> Self {
        Self {
            format_version: LOG_FORMAT_VERSION,
            flags: 0,
        }
    }
}

impl LogHeader {
    /// Serializes the header.
    pub fn to_bytes(&self) -> [u8; LOG_HEADER_LEN] {
        let mut bytes = [0u8; LOG_HEADER_LEN];
        bytes[0..4].copy_from_slice(&LOG_MAGIC);
        bytes[4..6].copy_from_slice(&self.format_version.to_le_bytes());
        bytes[6..8].copy_from_slice(&self.flags.to_le_bytes());
        bytes
    }

    /// Parses and validates a header.
    pub fn parse(bytes: &[u8; LOG_HEADER_LEN]) -> Result<Self> {
        if bytes[0..4] != LOG_MAGIC {
            return Err(Error::InvalidHeader("bad magic".to_string()));
        }
        let header = Self {
            format_version: u16::from_le_bytes([bytes[4], bytes[5]]),
            flags: u16::from_le_bytes([bytes[6], bytes[7]]),
        };
        if header.format_version != LOG_FORMAT_VERSION {
            return Err(Error::InvalidHeader(format!(
                "unsupported format version {}",
                header.format_version
            )));
        }
        Ok(header)
    }

    /// True if `partial` could be the start of a header this build would write.
    ///
    /// Used to tell a crash during file creation from a foreign file.
    pub fn is_torn_prefix(partial: &[u8]) -> bool {
        partial.len() < LOG_HEADER_LEN && Self::default().to_bytes().starts_with(partial)
    }
}
