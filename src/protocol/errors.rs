//! Wire-level encode/decode errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame truncated: needed {needed} bytes, had {have}")]
    Truncated { needed: usize, have: usize },

    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    Oversized { size: usize, max: usize },

    #[error("unknown message kind {0}")]
    BadKind(u8),

    #[error("message name is not valid utf-8")]
    BadName(#[from] std::str::Utf8Error),

    #[error("message name of {0} bytes exceeds the u16 length field")]
    NameTooLong(usize),

    #[error("bad file header magic")]
    BadMagic,

    #[error("unsupported file version {0}")]
    BadFileVersion(u32),

    #[error("payload serialization failed: {0}")]
    Payload(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
