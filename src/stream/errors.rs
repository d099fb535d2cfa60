//! Synchronous stream misuse errors.

use thiserror::Error;

use super::StreamProperty;
use crate::protocol::WireError;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("frameset index {0} is out of bounds")]
    OutOfBounds(u32),

    #[error("stream is not active")]
    NotActive,

    #[error("invalid value for property {0:?}")]
    BadPropertyValue(StreamProperty),

    #[error("property {0:?} is not supported by this stream")]
    UnsupportedProperty(StreamProperty),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
