//! Crate-wide error taxonomy.
//!
//! One enum covers both synchronous failures (returned as `Result`) and
//! asynchronous transport events (delivered through `on_error` registries).
//! Variants are cloneable so a single event can fan out to every registered
//! callback; I/O causes are therefore carried as messages rather than as
//! source errors.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("unknown error: {0}")]
    Unknown(String),

    #[error("packet could not be sent: {0}")]
    PacketFailure(String),

    #[error("a callback panicked during dispatch")]
    DispatchFailed,

    #[error("no handshake received within the timeout")]
    MissingHandshake,

    #[error("rpc call {0} aborted without a response")]
    RpcResponse(u32),

    #[error("socket error: {0}")]
    SocketError(String),

    #[error("send queue overflow")]
    BufferSize,

    #[error("reconnection abandoned after {0} attempts")]
    ReconnectionFailed(u32),

    #[error("bad handshake: {0}")]
    BadHandshake(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("refusing to connect to ourselves")]
    SelfConnect,

    #[error("could not listen on {0}")]
    Listen(String),

    #[error("stream uri already registered: {0}")]
    UriAlreadyExists(String),

    #[error("stream uri not known to any peer: {0}")]
    UriDoesNotExist(String),

    #[error("malformed uri: {0}")]
    BadUri(String),

    #[error("protocol version mismatch: local major {local}, remote major {remote}")]
    BadVersion { local: u16, remote: u16 },
}

impl Error {
    /// Map an I/O failure onto the transport-event taxonomy.
    pub(crate) fn socket(err: &std::io::Error) -> Self {
        Self::SocketError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn errors_render_and_clone() {
        let err = Error::BadVersion { local: 1, remote: 2 };
        let cloned = err.clone();
        assert_eq!(err.to_string(), cloned.to_string());
        assert!(Error::SelfConnect.to_string().contains("ourselves"));
        assert!(Error::RpcResponse(7).to_string().contains('7'));
    }
}
