//! Byte transports behind a peer: length-framed TCP or WebSocket binary
//! messages. Both carry the same [`NetMessage`] records; over WebSocket each
//! binary message holds one or more complete records.

use std::collections::VecDeque;

use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::codec::Framed;

use crate::errors::Error;
use crate::protocol::wire::{decode_message, encode_message};
use crate::protocol::{FrameCodec, NetMessage, WireError};

use super::uri::{NetUri, Scheme};

enum TransportInner {
    Tcp(Framed<TcpStream, FrameCodec>),
    WsClient(WebSocketStream<MaybeTlsStream<TcpStream>>),
    WsServer(WebSocketStream<TcpStream>),
}

pub(crate) struct Transport {
    inner: TransportInner,
    // Records decoded from a ws binary message but not yet delivered.
    pending: VecDeque<NetMessage>,
}

impl Transport {
    /// Dial `uri` and establish the raw byte transport. No handshake happens
    /// here.
    pub(crate) async fn connect(uri: &NetUri) -> Result<Transport, Error> {
        let inner = match uri.scheme {
            Scheme::Tcp => {
                let stream = TcpStream::connect(uri.socket_addr())
                    .await
                    .map_err(|err| Error::socket(&err))?;
                stream.set_nodelay(true).map_err(|err| Error::socket(&err))?;
                TransportInner::Tcp(Framed::new(stream, FrameCodec))
            }
            Scheme::Ws | Scheme::Wss => {
                let (ws, _response) = tokio_tungstenite::connect_async(uri.as_str())
                    .await
                    .map_err(|err| Error::ConnectionFailed(err.to_string()))?;
                TransportInner::WsClient(ws)
            }
            Scheme::File | Scheme::Ftl => return Err(Error::BadUri(uri.as_str().to_owned())),
        };
        Ok(Transport {
            inner,
            pending: VecDeque::new(),
        })
    }

    pub(crate) fn accept_tcp(stream: TcpStream) -> Transport {
        let _ = stream.set_nodelay(true);
        Transport {
            inner: TransportInner::Tcp(Framed::new(stream, FrameCodec)),
            pending: VecDeque::new(),
        }
    }

    pub(crate) async fn accept_ws(stream: TcpStream) -> Result<Transport, Error> {
        let ws = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(|err| Error::ConnectionFailed(err.to_string()))?;
        Ok(Transport {
            inner: TransportInner::WsServer(ws),
            pending: VecDeque::new(),
        })
    }

    pub(crate) async fn send(&mut self, msg: NetMessage) -> Result<(), Error> {
        match &mut self.inner {
            TransportInner::Tcp(framed) => framed.send(msg).await.map_err(wire_to_error),
            TransportInner::WsClient(ws) => {
                let frame = ws_frame(&msg)?;
                ws.send(frame)
                    .await
                    .map_err(|err| Error::SocketError(err.to_string()))
            }
            TransportInner::WsServer(ws) => {
                let frame = ws_frame(&msg)?;
                ws.send(frame)
                    .await
                    .map_err(|err| Error::SocketError(err.to_string()))
            }
        }
    }

    /// Next inbound record. `None` means the remote closed the connection.
    pub(crate) async fn next(&mut self) -> Option<Result<NetMessage, Error>> {
        if let Some(msg) = self.pending.pop_front() {
            return Some(Ok(msg));
        }
        match &mut self.inner {
            TransportInner::Tcp(framed) => framed
                .next()
                .await
                .map(|result| result.map_err(wire_to_error)),
            TransportInner::WsClient(ws) => next_ws(ws, &mut self.pending).await,
            TransportInner::WsServer(ws) => next_ws(ws, &mut self.pending).await,
        }
    }

    pub(crate) async fn close(&mut self) {
        match &mut self.inner {
            TransportInner::Tcp(framed) => {
                let _ = SinkExt::<NetMessage>::close(framed).await;
            }
            TransportInner::WsClient(ws) => {
                let _ = ws.close(None).await;
            }
            TransportInner::WsServer(ws) => {
                let _ = ws.close(None).await;
            }
        }
    }
}

fn ws_frame(msg: &NetMessage) -> Result<Message, Error> {
    let mut buf = BytesMut::with_capacity(msg.wire_len());
    encode_message(msg, &mut buf).map_err(wire_to_error)?;
    Ok(Message::binary(buf.to_vec()))
}

async fn next_ws<S>(
    ws: &mut WebSocketStream<S>,
    pending: &mut VecDeque<NetMessage>,
) -> Option<Result<NetMessage, Error>>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    loop {
        match ws.next().await {
            Some(Ok(Message::Binary(data))) => {
                let mut buf = BytesMut::from(&data[..]);
                loop {
                    match decode_message(&mut buf) {
                        Ok(Some(msg)) => pending.push_back(msg),
                        Ok(None) => break,
                        Err(err) => return Some(Err(wire_to_error(err))),
                    }
                }
                if !buf.is_empty() {
                    // A binary message must hold whole records.
                    return Some(Err(Error::PacketFailure(
                        "partial record in websocket message".to_owned(),
                    )));
                }
                if let Some(msg) = pending.pop_front() {
                    return Some(Ok(msg));
                }
            }
            Some(Ok(Message::Close(_))) | None => return None,
            // Pings are answered by the library; text frames are ignored.
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                return Some(Err(Error::SocketError(err.to_string())));
            }
        }
    }
}

fn wire_to_error(err: WireError) -> Error {
    match err {
        WireError::Io(io) => Error::socket(&io),
        other => Error::PacketFailure(other.to_string()),
    }
}
