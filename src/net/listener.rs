//! Accept loops for incoming peers, TCP framed or WebSocket.

use std::net::SocketAddr;
use std::sync::Weak;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::errors::Error;

use super::peer::{Peer, PeerId};
use super::transport::Transport;
use super::universe::UniverseInner;
use super::uri::{NetUri, Scheme};

/// Refuse new connections past this many registered peers.
const MAX_CONNECTIONS: usize = 256;

/// A bound accept loop. Dropping it stops accepting; existing peers live on.
pub(crate) struct Listener {
    local_addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl Listener {
    pub(crate) async fn bind(
        uri: &NetUri,
        local_id: PeerId,
        universe: Weak<UniverseInner>,
    ) -> Result<Listener, Error> {
        let websocket = match uri.scheme {
            Scheme::Tcp => false,
            Scheme::Ws => true,
            Scheme::Wss => {
                return Err(Error::Listen(format!(
                    "{}: wss listening needs an external tls terminator",
                    uri.as_str()
                )));
            }
            Scheme::File | Scheme::Ftl => {
                return Err(Error::Listen(format!("{}: not a listenable scheme", uri.as_str())));
            }
        };

        let listener = TcpListener::bind(uri.socket_addr())
            .await
            .map_err(|err| Error::Listen(format!("{}: {err}", uri.as_str())))?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| Error::Listen(err.to_string()))?;
        tracing::info!(%local_addr, websocket, "listening");

        let handle = tokio::spawn(accept_loop(listener, websocket, local_id, universe));
        Ok(Listener { local_addr, handle })
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    websocket: bool,
    local_id: PeerId,
    universe: Weak<UniverseInner>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let Some(strong) = universe.upgrade() else {
                    return;
                };
                if strong.connection_count() >= MAX_CONNECTIONS {
                    tracing::warn!(%addr, "connection limit reached, refusing");
                    continue;
                }
                tracing::debug!(%addr, "incoming connection");

                if websocket {
                    let universe = universe.clone();
                    tokio::spawn(async move {
                        match Transport::accept_ws(stream).await {
                            Ok(transport) => {
                                Peer::accept(transport, local_id, universe);
                            }
                            Err(err) => {
                                tracing::debug!(%addr, "websocket upgrade failed: {err}");
                            }
                        }
                    });
                } else {
                    Peer::accept(Transport::accept_tcp(stream), local_id, universe.clone());
                }
            }
            Err(err) => {
                tracing::warn!("accept failed: {err}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
