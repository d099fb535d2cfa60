//! The node-local hub: peer and stream registries, message routing and the
//! RPC dispatch table.
//!
//! A [`Universe`] owns everything for one node. Peer I/O tasks hold only a
//! `Weak` back-reference, so dropping the universe (after `reset`) winds the
//! node down without cycles.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::errors::Error;
use crate::handle::{CallbackRegistry, Handle};
use crate::protocol::wire::{
    decode_packet_body, MSG_FIND_STREAM, MSG_REGISTER, MSG_SELECT, MSG_SUBSCRIBE, MSG_UNREGISTER,
    MSG_UNSUBSCRIBE,
};
use crate::protocol::{Channel, ChannelSet, MessageKind, NetMessage};
use crate::stream::file::FileStream;
use crate::stream::net::NetStream;
use crate::stream::Stream;

use super::listener::Listener;
use super::peer::{Peer, PeerId};
use super::uri::{NetUri, Scheme};

const FIND_STREAM_TIMEOUT: Duration = Duration::from_secs(1);

/// How long `reset` waits for each closed peer's I/O task to wind down.
const PEER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// JSON body of stream control notifies and `__find_stream__` calls.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct StreamRef {
    pub uri: String,
}

/// JSON body of `__select__` notifies.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct SelectMsg {
    pub uri: String,
    pub frameset: u32,
    pub channels: Vec<u8>,
}

impl SelectMsg {
    pub(crate) fn new(uri: &str, frameset: u32, channels: ChannelSet) -> Self {
        SelectMsg {
            uri: uri.to_owned(),
            frameset,
            channels: channels.iter().map(|c| c.0).collect(),
        }
    }

    pub(crate) fn channel_set(&self) -> ChannelSet {
        self.channels.iter().map(|c| Channel(*c)).collect()
    }
}

/// Bound RPC handler: JSON request body in, JSON response body out.
pub type RpcHandler = Arc<dyn Fn(Bytes) -> Result<Bytes, String> + Send + Sync>;

pub(crate) enum LocalStream {
    Net(Arc<NetStream>),
    File(Arc<FileStream>),
}

impl LocalStream {
    fn as_stream(&self) -> Arc<dyn Stream> {
        match self {
            LocalStream::Net(s) => Arc::clone(s) as Arc<dyn Stream>,
            LocalStream::File(s) => Arc::clone(s) as Arc<dyn Stream>,
        }
    }
}

pub(crate) struct UniverseInner {
    pub(crate) id: PeerId,
    pub(crate) peers: DashMap<PeerId, Arc<Peer>>,
    /// Local producers and file writers, keyed by base URI.
    pub(crate) streams: DashMap<String, LocalStream>,
    /// Local consumers, keyed by base URI.
    pub(crate) consumers: DashMap<String, Arc<NetStream>>,
    /// Which peer advertises which remote stream.
    pub(crate) remote_names: DashMap<String, PeerId>,
    listeners: Mutex<HashMap<String, Listener>>,
    rpc_handlers: DashMap<String, RpcHandler>,
    on_connect: CallbackRegistry<PeerId>,
    on_disconnect: CallbackRegistry<PeerId>,
    on_error: CallbackRegistry<Error>,
}

impl UniverseInner {
    pub(crate) fn connection_count(&self) -> usize {
        self.peers.len()
    }

    pub(crate) fn raise_error(&self, err: Error) {
        tracing::debug!("universe error event: {err}");
        self.on_error.dispatch(&err);
    }

    /// Called by a peer task once its handshake completes. Replays local
    /// stream advertisements so a late joiner learns what exists here.
    pub(crate) fn register_peer(&self, peer: &Arc<Peer>) {
        let Some(id) = peer.remote_id() else {
            return;
        };
        self.peers.insert(id, Arc::clone(peer));

        for entry in self.streams.iter() {
            if let LocalStream::Net(stream) = entry.value() {
                if stream.active() {
                    if let Ok(body) = serde_json::to_vec(&StreamRef {
                        uri: entry.key().clone(),
                    }) {
                        let _ = peer.try_enqueue(
                            NetMessage::notify(MSG_REGISTER, Bytes::from(body)),
                            None,
                        );
                    }
                }
            }
        }

        self.on_connect.dispatch(&id);
    }

    pub(crate) fn unregister_peer(&self, peer: &Arc<Peer>) {
        let Some(id) = peer.remote_id() else {
            return;
        };
        self.peers.remove(&id);
        self.remote_names.retain(|_, owner| *owner != id);
        for entry in self.streams.iter() {
            if let LocalStream::Net(stream) = entry.value() {
                stream.detach_peer(id);
            }
        }
        for entry in self.consumers.iter() {
            entry.value().detach_peer(id);
        }
        self.on_disconnect.dispatch(&id);
    }

    /// Handle an inbound notify or call from a peer task.
    pub(crate) async fn route_message(&self, peer: &Arc<Peer>, msg: NetMessage) {
        match msg.kind {
            MessageKind::Notify => {
                // Stream notifies are named by a URI; control names never
                // carry a scheme.
                if msg.name.contains("://") {
                    self.route_packet(peer, &msg);
                } else {
                    self.route_control(peer, &msg).await;
                }
            }
            MessageKind::Call => self.route_call(peer, &msg),
            // Responses are consumed inside the peer.
            MessageKind::Response | MessageKind::ErrorResponse => {}
        }
    }

    fn route_packet(&self, peer: &Arc<Peer>, msg: &NetMessage) {
        let (spkt, pkt) = match decode_packet_body(&msg.body) {
            Ok(pair) => pair,
            Err(err) => {
                self.raise_error(Error::PacketFailure(err.to_string()));
                return;
            }
        };

        if let Some(consumer) = self.consumers.get(&msg.name) {
            consumer.process_inbound(peer, spkt, pkt);
        } else if let Some(entry) = self.streams.get(&msg.name) {
            if let LocalStream::Net(producer) = entry.value() {
                // Producers only act on request-flagged packets.
                producer.process_inbound(peer, spkt, pkt);
            }
        } else {
            tracing::trace!(name = %msg.name, "packet for unknown stream dropped");
        }
    }

    async fn route_control(&self, peer: &Arc<Peer>, msg: &NetMessage) {
        match msg.name.as_str() {
            MSG_REGISTER => {
                let Ok(stream_ref) = serde_json::from_slice::<StreamRef>(&msg.body) else {
                    self.raise_error(Error::PacketFailure("bad register body".to_owned()));
                    return;
                };
                let Some(id) = peer.remote_id() else {
                    return;
                };
                tracing::debug!(uri = %stream_ref.uri, peer = %id, "remote stream registered");
                self.remote_names.insert(stream_ref.uri.clone(), id);

                // A consumer that began before the remote advertised can
                // now subscribe.
                let waiting = self
                    .consumers
                    .get(&stream_ref.uri)
                    .map(|c| Arc::clone(c.value()));
                if let Some(consumer) = waiting {
                    if consumer.active() {
                        consumer.subscribe_to(peer).await;
                    }
                }
            }
            MSG_UNREGISTER => {
                let Ok(stream_ref) = serde_json::from_slice::<StreamRef>(&msg.body) else {
                    return;
                };
                if let Some(id) = peer.remote_id() {
                    self.remote_names
                        .remove_if(&stream_ref.uri, |_, owner| *owner == id);
                    if let Some(consumer) = self.consumers.get(&stream_ref.uri) {
                        consumer.detach_peer(id);
                    }
                }
            }
            MSG_SUBSCRIBE => {
                let Ok(stream_ref) = serde_json::from_slice::<StreamRef>(&msg.body) else {
                    return;
                };
                if let Some(entry) = self.streams.get(&stream_ref.uri) {
                    if let LocalStream::Net(producer) = entry.value() {
                        tracing::debug!(uri = %stream_ref.uri, "peer subscribed");
                        producer.attach_peer(peer);
                    }
                }
            }
            MSG_UNSUBSCRIBE => {
                let Ok(stream_ref) = serde_json::from_slice::<StreamRef>(&msg.body) else {
                    return;
                };
                if let (Some(entry), Some(id)) =
                    (self.streams.get(&stream_ref.uri), peer.remote_id())
                {
                    if let LocalStream::Net(producer) = entry.value() {
                        producer.detach_peer(id);
                    }
                }
            }
            MSG_SELECT => {
                let Ok(select) = serde_json::from_slice::<SelectMsg>(&msg.body) else {
                    return;
                };
                if let Some(entry) = self.streams.get(&select.uri) {
                    if let LocalStream::Net(producer) = entry.value() {
                        producer.apply_selection(select.frameset, select.channel_set());
                    }
                }
            }
            other => {
                tracing::debug!(name = other, "unknown control notify");
            }
        }
    }

    fn route_call(&self, peer: &Arc<Peer>, msg: &NetMessage) {
        if msg.name == MSG_FIND_STREAM {
            let found = serde_json::from_slice::<StreamRef>(&msg.body)
                .ok()
                .and_then(|r| self.streams.get(&r.uri).map(|e| e.as_stream().active()))
                .unwrap_or(false);
            if let Ok(body) = serde_json::to_vec(&found) {
                peer.respond(msg.call_id, Bytes::from(body));
            }
            return;
        }

        match self.rpc_handlers.get(&msg.name).map(|h| Arc::clone(&h)) {
            Some(handler) => match handler(msg.body.clone()) {
                Ok(body) => peer.respond(msg.call_id, body),
                Err(reason) => peer.respond_error(msg.call_id, &reason),
            },
            None => {
                tracing::debug!(name = %msg.name, "call for unbound rpc");
                peer.respond_error(msg.call_id, "unknown rpc");
            }
        }
    }
}

/// The per-node entry point.
pub struct Universe {
    inner: Arc<UniverseInner>,
}

impl Default for Universe {
    fn default() -> Self {
        Self::new()
    }
}

impl Universe {
    #[must_use]
    pub fn new() -> Universe {
        let inner = Arc::new(UniverseInner {
            id: PeerId::random(),
            peers: DashMap::new(),
            streams: DashMap::new(),
            consumers: DashMap::new(),
            remote_names: DashMap::new(),
            listeners: Mutex::new(HashMap::new()),
            rpc_handlers: DashMap::new(),
            on_connect: CallbackRegistry::new(),
            on_disconnect: CallbackRegistry::new(),
            on_error: CallbackRegistry::new(),
        });
        tracing::info!(id = %inner.id, "universe created");
        Universe { inner }
    }

    #[must_use]
    pub fn id(&self) -> PeerId {
        self.inner.id
    }

    /// Start accepting peers on `uri` (`tcp://` or `ws://`). Returns the
    /// bound address, useful with port zero.
    pub async fn listen(&self, uri: &str) -> Result<SocketAddr, Error> {
        let parsed = NetUri::parse(uri)?;
        let key = parsed.base();
        if self.inner.listeners.lock().contains_key(&key) {
            return Err(Error::Listen(format!("{key}: already listening")));
        }
        let listener =
            Listener::bind(&parsed, self.inner.id, Arc::downgrade(&self.inner)).await?;
        let addr = listener.local_addr();
        self.inner.listeners.lock().insert(key, listener);
        Ok(addr)
    }

    /// Dial a remote node. The connection auto-reconnects with backoff if it
    /// later drops.
    pub async fn connect_node(&self, uri: &str) -> Result<Arc<Peer>, Error> {
        let parsed = NetUri::parse(uri)?;
        if !matches!(parsed.scheme, Scheme::Tcp | Scheme::Ws | Scheme::Wss) {
            return Err(Error::BadUri(uri.to_owned()));
        }
        Peer::connect(parsed, true, self.inner.id, Arc::downgrade(&self.inner)).await
    }

    #[must_use]
    pub fn peer(&self, id: PeerId) -> Option<Arc<Peer>> {
        self.inner.peers.get(&id).map(|p| Arc::clone(&p))
    }

    #[must_use]
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.inner.peers.iter().map(|p| Arc::clone(&p)).collect()
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.inner.peers.len()
    }

    /// Wait until no registered peer is still connecting. Returns `true`
    /// when every peer settled inside the timeout.
    pub async fn wait_connections(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let settled = self
                .peers()
                .iter()
                .all(|p| p.state() != super::peer::NodeState::Connecting);
            if settled {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Create a local stream to produce into: `ftl://` for a network stream,
    /// `file://` to record. Each base URI may exist once per universe.
    pub fn create_stream(&self, uri: &str) -> Result<Arc<dyn Stream>, Error> {
        let parsed = NetUri::parse(uri)?;
        let base = parsed.base();
        match self.inner.streams.entry(base.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::UriAlreadyExists(base)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let entry = match parsed.scheme {
                    Scheme::Ftl => LocalStream::Net(NetStream::producer(
                        base,
                        Arc::downgrade(&self.inner),
                    )),
                    Scheme::File => {
                        LocalStream::File(FileStream::create(parsed.path.clone().into()))
                    }
                    _ => return Err(Error::BadUri(uri.to_owned())),
                };
                let stream = entry.as_stream();
                slot.insert(entry);
                Ok(stream)
            }
        }
    }

    /// Open a stream to consume: a remote `ftl://` stream advertised by some
    /// peer, or a `file://` recording to replay. Remote lookups fall back to
    /// a `__find_stream__` probe of every connected peer.
    pub async fn get_stream(&self, uri: &str) -> Result<Arc<dyn Stream>, Error> {
        let parsed = NetUri::parse(uri)?;
        match parsed.scheme {
            Scheme::File => Ok(FileStream::open(parsed.path.clone().into()) as Arc<dyn Stream>),
            Scheme::Ftl => {
                let base = parsed.base();
                if let Some(existing) = self.inner.consumers.get(&base) {
                    return Ok(Arc::clone(existing.value()) as Arc<dyn Stream>);
                }

                if !self.inner.remote_names.contains_key(&base) {
                    self.probe_for_stream(&base).await?;
                }

                let stream = NetStream::consumer(
                    base.clone(),
                    parsed.channels(),
                    Arc::downgrade(&self.inner),
                );
                self.inner.consumers.insert(base, Arc::clone(&stream));
                Ok(stream as Arc<dyn Stream>)
            }
            _ => Err(Error::BadUri(uri.to_owned())),
        }
    }

    async fn probe_for_stream(&self, base: &str) -> Result<(), Error> {
        let request = StreamRef {
            uri: base.to_owned(),
        };
        for peer in self.peers() {
            let found: Result<bool, Error> = peer
                .call_with_timeout(MSG_FIND_STREAM, &request, FIND_STREAM_TIMEOUT)
                .await;
            if matches!(found, Ok(true)) {
                if let Some(id) = peer.remote_id() {
                    self.inner.remote_names.insert(base.to_owned(), id);
                    return Ok(());
                }
            }
        }
        Err(Error::UriDoesNotExist(base.to_owned()))
    }

    /// Bind a named RPC callable by remote peers. Bodies are JSON both ways.
    pub fn bind<F>(&self, name: &str, handler: F)
    where
        F: Fn(Bytes) -> Result<Bytes, String> + Send + Sync + 'static,
    {
        self.inner
            .rpc_handlers
            .insert(name.to_owned(), Arc::new(handler));
    }

    pub fn unbind(&self, name: &str) {
        self.inner.rpc_handlers.remove(name);
    }

    pub fn on_connect<F>(&self, cb: F) -> Handle
    where
        F: Fn(&PeerId) -> bool + Send + Sync + 'static,
    {
        self.inner.on_connect.add(cb)
    }

    pub fn on_disconnect<F>(&self, cb: F) -> Handle
    where
        F: Fn(&PeerId) -> bool + Send + Sync + 'static,
    {
        self.inner.on_disconnect.add(cb)
    }

    pub fn on_error<F>(&self, cb: F) -> Handle
    where
        F: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        self.inner.on_error.add(cb)
    }

    /// Tear everything down: stop listening, end local streams, close peers
    /// and clear every table. The universe is reusable afterwards.
    pub async fn reset(&self) {
        self.inner.listeners.lock().clear();

        let locals: Vec<Arc<dyn Stream>> = self
            .inner
            .streams
            .iter()
            .map(|e| e.value().as_stream())
            .collect();
        for stream in locals {
            stream.end().await;
        }
        let consumers: Vec<Arc<NetStream>> = self
            .inner
            .consumers
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        for consumer in consumers {
            consumer.end().await;
        }

        // Close every peer, then join their I/O tasks so no connection
        // event fires after reset returns.
        let peers = self.peers();
        for peer in &peers {
            peer.close();
        }
        for peer in &peers {
            if !peer.wait_disconnected(PEER_DRAIN_TIMEOUT).await {
                tracing::warn!(peer = ?peer.remote_id(), "peer did not drain before reset timeout");
            }
        }

        self.inner.peers.clear();
        self.inner.streams.clear();
        self.inner.consumers.clear();
        self.inner.remote_names.clear();
        tracing::info!(id = %self.inner.id, "universe reset");
    }
}
