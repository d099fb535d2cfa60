//! One remote node: handshake, multiplexed RPC and the outbound send queue.
//!
//! A peer owns a single transport at a time. Outbound traffic goes through a
//! bounded [`SendQueue`] drained by the peer's I/O task; stream packets
//! coalesce latest-wins per `(frameset, channel)` under pressure while
//! control and RPC records are never dropped. Outgoing peers reconnect with
//! exponential backoff when the socket drops.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch, Notify};
use uuid::Uuid;

use crate::errors::Error;
use crate::protocol::wire::MSG_HANDSHAKE;
use crate::protocol::{MessageKind, NetMessage};

use super::transport::Transport;
use super::universe::UniverseInner;
use super::uri::NetUri;

/// First eight bytes of every handshake, little-endian.
pub const HANDSHAKE_MAGIC: u64 = u64::from_le_bytes(*b"BYNDPRTO");

/// Semantic protocol version; peers must agree on the major number.
pub const PROTOCOL_VERSION: [u16; 3] = [1, 0, 0];

/// Capabilities advertised in the handshake. Informational for now; peers
/// do not gate behaviour on them.
const LOCAL_CAPS: [&str; 2] = ["streams", "rpc"];

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const CALL_TIMEOUT: Duration = Duration::from_secs(5);

const SEND_QUEUE_CAPACITY: usize = 256;
/// How long a full queue may block a post before it is rejected.
const ENQUEUE_GRACE: Duration = Duration::from_millis(100);

const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(250);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(10);
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Stable node identity, minted once per [`crate::net::Universe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(pub Uuid);

impl PeerId {
    #[must_use]
    pub fn random() -> Self {
        PeerId(Uuid::new_v4())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

#[derive(Debug, Serialize, Deserialize)]
struct HandshakeMsg {
    magic: u64,
    version: [u16; 3],
    id: PeerId,
    name: String,
    #[serde(default)]
    caps: Vec<String>,
}

impl HandshakeMsg {
    fn local(id: PeerId) -> Self {
        HandshakeMsg {
            magic: HANDSHAKE_MAGIC,
            version: PROTOCOL_VERSION,
            id,
            name: local_hostname(),
            caps: LOCAL_CAPS.iter().map(|s| (*s).to_owned()).collect(),
        }
    }
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_owned())
}

#[derive(Debug, Clone)]
struct RemoteInfo {
    id: PeerId,
    name: String,
    version: [u16; 3],
    caps: Vec<String>,
}

/// Coalescing key for stream packets: `(frameset, channel)`.
pub(crate) type CoalesceKey = (u32, u8);

struct QueueEntry {
    msg: NetMessage,
    key: Option<CoalesceKey>,
}

struct QueueState {
    entries: VecDeque<QueueEntry>,
    closed: bool,
}

/// Bounded outbound queue with latest-wins coalescing for keyed entries.
pub(crate) struct SendQueue {
    state: Mutex<QueueState>,
    readable: Notify,
    writable: Notify,
    capacity: usize,
}

impl SendQueue {
    fn new(capacity: usize) -> Self {
        SendQueue {
            state: Mutex::new(QueueState {
                entries: VecDeque::new(),
                closed: false,
            }),
            readable: Notify::new(),
            writable: Notify::new(),
            capacity,
        }
    }

    /// Attempt one insert; on success the slot is taken, on a full queue it
    /// is left for the caller to retry.
    fn try_push_inner(
        &self,
        slot: &mut Option<NetMessage>,
        key: Option<CoalesceKey>,
    ) -> Result<bool, Error> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::SocketError("send queue closed".to_owned()));
        }
        if state.entries.len() < self.capacity {
            if let Some(msg) = slot.take() {
                state.entries.push_back(QueueEntry { msg, key });
                self.readable.notify_one();
            }
            return Ok(true);
        }
        // Under pressure a newer packet for the same (frameset, channel)
        // slot supersedes the queued one.
        if let Some(key) = key {
            if let Some(entry) = state.entries.iter_mut().find(|e| e.key == Some(key)) {
                if let Some(msg) = slot.take() {
                    entry.msg = msg;
                }
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Enqueue, blocking up to [`ENQUEUE_GRACE`] when full. Keyed entries
    /// coalesce instead of queueing twice.
    async fn push(&self, msg: NetMessage, key: Option<CoalesceKey>) -> Result<(), Error> {
        let deadline = tokio::time::Instant::now() + ENQUEUE_GRACE;
        let mut slot = Some(msg);
        loop {
            let writable = self.writable.notified();
            if self.try_push_inner(&mut slot, key)? {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, writable).await.is_err() {
                return Err(Error::BufferSize);
            }
        }
    }

    /// Non-blocking variant for synchronous callers; `false` means dropped.
    pub(crate) fn try_push(&self, msg: NetMessage, key: Option<CoalesceKey>) -> bool {
        let mut slot = Some(msg);
        matches!(self.try_push_inner(&mut slot, key), Ok(true))
    }

    async fn pop(&self) -> Option<NetMessage> {
        loop {
            let notified = self.readable.notified();
            {
                let mut state = self.state.lock();
                if let Some(entry) = state.entries.pop_front() {
                    self.writable.notify_one();
                    return Some(entry.msg);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.state.lock().entries.len()
    }
}

/// A connected (or reconnecting) remote node.
pub struct Peer {
    local_id: PeerId,
    uri: Option<NetUri>,
    auto_reconnect: bool,
    universe: Weak<UniverseInner>,
    state_tx: watch::Sender<NodeState>,
    exit_tx: watch::Sender<bool>,
    remote: RwLock<Option<RemoteInfo>>,
    queue: SendQueue,
    calls: Mutex<HashMap<u32, oneshot::Sender<Result<Bytes, Error>>>>,
    next_call_id: AtomicU32,
}

impl Peer {
    fn new(
        local_id: PeerId,
        uri: Option<NetUri>,
        auto_reconnect: bool,
        universe: Weak<UniverseInner>,
    ) -> Arc<Peer> {
        Arc::new(Peer {
            local_id,
            uri,
            auto_reconnect,
            universe,
            state_tx: watch::Sender::new(NodeState::Connecting),
            exit_tx: watch::Sender::new(false),
            remote: RwLock::new(None),
            queue: SendQueue::new(SEND_QUEUE_CAPACITY),
            calls: Mutex::new(HashMap::new()),
            next_call_id: AtomicU32::new(1),
        })
    }

    /// Dial, handshake and spawn the I/O task. Fails fast when the first
    /// connection cannot be established; `auto_reconnect` only governs what
    /// happens after an established connection drops.
    pub(crate) async fn connect(
        uri: NetUri,
        auto_reconnect: bool,
        local_id: PeerId,
        universe: Weak<UniverseInner>,
    ) -> Result<Arc<Peer>, Error> {
        let mut transport = Transport::connect(&uri).await?;
        let peer = Peer::new(local_id, Some(uri), auto_reconnect, universe);

        if let Err(err) = peer.client_handshake(&mut transport).await {
            transport.close().await;
            peer.state_tx.send_replace(NodeState::Disconnected);
            return Err(err);
        }

        peer.state_tx.send_replace(NodeState::Connected);
        if let Some(universe) = peer.universe.upgrade() {
            universe.register_peer(&peer);
        }
        tokio::spawn(client_task(Arc::clone(&peer), transport));
        Ok(peer)
    }

    /// Adopt an accepted transport; the spawned task waits for the remote's
    /// handshake before registering the peer.
    pub(crate) fn accept(
        transport: Transport,
        local_id: PeerId,
        universe: Weak<UniverseInner>,
    ) -> Arc<Peer> {
        let peer = Peer::new(local_id, None, false, universe);
        tokio::spawn(server_task(Arc::clone(&peer), transport));
        peer
    }

    #[must_use]
    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    /// The remote node's identity; `None` until the handshake completes.
    #[must_use]
    pub fn remote_id(&self) -> Option<PeerId> {
        self.remote.read().as_ref().map(|r| r.id)
    }

    /// The remote node's self-reported hostname.
    #[must_use]
    pub fn remote_name(&self) -> Option<String> {
        self.remote.read().as_ref().map(|r| r.name.clone())
    }

    #[must_use]
    pub fn remote_version(&self) -> Option<[u16; 3]> {
        self.remote.read().as_ref().map(|r| r.version)
    }

    /// Capability strings the remote advertised in its handshake.
    #[must_use]
    pub fn remote_caps(&self) -> Vec<String> {
        self.remote
            .read()
            .as_ref()
            .map(|r| r.caps.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn uri(&self) -> Option<&str> {
        self.uri.as_ref().map(NetUri::as_str)
    }

    #[must_use]
    pub fn state(&self) -> NodeState {
        *self.state_tx.borrow()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == NodeState::Connected
    }

    /// Wait until the peer reaches `Connected`, e.g. across a reconnect.
    pub async fn wait_connection(&self, timeout: Duration) -> bool {
        let mut rx = self.state_tx.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|s| *s == NodeState::Connected))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    /// Wait until the I/O task has fully wound down after [`Peer::close`].
    pub async fn wait_disconnected(&self, timeout: Duration) -> bool {
        let mut rx = self.state_tx.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|s| *s == NodeState::Disconnected))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    /// Fire-and-forget notify with a JSON body. Never dropped, but may fail
    /// with [`Error::BufferSize`] when the queue stays full.
    pub async fn send<A: Serialize>(&self, name: &str, args: &A) -> Result<(), Error> {
        let body = Bytes::from(serde_json::to_vec(args).map_err(|e| Error::Unknown(e.to_string()))?);
        self.enqueue(NetMessage::notify(name, body), None).await
    }

    /// RPC round trip with the default timeout.
    pub async fn call<A, R>(&self, name: &str, args: &A) -> Result<R, Error>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        self.call_with_timeout(name, args, CALL_TIMEOUT).await
    }

    pub async fn call_with_timeout<A, R>(
        &self,
        name: &str,
        args: &A,
        timeout: Duration,
    ) -> Result<R, Error>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.calls.lock().insert(call_id, tx);

        let body = match serde_json::to_vec(args) {
            Ok(body) => Bytes::from(body),
            Err(err) => {
                self.calls.lock().remove(&call_id);
                return Err(Error::Unknown(err.to_string()));
            }
        };
        if let Err(err) = self.enqueue(NetMessage::call(call_id, name, body), None).await {
            self.calls.lock().remove(&call_id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(bytes))) => {
                serde_json::from_slice(&bytes).map_err(|e| Error::Unknown(e.to_string()))
            }
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(_closed)) => Err(Error::RpcResponse(call_id)),
            Err(_elapsed) => {
                self.calls.lock().remove(&call_id);
                Err(Error::RpcResponse(call_id))
            }
        }
    }

    pub(crate) async fn enqueue(
        &self,
        msg: NetMessage,
        key: Option<CoalesceKey>,
    ) -> Result<(), Error> {
        self.queue.push(msg, key).await
    }

    /// Synchronous enqueue for non-async callers; drops on a full queue.
    pub(crate) fn try_enqueue(&self, msg: NetMessage, key: Option<CoalesceKey>) -> bool {
        self.queue.try_push(msg, key)
    }

    pub(crate) fn respond(&self, call_id: u32, body: Bytes) {
        let _ = self.try_enqueue(NetMessage::response(call_id, body), None);
    }

    pub(crate) fn respond_error(&self, call_id: u32, message: &str) {
        let _ = self.try_enqueue(NetMessage::error_response(call_id, message), None);
    }

    /// Request teardown; the I/O task finishes draining and exits.
    pub fn close(&self) {
        self.state_tx.send_replace(NodeState::Disconnecting);
        let _ = self.exit_tx.send(true);
        self.queue.close();
    }

    fn closed(&self) -> bool {
        *self.exit_tx.borrow()
    }

    fn raise(&self, err: Error) {
        if let Some(universe) = self.universe.upgrade() {
            universe.raise_error(err);
        } else {
            tracing::debug!("peer error after universe teardown: {err}");
        }
    }

    fn fail_outstanding_calls(&self) {
        let drained: Vec<_> = self.calls.lock().drain().collect();
        for (call_id, tx) in drained {
            let _ = tx.send(Err(Error::RpcResponse(call_id)));
        }
    }

    async fn client_handshake(&self, transport: &mut Transport) -> Result<(), Error> {
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let hello = HandshakeMsg::local(self.local_id);
        let body =
            Bytes::from(serde_json::to_vec(&hello).map_err(|e| Error::Unknown(e.to_string()))?);
        transport
            .send(NetMessage::call(call_id, MSG_HANDSHAKE, body))
            .await?;

        let reply = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
            loop {
                match transport.next().await {
                    Some(Ok(msg))
                        if msg.kind == MessageKind::Response && msg.call_id == call_id =>
                    {
                        return Ok(msg.body);
                    }
                    Some(Ok(msg))
                        if msg.kind == MessageKind::ErrorResponse && msg.call_id == call_id =>
                    {
                        return Err(Error::BadHandshake(
                            String::from_utf8_lossy(&msg.body).into_owned(),
                        ));
                    }
                    // Nothing else is meaningful before the handshake.
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Err(err),
                    None => {
                        return Err(Error::ConnectionFailed(
                            "connection closed during handshake".to_owned(),
                        ));
                    }
                }
            }
        })
        .await
        .map_err(|_| Error::MissingHandshake)??;

        let remote: HandshakeMsg =
            serde_json::from_slice(&reply).map_err(|e| Error::BadHandshake(e.to_string()))?;
        self.validate_remote(&remote)?;
        if remote.id == self.local_id {
            return Err(Error::SelfConnect);
        }
        self.store_remote(remote);
        Ok(())
    }

    async fn server_handshake(&self, transport: &mut Transport) -> Result<(), Error> {
        match transport.next().await {
            Some(Ok(msg)) if msg.kind == MessageKind::Call && msg.name == MSG_HANDSHAKE => {
                let remote: HandshakeMsg = match serde_json::from_slice(&msg.body) {
                    Ok(remote) => remote,
                    Err(err) => {
                        let reason = format!("unreadable handshake: {err}");
                        let _ = transport
                            .send(NetMessage::error_response(msg.call_id, &reason))
                            .await;
                        return Err(Error::BadHandshake(reason));
                    }
                };
                if let Err(err) = self.validate_remote(&remote) {
                    let _ = transport
                        .send(NetMessage::error_response(msg.call_id, &err.to_string()))
                        .await;
                    return Err(err);
                }
                let self_connect = remote.id == self.local_id;

                let hello = HandshakeMsg::local(self.local_id);
                let body = Bytes::from(
                    serde_json::to_vec(&hello).map_err(|e| Error::Unknown(e.to_string()))?,
                );
                transport.send(NetMessage::response(msg.call_id, body)).await?;

                if self_connect {
                    return Err(Error::SelfConnect);
                }
                self.store_remote(remote);
                Ok(())
            }
            Some(Ok(_)) => Err(Error::BadHandshake(
                "expected a handshake as the first message".to_owned(),
            )),
            Some(Err(err)) => Err(err),
            None => Err(Error::ConnectionFailed(
                "connection closed during handshake".to_owned(),
            )),
        }
    }

    fn validate_remote(&self, remote: &HandshakeMsg) -> Result<(), Error> {
        if remote.magic != HANDSHAKE_MAGIC {
            return Err(Error::BadHandshake("bad magic".to_owned()));
        }
        if remote.version[0] != PROTOCOL_VERSION[0] {
            return Err(Error::BadVersion {
                local: PROTOCOL_VERSION[0],
                remote: remote.version[0],
            });
        }
        Ok(())
    }

    fn store_remote(&self, remote: HandshakeMsg) {
        tracing::info!(
            peer = %remote.id,
            name = %remote.name,
            "handshake complete"
        );
        *self.remote.write() = Some(RemoteInfo {
            id: remote.id,
            name: remote.name,
            version: remote.version,
            caps: remote.caps,
        });
    }

    async fn handle_message(self: &Arc<Self>, msg: NetMessage) {
        match msg.kind {
            MessageKind::Response => {
                if let Some(tx) = self.calls.lock().remove(&msg.call_id) {
                    let _ = tx.send(Ok(msg.body));
                } else {
                    tracing::debug!(call_id = msg.call_id, "response for unknown call");
                }
            }
            MessageKind::ErrorResponse => {
                if let Some(tx) = self.calls.lock().remove(&msg.call_id) {
                    let _ = tx.send(Err(Error::Unknown(
                        String::from_utf8_lossy(&msg.body).into_owned(),
                    )));
                }
            }
            MessageKind::Notify | MessageKind::Call => {
                if let Some(universe) = self.universe.upgrade() {
                    universe.route_message(self, msg).await;
                }
            }
        }
    }

    async fn reconnect(&self) -> Option<Transport> {
        let uri = self.uri.as_ref()?;
        let mut delay = RECONNECT_BASE_DELAY;
        let mut exit_rx = self.exit_tx.subscribe();
        for attempt in 1..=MAX_RECONNECT_ATTEMPTS {
            if self.closed() {
                return None;
            }
            tokio::select! {
                _ = exit_rx.changed() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
            match Transport::connect(uri).await {
                Ok(mut transport) => match self.client_handshake(&mut transport).await {
                    Ok(()) => {
                        tracing::info!(uri = uri.as_str(), attempt, "reconnected");
                        return Some(transport);
                    }
                    Err(err) => {
                        tracing::debug!(attempt, "handshake on reconnect failed: {err}");
                        transport.close().await;
                    }
                },
                Err(err) => {
                    tracing::debug!(attempt, "reconnect attempt failed: {err}");
                }
            }
            delay = (delay * 2).min(RECONNECT_MAX_DELAY);
        }
        None
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("local_id", &self.local_id)
            .field("remote_id", &self.remote_id())
            .field("state", &self.state())
            .finish()
    }
}

enum IoEvent {
    Outgoing(Option<NetMessage>),
    Incoming(Option<Result<NetMessage, Error>>),
    Exit,
}

/// Pump one transport until it drops or the peer is closed.
async fn run_io(peer: &Arc<Peer>, transport: &mut Transport) {
    let mut exit_rx = peer.exit_tx.subscribe();
    loop {
        if peer.closed() {
            return;
        }
        // The select borrows the transport for reading only; sends happen
        // after it resolves.
        let event = tokio::select! {
            _ = exit_rx.changed() => IoEvent::Exit,
            outgoing = peer.queue.pop() => IoEvent::Outgoing(outgoing),
            incoming = transport.next() => IoEvent::Incoming(incoming),
        };
        match event {
            IoEvent::Exit => return,
            IoEvent::Outgoing(Some(msg)) => {
                if let Err(err) = transport.send(msg).await {
                    peer.raise(err);
                    return;
                }
            }
            IoEvent::Outgoing(None) => return,
            IoEvent::Incoming(Some(Ok(msg))) => peer.handle_message(msg).await,
            IoEvent::Incoming(Some(Err(err @ Error::PacketFailure(_)))) => {
                // Malformed record: surface and keep the connection.
                peer.raise(err);
            }
            IoEvent::Incoming(Some(Err(err))) => {
                peer.raise(err);
                return;
            }
            IoEvent::Incoming(None) => return,
        }
    }
}

async fn client_task(peer: Arc<Peer>, mut transport: Transport) {
    loop {
        run_io(&peer, &mut transport).await;
        transport.close().await;
        peer.fail_outstanding_calls();
        if let Some(universe) = peer.universe.upgrade() {
            universe.unregister_peer(&peer);
        }

        if peer.closed() || !peer.auto_reconnect {
            peer.state_tx.send_replace(NodeState::Disconnected);
            peer.queue.close();
            return;
        }

        peer.state_tx.send_replace(NodeState::Connecting);
        match peer.reconnect().await {
            Some(next) => {
                transport = next;
                peer.state_tx.send_replace(NodeState::Connected);
                if let Some(universe) = peer.universe.upgrade() {
                    universe.register_peer(&peer);
                }
            }
            None => {
                peer.state_tx.send_replace(NodeState::Disconnected);
                peer.queue.close();
                if !peer.closed() {
                    peer.raise(Error::ReconnectionFailed(MAX_RECONNECT_ATTEMPTS));
                }
                return;
            }
        }
    }
}

async fn server_task(peer: Arc<Peer>, mut transport: Transport) {
    let handshake =
        tokio::time::timeout(HANDSHAKE_TIMEOUT, peer.server_handshake(&mut transport)).await;
    match handshake {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            peer.raise(err);
            transport.close().await;
            peer.state_tx.send_replace(NodeState::Disconnected);
            return;
        }
        Err(_elapsed) => {
            peer.raise(Error::MissingHandshake);
            transport.close().await;
            peer.state_tx.send_replace(NodeState::Disconnected);
            return;
        }
    }

    peer.state_tx.send_replace(NodeState::Connected);
    if let Some(universe) = peer.universe.upgrade() {
        universe.register_peer(&peer);
    }

    run_io(&peer, &mut transport).await;
    transport.close().await;
    peer.fail_outstanding_calls();
    if let Some(universe) = peer.universe.upgrade() {
        universe.unregister_peer(&peer);
    }
    peer.state_tx.send_replace(NodeState::Disconnected);
    peer.queue.close();
}
