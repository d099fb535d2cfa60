//! Network-backed streams.
//!
//! A producer [`NetStream`] fans posted packets out to every subscribed
//! peer, honouring the remote channel selection. A consumer `NetStream`
//! subscribes to one advertising peer and feeds inbound packets to its
//! callbacks, nudging the remote with its selection when an unselected
//! channel shows up.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use crate::errors::Error;
use crate::handle::Handle;
use crate::net::peer::{CoalesceKey, Peer, PeerId};
use crate::net::universe::{SelectMsg, StreamRef, UniverseInner};
use crate::protocol::packet::PACKET_VERSION;
use crate::protocol::wire::{
    encode_packet_body, MAX_FRAME_SIZE, MSG_REGISTER, MSG_SELECT, MSG_SUBSCRIBE, MSG_UNREGISTER,
    MSG_UNSUBSCRIBE,
};
use crate::protocol::{flags, ChannelSet, DataPacket, NetMessage, StreamPacket, MAX_FRAMESETS};

use super::{
    ErrorCallback, PacketCallback, PacketEvent, PropertyValue, Stream, StreamCore, StreamError,
    StreamProperty,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Producer,
    Consumer,
}

pub struct NetStream {
    core: StreamCore,
    uri: String,
    role: Role,
    universe: Weak<UniverseInner>,
    /// Subscribers for a producer; the advertising source for a consumer.
    peers: DashMap<PeerId, Arc<Peer>>,
    /// Channels requested up front through the URI query.
    preselect: ChannelSet,
}

impl NetStream {
    pub(crate) fn producer(uri: String, universe: Weak<UniverseInner>) -> Arc<NetStream> {
        Arc::new(NetStream {
            core: StreamCore::new(),
            uri,
            role: Role::Producer,
            universe,
            peers: DashMap::new(),
            preselect: ChannelSet::new(),
        })
    }

    pub(crate) fn consumer(
        uri: String,
        preselect: ChannelSet,
        universe: Weak<UniverseInner>,
    ) -> Arc<NetStream> {
        Arc::new(NetStream {
            core: StreamCore::new(),
            uri,
            role: Role::Consumer,
            universe,
            peers: DashMap::new(),
            preselect,
        })
    }

    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub(crate) fn attach_peer(&self, peer: &Arc<Peer>) {
        if let Some(id) = peer.remote_id() {
            self.peers.insert(id, Arc::clone(peer));
        }
    }

    pub(crate) fn detach_peer(&self, id: PeerId) {
        self.peers.remove(&id);
    }

    fn peer_snapshot(&self) -> Vec<Arc<Peer>> {
        self.peers.iter().map(|p| Arc::clone(&p)).collect()
    }

    /// Subscribe to an advertising peer and replay our channel selection.
    pub(crate) async fn subscribe_to(&self, peer: &Arc<Peer>) {
        self.attach_peer(peer);
        let request = StreamRef {
            uri: self.uri.clone(),
        };
        if let Err(err) = peer.send(MSG_SUBSCRIBE, &request).await {
            self.core.raise_error(&err);
            return;
        }
        for fs in self.core.enabled_framesets() {
            let selected = self.core.selected_no_except(fs);
            if !selected.is_empty() {
                let msg = SelectMsg::new(&self.uri, fs, selected);
                if let Err(err) = peer.send(MSG_SELECT, &msg).await {
                    self.core.raise_error(&err);
                }
            }
        }
    }

    /// A remote subscriber's channel selection, applied producer-side.
    pub(crate) fn apply_selection(&self, fs: u32, channels: ChannelSet) {
        tracing::debug!(uri = %self.uri, fs, %channels, "remote selection");
        let _ = self.core.select(fs, channels);
    }

    /// Feed one inbound packet pair from a peer task.
    pub(crate) fn process_inbound(&self, peer: &Arc<Peer>, spkt: StreamPacket, pkt: DataPacket) {
        if !self.core.active() {
            return;
        }
        let _guard = self.core.pending().guard();

        if spkt.flags & flags::RESET != 0 {
            self.core.reset_state();
        }

        if spkt.flags & flags::REQUEST != 0 {
            // A request packet widens the requester's selection.
            if self.role == Role::Producer {
                let widened = self.core.selected_no_except(spkt.stream_id) + spkt.channel;
                let _ = self.core.select(spkt.stream_id, widened);
            }
            return;
        }

        if self.role == Role::Producer {
            // Producers do not consume data packets.
            return;
        }

        let selected = self.core.selected_no_except(spkt.stream_id);
        if !selected.is_empty() && !selected.contains(spkt.channel) {
            // The packet still delivers, but remind the remote what we
            // asked for so it stops sending this channel.
            self.push_selection_to(peer, spkt.stream_id, selected);
        }

        self.core.deliver(PacketEvent { spkt, pkt });
    }

    fn push_selection_to(&self, peer: &Arc<Peer>, fs: u32, selected: ChannelSet) {
        let msg = SelectMsg::new(&self.uri, fs, selected);
        if let Ok(body) = serde_json::to_vec(&msg) {
            let _ = peer.try_enqueue(
                NetMessage::notify(MSG_SELECT, Bytes::from(body)),
                // One nudge per frameset in flight is plenty.
                Some((fs, u8::MAX)),
            );
        }
    }

    fn broadcast_control(&self, name: &str, peers: &[Arc<Peer>]) {
        let request = StreamRef {
            uri: self.uri.clone(),
        };
        let Ok(body) = serde_json::to_vec(&request) else {
            return;
        };
        for peer in peers {
            let _ = peer.try_enqueue(
                NetMessage::notify(name, Bytes::from(body.clone())),
                None,
            );
        }
    }
}

#[async_trait]
impl Stream for NetStream {
    fn on_packet(&self, cb: PacketCallback) -> Handle {
        self.core.on_packet(cb)
    }

    fn on_error(&self, cb: ErrorCallback) -> Handle {
        self.core.on_error(cb)
    }

    async fn post(&self, spkt: StreamPacket, pkt: DataPacket) -> bool {
        if !self.core.active() {
            return false;
        }
        if spkt.stream_id >= MAX_FRAMESETS {
            self.core.raise_error(&Error::PacketFailure(format!(
                "frameset {} out of range",
                spkt.stream_id
            )));
            return false;
        }
        let _guard = self.core.pending().guard();

        let mut spkt = spkt;
        spkt.version = PACKET_VERSION;
        if spkt.timestamp == 0 {
            spkt.timestamp = crate::time::get_time();
        }
        self.core.note_available(spkt.stream_id, spkt.channel);

        // Honour the remote selection; an empty selection means everything.
        let selected = self.core.selected_no_except(spkt.stream_id);
        if self.role == Role::Producer
            && !selected.is_empty()
            && !selected.contains(spkt.channel)
            && spkt.flags & flags::REQUEST == 0
        {
            return true;
        }

        let body = encode_packet_body(&spkt, &pkt);
        if body.len() > MAX_FRAME_SIZE - self.uri.len() - 16 {
            self.core.raise_error(&Error::PacketFailure(format!(
                "payload of {} bytes exceeds the frame limit",
                body.len()
            )));
            return false;
        }

        // Requests must never coalesce away; data may.
        let key: Option<CoalesceKey> = if spkt.flags & flags::REQUEST == 0 {
            Some((spkt.stream_id, spkt.channel.0))
        } else {
            None
        };

        let mut delivered_everywhere = true;
        for peer in self.peer_snapshot() {
            let msg = NetMessage::notify(self.uri.clone(), body.clone());
            if let Err(err) = peer.enqueue(msg, key).await {
                self.core.raise_error(&err);
                delivered_everywhere = false;
            }
        }
        delivered_everywhere
    }

    async fn begin(&self) -> bool {
        if !self.core.set_active(true) {
            return true;
        }

        if !self.preselect.is_empty() && self.core.selected_no_except(0).is_empty() {
            let _ = self.core.select(0, self.preselect);
        }

        let Some(universe) = self.universe.upgrade() else {
            self.core.set_active(false);
            return false;
        };
        match self.role {
            Role::Producer => {
                // Advertise to everyone already connected; later joiners get
                // the replay from peer registration.
                let peers: Vec<Arc<Peer>> =
                    universe.peers.iter().map(|p| Arc::clone(&p)).collect();
                self.broadcast_control(MSG_REGISTER, &peers);
            }
            Role::Consumer => {
                let source = universe
                    .remote_names
                    .get(&self.uri)
                    .map(|owner| *owner.value())
                    .and_then(|id| universe.peers.get(&id).map(|p| Arc::clone(&p)));
                if let Some(peer) = source {
                    self.subscribe_to(&peer).await;
                }
                // Otherwise wait for the remote's register notify.
            }
        }
        true
    }

    async fn end(&self) -> bool {
        if !self.core.active() {
            return true;
        }
        let peers = self.peer_snapshot();
        match self.role {
            Role::Producer => {
                if let Some(universe) = self.universe.upgrade() {
                    let all: Vec<Arc<Peer>> =
                        universe.peers.iter().map(|p| Arc::clone(&p)).collect();
                    self.broadcast_control(MSG_UNREGISTER, &all);
                }
            }
            Role::Consumer => self.broadcast_control(MSG_UNSUBSCRIBE, &peers),
        }
        self.peers.clear();
        self.core.end().await
    }

    fn active(&self) -> bool {
        self.core.active()
    }

    fn reset(&self) {
        self.core.reset_state();
        if !self.core.active() {
            return;
        }
        match self.role {
            Role::Producer => {
                if let Some(universe) = self.universe.upgrade() {
                    let peers: Vec<Arc<Peer>> =
                        universe.peers.iter().map(|p| Arc::clone(&p)).collect();
                    self.broadcast_control(MSG_REGISTER, &peers);
                }
            }
            Role::Consumer => {
                let peers = self.peer_snapshot();
                self.broadcast_control(MSG_SUBSCRIBE, &peers);
            }
        }
    }

    fn set_property(&self, prop: StreamProperty, value: PropertyValue) -> Result<(), StreamError> {
        match prop {
            StreamProperty::Bitrate
            | StreamProperty::MaxBitrate
            | StreamProperty::AdaptiveBitrate => {
                self.core.set_property(prop, value);
                Ok(())
            }
            _ => Err(StreamError::UnsupportedProperty(prop)),
        }
    }

    fn property(&self, prop: StreamProperty) -> Option<PropertyValue> {
        match prop {
            StreamProperty::Observers => Some(PropertyValue::Int(self.peers.len() as i64)),
            StreamProperty::Uri => Some(PropertyValue::String(self.uri.clone())),
            _ => self.core.property(prop),
        }
    }

    fn available(&self, fs: u32) -> Result<ChannelSet, StreamError> {
        self.core.available(fs)
    }

    fn selected(&self, fs: u32) -> Result<ChannelSet, StreamError> {
        self.core.selected(fs)
    }

    fn selected_no_except(&self, fs: u32) -> ChannelSet {
        self.core.selected_no_except(fs)
    }

    fn select(&self, fs: u32, channels: ChannelSet) -> Result<(), StreamError> {
        self.core.select(fs, channels)?;
        // Consumers forward their selection to the source immediately.
        if self.role == Role::Consumer && self.core.active() {
            for peer in self.peer_snapshot() {
                let msg = SelectMsg::new(&self.uri, fs, channels);
                if let Ok(body) = serde_json::to_vec(&msg) {
                    let _ = peer.try_enqueue(
                        NetMessage::notify(MSG_SELECT, Bytes::from(body)),
                        None,
                    );
                }
            }
        }
        Ok(())
    }

    fn enabled_framesets(&self) -> Vec<u32> {
        self.core.enabled_framesets()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Channel, Codec};

    fn orphan_producer() -> Arc<NetStream> {
        NetStream::producer("ftl://test".to_owned(), Weak::new())
    }

    #[tokio::test]
    async fn post_requires_begin() {
        let stream = orphan_producer();
        let spkt = StreamPacket::new(1, 0, 0, Channel::COLOUR);
        let pkt = DataPacket::new(Codec::Jpg, Bytes::from_static(b"x"));
        assert!(!stream.post(spkt, pkt).await);
    }

    #[tokio::test]
    async fn begin_fails_without_a_universe() {
        // The weak back-reference is dead, so the stream cannot arm.
        let stream = orphan_producer();
        assert!(!stream.begin().await);
    }

    #[tokio::test]
    async fn selection_filters_producer_egress() {
        let stream = orphan_producer();
        // Force active without a universe.
        stream.core.set_active(true);
        stream
            .select(0, ChannelSet::from_iter([Channel::DEPTH]))
            .expect("select");

        let spkt = StreamPacket::new(1, 0, 0, Channel::COLOUR);
        let pkt = DataPacket::new(Codec::Jpg, Bytes::from_static(b"x"));
        // Filtered out, but not an error.
        assert!(stream.post(spkt, pkt).await);
        // Availability is still recorded for the dropped channel.
        assert!(stream.available(0).expect("fs 0").contains(Channel::COLOUR));
    }

    #[tokio::test]
    async fn oversized_posts_are_rejected() {
        let stream = orphan_producer();
        stream.core.set_active(true);
        let spkt = StreamPacket::new(1, 0, 0, Channel::COLOUR);
        let pkt = DataPacket::new(Codec::Raw, Bytes::from(vec![0u8; MAX_FRAME_SIZE]));
        assert!(!stream.post(spkt, pkt).await);
    }

    #[test]
    fn properties_expose_uri_and_observers() {
        let stream = orphan_producer();
        assert_eq!(
            stream.property(StreamProperty::Uri),
            Some(PropertyValue::String("ftl://test".to_owned()))
        );
        assert_eq!(
            stream.property(StreamProperty::Observers),
            Some(PropertyValue::Int(0))
        );
        assert!(matches!(
            stream.set_property(StreamProperty::Looping, PropertyValue::Bool(true)),
            Err(StreamError::UnsupportedProperty(StreamProperty::Looping))
        ));
        stream
            .set_property(StreamProperty::Bitrate, PropertyValue::Int(2000))
            .expect("bitrate is supported");
    }
}
