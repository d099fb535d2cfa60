//! The stream abstraction: a named publish/subscribe surface carrying
//! packet pairs, with per-frameset channel availability and selection.
//!
//! Concrete variants: [`net::NetStream`] (peer-backed), [`file::FileStream`]
//! (append-only log), [`intercept::InterceptStream`] (tee/veto decorator).
//! All share [`StreamCore`], which owns the callback registries, the
//! availability tables and the drain counter.

pub mod errors;
pub mod file;
pub mod intercept;
pub mod net;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::errors::Error;
use crate::handle::{CallbackRegistry, Handle, PendingOps};
use crate::protocol::{ChannelSet, DataPacket, StreamPacket, FRAMESET_SENTINEL};

pub use errors::StreamError;
pub use file::FileStream;
pub use intercept::InterceptStream;
pub use net::NetStream;

/// How long `end()` waits for in-flight posts and dispatches to drain
/// before giving up and going inactive anyway.
pub const END_GRACE_TIMEOUT: Duration = Duration::from_secs(1);

/// One delivered packet pair.
#[derive(Debug, Clone)]
pub struct PacketEvent {
    pub spkt: StreamPacket,
    pub pkt: DataPacket,
}

pub type PacketCallback = Box<dyn Fn(&PacketEvent) -> bool + Send + Sync>;
pub type ErrorCallback = Box<dyn Fn(&Error) -> bool + Send + Sync>;

/// Tunable stream properties. Which keys a stream honours depends on the
/// variant; unsupported keys fail with
/// [`StreamError::UnsupportedProperty`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamProperty {
    Looping,
    Speed,
    Paused,
    Bitrate,
    MaxBitrate,
    AdaptiveBitrate,
    Observers,
    Uri,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    String(String),
}

impl PropertyValue {
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(b) => Some(*b),
            PropertyValue::Int(i) => Some(*i != 0),
            PropertyValue::String(_) => None,
        }
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            PropertyValue::Int(i) => Some(*i),
            PropertyValue::Bool(b) => Some(i64::from(*b)),
            PropertyValue::String(_) => None,
        }
    }
}

/// The polymorphic stream contract.
#[async_trait]
pub trait Stream: Send + Sync {
    /// Subscribe to ingress packets.
    fn on_packet(&self, cb: PacketCallback) -> Handle;

    /// Subscribe to asynchronous error events.
    fn on_error(&self, cb: ErrorCallback) -> Handle;

    /// Submit a packet for egress. `false` when the stream is inactive or
    /// the packet is rejected.
    async fn post(&self, spkt: StreamPacket, pkt: DataPacket) -> bool;

    /// Arm the transport. Idempotent.
    async fn begin(&self) -> bool;

    /// Drain in-flight work and go inactive. After this returns, no further
    /// `on_packet` callback fires.
    async fn end(&self) -> bool;

    fn active(&self) -> bool;

    /// Drop cached availability/selection state. May provoke a
    /// re-advertisement on network streams.
    fn reset(&self);

    fn set_property(&self, prop: StreamProperty, value: PropertyValue) -> Result<(), StreamError>;

    fn property(&self, prop: StreamProperty) -> Option<PropertyValue>;

    /// Channels observed or advertised at frameset `fs`.
    fn available(&self, fs: u32) -> Result<ChannelSet, StreamError>;

    /// Channels the local side has asked the remote to send at `fs`.
    fn selected(&self, fs: u32) -> Result<ChannelSet, StreamError>;

    /// Like [`Stream::selected`] but returns an empty set for unknown
    /// framesets.
    fn selected_no_except(&self, fs: u32) -> ChannelSet;

    /// Request `channels` from the remote at frameset `fs`. The sentinel
    /// frameset 255 is silently ignored.
    fn select(&self, fs: u32, channels: ChannelSet) -> Result<(), StreamError>;

    /// Framesets with any recorded availability or selection.
    fn enabled_framesets(&self) -> Vec<u32>;
}

#[derive(Default, Clone, Copy)]
struct FramesetState {
    available: ChannelSet,
    selected: ChannelSet,
}

/// State shared by every stream variant.
pub(crate) struct StreamCore {
    packet_cbs: CallbackRegistry<PacketEvent>,
    error_cbs: CallbackRegistry<Error>,
    active: AtomicBool,
    pending: PendingOps,
    framesets: RwLock<HashMap<u32, FramesetState>>,
    properties: RwLock<HashMap<StreamProperty, PropertyValue>>,
}

impl StreamCore {
    pub(crate) fn new() -> Self {
        StreamCore {
            packet_cbs: CallbackRegistry::new(),
            error_cbs: CallbackRegistry::new(),
            active: AtomicBool::new(false),
            pending: PendingOps::new(),
            framesets: RwLock::new(HashMap::new()),
            properties: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn on_packet(&self, cb: PacketCallback) -> Handle {
        self.packet_cbs.add(move |ev| cb(ev))
    }

    pub(crate) fn on_error(&self, cb: ErrorCallback) -> Handle {
        self.error_cbs.add(move |err| cb(err))
    }

    pub(crate) fn active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Returns whether the stream was inactive before (begin idempotence).
    pub(crate) fn set_active(&self, on: bool) -> bool {
        self.active.swap(on, Ordering::AcqRel) != on
    }

    pub(crate) fn pending(&self) -> &PendingOps {
        &self.pending
    }

    /// Record availability and fan the packet out. Dispatch failures are
    /// surfaced through the error registry.
    pub(crate) fn deliver(&self, mut event: PacketEvent) {
        event.spkt.local_timestamp = crate::time::get_time();
        self.note_available(event.spkt.stream_id, event.spkt.channel);
        if self.packet_cbs.dispatch(&event) > 0 {
            self.raise_error(&Error::DispatchFailed);
        }
    }

    pub(crate) fn raise_error(&self, err: &Error) {
        tracing::debug!("stream error event: {err}");
        self.error_cbs.dispatch(err);
    }

    pub(crate) fn note_available(&self, fs: u32, channel: crate::protocol::Channel) {
        self.framesets.write().entry(fs).or_default().available += channel;
    }

    pub(crate) fn available(&self, fs: u32) -> Result<ChannelSet, StreamError> {
        self.framesets
            .read()
            .get(&fs)
            .map(|s| s.available)
            .ok_or(StreamError::OutOfBounds(fs))
    }

    pub(crate) fn selected(&self, fs: u32) -> Result<ChannelSet, StreamError> {
        self.framesets
            .read()
            .get(&fs)
            .map(|s| s.selected)
            .ok_or(StreamError::OutOfBounds(fs))
    }

    pub(crate) fn selected_no_except(&self, fs: u32) -> ChannelSet {
        self.framesets
            .read()
            .get(&fs)
            .map(|s| s.selected)
            .unwrap_or_default()
    }

    pub(crate) fn select(&self, fs: u32, channels: ChannelSet) -> Result<(), StreamError> {
        if fs == FRAMESET_SENTINEL {
            return Ok(());
        }
        self.framesets.write().entry(fs).or_default().selected = channels;
        Ok(())
    }

    pub(crate) fn enabled_framesets(&self) -> Vec<u32> {
        let mut out: Vec<u32> = self.framesets.read().keys().copied().collect();
        out.sort_unstable();
        out
    }

    pub(crate) fn reset_state(&self) {
        self.framesets.write().clear();
    }

    pub(crate) fn set_property(&self, prop: StreamProperty, value: PropertyValue) {
        self.properties.write().insert(prop, value);
    }

    pub(crate) fn property(&self, prop: StreamProperty) -> Option<PropertyValue> {
        self.properties.read().get(&prop).cloned()
    }

    pub(crate) fn bool_property(&self, prop: StreamProperty) -> bool {
        self.property(prop).and_then(|v| v.as_bool()).unwrap_or(false)
    }

    pub(crate) fn int_property(&self, prop: StreamProperty, default: i64) -> i64 {
        self.property(prop).and_then(|v| v.as_int()).unwrap_or(default)
    }

    /// Drain in-flight operations and go inactive. Returns `true` when the
    /// drain completed inside the grace period.
    pub(crate) async fn end(&self) -> bool {
        if !self.set_active(false) {
            return true;
        }
        let drained = self.pending.wait_idle(END_GRACE_TIMEOUT).await;
        // Whatever happens, no further callbacks once end() returns.
        self.packet_cbs.clear();
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Channel;

    #[test]
    fn availability_tables() {
        let core = StreamCore::new();
        core.note_available(0, Channel::COLOUR);
        core.note_available(0, Channel::DEPTH);

        let avail = core.available(0).expect("frameset 0");
        assert!(avail.contains(Channel::COLOUR));
        assert!(avail.contains(Channel::DEPTH));

        assert!(matches!(
            core.available(5),
            Err(StreamError::OutOfBounds(5))
        ));
        assert!(matches!(core.selected(5), Err(StreamError::OutOfBounds(5))));
        assert!(core.selected_no_except(5).is_empty());
    }

    #[test]
    fn sentinel_frameset_is_ignored_by_select() {
        let core = StreamCore::new();
        core.select(FRAMESET_SENTINEL, ChannelSet::from_iter([Channel::COLOUR]))
            .expect("sentinel select is a no-op");
        assert!(core.enabled_framesets().is_empty());

        core.select(1, ChannelSet::from_iter([Channel::COLOUR]))
            .expect("select");
        assert_eq!(core.enabled_framesets(), vec![1]);
        assert!(core.selected(1).expect("fs 1").contains(Channel::COLOUR));
    }

    #[test]
    fn reset_clears_tables() {
        let core = StreamCore::new();
        core.note_available(0, Channel::COLOUR);
        core.select(0, ChannelSet::from_iter([Channel::COLOUR]))
            .expect("select");
        core.reset_state();
        assert!(core.enabled_framesets().is_empty());
    }

    #[test]
    fn property_round_trip() {
        let core = StreamCore::new();
        core.set_property(StreamProperty::Looping, PropertyValue::Bool(true));
        core.set_property(StreamProperty::Speed, PropertyValue::Int(2));
        assert!(core.bool_property(StreamProperty::Looping));
        assert_eq!(core.int_property(StreamProperty::Speed, 1), 2);
        assert_eq!(core.int_property(StreamProperty::Bitrate, -1), -1);
    }
}
