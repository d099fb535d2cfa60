//! A stream decorator that sees every packet before the wrapped stream
//! does, and may veto it.

use std::sync::Arc;

use async_trait::async_trait;

use crate::handle::{FilterRegistry, Handle};
use crate::protocol::{ChannelSet, DataPacket, StreamPacket};

use super::{
    ErrorCallback, PacketCallback, PacketEvent, PropertyValue, Stream, StreamError, StreamProperty,
};

/// Wraps any stream; intercept callbacks run on egress before the inner
/// `post` and may rewrite the packet in place. Any callback returning
/// `false` drops the packet without it ever reaching the inner stream.
pub struct InterceptStream {
    inner: Arc<dyn Stream>,
    intercepts: FilterRegistry<PacketEvent>,
}

impl InterceptStream {
    #[must_use]
    pub fn new(inner: Arc<dyn Stream>) -> Arc<InterceptStream> {
        Arc::new(InterceptStream {
            inner,
            intercepts: FilterRegistry::new(),
        })
    }

    /// Observe, rewrite or veto outgoing packets.
    pub fn on_intercept<F>(&self, cb: F) -> Handle
    where
        F: Fn(&mut PacketEvent) -> bool + Send + Sync + 'static,
    {
        self.intercepts.add(cb)
    }

    #[must_use]
    pub fn inner(&self) -> &Arc<dyn Stream> {
        &self.inner
    }
}

#[async_trait]
impl Stream for InterceptStream {
    fn on_packet(&self, cb: PacketCallback) -> Handle {
        self.inner.on_packet(cb)
    }

    fn on_error(&self, cb: ErrorCallback) -> Handle {
        self.inner.on_error(cb)
    }

    async fn post(&self, spkt: StreamPacket, pkt: DataPacket) -> bool {
        let mut event = PacketEvent { spkt, pkt };
        if !self.intercepts.dispatch_mut(&mut event) {
            tracing::trace!(channel = %event.spkt.channel, "packet vetoed");
            return false;
        }
        self.inner.post(event.spkt, event.pkt).await
    }

    async fn begin(&self) -> bool {
        self.inner.begin().await
    }

    async fn end(&self) -> bool {
        self.inner.end().await
    }

    fn active(&self) -> bool {
        self.inner.active()
    }

    fn reset(&self) {
        self.inner.reset();
    }

    fn set_property(&self, prop: StreamProperty, value: PropertyValue) -> Result<(), StreamError> {
        self.inner.set_property(prop, value)
    }

    fn property(&self, prop: StreamProperty) -> Option<PropertyValue> {
        self.inner.property(prop)
    }

    fn available(&self, fs: u32) -> Result<ChannelSet, StreamError> {
        self.inner.available(fs)
    }

    fn selected(&self, fs: u32) -> Result<ChannelSet, StreamError> {
        self.inner.selected(fs)
    }

    fn selected_no_except(&self, fs: u32) -> ChannelSet {
        self.inner.selected_no_except(fs)
    }

    fn select(&self, fs: u32, channels: ChannelSet) -> Result<(), StreamError> {
        self.inner.select(fs, channels)
    }

    fn enabled_framesets(&self) -> Vec<u32> {
        self.inner.enabled_framesets()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Channel, Codec};
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Minimal sink stream that records what reaches it.
    struct SinkStream {
        core: super::super::StreamCore,
        posted: Mutex<Vec<PacketEvent>>,
    }

    impl SinkStream {
        fn new() -> Arc<SinkStream> {
            let core = super::super::StreamCore::new();
            core.set_active(true);
            Arc::new(SinkStream {
                core,
                posted: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Stream for SinkStream {
        fn on_packet(&self, cb: PacketCallback) -> Handle {
            self.core.on_packet(cb)
        }

        fn on_error(&self, cb: ErrorCallback) -> Handle {
            self.core.on_error(cb)
        }

        async fn post(&self, spkt: StreamPacket, pkt: DataPacket) -> bool {
            self.posted.lock().push(PacketEvent { spkt, pkt });
            true
        }

        async fn begin(&self) -> bool {
            self.core.set_active(true);
            true
        }

        async fn end(&self) -> bool {
            self.core.end().await
        }

        fn active(&self) -> bool {
            self.core.active()
        }

        fn reset(&self) {
            self.core.reset_state();
        }

        fn set_property(
            &self,
            prop: StreamProperty,
            value: PropertyValue,
        ) -> Result<(), StreamError> {
            self.core.set_property(prop, value);
            Ok(())
        }

        fn property(&self, prop: StreamProperty) -> Option<PropertyValue> {
            self.core.property(prop)
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
            self.core.select(fs, channels)
        }

        fn enabled_framesets(&self) -> Vec<u32> {
            self.core.enabled_framesets()
        }
    }

    fn sample(channel: Channel) -> (StreamPacket, DataPacket) {
        (
            StreamPacket::new(100, 0, 0, channel),
            DataPacket::new(Codec::Jpg, Bytes::from_static(b"data")),
        )
    }

    #[tokio::test]
    async fn intercept_sees_packets_and_forwards() {
        let sink = SinkStream::new();
        let wrapped = InterceptStream::new(Arc::clone(&sink) as Arc<dyn Stream>);

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let _handle = wrapped.on_intercept(move |_: &mut PacketEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });

        let (spkt, pkt) = sample(Channel::COLOUR);
        assert!(wrapped.post(spkt, pkt).await);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(sink.posted.lock().len(), 1);
    }

    #[tokio::test]
    async fn veto_blocks_the_packet_but_keeps_the_callback() {
        let sink = SinkStream::new();
        let wrapped = InterceptStream::new(Arc::clone(&sink) as Arc<dyn Stream>);

        let _handle = wrapped.on_intercept(|ev: &mut PacketEvent| ev.spkt.channel != Channel::DEPTH);

        let (spkt, pkt) = sample(Channel::DEPTH);
        assert!(!wrapped.post(spkt, pkt).await);
        assert!(sink.posted.lock().is_empty());

        let (spkt, pkt) = sample(Channel::COLOUR);
        assert!(wrapped.post(spkt, pkt).await);
        assert_eq!(sink.posted.lock().len(), 1);

        // The veto did not unsubscribe the callback.
        let (spkt, pkt) = sample(Channel::DEPTH);
        assert!(!wrapped.post(spkt, pkt).await);
    }

    #[tokio::test]
    async fn intercepts_may_rewrite_packets() {
        let sink = SinkStream::new();
        let wrapped = InterceptStream::new(Arc::clone(&sink) as Arc<dyn Stream>);

        let _handle = wrapped.on_intercept(|ev: &mut PacketEvent| {
            ev.spkt.flags |= crate::protocol::flags::COMPLETED;
            true
        });

        let (spkt, pkt) = sample(Channel::COLOUR);
        assert_eq!(spkt.flags, 0);
        assert!(wrapped.post(spkt, pkt).await);
        let posted = sink.posted.lock();
        assert_eq!(posted[0].spkt.flags, crate::protocol::flags::COMPLETED);
    }

    #[tokio::test]
    async fn delegation_passes_through() {
        let sink = SinkStream::new();
        let wrapped = InterceptStream::new(Arc::clone(&sink) as Arc<dyn Stream>);

        wrapped
            .select(0, ChannelSet::from_iter([Channel::COLOUR]))
            .expect("select");
        assert!(sink.selected(0).expect("fs 0").contains(Channel::COLOUR));
        assert!(wrapped.active());
        assert!(wrapped.end().await);
        assert!(!sink.active());
    }
}
