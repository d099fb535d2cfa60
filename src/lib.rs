//! Peer-to-peer media streaming.
//!
//! Nodes form an ad-hoc network of [`net::Universe`] instances connected
//! over framed TCP or WebSocket. Each universe can produce named packet
//! streams (`ftl://name`), consume streams advertised by its peers, record
//! to and replay from `file://` logs, and expose named RPC endpoints to the
//! network. Packets are `(StreamPacket, DataPacket)` pairs addressing a
//! `(frameset, frame, channel, timestamp)` coordinate with an opaque
//! encoded payload.
//!
//! ```no_run
//! use beyond_protocol::{Channel, Codec, DataPacket, StreamPacket, Universe};
//! use bytes::Bytes;
//!
//! # async fn demo() -> Result<(), beyond_protocol::Error> {
//! let node = Universe::new();
//! node.listen("tcp://0.0.0.0:9001").await?;
//!
//! let stream = node.create_stream("ftl://camera0")?;
//! stream.begin().await;
//! let spkt = StreamPacket::new(0, 0, 0, Channel::COLOUR);
//! let pkt = DataPacket::new(Codec::Jpg, Bytes::from_static(b"..."));
//! stream.post(spkt, pkt).await;
//! # Ok(())
//! # }
//! ```

pub mod errors;
pub mod handle;
pub mod net;
pub mod protocol;
pub mod stream;
pub mod time;

pub use errors::Error;
pub use handle::Handle;
pub use net::{NodeState, Peer, PeerId, Universe};
pub use protocol::{Channel, ChannelSet, Codec, DataPacket, FrameId, StreamPacket};
pub use stream::{PacketEvent, PropertyValue, Stream, StreamError, StreamProperty};
