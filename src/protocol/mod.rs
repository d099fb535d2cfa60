//! Packet model and wire codec: the protocol's value types and their
//! little-endian framing, shared verbatim by sockets and the file log.

pub mod channel;
pub mod codec;
pub mod errors;
pub mod packet;
pub mod payload;
pub mod wire;

pub use channel::{Channel, ChannelSet};
pub use codec::Codec;
pub use errors::WireError;
pub use packet::{flags, DataPacket, FrameId, StreamPacket, FRAMESET_SENTINEL, MAX_FRAMESETS};
pub use payload::{pack, unpack, Calibration, Intrinsics, Pose};
pub use wire::{FrameCodec, MessageKind, NetMessage};
