//! The packet pair transmitted atomically for every frame of every channel:
//! a fixed-size [`StreamPacket`] routing envelope followed by a
//! length-prefixed [`DataPacket`] payload envelope. All scalars are
//! little-endian on the wire.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::channel::Channel;
use super::codec::Codec;
use super::errors::WireError;

/// Protocol revision carried in every stream packet.
pub const PACKET_VERSION: u32 = 5;

/// Wire size of the fixed [`StreamPacket`] header.
pub const STREAM_PACKET_SIZE: usize = 24;

/// Wire size of the fixed [`DataPacket`] header, excluding the payload
/// length prefix and payload.
pub const DATA_PACKET_HEADER_SIZE: usize = 16;

/// Frameset ids are 24-bit; 255 sources per frameset.
pub const MAX_FRAMESETS: u32 = 1 << 24;

/// Reserved frameset index, silently ignored by channel selection.
pub const FRAMESET_SENTINEL: u32 = 255;

/// `StreamPacket` flag bits.
pub mod flags {
    /// Last packet of this frame on this channel.
    pub const COMPLETED: u8 = 0x01;
    /// Packet is a request (selection or re-send), not data.
    pub const REQUEST: u8 = 0x02;
    /// Receiver should drop cached state before applying this packet.
    pub const RESET: u8 = 0x04;
}

/// 32-bit in-memory identifier packing a 24-bit frameset id and an 8-bit
/// source index. Never transmitted; the wire always carries the two fields
/// separately inside [`StreamPacket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(u32);

impl FrameId {
    #[must_use]
    pub fn new(frameset: u32, source: u32) -> Self {
        debug_assert!(frameset < MAX_FRAMESETS);
        debug_assert!(source <= 255);
        FrameId((frameset << 8) | (source & 0xff))
    }

    #[must_use]
    pub fn frameset(self) -> u32 {
        self.0 >> 8
    }

    #[must_use]
    pub fn source(self) -> u32 {
        self.0 & 0xff
    }
}

/// Routing envelope: where a payload belongs in (frameset, frame, channel,
/// time) space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamPacket {
    pub version: u32,
    /// Source clock milliseconds, including the source's clock adjustment.
    pub timestamp: i64,
    /// Frameset id (24-bit).
    pub stream_id: u32,
    /// Source index within the frameset.
    pub frame_number: u32,
    pub channel: Channel,
    pub flags: u8,
    /// Receive-side arrival time. Not transmitted; zero until decoded.
    pub local_timestamp: i64,
}

impl StreamPacket {
    #[must_use]
    pub fn new(timestamp: i64, stream_id: u32, frame_number: u32, channel: Channel) -> Self {
        StreamPacket {
            version: PACKET_VERSION,
            timestamp,
            stream_id,
            frame_number,
            channel,
            flags: 0,
            local_timestamp: 0,
        }
    }

    #[must_use]
    pub fn frame_id(&self) -> FrameId {
        FrameId::new(self.stream_id, self.frame_number)
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(STREAM_PACKET_SIZE);
        dst.put_u32_le(self.version);
        dst.put_i64_le(self.timestamp);
        dst.put_u32_le(self.stream_id);
        dst.put_u32_le(self.frame_number);
        dst.put_u8(self.channel.0);
        dst.put_u8(self.flags);
        dst.put_u16_le(0); // reserved
    }

    pub fn decode(src: &mut impl Buf) -> Result<Self, WireError> {
        if src.remaining() < STREAM_PACKET_SIZE {
            return Err(WireError::Truncated {
                needed: STREAM_PACKET_SIZE,
                have: src.remaining(),
            });
        }
        let version = src.get_u32_le();
        let timestamp = src.get_i64_le();
        let stream_id = src.get_u32_le();
        let frame_number = src.get_u32_le();
        let channel = Channel(src.get_u8());
        let flags = src.get_u8();
        let _reserved = src.get_u16_le();
        Ok(StreamPacket {
            version,
            timestamp,
            stream_id,
            frame_number,
            channel,
            flags,
            local_timestamp: 0,
        })
    }
}

/// Payload envelope: codec tag, rate hints and the opaque compressed blob.
/// The blob is a [`Bytes`] so fanning a packet out to many subscribers only
/// bumps a reference count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    pub codec: Codec,
    /// How many logical sub-frames the blob carries.
    pub frame_count: u8,
    /// Encoder bitrate hint, kbit/s. Zero when unknown.
    pub bitrate: u16,
    /// Encoder quality hint. Zero when unknown.
    pub quality: u32,
    pub flags: u32,
    pub data: Bytes,
}

impl DataPacket {
    #[must_use]
    pub fn new(codec: Codec, data: Bytes) -> Self {
        DataPacket {
            codec,
            frame_count: 1,
            bitrate: 0,
            quality: 0,
            flags: 0,
            data,
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(DATA_PACKET_HEADER_SIZE + 4 + self.data.len());
        dst.put_u8(self.codec as u8);
        dst.put_u8(self.frame_count);
        dst.put_u16_le(self.bitrate);
        dst.put_u32_le(self.quality);
        dst.put_u32_le(self.flags);
        dst.put_u32_le(0); // reserved
        dst.put_u32_le(self.data.len() as u32);
        dst.put_slice(&self.data);
    }

    pub fn decode(src: &mut Bytes) -> Result<Self, WireError> {
        if src.remaining() < DATA_PACKET_HEADER_SIZE + 4 {
            return Err(WireError::Truncated {
                needed: DATA_PACKET_HEADER_SIZE + 4,
                have: src.remaining(),
            });
        }
        let codec = Codec::from_u8(src.get_u8());
        let frame_count = src.get_u8();
        let bitrate = src.get_u16_le();
        let quality = src.get_u32_le();
        let flags = src.get_u32_le();
        let _reserved = src.get_u32_le();
        let len = src.get_u32_le() as usize;
        if src.remaining() < len {
            return Err(WireError::Truncated {
                needed: len,
                have: src.remaining(),
            });
        }
        let data = src.split_to(len);
        Ok(DataPacket {
            codec,
            frame_count,
            bitrate,
            quality,
            flags,
            data,
        })
    }
}
