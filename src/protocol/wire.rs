//! Message framing shared by sockets and the file log.
//!
//! Every wire message is a tagged record:
//!
//! ```text
//! [u32 length][u8 kind][u32 call_id][u16 name_len][name bytes][body bytes]
//! ```
//!
//! `length` counts the whole record including its own four bytes; all
//! scalars are little-endian. Stream packets travel as `Notify` records
//! whose name is the stream URI and whose body is
//! `StreamPacket || DataPacket`. RPC uses `Call`/`Response`/`ErrorResponse`
//! correlated by `call_id`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::errors::WireError;
use super::packet::{DataPacket, StreamPacket};

/// Fixed part of every record: length + kind + call id + name length.
const RECORD_OVERHEAD: usize = 4 + 1 + 4 + 2;

/// Hard ceiling on a single wire frame. Anything larger is treated as a
/// protocol violation rather than buffered.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Reserved message names. Stream notifies use the stream URI itself, which
/// always carries a scheme, so plain names never collide with these.
pub const MSG_HANDSHAKE: &str = "__handshake__";
pub const MSG_REGISTER: &str = "__register__";
pub const MSG_UNREGISTER: &str = "__unregister__";
pub const MSG_SUBSCRIBE: &str = "__subscribe__";
pub const MSG_UNSUBSCRIBE: &str = "__unsubscribe__";
pub const MSG_SELECT: &str = "__select__";
pub const MSG_FIND_STREAM: &str = "__find_stream__";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Notify = 0,
    Call = 1,
    Response = 2,
    ErrorResponse = 3,
}

impl MessageKind {
    pub fn from_u8(v: u8) -> Result<Self, WireError> {
        match v {
            0 => Ok(MessageKind::Notify),
            1 => Ok(MessageKind::Call),
            2 => Ok(MessageKind::Response),
            3 => Ok(MessageKind::ErrorResponse),
            other => Err(WireError::BadKind(other)),
        }
    }
}

/// One framed record. The body is opaque at this layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetMessage {
    pub kind: MessageKind,
    pub call_id: u32,
    pub name: String,
    pub body: Bytes,
}

impl NetMessage {
    #[must_use]
    pub fn notify(name: impl Into<String>, body: Bytes) -> Self {
        NetMessage {
            kind: MessageKind::Notify,
            call_id: 0,
            name: name.into(),
            body,
        }
    }

    #[must_use]
    pub fn call(call_id: u32, name: impl Into<String>, body: Bytes) -> Self {
        NetMessage {
            kind: MessageKind::Call,
            call_id,
            name: name.into(),
            body,
        }
    }

    #[must_use]
    pub fn response(call_id: u32, body: Bytes) -> Self {
        NetMessage {
            kind: MessageKind::Response,
            call_id,
            name: String::new(),
            body,
        }
    }

    #[must_use]
    pub fn error_response(call_id: u32, message: &str) -> Self {
        NetMessage {
            kind: MessageKind::ErrorResponse,
            call_id,
            name: String::new(),
            body: Bytes::copy_from_slice(message.as_bytes()),
        }
    }

    #[must_use]
    pub fn wire_len(&self) -> usize {
        RECORD_OVERHEAD + self.name.len() + self.body.len()
    }
}

/// Serialize one record onto `dst`.
pub fn encode_message(msg: &NetMessage, dst: &mut BytesMut) -> Result<(), WireError> {
    let total = msg.wire_len();
    if total > MAX_FRAME_SIZE {
        return Err(WireError::Oversized {
            size: total,
            max: MAX_FRAME_SIZE,
        });
    }
    if msg.name.len() > u16::MAX as usize {
        return Err(WireError::NameTooLong(msg.name.len()));
    }
    dst.reserve(total);
    dst.put_u32_le(total as u32);
    dst.put_u8(msg.kind as u8);
    dst.put_u32_le(msg.call_id);
    dst.put_u16_le(msg.name.len() as u16);
    dst.put_slice(msg.name.as_bytes());
    dst.put_slice(&msg.body);
    Ok(())
}

/// Try to take one complete record off the front of `src`. Returns
/// `Ok(None)` when more bytes are needed; consumes nothing in that case.
pub fn decode_message(src: &mut BytesMut) -> Result<Option<NetMessage>, WireError> {
    if src.len() < 4 {
        return Ok(None);
    }
    let total = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
    if total > MAX_FRAME_SIZE {
        return Err(WireError::Oversized {
            size: total,
            max: MAX_FRAME_SIZE,
        });
    }
    if total < RECORD_OVERHEAD {
        return Err(WireError::Truncated {
            needed: RECORD_OVERHEAD,
            have: total,
        });
    }
    if src.len() < total {
        return Ok(None);
    }

    let mut record = src.split_to(total).freeze();
    record.advance(4);
    let kind = MessageKind::from_u8(record.get_u8())?;
    let call_id = record.get_u32_le();
    let name_len = record.get_u16_le() as usize;
    if record.remaining() < name_len {
        return Err(WireError::Truncated {
            needed: name_len,
            have: record.remaining(),
        });
    }
    let name_bytes = record.split_to(name_len);
    let name = std::str::from_utf8(&name_bytes)?.to_owned();
    Ok(Some(NetMessage {
        kind,
        call_id,
        name,
        body: record,
    }))
}

/// Body of a stream notify: `StreamPacket || DataPacket`.
pub fn encode_packet_body(spkt: &StreamPacket, pkt: &DataPacket) -> Bytes {
    let mut buf = BytesMut::new();
    spkt.encode(&mut buf);
    pkt.encode(&mut buf);
    buf.freeze()
}

pub fn decode_packet_body(body: &Bytes) -> Result<(StreamPacket, DataPacket), WireError> {
    let mut buf = body.clone();
    let spkt = StreamPacket::decode(&mut buf)?;
    let pkt = DataPacket::decode(&mut buf)?;
    Ok((spkt, pkt))
}

/// `tokio_util` codec for [`NetMessage`] records, used by `Framed` TCP
/// transports and `FramedRead` over the file log.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = NetMessage;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<NetMessage>, WireError> {
        decode_message(src)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<NetMessage>, WireError> {
        // A partial trailing record is ordinary EOF: the writer was cut off
        // mid-append. Discard the tail instead of erroring.
        match decode_message(src)? {
            Some(msg) => Ok(Some(msg)),
            None => {
                src.clear();
                Ok(None)
            }
        }
    }
}

impl Encoder<NetMessage> for FrameCodec {
    type Error = WireError;

    fn encode(&mut self, item: NetMessage, dst: &mut BytesMut) -> Result<(), WireError> {
        encode_message(&item, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::channel::Channel;
    use crate::protocol::codec::Codec;

    fn sample_message() -> NetMessage {
        NetMessage::call(42, "ftl://demo", Bytes::from_static(b"hello"))
    }

    #[test]
    fn message_round_trip() {
        let msg = sample_message();
        let mut buf = BytesMut::new();
        encode_message(&msg, &mut buf).expect("encode");
        let decoded = decode_message(&mut buf).expect("decode").expect("complete");
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let msg = sample_message();
        let mut full = BytesMut::new();
        encode_message(&msg, &mut full).expect("encode");

        for cut in [0, 3, 5, full.len() - 1] {
            let mut partial = BytesMut::from(&full[..cut]);
            assert!(decode_message(&mut partial).expect("no error").is_none());
            assert_eq!(partial.len(), cut, "partial decode must not consume");
        }
    }

    #[test]
    fn two_messages_in_one_buffer() {
        let a = NetMessage::notify("ftl://a", Bytes::from_static(b"1"));
        let b = NetMessage::response(9, Bytes::from_static(b"2"));
        let mut buf = BytesMut::new();
        encode_message(&a, &mut buf).expect("encode a");
        encode_message(&b, &mut buf).expect("encode b");

        assert_eq!(decode_message(&mut buf).expect("ok"), Some(a));
        assert_eq!(decode_message(&mut buf).expect("ok"), Some(b));
        assert!(decode_message(&mut buf).expect("ok").is_none());
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le((MAX_FRAME_SIZE + 1) as u32);
        buf.put_slice(&[0u8; 16]);
        assert!(matches!(
            decode_message(&mut buf),
            Err(WireError::Oversized { .. })
        ));
    }

    #[test]
    fn overlong_names_are_rejected() {
        // A name past the u16 length field would truncate on encode and
        // desynchronize every record after it.
        let msg = NetMessage::notify("n".repeat(70_000), Bytes::new());
        let mut buf = BytesMut::new();
        assert!(matches!(
            encode_message(&msg, &mut buf),
            Err(WireError::NameTooLong(70_000))
        ));
        assert!(buf.is_empty());

        let ok = NetMessage::notify("n".repeat(u16::MAX as usize), Bytes::new());
        encode_message(&ok, &mut buf).expect("encode at the limit");
        let decoded = decode_message(&mut buf).expect("decode").expect("complete");
        assert_eq!(decoded.name.len(), u16::MAX as usize);
    }

    #[test]
    fn bad_kind_is_rejected() {
        let msg = sample_message();
        let mut buf = BytesMut::new();
        encode_message(&msg, &mut buf).expect("encode");
        buf[4] = 9; // corrupt the kind byte
        assert!(matches!(
            decode_message(&mut buf),
            Err(WireError::BadKind(9))
        ));
    }

    #[test]
    fn packet_body_round_trip() {
        let spkt = StreamPacket::new(100, 1, 0, Channel::COLOUR);
        let pkt = DataPacket::new(Codec::Jpg, Bytes::from_static(b"jpeg!"));
        let body = encode_packet_body(&spkt, &pkt);
        let (dspkt, dpkt) = decode_packet_body(&body).expect("decode");
        assert_eq!(dspkt, spkt);
        assert_eq!(dpkt, pkt);
    }

    #[test]
    fn decoder_eof_tolerates_partial_tail() {
        use tokio_util::codec::Decoder;
        let msg = sample_message();
        let mut buf = BytesMut::new();
        encode_message(&msg, &mut buf).expect("encode");
        buf.truncate(buf.len() - 2);

        let mut codec = FrameCodec;
        assert!(codec.decode_eof(&mut buf).expect("tolerant").is_none());
        assert!(buf.is_empty());
    }
}
