//! Frame transport configuration and message codecs.
//!
//! Framing itself is delegated to `tokio-util`'s length-field codec;
//! [`FrameConfig`] holds the knobs (byte order, length-field width, offset,
//! adjustment, strip count) and yields a fresh codec per connection half.
//!
//! On top of frames sits a [`MessageCodec`]: the mapping between one frame
//! payload and one application message. The canonical codec is [`RawCodec`]
//! (opaque bytes, decode never fails). [`TaggedCodec`] is the alternate
//! wire shape with a 2-byte big-endian protocol id ahead of the payload.

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::LengthDelimitedCodec;

use crate::error::DecodeError;

/// Byte order of the length field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Most significant byte first.
    BigEndian,
    /// Least significant byte first.
    LittleEndian,
}

/// Length-field framing parameters for one server.
///
/// Applied identically to the read and write half of every accepted socket.
/// The two presets cover the common case: a bare 4-byte length prefix that
/// is stripped before the payload reaches the application.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Byte order of the length field.
    pub byte_order: ByteOrder,
    /// Width of the length field in bytes (1..=8).
    pub length_field_length: usize,
    /// Bytes before the length field.
    pub length_field_offset: usize,
    /// Amount added to the decoded length to locate the frame end.
    pub length_adjustment: isize,
    /// Bytes stripped from the front of each decoded frame.
    pub strip: usize,
    /// Upper bound on a single frame, in bytes.
    pub max_frame_length: usize,
}

const DEFAULT_MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

impl FrameConfig {
    /// 4-byte big-endian length prefix, no offset or adjustment, strip 4.
    pub fn big_endian() -> Self {
        Self {
            byte_order: ByteOrder::BigEndian,
            length_field_length: 4,
            length_field_offset: 0,
            length_adjustment: 0,
            strip: 4,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }

    /// 4-byte little-endian length prefix, no offset or adjustment, strip 4.
    pub fn little_endian() -> Self {
        Self { byte_order: ByteOrder::LittleEndian, ..Self::big_endian() }
    }

    /// Build a codec instance for one stream half.
    pub(crate) fn build(&self) -> LengthDelimitedCodec {
        let mut builder = LengthDelimitedCodec::builder();
        builder
            .length_field_offset(self.length_field_offset)
            .length_field_length(self.length_field_length)
            .length_adjustment(self.length_adjustment)
            .num_skip(self.strip)
            .max_frame_length(self.max_frame_length);
        match self.byte_order {
            ByteOrder::BigEndian => builder.big_endian(),
            ByteOrder::LittleEndian => builder.little_endian(),
        };
        builder.new_codec()
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self::big_endian()
    }
}

/// Mapping between one frame payload and one application message.
///
/// `decode` runs once per received frame on the connection's lifecycle task;
/// a decode failure is reported through
/// [`EventHandler::on_parsing_failed`](crate::EventHandler::on_parsing_failed)
/// rather than surfaced as a transport error.
pub trait MessageCodec: Send + Sync + 'static {
    /// Message produced from one frame.
    type Message: Send + 'static;

    /// Decode one frame payload.
    fn decode(&self, frame: Bytes) -> Result<Self::Message, DecodeError>;

    /// Encode one message into a frame payload.
    fn encode(&self, message: &Self::Message) -> Bytes;
}

/// Canonical codec: the frame payload is the message, untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl MessageCodec for RawCodec {
    type Message = Bytes;

    fn decode(&self, frame: Bytes) -> Result<Bytes, DecodeError> {
        Ok(frame)
    }

    fn encode(&self, message: &Bytes) -> Bytes {
        message.clone()
    }
}

/// Message carrying a 2-byte protocol id ahead of its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedMessage {
    /// Application-defined protocol id.
    pub protocol: u16,
    /// Opaque payload bytes.
    pub payload: Bytes,
}

impl TaggedMessage {
    /// Create a tagged message.
    pub fn new(protocol: u16, payload: impl Into<Bytes>) -> Self {
        Self { protocol, payload: payload.into() }
    }
}

/// Alternate codec: big-endian `u16` protocol id, then the payload.
///
/// Frames shorter than two bytes fail to decode, which is what drives
/// `on_parsing_failed` for applications using this wire shape.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaggedCodec;

impl MessageCodec for TaggedCodec {
    type Message = TaggedMessage;

    fn decode(&self, frame: Bytes) -> Result<TaggedMessage, DecodeError> {
        if frame.len() < 2 {
            return Err(DecodeError::MissingProtocolId { len: frame.len() });
        }
        let protocol = u16::from_be_bytes([frame[0], frame[1]]);
        Ok(TaggedMessage { protocol, payload: frame.slice(2..) })
    }

    fn encode(&self, message: &TaggedMessage) -> Bytes {
        let mut buf = BytesMut::with_capacity(2 + message.payload.len());
        buf.put_u16(message.protocol);
        buf.extend_from_slice(&message.payload);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use tokio_util::codec::{Decoder, Encoder};

    use super::*;

    fn frame_roundtrip(config: &FrameConfig, payload: &[u8]) -> (Vec<u8>, Bytes) {
        let mut codec = config.build();
        let mut wire = BytesMut::new();
        codec.encode(Bytes::copy_from_slice(payload), &mut wire).unwrap();
        let encoded = wire.to_vec();
        let decoded = codec.decode(&mut wire).unwrap().unwrap().freeze();
        (encoded, decoded)
    }

    #[test]
    fn big_endian_preset_prefixes_length() {
        let (encoded, decoded) = frame_roundtrip(&FrameConfig::big_endian(), b"HELLO");
        assert_eq!(encoded, [&[0u8, 0, 0, 5][..], &b"HELLO"[..]].concat());
        assert_eq!(&decoded[..], b"HELLO");
    }

    #[test]
    fn little_endian_preset_reverses_prefix() {
        let (encoded, decoded) = frame_roundtrip(&FrameConfig::little_endian(), b"HELLO");
        assert_eq!(encoded, [&[5u8, 0, 0, 0][..], &b"HELLO"[..]].concat());
        assert_eq!(&decoded[..], b"HELLO");
    }

    #[test]
    fn empty_payload_roundtrips() {
        let (encoded, decoded) = frame_roundtrip(&FrameConfig::big_endian(), b"");
        assert_eq!(encoded, [0, 0, 0, 0]);
        assert!(decoded.is_empty());
    }

    #[test]
    fn tagged_codec_roundtrips() {
        let codec = TaggedCodec;
        let message = TaggedMessage::new(0x0102, &b"PING"[..]);
        let wire = codec.encode(&message);
        assert_eq!(&wire[..], &[1, 2, b'P', b'I', b'N', b'G']);
        assert_eq!(codec.decode(wire).unwrap(), message);
    }

    #[test]
    fn tagged_codec_allows_empty_payload() {
        let codec = TaggedCodec;
        let decoded = codec.decode(Bytes::from_static(&[0, 7])).unwrap();
        assert_eq!(decoded.protocol, 7);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn tagged_codec_rejects_short_frames() {
        let codec = TaggedCodec;
        assert_eq!(
            codec.decode(Bytes::from_static(&[9])),
            Err(DecodeError::MissingProtocolId { len: 1 })
        );
        assert_eq!(
            codec.decode(Bytes::new()),
            Err(DecodeError::MissingProtocolId { len: 0 })
        );
    }

    #[test]
    fn raw_codec_is_identity() {
        let codec = RawCodec;
        let frame = Bytes::from_static(b"anything");
        assert_eq!(codec.decode(frame.clone()).unwrap(), frame);
        assert_eq!(codec.encode(&frame), frame);
    }

    proptest! {
        #[test]
        fn any_payload_roundtrips_big_endian(payload in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let (encoded, decoded) = frame_roundtrip(&FrameConfig::big_endian(), &payload);
            let len = u32::try_from(payload.len()).unwrap();
            prop_assert_eq!(&encoded[..4], len.to_be_bytes());
            prop_assert_eq!(&encoded[4..], &payload[..]);
            prop_assert_eq!(&decoded[..], &payload[..]);
        }

        #[test]
        fn any_payload_roundtrips_little_endian(payload in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let (encoded, decoded) = frame_roundtrip(&FrameConfig::little_endian(), &payload);
            let len = u32::try_from(payload.len()).unwrap();
            prop_assert_eq!(&encoded[..4], len.to_le_bytes());
            prop_assert_eq!(&decoded[..], &payload[..]);
        }
    }
}
