//! Wire-frame encoding and decoding.
//!
//! Every message on the wire is a binary frame with a fixed 9-byte header:
//! one type byte, then a `u64` message id in network byte order, then the
//! opaque payload. Frames shorter than the header are ignored by the
//! transport rather than treated as errors.

use bytes::{BufMut, BytesMut};

/// Header length: type byte plus big-endian u64 id.
pub const HEADER_LEN: usize = 1 + std::mem::size_of::<u64>();

/// Frame discriminator, the first byte on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Application payload (also carries serialized errors).
    Data = 0,
    /// At-least-once acknowledgment.
    Ack = 1,
    /// Exactly-once stage 1: announce intent to deliver.
    Prepare = 2,
    /// Exactly-once stage 2: receiver accepted the prepare.
    PrepareAck = 3,
    /// Exactly-once stage 3: sender commits the delivery.
    Commit = 4,
    /// Exactly-once stage 4: receiver finished the exchange.
    Complete = 5,
}

impl FrameType {
    /// Decode a wire byte into a frame type.
    #[must_use]
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Data),
            1 => Some(Self::Ack),
            2 => Some(Self::Prepare),
            3 => Some(Self::PrepareAck),
            4 => Some(Self::Commit),
            5 => Some(Self::Complete),
            _ => None,
        }
    }
}

impl std::fmt::Display for FrameType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Data => "DATA",
            Self::Ack => "ACK",
            Self::Prepare => "PREPARE",
            Self::PrepareAck => "PREPARE_ACK",
            Self::Commit => "COMMIT",
            Self::Complete => "COMPLETE",
        };
        f.write_str(name)
    }
}

/// A decoded inbound frame borrowing its payload from the receive buffer.
#[derive(Debug, PartialEq, Eq)]
pub struct Frame<'a> {
    pub frame_type: FrameType,
    pub id: u64,
    pub payload: &'a [u8],
}

/// Encode a frame into a fresh byte vector.
#[must_use]
pub fn encode_frame(frame_type: FrameType, id: u64, payload: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(frame_type as u8);
    buf.put_u64(id);
    buf.put_slice(payload);
    buf.to_vec()
}

/// Decode a frame header from raw bytes.
///
/// Returns `None` for truncated input or an unknown type byte; the caller
/// drops such messages silently per the wire contract.
#[must_use]
pub fn decode_frame(raw: &[u8]) -> Option<Frame<'_>> {
    if raw.len() < HEADER_LEN {
        return None;
    }
    let frame_type = FrameType::from_byte(raw[0])?;
    let mut id_bytes = [0u8; 8];
    id_bytes.copy_from_slice(&raw[1..HEADER_LEN]);
    Some(Frame {
        frame_type,
        id: u64::from_be_bytes(id_bytes),
        payload: &raw[HEADER_LEN..],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_layout_is_type_id_payload() {
        let raw = encode_frame(FrameType::Data, 0x0102_0304_0506_0708, b"hi");
        assert_eq!(raw[0], 0);
        assert_eq!(&raw[1..9], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&raw[9..], b"hi");
    }

    #[test]
    fn round_trip_preserves_fields() {
        let raw = encode_frame(FrameType::Prepare, 42, b"payload");
        let frame = decode_frame(&raw).unwrap();
        assert_eq!(frame.frame_type, FrameType::Prepare);
        assert_eq!(frame.id, 42);
        assert_eq!(frame.payload, b"payload");
    }

    #[test]
    fn empty_payload_round_trips() {
        let raw = encode_frame(FrameType::Ack, 7, &[]);
        assert_eq!(raw.len(), HEADER_LEN);
        let frame = decode_frame(&raw).unwrap();
        assert_eq!(frame.id, 7);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn short_input_is_rejected() {
        assert!(decode_frame(&[]).is_none());
        assert!(decode_frame(&[0, 1, 2, 3]).is_none());
        assert!(decode_frame(&[0; HEADER_LEN - 1]).is_none());
    }

    #[test]
    fn unknown_type_byte_is_rejected() {
        let mut raw = encode_frame(FrameType::Data, 1, b"x");
        raw[0] = 9;
        assert!(decode_frame(&raw).is_none());
    }

    #[test]
    fn id_uses_network_byte_order() {
        let raw = encode_frame(FrameType::Data, 1, &[]);
        assert_eq!(&raw[1..9], &[0, 0, 0, 0, 0, 0, 0, 1]);
    }
}
