//! Wire envelope formats for demuxed frames.
//!
//! Two independent formats, selected by which collaborator consumes the
//! output:
//!
//! - **Stream format** — self-delimiting messages multiplexed on one byte
//!   stream, used when the demuxer pipes directly into a consuming
//!   process. Both sides live here: [`encode_init`]/[`encode_frame`] on
//!   the producer and the incremental [`next_item`]/[`parse_item`] pair
//!   on the consumer.
//! - **Object payload format** — no framing; length and kind come from
//!   the transport object's own metadata. Built by [`object_payload`].
//!
//! Both formats put the availability and presentation timestamps ahead of
//! the raw fragment bytes so a downstream decoder recovers timing even
//! when intermediate frames were dropped in transit.
//!
//! Stream format layout (all integers big-endian):
//!
//! ```text
//! init:   0x00 | len u32 | init segment bytes
//! frame:  0x01 | keyframe u8 | slice type u8 | availability i64 ns
//!         | decode time u64 | presentation time u64 | len u32 | payload
//! ```

use std::io::Write;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{GopcastError, Result};
use crate::fmp4::InitSegment;
use crate::media::{EncodedFrame, SliceType};

/// Message tag for an init segment.
pub const INIT_TAG: u8 = 0x00;
/// Message tag for a frame.
pub const FRAME_TAG: u8 = 0x01;

/// Fixed frame header length after the tag byte.
const FRAME_HEADER_LEN: usize = 1 + 1 + 8 + 8 + 8 + 4;

/// One decoded stream-format message.
#[derive(Debug)]
pub enum StreamItem {
    Init(InitSegment),
    Frame(EncodedFrame),
}

/// Write an init message in the stream format.
pub fn encode_init<W: Write>(writer: &mut W, init: &InitSegment) -> Result<()> {
    let len = u32::try_from(init.len())
        .map_err(|_| GopcastError::Encode("init segment exceeds 32-bit length"))?;
    writer.write_all(&[INIT_TAG])?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(init.as_bytes())?;
    Ok(())
}

/// Write a frame message in the stream format.
pub fn encode_frame<W: Write>(writer: &mut W, frame: &EncodedFrame) -> Result<()> {
    let len = u32::try_from(frame.payload.len())
        .map_err(|_| GopcastError::Encode("frame payload exceeds 32-bit length"))?;
    writer.write_all(&[FRAME_TAG, u8::from(frame.is_keyframe), frame.slice_type.code()])?;
    writer.write_all(&unix_nanos(frame.availability_time)?.to_be_bytes())?;
    writer.write_all(&frame.decode_time.to_be_bytes())?;
    writer.write_all(&frame.presentation_time.to_be_bytes())?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&frame.payload)?;
    Ok(())
}

/// Whether the buffer holds at least one complete stream-format message.
///
/// Call before [`parse_item`]; the parser assumes a complete message is
/// buffered.
pub fn next_item(buf: &BytesMut) -> Result<bool> {
    let Some(&tag) = buf.first() else {
        return Ok(false);
    };
    match tag {
        INIT_TAG => {
            if buf.len() < 5 {
                return Ok(false);
            }
            let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
            Ok(buf.len() >= 5 + len)
        }
        FRAME_TAG => {
            if buf.len() < 1 + FRAME_HEADER_LEN {
                return Ok(false);
            }
            let at = 1 + FRAME_HEADER_LEN - 4;
            let len = u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]) as usize;
            Ok(buf.len() >= 1 + FRAME_HEADER_LEN + len)
        }
        tag => Err(unknown_tag(tag)),
    }
}

/// Consume one complete stream-format message from the buffer.
pub fn parse_item(buf: &mut BytesMut) -> Result<StreamItem> {
    match buf.get_u8() {
        INIT_TAG => {
            let len = buf.get_u32() as usize;
            let data = buf.split_to(len).freeze();
            Ok(StreamItem::Init(InitSegment::new(data)))
        }
        FRAME_TAG => {
            let is_keyframe = buf.get_u8() != 0;
            let slice_type = SliceType::from_code(buf.get_u8());
            let availability_time = time_from_unix_nanos(buf.get_i64());
            let decode_time = buf.get_u64();
            let presentation_time = buf.get_u64();
            let len = buf.get_u32() as usize;
            let payload = buf.split_to(len).freeze();
            Ok(StreamItem::Frame(EncodedFrame {
                is_keyframe,
                slice_type,
                decode_time,
                presentation_time,
                availability_time,
                payload,
            }))
        }
        tag => Err(unknown_tag(tag)),
    }
}

fn unknown_tag(tag: u8) -> GopcastError {
    GopcastError::Decode {
        kind: crate::error::DecodeErrorKind::UnknownWireTag { tag },
    }
}

/// Build a per-object transport payload: availability ∥ presentation ∥
/// raw fragment bytes.
pub fn object_payload(frame: &EncodedFrame) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(16 + frame.payload.len());
    buf.put_i64(unix_nanos(frame.availability_time)?);
    buf.put_u64(frame.presentation_time);
    buf.put_slice(&frame.payload);
    Ok(buf.freeze())
}

fn unix_nanos(time: SystemTime) -> Result<i64> {
    let nanos: i128 = match time.duration_since(UNIX_EPOCH) {
        Ok(after) => after.as_nanos() as i128,
        Err(before) => -(before.duration().as_nanos() as i128),
    };
    i64::try_from(nanos)
        .map_err(|_| GopcastError::Encode("timestamp outside 64-bit nanosecond range"))
}

fn time_from_unix_nanos(nanos: i64) -> SystemTime {
    if nanos >= 0 {
        UNIX_EPOCH + Duration::from_nanos(nanos as u64)
    } else {
        UNIX_EPOCH - Duration::from_nanos(nanos.unsigned_abs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_frame(availability_nanos: u64) -> EncodedFrame {
        EncodedFrame {
            is_keyframe: true,
            slice_type: SliceType::P,
            decode_time: 2,
            presentation_time: 3,
            availability_time: UNIX_EPOCH + Duration::from_nanos(availability_nanos),
            payload: Bytes::from_static(&[0xAA, 0xBB]),
        }
    }

    // --- Stream format, encoder ---

    #[test]
    fn frame_message_exact_bytes() {
        let frame = make_frame(1_000_000_007);
        let mut out = Vec::new();
        encode_frame(&mut out, &frame).expect("encode");

        let mut expected = vec![0x01, 0x01, 0x00];
        expected.extend_from_slice(&1_000_000_007i64.to_be_bytes());
        expected.extend_from_slice(&2u64.to_be_bytes());
        expected.extend_from_slice(&3u64.to_be_bytes());
        expected.extend_from_slice(&2u32.to_be_bytes());
        expected.extend_from_slice(&[0xAA, 0xBB]);
        assert_eq!(out, expected);
    }

    #[test]
    fn init_message_exact_bytes() {
        let init = InitSegment::new(Bytes::from_static(&[1, 2, 3]));
        let mut out = Vec::new();
        encode_init(&mut out, &init).expect("encode");
        assert_eq!(out, vec![0x00, 0, 0, 0, 3, 1, 2, 3]);
    }

    #[test]
    fn pre_epoch_availability_encodes_negative() {
        let frame = EncodedFrame {
            availability_time: UNIX_EPOCH - Duration::from_nanos(5),
            ..make_frame(0)
        };
        let mut out = Vec::new();
        encode_frame(&mut out, &frame).expect("encode");
        let nanos = i64::from_be_bytes(out[3..11].try_into().expect("8 bytes"));
        assert_eq!(nanos, -5);
    }

    // --- Stream format, incremental decoder ---

    #[test]
    fn decode_round_trip() {
        let init = InitSegment::new(Bytes::from_static(b"ftyp+moov"));
        let frame = make_frame(77);
        let mut stream = Vec::new();
        encode_init(&mut stream, &init).expect("encode init");
        encode_frame(&mut stream, &frame).expect("encode frame");

        let mut buf = BytesMut::from(&stream[..]);
        assert!(next_item(&buf).expect("peek"));
        let StreamItem::Init(decoded) = parse_item(&mut buf).expect("parse") else {
            panic!("expected init first");
        };
        assert_eq!(decoded, init);

        assert!(next_item(&buf).expect("peek"));
        let StreamItem::Frame(decoded) = parse_item(&mut buf).expect("parse") else {
            panic!("expected frame");
        };
        assert!(decoded.is_keyframe);
        assert_eq!(decoded.slice_type, SliceType::P);
        assert_eq!(decoded.decode_time, 2);
        assert_eq!(decoded.presentation_time, 3);
        assert_eq!(decoded.availability_time, frame.availability_time);
        assert_eq!(decoded.payload, frame.payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_message_is_not_ready() {
        let frame = make_frame(77);
        let mut stream = Vec::new();
        encode_frame(&mut stream, &frame).expect("encode");

        // Deliver in two chunks split inside the header: the first half
        // parses as incomplete, the remainder completes it.
        let mut buf = BytesMut::from(&stream[..10]);
        assert!(!next_item(&buf).expect("peek"));
        buf.extend_from_slice(&stream[10..]);
        assert!(next_item(&buf).expect("peek"));
    }

    #[test]
    fn empty_buffer_is_not_ready() {
        assert!(!next_item(&BytesMut::new()).expect("peek"));
    }

    #[test]
    fn unknown_tag_is_error() {
        let buf = BytesMut::from(&[0x7f, 0, 0][..]);
        assert!(next_item(&buf).is_err());
    }

    // --- Object payload format ---

    #[test]
    fn object_payload_layout() {
        let frame = make_frame(9);
        let payload = object_payload(&frame).expect("payload");
        assert_eq!(&payload[0..8], &9i64.to_be_bytes());
        assert_eq!(&payload[8..16], &3u64.to_be_bytes());
        assert_eq!(&payload[16..], &[0xAA, 0xBB]);
    }
}
