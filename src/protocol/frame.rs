//! The AMQP frame layer.
//!
//! Every frame is `[type: u8][channel: u16][size: u32][payload][0xCE]`.
//! [`FrameCodec`] implements the tokio-util [`Decoder`]/[`Encoder`] pair so
//! a connection can be driven through `Framed`; partial input yields
//! `Ok(None)` until the full frame (including the end octet) has arrived.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::Cursor;
use tokio_util::codec::{Decoder, Encoder};

use super::methods::Method;
use super::properties::ContentHeader;
use super::{
    CodecError, Result, FRAME_BODY, FRAME_END, FRAME_HEADER, FRAME_HEARTBEAT, FRAME_METHOD,
};

/// The protocol header every connection must open with.
pub const PROTOCOL_HEADER: [u8; 8] = *b"AMQP\x00\x00\x09\x01";

/// Frame header (type, channel, size) plus the trailing end octet.
pub const FRAME_OVERHEAD: usize = 8;

/// A parsed AMQP frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Method { channel: u16, method: Method },
    Header { channel: u16, header: ContentHeader },
    Body { channel: u16, payload: Bytes },
    Heartbeat,
}

impl Frame {
    pub fn method(channel: u16, method: Method) -> Self {
        Frame::Method { channel, method }
    }

    pub fn channel(&self) -> u16 {
        match self {
            Frame::Method { channel, .. }
            | Frame::Header { channel, .. }
            | Frame::Body { channel, .. } => *channel,
            Frame::Heartbeat => 0,
        }
    }
}

/// Frame codec over a byte stream.
///
/// The decoder enforces an upper payload bound. Before tuning completes the
/// bound is the server's own frame-max; afterwards it is the negotiated
/// value.
#[derive(Debug)]
pub struct FrameCodec {
    pub max_frame_size: u32,
}

impl FrameCodec {
    pub fn new(max_frame_size: u32) -> Self {
        Self { max_frame_size }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < 7 {
            return Ok(None);
        }

        // Peek at the frame header without consuming bytes.
        let (frame_type, channel, size) = {
            let mut cursor = Cursor::new(src.as_ref());
            let frame_type = cursor.get_u8();
            let channel = cursor.get_u16();
            let size = cursor.get_u32();
            (frame_type, channel, size)
        };

        if size > self.max_frame_size {
            return Err(CodecError::Frame(format!(
                "frame payload of {} bytes exceeds frame-max {}",
                size, self.max_frame_size
            )));
        }

        let total = 7 + size as usize + 1;
        if src.len() < total {
            return Ok(None);
        }

        let mut frame_bytes = src.split_to(total);
        frame_bytes.advance(7);
        let end = frame_bytes[size as usize];
        if end != FRAME_END {
            return Err(CodecError::Frame(format!(
                "bad frame-end octet 0x{:02x}, expected 0x{:02x}",
                end, FRAME_END
            )));
        }
        frame_bytes.truncate(size as usize);
        let payload = frame_bytes.freeze();

        let frame = match frame_type {
            FRAME_METHOD => Frame::Method { channel, method: Method::decode(&payload)? },
            FRAME_HEADER => Frame::Header { channel, header: ContentHeader::decode(&payload)? },
            FRAME_BODY => Frame::Body { channel, payload },
            FRAME_HEARTBEAT => {
                if channel != 0 {
                    return Err(CodecError::Frame(format!(
                        "heartbeat frame on non-zero channel {}",
                        channel
                    )));
                }
                Frame::Heartbeat
            }
            other => return Err(CodecError::Frame(format!("unknown frame type {}", other))),
        };
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<()> {
        let (frame_type, channel, payload) = match item {
            Frame::Method { channel, method } => (FRAME_METHOD, channel, method.encode()?),
            Frame::Header { channel, header } => (FRAME_HEADER, channel, header.encode()?),
            Frame::Body { channel, payload } => (FRAME_BODY, channel, payload),
            Frame::Heartbeat => (FRAME_HEARTBEAT, 0, Bytes::new()),
        };

        dst.reserve(payload.len() + FRAME_OVERHEAD);
        dst.put_u8(frame_type);
        dst.put_u16(channel);
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
        dst.put_u8(FRAME_END);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::properties::BasicProperties;

    fn codec() -> FrameCodec {
        FrameCodec::new(131072)
    }

    fn roundtrip(frame: Frame) {
        let mut buf = BytesMut::new();
        codec().encode(frame.clone(), &mut buf).expect("Failed to encode frame");
        let decoded = codec().decode(&mut buf).expect("Failed to decode frame");
        assert_eq!(decoded, Some(frame));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_method_frame_roundtrip() {
        roundtrip(Frame::method(1, Method::ChannelOpen));
        roundtrip(Frame::method(
            3,
            Method::BasicPublish {
                exchange: "amq.topic".into(),
                routing_key: "stock.nasdaq".into(),
                mandatory: false,
                immediate: false,
            },
        ));
    }

    #[test]
    fn test_header_and_body_frame_roundtrip() {
        let mut props = BasicProperties::default();
        props.delivery_mode = Some(2);
        roundtrip(Frame::Header { channel: 1, header: ContentHeader::new(5, props) });
        roundtrip(Frame::Body { channel: 1, payload: Bytes::from_static(b"hello") });
    }

    #[test]
    fn test_heartbeat_roundtrip() {
        roundtrip(Frame::Heartbeat);
    }

    #[test]
    fn test_partial_input_returns_none() {
        let mut buf = BytesMut::new();
        codec().encode(Frame::method(1, Method::ChannelOpen), &mut buf).unwrap();
        let full = buf.clone();

        let mut partial = BytesMut::from(&full[..5]);
        assert!(codec().decode(&mut partial).unwrap().is_none());

        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(codec().decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn test_bad_end_marker_is_frame_error() {
        let mut buf = BytesMut::new();
        codec().encode(Frame::Heartbeat, &mut buf).unwrap();
        let last = buf.len() - 1;
        buf[last] = 0x00;
        let err = codec().decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::Frame(_)));
    }

    #[test]
    fn test_unknown_frame_type_is_frame_error() {
        let mut buf = BytesMut::new();
        buf.put_u8(9);
        buf.put_u16(0);
        buf.put_u32(0);
        buf.put_u8(FRAME_END);
        let err = codec().decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::Frame(_)));
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let mut small = FrameCodec::new(16);
        let mut buf = BytesMut::new();
        buf.put_u8(FRAME_BODY);
        buf.put_u16(1);
        buf.put_u32(64);
        assert!(small.decode(&mut buf).is_err());
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let mut buf = BytesMut::new();
        codec().encode(Frame::Heartbeat, &mut buf).unwrap();
        codec().encode(Frame::method(2, Method::ChannelOpen), &mut buf).unwrap();

        let mut c = codec();
        assert_eq!(c.decode(&mut buf).unwrap(), Some(Frame::Heartbeat));
        assert_eq!(c.decode(&mut buf).unwrap(), Some(Frame::method(2, Method::ChannelOpen)));
        assert!(buf.is_empty());
    }
}
