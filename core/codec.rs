// Copyright 2024-2026 the jsbox authors. MIT license.

//! Frame layer of the bridge protocol.
//!
//! Every message on the socket is one frame:
//!
//! ```text
//! +--------+------+-------+----------+----------------+=========+
//! | length | kind | flags | reserved | correlation id |  body   |
//! |  u32   |  u8  |  u8   |   u16    |      u64       |  bytes  |
//! +--------+------+-------+----------+----------------+=========+
//! ```
//!
//! `length` counts everything after itself. All integers are big-endian.
//! Frames are never interleaved: the bridge owns a single writer task per
//! direction. An unknown `kind` is a fatal protocol error on the connection.

use crate::error::ErrorEnvelope;
use bytes::Buf;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;
use tokio_util::codec::Decoder;
use tokio_util::codec::Encoder;

/// Bytes after the length prefix, before the body.
const FIXED_FIELDS_LEN: usize = 12;

/// Hard cap on a single frame. Larger values must flow as streams.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
  /// A call expecting exactly one `Reply` or `Err` with the same
  /// correlation id.
  Call = 1,
  Reply = 2,
  Err = 3,
  /// Stream frames use the correlation field as the stream handle id.
  StreamChunk = 4,
  StreamEnd = 5,
  StreamErr = 6,
}

impl FrameKind {
  fn from_u8(raw: u8) -> Option<FrameKind> {
    match raw {
      1 => Some(FrameKind::Call),
      2 => Some(FrameKind::Reply),
      3 => Some(FrameKind::Err),
      4 => Some(FrameKind::StreamChunk),
      5 => Some(FrameKind::StreamEnd),
      6 => Some(FrameKind::StreamErr),
      _ => None,
    }
  }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
  pub kind: FrameKind,
  pub flags: u8,
  /// Call correlation id, or stream handle id for stream frames.
  pub correlation: u64,
  pub body: Bytes,
}

impl Frame {
  pub fn call(correlation: u64, body: Bytes) -> Frame {
    Frame { kind: FrameKind::Call, flags: 0, correlation, body }
  }

  pub fn reply(correlation: u64, body: Bytes) -> Frame {
    Frame { kind: FrameKind::Reply, flags: 0, correlation, body }
  }

  pub fn error(correlation: u64, envelope: &ErrorEnvelope) -> Frame {
    let body = bincode::serialize(envelope)
      .expect("error envelope is always serializable")
      .into();
    Frame { kind: FrameKind::Err, flags: 0, correlation, body }
  }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
  #[error("{0}")]
  Io(#[from] std::io::Error),
  #[error("protocol error: {0}")]
  Protocol(String),
}

impl From<CodecError> for ErrorEnvelope {
  fn from(err: CodecError) -> ErrorEnvelope {
    match err {
      CodecError::Io(io) => {
        ErrorEnvelope::protocol(format!("transport error: {io}"))
      }
      CodecError::Protocol(msg) => ErrorEnvelope::protocol(msg),
    }
  }
}

/// Length-delimited frame codec for `tokio_util::codec::Framed`.
#[derive(Default)]
pub struct FrameCodec {
  /// Body length parsed from the current header, if mid-frame.
  pending: Option<(FrameKind, u8, u64, usize)>,
}

impl FrameCodec {
  pub fn new() -> FrameCodec {
    FrameCodec::default()
  }
}

impl Encoder<Frame> for FrameCodec {
  type Error = CodecError;

  fn encode(
    &mut self,
    frame: Frame,
    dst: &mut BytesMut,
  ) -> Result<(), CodecError> {
    let len = FIXED_FIELDS_LEN + frame.body.len();
    if len > MAX_FRAME_LEN {
      return Err(CodecError::Protocol(format!(
        "outgoing frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit"
      )));
    }
    dst.reserve(4 + len);
    dst.put_u32(len as u32);
    dst.put_u8(frame.kind as u8);
    dst.put_u8(frame.flags);
    dst.put_u16(0);
    dst.put_u64(frame.correlation);
    dst.extend_from_slice(&frame.body);
    Ok(())
  }
}

impl Decoder for FrameCodec {
  type Item = Frame;
  type Error = CodecError;

  fn decode(
    &mut self,
    src: &mut BytesMut,
  ) -> Result<Option<Frame>, CodecError> {
    let (kind, flags, correlation, body_len) = match self.pending {
      Some(header) => header,
      None => {
        if src.len() < 4 + FIXED_FIELDS_LEN {
          return Ok(None);
        }
        let len = (&src[..4]).get_u32() as usize;
        if len < FIXED_FIELDS_LEN {
          return Err(CodecError::Protocol(format!(
            "frame length {len} shorter than the fixed header"
          )));
        }
        if len > MAX_FRAME_LEN {
          return Err(CodecError::Protocol(format!(
            "incoming frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit"
          )));
        }
        src.advance(4);
        let raw_kind = src.get_u8();
        let kind = FrameKind::from_u8(raw_kind).ok_or_else(|| {
          CodecError::Protocol(format!("unknown frame kind {raw_kind}"))
        })?;
        let flags = src.get_u8();
        let _reserved = src.get_u16();
        let correlation = src.get_u64();
        let header = (kind, flags, correlation, len - FIXED_FIELDS_LEN);
        self.pending = Some(header);
        header
      }
    };

    if src.len() < body_len {
      src.reserve(body_len - src.len());
      return Ok(None);
    }
    self.pending = None;
    let body = src.split_to(body_len).freeze();
    Ok(Some(Frame { kind, flags, correlation, body }))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  fn round_trip(frame: Frame) -> Frame {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::new();
    codec.encode(frame, &mut buf).unwrap();
    codec.decode(&mut buf).unwrap().unwrap()
  }

  #[test]
  fn frame_round_trip() {
    let frame = Frame::call(7, Bytes::from_static(b"hello"));
    assert_eq!(round_trip(frame.clone()), frame);
  }

  #[test]
  fn partial_frames_wait_for_more_bytes() {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::new();
    codec
      .encode(Frame::reply(1, Bytes::from_static(b"abcdef")), &mut buf)
      .unwrap();
    let full = buf.split().freeze();

    let mut partial = BytesMut::from(&full[..5]);
    assert!(codec.decode(&mut partial).unwrap().is_none());
    partial.extend_from_slice(&full[5..full.len() - 1]);
    assert!(codec.decode(&mut partial).unwrap().is_none());
    partial.extend_from_slice(&full[full.len() - 1..]);
    let frame = codec.decode(&mut partial).unwrap().unwrap();
    assert_eq!(frame.body, Bytes::from_static(b"abcdef"));
  }

  #[test]
  fn back_to_back_frames_do_not_interleave() {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::new();
    codec
      .encode(Frame::call(1, Bytes::from_static(b"one")), &mut buf)
      .unwrap();
    codec
      .encode(
        Frame {
          kind: FrameKind::StreamChunk,
          flags: 0,
          correlation: 9,
          body: Bytes::from_static(b"two"),
        },
        &mut buf,
      )
      .unwrap();

    let first = codec.decode(&mut buf).unwrap().unwrap();
    let second = codec.decode(&mut buf).unwrap().unwrap();
    assert_eq!(first.body, Bytes::from_static(b"one"));
    assert_eq!(second.kind, FrameKind::StreamChunk);
    assert_eq!(second.correlation, 9);
    assert!(codec.decode(&mut buf).unwrap().is_none());
  }

  #[test]
  fn unknown_kind_is_fatal() {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::new();
    codec
      .encode(Frame::call(1, Bytes::from_static(b"x")), &mut buf)
      .unwrap();
    buf[4] = 0xCC;
    let err = codec.decode(&mut buf).unwrap_err();
    assert!(matches!(err, CodecError::Protocol(_)));
  }

  #[test]
  fn oversized_frame_is_rejected() {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::new();
    buf.put_u32((MAX_FRAME_LEN + 1) as u32);
    buf.put_u8(FrameKind::Call as u8);
    buf.put_u8(0);
    buf.put_u16(0);
    buf.put_u64(1);
    let err = codec.decode(&mut buf).unwrap_err();
    assert!(matches!(err, CodecError::Protocol(_)));
  }
}
