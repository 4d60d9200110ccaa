// Transport-level framing: `kind | channel | length | payload | 0xCE`.

use crate::codec::FrameFormatError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::io::Cursor;

/// Every frame ends with this sentinel octet.
pub const FRAME_END: u8 = 0xCE;

/// Written by the client before any frame is exchanged.
pub const PROTOCOL_HEADER: [u8; 8] = *b"AMQP\x01\x01\x08\x00";

/// The four frame types of AMQP 0-8.
#[derive(TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Method = 1,
    Header = 2,
    Body = 3,
    Heartbeat = 8,
}

/// One transport frame, payload still undecoded.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub kind: FrameKind,
    pub channel: u16,
    pub payload: Bytes,
}

impl Frame {
    /// Size of the `kind | channel | length` prefix.
    pub const HEADER_SIZE: usize = 7;

    pub fn new(kind: FrameKind, channel: u16, payload: Bytes) -> Frame {
        Frame {
            kind,
            channel,
            payload,
        }
    }

    /// A heartbeat is a zero-length frame on channel 0.
    pub fn heartbeat() -> Frame {
        Frame::new(FrameKind::Heartbeat, 0, Bytes::new())
    }

    /// Checks whether `src` holds one entire frame. Returns the total
    /// encoded length (prefix + payload + sentinel) so the caller can
    /// advance past it after parsing.
    pub fn check(src: &Cursor<&[u8]>) -> Result<usize, FrameFormatError> {
        let buf = &src.get_ref()[src.position() as usize..];
        if buf.len() < Self::HEADER_SIZE {
            return Err(FrameFormatError::Incomplete);
        }
        let length = u32::from_be_bytes([buf[3], buf[4], buf[5], buf[6]]) as usize;
        let total = Self::HEADER_SIZE + length + 1;
        if buf.len() < total {
            return Err(FrameFormatError::Incomplete);
        }
        Ok(total)
    }

    /// Parses one frame. The caller has already validated availability
    /// with `check`.
    pub fn parse(src: &mut Cursor<&[u8]>) -> Result<Frame, FrameFormatError> {
        let raw_kind = src.get_u8();
        let kind = FrameKind::try_from(raw_kind)
            .map_err(|_| FrameFormatError::UnknownFrameKind(raw_kind))?;
        let channel = src.get_u16();
        let length = src.get_u32() as usize;
        let payload = src.copy_to_bytes(length);
        let terminator = src.get_u8();
        if terminator != FRAME_END {
            return Err(FrameFormatError::BadFrameEnd { found: terminator });
        }
        Ok(Frame {
            kind,
            channel,
            payload,
        })
    }

    pub fn encoded_len(&self) -> usize {
        Self::HEADER_SIZE + self.payload.len() + 1
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_u8(self.kind.into());
        dst.put_u16(self.channel);
        dst.put_u32(self.payload.len() as u32);
        dst.put_slice(&self.payload);
        dst.put_u8(FRAME_END);
    }
}
