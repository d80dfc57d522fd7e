//! Multi-frame message framing for byte-stream transports.
//!
//! Message format: [frame count varint]([frame length varint][frame bytes])*
//!
//! Message-oriented transports deliver frames as-is; stream transports such
//! as TCP use this codec to restore message boundaries.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Maximum frame size (4MB)
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Maximum number of frames in one message
pub const MAX_FRAMES: usize = 64;

/// Encode a message to bytes
pub fn encode_message(frames: &[Bytes]) -> Bytes {
    let total: usize = frames.iter().map(|f| f.len() + 10).sum();
    let mut buf = BytesMut::with_capacity(total + 10);

    encode_varint(frames.len() as u64, &mut buf);
    for frame in frames {
        encode_varint(frame.len() as u64, &mut buf);
        buf.put_slice(frame);
    }

    buf.freeze()
}

/// Message parser for decoding messages from a byte stream
pub struct MessageParser {
    buffer: BytesMut,
}

impl MessageParser {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
        }
    }

    /// Add data to the parser buffer
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Number of buffered, unparsed bytes
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Try to parse a complete message from the buffer
    pub fn parse_message(&mut self) -> Result<Option<Vec<Bytes>>, FrameError> {
        let mut cursor = std::io::Cursor::new(&self.buffer[..]);

        let count = match decode_varint(&mut cursor)? {
            Some(count) => count as usize,
            None => return Ok(None), // Need more data
        };
        if count > MAX_FRAMES {
            return Err(FrameError::TooManyFrames(count));
        }

        let mut spans = Vec::with_capacity(count);
        for _ in 0..count {
            let len = match decode_varint(&mut cursor)? {
                Some(len) => len as usize,
                None => return Ok(None),
            };
            if len > MAX_FRAME_SIZE {
                return Err(FrameError::FrameTooLarge(len));
            }

            let start = cursor.position() as usize;
            if cursor.get_ref().len() < start + len {
                return Ok(None);
            }
            spans.push((start, len));
            cursor.set_position((start + len) as u64);
        }

        let consumed = cursor.position() as usize;
        let message = self.buffer.split_to(consumed).freeze();

        Ok(Some(
            spans
                .into_iter()
                .map(|(start, len)| message.slice(start..start + len))
                .collect(),
        ))
    }
}

impl Default for MessageParser {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("Frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("Too many frames: {0} (max {MAX_FRAMES})")]
    TooManyFrames(usize),

    #[error("Invalid varint encoding")]
    InvalidVarint,
}

impl From<FrameError> for crate::StrandError {
    fn from(err: FrameError) -> Self {
        crate::StrandError::Framing(err.to_string())
    }
}

/// Encode a u64 as a protobuf varint
fn encode_varint(mut value: u64, buf: &mut BytesMut) {
    loop {
        if value < 0x80 {
            buf.put_u8(value as u8);
            break;
        } else {
            buf.put_u8(((value & 0x7F) | 0x80) as u8);
            value >>= 7;
        }
    }
}

/// Decode a protobuf varint; `Ok(None)` means more bytes are needed
fn decode_varint<B: Buf>(buf: &mut B) -> Result<Option<u64>, FrameError> {
    let mut value = 0u64;
    let mut shift = 0;

    loop {
        if !buf.has_remaining() {
            return Ok(None);
        }

        let byte = buf.get_u8();
        value |= ((byte & 0x7F) as u64) << shift;

        if byte < 0x80 {
            return Ok(Some(value));
        }

        shift += 7;
        if shift >= 64 {
            return Err(FrameError::InvalidVarint);
        }
    }
}
