//! Frame boundary handling for the EOT-delimited JSON protocol.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::Message;

/// Byte terminating each encoded message on the stream (ASCII EOT).
pub const SEPARATOR: u8 = 0x04;

/// Upper bound on a single frame body.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// One decoded frame. A frame that fails to parse must not tear down the
/// connection; the peer is answered with an error response carrying `no = 0`
/// and the stream keeps going.
#[derive(Debug)]
pub enum Frame {
    Message(Message),
    Invalid(String),
}

#[derive(Debug)]
pub struct FrameCodec {
    max_frame_length: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            max_frame_length: MAX_FRAME_LENGTH,
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> std::io::Result<Option<Frame>> {
        let Some(pos) = src.iter().position(|&b| b == SEPARATOR) else {
            // Partial frame: wait for more bytes, unless the peer is streaming
            // garbage without ever sending a separator.
            if src.len() > self.max_frame_length {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("frame exceeds {} bytes", self.max_frame_length),
                ));
            }
            return Ok(None);
        };
        let frame = src.split_to(pos + 1);
        let body = &frame[..pos];
        Ok(Some(match Message::from_slice(body) {
            Ok(message) => Frame::Message(message),
            Err(reason) => Frame::Invalid(reason),
        }))
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> std::io::Result<()> {
        let body = item
            .to_bytes()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        dst.reserve(body.len() + 1);
        dst.put_slice(&body);
        dst.put_u8(SEPARATOR);
        Ok(())
    }
}
