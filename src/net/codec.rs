//! Frames [`Message`] values over a byte stream: a 4-byte big-endian
//! length prefix followed by a `postcard`-encoded message, via
//! `tokio_util::codec`'s `Encoder`/`Decoder` traits so the transport can
//! drive a session with `Framed<TcpStream, MessageCodec>`.

use crate::net::message::Message;
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Frames larger than this are rejected outright rather than allocating
/// an attacker-controlled buffer size.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Default)]
pub struct MessageCodec {
    /// Length of the frame currently being assembled, once its prefix
    /// has been read.
    pending_len: Option<usize>,
}

impl MessageCodec {
    pub fn new() -> Self {
        MessageCodec { pending_len: None }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN}-byte limit")]
    FrameTooLarge(usize),
    #[error("wire encoding error: {0}")]
    Encoding(#[from] postcard::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        let len = match self.pending_len {
            Some(len) => len,
            None => {
                if src.len() < 4 {
                    return Ok(None);
                }
                let len = u32::from_be_bytes(src[..4].try_into().unwrap()) as usize;
                if len > MAX_FRAME_LEN {
                    return Err(CodecError::FrameTooLarge(len));
                }
                src.advance(4);
                self.pending_len = Some(len);
                len
            }
        };

        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        let frame = src.split_to(len);
        self.pending_len = None;
        let message: Message = postcard::from_bytes(&frame)?;
        Ok(Some(message))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = CodecError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), CodecError> {
        let bytes = postcard::to_allocvec(&message)?;
        if bytes.len() > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge(bytes.len()));
        }
        dst.put_u32(bytes.len() as u32);
        dst.extend_from_slice(&bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::message::{FinishMsg, SyncMsg};
    use crate::types::Nonce;

    #[test]
    fn round_trips_a_message_through_the_codec() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Message::Sync(SyncMsg { nonce: Nonce::first() }), &mut buf)
            .unwrap();
        codec.encode(Message::Finish(FinishMsg), &mut buf).unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(first, Message::Sync(_)));
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(second, Message::Finish(_)));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn decode_waits_for_a_full_frame() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Message::Finish(FinishMsg), &mut buf)
            .unwrap();
        let mut partial = buf.split_to(buf.len() - 1);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }
}
