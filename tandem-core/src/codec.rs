//! Wire framing: newline-delimited JSON, one message per frame.
//!
//! Decoding yields [`Decoded`] items — malformed frames are carried as
//! items rather than stream errors so a single bad frame never tears
//! down the connection. Only an oversize frame (a peer that stopped
//! sending newlines) is a hard error.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::TandemError;
use crate::message::{Decoded, Message, decode_frame};

/// Largest frame the codec will buffer before giving up on the peer.
/// Sized for base64 preview frames and file chunks.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Newline-framed JSON codec for [`Message`] traffic.
#[derive(Debug, Default)]
pub struct WireCodec {
    /// Scan position from the previous `decode` call, so partial
    /// frames are not rescanned from the start.
    scanned: usize,
}

impl WireCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for WireCodec {
    type Item = Decoded;
    type Error = TandemError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let newline = src[self.scanned..].iter().position(|&b| b == b'\n');

        match newline {
            Some(pos) => {
                let end = self.scanned + pos;
                let frame = src.split_to(end + 1);
                self.scanned = 0;
                // Strip the trailing newline (and an optional \r).
                let mut line = &frame[..frame.len() - 1];
                if line.last() == Some(&b'\r') {
                    line = &line[..line.len() - 1];
                }
                Ok(Some(decode_frame(line)))
            }
            None => {
                if src.len() > MAX_FRAME_SIZE {
                    return Err(TandemError::FrameTooLarge {
                        size: src.len(),
                        max: MAX_FRAME_SIZE,
                    });
                }
                self.scanned = src.len();
                Ok(None)
            }
        }
    }
}

impl Encoder<Message> for WireCodec {
    type Error = TandemError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item)?;
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────
