// CRLF line framing: <payload>\r\n, bounded by max_frame_len
use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::NetworkError;

pub const FRAME_TERMINATOR: &[u8] = b"\r\n";

/// Largest frame either side will buffer (~195 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 204_800_000;

#[derive(Debug, Clone)]
pub struct CrLfCodec {
    max_frame_len: usize,
    // bytes already scanned without finding a terminator
    scanned: usize,
}

impl CrLfCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len, scanned: 0 }
    }
}

impl Default for CrLfCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

fn find_terminator(haystack: &[u8]) -> Option<usize> {
    haystack.windows(FRAME_TERMINATOR.len()).position(|w| w == FRAME_TERMINATOR)
}

impl Decoder for CrLfCodec {
    type Item = BytesMut;
    type Error = NetworkError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<BytesMut>, NetworkError> {
        // step back one byte: a '\r' at the old end may pair with a new '\n'
        let start = self.scanned.saturating_sub(FRAME_TERMINATOR.len() - 1);

        match find_terminator(&buf[start..]) {
            Some(pos) => {
                let len = start + pos;
                self.scanned = 0;
                if len > self.max_frame_len {
                    return Err(NetworkError::FrameTooLarge { size: len, max: self.max_frame_len });
                }
                let mut frame = buf.split_to(len + FRAME_TERMINATOR.len());
                frame.truncate(len);
                Ok(Some(frame))
            }
            None => {
                // a trailing '\r' may still complete a max-sized frame
                if buf.len() > self.max_frame_len + FRAME_TERMINATOR.len() - 1 {
                    return Err(NetworkError::FrameTooLarge {
                        size: buf.len(),
                        max: self.max_frame_len,
                    });
                }
                self.scanned = buf.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<BytesMut>, NetworkError> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() => Ok(None),
            // peer closed halfway through a frame
            None => {
                buf.clear();
                self.scanned = 0;
                Err(NetworkError::Reset)
            }
        }
    }
}

impl Encoder<Bytes> for CrLfCodec {
    type Error = NetworkError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), NetworkError> {
        if item.len() > self.max_frame_len {
            return Err(NetworkError::FrameTooLarge { size: item.len(), max: self.max_frame_len });
        }
        if find_terminator(&item).is_some() {
            return Err(NetworkError::TerminatorInPayload);
        }
        dst.reserve(item.len() + FRAME_TERMINATOR.len());
        dst.put(item);
        dst.put_slice(FRAME_TERMINATOR);
        Ok(())
    }
}
