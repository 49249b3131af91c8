//! Length-framed multipart messages.
//!
//! Every message on a data connection is a fixed sequence of frames written
//! back to back:
//!
//! ```text
//! u8          frame count (1..=MAX_FRAMES)
//! per frame:  u32 length (big-endian), then that many bytes
//! ```
//!
//! The framing preserves message boundaries over a TCP byte stream. Data
//! messages carry exactly two frames: the sender's 16-byte connection id,
//! then the payload.

use std::io::{self, Read, Write};

use crate::error::{Error, Result};

pub const MAX_FRAMES: usize = 8;
/// Upper bound on a single frame, so a corrupt length prefix cannot make a
/// receiver buffer gigabytes.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;
/// Frame 0 of every data message is a raw connection id of exactly this size.
pub const GUID_FRAME_LEN: usize = 16;

pub fn encode_message(frames: &[&[u8]]) -> Vec<u8> {
    debug_assert!(!frames.is_empty() && frames.len() <= MAX_FRAMES);
    let total: usize = 1 + frames.iter().map(|f| 4 + f.len()).sum::<usize>();
    let mut out = Vec::with_capacity(total);
    out.push(frames.len() as u8);
    for frame in frames {
        out.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        out.extend_from_slice(frame);
    }
    out
}

/// Writes one whole message; a message is never interleaved with another on
/// the same stream.
pub fn write_message(writer: &mut impl Write, frames: &[&[u8]]) -> io::Result<()> {
    writer.write_all(&encode_message(frames))
}

/// Blocking read of one whole message.
pub fn read_message(reader: &mut impl Read) -> Result<Vec<Vec<u8>>> {
    let mut count = [0u8; 1];
    reader.read_exact(&mut count)?;
    let count = count[0] as usize;
    if count == 0 || count > MAX_FRAMES {
        return Err(Error::Transport(format!("invalid frame count {count}")));
    }
    let mut frames = Vec::with_capacity(count);
    for _ in 0..count {
        let mut len = [0u8; 4];
        reader.read_exact(&mut len)?;
        let len = u32::from_be_bytes(len) as usize;
        if len > MAX_FRAME_LEN {
            return Err(Error::Transport(format!("frame length {len} exceeds limit")));
        }
        let mut frame = vec![0u8; len];
        reader.read_exact(&mut frame)?;
        frames.push(frame);
    }
    Ok(frames)
}

/// Incremental message decoder for a non-blocking stream.
///
/// Bytes are fed in as they arrive; [`FrameDecoder::next_message`] yields a
/// message once all of its frames are buffered.
#[derive(Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Returns the next complete message, `None` when more bytes are needed,
    /// or an error when the buffered bytes cannot be a valid message.
    pub fn next_message(&mut self) -> Result<Option<Vec<Vec<u8>>>> {
        let Some(&count) = self.buf.first() else {
            return Ok(None);
        };
        let count = count as usize;
        if count == 0 || count > MAX_FRAMES {
            return Err(Error::Transport(format!("invalid frame count {count}")));
        }

        let mut offset = 1;
        let mut bounds = Vec::with_capacity(count);
        for _ in 0..count {
            if self.buf.len() < offset + 4 {
                return Ok(None);
            }
            let len = u32::from_be_bytes(
                self.buf[offset..offset + 4]
                    .try_into()
                    .expect("slice is 4 bytes"),
            ) as usize;
            if len > MAX_FRAME_LEN {
                return Err(Error::Transport(format!("frame length {len} exceeds limit")));
            }
            offset += 4;
            if self.buf.len() < offset + len {
                return Ok(None);
            }
            bounds.push((offset, len));
            offset += len;
        }

        let frames = bounds
            .iter()
            .map(|&(start, len)| self.buf[start..start + len].to_vec())
            .collect();
        self.buf.drain(..offset);
        Ok(Some(frames))
    }
}
