//! Serial stream framing for Meshtastic protobuf messages.
//!
//! Each `FromRadio` / `ToRadio` message on the serial link is sent as:
//!
//!   `0x94 0xC3 <len_hi> <len_lo> <protobuf bytes>`
//!
//! Devices also print plain debug text on the same port, so the decoder realigns on
//! the magic bytes and skips anything in between.
use bytes::{Buf, BytesMut};

pub const START1: u8 = 0x94;
pub const START2: u8 = 0xC3;
/// Largest payload the firmware will emit; longer declared lengths mean garbage.
pub const MAX_FRAME_SIZE: usize = 512;

/// Wrap an encoded protobuf payload in a frame header.
pub fn encode_frame(payload: &[u8]) -> Option<Vec<u8>> {
    if payload.len() > MAX_FRAME_SIZE {
        return None;
    }
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.extend_from_slice(&[START1, START2]);
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    Some(out)
}

/// Incremental decoder; feed arbitrary chunks, pull whole frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
    skipped: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(1024),
            skipped: 0,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes discarded while hunting for a frame header (debug console text, noise).
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            // Realign to the header
            match self.buf.iter().position(|&b| b == START1) {
                Some(0) => {}
                Some(pos) => {
                    self.skipped += pos;
                    self.buf.advance(pos);
                }
                None => {
                    self.skipped += self.buf.len();
                    self.buf.clear();
                    return None;
                }
            }
            if self.buf.len() < 4 {
                return None;
            }
            if self.buf[1] != START2 {
                self.skipped += 1;
                self.buf.advance(1);
                continue;
            }
            let declared = u16::from_be_bytes([self.buf[2], self.buf[3]]) as usize;
            if declared == 0 || declared > MAX_FRAME_SIZE {
                self.skipped += 1;
                self.buf.advance(1);
                continue;
            }
            if self.buf.len() < 4 + declared {
                return None;
            }
            self.buf.advance(4);
            return Some(self.buf.split_to(declared).to_vec());
        }
    }
}
