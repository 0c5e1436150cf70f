//! Frame splitting for the device byte stream
//!
//! Devices write plain UTF-8 text with no length prefix. In `Delimited` mode a frame
//! ends at the configured delimiter byte (a trailing `\r` is stripped). A partial frame
//! that grows past `max_len` is discarded and the decoder resyncs at the next delimiter.
//! In `Raw` mode every read is handed through as one frame.

use crate::infra::config::FramingMode;
use bytes::{Buf, Bytes, BytesMut};

/// Decoder output
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    Frame(Bytes),
    /// Bytes discarded because no delimiter arrived within `max_len`
    Oversize(usize),
}

pub struct FrameDecoder {
    mode: FramingMode,
    delimiter: u8,
    max_len: usize,
    buf: BytesMut,
    /// Dropping bytes until the next delimiter after an oversize frame
    discarding: bool,
}

impl FrameDecoder {
    pub fn new(mode: FramingMode, delimiter: u8, max_len: usize) -> Self {
        Self { mode, delimiter, max_len, buf: BytesMut::with_capacity(4096), discarding: false }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete frame, or `None` when more bytes are needed
    pub fn next_frame(&mut self) -> Option<Decoded> {
        match self.mode {
            FramingMode::Raw => {
                if self.buf.is_empty() {
                    None
                } else {
                    Some(Decoded::Frame(self.buf.split().freeze()))
                }
            }
            FramingMode::Delimited => self.next_delimited(),
        }
    }

    fn next_delimited(&mut self) -> Option<Decoded> {
        loop {
            let Some(pos) = self.buf.iter().position(|&b| b == self.delimiter) else {
                if self.buf.len() > self.max_len {
                    let dropped = self.buf.len();
                    self.buf.clear();
                    self.discarding = true;
                    return Some(Decoded::Oversize(dropped));
                }
                return None;
            };

            let mut line = self.buf.split_to(pos);
            self.buf.advance(1);

            if self.discarding {
                // Tail of an oversize frame
                self.discarding = false;
                continue;
            }
            if line.len() > self.max_len {
                return Some(Decoded::Oversize(line.len()));
            }
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }
            if line.is_empty() {
                continue;
            }
            return Some(Decoded::Frame(line.freeze()));
        }
    }
}
