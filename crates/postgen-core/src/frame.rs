//! Incremental frame splitter for the generation stream body.

use bytes::BytesMut;
use tracing::{debug, trace};

/// Blank line terminating every frame.
pub const FRAME_DELIMITER: &[u8] = b"\n\n";

/// Prefix marking a payload-bearing frame.
pub const DATA_PREFIX: &str = "data: ";

/// Splits an arbitrarily fragmented byte stream into frame payloads.
///
/// Bytes are buffered raw and only decoded once a whole frame is available,
/// so a multi-byte character split across two reads is reassembled before
/// decoding. The payloads returned by successive [`push`](Self::push) calls
/// are the same no matter how the input was fragmented.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
    /// Offset below which the buffer is known to hold no delimiter.
    scanned: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next fragment and return every payload it completes, in order.
    ///
    /// Segments without the `data: ` prefix are dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut payloads = Vec::new();
        while let Some(end) = self.find_delimiter() {
            let frame = self.buffer.split_to(end + FRAME_DELIMITER.len());
            self.scanned = 0;

            match payload_of(&frame[..end]) {
                Some(payload) => payloads.push(payload),
                None => trace!(len = end, "Skipping frame without data prefix"),
            }
        }
        payloads
    }

    /// Bytes waiting for a delimiter.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// End of input. An unterminated trailing segment is never emitted;
    /// returns how many bytes were discarded.
    pub fn finish(self) -> usize {
        let leftover = self.buffer.len();
        if leftover > 0 {
            debug!(bytes = leftover, "Discarding unterminated trailing frame");
        }
        leftover
    }

    fn find_delimiter(&mut self) -> Option<usize> {
        let start = self.scanned;
        let found = self.buffer[start..]
            .windows(FRAME_DELIMITER.len())
            .position(|w| w == FRAME_DELIMITER)
            .map(|i| start + i);

        if found.is_none() {
            // The last byte may be the first half of a delimiter.
            self.scanned = self
                .buffer
                .len()
                .saturating_sub(FRAME_DELIMITER.len() - 1);
        }
        found
    }
}

fn payload_of(frame: &[u8]) -> Option<String> {
    frame
        .strip_prefix(DATA_PREFIX.as_bytes())
        .map(|rest| String::from_utf8_lossy(rest).into_owned())
}
