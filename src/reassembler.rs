//! Splits a raw device byte stream into `;`-delimited records.
//!
//! A read from a stream socket can end anywhere, including in the middle of
//! a record. Everything after the last delimiter of a chunk is held back and
//! prepended to the next one, so records come out whole, once, and in order.

use memchr::{memchr, memrchr};

/// Record separator on the wire.
pub const DELIMITER: u8 = b';';

// ---

#[derive(Debug, Default)]
pub struct Reassembler {
    // ---
    pending: Vec<u8>,
}

impl Reassembler {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one chunk and return the records it completes.
    ///
    /// The returned iterator owns its bytes, so the reassembler can keep
    /// taking chunks while earlier records are still being consumed.
    pub fn push(&mut self, chunk: &[u8]) -> Records {
        // ---
        let Some(last) = memrchr(DELIMITER, chunk) else {
            self.pending.extend_from_slice(chunk);
            return Records::default();
        };

        let mut data = std::mem::take(&mut self.pending);
        data.extend_from_slice(&chunk[..=last]);
        self.pending.extend_from_slice(&chunk[last + 1..]);

        Records { data, pos: 0 }
    }

    /// Take the trailing fragment at end of stream, if it holds anything.
    pub fn flush(&mut self) -> Option<String> {
        // ---
        let pending = std::mem::take(&mut self.pending);
        let text = String::from_utf8_lossy(&pending);
        if text.trim().is_empty() {
            None
        } else {
            Some(text.into_owned())
        }
    }

    /// Size of the fragment currently held back.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Complete records produced by one [`Reassembler::push`].
#[derive(Debug, Default)]
pub struct Records {
    // ---
    // Always empty or terminated by DELIMITER.
    data: Vec<u8>,
    pos: usize,
}

impl Iterator for Records {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        // ---
        let rest = self.data.get(self.pos..)?;
        let end = memchr(DELIMITER, rest)?;
        let record = String::from_utf8_lossy(&rest[..end]).into_owned();
        self.pos += end + 1;
        Some(record)
    }
}

/// Split a self-contained batch (an HTTP body, a channel message) into
/// records. The final piece counts as a record even without a delimiter.
pub fn split_batch(raw: &str) -> Vec<String> {
    // ---
    let mut reassembler = Reassembler::new();
    let mut records: Vec<String> = reassembler.push(raw.as_bytes()).collect();
    records.extend(reassembler.flush());
    records
}
