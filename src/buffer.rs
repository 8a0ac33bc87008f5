//! Receive buffer for the block reassembler

use crate::{
    constants::{BUF_CHUNK, MAX_BUFFER_SIZE},
    error::{AmiError, AmiResult},
};

/// Growable byte buffer with a read cursor.
///
/// Consumed bytes stay in place until [`compact`](Self::compact) shifts the
/// unread tail to the front, so repeated extraction is cheap.
#[derive(Debug)]
pub(crate) struct AmiBuffer {
    data: Vec<u8>,
    position: usize,
    limit: usize,
}

impl AmiBuffer {
    pub(crate) fn new() -> Self {
        Self::with_limit(MAX_BUFFER_SIZE)
    }

    pub(crate) fn with_limit(limit: usize) -> Self {
        Self {
            data: Vec::with_capacity(BUF_CHUNK.min(limit)),
            position: 0,
            limit,
        }
    }

    /// Unread bytes.
    pub(crate) fn data(&self) -> &[u8] {
        &self.data[self.position..]
    }

    pub(crate) fn len(&self) -> usize {
        self.data
            .len()
            - self.position
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.data
            .extend_from_slice(bytes);
    }

    /// Fail once unread data exceeds the limit; a stream that never yields a
    /// terminator would otherwise grow without bound.
    pub(crate) fn check_size_limits(&self) -> AmiResult<()> {
        if self.len() > self.limit {
            return Err(AmiError::BufferOverflow {
                size: self.len(),
                limit: self.limit,
            });
        }
        Ok(())
    }

    /// Offset of `pattern` within the unread data.
    pub(crate) fn find(&self, pattern: &[u8]) -> Option<usize> {
        if pattern.is_empty() || self.len() < pattern.len() {
            return None;
        }
        self.data()
            .windows(pattern.len())
            .position(|w| w == pattern)
    }

    /// Remove and return everything before `pattern`, consuming the pattern.
    pub(crate) fn extract_until_pattern(&mut self, pattern: &[u8]) -> Option<Vec<u8>> {
        let pos = self.find(pattern)?;
        let start = self.position;
        let chunk = self.data[start..start + pos].to_vec();
        self.position += pos + pattern.len();
        Some(chunk)
    }

    /// Drop consumed bytes and move the unread tail to the front.
    pub(crate) fn compact(&mut self) {
        if self.position == 0 {
            return;
        }
        self.data
            .drain(..self.position);
        self.position = 0;
    }
}
