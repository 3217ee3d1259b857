//! Fixed-capacity UMP event sequence buffer.
//!
//! Writers advance `position`; readers consume `[0, position)`. The buffer
//! never reallocates, so producers must check the remaining capacity before
//! appending.

use crate::error::HostError;
use crate::ump::{iter_ump_bytes, write_ump, Ump, UmpByteIter};

/// Byte-addressed event sequence with a position cursor.
pub struct EventSequence {
    buffer: Vec<u8>,
    position: usize,
}

impl EventSequence {
    pub fn with_capacity(capacity_bytes: usize) -> Self {
        Self {
            buffer: vec![0u8; capacity_bytes],
            position: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn set_position(&mut self, position: usize) {
        debug_assert!(position <= self.buffer.len());
        self.position = position.min(self.buffer.len());
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.position
    }

    pub fn is_empty(&self) -> bool {
        self.position == 0
    }

    /// Valid message bytes written so far.
    pub fn bytes(&self) -> &[u8] {
        &self.buffer[..self.position]
    }

    /// The full backing storage; used by producers that write past the
    /// current position and then advance it.
    pub fn storage_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// Append one message, advancing the position.
    pub fn append(&mut self, ump: &Ump) -> Result<(), HostError> {
        let size = ump.size_in_bytes();
        if self.remaining() < size {
            return Err(HostError::InsufficientMemory);
        }
        write_ump(&mut self.buffer, self.position, ump);
        self.position += size;
        Ok(())
    }

    /// Append raw message bytes, advancing the position.
    pub fn append_bytes(&mut self, bytes: &[u8]) -> Result<(), HostError> {
        if self.remaining() < bytes.len() {
            return Err(HostError::InsufficientMemory);
        }
        self.buffer[self.position..self.position + bytes.len()].copy_from_slice(bytes);
        self.position += bytes.len();
        Ok(())
    }

    pub fn clear(&mut self) {
        self.position = 0;
    }

    /// Iterate over the complete messages in `[0, position)`.
    pub fn iter(&self) -> UmpByteIter<'_> {
        iter_ump_bytes(self.bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_iterate() {
        let mut seq = EventSequence::with_capacity(64);
        seq.append(&Ump::midi2_note_on(0, 0, 60, 0, 100, 0)).unwrap();
        seq.append(&Ump::midi2_nrpn(0, 0, 3, 12, 7)).unwrap();
        assert_eq!(seq.position(), 16);
        let collected: Vec<Ump> = seq.iter().collect();
        assert_eq!(collected.len(), 2);
        assert_eq!(collected[1].data2(), 12);
    }

    #[test]
    fn test_capacity_limit() {
        let mut seq = EventSequence::with_capacity(8);
        seq.append(&Ump::midi2_note_on(0, 0, 60, 0, 100, 0)).unwrap();
        let err = seq.append(&Ump::midi2_note_on(0, 0, 61, 0, 100, 0));
        assert_eq!(err, Err(HostError::InsufficientMemory));
        // Position unchanged by the failed append.
        assert_eq!(seq.position(), 8);
    }

    #[test]
    fn test_clear_resets_position_only() {
        let mut seq = EventSequence::with_capacity(32);
        seq.append(&Ump::midi2_cc(0, 0, 7, 1234)).unwrap();
        seq.clear();
        assert_eq!(seq.position(), 0);
        assert_eq!(seq.capacity(), 32);
        assert!(seq.iter().next().is_none());
    }
}
