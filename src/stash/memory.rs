use super::{SIZE_ABSENT, StashManager, not_stashed, slot};
use crate::error::MimeError;
use std::io::{Cursor, Read};
use std::sync::Arc;
#[allow(unused_imports)]
use tracing::{debug, error, info, instrument, trace, warn};

#[derive(Debug, Default)]
/// Keeps every part body in a memory buffer
///
/// There is no size ceiling: the caller is expected to bound the input
pub struct MemoryStash {
    entries: Vec<Option<Arc<[u8]>>>,
}

impl MemoryStash {
    /// Creates an empty stash
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an already filled buffer
    pub(super) fn store(&mut self, ordinal: usize, data: Vec<u8>) -> u64 {
        let len = data.len() as u64;
        trace!("Part #{} stashed in memory ({} bytes)", ordinal, len);
        *slot(&mut self.entries, ordinal) = Some(data.into());
        len
    }
}

impl StashManager for MemoryStash {
    fn stash(&mut self, ordinal: usize, source: &mut dyn Read) -> Result<u64, MimeError> {
        self.unstash(ordinal);
        let mut data = Vec::new();
        source.read_to_end(&mut data)?;
        Ok(self.store(ordinal, data))
    }

    fn stash_bytes(&mut self, ordinal: usize, bytes: &[u8]) -> Result<u64, MimeError> {
        Ok(self.store(ordinal, bytes.to_vec()))
    }

    fn unstash(&mut self, ordinal: usize) {
        if let Some(entry) = self.entries.get_mut(ordinal) {
            *entry = None;
        }
    }

    fn get_size(&self, ordinal: usize) -> i64 {
        match self.entries.get(ordinal) {
            Some(Some(data)) => data.len() as i64,
            _ => SIZE_ABSENT,
        }
    }

    fn recall(&self, ordinal: usize) -> Result<Box<dyn Read>, MimeError> {
        match self.entries.get(ordinal) {
            Some(Some(data)) => Ok(Box::new(Cursor::new(data.clone()))),
            _ => Err(not_stashed(ordinal)),
        }
    }

    fn is_byte_array_available(&self, ordinal: usize) -> bool {
        self.peek(ordinal)
    }

    fn recall_bytes(&self, ordinal: usize) -> Result<&[u8], MimeError> {
        match self.entries.get(ordinal) {
            Some(Some(data)) => Ok(&data[..]),
            _ => Err(not_stashed(ordinal)),
        }
    }

    fn peek(&self, ordinal: usize) -> bool {
        matches!(self.entries.get(ordinal), Some(Some(_)))
    }

    fn close(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_memory_stash() -> Result<(), MimeError> {
        let mut stash = MemoryStash::new();
        assert!(!stash.peek(0));
        assert_eq!(stash.get_size(3), SIZE_ABSENT);
        assert_eq!(stash.stash(3, &mut b"hello".as_slice())?, 5);
        assert!(stash.peek(3));
        assert!(!stash.peek(2));
        assert_eq!(stash.get_size(3), 5);
        assert!(stash.is_byte_array_available(3));
        assert_eq!(stash.recall_bytes(3)?, b"hello");

        // Readers are independent
        let mut a = stash.recall(3)?;
        let mut b = stash.recall(3)?;
        let mut buf = [0u8; 2];
        a.read_exact(&mut buf)?;
        let mut all = Vec::new();
        b.read_to_end(&mut all)?;
        assert_eq!(all, b"hello");

        assert_eq!(stash.stash_bytes(3, b"bye")?, 3);
        assert_eq!(stash.recall_bytes(3)?, b"bye");
        stash.unstash(3);
        stash.unstash(3);
        stash.unstash(30);
        assert!(!stash.peek(3));
        assert!(stash.recall(3).err().unwrap().is_no_such_part());
        assert!(stash.recall_bytes(3).unwrap_err().is_no_such_part());
        Ok(())
    }
}
