//! Part body storage
//!
//! A stash keeps the raw bytes of part bodies, keyed by part ordinal, so they
//! can be read again after the forward-only source has moved past them
mod file;
mod hybrid;
mod memory;

use crate::error::MimeError;
use std::io::Read;

pub use file::FileStash;
pub use hybrid::HybridStash;
pub use memory::MemoryStash;

/// [`StashManager::get_size`] value for an ordinal holding nothing
pub const SIZE_ABSENT: i64 = -1;

/// [`StashManager::get_size`] value for a stored body of unknown size
pub const SIZE_UNKNOWN: i64 = -2;

/// The storage strategy for part bodies
///
/// Ordinals are small non-negative integers; implementations keep them in a
/// dense vector
pub trait StashManager {
    /// Fully drains `source` into the entry for `ordinal`, replacing any previous entry
    ///
    /// Returns the number of bytes stored
    fn stash(&mut self, ordinal: usize, source: &mut dyn Read) -> Result<u64, MimeError>;

    /// Stores a copy of `bytes` for `ordinal`, replacing any previous entry
    fn stash_bytes(&mut self, ordinal: usize, bytes: &[u8]) -> Result<u64, MimeError> {
        let mut source = bytes;
        self.stash(ordinal, &mut source)
    }

    /// Removes the entry for `ordinal`, if any
    fn unstash(&mut self, ordinal: usize);

    /// Returns the stored size, [`SIZE_ABSENT`] or [`SIZE_UNKNOWN`]
    fn get_size(&self, ordinal: usize) -> i64;

    /// Returns a fresh reader positioned at the start of the stored bytes
    fn recall(&self, ordinal: usize) -> Result<Box<dyn Read>, MimeError>;

    /// Returns whether the entry is held as a contiguous in-memory buffer
    fn is_byte_array_available(&self, ordinal: usize) -> bool;

    /// Returns the in-memory buffer for `ordinal`
    ///
    /// Fails unless [`is_byte_array_available`](Self::is_byte_array_available) holds
    fn recall_bytes(&self, ordinal: usize) -> Result<&[u8], MimeError>;

    /// Returns whether an entry exists for `ordinal`
    fn peek(&self, ordinal: usize) -> bool;

    /// Releases all the stored data
    fn close(&mut self);
}

/// Returns the slot for `ordinal`, growing the vector as needed
fn slot<T>(entries: &mut Vec<Option<T>>, ordinal: usize) -> &mut Option<T> {
    if entries.len() <= ordinal {
        entries.resize_with(ordinal + 1, || None);
    }
    &mut entries[ordinal]
}

fn not_stashed(ordinal: usize) -> MimeError {
    MimeError::no_such_ordinal(ordinal, format!("No stashed data for MIME part #{}", ordinal))
}
