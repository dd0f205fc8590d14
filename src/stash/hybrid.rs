use super::{FileStash, MemoryStash, SIZE_ABSENT, StashManager, not_stashed};
use crate::error::MimeError;
use std::io::{Cursor, Read};
use std::path::Path;
#[allow(unused_imports)]
use tracing::{debug, error, info, instrument, trace, warn};

/// The largest initial in-memory buffer
const MAX_INITIAL_BUFFER: u64 = 8192;

/// Keeps part bodies in memory up to a byte limit, then on disk
///
/// The limit applies to the running total of all the bytes stashed since
/// construction. Unstashing doesn't lower the total: once the limit is
/// crossed every new body goes to disk and no entry is offered as an
/// in-memory buffer anymore
pub struct HybridStash {
    limit: u64,
    total: u64,
    spilled: bool,
    memory: MemoryStash,
    file: FileStash,
}

impl HybridStash {
    /// Creates a stash keeping up to `limit` bytes in memory and spilling to `dir`
    pub fn new<P: AsRef<Path>>(limit: u64, dir: P) -> Result<Self, std::io::Error> {
        Ok(Self {
            limit,
            total: 0,
            spilled: false,
            memory: MemoryStash::new(),
            file: FileStash::new(dir)?,
        })
    }

    /// Returns the running total of stashed bytes
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Returns whether the memory limit was exceeded
    pub fn is_spilled(&self) -> bool {
        self.spilled
    }

    fn initial_buffer_size(budget: u64) -> usize {
        let size = if budget < 64 {
            budget + 1
        } else {
            (budget / 4).clamp(64, MAX_INITIAL_BUFFER)
        };
        size as usize
    }

    fn spill(&mut self) {
        if !self.spilled {
            debug!(
                "Stash limit of {} bytes exceeded, switching to file storage",
                self.limit
            );
            self.spilled = true;
        }
    }
}

impl StashManager for HybridStash {
    fn stash(&mut self, ordinal: usize, source: &mut dyn Read) -> Result<u64, MimeError> {
        self.unstash(ordinal);
        if !self.spilled {
            let budget = self.limit - self.total;
            let mut data = Vec::with_capacity(Self::initial_buffer_size(budget));
            Read::take(&mut *source, budget.saturating_add(1)).read_to_end(&mut data)?;
            if data.len() as u64 <= budget {
                let size = self.memory.store(ordinal, data);
                self.total += size;
                return Ok(size);
            }
            // Move what was buffered to disk together with the rest
            self.spill();
            let mut chained = Cursor::new(data).chain(source);
            let size = self.file.stash(ordinal, &mut chained)?;
            self.total = self.total.saturating_add(size);
            return Ok(size);
        }
        let size = self.file.stash(ordinal, source)?;
        self.total = self.total.saturating_add(size);
        Ok(size)
    }

    fn unstash(&mut self, ordinal: usize) {
        self.memory.unstash(ordinal);
        self.file.unstash(ordinal);
    }

    fn get_size(&self, ordinal: usize) -> i64 {
        match self.memory.get_size(ordinal) {
            SIZE_ABSENT => self.file.get_size(ordinal),
            size => size,
        }
    }

    fn recall(&self, ordinal: usize) -> Result<Box<dyn Read>, MimeError> {
        if self.memory.peek(ordinal) {
            return self.memory.recall(ordinal);
        }
        self.file.recall(ordinal)
    }

    fn is_byte_array_available(&self, ordinal: usize) -> bool {
        !self.spilled && self.memory.is_byte_array_available(ordinal)
    }

    fn recall_bytes(&self, ordinal: usize) -> Result<&[u8], MimeError> {
        if self.spilled {
            return Err(MimeError::no_such_ordinal(
                ordinal,
                format!(
                    "MIME part #{} is not available as a byte array after the stash limit was exceeded",
                    ordinal
                ),
            ));
        }
        if !self.memory.peek(ordinal) {
            return Err(not_stashed(ordinal));
        }
        self.memory.recall_bytes(ordinal)
    }

    fn peek(&self, ordinal: usize) -> bool {
        self.memory.peek(ordinal) || self.file.peek(ordinal)
    }

    fn close(&mut self) {
        self.memory.close();
        self.file.close();
    }
}
