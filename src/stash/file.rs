use super::{SIZE_ABSENT, StashManager, not_stashed, slot};
use crate::error::MimeError;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::NamedTempFile;
#[allow(unused_imports)]
use tracing::{debug, error, info, instrument, trace, warn};

struct FileEntry {
    file: NamedTempFile,
    size: u64,
}

/// Keeps every part body in its own scratch file
///
/// Files are created under the given directory and removed when the entry
/// is unstashed or the stash is closed (or dropped)
pub struct FileStash {
    dir: PathBuf,
    entries: Vec<Option<FileEntry>>,
    closed: Arc<AtomicBool>,
}

impl FileStash {
    /// Creates a stash writing into `dir`, which must be an existing writable directory
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, std::io::Error> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.is_dir() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("stash directory {} does not exist", dir.display()),
            ));
        }
        Ok(Self {
            dir,
            entries: Vec::new(),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Returns the path of the scratch file for `ordinal`, if any
    pub fn path(&self, ordinal: usize) -> Option<&Path> {
        match self.entries.get(ordinal) {
            Some(Some(entry)) => Some(entry.file.path()),
            _ => None,
        }
    }
}

impl StashManager for FileStash {
    #[instrument(level = "trace", skip(self, source))]
    fn stash(&mut self, ordinal: usize, source: &mut dyn Read) -> Result<u64, MimeError> {
        self.unstash(ordinal);
        let mut file = tempfile::Builder::new()
            .prefix(&format!("mimepart_{}_", ordinal))
            .tempfile_in(&self.dir)?;
        let size = {
            let mut writer = BufWriter::new(file.as_file_mut());
            let size = std::io::copy(source, &mut writer)?;
            writer.flush()?;
            size
        };
        trace!(
            "Part #{} stashed to {} ({} bytes)",
            ordinal,
            file.path().display(),
            size
        );
        *slot(&mut self.entries, ordinal) = Some(FileEntry { file, size });
        Ok(size)
    }

    fn unstash(&mut self, ordinal: usize) {
        if let Some(entry) = self.entries.get_mut(ordinal) {
            // Dropping the handle removes the file
            *entry = None;
        }
    }

    fn get_size(&self, ordinal: usize) -> i64 {
        match self.entries.get(ordinal) {
            Some(Some(entry)) => entry.size as i64,
            _ => SIZE_ABSENT,
        }
    }

    fn recall(&self, ordinal: usize) -> Result<Box<dyn Read>, MimeError> {
        match self.entries.get(ordinal) {
            Some(Some(entry)) => Ok(Box::new(StashedFileReader {
                file: entry.file.reopen()?,
                closed: self.closed.clone(),
            })),
            _ => Err(not_stashed(ordinal)),
        }
    }

    fn is_byte_array_available(&self, _ordinal: usize) -> bool {
        false
    }

    fn recall_bytes(&self, ordinal: usize) -> Result<&[u8], MimeError> {
        Err(MimeError::no_such_ordinal(
            ordinal,
            format!("MIME part #{} is not held in memory", ordinal),
        ))
    }

    fn peek(&self, ordinal: usize) -> bool {
        matches!(self.entries.get(ordinal), Some(Some(_)))
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::Release);
        for entry in self.entries.drain(..).flatten() {
            if let Err(e) = entry.file.close() {
                warn!("Failed to remove stash file: {}", e);
            }
        }
    }
}

impl Drop for FileStash {
    fn drop(&mut self) {
        self.close();
    }
}

/// A reader over a stash file which stops working once the stash is closed
struct StashedFileReader {
    file: std::fs::File,
    closed: Arc<AtomicBool>,
}

impl Read for StashedFileReader {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, std::io::Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(std::io::Error::other("the stash was closed"));
        }
        self.file.read(buf)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_file_stash() -> Result<(), MimeError> {
        let dir = tempfile::tempdir()?;
        let mut stash = FileStash::new(dir.path())?;
        assert_eq!(stash.stash(1, &mut b"on disk".as_slice())?, 7);
        assert!(stash.peek(1));
        assert!(!stash.peek(0));
        assert_eq!(stash.get_size(1), 7);
        assert_eq!(stash.get_size(0), SIZE_ABSENT);
        assert!(!stash.is_byte_array_available(1));
        assert!(stash.recall_bytes(1).unwrap_err().is_no_such_part());

        let mut data = Vec::new();
        stash.recall(1)?.read_to_end(&mut data)?;
        assert_eq!(data, b"on disk");

        let path = stash.path(1).map(|p| p.to_path_buf()).unwrap();
        assert!(path.exists());
        stash.stash_bytes(1, b"replaced")?;
        assert!(!path.exists());
        let mut data = Vec::new();
        stash.recall(1)?.read_to_end(&mut data)?;
        assert_eq!(data, b"replaced");

        stash.unstash(1);
        stash.unstash(1);
        assert!(!stash.peek(1));
        assert!(stash.recall(1).err().unwrap().is_no_such_part());
        Ok(())
    }

    #[test]
    fn test_close_removes_files() -> Result<(), MimeError> {
        let dir = tempfile::tempdir()?;
        let mut stash = FileStash::new(dir.path())?;
        stash.stash_bytes(0, b"first")?;
        stash.stash_bytes(2, b"third")?;
        let mut held = stash.recall(2)?;
        stash.close();
        assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
        let mut buf = [0u8; 4];
        assert!(held.read(&mut buf).is_err());
        stash.close();
        Ok(())
    }

    #[test]
    fn test_missing_dir() {
        assert!(FileStash::new("/nonexistent/mimebody/stash").is_err());
    }
}
