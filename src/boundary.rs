//! Multipart boundary scanner
//!
//! Part bodies are streamed through unchanged until the delimiter
//! `CRLF "--" boundary` shows up, at which point the scanner reports the end
//! of the part and leaves the source positioned past the delimiter line
//!
//! The match is incremental: a delimiter split across any number of reads is
//! detected, and bytes which only *looked* like the start of a delimiter are
//! handed back to the consumer before anything else is read
use crate::error::MimeError;
use crate::pushback::PushbackReader;
use std::io::Read;
#[allow(unused_imports)]
use tracing::{debug, error, info, instrument, trace, warn};

/// The maximum amount of transport padding tolerated after a delimiter
const MAX_PADDING: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The result of a single [`BoundaryScanner::read`]
pub enum Outcome {
    /// Some part body bytes were produced
    Data(usize),
    /// An inter-part boundary was found, the source is positioned at the next part headers
    PartEnded,
    /// The terminal boundary was found, the source is positioned past the `--` marker
    FinalBoundary,
}

impl Outcome {
    /// Returns whether the scanner reached a boundary
    pub fn is_end(&self) -> bool {
        !matches!(self, Self::Data(_))
    }
}

#[derive(Debug)]
/// The incremental delimiter matcher
///
/// The scanner doesn't own the source, which allows the owner of the source
/// to react to the [`Outcome`] of each read
pub struct BoundaryScanner {
    /// CRLF + "--" + boundary
    delimiter: Vec<u8>,
    max_pushback: usize,
    /// Delimiter prefix bytes read but withheld from the consumer
    matched: usize,
    end: Option<Outcome>,
    scratch: Vec<u8>,
}

impl BoundaryScanner {
    /// Creates a scanner for `boundary_token` (`"--" + boundary`)
    ///
    /// No single read will request more than `max_pushback` bytes from the source
    pub fn new(boundary_token: &[u8], max_pushback: usize) -> Result<Self, MimeError> {
        if boundary_token.len() <= 2 || !boundary_token.starts_with(b"--") {
            return Err(MimeError::Malformed(
                "invalid multipart boundary token".to_string(),
            ));
        }
        if boundary_token.len() > crate::BLOCK_SIZE {
            return Err(MimeError::Malformed(format!(
                "multipart boundary is more than {} bytes long",
                crate::BLOCK_SIZE
            )));
        }
        if max_pushback == 0 {
            return Err(MimeError::Malformed("invalid pushback size".to_string()));
        }
        let mut delimiter = crate::CRLF.to_vec();
        delimiter.extend_from_slice(boundary_token);
        Ok(Self {
            delimiter,
            max_pushback,
            matched: 0,
            end: None,
            scratch: vec![0; max_pushback],
        })
    }

    /// Returns the end outcome, once a boundary was found
    pub fn end(&self) -> Option<Outcome> {
        self.end
    }

    /// Reads part body bytes into `out`
    ///
    /// Once a boundary is found every further call returns the same end outcome.
    /// Reaching EOF before any boundary is an [`UnterminatedPart`](MimeError::UnterminatedPart) error.
    ///
    /// The source limit is enforced on the bytes actually consumed: whatever
    /// was read ahead and pushed back doesn't count
    pub fn read<R: Read>(
        &mut self,
        src: &mut PushbackReader<R>,
        out: &mut [u8],
    ) -> Result<Outcome, MimeError> {
        let outcome = self.scan(src, out)?;
        src.check_limit()?;
        Ok(outcome)
    }

    fn scan<R: Read>(
        &mut self,
        src: &mut PushbackReader<R>,
        out: &mut [u8],
    ) -> Result<Outcome, MimeError> {
        if let Some(end) = self.end {
            return Ok(end);
        }
        if out.is_empty() {
            return Ok(Outcome::Data(0));
        }
        let dlen = self.delimiter.len();
        loop {
            let want = out.len().min(self.max_pushback);
            let n = loop {
                match src.read_unchecked(&mut self.scratch[0..want]) {
                    Ok(v) => break v,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            };
            if n == 0 {
                debug!("Source exhausted before the boundary");
                return Err(MimeError::UnterminatedPart);
            }
            let chunk = &self.scratch[0..n];

            if self.matched > 0 {
                // Continue the match from the previous read
                let need = dlen - self.matched;
                let cmp = need.min(n);
                if chunk[0..cmp] == self.delimiter[self.matched..(self.matched + cmp)] {
                    if cmp < need {
                        self.matched += n;
                        continue;
                    }
                    src.unread(&chunk[cmp..]);
                    self.matched = 0;
                    match Self::finish_delimiter(src)? {
                        Some(end) => {
                            self.end = Some(end);
                            return Ok(end);
                        }
                        None => {
                            src.unread(&self.delimiter[1..]);
                            out[0] = self.delimiter[0];
                            return Ok(Outcome::Data(1));
                        }
                    }
                }
                // Ruled out: the first withheld byte is data, the rest gets rescanned
                src.unread(chunk);
                src.unread(&self.delimiter[1..self.matched]);
                self.matched = 0;
                out[0] = self.delimiter[0];
                return Ok(Outcome::Data(1));
            }

            if let Some(pos) = memchr::memmem::find(chunk, &self.delimiter) {
                out[0..pos].copy_from_slice(&chunk[0..pos]);
                src.unread(&chunk[(pos + dlen)..]);
                match Self::finish_delimiter(src)? {
                    Some(end) => {
                        self.end = Some(end);
                        if pos > 0 {
                            return Ok(Outcome::Data(pos));
                        }
                        return Ok(end);
                    }
                    None => {
                        src.unread(&self.delimiter[1..]);
                        out[pos] = self.delimiter[0];
                        return Ok(Outcome::Data(pos + 1));
                    }
                }
            }

            // Withhold a trailing delimiter prefix, if any
            let tail_start = n.saturating_sub(dlen - 1);
            let keep = memchr::memchr_iter(crate::CR, &chunk[tail_start..])
                .map(|i| tail_start + i)
                .find(|&i| self.delimiter.starts_with(&chunk[i..]))
                .unwrap_or(n);
            out[0..keep].copy_from_slice(&chunk[0..keep]);
            self.matched = n - keep;
            if keep > 0 {
                return Ok(Outcome::Data(keep));
            }
        }
    }

    /// Consumes what follows a matched delimiter
    ///
    /// Returns `None` (with everything pushed back) if the line is not a valid delimiter
    fn finish_delimiter<R: Read>(src: &mut PushbackReader<R>) -> Result<Option<Outcome>, MimeError> {
        let mut seen: Vec<u8> = Vec::with_capacity(4);
        let mut next = src.read_byte_unchecked()?;
        if next == Some(b'-') {
            seen.push(b'-');
            next = src.read_byte_unchecked()?;
            if next == Some(b'-') {
                trace!("Final boundary found");
                return Ok(Some(Outcome::FinalBoundary));
            }
        } else {
            // Transport padding
            while let Some(c) = next {
                if !crate::WSP.contains(&c) || seen.len() >= MAX_PADDING {
                    break;
                }
                seen.push(c);
                next = src.read_byte_unchecked()?;
            }
            if next == Some(crate::CR) {
                seen.push(crate::CR);
                next = src.read_byte_unchecked()?;
                if next == Some(crate::LF) {
                    trace!("Boundary found");
                    return Ok(Some(Outcome::PartEnded));
                }
            }
        }
        if let Some(c) = next {
            seen.push(c);
        }
        src.unread(&seen);
        Ok(None)
    }

    /// Reads and discards the remainder of the part
    pub fn drain<R: Read>(&mut self, src: &mut PushbackReader<R>) -> Result<Outcome, MimeError> {
        let mut sink = [0u8; 1024];
        loop {
            let outcome = self.read(src, &mut sink)?;
            if outcome.is_end() {
                return Ok(outcome);
            }
        }
    }
}

/// A [`Read`] adapter returning the bytes of a part body until the boundary
///
/// EOF is reported when the boundary is found; [`outcome`](Self::outcome)
/// tells which kind of boundary it was
pub struct BoundaryTerminatedReader<'a, R: Read> {
    src: &'a mut PushbackReader<R>,
    scanner: BoundaryScanner,
}

impl<'a, R: Read> BoundaryTerminatedReader<'a, R> {
    /// Creates the reader for `boundary_token` (`"--" + boundary`)
    pub fn new(
        boundary_token: &[u8],
        src: &'a mut PushbackReader<R>,
        max_pushback: usize,
    ) -> Result<Self, MimeError> {
        Ok(Self {
            src,
            scanner: BoundaryScanner::new(boundary_token, max_pushback)?,
        })
    }

    /// Returns the boundary kind once the end is reached
    pub fn outcome(&self) -> Option<Outcome> {
        self.scanner.end()
    }

    /// Returns whether the terminal boundary was found
    pub fn is_last_part_processed(&self) -> bool {
        self.scanner.end() == Some(Outcome::FinalBoundary)
    }

    /// Discards any unread bytes so the source is positioned past the boundary
    pub fn close(mut self) -> Result<Outcome, MimeError> {
        self.scanner.drain(self.src)
    }
}

impl<R: Read> Read for BoundaryTerminatedReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, std::io::Error> {
        match self.scanner.read(self.src, buf)? {
            Outcome::Data(n) => Ok(n),
            _ => Ok(0),
        }
    }
}
