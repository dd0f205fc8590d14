//! Part handles
use crate::body::MultipartBody;
use crate::boundary::{BoundaryScanner, Outcome};
use crate::content_type::ContentTypeHeader;
use crate::error::MimeError;
use crate::header::{HeaderOverrides, MimeHeader, MimeHeaders};
use std::borrow::Cow;
use std::io::Read;
#[allow(unused_imports)]
use tracing::{debug, error, info, instrument, trace, warn};

#[derive(Debug)]
/// The bookkeeping for a discovered part
pub(crate) struct Part {
    pub(crate) headers: MimeHeaders,
    pub(crate) overrides: HeaderOverrides,
    /// The body was consumed from the source (it may still be stashed)
    pub(crate) body_read: bool,
    pub(crate) validated: bool,
}

impl Part {
    pub(crate) fn new(headers: MimeHeaders) -> Self {
        Self {
            headers,
            overrides: HeaderOverrides::default(),
            body_read: false,
            validated: false,
        }
    }

    /// The effective `Content-Length` header value
    pub(crate) fn declared_length(&self) -> Option<u64> {
        self.overrides
            .content_length
            .or(self.headers.content_length())
    }
}

/// A handle to a single part of a [`MultipartBody`]
///
/// The handle borrows the message mutably: reading a part body may advance
/// the underlying source
pub struct PartInfo<'a, R: Read> {
    body: &'a mut MultipartBody<R>,
    ordinal: usize,
}

impl<'a, R: Read> PartInfo<'a, R> {
    pub(crate) fn new(body: &'a mut MultipartBody<R>, ordinal: usize) -> Self {
        Self { body, ordinal }
    }

    fn part(&self) -> &Part {
        &self.body.parts[self.ordinal]
    }

    /// The 0-based position of the part in the message
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// The headers as parsed (overrides excluded)
    pub fn headers(&self) -> &MimeHeaders {
        &self.part().headers
    }

    /// Retrieves a header by name (case insensitive)
    pub fn header(&self, name: &str) -> Option<&MimeHeader> {
        self.part().headers.get(name)
    }

    /// The serialized header block, overrides applied
    pub fn headers_bytes(&self) -> Vec<u8> {
        let part = self.part();
        part.headers.to_bytes(&part.overrides)
    }

    /// The effective `Content-Type`, `application/octet-stream` if none was declared
    pub fn content_type(&self) -> &ContentTypeHeader {
        let part = self.part();
        part.overrides
            .content_type
            .as_ref()
            .unwrap_or(part.headers.content_type())
    }

    /// Replaces the `Content-Type` of this part
    pub fn set_content_type(&mut self, content_type: ContentTypeHeader) {
        self.body.parts[self.ordinal].overrides.content_type = Some(content_type);
    }

    /// The `Content-ID`, optionally stripped of its angle brackets
    pub fn content_id(&self, strip_angle_brackets: bool) -> Option<String> {
        self.part().headers.content_id(strip_angle_brackets)
    }

    /// The body length as currently known
    ///
    /// That is the stashed size if stashed, otherwise the declared `Content-Length`,
    /// otherwise -1
    pub fn content_length(&self) -> i64 {
        let size = self.body.stash.get_size(self.ordinal);
        if size >= 0 {
            return size;
        }
        match self.part().declared_length() {
            Some(len) => i64::try_from(len).unwrap_or(i64::MAX),
            None => -1,
        }
    }

    /// The exact body length, stashing the body if needed
    pub fn actual_content_length(&mut self) -> Result<u64, MimeError> {
        if !self.body.stash.peek(self.ordinal) {
            drop(self.body.part_body(self.ordinal, false)?);
        }
        u64::try_from(self.body.stash.get_size(self.ordinal)).map_err(|_| {
            MimeError::no_such_ordinal(
                self.ordinal,
                format!("Unable to determine the length of MIME part #{}", self.ordinal),
            )
        })
    }

    /// Returns whether the body was consumed from the source
    pub fn is_body_read(&self) -> bool {
        self.part().body_read
    }

    /// Returns whether the body is in the stash
    pub fn is_body_stashed(&self) -> bool {
        self.body.stash.peek(self.ordinal)
    }

    /// Returns whether the body can still be obtained
    pub fn is_body_available(&self) -> bool {
        !self.part().body_read || self.body.stash.peek(self.ordinal)
    }

    /// Returns the caller managed validation flag
    pub fn is_validated(&self) -> bool {
        self.part().validated
    }

    /// Sets the caller managed validation flag
    pub fn set_validated(&mut self, validated: bool) {
        self.body.parts[self.ordinal].validated = validated;
    }

    /// Opens the part body
    ///
    /// A stashed body is always returned from the stash. Otherwise the body
    /// is stashed first, unless `destructive` is set: in that case the bytes
    /// are streamed straight from the source and are gone once read
    pub fn body(&mut self, destructive: bool) -> Result<PartBody<'_, R>, MimeError> {
        self.body.part_body(self.ordinal, destructive)
    }

    /// Returns the body bytes if the stash holds them in memory already
    pub fn bytes_if_already_available(&self) -> Option<&[u8]> {
        if !self.body.stash.is_byte_array_available(self.ordinal) {
            return None;
        }
        self.body.stash.recall_bytes(self.ordinal).ok()
    }

    /// Returns the body bytes if they are in memory already or no larger than `max_size`
    pub fn bytes_if_available_or_smaller_than(
        &mut self,
        max_size: u64,
    ) -> Result<Option<Cow<'_, [u8]>>, MimeError> {
        if self.body.stash.is_byte_array_available(self.ordinal) {
            return Ok(Some(Cow::Borrowed(
                self.body.stash.recall_bytes(self.ordinal)?,
            )));
        }
        let len = self.actual_content_length()?;
        if len > max_size {
            return Ok(None);
        }
        let mut ret = Vec::with_capacity(usize::try_from(len).unwrap_or(0));
        self.body
            .stash
            .recall(self.ordinal)?
            .read_to_end(&mut ret)?;
        Ok(Some(Cow::Owned(ret)))
    }

    /// Replaces the part body
    ///
    /// An unread body is consumed from the source and discarded. The
    /// `Content-Length` is set to the new length
    pub fn set_body_bytes(&mut self, bytes: &[u8]) -> Result<(), MimeError> {
        self.body.check_failure()?;
        self.body.stash.unstash(self.ordinal);
        if self.body.is_frontier(self.ordinal) {
            let mut old = self.body.part_body(self.ordinal, true)?;
            std::io::copy(&mut old, &mut std::io::sink())?;
        }
        let len = self.body.stash.stash_bytes(self.ordinal, bytes)?;
        let part = &mut self.body.parts[self.ordinal];
        part.body_read = true;
        part.overrides.content_length = Some(len);
        Ok(())
    }
}

/// A readable part body
///
/// Obtained from [`PartInfo::body`]
pub struct PartBody<'a, R: Read> {
    inner: BodyInner<'a, R>,
}

enum BodyInner<'a, R: Read> {
    Stashed(Box<dyn Read>),
    Streaming(StreamingBody<'a, R>),
}

impl<'a, R: Read> PartBody<'a, R> {
    pub(crate) fn stashed(reader: Box<dyn Read>) -> Self {
        Self {
            inner: BodyInner::Stashed(reader),
        }
    }

    pub(crate) fn streaming(
        body: &'a mut MultipartBody<R>,
        ordinal: usize,
        scanner: Option<BoundaryScanner>,
    ) -> Self {
        Self {
            inner: BodyInner::Streaming(StreamingBody {
                body,
                ordinal,
                scanner,
                done: false,
            }),
        }
    }

    /// Returns whether the bytes come from the stash (and can be read again)
    pub fn is_stashed(&self) -> bool {
        matches!(self.inner, BodyInner::Stashed(_))
    }
}

impl<R: Read> Read for PartBody<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, std::io::Error> {
        match &mut self.inner {
            BodyInner::Stashed(r) => r.read(buf),
            BodyInner::Streaming(s) => s.read(buf),
        }
    }
}

/// A body read directly from the source
///
/// Without a scanner (single part messages) the body is the whole source
struct StreamingBody<'a, R: Read> {
    body: &'a mut MultipartBody<R>,
    ordinal: usize,
    scanner: Option<BoundaryScanner>,
    done: bool,
}

impl<R: Read> StreamingBody<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, std::io::Error> {
        if self.done || buf.is_empty() {
            return Ok(0);
        }
        let res = match self.scanner.as_mut() {
            None => self.body.source.read(buf).map_err(MimeError::from),
            Some(scanner) => match scanner.read(&mut self.body.source, buf) {
                Ok(Outcome::Data(n)) => Ok(n),
                Ok(end) => {
                    self.done = true;
                    self.body.finish_part(self.ordinal, end).map(|_| 0)
                }
                Err(e) => Err(e),
            },
        };
        match res {
            Ok(0) => {
                self.done = true;
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) => {
                self.done = true;
                self.body.fail(&e);
                Err(e.into())
            }
        }
    }
}

impl<R: Read> Drop for StreamingBody<'_, R> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        // Leave the source at the next part
        if let Some(scanner) = self.scanner.as_mut() {
            let res = scanner
                .drain(&mut self.body.source)
                .and_then(|end| self.body.finish_part(self.ordinal, end));
            if let Err(e) = res {
                error!("Failed to skip the rest of part #{}: {}", self.ordinal, e);
                self.body.fail(&e);
            }
        }
    }
}

/// A lazy forward cursor over the parts of a message
///
/// Each step is equivalent to [`MultipartBody::part`]; abandoning the cursor
/// leaves the remaining parts in the source
pub struct PartIterator<'a, R: Read> {
    body: &'a mut MultipartBody<R>,
    next: usize,
}

impl<'a, R: Read> PartIterator<'a, R> {
    pub(crate) fn new(body: &'a mut MultipartBody<R>) -> Self {
        Self { body, next: 0 }
    }

    /// Returns whether another part exists, reading ahead if needed
    pub fn has_next(&mut self) -> Result<bool, MimeError> {
        if self.next < self.body.num_parts_known() {
            return Ok(true);
        }
        if !self.body.is_more_parts_possible() {
            return Ok(false);
        }
        self.body.try_read_up_to_part(self.next)
    }

    /// Returns the next part
    ///
    /// This can fail even after [`has_next`](Self::has_next) returned true,
    /// if the message turns out to be truncated
    pub fn next_part(&mut self) -> Result<PartInfo<'_, R>, MimeError> {
        let ordinal = self.next;
        self.next += 1;
        self.body.part(ordinal)
    }
}
