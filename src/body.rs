//! The message body orchestrator
use crate::boundary::{BoundaryScanner, BoundaryTerminatedReader, Outcome};
use crate::config::Config;
use crate::content_type::ContentTypeHeader;
use crate::entire::EntireBody;
use crate::error::MimeError;
use crate::header::MimeHeaders;
use crate::part::{Part, PartBody, PartInfo, PartIterator};
use crate::pushback::PushbackReader;
use crate::stash::{MemoryStash, StashManager};
use std::collections::HashMap;
use std::io::Read;
#[allow(unused_imports)]
use tracing::{debug, error, info, instrument, trace, warn};

#[derive(Debug)]
struct Boundary {
    /// The boundary parameter value
    text: String,
    /// `"--"` + boundary
    token: Vec<u8>,
}

/// A message body exposed as a sequence of parts
///
/// A multipart body is parsed lazily and strictly in wire order: only the
/// preamble and the headers of the first part are consumed on construction.
/// Requesting a later part stashes the bodies of all the parts in between.
///
/// Any other outer type yields a single part (ordinal 0) whose headers are
/// just the outer `Content-Type` and whose body is the whole source.
///
/// After a fatal error (malformed boundary, truncated part, length
/// mismatch...) the message is poisoned: operations which need the source
/// fail with [`MimeError::PreviouslyFailed`], while stashed bodies remain
/// readable until [`close`](Self::close)
pub struct MultipartBody<R: Read> {
    pub(crate) source: PushbackReader<R>,
    pub(crate) stash: Box<dyn StashManager>,
    outer_content_type: ContentTypeHeader,
    boundary: Option<Boundary>,
    pushback: usize,
    pub(crate) parts: Vec<Part>,
    parts_by_cid: HashMap<String, usize>,
    more_parts: bool,
    stream_validated_only: bool,
    failure: Option<String>,
    headers_max_size: u64,
    limit_customized: bool,
    closed: bool,
}

impl<R: Read> MultipartBody<R> {
    /// Creates the message body with the default [`Config`]
    pub fn new(
        stash: Box<dyn StashManager>,
        outer_content_type: ContentTypeHeader,
        source: R,
    ) -> Result<Self, MimeError> {
        Self::with_config(stash, outer_content_type, source, &Config::default())
    }

    /// Creates the message body
    ///
    /// For multipart types the preamble and the first part headers are read
    #[instrument(level = "debug", skip_all, fields(content_type = %outer_content_type))]
    pub fn with_config(
        stash: Box<dyn StashManager>,
        outer_content_type: ContentTypeHeader,
        source: R,
        config: &Config,
    ) -> Result<Self, MimeError> {
        let mut ret = Self {
            source: PushbackReader::new(source, crate::BLOCK_SIZE),
            stash,
            outer_content_type,
            boundary: None,
            pushback: crate::BLOCK_SIZE,
            parts: Vec::new(),
            parts_by_cid: HashMap::new(),
            more_parts: true,
            stream_validated_only: false,
            failure: None,
            headers_max_size: config.headers_max_size,
            limit_customized: false,
            closed: false,
        };
        if !ret.outer_content_type.is_multipart() {
            ret.init_single_part(config.first_part_max_bytes)?;
            return Ok(ret);
        }

        let start = ret.outer_content_type.param("start").map(|s| s.to_string());
        if start.as_deref() == Some("") {
            return Err(MimeError::Malformed(
                "multipart content type has a \"start\" parameter but it is empty".to_string(),
            ));
        }
        let text = ret
            .outer_content_type
            .multipart_boundary()
            .ok_or_else(|| MimeError::Malformed("multipart boundary is missing".to_string()))?
            .to_string();
        let token = format!("--{}", text).into_bytes();
        if token.len() > crate::BLOCK_SIZE {
            return Err(MimeError::Malformed(format!(
                "multipart boundary is more than {} bytes long",
                crate::BLOCK_SIZE
            )));
        }
        ret.pushback = crate::BLOCK_SIZE + token.len();
        ret.boundary = Some(Boundary { text, token });

        ret.read_initial_boundary(config.preamble_max_size)?;
        if !ret.more_parts {
            if !config.allow_lax_empty_multipart {
                return Err(MimeError::Malformed(
                    "multipart message has no parts".to_string(),
                ));
            }
            debug!("Empty multipart message, treating as single part");
            ret.boundary = None;
            ret.more_parts = true;
            ret.init_single_part(config.first_part_max_bytes)?;
            return Ok(ret);
        }

        ret.read_next_headers()?;
        if let Some(start) = start {
            let first = &ret.parts[0].headers;
            let matched = first.is_empty()
                || first.content_id(false).as_deref() == Some(start.as_str())
                || (config.allow_lax_start_param_match
                    && first.content_id(true).as_deref() == Some(start.as_str()));
            if !matched {
                return Err(MimeError::Malformed(
                    "multipart content type has a \"start\" parameter, but it doesn't match the Content-ID of the first part"
                        .to_string(),
                ));
            }
        }
        if config.first_part_max_bytes > 0 {
            let limit = config
                .first_part_max_bytes
                .saturating_add(ret.source.position());
            ret.source.set_limit(limit)?;
        }
        debug!(
            "Multipart message with boundary \"{}\" ready",
            ret.boundary().unwrap_or_default()
        );
        Ok(ret)
    }

    fn init_single_part(&mut self, first_part_max_bytes: u64) -> Result<(), MimeError> {
        if first_part_max_bytes > 0 {
            self.source.set_limit(first_part_max_bytes)?;
        }
        self.parts.push(Part::new(MimeHeaders::with_content_type(
            &self.outer_content_type,
        )));
        Ok(())
    }

    /// Skips the preamble, leaving the source at the first part headers
    fn read_initial_boundary(&mut self, preamble_max_size: u64) -> Result<(), MimeError> {
        let token = match &self.boundary {
            Some(b) => b.token.as_slice(),
            None => return Ok(()),
        };
        let mut scanner = BoundaryScanner::new(token, self.pushback)?;
        // No preamble means the very first line is the boundary
        self.source.unread(crate::CRLF);
        let mut sink = [0u8; 1024];
        let mut preamble_size = 0u64;
        let outcome = loop {
            match scanner.read(&mut self.source, &mut sink) {
                Ok(Outcome::Data(n)) => {
                    preamble_size += n as u64;
                    if preamble_size > preamble_max_size {
                        return Err(MimeError::LimitExceeded {
                            what: "multipart preamble",
                            limit: preamble_max_size,
                        });
                    }
                }
                Ok(end) => break end,
                Err(MimeError::UnterminatedPart) => {
                    return Err(MimeError::Malformed(
                        "multipart message has no initial boundary".to_string(),
                    ));
                }
                Err(e) => return Err(e),
            }
        };
        self.source.discount(crate::CRLF.len() as u64);
        trace!("Preamble skipped ({} bytes)", preamble_size);
        if outcome == Outcome::FinalBoundary {
            self.more_parts = false;
        }
        Ok(())
    }

    /// Parses the headers at the source position into a new part
    fn read_next_headers(&mut self) -> Result<(), MimeError> {
        if !self.more_parts {
            return Err(MimeError::no_such_ordinal(
                self.parts.len(),
                "Out of parts",
            ));
        }
        if !self.limit_customized {
            self.source.set_limit(0)?;
        }
        let headers = MimeHeaders::parse(&mut self.source, self.headers_max_size)?;
        let ordinal = self.parts.len();
        if let Some(cid) = headers.content_id(true) {
            self.parts_by_cid.insert(cid, ordinal);
        }
        self.parts.push(Part::new(headers));
        trace!("Part #{} discovered", ordinal);
        Ok(())
    }

    pub(crate) fn check_failure(&self) -> Result<(), MimeError> {
        match &self.failure {
            Some(message) => Err(MimeError::PreviouslyFailed(message.clone())),
            None => Ok(()),
        }
    }

    /// Poisons the message
    pub(crate) fn fail(&mut self, err: &MimeError) {
        if self.failure.is_none() {
            warn!("Message body processing failed: {}", err);
            self.failure = Some(err.to_string());
        }
    }

    /// Returns whether `ordinal` is the part whose body is next in the source
    pub(crate) fn is_frontier(&self, ordinal: usize) -> bool {
        self.more_parts && ordinal + 1 == self.parts.len() && !self.parts[ordinal].body_read
    }

    /// Reacts to the end of a destructively read part body
    ///
    /// The caller is responsible for latching any error
    pub(crate) fn finish_part(&mut self, ordinal: usize, outcome: Outcome) -> Result<(), MimeError> {
        trace!("Part #{} body consumed ({:?})", ordinal, outcome);
        match outcome {
            Outcome::PartEnded => self.read_next_headers(),
            Outcome::FinalBoundary => {
                self.more_parts = false;
                Ok(())
            }
            Outcome::Data(_) => Ok(()),
        }
    }

    /// Stashes the frontier body and moves on to the next part
    fn advance(&mut self) -> Result<(), MimeError> {
        self.check_failure()?;
        let res = self.stash_frontier();
        if let Err(e) = &res {
            self.fail(e);
        }
        res
    }

    fn stash_frontier(&mut self) -> Result<(), MimeError> {
        let ordinal = self.parts.len() - 1;
        let (size, outcome) = match &self.boundary {
            Some(boundary) => {
                let mut reader =
                    BoundaryTerminatedReader::new(&boundary.token, &mut self.source, self.pushback)?;
                let size = self.stash.stash(ordinal, &mut reader)?;
                (size, reader.outcome())
            }
            None => (self.stash.stash(ordinal, &mut self.source)?, None),
        };
        self.parts[ordinal].body_read = true;
        debug!("Part #{} stashed ({} bytes)", ordinal, size);

        let part = &mut self.parts[ordinal];
        if let Some(declared) = part.declared_length() {
            if declared != size {
                return Err(MimeError::ContentLengthMismatch {
                    ordinal,
                    declared,
                    actual: size,
                });
            }
            part.overrides.content_length = Some(size);
        }

        match outcome {
            Some(Outcome::PartEnded) => self.read_next_headers(),
            _ => {
                self.more_parts = false;
                Ok(())
            }
        }
    }

    /// Returns the body of `ordinal`
    pub(crate) fn part_body(
        &mut self,
        ordinal: usize,
        destructive: bool,
    ) -> Result<PartBody<'_, R>, MimeError> {
        if self.stash.peek(ordinal) {
            return Ok(PartBody::stashed(self.stash.recall(ordinal)?));
        }
        self.check_failure()?;
        if ordinal >= self.parts.len() || self.parts[ordinal].body_read {
            return Err(MimeError::no_such_ordinal(
                ordinal,
                format!(
                    "The body of MIME part #{} has already been read, and was not saved",
                    ordinal
                ),
            ));
        }
        if !self.is_frontier(ordinal) {
            return Err(MimeError::no_such_ordinal(
                ordinal,
                format!("The source is not positioned at the body of MIME part #{}", ordinal),
            ));
        }
        if !destructive {
            self.advance()?;
            return Ok(PartBody::stashed(self.stash.recall(ordinal)?));
        }
        self.parts[ordinal].body_read = true;
        let scanner = match &self.boundary {
            Some(boundary) => Some(BoundaryScanner::new(&boundary.token, self.pushback)?),
            None => {
                self.more_parts = false;
                None
            }
        };
        debug!("Streaming part #{} destructively", ordinal);
        Ok(PartBody::streaming(self, ordinal, scanner))
    }

    /// Retrieves a part by ordinal, stashing any intervening part bodies
    pub fn part(&mut self, ordinal: usize) -> Result<PartInfo<'_, R>, MimeError> {
        if ordinal > 0 && self.boundary.is_none() {
            return Err(MimeError::no_such_ordinal(
                ordinal,
                "There is only one part in a single-part message",
            ));
        }
        if ordinal >= self.parts.len() {
            self.read_up_to_part(ordinal)?;
        }
        Ok(PartInfo::new(self, ordinal))
    }

    fn read_up_to_part(&mut self, ordinal: usize) -> Result<(), MimeError> {
        self.check_failure()?;
        while self.parts.len() <= ordinal {
            if !self.more_parts {
                return Err(MimeError::no_such_ordinal(
                    ordinal,
                    format!(
                        "This message does not have a part #{}; there were only {} parts",
                        ordinal,
                        self.parts.len()
                    ),
                ));
            }
            self.advance()?;
        }
        Ok(())
    }

    /// Like `read_up_to_part` but reports a missing part as `false`
    pub(crate) fn try_read_up_to_part(&mut self, ordinal: usize) -> Result<bool, MimeError> {
        self.check_failure()?;
        if self.boundary.is_none() {
            return Ok(ordinal < self.parts.len());
        }
        while self.parts.len() <= ordinal {
            if !self.more_parts {
                return Ok(false);
            }
            self.advance()?;
        }
        Ok(true)
    }

    /// Retrieves the first part with the given `Content-ID` (angle brackets stripped)
    ///
    /// Parts are stashed until the id is found or the message ends
    pub fn part_by_content_id(&mut self, content_id: &str) -> Result<PartInfo<'_, R>, MimeError> {
        loop {
            if let Some(ordinal) = self.parts_by_cid.get(content_id).copied() {
                return Ok(PartInfo::new(self, ordinal));
            }
            if !self.more_parts || self.boundary.is_none() {
                return Err(MimeError::no_such_cid(content_id));
            }
            self.advance()?;
        }
    }

    /// Returns the first part, which always exists
    pub fn first_part(&mut self) -> PartInfo<'_, R> {
        PartInfo::new(self, 0)
    }

    /// Returns a lazy cursor over the parts
    pub fn parts(&mut self) -> PartIterator<'_, R> {
        PartIterator::new(self)
    }

    /// Restricts [`entire_message_body`](Self::entire_message_body) and
    /// [`entire_message_body_length`](Self::entire_message_body_length) to the
    /// first part plus the parts flagged as validated
    pub fn set_entire_message_body_validated_only(&mut self) {
        self.stream_validated_only = true;
    }

    fn assert_no_part_bodies_destroyed(&self) -> Result<(), MimeError> {
        for (ordinal, part) in self.parts.iter().enumerate() {
            if part.body_read && !self.stash.peek(ordinal) {
                return Err(MimeError::no_such_ordinal(
                    ordinal,
                    format!("Part #{} has already been destructively read", ordinal),
                ));
            }
        }
        Ok(())
    }

    fn is_included(&self, ordinal: usize) -> bool {
        ordinal == 0 || !self.stream_validated_only || self.parts[ordinal].validated
    }

    /// Returns the whole message body as it would appear on the wire
    ///
    /// Stashed parts are replayed with their boundaries and (possibly
    /// overridden) headers. With `destructive` the unread remainder of the
    /// source is passed through as is instead of being stashed first.
    /// Fails if any part body was already consumed destructively
    pub fn entire_message_body(&mut self, destructive: bool) -> Result<EntireBody<'_, R>, MimeError> {
        self.check_failure()?;
        if !destructive || (self.stream_validated_only && self.boundary.is_some()) {
            self.read_and_stash_entire_message()?;
        }
        self.assert_no_part_bodies_destroyed()?;

        let Some(boundary) = &self.boundary else {
            return Ok(EntireBody::single(self.part_body(0, destructive)?));
        };
        let delimiter = format!("\r\n--{}\r\n", boundary.text).into_bytes();
        let closing = format!("\r\n--{}--\r\n", boundary.text).into_bytes();
        let mut ret = EntireBody::new();
        let mut frontier = false;
        for (ordinal, part) in self.parts.iter().enumerate() {
            if !self.is_included(ordinal) {
                continue;
            }
            ret.push_bytes(delimiter.clone());
            ret.push_bytes(part.headers.to_bytes(&part.overrides));
            if self.stash.peek(ordinal) {
                ret.push_reader(self.stash.recall(ordinal)?);
            } else {
                frontier = true;
                break;
            }
        }
        if frontier {
            // The rest of the message, final boundary included, is still in the source
            if let Some(part) = self.parts.last_mut() {
                part.body_read = true;
            }
            self.more_parts = false;
            ret.push_source(&mut self.source);
        } else {
            ret.push_bytes(closing);
        }
        Ok(ret)
    }

    /// Returns the length of [`entire_message_body`](Self::entire_message_body)
    ///
    /// All the parts are stashed in the process; a negative value means the
    /// length could not be determined
    pub fn entire_message_body_length(&mut self) -> Result<i64, MimeError> {
        self.check_failure()?;
        self.read_and_stash_entire_message()?;
        self.assert_no_part_bodies_destroyed()?;

        let Some(boundary) = &self.boundary else {
            return Ok(self.stash.get_size(0));
        };
        let token_len = boundary.token.len() as i64;
        let mut len = 0i64;
        for (ordinal, part) in self.parts.iter().enumerate() {
            if !self.is_included(ordinal) {
                continue;
            }
            len += 2 + token_len + 2;
            len += part.headers.serialized_len(&part.overrides) as i64;
            let body_len = self.stash.get_size(ordinal);
            if body_len < 0 {
                return Ok(body_len);
            }
            len += body_len;
        }
        Ok(len + 2 + token_len + 2 + 2)
    }

    /// Reads and stashes every remaining part
    pub fn read_and_stash_entire_message(&mut self) -> Result<(), MimeError> {
        self.check_failure()?;
        if self.boundary.is_none() {
            if !self.stash.peek(0) {
                drop(self.part_body(0, false)?);
            }
            return Ok(());
        }
        while self.more_parts {
            self.advance()?;
        }
        Ok(())
    }

    /// The outer `Content-Type`
    pub fn outer_content_type(&self) -> &ContentTypeHeader {
        &self.outer_content_type
    }

    /// Replaces the outer `Content-Type`
    ///
    /// This doesn't change how the body is parsed
    pub fn set_outer_content_type(&mut self, content_type: ContentTypeHeader) {
        self.outer_content_type = content_type;
    }

    /// The multipart boundary, `None` in single part mode
    pub fn boundary(&self) -> Option<&str> {
        self.boundary.as_ref().map(|b| b.text.as_str())
    }

    /// Returns whether the body is parsed as multipart
    pub fn is_multipart(&self) -> bool {
        self.boundary.is_some()
    }

    /// Returns whether parts may remain in the source
    pub fn is_more_parts_possible(&self) -> bool {
        self.more_parts
    }

    /// The number of parts discovered so far
    pub fn num_parts_known(&self) -> usize {
        self.parts.len()
    }

    /// Limits the total number of bytes read from the source, 0 meaning unlimited
    ///
    /// This replaces the first part limit from [`Config::first_part_max_bytes`]
    pub fn set_body_length_limit(&mut self, limit: u64) -> Result<(), MimeError> {
        self.limit_customized = true;
        self.source.set_limit(limit)
    }

    /// The current limit on the bytes read from the source, 0 meaning unlimited
    pub fn body_length_limit(&self) -> u64 {
        self.source.limit()
    }

    /// Returns the number of source bytes consumed so far
    pub fn bytes_read(&self) -> u64 {
        self.source.position()
    }

    /// Releases the stash
    ///
    /// The source is not closed. Calling this more than once is harmless
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.stash.close();
        if self.failure.is_none() {
            self.failure = Some("the message body was closed".to_string());
        }
    }
}

impl<'a> MultipartBody<&'a [u8]> {
    /// Creates a message body over a byte slice using a [`MemoryStash`]
    pub fn from_bytes(
        bytes: &'a [u8],
        outer_content_type: ContentTypeHeader,
    ) -> Result<Self, MimeError> {
        Self::new(Box::new(MemoryStash::new()), outer_content_type, bytes)
    }
}

impl<R: Read> Drop for MultipartBody<R> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn related(boundary: &str) -> ContentTypeHeader {
        ContentTypeHeader::parse(&format!("multipart/related; boundary=\"{}\"", boundary)).unwrap()
    }

    #[test]
    fn test_preamble() -> Result<(), MimeError> {
        let data: &[u8] = b"This is a preamble\r\n--b\r\nContent-ID: <x>\r\n\r\nX\r\n--b--\r\n";
        let mut body = MultipartBody::from_bytes(data, related("b"))?;
        assert!(body.is_multipart());
        assert_eq!(body.num_parts_known(), 1);
        assert_eq!(body.first_part().content_id(true).as_deref(), Some("x"));
        Ok(())
    }

    #[test]
    fn test_preamble_limit() {
        let mut data = vec![b'p'; 200];
        data.extend_from_slice(b"\r\n--b\r\n\r\nX\r\n--b--\r\n");
        let config = Config {
            preamble_max_size: 100,
            ..Config::default()
        };
        let res = MultipartBody::with_config(
            Box::new(MemoryStash::new()),
            related("b"),
            data.as_slice(),
            &config,
        );
        assert!(matches!(
            res,
            Err(MimeError::LimitExceeded {
                what: "multipart preamble",
                ..
            })
        ));
    }

    #[test]
    fn test_no_initial_boundary() {
        let res = MultipartBody::from_bytes(b"no boundary in here", related("b"));
        assert!(matches!(res, Err(MimeError::Malformed(_))));
    }

    #[test]
    fn test_empty_multipart() -> Result<(), MimeError> {
        let data: &[u8] = b"\r\n--b--\r\n";
        assert!(matches!(
            MultipartBody::from_bytes(data, related("b")).err(),
            Some(MimeError::Malformed(_))
        ));

        let config = Config {
            allow_lax_empty_multipart: true,
            ..Config::default()
        };
        let mut body =
            MultipartBody::with_config(Box::new(MemoryStash::new()), related("b"), data, &config)?;
        assert!(!body.is_multipart());
        let mut content = Vec::new();
        body.first_part().body(false)?.read_to_end(&mut content)?;
        assert_eq!(content, b"\r\n");
        Ok(())
    }

    #[test]
    fn test_start_param() -> Result<(), MimeError> {
        let data: &[u8] = b"\r\n--b\r\nContent-ID: <root>\r\n\r\nX\r\n--b--\r\n";
        let ct = |start: &str| {
            ContentTypeHeader::parse(&format!(
                "multipart/related; boundary=b; start=\"{}\"",
                start
            ))
            .unwrap()
        };
        assert!(MultipartBody::from_bytes(data, ct("<root>")).is_ok());
        assert!(MultipartBody::from_bytes(data, ct("root")).is_err());
        assert!(MultipartBody::from_bytes(data, ct("")).is_err());
        let config = Config {
            allow_lax_start_param_match: true,
            ..Config::default()
        };
        assert!(
            MultipartBody::with_config(Box::new(MemoryStash::new()), ct("root"), data, &config)
                .is_ok()
        );
        Ok(())
    }

    #[test]
    fn test_first_part_limit() -> Result<(), MimeError> {
        let data: &[u8] = b"\r\n--b\r\n\r\n0123456789\r\n--b\r\n\r\n0123456789abcdef\r\n--b--\r\n";
        let config = Config {
            first_part_max_bytes: 8,
            ..Config::default()
        };
        let mut body =
            MultipartBody::with_config(Box::new(MemoryStash::new()), related("b"), data, &config)?;
        assert!(matches!(
            body.part(1).err(),
            Some(MimeError::LimitExceeded { .. })
        ));
        assert!(matches!(
            body.part(1).err(),
            Some(MimeError::PreviouslyFailed(_))
        ));

        // The limit only covers the first part
        let config = Config {
            first_part_max_bytes: 64,
            ..Config::default()
        };
        let mut body =
            MultipartBody::with_config(Box::new(MemoryStash::new()), related("b"), data, &config)?;
        assert_eq!(body.part(1)?.actual_content_length()?, 16);
        assert_eq!(body.body_length_limit(), 0);
        Ok(())
    }

    #[test]
    fn test_body_length_limit() -> Result<(), MimeError> {
        let data = [b'z'; 100];
        let mut body = MultipartBody::from_bytes(
            data.as_slice(),
            ContentTypeHeader::parse("application/octet-stream")?,
        )?;
        body.set_body_length_limit(50)?;
        assert_eq!(body.body_length_limit(), 50);
        assert!(body.read_and_stash_entire_message().is_err());
        Ok(())
    }

    #[test]
    fn test_close() -> Result<(), MimeError> {
        let data: &[u8] = b"\r\n--b\r\n\r\nX\r\n--b\r\n\r\nY\r\n--b--\r\n";
        let mut body = MultipartBody::from_bytes(data, related("b"))?;
        body.close();
        body.close();
        assert!(matches!(
            body.part(1).err(),
            Some(MimeError::PreviouslyFailed(_))
        ));
        Ok(())
    }
}
