//! Whole message reconstruction
use crate::part::PartBody;
use crate::pushback::PushbackReader;
use std::collections::VecDeque;
use std::io::{Cursor, Read};

enum Segment<'a, R: Read> {
    Bytes(Cursor<Vec<u8>>),
    Stashed(Box<dyn Read>),
    Part(PartBody<'a, R>),
    Source(&'a mut PushbackReader<R>),
}

impl<R: Read> Read for Segment<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, std::io::Error> {
        match self {
            Self::Bytes(r) => r.read(buf),
            Self::Stashed(r) => r.read(buf),
            Self::Part(r) => r.read(buf),
            Self::Source(r) => r.read(buf),
        }
    }
}

/// The wire image of a whole message body
///
/// Obtained from [`MultipartBody::entire_message_body`](crate::MultipartBody::entire_message_body):
/// delimiters, part headers and bodies are chained in order
pub struct EntireBody<'a, R: Read> {
    segments: VecDeque<Segment<'a, R>>,
}

impl<'a, R: Read> EntireBody<'a, R> {
    pub(crate) fn new() -> Self {
        Self {
            segments: VecDeque::new(),
        }
    }

    /// The body of a single part message
    pub(crate) fn single(body: PartBody<'a, R>) -> Self {
        let mut ret = Self::new();
        ret.segments.push_back(Segment::Part(body));
        ret
    }

    pub(crate) fn push_bytes(&mut self, bytes: Vec<u8>) {
        if !bytes.is_empty() {
            self.segments.push_back(Segment::Bytes(Cursor::new(bytes)));
        }
    }

    pub(crate) fn push_reader(&mut self, reader: Box<dyn Read>) {
        self.segments.push_back(Segment::Stashed(reader));
    }

    pub(crate) fn push_source(&mut self, source: &'a mut PushbackReader<R>) {
        self.segments.push_back(Segment::Source(source));
    }
}

impl<R: Read> Read for EntireBody<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, std::io::Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        while let Some(segment) = self.segments.front_mut() {
            let n = segment.read(buf)?;
            if n > 0 {
                return Ok(n);
            }
            self.segments.pop_front();
        }
        Ok(0)
    }
}
