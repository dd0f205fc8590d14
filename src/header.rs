//! MIME header parsers and serializers
use crate::content_type::{ContentTypeHeader, OCTET_STREAM_DEFAULT};
use crate::error::MimeError;
use crate::pushback::PushbackReader;
use std::io::Read;
#[allow(unused_imports)]
use tracing::{debug, error, info, instrument, warn};

const CONTENT_TYPE: &str = "Content-Type";
const CONTENT_LENGTH: &str = "Content-Length";
const CONTENT_ID: &str = "Content-ID";

#[derive(Debug, Default)]
/// A header currently being parsed
struct TmpHeader {
    name: String,
    value: Vec<u8>,
    raw: Vec<u8>,
}

impl TmpHeader {
    /// Creates a temporary header from its first line
    fn begin(line: &[u8]) -> Result<Self, MimeError> {
        let pos = line.iter().position(|v| *v == b':').ok_or_else(|| {
            MimeError::Malformed(format!(
                "invalid header line \"{}\"",
                String::from_utf8_lossy(super::without_eol(line))
            ))
        })?;
        let (name, value) = line.split_at(pos);
        let name = super::trim_wsp_end(name);
        if name.is_empty() || !name.iter().all(|c| (33..=126).contains(c)) {
            return Err(MimeError::Malformed(format!(
                "invalid header name \"{}\"",
                String::from_utf8_lossy(name)
            )));
        }
        let mut ret = Self {
            name: String::from_utf8_lossy(name).into_owned(),
            value: Vec::new(),
            raw: line.to_vec(),
        };
        ret.update_value(super::without_eol(&value[1..]));
        Ok(ret)
    }

    /// Updates the header with the followup line (*unfolding*)
    fn unfold(&mut self, line: &[u8]) {
        self.raw.extend_from_slice(line);
        self.update_value(super::without_eol(line));
    }

    fn update_value(&mut self, value: &[u8]) {
        let newvalue = super::trim_wsp(value);
        if !newvalue.is_empty() {
            if !self.value.is_empty() {
                self.value.push(b' ');
            }
            self.value.extend_from_slice(newvalue);
        }
    }
}

#[derive(Debug, Clone)]
/// A single MIME header
pub struct MimeHeader {
    name: String,
    value: String,
    raw: Vec<u8>,
}

impl MimeHeader {
    /// Creates a header which serializes as `name: value` + CRLF
    pub fn new(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
            raw: format!("{}: {}\r\n", name, value).into_bytes(),
        }
    }

    /// The header name as it appeared on the wire
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The unfolded header value with whitespace trimmed
    pub fn value(&self) -> &str {
        &self.value
    }

    /// The header value up to the first `;`
    pub fn main_value(&self) -> &str {
        self.value
            .split_once(';')
            .map(|(v, _)| v)
            .unwrap_or(&self.value)
            .trim()
    }

    /// The exact bytes of the header, folding and line terminators included
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

impl From<TmpHeader> for MimeHeader {
    fn from(tmp: TmpHeader) -> Self {
        Self {
            name: tmp.name,
            value: String::from_utf8_lossy(&tmp.value).into_owned(),
            raw: tmp.raw,
        }
    }
}

#[derive(Debug, Clone, Default)]
/// Post-parse replacements applied to a part's headers
///
/// The parsed headers are never mutated; accessors and the serializer consult
/// these values first
pub struct HeaderOverrides {
    /// Replacement `Content-Type`
    pub content_type: Option<ContentTypeHeader>,
    /// Confirmed or replacement `Content-Length`
    pub content_length: Option<u64>,
}

#[derive(Debug, Clone)]
/// The headers of a MIME part
///
/// At most one header per name is allowed
pub struct MimeHeaders {
    headers: Vec<MimeHeader>,
    content_type: Option<ContentTypeHeader>,
    content_length: Option<u64>,
    terminator: Vec<u8>,
}

impl Default for MimeHeaders {
    fn default() -> Self {
        Self {
            headers: Vec::new(),
            content_type: None,
            content_length: None,
            terminator: crate::CRLF.to_vec(),
        }
    }
}

impl MimeHeaders {
    /// Creates a header set holding only the provided `Content-Type`
    pub fn with_content_type(content_type: &ContentTypeHeader) -> Self {
        let mut ret = Self::default();
        ret.headers
            .push(MimeHeader::new(CONTENT_TYPE, &content_type.to_string()));
        ret.content_type = Some(content_type.clone());
        ret
    }

    /// Reads a header block up to and including the empty line
    ///
    /// On success the source is positioned at the first byte of the body
    #[instrument(level = "debug", skip_all)]
    pub fn parse<R: Read>(src: &mut PushbackReader<R>, max_size: u64) -> Result<Self, MimeError> {
        let mut ret = Self::default();
        let mut current: Option<TmpHeader> = None;
        let mut total = 0u64;
        loop {
            let remaining = usize::try_from(max_size - total).unwrap_or(usize::MAX);
            let line = src.read_line(remaining).map_err(|e| match e {
                MimeError::LimitExceeded {
                    what: "header line",
                    ..
                } => MimeError::LimitExceeded {
                    what: "MIME part headers",
                    limit: max_size,
                },
                e => e,
            })?;
            if !line.ends_with(b"\n") {
                return Err(MimeError::Malformed(
                    "unterminated MIME header block".to_string(),
                ));
            }
            total += line.len() as u64;
            let content = super::without_eol(&line);
            if content.is_empty() {
                if let Some(hdr) = current.take() {
                    ret.push(hdr.into())?;
                }
                ret.terminator = line;
                break;
            }
            if super::WSP.contains(&content[0]) {
                match current.as_mut() {
                    Some(hdr) => {
                        hdr.unfold(&line);
                        continue;
                    }
                    None => {
                        return Err(MimeError::Malformed(
                            "header continuation line without a header".to_string(),
                        ));
                    }
                }
            }
            if let Some(hdr) = current.take() {
                ret.push(hdr.into())?;
            }
            current = Some(TmpHeader::begin(&line)?);
        }
        debug!("Headers complete: {} entries", ret.headers.len());
        Ok(ret)
    }

    fn push(&mut self, hdr: MimeHeader) -> Result<(), MimeError> {
        if self.get(&hdr.name).is_some() {
            return Err(MimeError::Malformed(format!(
                "duplicate header \"{}\"",
                hdr.name
            )));
        }
        if hdr.is(CONTENT_TYPE) {
            self.content_type = Some(ContentTypeHeader::parse(&hdr.value)?);
        } else if hdr.is(CONTENT_LENGTH) {
            let value = hdr.value.trim();
            if value.is_empty() || !value.bytes().all(|c| c.is_ascii_digit()) {
                return Err(MimeError::Malformed(format!(
                    "invalid Content-Length \"{}\"",
                    value
                )));
            }
            self.content_length = Some(value.parse().map_err(|_| {
                MimeError::Malformed(format!("Content-Length out of range \"{}\"", value))
            })?);
        }
        debug!("Header complete: {:?}", hdr);
        self.headers.push(hdr);
        Ok(())
    }

    /// Retrieves the header matching `name` (case insensitive), if any
    pub fn get(&self, name: &str) -> Option<&MimeHeader> {
        self.headers.iter().find(|hdr| hdr.is(name))
    }

    /// Iterates the headers in wire order
    pub fn iter(&self) -> impl Iterator<Item = &MimeHeader> {
        self.headers.iter()
    }

    /// Returns the number of headers
    pub fn len(&self) -> usize {
        self.headers.len()
    }

    /// Returns whether the header block was empty
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Returns the `Content-Type` or `application/octet-stream` if absent
    pub fn content_type(&self) -> &ContentTypeHeader {
        self.content_type.as_ref().unwrap_or(&OCTET_STREAM_DEFAULT)
    }

    /// Returns the declared `Content-Length`, if any
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Returns the `Content-ID`, optionally without the enclosing angle brackets
    ///
    /// An empty value is reported as absent
    pub fn content_id(&self, strip_angle_brackets: bool) -> Option<String> {
        let mut cid = self.get(CONTENT_ID)?.value.trim();
        if strip_angle_brackets {
            cid = cid.strip_prefix('<').unwrap_or(cid);
            cid = cid.strip_suffix('>').unwrap_or(cid);
        }
        let cid = cid.trim();
        if cid.is_empty() {
            None
        } else {
            Some(cid.to_string())
        }
    }

    /// Serializes the header block (empty line included), applying the overrides
    ///
    /// Headers which are not overridden are reproduced byte for byte
    pub fn to_bytes(&self, overrides: &HeaderOverrides) -> Vec<u8> {
        let mut ret = Vec::new();
        let mut wrote_type = false;
        let mut wrote_length = false;
        for hdr in self.headers.iter() {
            if hdr.is(CONTENT_TYPE) {
                if let Some(ct) = &overrides.content_type {
                    ret.extend_from_slice(format!("{}: {}\r\n", hdr.name, ct).as_bytes());
                    wrote_type = true;
                    continue;
                }
            } else if hdr.is(CONTENT_LENGTH) {
                if let Some(len) = overrides.content_length {
                    wrote_length = true;
                    if Some(len) != self.content_length {
                        ret.extend_from_slice(format!("{}: {}\r\n", hdr.name, len).as_bytes());
                        continue;
                    }
                }
            }
            ret.extend_from_slice(&hdr.raw);
        }
        if let (false, Some(ct)) = (wrote_type, &overrides.content_type) {
            ret.extend_from_slice(format!("{}: {}\r\n", CONTENT_TYPE, ct).as_bytes());
        }
        if let (false, Some(len)) = (wrote_length, overrides.content_length) {
            ret.extend_from_slice(format!("{}: {}\r\n", CONTENT_LENGTH, len).as_bytes());
        }
        ret.extend_from_slice(&self.terminator);
        ret
    }

    /// The length of [`to_bytes`](Self::to_bytes)
    pub fn serialized_len(&self, overrides: &HeaderOverrides) -> u64 {
        self.to_bytes(overrides).len() as u64
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(data: &[u8]) -> Result<MimeHeaders, MimeError> {
        MimeHeaders::parse(&mut PushbackReader::new(data, 16), 32 * 1024)
    }

    #[test]
    fn test_parse_block() -> Result<(), MimeError> {
        let data: &[u8] = b"Content-Type: text/xml;\r\n\tcharset=utf-8\r\nContent-ID:  <root@part> \r\nX-Custom:a\r\n\r\nBODY";
        let mut src = PushbackReader::new(data, 16);
        let hdrs = MimeHeaders::parse(&mut src, 1024)?;
        assert_eq!(hdrs.len(), 3);
        assert!(hdrs.content_type().is_xml());
        assert_eq!(hdrs.content_type().encoding(), "utf-8");
        assert_eq!(hdrs.get("content-type").unwrap().value(), "text/xml; charset=utf-8");
        assert_eq!(hdrs.get("content-type").unwrap().main_value(), "text/xml");
        assert_eq!(hdrs.content_id(false).as_deref(), Some("<root@part>"));
        assert_eq!(hdrs.content_id(true).as_deref(), Some("root@part"));
        assert_eq!(hdrs.get("x-custom").unwrap().value(), "a");
        assert_eq!(hdrs.content_length(), None);
        let mut body = Vec::new();
        src.read_to_end(&mut body)?;
        assert_eq!(body, b"BODY");

        // Unmodified headers reproduce the wire bytes
        let consumed = data.len() - 4;
        assert_eq!(hdrs.to_bytes(&HeaderOverrides::default()), &data[..consumed]);
        assert_eq!(hdrs.serialized_len(&HeaderOverrides::default()), consumed as u64);
        Ok(())
    }

    #[test]
    fn test_defaults() -> Result<(), MimeError> {
        let hdrs = parse(b"\r\n")?;
        assert!(hdrs.is_empty());
        assert_eq!(hdrs.content_type().mime_type(), "application/octet-stream");
        assert_eq!(hdrs.content_id(true), None);
        let hdrs = parse(b"Content-ID: <>\r\n\r\n")?;
        assert_eq!(hdrs.content_id(true), None);
        assert_eq!(hdrs.content_id(false).as_deref(), Some("<>"));
        let hdrs = parse(b"Content-ID:    \r\n\r\n")?;
        assert_eq!(hdrs.content_id(false), None);
        let hdrs = parse(b"content-length: 42\n\n")?;
        assert_eq!(hdrs.content_length(), Some(42));
        Ok(())
    }

    #[test]
    fn test_malformed() {
        for bad in [
            b"Content-Type: text/xml\r\nContent-type: text/plain\r\n\r\n".as_slice(),
            b"X-A: 1\r\nx-a: 2\r\n\r\n",
            b"Content-Length: -1\r\n\r\n",
            b"Content-Length: 12a\r\n\r\n",
            b"Content-Type: text\r\n\r\n",
            b"no colon here\r\n\r\n",
            b" folded: first\r\n\r\n",
            b"Bad Name: x\r\n\r\n",
            b"Content-Type: text/xml\r\n",
            b"Content-Type: text/xml\r\n\r",
            b"",
        ] {
            assert!(
                matches!(parse(bad), Err(MimeError::Malformed(_))),
                "{:?} was accepted",
                String::from_utf8_lossy(bad)
            );
        }
        let big = format!("X-Big: {}\r\n\r\n", "a".repeat(200));
        assert!(matches!(
            MimeHeaders::parse(&mut PushbackReader::new(big.as_bytes(), 16), 100),
            Err(MimeError::LimitExceeded {
                what: "MIME part headers",
                limit: 100
            })
        ));
    }

    #[test]
    fn test_source_limit_passes_through() -> Result<(), MimeError> {
        let data: &[u8] = b"Content-Type: text/plain\r\nContent-ID: <x>\r\n\r\n";
        let mut src = PushbackReader::new(data, 16);
        src.set_limit(10)?;
        assert!(matches!(
            MimeHeaders::parse(&mut src, 1024),
            Err(MimeError::LimitExceeded {
                what: "message body",
                limit: 10
            })
        ));
        Ok(())
    }

    #[test]
    fn test_overrides() -> Result<(), MimeError> {
        let hdrs = parse(b"Content-Type: text/plain\r\nContent-Length:  3\r\n\r\n")?;
        let mut ov = HeaderOverrides {
            content_type: None,
            content_length: Some(3),
        };
        // Same length: bytes untouched
        assert_eq!(
            hdrs.to_bytes(&ov),
            b"Content-Type: text/plain\r\nContent-Length:  3\r\n\r\n"
        );
        ov.content_length = Some(10);
        ov.content_type = Some(ContentTypeHeader::parse("text/xml; charset=utf-8")?);
        assert_eq!(
            hdrs.to_bytes(&ov),
            b"Content-Type: text/xml; charset=utf-8\r\nContent-Length: 10\r\n\r\n"
        );

        let hdrs = parse(b"X-A: b\r\n\r\n")?;
        assert_eq!(
            hdrs.to_bytes(&ov),
            b"X-A: b\r\nContent-Type: text/xml; charset=utf-8\r\nContent-Length: 10\r\n\r\n"
        );

        let hdrs = MimeHeaders::with_content_type(&ContentTypeHeader::parse("application/json")?);
        assert_eq!(
            hdrs.to_bytes(&HeaderOverrides::default()),
            b"Content-Type: application/json\r\n\r\n"
        );
        Ok(())
    }
}
