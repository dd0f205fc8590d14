//! The `Content-Type` header model
use crate::error::MimeError;
use lazy_static::lazy_static;
use regex::Regex;
use std::sync::OnceLock;

/// Whether a request for `text/enriched` matches an actual `text/plain`
///
/// Historical interoperability shim applied by [`ContentTypeHeader::matches`];
/// use [`ContentTypeHeader::matches_with`] to opt out
pub const LEGACY_ENRICHED_MATCHES_PLAIN: bool = true;

/// The charset reported when none is declared
const DEFAULT_ENCODING: &str = "UTF-8";

lazy_static! {
    /// A MIME token (RFC 2045)
    static ref TOKEN: Regex = Regex::new(r"^[!#$%&'*+\-.^_`{|}~0-9A-Za-z]+").unwrap();

    /// `application/octet-stream`, the type of bodies of unknown nature
    pub static ref OCTET_STREAM_DEFAULT: ContentTypeHeader =
        ContentTypeHeader::well_known("application", "octet-stream", None);
    /// `text/plain; charset=UTF-8`
    pub static ref TEXT_DEFAULT: ContentTypeHeader =
        ContentTypeHeader::well_known("text", "plain", Some("UTF-8"));
    /// `text/xml; charset=utf-8`
    pub static ref XML_DEFAULT: ContentTypeHeader =
        ContentTypeHeader::well_known("text", "xml", Some("utf-8"));
    /// `application/soap+xml; charset=utf-8`
    pub static ref SOAP_1_2_DEFAULT: ContentTypeHeader =
        ContentTypeHeader::well_known("application", "soap+xml", Some("utf-8"));
    /// `application/json; charset=utf-8`
    pub static ref APPLICATION_JSON: ContentTypeHeader =
        ContentTypeHeader::well_known("application", "json", Some("utf-8"));
}

/// Checks if the whole string is a MIME token
fn is_token(s: &str) -> bool {
    TOKEN.find(s).is_some_and(|m| m.end() == s.len())
}

/// A minimal scanner over a header value
struct ValueLexer<'a> {
    s: &'a str,
    pos: usize,
}

impl<'a> ValueLexer<'a> {
    fn new(s: &'a str) -> Self {
        Self { s, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.s[self.pos..]
    }

    fn skip_wsp(&mut self) {
        let rest = self.rest();
        self.pos += rest.len() - rest.trim_start().len();
    }

    fn at_end(&mut self) -> bool {
        self.skip_wsp();
        self.pos >= self.s.len()
    }

    /// Consumes `c` if it's the next non whitespace character
    fn eat(&mut self, c: char) -> bool {
        self.skip_wsp();
        if self.rest().starts_with(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    fn token(&mut self, what: &str) -> Result<&'a str, MimeError> {
        self.skip_wsp();
        match TOKEN.find(self.rest()) {
            Some(m) => {
                let tok = &self.rest()[..m.end()];
                self.pos += m.end();
                Ok(tok)
            }
            None => Err(MimeError::Malformed(format!(
                "expected {} at offset {} in \"{}\"",
                what, self.pos, self.s
            ))),
        }
    }

    fn quoted(&mut self) -> Result<String, MimeError> {
        let mut val = String::new();
        let mut escaped = false;
        let mut chars = self.rest().char_indices().skip(1);
        for (idx, c) in chars.by_ref() {
            if escaped {
                val.push(c);
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                self.pos += idx + 1;
                return Ok(val);
            } else {
                val.push(c);
            }
        }
        Err(MimeError::Malformed(format!(
            "unterminated quoted-string in \"{}\"",
            self.s
        )))
    }

    fn param_value(&mut self) -> Result<String, MimeError> {
        self.skip_wsp();
        if self.rest().starts_with('"') {
            self.quoted()
        } else {
            Ok(self.token("parameter value")?.to_string())
        }
    }
}

#[derive(Debug, Clone)]
/// A parsed `Content-Type` header value
pub struct ContentTypeHeader {
    /// The lowercased type
    main_type: String,
    /// The lowercased subtype
    subtype: String,
    /// Parameters with lowercased names, in declaration order
    params: Vec<(String, String)>,
    encoding: OnceLock<String>,
}

impl PartialEq for ContentTypeHeader {
    fn eq(&self, other: &Self) -> bool {
        self.main_type == other.main_type
            && self.subtype == other.subtype
            && self.params == other.params
    }
}

impl Eq for ContentTypeHeader {}

impl std::fmt::Display for ContentTypeHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.main_type, self.subtype)?;
        for (k, v) in self.params.iter() {
            if is_token(v) {
                write!(f, "; {}={}", k, v)?;
            } else {
                write!(f, "; {}=\"{}\"", k, v.replace('\\', "\\\\").replace('"', "\\\""))?;
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for ContentTypeHeader {
    type Err = MimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl ContentTypeHeader {
    fn well_known(main_type: &str, subtype: &str, charset: Option<&str>) -> Self {
        Self {
            main_type: main_type.to_string(),
            subtype: subtype.to_string(),
            params: charset
                .map(|cs| vec![("charset".to_string(), cs.to_string())])
                .unwrap_or_default(),
            encoding: OnceLock::new(),
        }
    }

    /// Parses a `Content-Type` value: `type "/" subtype *( ";" attribute "=" value )`
    ///
    /// Values can be tokens or quoted-strings and a trailing semicolon is tolerated.
    /// Parameter names are case insensitive and must be unique
    pub fn parse(value: &str) -> Result<Self, MimeError> {
        let mut lex = ValueLexer::new(value);
        let main_type = lex.token("type")?.to_ascii_lowercase();
        if !lex.eat('/') {
            return Err(MimeError::Malformed(format!(
                "missing subtype in Content-Type \"{}\"",
                value
            )));
        }
        let subtype = lex.token("subtype")?.to_ascii_lowercase();
        let mut params: Vec<(String, String)> = Vec::new();
        while !lex.at_end() {
            if !lex.eat(';') {
                return Err(MimeError::Malformed(format!(
                    "unexpected data at offset {} in Content-Type \"{}\"",
                    lex.pos, value
                )));
            }
            if lex.at_end() {
                // Trailing semicolon
                break;
            }
            let name = lex.token("parameter name")?.to_ascii_lowercase();
            if !lex.eat('=') {
                return Err(MimeError::Malformed(format!(
                    "parameter \"{}\" has no value in Content-Type \"{}\"",
                    name, value
                )));
            }
            let val = lex.param_value()?;
            if params.iter().any(|(k, _)| *k == name) {
                return Err(MimeError::Malformed(format!(
                    "duplicate parameter \"{}\" in Content-Type \"{}\"",
                    name, value
                )));
            }
            params.push((name, val));
        }
        let ret = Self {
            main_type,
            subtype,
            params,
            encoding: OnceLock::new(),
        };
        ret.validate()?;
        Ok(ret)
    }

    /// Creates a header from its components, validating the result
    pub fn new(main_type: &str, subtype: &str, params: &[(&str, &str)]) -> Result<Self, MimeError> {
        if !is_token(main_type) || !is_token(subtype) {
            return Err(MimeError::Malformed(format!(
                "invalid media type {}/{}",
                main_type, subtype
            )));
        }
        let mut ret = Self::well_known(
            &main_type.to_ascii_lowercase(),
            &subtype.to_ascii_lowercase(),
            None,
        );
        for (k, v) in params {
            let k = k.to_ascii_lowercase();
            if !is_token(&k) || ret.params.iter().any(|(name, _)| *name == k) {
                return Err(MimeError::Malformed(format!("invalid parameter name {}", k)));
            }
            ret.params.push((k, v.to_string()));
        }
        ret.validate()?;
        Ok(ret)
    }

    /// Checks the multipart invariants
    ///
    /// A multipart type needs a non empty `boundary` made of printable US-ASCII
    /// characters (or spaces) and short enough to be scanned
    pub fn validate(&self) -> Result<(), MimeError> {
        if !self.is_multipart() {
            return Ok(());
        }
        let boundary = self.param("boundary").ok_or_else(|| {
            MimeError::Malformed(format!("{} has no boundary parameter", self.mime_type()))
        })?;
        if boundary.is_empty() {
            return Err(MimeError::Malformed("empty multipart boundary".to_string()));
        }
        if !boundary.bytes().all(|c| c == b' ' || (33..=126).contains(&c)) {
            return Err(MimeError::Malformed(
                "multipart boundary contains illegal characters".to_string(),
            ));
        }
        if boundary.len() + 2 > crate::BLOCK_SIZE {
            return Err(MimeError::Malformed(format!(
                "multipart boundary is longer than {} bytes",
                crate::BLOCK_SIZE - 2
            )));
        }
        Ok(())
    }

    /// Returns the lowercased type
    pub fn main_type(&self) -> &str {
        &self.main_type
    }

    /// Returns the lowercased subtype
    pub fn subtype(&self) -> &str {
        &self.subtype
    }

    /// Returns `type/subtype`
    pub fn mime_type(&self) -> String {
        format!("{}/{}", self.main_type, self.subtype)
    }

    /// Returns the value of the named parameter (case insensitive)
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns all the parameters in declaration order
    pub fn params(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns whether any parameter is present
    pub fn has_params(&self) -> bool {
        !self.params.is_empty()
    }

    /// Returns the multipart boundary, if this is a multipart type
    pub fn multipart_boundary(&self) -> Option<&str> {
        if self.is_multipart() {
            self.param("boundary")
        } else {
            None
        }
    }

    /// Returns the declared charset or the default (`UTF-8`)
    ///
    /// The value is resolved on first use and cached
    pub fn encoding(&self) -> &str {
        self.encoding.get_or_init(|| {
            self.param("charset")
                .map(str::trim)
                .filter(|cs| !cs.is_empty())
                .unwrap_or(DEFAULT_ENCODING)
                .to_string()
        })
    }

    /// Checks for `text/*`
    pub fn is_text(&self) -> bool {
        self.main_type == "text"
    }

    /// Checks for `application/*`
    pub fn is_application(&self) -> bool {
        self.main_type == "application"
    }

    /// Checks for `multipart/*`
    pub fn is_multipart(&self) -> bool {
        self.main_type == "multipart"
    }

    /// Checks for `text/xml`, `application/xml` and `application/*+xml`
    pub fn is_xml(&self) -> bool {
        match self.main_type.as_str() {
            "text" => self.subtype == "xml",
            "application" => self.subtype == "xml" || self.subtype.ends_with("+xml"),
            _ => false,
        }
    }

    /// Checks for `text/html` and `application/xhtml+xml`
    pub fn is_html(&self) -> bool {
        (self.main_type == "text" && self.subtype == "html")
            || (self.main_type == "application" && self.subtype == "xhtml+xml")
    }

    /// Wildcard aware comparison (`*` or `None` mean *any*)
    ///
    /// Applies the [`LEGACY_ENRICHED_MATCHES_PLAIN`] quirk
    pub fn matches(&self, main_type: Option<&str>, subtype: Option<&str>) -> bool {
        self.matches_with(main_type, subtype, LEGACY_ENRICHED_MATCHES_PLAIN)
    }

    /// Same as [`matches`](Self::matches) with explicit control over the
    /// `text/enriched` request matching an actual `text/plain`
    pub fn matches_with(
        &self,
        main_type: Option<&str>,
        subtype: Option<&str>,
        legacy_enriched_matches_plain: bool,
    ) -> bool {
        let any = |pat: Option<&str>| pat.is_none_or(|p| p == "*");
        if !any(main_type) && !main_type.is_some_and(|t| t.eq_ignore_ascii_case(&self.main_type)) {
            return false;
        }
        if any(subtype) || subtype.is_some_and(|s| s.eq_ignore_ascii_case(&self.subtype)) {
            return true;
        }
        legacy_enriched_matches_plain
            && main_type.is_some_and(|t| t.eq_ignore_ascii_case("text"))
            && subtype.is_some_and(|s| s.eq_ignore_ascii_case("enriched"))
            && self.main_type == "text"
            && self.subtype == "plain"
    }
}
