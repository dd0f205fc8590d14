//! Multipart message body engine
//!
//! Exposes an HTTP(S) message body, either a single opaque payload or a MIME
//! `multipart/related` package, as a sequence of addressable parts while
//! controlling how much of the payload is ever held in memory
//!
//! # Design #
//!
//! The body source is pull-only and forward-only. Parts are discovered lazily
//! and in wire order by a boundary scanner; whenever a part has to be skipped
//! (because a later part was requested, or the caller asked for a re-readable
//! body) its raw bytes are moved into a [`StashManager`]. Three stash
//! strategies are provided:
//! - [`MemoryStash`]: growable in-memory buffers
//! - [`FileStash`]: one scratch file per part
//! - [`HybridStash`]: memory up to a byte limit, disk afterwards
//!
//! The message can be re-serialized byte for byte (boundaries, headers and
//! bodies) for forwarding via [`MultipartBody::entire_message_body`]
//!
//! # Examples #
//! ```
//! use mimebody_rs::{ContentTypeHeader, MemoryStash, MultipartBody};
//!
//! let ctype = ContentTypeHeader::parse("multipart/related; boundary=sep").unwrap();
//! let raw: &[u8] = b"\r\n--sep\r\nContent-ID: <root>\r\n\r\n<soap/>\r\n--sep\r\n\r\nbin\r\n--sep--\r\n";
//! let mut body = MultipartBody::new(Box::new(MemoryStash::new()), ctype, raw).unwrap();
//! let mut attachment = Vec::new();
//! std::io::copy(&mut body.part(1).unwrap().body(false).unwrap(), &mut attachment).unwrap();
//! assert_eq!(attachment, b"bin");
//! assert_eq!(body.part_by_content_id("root").unwrap().ordinal(), 0);
//! ```

#![warn(missing_docs)]
pub mod body;
pub mod boundary;
pub mod config;
pub mod content_type;
mod entire;
pub mod error;
pub mod header;
pub mod part;
pub mod pushback;
pub mod stash;

pub use body::MultipartBody;
pub use config::Config;
pub use content_type::ContentTypeHeader;
pub use entire::EntireBody;
pub use error::MimeError;
pub use header::{MimeHeader, MimeHeaders};
pub use part::{PartBody, PartInfo, PartIterator};
pub use stash::{FileStash, HybridStash, MemoryStash, StashManager};

const CR: u8 = b'\r';
const LF: u8 = b'\n';
const CRLF: &[u8] = &[CR, LF];
const WSP: &[u8] = &[b' ', b'\t'];

/// The largest multipart boundary (including the leading dashes) that can be scanned
pub const BLOCK_SIZE: usize = 4096;

#[inline]
/// Removes a single CR, LF or CRLF from the end of the slice
fn without_eol(line: &[u8]) -> &[u8] {
    if line.ends_with(CRLF) {
        &line[0..(line.len() - 2)]
    } else if line.last().is_some_and(|c| CRLF.contains(c)) {
        &line[0..(line.len() - 1)]
    } else {
        line
    }
}

#[inline]
/// Removes whitespace from the beginning of the slice
fn trim_wsp_start(bytes: &[u8]) -> &[u8] {
    let mut ret = bytes;
    while let Some(v) = ret.first() {
        if WSP.contains(v) {
            ret = &ret[1..];
            continue;
        }
        break;
    }
    ret
}

#[inline]
/// Removes whitespace from the end of the slice
fn trim_wsp_end(bytes: &[u8]) -> &[u8] {
    let mut ret = bytes;
    while let Some(v) = ret.last() {
        if WSP.contains(v) {
            ret = &ret[0..(ret.len() - 1)];
            continue;
        }
        break;
    }
    ret
}

#[inline]
/// Removes whitespace from both sides of the slice
fn trim_wsp(bytes: &[u8]) -> &[u8] {
    trim_wsp_end(trim_wsp_start(bytes))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_trimming() {
        assert_eq!(without_eol(b"abc\r\n"), b"abc");
        assert_eq!(without_eol(b"abc\n"), b"abc");
        assert_eq!(without_eol(b"abc\r"), b"abc");
        assert_eq!(without_eol(b"abc"), b"abc");
        assert_eq!(without_eol(b""), b"");
        assert_eq!(trim_wsp(b" \t abc \t"), b"abc");
        assert_eq!(trim_wsp(b" \t "), b"");
        assert_eq!(trim_wsp_start(b"  a b "), b"a b ");
        assert_eq!(trim_wsp_end(b"  a b "), b"  a b");
    }
}
