//! Error types
use thiserror::Error;

#[derive(Error, Debug)]
/// Errors reported while parsing, stashing or reading a message body
pub enum MimeError {
    /// Bad header syntax, duplicate header, invalid or missing boundary
    #[error("malformed MIME data: {0}")]
    Malformed(String),

    /// The requested part does not exist or its body is gone
    #[error("{message}")]
    NoSuchPart {
        /// Human readable description
        message: String,
        /// The ordinal of the part, if known
        ordinal: Option<usize>,
        /// The Content-ID that was looked up, if any
        content_id: Option<String>,
    },

    /// The source ran dry before a multipart boundary was found
    #[error("multipart part is not terminated by a boundary")]
    UnterminatedPart,

    /// The declared `Content-Length` disagrees with the actual body size
    #[error(
        "MIME part #{ordinal} declared in Content-Length header that size was {declared} bytes, but actual size was {actual} bytes"
    )]
    ContentLengthMismatch {
        /// The part ordinal
        ordinal: usize,
        /// The value of the `Content-Length` header
        declared: u64,
        /// The number of bytes actually stashed
        actual: u64,
    },

    /// A configured size ceiling was crossed
    #[error("{what} exceeds the limit of {limit} bytes")]
    LimitExceeded {
        /// What was being read
        what: &'static str,
        /// The limit in bytes
        limit: u64,
    },

    /// The message was poisoned by an earlier fatal error
    #[error("message processing previously failed: {0}")]
    PreviouslyFailed(String),

    /// Wrapper for [`std::io::Error`](https://doc.rust-lang.org/std/io/struct.Error.html)
    #[error("IO error: {0}")]
    Io(std::io::Error),
}

impl MimeError {
    /// Builds a [`MimeError::NoSuchPart`] for a part ordinal
    pub fn no_such_ordinal(ordinal: usize, message: impl Into<String>) -> Self {
        Self::NoSuchPart {
            message: message.into(),
            ordinal: Some(ordinal),
            content_id: None,
        }
    }

    /// Builds a [`MimeError::NoSuchPart`] for a Content-ID lookup
    pub fn no_such_cid(content_id: &str) -> Self {
        Self::NoSuchPart {
            message: format!("No part was found with the Content-ID: {}", content_id),
            ordinal: None,
            content_id: Some(content_id.to_string()),
        }
    }

    /// Returns true for the "part not found / body already consumed" kind
    pub fn is_no_such_part(&self) -> bool {
        matches!(self, Self::NoSuchPart { .. })
    }
}

impl From<std::io::Error> for MimeError {
    fn from(err: std::io::Error) -> Self {
        // Typed errors travel through Read impls wrapped in io::Error
        if !err.get_ref().is_some_and(|inner| inner.is::<MimeError>()) {
            return Self::Io(err);
        }
        match err.into_inner().map(|inner| inner.downcast::<MimeError>()) {
            Some(Ok(inner)) => *inner,
            Some(Err(other)) => Self::Io(std::io::Error::other(other)),
            None => Self::Io(std::io::Error::other("unknown I/O error")),
        }
    }
}

impl From<MimeError> for std::io::Error {
    fn from(err: MimeError) -> Self {
        let kind = match err {
            MimeError::Io(e) => return e,
            MimeError::UnterminatedPart => std::io::ErrorKind::UnexpectedEof,
            MimeError::NoSuchPart { .. } => std::io::ErrorKind::NotFound,
            _ => std::io::ErrorKind::InvalidData,
        };
        std::io::Error::new(kind, err)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn io_roundtrip_keeps_kind() {
        let io: std::io::Error = MimeError::ContentLengthMismatch {
            ordinal: 3,
            declared: 5,
            actual: 6,
        }
        .into();
        assert_eq!(io.kind(), std::io::ErrorKind::InvalidData);
        match MimeError::from(io) {
            MimeError::ContentLengthMismatch {
                ordinal,
                declared,
                actual,
            } => assert_eq!((ordinal, declared, actual), (3, 5, 6)),
            e => panic!("unexpected error {e:?}"),
        }

        let io: std::io::Error = MimeError::UnterminatedPart.into();
        assert_eq!(io.kind(), std::io::ErrorKind::UnexpectedEof);
        assert!(matches!(MimeError::from(io), MimeError::UnterminatedPart));
    }

    #[test]
    fn plain_io_stays_io() {
        let err = MimeError::from(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "gone",
        ));
        match err {
            MimeError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::BrokenPipe),
            e => panic!("unexpected error {e:?}"),
        }
        let err = MimeError::from(std::io::Error::from(std::io::ErrorKind::Other));
        assert!(matches!(err, MimeError::Io(_)));
    }
}
