#![allow(dead_code)]
use mimebody_rs::ContentTypeHeader;
use std::io::Read;
use tracing_subscriber::prelude::*;

/// A SOAP envelope with two attachments, the second one without a Content-Length
pub const MESSAGE: &[u8] = b"\r\n--MIME_boundary\r\n\
Content-Type: text/xml; charset=UTF-8\r\n\
Content-ID: <rootpart@example.com>\r\n\
\r\n\
<soap:Envelope/>\r\n\
--MIME_boundary\r\n\
Content-Type: application/octet-stream\r\n\
Content-ID: <att1>\r\n\
Content-Length: 10\r\n\
\r\n\
bin\r\n--MIM\r\n\
--MIME_boundary\r\n\
Content-Type: text/plain\r\n\
Content-ID: att2\r\n\
\r\n\
last part\r\n\
--MIME_boundary--\r\n";

/// The part bodies of [`MESSAGE`]
pub const BODIES: [&[u8]; 3] = [b"<soap:Envelope/>", b"bin\r\n--MIM", b"last part"];

pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub fn related(boundary: &str) -> ContentTypeHeader {
    ContentTypeHeader::parse(&format!(
        "multipart/related; type=\"text/xml\"; boundary=\"{}\"",
        boundary
    ))
    .unwrap()
}

pub fn read_all<T: Read>(mut r: T) -> Vec<u8> {
    let mut out = Vec::new();
    r.read_to_end(&mut out).unwrap();
    out
}

/// Returns a single byte per read
pub struct LameReader<R: Read>(pub R);
impl<R: Read> Read for LameReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, std::io::Error> {
        let len = buf.len().min(1);
        self.0.read(&mut buf[0..len])
    }
}
