mod common;

use common::*;
use mimebody_rs::{Config, FileStash, MemoryStash, MimeError, MultipartBody, StashManager};
use std::io::Read;

fn two_parts(first: usize, second: usize) -> Vec<u8> {
    let mut raw = b"\r\n--b\r\n\r\n".to_vec();
    raw.extend((0..first).map(|i| b'0' + (i % 10) as u8));
    raw.extend_from_slice(b"\r\n--b\r\n\r\n");
    raw.extend(std::iter::repeat_n(b'n', second));
    raw.extend_from_slice(b"\r\n--b--\r\n");
    raw
}

fn limited<R: Read>(
    stash: Box<dyn StashManager>,
    source: R,
    first_part_max_bytes: u64,
) -> Result<MultipartBody<R>, MimeError> {
    let config = Config {
        first_part_max_bytes,
        ..Config::default()
    };
    MultipartBody::with_config(stash, related("b"), source, &config)
}

#[test]
fn first_part_limit_with_file_stash() -> Result<(), MimeError> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let raw = two_parts(10, 3000);
    let mut body = limited(Box::new(FileStash::new(dir.path())?), raw.as_slice(), 100)?;
    assert_eq!(body.body_length_limit(), 109);
    // The stash reads far past the part, only the consumed bytes count
    assert_eq!(body.first_part().actual_content_length()?, 10);
    assert_eq!(body.part(1)?.actual_content_length()?, 3000);
    assert_eq!(body.body_length_limit(), 0);
    assert_eq!(read_all(body.entire_message_body(false)?), raw);

    let raw = two_parts(200, 3000);
    let mut body = limited(Box::new(FileStash::new(dir.path())?), raw.as_slice(), 100)?;
    assert!(matches!(
        body.first_part().actual_content_length().err(),
        Some(MimeError::LimitExceeded {
            what: "message body",
            limit: 109
        })
    ));
    Ok(())
}

#[test]
fn first_part_limit_with_destructive_read() -> Result<(), MimeError> {
    let raw = two_parts(10, 3000);
    let mut body = limited(Box::new(MemoryStash::new()), raw.as_slice(), 100)?;
    let mut content = Vec::new();
    {
        let mut part = body.first_part();
        let mut stream = part.body(true)?;
        let mut buf = [0u8; 4096];
        loop {
            let n = stream.read(&mut buf)?;
            if n == 0 {
                break;
            }
            content.extend_from_slice(&buf[..n]);
        }
    }
    assert_eq!(content, b"0123456789");
    assert_eq!(body.part(1)?.actual_content_length()?, 3000);
    assert!(!body.is_more_parts_possible());
    Ok(())
}

#[test]
fn body_length_limit_in_part_headers() -> Result<(), MimeError> {
    let raw: &[u8] = b"\r\n--b\r\n\r\nX\r\n--b\r\nContent-Type: text/plain\r\n\r\nY\r\n--b--\r\n";
    let mut body = MultipartBody::new(Box::new(MemoryStash::new()), related("b"), LameReader(raw))?;
    body.set_body_length_limit(30)?;
    // Running out of message body in the headers is not a header size problem
    assert!(matches!(
        body.part(1).err(),
        Some(MimeError::LimitExceeded {
            what: "message body",
            limit: 30
        })
    ));

    let config = Config {
        headers_max_size: 10,
        ..Config::default()
    };
    let mut body = MultipartBody::with_config(Box::new(MemoryStash::new()), related("b"), raw, &config)?;
    assert!(matches!(
        body.part(1).err(),
        Some(MimeError::LimitExceeded {
            what: "MIME part headers",
            limit: 10
        })
    ));
    Ok(())
}

#[test]
fn destructive_read_reports_bad_next_headers() -> Result<(), MimeError> {
    let raw: &[u8] = b"\r\n--b\r\n\r\nX\r\n--b\r\nContent-Type: text\r\n\r\nY\r\n--b--\r\n";
    let mut body = MultipartBody::new(Box::new(MemoryStash::new()), related("b"), LameReader(raw))?;
    let mut content = Vec::new();
    let err = body
        .first_part()
        .body(true)?
        .read_to_end(&mut content)
        .err()
        .map(MimeError::from);
    assert_eq!(content, b"X");
    assert!(matches!(err, Some(MimeError::Malformed(_))));
    assert!(matches!(
        body.part(1).err(),
        Some(MimeError::PreviouslyFailed(_))
    ));
    Ok(())
}
