//! Forward-only byte source with pushback
use crate::error::MimeError;
use std::io::Read;

/// The size of a single refill of the internal buffer
const BUFSIZ: usize = crate::BLOCK_SIZE;

/// A buffered reader which allows bytes to be *unread*
///
/// The scanner reads ahead to look for boundaries and pushes back whatever
/// it read past them, so the source stays positioned exactly at the next
/// structure of the message. The reader also counts the bytes consumed
/// (net of pushback) and can enforce a limit on them.
///
/// The limit is checked by [`read`](Read::read), [`read_byte`](Self::read_byte)
/// and [`read_line`](Self::read_line). Read-ahead goes through the unchecked
/// variants and is checked by the scanner once the excess is pushed back
pub struct PushbackReader<R: Read> {
    r: R,
    buf: Vec<u8>,
    start: usize,
    end: usize,
    eof: bool,
    position: u64,
    limit: u64,
}

impl<R: Read> PushbackReader<R> {
    /// Creates the reader, reserving room for `pushback` bytes
    pub fn new(r: R, pushback: usize) -> Self {
        Self {
            r,
            buf: vec![0; pushback.max(BUFSIZ)],
            start: 0,
            end: 0,
            eof: false,
            position: 0,
            limit: 0,
        }
    }

    /// Returns the number of bytes consumed so far (unread bytes excluded)
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Returns the current limit on [`position`](Self::position), 0 meaning unlimited
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Sets the limit on [`position`](Self::position), 0 meaning unlimited
    ///
    /// Fails if the limit is already exceeded
    pub fn set_limit(&mut self, limit: u64) -> Result<(), MimeError> {
        self.limit = limit;
        self.check_limit()
    }

    pub(crate) fn check_limit(&self) -> Result<(), MimeError> {
        if self.limit > 0 && self.position > self.limit {
            return Err(MimeError::LimitExceeded {
                what: "message body",
                limit: self.limit,
            });
        }
        Ok(())
    }

    /// Returns the number of buffered bytes
    fn buffered(&self) -> usize {
        self.end - self.start
    }

    fn fill_buf(&mut self) -> Result<(), std::io::Error> {
        if self.start > 0 {
            // memmove
            self.buf.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
        if self.end == self.buf.len() {
            self.buf.resize(self.buf.len() + BUFSIZ, 0);
        }
        loop {
            let read = match self.r.read(&mut self.buf[self.end..]) {
                Ok(v) => v,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            if read == 0 {
                self.eof = true;
            }
            self.end += read;
            break;
        }
        Ok(())
    }

    /// Moves `n` buffered bytes to the consumer, updating the position
    fn consume(&mut self, n: usize) {
        self.start += n;
        self.position += n as u64;
    }

    /// Pushes the given bytes back in front of the stream
    ///
    /// They will be returned by the next reads, before any other data
    pub fn unread(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if self.start >= data.len() {
            self.start -= data.len();
            self.buf[self.start..(self.start + data.len())].copy_from_slice(data);
        } else {
            let mut newbuf = Vec::with_capacity(self.buf.len().max(data.len() + self.buffered()));
            newbuf.extend_from_slice(data);
            newbuf.extend_from_slice(&self.buf[self.start..self.end]);
            self.end = newbuf.len();
            self.start = 0;
            newbuf.resize(newbuf.capacity(), 0);
            self.buf = newbuf;
        }
        self.position = self.position.saturating_sub(data.len() as u64);
        self.eof = false;
    }

    /// Excludes `n` already consumed bytes from the position
    ///
    /// Used for bytes which were injected with [`unread`](Self::unread) rather than read from the source
    pub(crate) fn discount(&mut self, n: u64) {
        self.position = self.position.saturating_sub(n);
    }

    /// Reads and returns a single byte, `None` on EOF
    pub fn read_byte(&mut self) -> Result<Option<u8>, MimeError> {
        let c = self.read_byte_unchecked()?;
        self.check_limit()?;
        Ok(c)
    }

    /// Like [`read_byte`](Self::read_byte) without the limit check
    pub(crate) fn read_byte_unchecked(&mut self) -> Result<Option<u8>, MimeError> {
        if self.buffered() == 0 {
            self.fill_buf()?;
            if self.buffered() == 0 {
                return Ok(None);
            }
        }
        let c = self.buf[self.start];
        self.consume(1);
        Ok(Some(c))
    }

    /// Reads and returns a full line (with EOL)
    ///
    /// Lines are terminated by LF (optionally preceded by CR).
    /// An empty vector is returned on EOF; the last line may lack the EOL
    pub fn read_line(&mut self, max_len: usize) -> Result<Vec<u8>, MimeError> {
        let mut searched = 0;
        loop {
            let avail = &self.buf[(self.start + searched)..self.end];
            if let Some(pos) = memchr::memchr(crate::LF, avail) {
                let len = searched + pos + 1;
                if len > max_len {
                    break;
                }
                let line = self.buf[self.start..(self.start + len)].to_vec();
                self.consume(len);
                self.check_limit()?;
                return Ok(line);
            }
            searched = self.buffered();
            if searched > max_len {
                break;
            }
            self.fill_buf()?;
            if self.eof && self.buffered() == searched {
                let line = self.buf[self.start..self.end].to_vec();
                self.consume(line.len());
                self.check_limit()?;
                return Ok(line);
            }
        }
        Err(MimeError::LimitExceeded {
            what: "header line",
            limit: max_len as u64,
        })
    }

    /// Like [`read`](Read::read) without the limit check
    ///
    /// Used for read-ahead: the caller must [`check_limit`](Self::check_limit)
    /// after pushing back what it doesn't keep
    pub(crate) fn read_unchecked(&mut self, out: &mut [u8]) -> Result<usize, std::io::Error> {
        if out.is_empty() {
            return Ok(0);
        }
        if self.buffered() == 0 {
            if out.len() >= self.buf.len() {
                // Large read, skip the buffer
                let read = loop {
                    match self.r.read(out) {
                        Ok(v) => break v,
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                };
                self.position += read as u64;
                return Ok(read);
            }
            self.fill_buf()?;
        }
        let len = self.buffered().min(out.len());
        out[0..len].copy_from_slice(&self.buf[self.start..(self.start + len)]);
        self.consume(len);
        Ok(len)
    }
}

impl<R: Read> Read for PushbackReader<R> {
    fn read(&mut self, out: &mut [u8]) -> Result<usize, std::io::Error> {
        let len = self.read_unchecked(out)?;
        self.check_limit()?;
        Ok(len)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct LameReader<R: Read>(R);
    impl<R: Read> Read for LameReader<R> {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize, std::io::Error> {
            let len = buf.len().min(1);
            self.0.read(&mut buf[0..len])
        }
    }

    #[test]
    fn test_readline() -> Result<(), MimeError> {
        let data: &[u8] = b"crlf\r\nlf\n\r\n\nlast";
        let mut r = PushbackReader::new(data, 16);
        assert_eq!(r.read_line(100)?, b"crlf\r\n");
        assert_eq!(r.read_line(100)?, b"lf\n");
        assert_eq!(r.read_line(100)?, b"\r\n");
        assert_eq!(r.read_line(100)?, b"\n");
        assert_eq!(r.read_line(100)?, b"last");
        assert_eq!(r.read_line(100)?, b"");
        assert_eq!(r.position(), data.len() as u64);
        Ok(())
    }

    #[test]
    fn test_readline_lame() -> Result<(), MimeError> {
        let data: &[u8] = b"crlf\r\nlf\nlast";
        let mut r = PushbackReader::new(LameReader(data), 16);
        assert_eq!(r.read_line(100)?, b"crlf\r\n");
        assert_eq!(r.read_line(100)?, b"lf\n");
        assert_eq!(r.read_line(100)?, b"last");
        assert_eq!(r.read_line(100)?, b"");
        Ok(())
    }

    #[test]
    fn test_line_limit() {
        let data = [b'a'; 50];
        let mut r = PushbackReader::new(data.as_slice(), 16);
        assert!(matches!(
            r.read_line(10),
            Err(MimeError::LimitExceeded { limit: 10, .. })
        ));
    }

    #[test]
    fn test_unread() -> Result<(), std::io::Error> {
        let data: &[u8] = b"0123456789";
        let mut r = PushbackReader::new(data, 4);
        let mut buf = [0u8; 4];
        assert_eq!(r.read(&mut buf)?, 4);
        assert_eq!(&buf, b"0123");
        r.unread(b"23");
        assert_eq!(r.position(), 2);
        r.unread(b"xyz");
        assert_eq!(r.position(), 0);
        let mut rest = Vec::new();
        r.read_to_end(&mut rest)?;
        assert_eq!(rest, b"xyz23456789");
        r.unread(b"\r\n");
        let mut rest = Vec::new();
        r.read_to_end(&mut rest)?;
        assert_eq!(rest, b"\r\n");
        Ok(())
    }

    #[test]
    fn test_limit_net_of_pushback() -> Result<(), MimeError> {
        let data = [b'x'; 100];
        let mut r = PushbackReader::new(data.as_slice(), 16);
        r.set_limit(10)?;
        let mut buf = [0u8; 64];
        // Reading ahead past the limit is fine as long as the excess is returned
        assert_eq!(r.read_unchecked(&mut buf)?, 64);
        r.unread(&buf[8..]);
        r.check_limit()?;
        assert_eq!(r.position(), 8);
        r.unread(&buf[0..8]);
        assert!(matches!(
            r.read_line(200),
            Err(MimeError::LimitExceeded {
                what: "message body",
                limit: 10
            })
        ));
        Ok(())
    }

    #[test]
    fn test_limit() -> Result<(), MimeError> {
        let data = [b'x'; 100];
        let mut r = PushbackReader::new(data.as_slice(), 16);
        r.set_limit(10)?;
        let mut buf = [0u8; 8];
        assert_eq!(r.read(&mut buf)?, 8);
        let err = r.read(&mut buf).unwrap_err();
        assert!(matches!(
            MimeError::from(err),
            MimeError::LimitExceeded { limit: 10, .. }
        ));
        r.unread(&buf);
        r.set_limit(0)?;
        let mut rest = Vec::new();
        r.read_to_end(&mut rest)?;
        assert_eq!(rest.len(), 100 - 8);
        Ok(())
    }
}
