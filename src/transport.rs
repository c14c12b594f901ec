//! Line-oriented transport: CRLF command lines and dot-stuffed multi-line
//! blocks ([RFC 3977 §3.1](https://datatracker.ietf.org/doc/html/rfc3977#section-3.1)).

use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::watch;

use crate::cancel::{Deadline, with_deadline};
use crate::error::NntpError;
use crate::model::{Expect, NntpResponse};

pub trait NntpIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> NntpIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// One buffered connection speaking CRLF lines.
///
/// All reads and writes observe the owning session's deadline, so a forced
/// deadline unblocks them immediately.
pub struct LineTransport {
    stream: BufReader<Box<dyn NntpIo>>,
    deadline: watch::Receiver<Deadline>,
    line_buf: Vec<u8>,
}

impl LineTransport {
    pub(crate) fn new(io: Box<dyn NntpIo>, deadline: watch::Receiver<Deadline>) -> Self {
        Self {
            stream: BufReader::new(io),
            deadline,
            line_buf: Vec::with_capacity(1024),
        }
    }

    /// Write one command line, appending CRLF.
    pub async fn write_line(&mut self, line: &str) -> Result<(), NntpError> {
        let data = format!("{line}\r\n");
        let Self {
            stream, deadline, ..
        } = self;
        with_deadline(deadline, async {
            let conn = stream.get_mut();
            conn.write_all(data.as_bytes()).await?;
            conn.flush().await
        })
        .await
    }

    /// Read one status line and validate its code against `expect`.
    ///
    /// Status lines are exactly three ASCII digits followed by free text
    /// ([RFC 3977 §3.2](https://datatracker.ietf.org/doc/html/rfc3977#section-3.2)).
    pub async fn read_status_line(&mut self, expect: Expect) -> Result<NntpResponse, NntpError> {
        let n = self.read_line_raw().await?;
        if n == 0 {
            return Err(NntpError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed while awaiting response",
            )));
        }
        let line = trim_crlf(&self.line_buf);
        let line = std::str::from_utf8(line)
            .map_err(|_| NntpError::MalformedResponse("response line is not valid UTF-8".into()))?;
        let resp = parse_status_line(line)?;
        if !expect.matches(resp.code) {
            return Err(NntpError::UnexpectedResponse {
                got: resp.code,
                want: expect,
                message: resp.message,
            });
        }
        Ok(resp)
    }

    /// Start reading a dot-terminated block positioned after a status line.
    pub fn read_body(&mut self) -> BodyReader<'_> {
        BodyReader {
            transport: self,
            done: false,
        }
    }

    /// Stream `source` to the peer as a dot-stuffed block, then write the
    /// terminator line ([RFC 3977 §3.1.1](https://datatracker.ietf.org/doc/html/rfc3977#section-3.1.1)).
    ///
    /// Input lines are CRLF-normalized; a line starting with "." gets an
    /// extra leading dot. If copying fails the terminator is never written,
    /// leaving the peer waiting on an unfinished block; the session must be
    /// discarded.
    pub async fn write_body<R>(&mut self, source: R) -> Result<(), NntpError>
    where
        R: AsyncRead + Unpin,
    {
        let mut source = BufReader::new(source);
        let mut line = Vec::with_capacity(1024);
        let mut out = Vec::with_capacity(1024);
        loop {
            line.clear();
            let n = with_deadline(&mut self.deadline, source.read_until(b'\n', &mut line)).await?;
            if n == 0 {
                break;
            }
            let content = trim_crlf(&line);
            out.clear();
            if content.first() == Some(&b'.') {
                out.push(b'.');
            }
            out.extend_from_slice(content);
            out.extend_from_slice(b"\r\n");
            with_deadline(&mut self.deadline, self.stream.get_mut().write_all(&out)).await?;
        }
        let Self {
            stream, deadline, ..
        } = self;
        with_deadline(deadline, async {
            let conn = stream.get_mut();
            conn.write_all(b".\r\n").await?;
            conn.flush().await
        })
        .await
    }

    pub(crate) async fn shutdown(&mut self) -> Result<(), NntpError> {
        self.stream.get_mut().shutdown().await?;
        Ok(())
    }

    async fn read_line_raw(&mut self) -> Result<usize, NntpError> {
        let Self {
            stream,
            deadline,
            line_buf,
        } = self;
        line_buf.clear();
        with_deadline(deadline, stream.read_until(b'\n', line_buf)).await
    }
}

/// Streaming reader for one dot-terminated block.
///
/// Yields unstuffed lines until the lone "." terminator, after which
/// [`read_line`](Self::read_line) returns `None` and the underlying
/// transport is positioned at the next response.
pub struct BodyReader<'a> {
    transport: &'a mut LineTransport,
    done: bool,
}

impl BodyReader<'_> {
    pub async fn read_line(&mut self) -> Result<Option<Vec<u8>>, NntpError> {
        if self.done {
            return Ok(None);
        }
        let n = self.transport.read_line_raw().await?;
        if n == 0 {
            return Err(NntpError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside multi-line block",
            )));
        }
        let line = trim_crlf(&self.transport.line_buf);
        if line == b"." {
            self.done = true;
            return Ok(None);
        }
        let line = match line.first() {
            Some(b'.') => &line[1..],
            _ => line,
        };
        Ok(Some(line.to_vec()))
    }

    /// Read and discard the rest of the block.
    pub async fn drain(&mut self) -> Result<(), NntpError> {
        while self.read_line().await?.is_some() {}
        Ok(())
    }
}

fn parse_status_line(line: &str) -> Result<NntpResponse, NntpError> {
    if line.len() < 3 || !line.as_bytes()[..3].iter().all(u8::is_ascii_digit) {
        return Err(NntpError::MalformedResponse(format!(
            "invalid status line: {line:?}"
        )));
    }
    let code = line[..3]
        .parse::<u16>()
        .map_err(|_| NntpError::MalformedResponse(format!("invalid status line: {line:?}")))?;
    Ok(NntpResponse {
        code,
        message: line[3..].trim().to_string(),
    })
}

pub(crate) fn trim_crlf(buf: &[u8]) -> &[u8] {
    let mut end = buf.len();
    if end > 0 && buf[end - 1] == b'\n' {
        end -= 1;
    }
    if end > 0 && buf[end - 1] == b'\r' {
        end -= 1;
    }
    &buf[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn transport_pair() -> (LineTransport, DuplexStream, watch::Sender<Deadline>) {
        let (client, server) = tokio::io::duplex(4096);
        let (tx, rx) = watch::channel(Deadline::None);
        (LineTransport::new(Box::new(client), rx), server, tx)
    }

    #[tokio::test]
    async fn write_line_appends_crlf() {
        let (mut transport, mut server, _tx) = transport_pair();
        transport.write_line("LIST *").await.unwrap();

        let mut buf = vec![0u8; 64];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"LIST *\r\n");
    }

    #[tokio::test]
    async fn read_status_line_parses_code_and_message() {
        let (mut transport, mut server, _tx) = transport_pair();
        server.write_all(b"200 Welcome\r\n").await.unwrap();

        let resp = transport.read_status_line(Expect::Exact(200)).await.unwrap();
        assert_eq!(resp.code, 200);
        assert_eq!(resp.message, "Welcome");
    }

    #[tokio::test]
    async fn read_status_line_accepts_code_only() {
        let (mut transport, mut server, _tx) = transport_pair();
        server.write_all(b"205\r\n").await.unwrap();

        let resp = transport.read_status_line(Expect::Any).await.unwrap();
        assert_eq!(resp.code, 205);
        assert_eq!(resp.message, "");
    }

    #[tokio::test]
    async fn read_status_line_rejects_mismatched_code() {
        let (mut transport, mut server, _tx) = transport_pair();
        server.write_all(b"440 posting not allowed\r\n").await.unwrap();

        let err = transport
            .read_status_line(Expect::Exact(340))
            .await
            .expect_err("code mismatch");
        match err {
            NntpError::UnexpectedResponse { got, want, message } => {
                assert_eq!(got, 440);
                assert_eq!(want, Expect::Exact(340));
                assert_eq!(message, "posting not allowed");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_status_line_prefix_match() {
        let (mut transport, mut server, _tx) = transport_pair();
        server.write_all(b"215 list follows\r\n").await.unwrap();

        let resp = transport
            .read_status_line(Expect::Century(2))
            .await
            .unwrap();
        assert_eq!(resp.code, 215);
    }

    #[tokio::test]
    async fn read_status_line_rejects_garbage() {
        let (mut transport, mut server, _tx) = transport_pair();
        server.write_all(b"garbage\r\n").await.unwrap();

        let err = transport
            .read_status_line(Expect::Any)
            .await
            .expect_err("malformed line");
        assert!(matches!(err, NntpError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn read_status_line_rejects_short_line() {
        let (mut transport, mut server, _tx) = transport_pair();
        server.write_all(b"20\r\n").await.unwrap();

        let err = transport
            .read_status_line(Expect::Any)
            .await
            .expect_err("short line");
        assert!(matches!(err, NntpError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn read_status_line_eof_is_io_error() {
        let (mut transport, server, _tx) = transport_pair();
        drop(server);

        let err = transport
            .read_status_line(Expect::Any)
            .await
            .expect_err("eof");
        assert!(matches!(err, NntpError::Io(_)));
    }

    #[tokio::test]
    async fn body_reader_unstuffs_and_terminates() {
        let (mut transport, mut server, _tx) = transport_pair();
        server.write_all(b"line1\r\n..dot\r\n.\r\n").await.unwrap();

        let mut body = transport.read_body();
        assert_eq!(body.read_line().await.unwrap(), Some(b"line1".to_vec()));
        assert_eq!(body.read_line().await.unwrap(), Some(b".dot".to_vec()));
        assert_eq!(body.read_line().await.unwrap(), None);
        assert_eq!(body.read_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn body_reader_empty_block() {
        let (mut transport, mut server, _tx) = transport_pair();
        server.write_all(b".\r\n").await.unwrap();

        let mut body = transport.read_body();
        assert_eq!(body.read_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn body_reader_dot_stuffed_variants() {
        let (mut transport, mut server, _tx) = transport_pair();
        server
            .write_all(b"..\r\n...\r\nnormal\r\n   \r\n\r\n.\r\n")
            .await
            .unwrap();

        let mut body = transport.read_body();
        assert_eq!(body.read_line().await.unwrap(), Some(b".".to_vec()));
        assert_eq!(body.read_line().await.unwrap(), Some(b"..".to_vec()));
        assert_eq!(body.read_line().await.unwrap(), Some(b"normal".to_vec()));
        assert_eq!(body.read_line().await.unwrap(), Some(b"   ".to_vec()));
        assert_eq!(body.read_line().await.unwrap(), Some(Vec::new()));
        assert_eq!(body.read_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn body_reader_eof_mid_block_is_error() {
        let (mut transport, mut server, _tx) = transport_pair();
        server.write_all(b"partial line\r\n").await.unwrap();
        drop(server);

        let mut body = transport.read_body();
        assert_eq!(
            body.read_line().await.unwrap(),
            Some(b"partial line".to_vec())
        );
        let err = body.read_line().await.expect_err("eof mid-block");
        assert!(matches!(err, NntpError::Io(_)));
    }

    #[tokio::test]
    async fn transport_positioned_after_terminator() {
        let (mut transport, mut server, _tx) = transport_pair();
        server
            .write_all(b"215 list follows\r\nalt.test 3 1 y\r\n.\r\n205 bye\r\n")
            .await
            .unwrap();

        transport.read_status_line(Expect::Exact(215)).await.unwrap();
        let mut body = transport.read_body();
        body.drain().await.unwrap();
        let resp = transport.read_status_line(Expect::Exact(205)).await.unwrap();
        assert_eq!(resp.message, "bye");
    }

    #[tokio::test]
    async fn write_body_stuffs_and_terminates() {
        let (mut transport, mut server, _tx) = transport_pair();
        let article: &[u8] = b"Subject: test\n\n.leading dot\nplain\n";
        transport.write_body(article).await.unwrap();

        let mut buf = vec![0u8; 256];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(
            &buf[..n],
            b"Subject: test\r\n\r\n..leading dot\r\nplain\r\n.\r\n"
        );
    }

    #[tokio::test]
    async fn write_body_handles_missing_final_newline() {
        let (mut transport, mut server, _tx) = transport_pair();
        transport.write_body(&b"no newline"[..]).await.unwrap();

        let mut buf = vec![0u8; 64];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"no newline\r\n.\r\n");
    }

    #[tokio::test]
    async fn dot_block_round_trip() {
        let (client, server) = tokio::io::duplex(4096);
        let (_write_tx, rx) = watch::channel(Deadline::None);
        let mut writer = LineTransport::new(Box::new(client), rx);
        let (_read_tx, rx) = watch::channel(Deadline::None);
        let mut reader = LineTransport::new(Box::new(server), rx);

        let input: &[u8] = b"plain\n.leading\n..double\n\n...\ndotted.middle\n";
        writer.write_body(input).await.unwrap();

        let mut body = reader.read_body();
        let mut lines = Vec::new();
        while let Some(line) = body.read_line().await.unwrap() {
            lines.push(line);
        }
        let expected: Vec<Vec<u8>> = [
            &b"plain"[..],
            b".leading",
            b"..double",
            b"",
            b"...",
            b"dotted.middle",
        ]
        .iter()
        .map(|l| l.to_vec())
        .collect();
        assert_eq!(lines, expected);
    }

    #[test]
    fn trim_crlf_variants() {
        assert_eq!(trim_crlf(b"hello\r\n"), b"hello");
        assert_eq!(trim_crlf(b"hello\n"), b"hello");
        assert_eq!(trim_crlf(b"hello"), b"hello");
        assert_eq!(trim_crlf(b""), b"");
    }

    #[test]
    fn parse_status_line_valid() {
        let resp = parse_status_line("211 100 1 100 alt.test").unwrap();
        assert_eq!(resp.code, 211);
        assert_eq!(resp.message, "100 1 100 alt.test");
    }

    #[test]
    fn parse_status_line_invalid() {
        assert!(parse_status_line("").is_err());
        assert!(parse_status_line("xx").is_err());
        assert!(parse_status_line("2x0 nope").is_err());
    }
}
