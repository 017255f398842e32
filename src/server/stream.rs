use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use url::Url;

use crate::server::directory::AdmissionError;

/// Largest request head accepted before the upgrade.
pub const MAX_HEAD_LEN: usize = 8 * 1024;

/// A stream that yields already-consumed bytes before reading from the inner stream.
///
/// The request head is read ahead of the WebSocket handshake to screen the
/// request; wrapping the socket in `PrefixedStream` hands those bytes back to
/// the handshake unchanged.
///
/// # Type Parameter
/// * `T` - A type that implements both `AsyncRead` and `AsyncWrite`.
#[derive(Debug)]
pub struct PrefixedStream<T> {
    prefix: Vec<u8>,
    position: usize,
    inner: T,
}

impl<T> PrefixedStream<T> {
    pub fn new(prefix: Vec<u8>, inner: T) -> Self {
        Self { prefix, position: 0, inner }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for PrefixedStream<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.position < this.prefix.len() {
            let remaining = &this.prefix[this.position..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            this.position += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Request line and the one header the relay cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    /// Request target resolved against a placeholder origin.
    pub url: Url,
    /// Whether an `Upgrade: websocket` header was sent.
    pub upgrade: bool,
}

impl RequestHead {
    /// Parses an HTTP/1.x request head (everything up to the blank line).
    ///
    /// # Returns
    /// `None` if the request line is malformed.
    pub fn parse(head: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(head).ok()?;
        let mut lines = text.split("\r\n");

        let mut request_line = lines.next()?.split_whitespace();
        let method = request_line.next()?.to_owned();
        let target = request_line.next()?;
        if !request_line.next()?.starts_with("HTTP/") {
            return None;
        }
        let url = Url::options()
            .base_url(Some(&Url::parse("http://localhost/").ok()?))
            .parse(target)
            .ok()?;

        let upgrade = lines
            .filter_map(|line| line.split_once(':'))
            .any(|(name, value)| {
                name.trim().eq_ignore_ascii_case("upgrade")
                    && value.trim().eq_ignore_ascii_case("websocket")
            });

        Some(Self { method, url, upgrade })
    }

    pub fn path(&self) -> &str {
        self.url.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.url.query()
    }
}

/// Reads until the end of the request head.
///
/// # Returns
/// The parsed head and every byte consumed, to be replayed through
/// [`PrefixedStream`].
///
/// # Errors
/// Fails on EOF before the head is complete, on a head longer than
/// [`MAX_HEAD_LEN`], or on a malformed request line.
pub async fn read_request_head<S>(stream: &mut S) -> io::Result<(RequestHead, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut buffered = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed before request head"));
        }
        buffered.extend_from_slice(&chunk[..n]);

        if let Some(end) = find_head_end(&buffered) {
            let head = RequestHead::parse(&buffered[..end])
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed request line"))?;
            return Ok((head, buffered));
        }
        if buffered.len() > MAX_HEAD_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "request head too large"));
        }
    }
}

fn find_head_end(buffered: &[u8]) -> Option<usize> {
    buffered.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Answers a refused request with a plain-text HTTP response and closes the write side.
pub async fn write_rejection<S>(stream: &mut S, reason: &AdmissionError) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let status = reason.status();
    let body = reason.to_string();
    let response = format!(
        "HTTP/1.1 {} {}\r\ncontent-type: text/plain;charset=utf-8\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
        status.as_u16(),
        status.canonical_reason().unwrap_or_default(),
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    stream.shutdown().await
}
