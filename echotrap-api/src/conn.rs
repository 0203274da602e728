//! Connection-level serving for the public port.
//!
//! Captures must record header names exactly as the client sent them, but
//! the HTTP stack's header map lowercases names on parse. So the gateway
//! owns the accept loop: for each connection the raw request head is read
//! off the socket first, the header names recorded byte-for-byte in arrival
//! order, and the buffered bytes replayed to hyper through a rewinding
//! stream. The http1 builder runs with `preserve_header_case` on and
//! keep-alive off, so the recorded head always belongs to the request being
//! served.

use std::cmp;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::ConnectInfo;
use axum::Router;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tower::util::ServiceExt;
use tracing::debug;

/// Upper bound on the buffered request head. Oversized heads are handed to
/// hyper as-is, which rejects them.
const MAX_HEAD_BYTES: usize = 16 * 1024;

/// Header names exactly as received on the wire, in arrival order.
///
/// Inserted into every request's extensions so the capture assembler can
/// pair the original names with the values hyper parsed.
#[derive(Debug, Default)]
pub(crate) struct ReceivedHeaderCase {
    names: Vec<String>,
}

impl ReceivedHeaderCase {
    /// Extract header names from a raw request head: every line after the
    /// request line up to the blank terminator, name being the bytes before
    /// the first colon.
    pub(crate) fn parse(head: &[u8]) -> Self {
        let mut names = Vec::new();
        for line in head.split(|b| *b == b'\n').skip(1) {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.is_empty() {
                break;
            }
            let Some(colon) = line.iter().position(|b| *b == b':') else {
                continue;
            };
            let name = String::from_utf8_lossy(&line[..colon]).trim().to_string();
            if !name.is_empty() {
                names.push(name);
            }
        }
        Self { names }
    }

    pub(crate) fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

fn head_complete(buffer: &[u8]) -> bool {
    buffer.windows(4).any(|w| w == b"\r\n\r\n") || buffer.windows(2).any(|w| w == b"\n\n")
}

/// Serve one accepted connection: record the head, then hand the replayed
/// stream to hyper with the router behind it.
pub(crate) async fn serve_connection(
    router: Router,
    mut stream: TcpStream,
    peer: SocketAddr,
    shutdown: CancellationToken,
) {
    let mut head = Vec::with_capacity(1024);
    let mut buf = [0u8; 2048];
    loop {
        if head_complete(&head) || head.len() > MAX_HEAD_BYTES {
            break;
        }
        let read = tokio::select! {
            _ = shutdown.cancelled() => return,
            read = stream.read(&mut buf) => read,
        };
        match read {
            Ok(0) => break,
            Ok(n) => head.extend_from_slice(&buf[..n]),
            Err(err) => {
                debug!(%err, %peer, "connection failed before request head");
                return;
            }
        }
    }
    if head.is_empty() {
        return;
    }

    let header_case = Arc::new(ReceivedHeaderCase::parse(&head));
    let io = TokioIo::new(Rewind::new(head, stream));

    let service = TowerToHyperService::new(tower::service_fn(
        move |mut request: axum::http::Request<hyper::body::Incoming>| {
            request.extensions_mut().insert(ConnectInfo(peer));
            request.extensions_mut().insert(header_case.clone());
            router.clone().oneshot(request)
        },
    ));

    let mut http = http1::Builder::new();
    // One request per connection keeps the recorded head authoritative.
    http.preserve_header_case(true).keep_alive(false);

    let connection = http.serve_connection(io, service).with_upgrades();
    let mut connection = std::pin::pin!(connection);
    tokio::select! {
        result = connection.as_mut() => {
            if let Err(err) = result {
                debug!(%err, %peer, "connection error");
            }
        }
        _ = shutdown.cancelled() => {
            connection.as_mut().graceful_shutdown();
            let _ = connection.as_mut().await;
        }
    }
}

/// Stream replaying an already-consumed prefix before the live socket.
struct Rewind<S> {
    prefix: Vec<u8>,
    offset: usize,
    inner: S,
}

impl<S> Rewind<S> {
    fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            offset: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.offset < this.prefix.len() {
            let n = cmp::min(buf.remaining(), this.prefix.len() - this.offset);
            buf.put_slice(&this.prefix[this.offset..this.offset + n]);
            this.offset += n;
            if this.offset == this.prefix.len() {
                this.prefix = Vec::new();
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
