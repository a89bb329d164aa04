//! Client-side counterparts of the proxy's wire modes: CONNECT tunnels and
//! the stateless HTTP POST transport.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use http::StatusCode;
use parley_session::{BoxFuture, StatelessTransport};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;

use crate::http::{read_response_head, ResponseHead};

/// Options for [`start_tunnel`].
#[derive(Debug, Clone, Default)]
pub struct TunnelOptions {
    /// Scopes to request, sent in the `scopes` header. Empty means the
    /// default scope.
    pub scopes: Vec<String>,
    /// Extra headers for the CONNECT request (the receiver hook sees them).
    pub headers: Vec<(String, String)>,
}

/// A socket returned by [`start_tunnel`]: the raw stream plus any bytes the
/// proxy sent right behind its `200`.
#[derive(Debug)]
pub struct TunnelSocket {
    leftover: BytesMut,
    stream: TcpStream,
}

impl AsyncRead for TunnelSocket {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.leftover.is_empty() {
            let n = self.leftover.len().min(buf.remaining());
            buf.put_slice(&self.leftover.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TunnelSocket {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// Open a tunnel through a proxy: issue HTTP CONNECT, await the `200`, and
/// surface the raw socket.
///
/// On any other status the response body is drained into the error message
/// as a best-effort diagnostic.
pub async fn start_tunnel(url: &str, opts: TunnelOptions) -> io::Result<TunnelSocket> {
    let (host, port, _path) = parse_http_url(url)?;
    let mut stream = TcpStream::connect((host.as_str(), port)).await?;

    let mut request = format!("CONNECT {host}:{port} HTTP/1.1\r\nhost: {host}:{port}\r\n");
    if !opts.scopes.is_empty() {
        request.push_str(&format!("scopes: {}\r\n", opts.scopes.join(",")));
    }
    for (name, value) in &opts.headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut buf = BytesMut::new();
    let head = read_response_head(&mut stream, &mut buf).await?;
    if head.status != StatusCode::OK {
        let body = drain_body(&mut stream, &mut buf, &head).await;
        let body = String::from_utf8_lossy(&body);
        return Err(io::Error::other(format!(
            "tunnel refused: {} {}",
            head.status.as_u16(),
            body.trim()
        )));
    }

    Ok(TunnelSocket {
        leftover: buf,
        stream,
    })
}

/// The stateless transport behind `http://` channels: one HTTP POST with
/// `avro/binary` content per call, a fresh connection each time.
pub struct HttpTransport {
    host: String,
    port: u16,
    path: String,
}

impl HttpTransport {
    /// Build a transport from an `http://host[:port][/scope]` URL.
    pub fn new(url: &str) -> io::Result<Self> {
        let (host, port, path) = parse_http_url(url)?;
        Ok(Self { host, port, path })
    }
}

impl StatelessTransport for HttpTransport {
    fn exchange(&self, request: Bytes) -> BoxFuture<'static, io::Result<Bytes>> {
        let host = self.host.clone();
        let port = self.port;
        let path = self.path.clone();
        Box::pin(async move {
            let mut stream = TcpStream::connect((host.as_str(), port)).await?;
            let head = format!(
                "POST {path} HTTP/1.1\r\n\
                 host: {host}:{port}\r\n\
                 content-type: avro/binary\r\n\
                 content-length: {}\r\n\
                 connection: close\r\n\r\n",
                request.len()
            );
            stream.write_all(head.as_bytes()).await?;
            stream.write_all(&request).await?;
            stream.flush().await?;

            let mut buf = BytesMut::new();
            let response = read_response_head(&mut stream, &mut buf).await?;
            let body = drain_body(&mut stream, &mut buf, &response).await;
            if response.status != StatusCode::OK {
                return Err(io::Error::other(format!(
                    "POST failed: {} {}",
                    response.status.as_u16(),
                    String::from_utf8_lossy(&body).trim()
                )));
            }
            Ok(Bytes::from(body))
        })
    }
}

/// Read the response body: by content-length when declared, to end-of-
/// stream otherwise.
async fn drain_body(stream: &mut TcpStream, buf: &mut BytesMut, head: &ResponseHead) -> Vec<u8> {
    match head.content_length() {
        Some(length) => match crate::http::read_body(stream, buf, length).await {
            Ok(body) => body.to_vec(),
            Err(_) => buf.to_vec(),
        },
        None => {
            let mut rest = buf.split().to_vec();
            let _ = stream.read_to_end(&mut rest).await;
            rest
        }
    }
}

fn parse_http_url(url: &str) -> io::Result<(String, u16, String)> {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| {
            // Bare authority is accepted for tunnels.
            (!url.contains("://")).then_some(url)
        })
        .ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("unsupported URL: {url}"))
        })?;
    let (authority, path) = match rest.find('/') {
        Some(index) => (&rest[..index], &rest[index..]),
        None => (rest, "/"),
    };
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => (
            host,
            port.parse::<u16>().map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidInput, format!("bad port in {url}"))
            })?,
        ),
        None => (authority, 80),
    };
    if host.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("missing host in {url}"),
        ));
    }
    Ok((host.to_owned(), port, path.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_urls() {
        assert_eq!(
            parse_http_url("http://example:8080/math").unwrap(),
            ("example".into(), 8080, "/math".into())
        );
        assert_eq!(
            parse_http_url("http://example").unwrap(),
            ("example".into(), 80, "/".into())
        );
        assert_eq!(
            parse_http_url("example:9000").unwrap(),
            ("example".into(), 9000, "/".into())
        );
        assert!(parse_http_url("ftp://example").is_err());
        // Raw-TCP URLs have their own dialer and default port; they are not
        // an alias for HTTP POST.
        assert!(parse_http_url("tcp://example").is_err());
    }
}
