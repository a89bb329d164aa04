//! A small HTTP/1.1 head codec.
//!
//! The proxy owns its sockets end to end: CONNECT tunnels and WebSocket
//! upgrades keep the raw stream, and refusals are plain status-line
//! writebacks. That rules out a framework server, so request and response
//! heads are read and written here directly, with `http` crate types for
//! the parsed form.

use std::io;

use bytes::BytesMut;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Ceiling on a request or response head.
const MAX_HEAD_LEN: usize = 16 * 1024;

/// A parsed request head.
#[derive(Debug)]
pub(crate) struct RequestHead {
    pub method: String,
    pub target: String,
    pub headers: HeaderMap,
}

impl RequestHead {
    /// A header value as a string, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn content_length(&self) -> Option<usize> {
        self.header("content-length")?.trim().parse().ok()
    }
}

/// A parsed response head.
#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl ResponseHead {
    pub fn content_length(&self) -> Option<usize> {
        self.headers
            .get("content-length")?
            .to_str()
            .ok()?
            .trim()
            .parse()
            .ok()
    }
}

/// Read bytes into `buf` until a full head (`\r\n\r\n`) is present, then
/// split it off and return it. Bytes past the head stay in `buf`.
///
/// Returns `Ok(None)` on a clean end-of-stream before any byte arrived.
async fn read_head_block<R>(reader: &mut R, buf: &mut BytesMut) -> io::Result<Option<BytesMut>>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(end) = find_head_end(buf) {
            let mut head = buf.split_to(end + 4);
            head.truncate(end);
            return Ok(Some(head));
        }
        if buf.len() > MAX_HEAD_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "head too large"));
        }
        let n = reader.read_buf(buf).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n")
}

/// Read and parse one request head.
pub(crate) async fn read_request_head<R>(
    reader: &mut R,
    buf: &mut BytesMut,
) -> io::Result<Option<RequestHead>>
where
    R: AsyncRead + Unpin,
{
    let Some(head) = read_head_block(reader, buf).await? else {
        return Ok(None);
    };
    let text = std::str::from_utf8(&head)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "head is not utf-8"))?;
    let mut lines = text.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(target), Some(version)) => (method, target, version),
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "malformed request line",
            ))
        }
    };
    if !version.starts_with("HTTP/1") {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unsupported HTTP version",
        ));
    }
    Ok(Some(RequestHead {
        method: method.to_owned(),
        target: target.to_owned(),
        headers: parse_headers(lines)?,
    }))
}

/// Read and parse one response head.
pub(crate) async fn read_response_head<R>(
    reader: &mut R,
    buf: &mut BytesMut,
) -> io::Result<ResponseHead>
where
    R: AsyncRead + Unpin,
{
    let Some(head) = read_head_block(reader, buf).await? else {
        return Err(io::ErrorKind::UnexpectedEof.into());
    };
    let text = std::str::from_utf8(&head)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "head is not utf-8"))?;
    let mut lines = text.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    let mut parts = status_line.split_whitespace();
    let (version, code) = match (parts.next(), parts.next()) {
        (Some(version), Some(code)) => (version, code),
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "malformed status line",
            ))
        }
    };
    if !version.starts_with("HTTP/1") {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unsupported HTTP version",
        ));
    }
    let status = code
        .parse::<u16>()
        .ok()
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad status code"))?;
    Ok(ResponseHead {
        status,
        headers: parse_headers(lines)?,
    })
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> io::Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed header"))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad header name"))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad header value"))?;
        headers.append(name, value);
    }
    Ok(headers)
}

/// Read `len` body bytes, consuming whatever is already buffered first.
pub(crate) async fn read_body<R>(
    reader: &mut R,
    buf: &mut BytesMut,
    len: usize,
) -> io::Result<BytesMut>
where
    R: AsyncRead + Unpin,
{
    while buf.len() < len {
        if reader.read_buf(buf).await? == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
    }
    Ok(buf.split_to(len))
}

/// Write a full response: status line, headers, content-length, body.
pub(crate) async fn write_response<W>(
    writer: &mut W,
    status: StatusCode,
    headers: &[(&str, &str)],
    body: &[u8],
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    );
    for (name, value) in headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str(&format!("content-length: {}\r\n\r\n", body.len()));
    writer.write_all(head.as_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await
}

/// Write a bare status line with no headers or body (tunnel-style
/// writebacks like `200 Connection Established`).
pub(crate) async fn write_status_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\r\n\r\n").await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_a_request_head_and_keeps_the_remainder() {
        let raw = b"POST /math HTTP/1.1\r\ncontent-type: avro/json\r\ncontent-length: 4\r\n\r\nbody";
        let mut reader = &raw[..];
        let mut buf = BytesMut::new();
        let head = read_request_head(&mut reader, &mut buf).await.unwrap().unwrap();
        assert_eq!(head.method, "POST");
        assert_eq!(head.target, "/math");
        assert_eq!(head.header("content-type"), Some("avro/json"));
        assert_eq!(head.content_length(), Some(4));

        let body = read_body(&mut reader, &mut buf, 4).await.unwrap();
        assert_eq!(&body[..], b"body");
    }

    #[tokio::test]
    async fn clean_eof_yields_none() {
        let mut reader = &b""[..];
        let mut buf = BytesMut::new();
        assert!(read_request_head(&mut reader, &mut buf)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn trailing_bytes_stay_buffered() {
        let raw = b"CONNECT example:80 HTTP/1.1\r\n\r\nextra";
        let mut reader = &raw[..];
        let mut buf = BytesMut::new();
        let head = read_request_head(&mut reader, &mut buf).await.unwrap().unwrap();
        assert_eq!(head.method, "CONNECT");
        assert_eq!(&buf[..], b"extra");
    }

    #[tokio::test]
    async fn parses_a_response_head() {
        let raw = b"HTTP/1.1 403 Forbidden\r\ncontent-length: 6\r\n\r\ndenied";
        let mut reader = &raw[..];
        let mut buf = BytesMut::new();
        let head = read_response_head(&mut reader, &mut buf).await.unwrap();
        assert_eq!(head.status, StatusCode::FORBIDDEN);
        assert_eq!(head.content_length(), Some(6));
    }

    #[tokio::test]
    async fn writes_a_response_with_length() {
        let mut out = Vec::new();
        write_response(
            &mut out,
            StatusCode::OK,
            &[("content-type", "avro/json")],
            b"{}",
        )
        .await
        .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("content-type: avro/json\r\n"));
        assert!(text.ends_with("content-length: 2\r\n\r\n{}"));
    }
}
