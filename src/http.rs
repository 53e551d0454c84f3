// SPDX-FileCopyrightText: 2025 The seedgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Just enough HTTP/1.x for serving uploads: reading a request head and
//! writing a response head.

use crate::errors::RequestError;

use std::fmt::Write as _;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAX_HEAD_BYTES: usize = 8 * 1024;
pub const MAX_HEADERS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: Method,
    pub target: String,
    pub version: Version,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether the peer asked us to close once this response is done.
    pub fn wants_close(&self) -> bool {
        match (self.version, self.header("Connection")) {
            (_, Some(v)) if v.eq_ignore_ascii_case("close") => true,
            (Version::Http10, Some(v)) => !v.eq_ignore_ascii_case("keep-alive"),
            (Version::Http10, None) => true,
            (Version::Http11, _) => false,
        }
    }

    pub fn range(&self) -> Result<Option<RangeSpec>, RequestError> {
        self.header("Range").map(RangeSpec::parse).transpose()
    }
}

/// A single `bytes=` range as sent by the peer, before it is applied to a
/// file size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    FromTo(u64, u64),
    From(u64),
    Suffix(u64),
}

impl RangeSpec {
    /// Parses `bytes=a-b`, `bytes=a-` or `bytes=-n`. Only the first range of
    /// a multi-range request is honoured.
    pub fn parse(value: &str) -> Result<Self, RequestError> {
        let bad = || RequestError::Range(value.to_string());
        let value = value.trim();
        let spec = value
            .get(..6)
            .filter(|unit| unit.eq_ignore_ascii_case("bytes="))
            .map(|_| &value[6..])
            .ok_or_else(bad)?;
        let first = spec.split(',').next().unwrap_or_default().trim();
        let (start, end) = first.split_once('-').ok_or_else(bad)?;
        let (start, end) = (start.trim(), end.trim());

        match (start.is_empty(), end.is_empty()) {
            (true, false) => Ok(RangeSpec::Suffix(end.parse().map_err(|_| bad())?)),
            (false, true) => Ok(RangeSpec::From(start.parse().map_err(|_| bad())?)),
            (false, false) => {
                let a: u64 = start.parse().map_err(|_| bad())?;
                let b: u64 = end.parse().map_err(|_| bad())?;
                if b < a {
                    return Err(bad());
                }
                Ok(RangeSpec::FromTo(a, b))
            }
            (true, true) => Err(bad()),
        }
    }

    /// Half-open `[begin, end)` within a file of `size` bytes, or `None` if
    /// nothing of the range lies inside the file.
    pub fn resolve(self, size: u64) -> Option<(u64, u64)> {
        match self {
            RangeSpec::FromTo(a, b) if a < size => Some((a, b.saturating_add(1).min(size))),
            RangeSpec::From(a) if a < size => Some((a, size)),
            RangeSpec::Suffix(n) if n > 0 && size > 0 => Some((size - n.min(size), size)),
            _ => None,
        }
    }
}

async fn read_line<R>(reader: &mut R, budget: &mut usize) -> Result<Option<String>, RequestError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let n = (&mut *reader)
        .take(*budget as u64 + 1)
        .read_until(b'\n', &mut line)
        .await?;
    if n == 0 {
        return Ok(None);
    }
    if n > *budget {
        return Err(RequestError::TooLarge);
    }
    *budget -= n;
    if line.last() != Some(&b'\n') {
        return Err(RequestError::Truncated);
    }
    while matches!(line.last(), Some(b'\n') | Some(b'\r')) {
        line.pop();
    }
    String::from_utf8(line)
        .map(Some)
        .map_err(|_| RequestError::Header)
}

/// Reads one request head. `Ok(None)` means the peer closed the connection
/// cleanly between requests.
pub async fn read_request_head<R>(reader: &mut R) -> Result<Option<RequestHead>, RequestError>
where
    R: AsyncBufRead + Unpin,
{
    let mut budget = MAX_HEAD_BYTES;

    // Stray blank lines between pipelined requests are allowed.
    let request_line = loop {
        match read_line(reader, &mut budget).await? {
            None => return Ok(None),
            Some(line) if line.is_empty() => continue,
            Some(line) => break line,
        }
    };

    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(RequestError::RequestLine(request_line.clone()));
    };

    let method = match method {
        "GET" => Method::Get,
        "HEAD" => Method::Head,
        other => return Err(RequestError::Method(other.to_string())),
    };
    let version = match version {
        "HTTP/1.1" => Version::Http11,
        "HTTP/1.0" => Version::Http10,
        _ => return Err(RequestError::RequestLine(request_line.clone())),
    };
    let target = target.to_string();

    let mut headers = Vec::new();
    loop {
        let line = read_line(reader, &mut budget)
            .await?
            .ok_or(RequestError::Truncated)?;
        if line.is_empty() {
            break;
        }
        if headers.len() == MAX_HEADERS {
            return Err(RequestError::TooLarge);
        }
        let (name, value) = line.split_once(':').ok_or(RequestError::Header)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(RequestError::Header);
        }
        headers.push((name.to_string(), value.trim().to_string()));
    }

    Ok(Some(RequestHead {
        method,
        target,
        version,
        headers,
    }))
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        202 => "Accepted",
        206 => "Partial Content",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        410 => "Gone",
        416 => "Requested Range Not Satisfiable",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
        }
    }

    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn encode(&self) -> String {
        let mut out = format!("HTTP/1.1 {} {}\r\n", self.status, reason_phrase(self.status));
        for (name, value) in &self.headers {
            let _ = write!(out, "{}: {}\r\n", name, value);
        }
        out.push_str("\r\n");
        out
    }

    pub async fn write_to<W>(&self, writer: &mut W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(self.encode().as_bytes()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    async fn parse(raw: &str) -> Result<Option<RequestHead>, RequestError> {
        let mut reader = BufReader::new(raw.as_bytes());
        read_request_head(&mut reader).await
    }

    #[tokio::test]
    async fn test_reads_get_with_headers() {
        let head = parse("GET /get/1/a.txt HTTP/1.1\r\nRange: bytes=0-99\r\nUser-Agent: LimeWire\r\n\r\n")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(head.method, Method::Get);
        assert_eq!(head.target, "/get/1/a.txt");
        assert_eq!(head.version, Version::Http11);
        assert_eq!(head.header("user-agent"), Some("LimeWire"));
        assert_eq!(head.range().unwrap(), Some(RangeSpec::FromTo(0, 99)));
        assert!(!head.wants_close());
    }

    #[tokio::test]
    async fn test_two_requests_on_one_stream() {
        let raw = "HEAD /a HTTP/1.0\r\n\r\n\r\nGET /b HTTP/1.1\r\nConnection: close\r\n\r\n";
        let mut reader = BufReader::new(raw.as_bytes());

        let first = read_request_head(&mut reader).await.unwrap().unwrap();
        assert_eq!(first.method, Method::Head);
        assert!(first.wants_close());

        let second = read_request_head(&mut reader).await.unwrap().unwrap();
        assert_eq!(second.target, "/b");
        assert!(second.wants_close());

        assert!(read_request_head(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejects_bad_heads() {
        assert!(matches!(
            parse("POST / HTTP/1.1\r\n\r\n").await,
            Err(RequestError::Method(m)) if m == "POST"
        ));
        assert!(matches!(
            parse("GET /\r\n\r\n").await,
            Err(RequestError::RequestLine(_))
        ));
        assert!(matches!(
            parse("GET / HTTP/1.1\r\nno colon here\r\n\r\n").await,
            Err(RequestError::Header)
        ));
        assert!(matches!(
            parse("GET / HTTP/1.1\r\nHost: x\r\n").await,
            Err(RequestError::Truncated)
        ));
        let huge = format!("GET / HTTP/1.1\r\nX-Pad: {}\r\n\r\n", "a".repeat(MAX_HEAD_BYTES));
        assert!(matches!(parse(&huge).await, Err(RequestError::TooLarge)));
    }

    #[test]
    fn test_range_forms() {
        assert_eq!(RangeSpec::parse("bytes=5-").unwrap(), RangeSpec::From(5));
        assert_eq!(RangeSpec::parse("bytes=-100").unwrap(), RangeSpec::Suffix(100));
        assert_eq!(
            RangeSpec::parse("BYTES=1-2, 7-9").unwrap(),
            RangeSpec::FromTo(1, 2)
        );
        assert!(RangeSpec::parse("bytes=9-1").is_err());
        assert!(RangeSpec::parse("items=0-1").is_err());
        assert!(RangeSpec::parse("bytes=-").is_err());
    }

    #[test]
    fn test_range_resolution_against_size() {
        assert_eq!(RangeSpec::FromTo(0, 99).resolve(50), Some((0, 50)));
        assert_eq!(RangeSpec::FromTo(1000, 1999).resolve(5000), Some((1000, 2000)));
        assert_eq!(RangeSpec::From(10).resolve(10), None);
        assert_eq!(RangeSpec::Suffix(20).resolve(100), Some((80, 100)));
        assert_eq!(RangeSpec::Suffix(500).resolve(100), Some((0, 100)));
    }

    #[test]
    fn test_response_head_encoding() {
        let head = ResponseHead::new(503)
            .with("X-Queue", "position=2, pollMin=45, pollMax=120")
            .with("Content-Length", "0");
        assert_eq!(
            head.encode(),
            "HTTP/1.1 503 Service Unavailable\r\nX-Queue: position=2, pollMin=45, pollMax=120\r\nContent-Length: 0\r\n\r\n"
        );
        assert_eq!(head.header("content-length"), Some("0"));
    }
}
