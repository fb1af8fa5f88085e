//! HTTP/1.1 wire handling.
//!
//! Request heads are parsed with `httparse` directly out of pool buffers;
//! body framing supports `Content-Length` and chunked transfer coding.
//! Responses are always framed with `Content-Length`. The byte-level
//! grammar of any upgraded sub-protocol is out of scope here — after a
//! `101` the connection hands raw bytes to the installed frame handler.

use bytes::BytesMut;
use chrono::Utc;

/// Upper bound on request-head header count.
pub const MAX_HEADERS: usize = 64;

/// Parse failure local to one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpError(pub String);

impl std::fmt::Display for HttpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for HttpError {}

/// Outcome of a request-head parse attempt.
#[derive(Debug)]
pub enum HeadParse {
    /// Head complete; `usize` is the number of bytes it consumed.
    Complete(RequestHead, usize),
    /// Not enough bytes yet.
    Partial,
}

/// Parsed request line and headers.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    /// Path portion of the request target, query string stripped.
    pub path: String,
    /// Decoded `key=value` pairs from the query string, in order.
    pub query: Vec<(String, String)>,
    /// 0 for HTTP/1.0, 1 for HTTP/1.1.
    pub minor_version: u8,
    /// Header name/value pairs in wire order.
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// First header value matching `name`, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// First query parameter named `name`.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Body framing declared by the head.
    pub fn body_framing(&self) -> Result<BodyFraming, HttpError> {
        if let Some(te) = self.header("transfer-encoding") {
            if te
                .split(',')
                .any(|t| t.trim().eq_ignore_ascii_case("chunked"))
            {
                return Ok(BodyFraming::Chunked);
            }
            return Err(HttpError(format!("unsupported transfer-encoding: {te}")));
        }
        match self.header("content-length") {
            Some(v) => {
                let len: usize = v
                    .trim()
                    .parse()
                    .map_err(|_| HttpError(format!("bad content-length: {v}")))?;
                Ok(BodyFraming::ContentLength(len))
            }
            None => Ok(BodyFraming::None),
        }
    }

    /// Whether the connection stays open after this exchange.
    pub fn keep_alive(&self) -> bool {
        let connection = self.header("connection").unwrap_or("");
        let close = connection
            .split(',')
            .any(|t| t.trim().eq_ignore_ascii_case("close"));
        if self.minor_version >= 1 {
            !close
        } else {
            connection
                .split(',')
                .any(|t| t.trim().eq_ignore_ascii_case("keep-alive"))
        }
    }

    /// Whether the head asks for a protocol upgrade.
    pub fn wants_upgrade(&self) -> bool {
        let connection = self.header("connection").unwrap_or("");
        connection
            .split(',')
            .any(|t| t.trim().eq_ignore_ascii_case("upgrade"))
            && self.header("upgrade").is_some()
    }
}

/// How the request body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    None,
    ContentLength(usize),
    Chunked,
}

/// Parse a request head from the front of `buf`.
pub fn parse_request_head(buf: &[u8]) -> Result<HeadParse, HttpError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    let consumed = match req.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return Ok(HeadParse::Partial),
        Err(e) => return Err(HttpError(format!("malformed request head: {e}"))),
    };

    let method = req.method.unwrap_or_default().to_string();
    let target = req.path.unwrap_or_default();
    let minor_version = req.version.unwrap_or(1) as u8;

    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p.to_string(), parse_query(q)),
        None => (target.to_string(), Vec::new()),
    };

    let headers = req
        .headers
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).into_owned(),
            )
        })
        .collect();

    Ok(HeadParse::Complete(
        RequestHead {
            method,
            path,
            query,
            minor_version,
            headers,
        },
        consumed,
    ))
}

fn parse_query(raw: &str) -> Vec<(String, String)> {
    raw.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

/// Incremental decoder for chunked transfer coding.
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: ChunkState,
    line: Vec<u8>,
}

#[derive(Debug)]
enum ChunkState {
    /// Reading a chunk-size line.
    Size,
    /// Reading chunk data.
    Data { remaining: usize },
    /// Expecting CRLF after chunk data; counts bytes matched.
    DataEnd { matched: usize },
    /// Reading trailer lines until the empty line.
    Trailer,
    Done,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self {
            state: ChunkState::Size,
            line: Vec::new(),
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, ChunkState::Done)
    }

    /// Feed wire bytes, appending decoded body bytes to `out`.
    ///
    /// Returns the number of input bytes consumed. Call until `is_done` or
    /// the input runs dry.
    pub fn feed(&mut self, input: &[u8], out: &mut BytesMut) -> Result<usize, HttpError> {
        let mut pos = 0;

        while pos < input.len() {
            match self.state {
                ChunkState::Size => {
                    match take_line(&mut self.line, &input[pos..]) {
                        Some(used) => {
                            pos += used;
                            let size = parse_chunk_size(&self.line)?;
                            self.line.clear();
                            self.state = if size == 0 {
                                ChunkState::Trailer
                            } else {
                                ChunkState::Data { remaining: size }
                            };
                        }
                        None => {
                            pos = input.len();
                        }
                    }
                }
                ChunkState::Data { remaining } => {
                    let take = remaining.min(input.len() - pos);
                    out.extend_from_slice(&input[pos..pos + take]);
                    pos += take;
                    if take == remaining {
                        self.state = ChunkState::DataEnd { matched: 0 };
                    } else {
                        self.state = ChunkState::Data {
                            remaining: remaining - take,
                        };
                    }
                }
                ChunkState::DataEnd { matched } => {
                    let expected = if matched == 0 { b'\r' } else { b'\n' };
                    if input[pos] != expected {
                        return Err(HttpError("missing CRLF after chunk data".into()));
                    }
                    pos += 1;
                    if matched == 1 {
                        self.state = ChunkState::Size;
                    } else {
                        self.state = ChunkState::DataEnd { matched: 1 };
                    }
                }
                ChunkState::Trailer => {
                    match take_line(&mut self.line, &input[pos..]) {
                        Some(used) => {
                            pos += used;
                            if self.line.is_empty() {
                                self.state = ChunkState::Done;
                                return Ok(pos);
                            }
                            self.line.clear();
                        }
                        None => {
                            pos = input.len();
                        }
                    }
                }
                ChunkState::Done => return Ok(pos),
            }
        }

        Ok(pos)
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Accumulate bytes into `line` until CRLF; returns input bytes used when a
/// full line landed (the CRLF is consumed but not stored).
fn take_line(line: &mut Vec<u8>, input: &[u8]) -> Option<usize> {
    for (i, &b) in input.iter().enumerate() {
        if b == b'\n' {
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return Some(i + 1);
        }
        line.push(b);
    }
    None
}

fn parse_chunk_size(line: &[u8]) -> Result<usize, HttpError> {
    let text = std::str::from_utf8(line).map_err(|_| HttpError("bad chunk-size line".into()))?;
    let size_part = text.split(';').next().unwrap_or("").trim();
    usize::from_str_radix(size_part, 16)
        .map_err(|_| HttpError(format!("bad chunk size: {size_part}")))
}

/// Response status line and headers.
///
/// Header keys are unique: setting an existing key replaces its value in
/// place, and insertion order is preserved on the wire.
#[derive(Debug)]
pub struct ResponseHead {
    pub status: u16,
    headers: Vec<(String, String)>,
}

impl ResponseHead {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
        }
    }

    /// Set a header, replacing any existing value for the key.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        for (k, v) in &mut self.headers {
            if k.eq_ignore_ascii_case(name) {
                *v = value;
                return;
            }
        }
        self.headers.push((name.to_string(), value));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Encode the head, filling in `Date`, `Content-Length` and
    /// `Connection` unless already set by the handler.
    pub fn encode(&self, body_len: usize, keep_alive: bool, out: &mut BytesMut) {
        out.extend_from_slice(b"HTTP/1.1 ");
        out.extend_from_slice(self.status.to_string().as_bytes());
        out.extend_from_slice(b" ");
        out.extend_from_slice(reason_phrase(self.status).as_bytes());
        out.extend_from_slice(b"\r\n");

        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }

        if self.get("date").is_none() {
            out.extend_from_slice(b"Date: ");
            out.extend_from_slice(http_date().as_bytes());
            out.extend_from_slice(b"\r\n");
        }

        let switching = self.status == 101;
        if !switching && self.status != 204 && self.get("content-length").is_none() {
            out.extend_from_slice(b"Content-Length: ");
            out.extend_from_slice(body_len.to_string().as_bytes());
            out.extend_from_slice(b"\r\n");
        }

        if self.get("connection").is_none() && !switching && !keep_alive {
            out.extend_from_slice(b"Connection: close\r\n");
        }

        out.extend_from_slice(b"\r\n");
    }
}

/// Reason phrase for the status codes this runtime emits.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// RFC 7231 format date for the `Date` header.
pub fn http_date() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_get() {
        let raw = b"GET /blocking?size=1024 HTTP/1.1\r\nHost: localhost\r\n\r\n";
        match parse_request_head(raw).unwrap() {
            HeadParse::Complete(head, consumed) => {
                assert_eq!(consumed, raw.len());
                assert_eq!(head.method, "GET");
                assert_eq!(head.path, "/blocking");
                assert_eq!(head.query_param("size"), Some("1024"));
                assert_eq!(head.header("host"), Some("localhost"));
                assert_eq!(head.minor_version, 1);
                assert!(head.keep_alive());
                assert_eq!(head.body_framing().unwrap(), BodyFraming::None);
            }
            HeadParse::Partial => panic!("expected complete head"),
        }
    }

    #[test]
    fn test_parse_partial_head() {
        let raw = b"GET /blocking HTTP/1.1\r\nHost: loc";
        assert!(matches!(
            parse_request_head(raw).unwrap(),
            HeadParse::Partial
        ));
    }

    #[test]
    fn test_parse_malformed_request_line() {
        let raw = b"GET\x01/ HTTP/1.1\r\n\r\n";
        assert!(parse_request_head(raw).is_err());
    }

    #[test]
    fn test_content_length_framing() {
        let raw = b"POST /blocking HTTP/1.1\r\nContent-Length: 2048\r\n\r\n";
        let HeadParse::Complete(head, _) = parse_request_head(raw).unwrap() else {
            panic!("expected complete head");
        };
        assert_eq!(head.body_framing().unwrap(), BodyFraming::ContentLength(2048));
    }

    #[test]
    fn test_bad_content_length_rejected() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: two\r\n\r\n";
        let HeadParse::Complete(head, _) = parse_request_head(raw).unwrap() else {
            panic!("expected complete head");
        };
        assert!(head.body_framing().is_err());
    }

    #[test]
    fn test_connection_close() {
        let raw = b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n";
        let HeadParse::Complete(head, _) = parse_request_head(raw).unwrap() else {
            panic!("expected complete head");
        };
        assert!(!head.keep_alive());
    }

    #[test]
    fn test_http10_defaults_to_close() {
        let raw = b"GET / HTTP/1.0\r\n\r\n";
        let HeadParse::Complete(head, _) = parse_request_head(raw).unwrap() else {
            panic!("expected complete head");
        };
        assert_eq!(head.minor_version, 0);
        assert!(!head.keep_alive());
    }

    #[test]
    fn test_upgrade_detection() {
        let raw =
            b"GET /ws HTTP/1.1\r\nConnection: keep-alive, Upgrade\r\nUpgrade: websocket\r\n\r\n";
        let HeadParse::Complete(head, _) = parse_request_head(raw).unwrap() else {
            panic!("expected complete head");
        };
        assert!(head.wants_upgrade());
    }

    #[test]
    fn test_chunked_decoder_single_feed() {
        let mut decoder = ChunkedDecoder::new();
        let mut out = BytesMut::new();
        let wire = b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";

        let used = decoder.feed(wire, &mut out).unwrap();
        assert_eq!(used, wire.len());
        assert!(decoder.is_done());
        assert_eq!(&out[..], b"hello world");
    }

    #[test]
    fn test_chunked_decoder_byte_by_byte() {
        let mut decoder = ChunkedDecoder::new();
        let mut out = BytesMut::new();
        let wire = b"4\r\nwiki\r\n5\r\npedia\r\n0\r\n\r\n";

        for &b in wire.iter() {
            decoder.feed(&[b], &mut out).unwrap();
        }
        assert!(decoder.is_done());
        assert_eq!(&out[..], b"wikipedia");
    }

    #[test]
    fn test_chunked_decoder_extension_and_trailer() {
        let mut decoder = ChunkedDecoder::new();
        let mut out = BytesMut::new();
        let wire = b"3;ext=1\r\nabc\r\n0\r\nExpires: never\r\n\r\n";

        let used = decoder.feed(wire, &mut out).unwrap();
        assert_eq!(used, wire.len());
        assert!(decoder.is_done());
        assert_eq!(&out[..], b"abc");
    }

    #[test]
    fn test_chunked_decoder_bad_size() {
        let mut decoder = ChunkedDecoder::new();
        let mut out = BytesMut::new();
        assert!(decoder.feed(b"zz\r\n", &mut out).is_err());
    }

    #[test]
    fn test_response_head_unique_ordered() {
        let mut head = ResponseHead::new(200);
        head.set("Content-Type", "text/plain");
        head.set("X-First", "1");
        head.set("content-type", "application/octet-stream");

        assert_eq!(head.get("Content-Type"), Some("application/octet-stream"));

        let mut out = BytesMut::new();
        head.encode(4, true, &mut out);
        let text = std::str::from_utf8(&out).unwrap();

        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        // Replacement kept the original position, before X-First.
        let ct = text.find("Content-Type: application/octet-stream").unwrap();
        let xf = text.find("X-First: 1").unwrap();
        assert!(ct < xf);
        assert!(text.contains("Content-Length: 4\r\n"));
        assert!(text.contains("Date: "));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_response_head_close_header() {
        let mut out = BytesMut::new();
        ResponseHead::new(200).encode(0, false, &mut out);
        let text = std::str::from_utf8(&out).unwrap();
        assert!(text.contains("Connection: close\r\n"));
    }

    #[test]
    fn test_switching_protocols_has_no_length() {
        let mut head = ResponseHead::new(101);
        head.set("Upgrade", "websocket");
        head.set("Connection", "Upgrade");
        let mut out = BytesMut::new();
        head.encode(0, true, &mut out);
        let text = std::str::from_utf8(&out).unwrap();
        assert!(!text.contains("Content-Length"));
        assert!(text.contains("Upgrade: websocket"));
    }
}
