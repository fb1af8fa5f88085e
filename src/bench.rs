//! Load-generation harness.
//!
//! A deliberately simple blocking HTTP/1.1 client used by the benchmark
//! driver and the end-to-end tests. Connection reuse is off by default so
//! every request pays full connection setup, mirroring how the server is
//! load-tested for accept-path cost; flip it on to measure keep-alive
//! throughput instead.

#![allow(dead_code)] // harness surface; driven by the end-to-end tests

use crate::error::HandlerError;
use crate::exchange::Exchange;
use crate::handler::{Handler, Router};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;
use tracing::debug;

/// Reference routes with the classic benchmark semantics.
///
/// Both intentionally block (buffered body work), so they exercise the
/// offload path end to end:
/// - `GET /blocking?size=N` answers N bytes of value 1
/// - `POST /blocking` answers the decimal byte count of the request body
pub fn benchmark_routes() -> Router {
    Router::new()
        .get("/blocking", Handler::blocking(get_sized_body))
        .post("/blocking", Handler::blocking(post_body_length))
}

fn get_sized_body(exchange: &mut Exchange) -> Result<(), HandlerError> {
    let size: usize = exchange
        .query_param("size")
        .ok_or("missing size parameter")?
        .parse()
        .map_err(|_| "size parameter is not a number")?;

    exchange.set_header("Content-Type", "application/octet-stream");
    exchange.set_header("Content-Length", size.to_string());
    exchange.write(&vec![1u8; size]);
    Ok(())
}

fn post_body_length(exchange: &mut Exchange) -> Result<(), HandlerError> {
    let length = exchange.body().len().to_string();
    exchange.set_header("Content-Type", "text/plain");
    exchange.set_header("Content-Length", length.len().to_string());
    exchange.send(&length);
    Ok(())
}

/// A parsed response as the harness sees it.
#[derive(Debug)]
pub struct SimpleResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Total wire bytes of the response.
    pub wire_len: u64,
}

impl SimpleResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Aggregate outcome of a load run.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoadReport {
    pub requests: usize,
    pub ok: usize,
    pub errors: usize,
    /// Response wire bytes received across all requests.
    pub bytes_in: u64,
}

/// Blocking HTTP/1.1 load client.
#[derive(Debug, Clone)]
pub struct LoadClient {
    addr: SocketAddr,
    reuse_connections: bool,
    concurrency: usize,
}

impl LoadClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            reuse_connections: false,
            concurrency: 1,
        }
    }

    /// Reuse one connection per worker instead of one per request.
    pub fn with_reuse(mut self, reuse: bool) -> Self {
        self.reuse_connections = reuse;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Issue `requests` identical requests and aggregate the outcome.
    pub fn run(&self, method: &str, target: &str, body: &[u8], requests: usize) -> LoadReport {
        let workers = self.concurrency.min(requests.max(1));
        let per_worker = requests / workers;
        let remainder = requests % workers;

        let mut report = LoadReport {
            requests,
            ..LoadReport::default()
        };

        std::thread::scope(|scope| {
            let mut joins = Vec::with_capacity(workers);
            for worker in 0..workers {
                let count = per_worker + usize::from(worker < remainder);
                joins.push(scope.spawn(move || self.run_worker(method, target, body, count)));
            }
            for join in joins {
                let partial = join.join().unwrap_or_default();
                report.ok += partial.ok;
                report.errors += partial.errors;
                report.bytes_in += partial.bytes_in;
            }
        });

        report
    }

    fn run_worker(&self, method: &str, target: &str, body: &[u8], count: usize) -> LoadReport {
        let mut report = LoadReport::default();
        let mut stream: Option<TcpStream> = None;

        for _ in 0..count {
            let outcome = if self.reuse_connections {
                let connected = match stream.take() {
                    Some(s) => Ok(s),
                    None => connect(self.addr),
                };
                connected.and_then(|mut s| {
                    let response = exchange_once(&mut s, method, target, body, false)?;
                    stream = Some(s);
                    Ok(response)
                })
            } else {
                connect(self.addr)
                    .and_then(|mut s| exchange_once(&mut s, method, target, body, true))
            };

            match outcome {
                Ok(response) => {
                    report.bytes_in += response.wire_len;
                    if response.status < 400 {
                        report.ok += 1;
                    } else {
                        report.errors += 1;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "request failed");
                    report.errors += 1;
                    stream = None;
                }
            }
        }

        report
    }
}

fn connect(addr: SocketAddr) -> io::Result<TcpStream> {
    let stream = TcpStream::connect(addr)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;
    Ok(stream)
}

/// Send one request and read one response off `stream`.
pub fn exchange_once(
    stream: &mut TcpStream,
    method: &str,
    target: &str,
    body: &[u8],
    close: bool,
) -> io::Result<SimpleResponse> {
    let mut request = format!("{method} {target} HTTP/1.1\r\nHost: bench\r\n");
    if !body.is_empty() {
        request.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    if close {
        // Persistent connections disabled: one connection per request.
        request.push_str("Connection: close\r\n");
    }
    request.push_str("\r\n");

    stream.write_all(request.as_bytes())?;
    stream.write_all(body)?;
    read_response(stream)
}

/// Read and parse one HTTP/1.1 response.
pub fn read_response(stream: &mut TcpStream) -> io::Result<SimpleResponse> {
    let mut raw = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];

    // Read until the head terminator.
    let head_end = loop {
        if let Some(pos) = find_head_end(&raw) {
            break pos;
        }
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before response head",
            ));
        }
        raw.extend_from_slice(&chunk[..n]);
    };

    let mut header_storage = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Response::new(&mut header_storage);
    match parsed.parse(&raw[..head_end]) {
        Ok(httparse::Status::Complete(_)) => {}
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unparseable response head",
            ))
        }
    }

    let status = parsed.code.unwrap_or(0);
    let headers: Vec<(String, String)> = parsed
        .headers
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).into_owned(),
            )
        })
        .collect();

    let content_length: usize = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse().ok())
        .unwrap_or(0);

    let mut body = raw[head_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid-body",
            ));
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    Ok(SimpleResponse {
        status,
        headers,
        body,
        wire_len: (head_end + content_length) as u64,
    })
}

fn find_head_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_head_end() {
        assert_eq!(find_head_end(b"HTTP/1.1 200 OK\r\n\r\nbody"), Some(19));
        assert_eq!(find_head_end(b"HTTP/1.1 200 OK\r\n"), None);
    }

    #[test]
    fn test_benchmark_routes_registered() {
        let routes = benchmark_routes();
        assert!(matches!(
            routes.lookup("GET", "/blocking"),
            Some(Handler::Blocking(_))
        ));
        assert!(matches!(
            routes.lookup("POST", "/blocking"),
            Some(Handler::Blocking(_))
        ));
    }

    #[test]
    fn test_get_sized_body_semantics() {
        let raw = b"GET /blocking?size=16 HTTP/1.1\r\n\r\n";
        let crate::http::HeadParse::Complete(head, _) =
            crate::http::parse_request_head(raw).unwrap()
        else {
            panic!("expected complete head");
        };
        let mut exchange = Exchange::new(
            head,
            bytes::Bytes::new(),
            "127.0.0.1:50000".parse().unwrap(),
            bytes::BytesMut::new(),
        );

        get_sized_body(&mut exchange).unwrap();
        let (response, out, _) = exchange.take_parts();
        assert_eq!(response.get("content-length"), Some("16"));
        assert_eq!(response.get("content-type"), Some("application/octet-stream"));
        assert_eq!(out.len(), 16);
        assert!(out.iter().all(|&b| b == 1));
    }

    #[test]
    fn test_post_body_length_semantics() {
        let raw = b"POST /blocking HTTP/1.1\r\nContent-Length: 2048\r\n\r\n";
        let crate::http::HeadParse::Complete(head, _) =
            crate::http::parse_request_head(raw).unwrap()
        else {
            panic!("expected complete head");
        };
        let mut exchange = Exchange::new(
            head,
            bytes::Bytes::from(vec![7u8; 2048]),
            "127.0.0.1:50000".parse().unwrap(),
            bytes::BytesMut::new(),
        );

        post_body_length(&mut exchange).unwrap();
        let (response, out, _) = exchange.take_parts();
        assert_eq!(&out[..], b"2048");
        assert_eq!(response.get("content-type"), Some("text/plain"));
    }
}
