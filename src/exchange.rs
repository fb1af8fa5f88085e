//! One request/response cycle over a connection.
//!
//! An [`Exchange`] is created when the request head parses and destroyed
//! when the response is fully flushed or the connection resets. It owns
//! everything the handler touches, so it can be moved whole from an I/O
//! thread onto a task thread and back without shared mutable state.

use crate::handler::FrameHandler;
use crate::http::{RequestHead, ResponseHead};
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;

/// Owned state of a single request/response cycle.
pub struct Exchange {
    head: RequestHead,
    body: Bytes,
    peer: SocketAddr,
    response: ResponseHead,
    out: BytesMut,
    upgrade: Option<Box<dyn FrameHandler>>,
}

impl Exchange {
    pub(crate) fn new(head: RequestHead, body: Bytes, peer: SocketAddr, out: BytesMut) -> Self {
        Self {
            head,
            body,
            peer,
            response: ResponseHead::new(200),
            out,
            upgrade: None,
        }
    }

    pub fn method(&self) -> &str {
        &self.head.method
    }

    pub fn path(&self) -> &str {
        &self.head.path
    }

    /// First query parameter named `name`.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.head.query_param(name)
    }

    /// First request header matching `name`, case-insensitively.
    #[allow(dead_code)] // handler surface; the built-in routes don't read headers
    pub fn request_header(&self, name: &str) -> Option<&str> {
        self.head.header(name)
    }

    /// Complete request body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Set the response status code.
    pub fn set_status(&mut self, status: u16) {
        self.response.status = status;
    }

    pub fn status(&self) -> u16 {
        self.response.status
    }

    /// Set a response header. Keys are unique; setting an existing key
    /// replaces its value in place.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.response.set(name, value);
    }

    /// Append bytes to the response body.
    pub fn write(&mut self, bytes: &[u8]) {
        self.out.extend_from_slice(bytes);
    }

    /// Append a string to the response body.
    pub fn send(&mut self, text: &str) {
        self.out.extend_from_slice(text.as_bytes());
    }

    /// Complete this exchange with a `101 Switching Protocols` response and
    /// hand the connection's bytes to `proto` once the response flushes.
    ///
    /// `protocol` becomes the `Upgrade` response header.
    pub fn upgrade(&mut self, protocol: &str, proto: Box<dyn FrameHandler>) {
        self.response.status = 101;
        self.response.set("Upgrade", protocol);
        self.response.set("Connection", "Upgrade");
        self.upgrade = Some(proto);
    }

    pub(crate) fn take_parts(self) -> (ResponseHead, BytesMut, Option<Box<dyn FrameHandler>>) {
        (self.response, self.out, self.upgrade)
    }
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("method", &self.head.method)
            .field("path", &self.head.path)
            .field("peer", &self.peer)
            .field("status", &self.response.status)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{parse_request_head, HeadParse};

    fn test_exchange(raw: &[u8], body: &[u8]) -> Exchange {
        let HeadParse::Complete(head, _) = parse_request_head(raw).unwrap() else {
            panic!("expected complete head");
        };
        Exchange::new(
            head,
            Bytes::copy_from_slice(body),
            "127.0.0.1:40000".parse().unwrap(),
            BytesMut::new(),
        )
    }

    #[test]
    fn test_request_accessors() {
        let ex = test_exchange(
            b"GET /blocking?size=64 HTTP/1.1\r\nHost: localhost\r\n\r\n",
            b"",
        );
        assert_eq!(ex.method(), "GET");
        assert_eq!(ex.path(), "/blocking");
        assert_eq!(ex.query_param("size"), Some("64"));
        assert_eq!(ex.request_header("HOST"), Some("localhost"));
        assert_eq!(ex.status(), 200);
    }

    #[test]
    fn test_response_assembly() {
        let mut ex = test_exchange(b"POST /blocking HTTP/1.1\r\n\r\n", b"abcd");
        assert_eq!(ex.body(), b"abcd");

        ex.set_status(201);
        ex.set_header("Content-Type", "text/plain");
        ex.send("4");

        let (response, out, upgrade) = ex.take_parts();
        assert_eq!(response.status, 201);
        assert_eq!(response.get("content-type"), Some("text/plain"));
        assert_eq!(&out[..], b"4");
        assert!(upgrade.is_none());
    }
}
