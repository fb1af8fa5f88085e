//! Handler types and routing.
//!
//! A handler's blocking capability is part of its registration, not a
//! runtime property: the router stores a tagged [`Handler`] and the
//! listener dispatches on the tag without inspecting the handler itself.

use crate::error::HandlerError;
use crate::exchange::Exchange;
use bytes::BytesMut;
use std::sync::Arc;

/// Application request handler.
pub trait HttpHandler: Send + Sync {
    fn handle(&self, exchange: &mut Exchange) -> Result<(), HandlerError>;
}

impl<F> HttpHandler for F
where
    F: Fn(&mut Exchange) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, exchange: &mut Exchange) -> Result<(), HandlerError> {
        self(exchange)
    }
}

/// A registered handler and its dispatch capability.
///
/// `Direct` runs on the connection's I/O thread and must never block;
/// `Blocking` is resubmitted onto the task pool before it runs.
#[derive(Clone)]
pub enum Handler {
    Direct(Arc<dyn HttpHandler>),
    Blocking(Arc<dyn HttpHandler>),
}

impl Handler {
    pub fn direct(handler: impl HttpHandler + 'static) -> Self {
        Handler::Direct(Arc::new(handler))
    }

    pub fn blocking(handler: impl HttpHandler + 'static) -> Self {
        Handler::Blocking(Arc::new(handler))
    }
}

/// Collaborator that takes over a connection after a `101` response.
///
/// The runtime feeds it raw bytes as they arrive and writes back whatever
/// it produces; the sub-protocol's framing lives entirely behind this
/// trait.
pub trait FrameHandler: Send {
    /// Process incoming bytes, appending any output frames to `out`.
    ///
    /// Return `false` to close the connection once `out` is flushed.
    fn on_bytes(&mut self, input: &[u8], out: &mut BytesMut) -> bool;
}

/// Method + path routing table.
#[derive(Default)]
pub struct Router {
    routes: Vec<(String, String, Handler)>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `method` + `path`. Later registrations win.
    pub fn route(mut self, method: &str, path: &str, handler: Handler) -> Self {
        self.routes
            .insert(0, (method.to_ascii_uppercase(), path.to_string(), handler));
        self
    }

    pub fn get(self, path: &str, handler: Handler) -> Self {
        self.route("GET", path, handler)
    }

    pub fn post(self, path: &str, handler: Handler) -> Self {
        self.route("POST", path, handler)
    }

    /// Look up the handler for a request.
    pub fn lookup(&self, method: &str, path: &str) -> Option<&Handler> {
        self.routes
            .iter()
            .find(|(m, p, _)| m == method && p == path)
            .map(|(_, _, h)| h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_handler(_: &mut Exchange) -> Result<(), HandlerError> {
        Ok(())
    }

    #[test]
    fn test_lookup_by_method_and_path() {
        let router = Router::new()
            .get("/blocking", Handler::blocking(ok_handler))
            .post("/blocking", Handler::blocking(ok_handler))
            .get("/health", Handler::direct(ok_handler));

        assert!(matches!(
            router.lookup("GET", "/blocking"),
            Some(Handler::Blocking(_))
        ));
        assert!(matches!(
            router.lookup("GET", "/health"),
            Some(Handler::Direct(_))
        ));
        assert!(router.lookup("DELETE", "/blocking").is_none());
        assert!(router.lookup("GET", "/missing").is_none());
    }

    #[test]
    fn test_later_registration_wins() {
        fn teapot(ex: &mut Exchange) -> Result<(), HandlerError> {
            ex.set_status(418);
            Ok(())
        }

        let router = Router::new()
            .get("/", Handler::direct(ok_handler))
            .get("/", Handler::direct(teapot));

        let Some(Handler::Direct(handler)) = router.lookup("GET", "/") else {
            panic!("expected direct handler");
        };

        let mut ex = crate::exchange::Exchange::new(
            match crate::http::parse_request_head(b"GET / HTTP/1.1\r\n\r\n").unwrap() {
                crate::http::HeadParse::Complete(head, _) => head,
                _ => panic!("expected complete head"),
            },
            bytes::Bytes::new(),
            "127.0.0.1:9000".parse().unwrap(),
            BytesMut::new(),
        );
        handler.handle(&mut ex).unwrap();
        assert_eq!(ex.status(), 418);
    }
}
