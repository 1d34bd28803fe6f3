//! Transport-neutral HTTP types. A platform adapter owns the real server,
//! converts each request into a [`PendingRequest`] and queues it; the portal
//! drains the queue from the main loop and answers through the responder.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use crate::form::FormArgs;

pub type TransportError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub const CONTENT_TYPE_HTML: &str = "text/html; charset=utf-8";
pub const CONTENT_TYPE_TEXT: &str = "text/plain; charset=utf-8";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Other,
}

impl Method {
    pub fn parse(method: &str) -> Self {
        if method.eq_ignore_ascii_case("GET") {
            Self::Get
        } else if method.eq_ignore_ascii_case("POST") {
            Self::Post
        } else {
            Self::Other
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalRequest {
    pub method: Method,
    pub path: String,
    pub args: FormArgs,
}

impl PortalRequest {
    pub fn new(method: Method, path: impl Into<String>, args: FormArgs) -> Self {
        Self {
            method,
            path: path.into(),
            args,
        }
    }

    /// Splits a raw request target such as `/save?device_id=x` into its
    /// path and decodes the query together with `body`.
    pub fn from_target(method: Method, target: &str, body: &[u8]) -> Self {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (target, None),
        };
        Self::new(method, path, FormArgs::parse(query, body))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl PortalResponse {
    pub fn html(status: u16, body: String) -> Self {
        Self {
            status,
            content_type: CONTENT_TYPE_HTML,
            body,
        }
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: CONTENT_TYPE_TEXT,
            body: body.into(),
        }
    }

    pub fn not_found() -> Self {
        Self::text(404, "Not found")
    }
}

type Responder = Box<dyn FnOnce(PortalResponse) + Send + 'static>;

/// Raised by the transport once the client is no longer waiting, e.g. after
/// it was already answered with a timeout.
#[derive(Debug, Clone, Default)]
pub struct AbandonFlag(Arc<AtomicBool>);

impl AbandonFlag {
    pub fn abandon(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_abandoned(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A queued request and the one-shot channel back to the waiting client.
pub struct PendingRequest {
    pub request: PortalRequest,
    responder: Responder,
    abandoned: AbandonFlag,
}

impl PendingRequest {
    pub fn new<F>(request: PortalRequest, responder: F) -> Self
    where
        F: FnOnce(PortalResponse) + Send + 'static,
    {
        Self {
            request,
            responder: Box::new(responder),
            abandoned: AbandonFlag::default(),
        }
    }

    /// Handle the transport keeps to give up on this request later.
    pub fn abandon_flag(&self) -> AbandonFlag {
        self.abandoned.clone()
    }

    /// An abandoned request must not be acted on.
    pub fn is_abandoned(&self) -> bool {
        self.abandoned.is_abandoned()
    }

    pub fn respond(self, response: PortalResponse) {
        (self.responder)(response);
    }
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("request", &self.request)
            .field("abandoned", &self.is_abandoned())
            .finish_non_exhaustive()
    }
}

pub trait RequestQueue {
    /// Binds the listener and starts accepting requests.
    fn start(&mut self) -> Result<(), TransportError>;

    /// Next request already waiting, without blocking.
    fn try_next(&mut self) -> Option<PendingRequest>;
}

/// In-process queue; requests are pushed by hand and answers collected.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    started: bool,
    fail_start: bool,
    pending: std::collections::VecDeque<PendingRequest>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn set_fail_start(&mut self, fail: bool) {
        self.fail_start = fail;
    }

    pub fn push(&mut self, request: PendingRequest) {
        self.pending.push_back(request);
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl RequestQueue for MemoryQueue {
    fn start(&mut self) -> Result<(), TransportError> {
        if self.fail_start {
            return Err("listener unavailable".into());
        }
        self.started = true;
        Ok(())
    }

    fn try_next(&mut self) -> Option<PendingRequest> {
        self.pending.pop_front()
    }
}
