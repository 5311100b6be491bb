use super::HandlerRef;
use crate::{
    message::{make_request, make_response, Address, Message, Request, Response, CONTENT_TYPE_MANSCDP},
    observer::Observer,
    server::Server,
    transaction::{make_via_branch, Transaction},
    Error, Result,
};
use rsip::{
    headers::UntypedHeader,
    prelude::{HeadersExt, ToTypedHeader},
    Method, StatusCode,
};
use std::{any::Any, collections::HashMap, net::SocketAddr, sync::Arc};
use tracing::{info_span, warn, Span};

const DEFAULT_SIP_PORT: u16 = 5060;

/// Execution environment of one inbound request.
///
/// Handlers run in registration order. Any of them may [`Context::abort`]
/// to keep the rest of the chain from running.
pub struct Context {
    pub request: Request,
    pub tx: Arc<Transaction>,
    /// User part of the From URI.
    pub device_id: String,
    /// Sent-by host and port of the top Via.
    pub host: String,
    pub port: u16,
    pub source: SocketAddr,
    /// The requesting device, target of requests sent back to it.
    pub to: Address,
    /// This server's identity.
    pub from: Address,
    handlers: Vec<HandlerRef>,
    index: usize,
    aborted: bool,
    values: HashMap<String, Box<dyn Any + Send + Sync>>,
    span: Span,
    server: Server,
}

impl Context {
    /// Fails when From, its user part, Via or the source address is missing.
    pub fn new(
        request: Request,
        tx: Arc<Transaction>,
        handlers: Vec<HandlerRef>,
        server: Server,
    ) -> Result<Self> {
        let from_header = request
            .inner
            .from_header()
            .map_err(|e| Error::ContextError(format!("from header: {}", e)))?
            .typed()
            .map_err(|e| Error::ContextError(format!("from header: {}", e)))?;
        let to = Address::from(from_header).without_tag();
        let device_id = to
            .user()
            .ok_or_else(|| Error::ContextError("address user is empty".to_string()))?
            .to_string();

        let via = request
            .top_via()
            .ok_or_else(|| Error::ContextError("via is missing".to_string()))?;
        let host = via.uri.host_with_port.host.to_string();
        let port = via
            .uri
            .host_with_port
            .port
            .as_ref()
            .map(|p| *p.value())
            .unwrap_or(DEFAULT_SIP_PORT);
        let source = request
            .source
            .ok_or_else(|| Error::ContextError("source is missing".to_string()))?;

        let span = info_span!(
            "request",
            device_id = %device_id,
            host = %host,
            method = %request.inner.method,
        );
        Ok(Context {
            request,
            tx,
            device_id,
            host,
            port,
            source,
            to,
            from: server.identity().clone(),
            handlers,
            index: 0,
            aborted: false,
            values: HashMap::new(),
            span,
            server,
        })
    }

    /// Runs the remaining handlers in order, stopping once aborted.
    ///
    /// A handler calling `next` itself runs the rest of the chain before
    /// continuing; they are not run twice.
    pub async fn next(&mut self) {
        while !self.aborted && self.index < self.handlers.len() {
            let handler = self.handlers[self.index].clone();
            self.index += 1;
            handler.call(self).await;
        }
    }

    pub fn abort(&mut self) {
        self.aborted = true;
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    pub fn observer(&self) -> &Observer {
        self.server.observer()
    }

    /// First value of header `name`.
    pub fn header(&self, name: &str) -> Option<String> {
        self.request.header_value(name)
    }

    pub async fn respond(&self, resp: Response) -> Result<()> {
        self.tx.respond(resp).await
    }

    /// Answers the request with `status` and `reason`.
    pub async fn string(&self, status: StatusCode, reason: &str) {
        let resp = make_response(&self.request, status, Some(reason), None);
        if let Err(e) = self.tx.respond(resp).await {
            warn!(parent: &self.span, "respond failed: {}", e);
        }
    }

    pub async fn abort_string(&mut self, status: StatusCode, reason: &str) {
        self.abort();
        self.string(status, reason).await;
    }

    pub fn set<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.values.insert(key.into(), Box::new(value));
    }

    /// Value stored under `key`, if present with type `T`.
    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.values.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    /// Like [`Context::get`], falling back to `T::default()`.
    pub fn get_or_default<T: Any + Clone + Default>(&self, key: &str) -> T {
        self.get::<T>(key).cloned().unwrap_or_default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.values.remove(key).is_some()
    }

    /// Sends a new request with a MANSCDP body to the requesting device.
    ///
    /// The request reuses this exchange's connection and device address,
    /// carries a fresh branch and goes through [`Server::request`].
    pub async fn send_request(&self, method: Method, body: Vec<u8>) -> Result<Arc<Transaction>> {
        let connection = self.tx.connection().clone();
        let sent_by = SocketAddr::new(self.server.host(), connection.get_addr().addr.port());
        let via = rsip::headers::Via::new(format!(
            "SIP/2.0/{} {}{}",
            connection.transport(),
            sent_by,
            make_via_branch()
        ));
        let mut req = make_request(method, self.to.uri.clone(), via, &self.from, &self.to, 1);
        req.set_content_type(CONTENT_TYPE_MANSCDP);
        req.set_body(body);
        req.destination = Some(self.source);
        req.connection = Some(connection);
        self.server.request(req).await
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("method", &self.request.inner.method)
            .field("device_id", &self.device_id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("source", &self.source)
            .field("index", &self.index)
            .field("aborted", &self.aborted)
            .finish()
    }
}
