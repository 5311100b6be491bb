//! Messages as they travel through the engine.
//!
//! [`Request`] and [`Response`] wrap the `rsip` representation together with
//! the transport metadata the engine needs: where the message came from,
//! where it goes and which connection carries it.
use crate::transport::SipConnection;
use rsip::{prelude::ToTypedHeader, Header, StatusCodeKind};
use std::{fmt, net::SocketAddr};

pub mod address;
pub mod builder;
pub mod parser;

pub use address::Address;
pub use builder::{make_ack, make_request, make_response};
pub use parser::{Packet, Parser};

/// Body type of device control and query commands.
pub const CONTENT_TYPE_MANSCDP: &str = "Application/MANSCDP+xml";

const COMPACT_HEADERS: &[(&str, &str)] = &[
    ("v", "Via"),
    ("f", "From"),
    ("t", "To"),
    ("i", "Call-ID"),
    ("m", "Contact"),
    ("l", "Content-Length"),
    ("c", "Content-Type"),
    ("e", "Content-Encoding"),
    ("k", "Supported"),
    ("s", "Subject"),
];

/// Expands a compact header name to its long form.
pub fn canonical_header_name(name: &str) -> &str {
    COMPACT_HEADERS
        .iter()
        .find(|(short, _)| short.eq_ignore_ascii_case(name))
        .map(|(_, long)| *long)
        .unwrap_or(name)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(String);

impl MessageId {
    pub fn new() -> Self {
        MessageId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Capabilities shared by requests and responses.
pub trait Message {
    fn id(&self) -> &MessageId;
    fn version(&self) -> &rsip::Version;
    fn headers(&self) -> &rsip::Headers;
    fn headers_mut(&mut self) -> &mut rsip::Headers;
    fn body(&self) -> &[u8];
    fn source(&self) -> Option<SocketAddr>;
    fn destination(&self) -> Option<SocketAddr>;
    fn connection(&self) -> Option<&SipConnection>;
    fn start_line(&self) -> String;

    /// All values of `name` in wire order. Names match case-insensitively
    /// and compact forms are accepted.
    fn header_values(&self, name: &str) -> Vec<String> {
        let wanted = canonical_header_name(name.trim());
        self.headers()
            .iter()
            .filter_map(|h| {
                let line = h.to_string();
                let (n, v) = line.split_once(':')?;
                if canonical_header_name(n.trim()).eq_ignore_ascii_case(wanted) {
                    Some(v.trim().to_string())
                } else {
                    None
                }
            })
            .collect()
    }

    fn header_value(&self, name: &str) -> Option<String> {
        self.header_values(name).into_iter().next()
    }

    fn content_length(&self) -> usize {
        self.body().len()
    }

    fn call_id(&self) -> Option<String> {
        self.header_value("Call-ID")
    }

    /// Sequence number and method of the CSeq header.
    fn cseq(&self) -> Option<(u32, String)> {
        let value = self.header_value("CSeq")?;
        let mut parts = value.split_whitespace();
        let seq = parts.next()?.parse().ok()?;
        let method = parts.next()?.to_string();
        Some((seq, method))
    }

    fn top_via(&self) -> Option<rsip::typed::Via> {
        self.headers().iter().find_map(|h| match h {
            Header::Via(via) => via.typed().ok(),
            _ => None,
        })
    }

    /// Wire form: start line, headers, empty line and the raw body.
    fn to_bytes(&self) -> Vec<u8> {
        let mut head = self.start_line();
        head.push_str("\r\n");
        for h in self.headers().iter() {
            head.push_str(&h.to_string());
            head.push_str("\r\n");
        }
        head.push_str("\r\n");
        let mut data = head.into_bytes();
        data.extend_from_slice(self.body());
        data
    }
}

fn replace_content_length(headers: &mut rsip::Headers, len: usize) {
    headers.retain(|h| !matches!(h, Header::ContentLength(_)));
    headers.push(Header::ContentLength((len as u32).into()));
}

#[derive(Debug, Clone)]
pub struct Request {
    pub id: MessageId,
    pub inner: rsip::Request,
    pub source: Option<SocketAddr>,
    pub destination: Option<SocketAddr>,
    pub connection: Option<SipConnection>,
}

impl Request {
    pub fn new(inner: rsip::Request) -> Self {
        Request {
            id: MessageId::new(),
            inner,
            source: None,
            destination: None,
            connection: None,
        }
    }

    pub fn method(&self) -> &rsip::Method {
        &self.inner.method
    }

    pub fn uri(&self) -> &rsip::Uri {
        &self.inner.uri
    }

    /// Replaces the body and keeps Content-Length in step with it.
    pub fn set_body(&mut self, body: Vec<u8>) {
        replace_content_length(&mut self.inner.headers, body.len());
        self.inner.body = body;
    }

    pub fn set_content_type(&mut self, content_type: &str) {
        self.inner
            .headers
            .retain(|h| !matches!(h, Header::ContentType(_)));
        self.inner
            .headers
            .push(Header::ContentType(content_type.to_string().into()));
    }

    /// Deep copy with a fresh id and no transport metadata.
    pub fn clone_message(&self) -> Self {
        Request::new(self.inner.clone())
    }
}

impl From<rsip::Request> for Request {
    fn from(inner: rsip::Request) -> Self {
        Request::new(inner)
    }
}

impl Message for Request {
    fn id(&self) -> &MessageId {
        &self.id
    }

    fn version(&self) -> &rsip::Version {
        &self.inner.version
    }

    fn headers(&self) -> &rsip::Headers {
        &self.inner.headers
    }

    fn headers_mut(&mut self) -> &mut rsip::Headers {
        &mut self.inner.headers
    }

    fn body(&self) -> &[u8] {
        &self.inner.body
    }

    fn source(&self) -> Option<SocketAddr> {
        self.source
    }

    fn destination(&self) -> Option<SocketAddr> {
        self.destination
    }

    fn connection(&self) -> Option<&SipConnection> {
        self.connection.as_ref()
    }

    fn start_line(&self) -> String {
        format!(
            "{} {} {}",
            self.inner.method, self.inner.uri, self.inner.version
        )
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    pub id: MessageId,
    pub inner: rsip::Response,
    /// Reason phrase overriding the standard one for the status code.
    pub reason: Option<String>,
    pub source: Option<SocketAddr>,
    pub destination: Option<SocketAddr>,
    pub connection: Option<SipConnection>,
}

impl Response {
    pub fn new(inner: rsip::Response) -> Self {
        Response {
            id: MessageId::new(),
            inner,
            reason: None,
            source: None,
            destination: None,
            connection: None,
        }
    }

    pub fn status_code(&self) -> &rsip::StatusCode {
        &self.inner.status_code
    }

    pub fn is_provisional(&self) -> bool {
        matches!(self.inner.status_code.kind(), StatusCodeKind::Provisional)
    }

    pub fn set_body(&mut self, body: Vec<u8>) {
        replace_content_length(&mut self.inner.headers, body.len());
        self.inner.body = body;
    }

    pub fn clone_message(&self) -> Self {
        let mut resp = Response::new(self.inner.clone());
        resp.reason = self.reason.clone();
        resp
    }
}

impl From<rsip::Response> for Response {
    fn from(inner: rsip::Response) -> Self {
        Response::new(inner)
    }
}

impl Message for Response {
    fn id(&self) -> &MessageId {
        &self.id
    }

    fn version(&self) -> &rsip::Version {
        &self.inner.version
    }

    fn headers(&self) -> &rsip::Headers {
        &self.inner.headers
    }

    fn headers_mut(&mut self) -> &mut rsip::Headers {
        &mut self.inner.headers
    }

    fn body(&self) -> &[u8] {
        &self.inner.body
    }

    fn source(&self) -> Option<SocketAddr> {
        self.source
    }

    fn destination(&self) -> Option<SocketAddr> {
        self.destination
    }

    fn connection(&self) -> Option<&SipConnection> {
        self.connection.as_ref()
    }

    fn start_line(&self) -> String {
        match &self.reason {
            Some(reason) => format!(
                "{} {} {}",
                self.inner.version,
                self.inner.status_code.code(),
                reason
            ),
            None => format!("{} {}", self.inner.version, self.inner.status_code),
        }
    }
}

#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(Request),
    Response(Response),
}

impl SipMessage {
    pub fn is_request(&self) -> bool {
        matches!(self, SipMessage::Request(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self, SipMessage::Response(_))
    }

    pub fn message(&self) -> &dyn Message {
        match self {
            SipMessage::Request(req) => req,
            SipMessage::Response(resp) => resp,
        }
    }
}

impl From<Request> for SipMessage {
    fn from(req: Request) -> Self {
        SipMessage::Request(req)
    }
}

impl From<Response> for SipMessage {
    fn from(resp: Response) -> Self {
        SipMessage::Response(resp)
    }
}

impl fmt::Display for SipMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.message().to_bytes();
        f.write_str(&String::from_utf8_lossy(&bytes))
    }
}
