use super::{canonical_header_name, Request, Response, SipMessage};
use crate::{transport::SipConnection, Error, Result};
use bytes::Bytes;
use rsip::prelude::HeadersExt;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Largest body accepted on any transport.
pub const MAX_BODY_SIZE: usize = 65535;

/// Value of a `Content-Length` (or compact `l`) header line.
///
/// Returns `None` for other headers. A malformed count reads as zero.
pub(crate) fn content_length_of_line(line: &[u8]) -> Option<usize> {
    let colon = line.iter().position(|b| *b == b':')?;
    let name = std::str::from_utf8(&line[..colon]).ok()?.trim();
    if !name.eq_ignore_ascii_case("content-length") && !name.eq_ignore_ascii_case("l") {
        return None;
    }
    let value = String::from_utf8_lossy(&line[colon + 1..]);
    Some(value.trim().parse().unwrap_or(0))
}

/// Reads CRLF or LF terminated lines from a buffer.
struct LineReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> LineReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        LineReader { data, pos: 0 }
    }

    fn next_line(&mut self) -> Option<&'a [u8]> {
        if self.pos >= self.data.len() {
            return None;
        }
        let rest = &self.data[self.pos..];
        let (line, consumed) = match rest.iter().position(|b| *b == b'\n') {
            Some(nl) => (&rest[..nl], nl + 1),
            None => (rest, rest.len()),
        };
        self.pos += consumed;
        Some(line.strip_suffix(b"\r").unwrap_or(line))
    }

    fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos.min(self.data.len())..]
    }
}

/// One candidate message: a whole datagram or one framed stream message.
#[derive(Debug, Clone)]
pub struct Packet {
    pub data: Bytes,
    pub remote: SocketAddr,
    pub connection: SipConnection,
}

impl Packet {
    pub fn new(data: impl Into<Bytes>, remote: SocketAddr, connection: SipConnection) -> Self {
        Packet {
            data: data.into(),
            remote,
            connection,
        }
    }

    /// Parses the packet into a request or response.
    ///
    /// The body is the `Content-Length` bytes following the empty line. A
    /// shorter body is kept as received. Via, Call-ID and CSeq are required.
    pub fn parse(&self) -> Result<SipMessage> {
        let mut reader = LineReader::new(&self.data);
        let start_line = loop {
            match reader.next_line() {
                Some(line) if line.iter().all(|b| b.is_ascii_whitespace()) => continue,
                Some(line) => break String::from_utf8_lossy(line).trim().to_string(),
                None => return Err(Error::SipMessageError("empty packet".to_string())),
            }
        };

        let mut head = String::with_capacity(self.data.len());
        head.push_str(&start_line);
        head.push_str("\r\n");

        let mut content_length = 0;
        while let Some(line) = reader.next_line() {
            if line.is_empty() {
                break;
            }
            let line = String::from_utf8_lossy(line);
            if line.starts_with(|c: char| c == ' ' || c == '\t') {
                // folded continuation of the previous header
                if head.ends_with("\r\n") {
                    head.truncate(head.len() - 2);
                }
                head.push(' ');
                head.push_str(line.trim());
                head.push_str("\r\n");
                continue;
            }
            if let Some(len) = content_length_of_line(line.as_bytes()) {
                content_length = len;
            }
            match line.split_once(':') {
                Some((name, value)) => {
                    head.push_str(canonical_header_name(name.trim()));
                    head.push_str(": ");
                    head.push_str(value.trim());
                }
                None => head.push_str(&line),
            }
            head.push_str("\r\n");
        }
        head.push_str("\r\n");

        if content_length > MAX_BODY_SIZE {
            return Err(Error::SipMessageError(format!(
                "content length too large: {}",
                content_length
            )));
        }
        let rest = reader.remaining();
        if rest.len() < content_length {
            debug!(
                remote = %self.remote,
                "body shorter than content length {} < {}",
                rest.len(),
                content_length
            );
        }
        let body = rest[..content_length.min(rest.len())].to_vec();

        if start_line.starts_with("SIP/") {
            self.parse_response(&start_line, &head, body)
        } else {
            self.parse_request(&start_line, &head, body)
        }
    }

    fn parse_request(&self, start_line: &str, head: &str, body: Vec<u8>) -> Result<SipMessage> {
        if start_line.split_whitespace().count() != 3 {
            return Err(Error::SipMessageError(format!(
                "malformed request line: {}",
                start_line
            )));
        }
        let mut inner = match rsip::SipMessage::try_from(head)? {
            rsip::SipMessage::Request(req) => req,
            rsip::SipMessage::Response(_) => {
                return Err(Error::SipMessageError("expected a request".to_string()))
            }
        };
        inner.via_header()?;
        inner.call_id_header()?;
        inner.cseq_header()?;
        inner.body = body;

        let mut req = Request::new(inner);
        req.source = Some(self.remote);
        req.destination = Some(self.connection.get_addr().addr);
        req.connection = Some(self.connection.clone());
        Ok(SipMessage::Request(req))
    }

    fn parse_response(&self, start_line: &str, head: &str, body: Vec<u8>) -> Result<SipMessage> {
        let mut parts = start_line.splitn(3, ' ');
        let (_, code) = (parts.next(), parts.next());
        if code.map_or(true, |c| c.parse::<u16>().is_err()) {
            return Err(Error::SipMessageError(format!(
                "malformed status line: {}",
                start_line
            )));
        }
        let reason = parts
            .next()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(str::to_string);

        let mut inner = match rsip::SipMessage::try_from(head)? {
            rsip::SipMessage::Response(resp) => resp,
            rsip::SipMessage::Request(_) => {
                return Err(Error::SipMessageError("expected a response".to_string()))
            }
        };
        inner.via_header()?;
        inner.call_id_header()?;
        inner.cseq_header()?;
        inner.body = body;

        let mut resp = Response::new(inner);
        resp.reason = reason;
        resp.source = Some(self.remote);
        resp.destination = Some(self.connection.get_addr().addr);
        resp.connection = Some(self.connection.clone());
        Ok(SipMessage::Response(resp))
    }
}

/// Parse stage between a read loop and its dispatcher.
pub struct Parser;

impl Parser {
    /// Spawns a task turning packets into messages.
    ///
    /// Both channels hold at most `capacity` items, so a slow consumer
    /// holds back the read loop feeding the returned sender. Packets that
    /// fail to parse are logged and dropped.
    pub fn spawn(capacity: usize) -> (mpsc::Sender<Packet>, mpsc::Receiver<SipMessage>) {
        let (packet_tx, mut packet_rx) = mpsc::channel::<Packet>(capacity);
        let (message_tx, message_rx) = mpsc::channel(capacity);
        tokio::spawn(async move {
            while let Some(packet) = packet_rx.recv().await {
                match packet.parse() {
                    Ok(msg) => {
                        if message_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(remote = %packet.remote, "dropping packet: {}", e);
                    }
                }
            }
        });
        (packet_tx, message_rx)
    }
}
