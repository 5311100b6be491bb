use crate::{message::SipMessage, Result};
use rsip::{
    headers::UntypedHeader,
    prelude::{HeadersExt, ToTypedHeader},
    Method,
};
use std::hash::Hash;

/// Key of a request without a branch parameter, correlated by the sent-by
/// address of its top Via instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rfc2543 {
    pub method: Method,
    pub cseq: u32,
    pub call_id: String,
    pub via_host_port: String,
}

impl Hash for Rfc2543 {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.method.to_string().hash(state);
        self.cseq.hash(state);
        self.call_id.hash(state);
        self.via_host_port.hash(state);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rfc3261 {
    pub branch: String,
    pub method: Method,
    pub cseq: u32,
    pub call_id: String,
}

impl Hash for Rfc3261 {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.branch.hash(state);
        self.method.to_string().hash(state);
        self.cseq.hash(state);
        self.call_id.hash(state);
    }
}

/// Correlates a request with its responses and retransmissions.
///
/// Built from the top Via branch, Call-ID and CSeq. The method is taken
/// from CSeq and ACK folds into INVITE, so a request and every response
/// to it produce the same key.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum TransactionKey {
    RFC3261(Rfc3261),
    RFC2543(Rfc2543),
    Invalid,
}

impl std::fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionKey::RFC3261(k) => {
                write!(f, "{} {}/{}({})", k.call_id, k.method, k.cseq, k.branch)
            }
            TransactionKey::RFC2543(k) => write!(
                f,
                "{} {}/{}[{}]",
                k.call_id, k.method, k.cseq, k.via_host_port
            ),
            TransactionKey::Invalid => write!(f, "INVALID"),
        }
    }
}

fn method_category(method: Method) -> Method {
    match method {
        Method::Ack => Method::Invite,
        other => other,
    }
}

fn build_key(
    via: &rsip::headers::Via,
    call_id: &rsip::headers::CallId,
    cseq: &rsip::headers::CSeq,
) -> Result<TransactionKey> {
    let via = via.typed()?;
    let method = method_category(cseq.method()?);
    let seq = cseq.seq()?;
    let call_id = call_id.value().to_string();
    match via.branch() {
        Some(branch) => Ok(TransactionKey::RFC3261(Rfc3261 {
            branch: branch.to_string(),
            method,
            cseq: seq,
            call_id,
        })),
        None => Ok(TransactionKey::RFC2543(Rfc2543 {
            method,
            cseq: seq,
            call_id,
            via_host_port: via.uri.host_with_port.to_string(),
        })),
    }
}

impl TryFrom<&rsip::Request> for TransactionKey {
    type Error = crate::error::Error;

    fn try_from(req: &rsip::Request) -> Result<Self> {
        build_key(req.via_header()?, req.call_id_header()?, req.cseq_header()?)
    }
}

impl TryFrom<&rsip::Response> for TransactionKey {
    type Error = crate::error::Error;

    fn try_from(resp: &rsip::Response) -> Result<Self> {
        build_key(
            resp.via_header()?,
            resp.call_id_header()?,
            resp.cseq_header()?,
        )
    }
}

impl TryFrom<&SipMessage> for TransactionKey {
    type Error = crate::error::Error;

    fn try_from(msg: &SipMessage) -> Result<Self> {
        match msg {
            SipMessage::Request(req) => TransactionKey::try_from(&req.inner),
            SipMessage::Response(resp) => TransactionKey::try_from(&resp.inner),
        }
    }
}

#[test]
fn test_transaction_key() -> Result<()> {
    use rsip::headers::*;
    let register_req = rsip::message::Request {
        method: rsip::method::Method::Register,
        uri: rsip::Uri {
            scheme: Some(rsip::Scheme::Sip),
            host_with_port: rsip::Domain::from("3402000000").into(),
            ..Default::default()
        },
        headers: vec![
            Via::new("SIP/2.0/UDP 192.168.1.64:5060;rport;branch=z9hG4bK1371463273").into(),
            From::new("<sip:34020000001320000001@3402000000>;tag=2043466181").into(),
            To::new("<sip:34020000001320000001@3402000000>").into(),
            CallId::new("1011047669").into(),
            CSeq::new("1 REGISTER").into(),
        ]
        .into(),
        version: rsip::Version::V2,
        body: Default::default(),
    };
    let expected = TransactionKey::RFC3261(Rfc3261 {
        branch: "z9hG4bK1371463273".to_string(),
        method: Method::Register,
        cseq: 1,
        call_id: "1011047669".to_string(),
    });
    assert_eq!(TransactionKey::try_from(&register_req)?, expected);

    let register_resp = rsip::message::Response {
        status_code: rsip::StatusCode::OK,
        version: rsip::Version::V2,
        headers: register_req.headers.clone(),
        body: Default::default(),
    };
    assert_eq!(TransactionKey::try_from(&register_resp)?, expected);

    let mut invite = register_req.clone();
    invite.method = Method::Invite;
    invite.headers.unique_push(CSeq::new("20 INVITE").into());
    let mut ack = invite.clone();
    ack.method = Method::Ack;
    ack.headers.unique_push(CSeq::new("20 ACK").into());
    assert_eq!(
        TransactionKey::try_from(&invite)?,
        TransactionKey::try_from(&ack)?
    );

    let mut legacy = register_req.clone();
    legacy
        .headers
        .unique_push(Via::new("SIP/2.0/UDP 192.168.1.64:5060").into());
    match TransactionKey::try_from(&legacy)? {
        TransactionKey::RFC2543(k) => assert_eq!(k.via_host_port, "192.168.1.64:5060"),
        other => panic!("unexpected key {}", other),
    }
    Ok(())
}
