use crate::{
    message::{Packet, Request, Response, SipMessage},
    transport::{SipConnection, UdpConnection},
    Result,
};

mod test_transaction;

const MESSAGE: &str = "MESSAGE sip:34020000002000000001@3402000000 SIP/2.0\r\n\
Via: SIP/2.0/UDP 192.168.1.64:5060;rport;branch=z9hG4bK{branch}\r\n\
From: <sip:34020000001320000001@3402000000>;tag=1\r\n\
To: <sip:34020000002000000001@3402000000>\r\n\
Call-ID: {call_id}\r\n\
CSeq: 20 MESSAGE\r\n\
Content-Length: 0\r\n\r\n";

pub(super) async fn udp_connection() -> Result<SipConnection> {
    Ok(UdpConnection::create_connection("127.0.0.1:0".parse()?)
        .await?
        .into())
}

pub(super) fn message_request(conn: &SipConnection, branch: &str, call_id: &str) -> Request {
    let data = MESSAGE
        .replace("{branch}", branch)
        .replace("{call_id}", call_id);
    match Packet::new(data, "192.168.1.64:5060".parse().unwrap(), conn.clone()).parse() {
        Ok(SipMessage::Request(req)) => req,
        other => panic!("unexpected parse result: {:?}", other),
    }
}

pub(super) fn response_to(req: &Request, status: rsip::StatusCode) -> Response {
    crate::message::make_response(req, status, None, None)
}

#[test]
fn test_random_text() {
    use super::{make_call_id, make_tag, make_via_branch, random_text};
    use rsip::headers::UntypedHeader;

    let text = random_text(10);
    assert_eq!(text.len(), 10);
    assert!(text.chars().all(|c| c.is_ascii_alphanumeric()));
    let branch = make_via_branch().to_string();
    assert_eq!(branch.len(), 27); // ;branch=z9hG4bK
    assert!(branch.starts_with(";branch=z9hG4bK"));
    assert_eq!(make_tag().to_string().len(), 8);
    assert_ne!(make_call_id().value(), make_call_id().value());
}
