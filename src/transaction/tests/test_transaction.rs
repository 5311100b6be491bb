use super::{message_request, response_to, udp_connection};
use crate::{
    message::{Message, Packet, SipMessage},
    transaction::{Transaction, TransactionKey},
    transport::{SipConnection, UdpConnection},
    Result,
};
use rsip::StatusCode;
use std::time::Duration;
use tokio::sync::mpsc;

#[tokio::test]
async fn test_final_response_skips_provisional() -> Result<()> {
    let conn = udp_connection().await?;
    let req = message_request(&conn, "final01", "t1");
    let tx = Transaction::new(TransactionKey::try_from(&req.inner)?, conn, Some(req.clone()));

    tx.receive(response_to(&req, StatusCode::Trying));
    tx.receive(response_to(&req, StatusCode::OK));
    let resp = tx.wait_final_response(Duration::from_millis(100)).await?;
    assert_eq!(resp.status_code(), &StatusCode::OK);

    assert!(tx.wait_final_response(Duration::from_millis(20)).await.is_err());
    Ok(())
}

#[tokio::test]
async fn test_respond_defaults_to_origin_source() -> Result<()> {
    let device = UdpConnection::create_connection("127.0.0.1:0".parse()?).await?;
    let (device_tx, mut device_rx) = mpsc::channel(4);
    let serving = device.clone();
    tokio::spawn(async move { serving.serve_loop(device_tx).await });

    let conn = udp_connection().await?;
    let mut req = message_request(&conn, "resp01", "t2");
    req.source = Some(device.get_addr().addr);
    let tx = Transaction::new(TransactionKey::try_from(&req.inner)?, conn.clone(), Some(req.clone()));

    let mut resp = response_to(&req, StatusCode::OK);
    resp.destination = None;
    tx.respond(resp).await?;

    let packet = tokio::time::timeout(Duration::from_secs(1), device_rx.recv())
        .await
        .expect("response timeout")
        .expect("packet");
    assert_eq!(packet.remote, conn.get_addr().addr);
    match Packet::new(packet.data, packet.remote, SipConnection::Udp(device.clone())).parse()? {
        SipMessage::Response(resp) => {
            assert_eq!(resp.status_code(), &StatusCode::OK);
            assert_eq!(resp.call_id().as_deref(), Some("t2"));
        }
        SipMessage::Request(_) => panic!("expected a response"),
    }
    device.close();
    Ok(())
}
