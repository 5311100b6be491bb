use crate::{
    transport::{tcp::TcpConnection, tcp_listener::TcpListenerConnection, SipConnection},
    Result,
};
use std::time::Duration;
use tokio::{sync::mpsc, time::timeout};

#[tokio::test]
async fn test_tcp_frames_end_to_end() -> Result<()> {
    let listener = TcpListenerConnection::bind("127.0.0.1:0".parse()?).await?;
    let addr = listener.get_addr().addr;

    let client = TcpConnection::connect(addr).await?;
    let server = timeout(Duration::from_secs(1), listener.accept())
        .await
        .expect("accept timeout")?;
    assert_eq!(server.remote_addr().addr, client.get_addr().addr);

    let (tx, mut rx) = mpsc::channel(8);
    let serving = server.clone();
    tokio::spawn(async move { serving.serve_loop(tx).await });

    let msg = "MESSAGE sip:34020000002000000001@3402000000 SIP/2.0\r\nVia: SIP/2.0/TCP 127.0.0.1:5060;branch=z9hG4bKa1\r\nCall-ID: 1@host\r\nCSeq: 20 MESSAGE\r\nContent-Length: 5\r\n\r\nhello";
    let bytes = msg.as_bytes();
    client.send_raw(&bytes[..30]).await?;
    tokio::time::sleep(Duration::from_millis(20)).await;
    client.send_raw(&bytes[30..]).await?;
    client.send_raw(b"\r\n\r\n").await?;
    client.send_raw(bytes).await?;

    for _ in 0..2 {
        let packet = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("packet timeout")
            .expect("packet");
        assert_eq!(&packet.data[..], bytes);
        assert_eq!(packet.remote, client.get_addr().addr);
        assert!(matches!(packet.connection, SipConnection::Tcp(_)));
    }

    let conn = SipConnection::Tcp(client);
    assert!(conn.is_reliable());
    conn.close().await?;
    assert!(timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("loop should end")
        .is_none());
    Ok(())
}

#[tokio::test]
async fn test_tcp_listener_close() -> Result<()> {
    let listener = TcpListenerConnection::bind("127.0.0.1:0".parse()?).await?;
    listener.close();
    assert!(listener.accept().await.is_err());
    Ok(())
}
