use gbsip::{
    router::handler,
    transaction::Transaction,
    Result, Server, ServerConfig,
};
use rsip::{Method, StatusCode};
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, UdpSocket},
    sync::mpsc,
    time::timeout,
};

const DEVICE_ID: &str = "34020000001320000001";

struct Device {
    socket: UdpSocket,
    server: SocketAddr,
}

impl Device {
    async fn new(server: SocketAddr) -> Result<Self> {
        Ok(Device {
            socket: UdpSocket::bind("127.0.0.1:0").await?,
            server,
        })
    }

    fn addr(&self) -> SocketAddr {
        self.socket.local_addr().expect("local addr")
    }

    async fn send(&self, data: &str) -> Result<()> {
        self.socket.send_to(data.as_bytes(), self.server).await?;
        Ok(())
    }

    async fn recv(&self, wait: Duration) -> Option<String> {
        let mut buf = vec![0u8; 65535];
        let (n, from) = timeout(wait, self.socket.recv_from(&mut buf))
            .await
            .ok()?
            .ok()?;
        assert_eq!(from, self.server);
        Some(String::from_utf8_lossy(&buf[..n]).to_string())
    }
}

fn request(method: &str, device: SocketAddr, branch: &str, seq: u32, body: &str) -> String {
    let content_type = if body.is_empty() {
        String::new()
    } else {
        "Content-Type: Application/MANSCDP+xml\r\n".to_string()
    };
    format!(
        "{method} sip:34020000002000000001@3402000000 SIP/2.0\r\n\
Via: SIP/2.0/UDP {device};rport;branch=z9hG4bK{branch}\r\n\
From: <sip:{DEVICE_ID}@3402000000>;tag={branch}\r\n\
To: <sip:34020000002000000001@3402000000>\r\n\
Call-ID: {branch}@{device}\r\n\
CSeq: {seq} {method}\r\n\
Max-Forwards: 70\r\n\
{content_type}\
Content-Length: {len}\r\n\r\n{body}",
        len = body.len(),
    )
}

fn keepalive_body() -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"GB2312\"?>\r\n<Notify>\r\n<CmdType>Keepalive</CmdType>\r\n<SN>1</SN>\r\n<DeviceID>{DEVICE_ID}</DeviceID>\r\n<Status>OK</Status>\r\n</Notify>\r\n"
    )
}

/// Answers `req` by echoing its transaction headers.
fn reply(req: &str, status: &str) -> String {
    let mut resp = format!("SIP/2.0 {}\r\n", status);
    for line in req.lines() {
        if ["Via:", "From:", "To:", "Call-ID:", "CSeq:"]
            .iter()
            .any(|name| line.starts_with(name))
        {
            resp.push_str(line);
            if line.starts_with("To:") {
                resp.push_str(";tag=device");
            }
            resp.push_str("\r\n");
        }
    }
    resp.push_str("Content-Length: 0\r\n\r\n");
    resp
}

fn header<'a>(msg: &'a str, name: &str) -> Option<&'a str> {
    msg.lines()
        .find_map(|line| line.strip_prefix(name)?.strip_prefix(':'))
        .map(str::trim)
}

async fn start_udp(server: &Server) -> Result<SocketAddr> {
    let addr = server.bind_udp("127.0.0.1:0".parse()?).await?;
    let serving = server.clone();
    tokio::spawn(async move { serving.serve_udp().await });
    Ok(addr)
}

fn test_server() -> Result<Server> {
    tracing_subscriber::fmt().with_test_writer().try_init().ok();
    Server::builder()
        .with_host("127.0.0.1".parse()?)
        .build()
}

#[tokio::test]
async fn test_unrouted_method_not_allowed() -> Result<()> {
    let server = test_server()?;
    let addr = server.bind_udp("127.0.0.1:0".parse()?).await?;
    let serving = server.clone();
    let serve = tokio::spawn(async move { serving.serve_udp().await });

    let device = Device::new(addr).await?;
    let info = request("INFO", device.addr(), "info01", 7, "");
    device.send(&info).await?;

    let resp = device
        .recv(Duration::from_secs(1))
        .await
        .expect("405 response");
    assert!(resp.starts_with("SIP/2.0 405"), "{}", resp);
    assert_eq!(header(&resp, "Call-ID"), header(&info, "Call-ID"));
    assert_eq!(header(&resp, "Via"), header(&info, "Via"));
    assert_eq!(header(&resp, "CSeq"), Some("7 INFO"));
    assert_eq!(server.transactions().len(), 1);

    server.close();
    server.close();
    let stopped = timeout(Duration::from_secs(1), serve)
        .await
        .expect("serve_udp stops on close")
        .expect("join");
    assert!(stopped.is_ok());
    assert!(server.local_udp_addr().is_none());
    assert!(server.transactions().is_empty());

    // nothing keeps the socket open once the server is closed
    let rebound = UdpSocket::bind(addr).await?;
    assert_eq!(rebound.local_addr()?, addr);
    Ok(())
}

#[tokio::test]
async fn test_register_round_trip() -> Result<()> {
    let server = test_server()?;
    let (seen_tx, mut seen_rx) = mpsc::channel(1);
    server.register(vec![handler(move |ctx| {
        let seen_tx = seen_tx.clone();
        Box::pin(async move {
            seen_tx
                .send((ctx.device_id.clone(), ctx.host.clone(), ctx.port))
                .await
                .ok();
            ctx.string(StatusCode::OK, "OK").await;
        })
    })]);
    let addr = start_udp(&server).await?;

    let device = Device::new(addr).await?;
    device
        .send(&request("REGISTER", device.addr(), "reg01", 1, ""))
        .await?;

    let (device_id, host, port) = timeout(Duration::from_secs(1), seen_rx.recv())
        .await
        .expect("handler ran")
        .expect("seen");
    assert_eq!(device_id, DEVICE_ID);
    assert_eq!(host, "127.0.0.1");
    assert_eq!(port, device.addr().port());

    let resp = device
        .recv(Duration::from_secs(1))
        .await
        .expect("register response");
    assert!(resp.starts_with("SIP/2.0 200 OK"), "{}", resp);
    assert!(header(&resp, "To").is_some_and(|to| to.contains("tag=")));
    server.close();
    Ok(())
}

#[tokio::test]
async fn test_message_without_body_is_dropped() -> Result<()> {
    let server = test_server()?;
    server.message(vec![]).handle(
        "Keepalive",
        vec![handler(|ctx| {
            Box::pin(async move { ctx.string(StatusCode::OK, "OK").await })
        })],
    );
    let addr = start_udp(&server).await?;
    let device = Device::new(addr).await?;

    device
        .send(&request("MESSAGE", device.addr(), "empty01", 2, ""))
        .await?;
    assert!(device.recv(Duration::from_millis(300)).await.is_none());

    device
        .send(&request("MESSAGE", device.addr(), "keep01", 3, &keepalive_body()))
        .await?;
    let resp = device
        .recv(Duration::from_secs(1))
        .await
        .expect("keepalive response");
    assert!(resp.starts_with("SIP/2.0 200"), "{}", resp);
    server.close();
    Ok(())
}

fn counting_handler(calls: &Arc<AtomicUsize>) -> gbsip::router::HandlerRef {
    let calls = calls.clone();
    handler(move |ctx| {
        let calls = calls.clone();
        Box::pin(async move {
            calls.fetch_add(1, Ordering::SeqCst);
            ctx.string(StatusCode::OK, "OK").await;
        })
    })
}

#[tokio::test]
async fn test_request_without_device_is_dropped() -> Result<()> {
    let server = test_server()?;
    let calls = Arc::new(AtomicUsize::new(0));
    server.register(vec![counting_handler(&calls)]);
    let addr = start_udp(&server).await?;
    let device = Device::new(addr).await?;

    let anonymous = request("REGISTER", device.addr(), "anon01", 1, "").replace(
        &format!("From: <sip:{DEVICE_ID}@3402000000>"),
        "From: <sip:3402000000>",
    );
    device.send(&anonymous).await?;
    assert!(device.recv(Duration::from_millis(300)).await.is_none());

    let without_via = request("REGISTER", device.addr(), "novia01", 1, "")
        .lines()
        .filter(|line| !line.starts_with("Via:"))
        .collect::<Vec<_>>()
        .join("\r\n")
        + "\r\n";
    device.send(&without_via).await?;
    assert!(device.recv(Duration::from_millis(300)).await.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    device
        .send(&request("REGISTER", device.addr(), "reg02", 2, ""))
        .await?;
    let resp = device
        .recv(Duration::from_secs(1))
        .await
        .expect("register response");
    assert!(resp.starts_with("SIP/2.0 200"), "{}", resp);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    server.close();
    Ok(())
}

#[tokio::test]
async fn test_message_with_bad_xml_is_dropped() -> Result<()> {
    let server = test_server()?;
    let calls = Arc::new(AtomicUsize::new(0));
    server
        .message(vec![])
        .handle("Keepalive", vec![counting_handler(&calls)]);
    let addr = start_udp(&server).await?;
    let device = Device::new(addr).await?;

    let broken = "<Notify><CmdType>Keepalive</Notify>";
    device
        .send(&request("MESSAGE", device.addr(), "bad01", 5, broken))
        .await?;
    assert!(device.recv(Duration::from_millis(300)).await.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    device
        .send(&request("MESSAGE", device.addr(), "keep03", 6, &keepalive_body()))
        .await?;
    let resp = device
        .recv(Duration::from_secs(1))
        .await
        .expect("keepalive response");
    assert!(resp.starts_with("SIP/2.0 200"), "{}", resp);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    server.close();
    Ok(())
}

#[tokio::test]
async fn test_saturated_handlers_still_correlate() -> Result<()> {
    tracing_subscriber::fmt().with_test_writer().try_init().ok();
    let server = Server::builder()
        .with_config(ServerConfig {
            udp_addr: None,
            tcp_addr: None,
            host: Some("127.0.0.1".parse()?),
            max_concurrent_handlers: 1,
            ..Default::default()
        })
        .build()?;
    let (done_tx, mut done_rx) = mpsc::channel::<std::result::Result<u16, String>>(1);
    server.register(vec![handler(move |ctx| {
        let done_tx = done_tx.clone();
        Box::pin(async move {
            ctx.string(StatusCode::OK, "OK").await;
            let query = format!(
                "<?xml version=\"1.0\"?>\r\n<Query>\r\n<CmdType>DeviceInfo</CmdType>\r\n<SN>3</SN>\r\n<DeviceID>{}</DeviceID>\r\n</Query>\r\n",
                ctx.device_id
            );
            let result = match ctx.send_request(Method::Message, query.into_bytes()).await {
                Ok(tx) => wait_status(tx).await,
                Err(e) => Err(e.to_string()),
            };
            done_tx.send(result).await.ok();
        })
    })]);
    let addr = start_udp(&server).await?;
    let device = Device::new(addr).await?;

    device
        .send(&request("REGISTER", device.addr(), "busy01", 1, ""))
        .await?;
    let mut query = None;
    for _ in 0..2 {
        let msg = device.recv(Duration::from_secs(1)).await.expect("message");
        if msg.starts_with("MESSAGE ") {
            query = Some(msg);
        }
    }
    let query = query.expect("device info query");

    // the only handler is busy waiting for the device
    device
        .send(&request("REGISTER", device.addr(), "busy02", 2, ""))
        .await?;
    let busy = device
        .recv(Duration::from_secs(1))
        .await
        .expect("busy response");
    assert!(busy.starts_with("SIP/2.0 503"), "{}", busy);
    assert_eq!(header(&busy, "CSeq"), Some("2 REGISTER"));

    device.send(&reply(&query, "200 OK")).await?;
    let status = timeout(Duration::from_secs(2), done_rx.recv())
        .await
        .expect("handler done")
        .expect("result");
    assert_eq!(status, Ok(200));
    server.close();
    Ok(())
}

#[tokio::test]
async fn test_outbound_request_correlates_response() -> Result<()> {
    let server = test_server()?;
    let (done_tx, mut done_rx) = mpsc::channel::<std::result::Result<u16, String>>(1);
    server.message(vec![]).handle(
        "Keepalive",
        vec![handler(move |ctx| {
            let done_tx = done_tx.clone();
            Box::pin(async move {
                ctx.string(StatusCode::OK, "OK").await;
                let query = format!(
                    "<?xml version=\"1.0\"?>\r\n<Query>\r\n<CmdType>Catalog</CmdType>\r\n<SN>2</SN>\r\n<DeviceID>{}</DeviceID>\r\n</Query>\r\n",
                    ctx.device_id
                );
                let result = match ctx.send_request(Method::Message, query.into_bytes()).await {
                    Ok(tx) => wait_status(tx).await,
                    Err(e) => Err(e.to_string()),
                };
                done_tx.send(result).await.ok();
            })
        })],
    );
    let addr = start_udp(&server).await?;
    let device = Device::new(addr).await?;

    device
        .send(&request("MESSAGE", device.addr(), "keep02", 4, &keepalive_body()))
        .await?;

    let mut query = None;
    for _ in 0..2 {
        let msg = device.recv(Duration::from_secs(1)).await.expect("message");
        if msg.starts_with("MESSAGE ") {
            query = Some(msg);
        }
    }
    let query = query.expect("catalog query");
    assert_eq!(header(&query, "Content-Type"), Some("Application/MANSCDP+xml"));
    assert!(query.contains("<CmdType>Catalog</CmdType>"));
    let via = header(&query, "Via").expect("via");
    assert!(via.starts_with(&format!("SIP/2.0/UDP 127.0.0.1:{}", addr.port())), "{}", via);
    assert!(via.contains("branch=z9hG4bK") && via.contains("rport"));
    assert!(header(&query, "From").is_some_and(|f| f.contains("34020000002000000001")));
    assert!(header(&query, "To").is_some_and(|t| t.contains(DEVICE_ID)));

    device.send(&reply(&query, "100 Trying")).await?;
    device.send(&reply(&query, "200 OK")).await?;

    let status = timeout(Duration::from_secs(2), done_rx.recv())
        .await
        .expect("handler done")
        .expect("result");
    assert_eq!(status, Ok(200));
    server.close();
    Ok(())
}

async fn wait_status(tx: Arc<Transaction>) -> std::result::Result<u16, String> {
    tx.wait_final_response(Duration::from_secs(1))
        .await
        .map(|resp| resp.status_code().code())
        .map_err(|e| e.to_string())
}

#[tokio::test]
async fn test_tcp_register() -> Result<()> {
    let server = test_server()?;
    server.register(vec![handler(|ctx| {
        Box::pin(async move { ctx.string(StatusCode::OK, "OK").await })
    })]);
    let addr = server.bind_tcp("127.0.0.1:0".parse()?).await?;
    let serving = server.clone();
    tokio::spawn(async move { serving.serve_tcp().await });

    let mut stream = TcpStream::connect(addr).await?;
    let local = stream.local_addr()?;
    let register = request("REGISTER", local, "tcp01", 1, "").replace("SIP/2.0/UDP", "SIP/2.0/TCP");
    stream.write_all(b"\r\n\r\n").await?;
    stream.write_all(register.as_bytes()).await?;

    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    while !String::from_utf8_lossy(&received).contains("SIP/2.0 200") {
        let n = timeout(Duration::from_secs(1), stream.read(&mut buf))
            .await
            .expect("tcp response")?;
        assert!(n > 0, "connection closed early");
        received.extend_from_slice(&buf[..n]);
    }
    let text = String::from_utf8_lossy(&received);
    assert!(text.starts_with("\r\nSIP/2.0 200 OK"), "{}", text);
    server.close();
    Ok(())
}
