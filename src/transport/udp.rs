use super::{
    connection::{
        io_error, with_deadline, Deadlines, PacketSender, KEEPALIVE_REQUEST, KEEPALIVE_RESPONSE,
    },
    SipAddr, SipConnection,
};
use crate::{message::parser::Packet, Error, Result};
use bytes::Bytes;
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
};
use tokio::{net::UdpSocket, select};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

/// Largest payload a single IPv4 datagram can carry.
pub const MAX_DATAGRAM_SIZE: usize = 65535 - 20 - 8;

struct UdpInner {
    /// Taken on close so the port is released while clones live on.
    conn: Mutex<Option<Arc<UdpSocket>>>,
    addr: SipAddr,
    deadlines: Deadlines,
    cancel_token: CancellationToken,
}

#[derive(Clone)]
pub struct UdpConnection {
    inner: Arc<UdpInner>,
}

impl UdpConnection {
    pub async fn create_connection(local: SocketAddr) -> Result<Self> {
        let conn = UdpSocket::bind(local)
            .await
            .map_err(|e| io_error("listen", &SipAddr::udp(local), None, e))?;
        let addr = SipAddr::udp(conn.local_addr()?);
        let t = UdpConnection {
            inner: Arc::new(UdpInner {
                conn: Mutex::new(Some(Arc::new(conn))),
                addr,
                deadlines: Deadlines::default(),
                cancel_token: CancellationToken::new(),
            }),
        };
        info!("created UDP connection: {}", t);
        Ok(t)
    }

    pub fn get_addr(&self) -> &SipAddr {
        &self.inner.addr
    }

    pub fn deadlines(&self) -> &Deadlines {
        &self.inner.deadlines
    }

    fn socket(&self, op: &str) -> Result<Arc<UdpSocket>> {
        self.inner
            .conn
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| {
                Error::TransportLayerError(
                    format!("{} {}: connection closed", op, self.inner.addr.addr),
                    self.inner.addr.clone(),
                )
            })
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let conn = self.socket("read")?;
        with_deadline(self.inner.deadlines.read(), conn.recv_from(buf))
            .await
            .map_err(|e| io_error("read", &self.inner.addr, None, e))
    }

    #[instrument(skip(self, data), fields(addr = %self.inner.addr))]
    pub async fn send_to(&self, data: &[u8], target: SocketAddr) -> Result<()> {
        let conn = self.socket("write")?;
        trace!("sending {} -> {}", data.len(), target);
        with_deadline(self.inner.deadlines.write(), conn.send_to(data, target))
        .await
        .map_err(|e| io_error("write", &self.inner.addr, Some(target), e))
        .map(|_| ())
    }

    /// Reads datagrams until the connection is closed or a read fails.
    ///
    /// Every non keep-alive datagram is forwarded as one [`Packet`]; a full
    /// channel holds the loop until the parser catches up.
    pub async fn serve_loop(&self, sender: PacketSender) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let connection = SipConnection::Udp(self.clone());
        loop {
            let (len, remote) = select! {
                biased;
                _ = self.inner.cancel_token.cancelled() => {
                    info!("UDP connection closed: {}", self.inner.addr);
                    return Ok(());
                }
                r = self.recv_from(&mut buf) => r?,
            };

            let data = &buf[..len];
            if data == KEEPALIVE_REQUEST {
                self.send_to(KEEPALIVE_RESPONSE, remote).await.ok();
                continue;
            }
            if data.iter().all(|b| b.is_ascii_whitespace()) {
                continue;
            }

            debug!("received {} {} -> {}", len, remote, self.inner.addr);
            let packet = Packet {
                data: Bytes::copy_from_slice(data),
                remote,
                connection: connection.clone(),
            };
            if sender.send(packet).await.is_err() {
                warn!("parser gone, stopping UDP loop on {}", self.inner.addr);
                return Ok(());
            }
        }
    }

    /// Stops the read loop and drops the socket. Later reads and writes
    /// fail with a transport error.
    pub fn close(&self) {
        self.inner.cancel_token.cancel();
        self.inner
            .conn
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel_token.is_cancelled()
    }
}

impl std::fmt::Display for UdpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner.addr.addr)
    }
}

impl std::fmt::Debug for UdpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner.addr)
    }
}

impl Drop for UdpInner {
    fn drop(&mut self) {
        info!("dropping UDP connection: {}", self.addr);
    }
}
