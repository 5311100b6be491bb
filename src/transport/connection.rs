use super::{tcp::TcpConnection, udp::UdpConnection, SipAddr};
use crate::{message::parser::Packet, Error, Result};
use rsip::transport::Transport;
use std::{
    fmt,
    future::Future,
    net::SocketAddr,
    sync::Mutex,
    time::Duration,
};
use tokio::sync::mpsc;

pub type PacketSender = mpsc::Sender<Packet>;

pub const KEEPALIVE_REQUEST: &[u8] = b"\r\n\r\n";
pub const KEEPALIVE_RESPONSE: &[u8] = b"\r\n";

/// Optional per-connection I/O limits.
#[derive(Debug, Default)]
pub struct Deadlines {
    read: Mutex<Option<Duration>>,
    write: Mutex<Option<Duration>>,
}

impl Deadlines {
    pub fn read(&self) -> Option<Duration> {
        *self.read.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn write(&self) -> Option<Duration> {
        *self.write.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_read(&self, limit: Option<Duration>) {
        *self.read.lock().unwrap_or_else(|e| e.into_inner()) = limit;
    }

    pub fn set_write(&self, limit: Option<Duration>) {
        *self.write.lock().unwrap_or_else(|e| e.into_inner()) = limit;
    }
}

/// Runs `op` under `limit`, reporting an elapsed limit as `TimedOut`.
pub(crate) async fn with_deadline<T, F>(limit: Option<Duration>, op: F) -> std::io::Result<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    match limit {
        Some(limit) => match tokio::time::timeout(limit, op).await {
            Ok(r) => r,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "i/o deadline exceeded",
            )),
        },
        None => op.await,
    }
}

/// Wraps an I/O failure with the operation name and both ends of the socket.
pub(crate) fn io_error(
    op: &str,
    local: &SipAddr,
    remote: Option<SocketAddr>,
    e: std::io::Error,
) -> Error {
    match remote {
        Some(remote) => Error::TransportLayerError(
            format!("{} {} -> {}: {}", op, local.addr, remote, e),
            local.clone(),
        ),
        None => Error::TransportLayerError(format!("{} {}: {}", op, local.addr, e), local.clone()),
    }
}

/// A network endpoint messages are read from and written to.
///
/// The UDP variant is shared by every peer of the bound socket, so writes
/// name their destination. A TCP connection has exactly one peer and ignores
/// any destination passed to it.
#[derive(Clone)]
pub enum SipConnection {
    Udp(UdpConnection),
    Tcp(TcpConnection),
}

impl SipConnection {
    pub fn is_reliable(&self) -> bool {
        matches!(self, SipConnection::Tcp(_))
    }

    pub fn transport(&self) -> Transport {
        match self {
            SipConnection::Udp(_) => Transport::Udp,
            SipConnection::Tcp(_) => Transport::Tcp,
        }
    }

    pub fn network(&self) -> &'static str {
        match self {
            SipConnection::Udp(_) => "udp",
            SipConnection::Tcp(_) => "tcp",
        }
    }

    pub fn get_addr(&self) -> &SipAddr {
        match self {
            SipConnection::Udp(c) => c.get_addr(),
            SipConnection::Tcp(c) => c.get_addr(),
        }
    }

    /// Bound peer of a stream connection.
    pub fn remote_addr(&self) -> Option<&SipAddr> {
        match self {
            SipConnection::Udp(_) => None,
            SipConnection::Tcp(c) => Some(c.remote_addr()),
        }
    }

    pub async fn send_raw(&self, data: &[u8], destination: Option<SocketAddr>) -> Result<()> {
        match self {
            SipConnection::Udp(c) => match destination {
                Some(destination) => c.send_to(data, destination).await,
                None => Err(Error::TransportLayerError(
                    "write: no destination for datagram".to_string(),
                    c.get_addr().clone(),
                )),
            },
            SipConnection::Tcp(c) => c.send_raw(data).await,
        }
    }

    pub fn set_read_timeout(&self, limit: Option<Duration>) {
        match self {
            SipConnection::Udp(c) => c.deadlines().set_read(limit),
            SipConnection::Tcp(c) => c.deadlines().set_read(limit),
        }
    }

    pub fn set_write_timeout(&self, limit: Option<Duration>) {
        match self {
            SipConnection::Udp(c) => c.deadlines().set_write(limit),
            SipConnection::Tcp(c) => c.deadlines().set_write(limit),
        }
    }

    pub async fn close(&self) -> Result<()> {
        match self {
            SipConnection::Udp(c) => {
                c.close();
                Ok(())
            }
            SipConnection::Tcp(c) => c.close().await,
        }
    }
}

impl fmt::Display for SipConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SipConnection::Udp(t) => write!(f, "UDP {}", t),
            SipConnection::Tcp(t) => write!(f, "{}", t),
        }
    }
}

impl fmt::Debug for SipConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<UdpConnection> for SipConnection {
    fn from(connection: UdpConnection) -> Self {
        SipConnection::Udp(connection)
    }
}

impl From<TcpConnection> for SipConnection {
    fn from(connection: TcpConnection) -> Self {
        SipConnection::Tcp(connection)
    }
}
