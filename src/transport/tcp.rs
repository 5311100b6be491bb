use crate::{
    transport::{
        connection::{io_error, Deadlines, PacketSender},
        sip_addr::SipAddr,
        stream::StreamConnectionInner,
        SipConnection,
    },
    Result,
};
use std::{fmt, net::SocketAddr, sync::Arc};
use tokio::net::TcpStream;
use tracing::info;

type TcpInner =
    StreamConnectionInner<tokio::io::ReadHalf<TcpStream>, tokio::io::WriteHalf<TcpStream>>;

/// One TCP peer. Writes always go to the bound peer.
#[derive(Clone)]
pub struct TcpConnection {
    pub inner: Arc<TcpInner>,
}

impl TcpConnection {
    pub async fn connect(remote: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(remote)
            .await
            .map_err(|e| io_error("dial", &SipAddr::tcp(remote), None, e))?;
        let local_addr = SipAddr::tcp(stream.local_addr()?);
        let connection = Self::with_stream(stream, local_addr, SipAddr::tcp(remote));
        info!("Created TCP client connection: {}", connection);
        Ok(connection)
    }

    pub fn from_stream(stream: TcpStream, local_addr: SipAddr) -> Result<Self> {
        let remote_addr = SipAddr::tcp(stream.peer_addr()?);
        let connection = Self::with_stream(stream, local_addr, remote_addr);
        info!("Created TCP server connection: {}", connection);
        Ok(connection)
    }

    fn with_stream(stream: TcpStream, local_addr: SipAddr, remote_addr: SipAddr) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        TcpConnection {
            inner: Arc::new(StreamConnectionInner::new(
                local_addr,
                remote_addr,
                read_half,
                write_half,
            )),
        }
    }

    pub fn get_addr(&self) -> &SipAddr {
        &self.inner.local_addr
    }

    pub fn remote_addr(&self) -> &SipAddr {
        &self.inner.remote_addr
    }

    pub fn deadlines(&self) -> &Deadlines {
        &self.inner.deadlines
    }

    pub async fn send_raw(&self, data: &[u8]) -> Result<()> {
        self.inner.send_raw(data).await
    }

    pub async fn serve_loop(&self, sender: PacketSender) -> Result<()> {
        let sip_connection = SipConnection::Tcp(self.clone());
        self.inner.serve_loop(sender, sip_connection).await
    }

    pub async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

impl fmt::Display for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TCP {} -> {}",
            self.inner.local_addr.addr, self.inner.remote_addr.addr
        )
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
