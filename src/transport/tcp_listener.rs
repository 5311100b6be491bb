use crate::transport::{connection::io_error, tcp::TcpConnection, SipAddr};
use crate::{Error, Result};
use std::{fmt, net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, select};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct TcpListenerConnectionInner {
    pub local_addr: SipAddr,
    listener: TcpListener,
    cancel_token: CancellationToken,
}

#[derive(Clone)]
pub struct TcpListenerConnection {
    pub inner: Arc<TcpListenerConnectionInner>,
}

impl TcpListenerConnection {
    pub async fn bind(local: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(local)
            .await
            .map_err(|e| io_error("listen", &SipAddr::tcp(local), None, e))?;
        let local_addr = SipAddr::tcp(listener.local_addr()?);
        info!("Created TCP listener on {}", local_addr);
        Ok(TcpListenerConnection {
            inner: Arc::new(TcpListenerConnectionInner {
                local_addr,
                listener,
                cancel_token: CancellationToken::new(),
            }),
        })
    }

    /// Waits for the next peer. Fails once the listener is closed.
    pub async fn accept(&self) -> Result<TcpConnection> {
        let (stream, remote) = select! {
            _ = self.inner.cancel_token.cancelled() => {
                return Err(Error::TransportLayerError(
                    "accept: listener closed".to_string(),
                    self.inner.local_addr.clone(),
                ));
            }
            r = self.inner.listener.accept() => {
                r.map_err(|e| io_error("accept", &self.inner.local_addr, None, e))?
            }
        };
        debug!("New TCP connection from {}", remote);
        TcpConnection::from_stream(stream, self.inner.local_addr.clone())
    }

    pub fn get_addr(&self) -> &SipAddr {
        &self.inner.local_addr
    }

    pub fn close(&self) {
        self.inner.cancel_token.cancel();
    }
}

impl fmt::Display for TcpListenerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TCP Listener {}", self.get_addr().addr)
    }
}

impl fmt::Debug for TcpListenerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
