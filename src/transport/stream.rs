use crate::{
    message::parser::{content_length_of_line, Packet, MAX_BODY_SIZE},
    transport::{
        connection::{
            io_error, with_deadline, Deadlines, PacketSender, KEEPALIVE_REQUEST,
            KEEPALIVE_RESPONSE,
        },
        SipAddr, SipConnection,
    },
    Error, Result,
};
use bytes::{Buf, Bytes, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    select,
    sync::Mutex,
};
use tokio_util::{codec::Decoder, sync::CancellationToken};
use tracing::{debug, info, warn};

pub(super) const MAX_SIP_MESSAGE_SIZE: usize = 65535;

/// Splits a byte stream into whole messages.
///
/// A frame ends at the first empty line plus `Content-Length` body bytes.
/// Lines may end in CRLF or a bare LF.
#[derive(Debug, Default)]
pub struct SipCodec {}

impl SipCodec {
    pub fn new() -> Self {
        Self {}
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SipCodecItem {
    Frame(Bytes),
    KeepaliveRequest,
    KeepaliveResponse,
}

impl Decoder for SipCodec {
    type Item = SipCodecItem;
    type Error = crate::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.starts_with(KEEPALIVE_REQUEST) {
            src.advance(KEEPALIVE_REQUEST.len());
            return Ok(Some(SipCodecItem::KeepaliveRequest));
        }
        if src[..] == *KEEPALIVE_RESPONSE {
            // may be the first half of a ping
            return Ok(None);
        }
        if src.starts_with(KEEPALIVE_RESPONSE) {
            src.advance(KEEPALIVE_RESPONSE.len());
            return Ok(Some(SipCodecItem::KeepaliveResponse));
        }
        while src.first() == Some(&b'\n') {
            src.advance(1);
        }

        let mut pos = 0;
        let mut content_length = 0;
        while let Some(nl) = src[pos..].iter().position(|b| *b == b'\n') {
            let line = &src[pos..pos + nl];
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            pos += nl + 1;

            if line.is_empty() {
                if content_length > MAX_BODY_SIZE {
                    src.clear();
                    return Err(Error::SipMessageError(format!(
                        "content length too large: {}",
                        content_length
                    )));
                }
                let total = pos + content_length;
                if src.len() >= total {
                    return Ok(Some(SipCodecItem::Frame(src.split_to(total).freeze())));
                }
                return Ok(None);
            }
            if let Some(len) = content_length_of_line(line) {
                content_length = len;
            }
        }

        if src.len() > MAX_SIP_MESSAGE_SIZE {
            src.clear();
            return Err(Error::SipMessageError("SIP message too large".to_string()));
        }
        Ok(None)
    }
}

pub struct StreamConnectionInner<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub local_addr: SipAddr,
    pub remote_addr: SipAddr,
    pub read_half: Mutex<Option<R>>,
    pub write_half: Mutex<W>,
    pub deadlines: Deadlines,
    pub cancel_token: CancellationToken,
}

impl<R, W> StreamConnectionInner<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(local_addr: SipAddr, remote_addr: SipAddr, read_half: R, write_half: W) -> Self {
        Self {
            local_addr,
            remote_addr,
            read_half: Mutex::new(Some(read_half)),
            write_half: Mutex::new(write_half),
            deadlines: Deadlines::default(),
            cancel_token: CancellationToken::new(),
        }
    }

    pub async fn send_raw(&self, data: &[u8]) -> Result<()> {
        let mut lock = self.write_half.lock().await;
        let limit = self.deadlines.write();
        with_deadline(limit, async {
            lock.write_all(data).await?;
            lock.flush().await
        })
        .await
        .map_err(|e| io_error("write", &self.local_addr, Some(self.remote_addr.addr), e))
    }

    /// Reads the stream until the peer closes it, a read fails or the
    /// connection is closed locally. Frames are forwarded in arrival order.
    pub async fn serve_loop(&self, sender: PacketSender, connection: SipConnection) -> Result<()> {
        let mut read_half = match self.read_half.lock().await.take() {
            Some(read_half) => read_half,
            None => {
                warn!("Connection already served: {}", self.remote_addr);
                return Ok(());
            }
        };

        let remote = self.remote_addr.addr;
        let mut codec = SipCodec::new();
        let mut buffer = BytesMut::with_capacity(MAX_SIP_MESSAGE_SIZE);
        let mut read_buf = vec![0u8; MAX_SIP_MESSAGE_SIZE];

        loop {
            let n = select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Connection closed locally: {}", self.remote_addr);
                    return Ok(());
                }
                r = with_deadline(self.deadlines.read(), read_half.read(&mut read_buf)) => {
                    r.map_err(|e| io_error("read", &self.local_addr, Some(remote), e))?
                }
            };
            if n == 0 {
                info!("Connection closed by peer: {}", self.remote_addr);
                return Ok(());
            }
            buffer.extend_from_slice(&read_buf[..n]);

            loop {
                match codec.decode(&mut buffer) {
                    Ok(Some(SipCodecItem::Frame(data))) => {
                        debug!("received frame {} bytes from {}", data.len(), remote);
                        let packet = Packet {
                            data,
                            remote,
                            connection: connection.clone(),
                        };
                        if sender.send(packet).await.is_err() {
                            warn!("parser gone, stopping stream loop: {}", self.remote_addr);
                            return Ok(());
                        }
                    }
                    Ok(Some(SipCodecItem::KeepaliveRequest)) => {
                        self.send_raw(KEEPALIVE_RESPONSE).await?;
                    }
                    Ok(Some(SipCodecItem::KeepaliveResponse)) => {}
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Error decoding frame from {}: {}", remote, e);
                        break;
                    }
                }
            }
        }
    }

    pub async fn close(&self) -> Result<()> {
        self.cancel_token.cancel();
        let mut write_half = self.write_half.lock().await;
        write_half
            .shutdown()
            .await
            .map_err(|e| io_error("close", &self.local_addr, Some(self.remote_addr.addr), e))
    }
}
