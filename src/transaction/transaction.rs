use super::key::TransactionKey;
use crate::{
    message::{Message, Request, Response},
    transport::SipConnection,
    Error, Result,
};
use std::{
    sync::RwLock,
    time::{Duration, Instant},
};
use tokio::sync::{
    mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    Mutex,
};
use tracing::{debug, instrument};

/// RTT estimate, the base of every protocol timer.
pub const T1: Duration = Duration::from_millis(500);
/// Default lifetime of a registry entry, 64*T1.
pub const TRANSACTION_TTL: Duration = Duration::from_secs(32);

/// One request/response exchange.
///
/// Replies leave through the connection the transaction is pinned to. For
/// UDP that is the server's shared socket, for TCP the peer's connection.
/// Responses correlated to the transaction queue up in arrival order until
/// [`Transaction::receive_response`] takes them.
pub struct Transaction {
    key: TransactionKey,
    connection: SipConnection,
    origin: RwLock<Option<Request>>,
    responses_tx: UnboundedSender<Response>,
    responses_rx: Mutex<UnboundedReceiver<Response>>,
    created_at: Instant,
}

impl Transaction {
    pub(crate) fn new(
        key: TransactionKey,
        connection: SipConnection,
        origin: Option<Request>,
    ) -> Self {
        let (responses_tx, responses_rx) = unbounded_channel();
        Transaction {
            key,
            connection,
            origin: RwLock::new(origin),
            responses_tx,
            responses_rx: Mutex::new(responses_rx),
            created_at: Instant::now(),
        }
    }

    pub fn key(&self) -> &TransactionKey {
        &self.key
    }

    pub fn connection(&self) -> &SipConnection {
        &self.connection
    }

    /// The request that opened the exchange.
    pub fn origin(&self) -> Option<Request> {
        self.origin.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Sends an outbound request on the pinned connection.
    #[instrument(skip_all, fields(key = %self.key))]
    pub async fn request(&self, req: Request) -> Result<()> {
        let destination = req.destination;
        debug!(
            "sending {} to {:?} via {}",
            req.method(),
            destination,
            self.connection
        );
        self.connection.send_raw(&req.to_bytes(), destination).await?;
        *self.origin.write().unwrap_or_else(|e| e.into_inner()) = Some(req);
        Ok(())
    }

    /// Sends a response to the origin's source unless the response names
    /// its own destination.
    #[instrument(skip_all, fields(key = %self.key))]
    pub async fn respond(&self, resp: Response) -> Result<()> {
        let destination = resp
            .destination
            .or_else(|| self.origin().and_then(|req| req.source));
        debug!(
            "responding {} to {:?} via {}",
            resp.status_code(),
            destination,
            self.connection
        );
        self.connection
            .send_raw(&resp.to_bytes(), destination)
            .await
    }

    /// Queues a correlated inbound response.
    pub(crate) fn receive(&self, resp: Response) {
        self.responses_tx.send(resp).ok();
    }

    /// Next correlated response in arrival order.
    pub async fn receive_response(&self) -> Option<Response> {
        self.responses_rx.lock().await.recv().await
    }

    /// Waits for the first non-provisional response.
    pub async fn wait_final_response(&self, timeout: Duration) -> Result<Response> {
        let wait = async {
            loop {
                match self.receive_response().await {
                    Some(resp) if resp.is_provisional() => continue,
                    Some(resp) => return Ok(resp),
                    None => {
                        return Err(Error::TransactionError(
                            "response channel closed".to_string(),
                            self.key.clone(),
                        ))
                    }
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(r) => r,
            Err(_) => Err(Error::TransactionError(
                format!("no final response within {:?}", timeout),
                self.key.clone(),
            )),
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Transaction({} via {})", self.key, self.connection)
    }
}
