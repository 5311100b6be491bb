use super::{key::TransactionKey, timer::Timer, transaction::Transaction};
use crate::{message::Request, transport::SipConnection};
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct Entry {
    transaction: Arc<Transaction>,
    expires_at: Instant,
}

/// Live transactions by key.
///
/// Every entry expires `ttl` after creation. Expired entries are invisible
/// to lookups and are dropped by [`Transactions::sweep`].
pub struct Transactions {
    entries: RwLock<HashMap<TransactionKey, Entry>>,
    timers: Timer<TransactionKey>,
    ttl: Duration,
}

impl Transactions {
    pub fn new(ttl: Duration) -> Self {
        Transactions {
            entries: RwLock::new(HashMap::new()),
            timers: Timer::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Looks up a live transaction.
    pub fn get(&self, key: &TransactionKey) -> Option<Arc<Transaction>> {
        let now = Instant::now();
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.transaction.clone())
    }

    /// Returns the live transaction for `key`, creating one pinned to
    /// `connection` when there is none. Lookup and creation happen under
    /// one write lock, so concurrent callers share a single transaction.
    pub fn must_get(
        &self,
        key: &TransactionKey,
        connection: &SipConnection,
        origin: Option<&Request>,
    ) -> Arc<Transaction> {
        if let Some(tx) = self.get(key) {
            return tx;
        }
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.get(key).filter(|entry| entry.expires_at > now) {
            return entry.transaction.clone();
        }
        let transaction = Arc::new(Transaction::new(
            key.clone(),
            connection.clone(),
            origin.cloned(),
        ));
        let expires_at = now + self.ttl;
        entries.insert(
            key.clone(),
            Entry {
                transaction: transaction.clone(),
                expires_at,
            },
        );
        self.timers.timeout_at(expires_at, key.clone());
        debug!(%key, "transaction created on {}", connection);
        transaction
    }

    /// Drops every transaction, live or not. Returns how many.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let removed = entries.len();
        entries.clear();
        self.timers.clear();
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops entries that expired at or before `now`. Returns how many.
    pub fn sweep(&self, now: Instant) -> usize {
        let due = self.timers.poll(now);
        if due.is_empty() {
            return 0;
        }
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let mut removed = 0;
        for key in due {
            // a key recreated after expiry carries a later deadline
            if entries.get(&key).is_some_and(|entry| entry.expires_at <= now) {
                entries.remove(&key);
                removed += 1;
            }
        }
        removed
    }

    /// Sweeps every `interval` until cancelled.
    pub async fn serve(&self, cancel_token: CancellationToken, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            select! {
                _ = cancel_token.cancelled() => {
                    info!("transaction sweep stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let removed = self.sweep(Instant::now());
                    if removed > 0 {
                        debug!(removed, remaining = self.len(), "expired transactions");
                    }
                }
            }
        }
    }
}
