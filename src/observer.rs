//! Keyed, single-shot, time-bounded wait/notify.
//!
//! A handler that needs an out-of-band confirmation registers a callback
//! under the device key. Whichever flow later delivers the confirmation
//! calls [`Observer::notify`]. Entries nobody notifies within their TTL are
//! dropped without the callback ever running.
use crate::transaction::timer::Timer;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::{Duration, Instant},
};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Returns `true` once the awaited event has been handled.
pub type ObserverFn = Box<dyn FnMut(&str, &[&str]) -> bool + Send>;

struct Entry {
    id: u64,
    deadline: Instant,
    callback: ObserverFn,
}

#[derive(Default)]
pub struct Observer {
    entries: Mutex<HashMap<String, Entry>>,
    timers: Timer<(String, u64)>,
    last_id: AtomicU64,
}

impl Observer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `callback` for `key` until `ttl` elapses.
    ///
    /// A live entry under the same key is replaced and its callback dropped.
    pub fn register<F>(&self, key: impl Into<String>, ttl: Duration, callback: F)
    where
        F: FnMut(&str, &[&str]) -> bool + Send + 'static,
    {
        let key = key.into();
        let id = self.last_id.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + ttl;
        let replaced = self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                key.clone(),
                Entry {
                    id,
                    deadline,
                    callback: Box::new(callback),
                },
            )
            .is_some();
        if replaced {
            debug!(key = %key, "observer replaced");
        }
        self.timers.timeout_at(deadline, (key, id));
    }

    /// Runs the callback registered for `key`.
    ///
    /// The entry is removed when the callback reports completion and kept
    /// otherwise. Returns whether a callback ran.
    pub fn notify(&self, key: &str, args: &[&str]) -> bool {
        let mut entry = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            match entries.remove(key) {
                Some(entry) => entry,
                None => return false,
            }
        };
        if entry.deadline <= Instant::now() {
            debug!(key, "observer expired before notify");
            return false;
        }

        // runs without the lock so the callback may register again
        if (entry.callback)(key, args) {
            return true;
        }
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.entry(key.to_string()).or_insert(entry);
        true
    }

    /// Drops entries whose deadline passed at or before `now`.
    pub fn sweep(&self, now: Instant) -> usize {
        let due = self.timers.poll(now);
        if due.is_empty() {
            return 0;
        }
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut removed = 0;
        for (key, id) in due {
            if entries.get(&key).is_some_and(|entry| entry.id == id) {
                entries.remove(&key);
                removed += 1;
            }
        }
        removed
    }

    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .is_some_and(|entry| entry.deadline > now)
    }

    /// Live entries; expired ones awaiting the sweep are not counted.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|entry| entry.deadline > now)
            .count()
    }

    /// Drops every entry without running its callback.
    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.timers.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sweeps every `interval` until cancelled.
    pub async fn run(&self, cancel_token: CancellationToken, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            select! {
                _ = cancel_token.cancelled() => {
                    info!("observer sweep stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let removed = self.sweep(Instant::now());
                    if removed > 0 {
                        debug!(removed, "expired observers");
                    }
                }
            }
        }
    }
}
