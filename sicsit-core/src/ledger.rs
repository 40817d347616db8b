//! Cross-session nonce ledger.
//!
//! A bounded, time-windowed set of `(entity_id, nonce)` pairs shared by all
//! sessions of a node. Entries live for the ledger window, which must outlast
//! every message the handshake would still accept as fresh; once an entry
//! expires the message that carried it is already stale.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::error::{SitError, SitResult};

/// Default retention window.
pub const DEFAULT_NONCE_WINDOW: Duration = Duration::from_secs(90);

/// Default maximum number of live entries.
pub const DEFAULT_NONCE_CAPACITY: usize = 65_536;

type NonceKey = (String, String);

#[derive(Debug, Default)]
struct LedgerInner {
    expiry: HashMap<NonceKey, Instant>,
    /// Insertion order; expiries are non-decreasing front to back.
    order: VecDeque<(Instant, NonceKey)>,
}

impl LedgerInner {
    fn evict(&mut self, now: Instant) {
        while let Some((expires, _)) = self.order.front() {
            if *expires > now {
                break;
            }
            if let Some((expires, key)) = self.order.pop_front() {
                // A later burn may have extended this key.
                if self.expiry.get(&key).is_some_and(|current| *current <= expires) {
                    self.expiry.remove(&key);
                }
            }
        }
    }

    /// Drop the live entry closest to expiry.
    fn evict_oldest(&mut self) {
        while let Some((expires, key)) = self.order.pop_front() {
            if self.expiry.get(&key).is_some_and(|current| *current <= expires) {
                self.expiry.remove(&key);
                return;
            }
        }
    }

    fn insert(&mut self, key: NonceKey, expires: Instant) {
        self.expiry.insert(key.clone(), expires);
        self.order.push_back((expires, key));
    }
}

/// Shared anti-replay ledger.
#[derive(Debug)]
pub struct NonceLedger {
    window: Duration,
    capacity: usize,
    inner: Mutex<LedgerInner>,
}

impl Default for NonceLedger {
    fn default() -> Self {
        Self::new(DEFAULT_NONCE_WINDOW, DEFAULT_NONCE_CAPACITY)
    }
}

impl NonceLedger {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            capacity: capacity.max(1),
            inner: Mutex::new(LedgerInner::default()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Record a nonce as used. Fails if it was already consumed or burned.
    pub fn consume(&self, entity_id: &str, nonce: &str) -> SitResult<()> {
        self.consume_at(entity_id, nonce, Instant::now())
    }

    pub fn consume_at(&self, entity_id: &str, nonce: &str, now: Instant) -> SitResult<()> {
        let mut inner = self.lock();
        inner.evict(now);

        let key = (entity_id.to_string(), nonce.to_string());
        if inner.expiry.contains_key(&key) {
            return Err(SitError::ReplayDetected {
                entity_id: key.0,
                nonce: key.1,
            });
        }
        if inner.expiry.len() >= self.capacity {
            tracing::warn!(live = inner.expiry.len(), "Nonce ledger saturated");
            return Err(SitError::LedgerSaturated(inner.expiry.len()));
        }

        inner.insert(key, now + self.window);
        Ok(())
    }

    /// Invalidate a nonce so it can never be consumed within the window.
    /// Always succeeds. A full ledger makes room by dropping its oldest
    /// entry, so the live count never exceeds capacity.
    pub fn burn(&self, entity_id: &str, nonce: &str) {
        self.burn_at(entity_id, nonce, Instant::now())
    }

    pub fn burn_at(&self, entity_id: &str, nonce: &str, now: Instant) {
        let mut inner = self.lock();
        inner.evict(now);

        let key = (entity_id.to_string(), nonce.to_string());
        if !inner.expiry.contains_key(&key) && inner.expiry.len() >= self.capacity {
            inner.evict_oldest();
            tracing::warn!(capacity = self.capacity, "Nonce ledger full, oldest entry dropped for burn");
        }
        inner.insert(key, now + self.window);
    }

    pub fn contains(&self, entity_id: &str, nonce: &str) -> bool {
        let mut inner = self.lock();
        inner.evict(Instant::now());
        inner
            .expiry
            .contains_key(&(entity_id.to_string(), nonce.to_string()))
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let mut inner = self.lock();
        inner.evict(Instant::now());
        inner.expiry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LedgerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
