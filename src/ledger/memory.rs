//! In-memory reference ledger.
//!
//! Implements the full ledger contract for tests, demos, and local
//! operation: a global commit lock serializes transactions, events append
//! in confirmation order, and the clock is controllable so expiry behavior
//! can be exercised without waiting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use super::{Ledger, LedgerEvent, LedgerTxn, StateKey};
use crate::types::Result;

#[derive(Default)]
struct LedgerInner {
    state: HashMap<String, Vec<u8>>,
    events: Vec<LedgerEvent>,
}

/// In-memory ledger with a test-controllable clock.
pub struct MemoryLedger {
    inner: Mutex<LedgerInner>,
    clock: Arc<AtomicU64>,
}

impl MemoryLedger {
    /// Create a ledger whose clock starts at the current system time.
    pub fn new() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self::with_time(now)
    }

    /// Create a ledger with an explicit starting time (unix seconds).
    pub fn with_time(now: u64) -> Self {
        Self {
            inner: Mutex::new(LedgerInner::default()),
            clock: Arc::new(AtomicU64::new(now)),
        }
    }

    /// Advance the ledger clock by `secs`. Subsequent transactions and
    /// reads observe the new time.
    pub fn advance(&self, secs: u64) {
        self.clock.fetch_add(secs, Ordering::SeqCst);
    }

    /// Set the ledger clock to an absolute time (unix seconds).
    pub fn set_time(&self, now: u64) {
        self.clock.store(now, Ordering::SeqCst);
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

struct MemoryTxn<'a> {
    guard: MutexGuard<'a, LedgerInner>,
    /// Buffered writes in order; `None` marks a deletion.
    writes: Vec<(String, Option<Vec<u8>>)>,
    events: Vec<LedgerEvent>,
    now: u64,
}

impl LedgerTxn for MemoryTxn<'_> {
    fn get(&self, key: &StateKey) -> Option<Vec<u8>> {
        let storage_key = key.storage_key();
        // Latest buffered write for the key wins over committed state.
        for (k, v) in self.writes.iter().rev() {
            if *k == storage_key {
                return v.clone();
            }
        }
        self.guard.state.get(&storage_key).cloned()
    }

    fn put(&mut self, key: StateKey, value: Vec<u8>) {
        self.writes.push((key.storage_key(), Some(value)));
    }

    fn delete(&mut self, key: &StateKey) {
        self.writes.push((key.storage_key(), None));
    }

    fn emit(&mut self, event: LedgerEvent) {
        self.events.push(event);
    }

    fn now(&self) -> u64 {
        self.now
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        let writes = std::mem::take(&mut self.writes);
        let events = std::mem::take(&mut self.events);
        debug!(
            writes = writes.len(),
            events = events.len(),
            "Committing ledger transaction"
        );
        for (key, value) in writes {
            match value {
                Some(v) => {
                    self.guard.state.insert(key, v);
                }
                None => {
                    self.guard.state.remove(&key);
                }
            }
        }
        self.guard.events.extend(events);
        Ok(())
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn begin<'a>(&'a self) -> Result<Box<dyn LedgerTxn + 'a>> {
        let guard = self.inner.lock().await;
        Ok(Box::new(MemoryTxn {
            guard,
            writes: Vec::new(),
            events: Vec::new(),
            now: self.clock.load(Ordering::SeqCst),
        }))
    }

    async fn get(&self, key: &StateKey) -> Result<Option<Vec<u8>>> {
        let inner = self.inner.lock().await;
        Ok(inner.state.get(&key.storage_key()).cloned())
    }

    async fn events(&self) -> Result<Vec<LedgerEvent>> {
        let inner = self.inner.lock().await;
        Ok(inner.events.clone())
    }

    async fn now(&self) -> Result<u64> {
        Ok(self.clock.load(Ordering::SeqCst))
    }
}
