//! In-flight request ledger.
//!
//! Tracks which request keys are currently on the wire and keeps the raw
//! result of very recently completed ones for a short window. The window is
//! deliberately sub-second: it collapses true double-submits, it is not a
//! cache.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::request::RequestKey;

#[derive(Debug, Clone)]
enum Slot {
    InFlight { started_at: Instant },
    Completed { finished_at: Instant, result: Arc<Vec<u8>> },
}

#[derive(Debug)]
pub struct DedupLedger {
    window: Duration,
    slots: DashMap<String, Slot>,
}

impl DedupLedger {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            slots: DashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Registers `key` as in flight. Returns `false` when an identical request
    /// is already in flight or finished inside the dedup window.
    pub fn begin_if_new(&self, key: &RequestKey) -> bool {
        self.prune();
        let now = Instant::now();
        match self.slots.entry(key.as_str().to_string()) {
            Entry::Occupied(mut occupied) => match occupied.get() {
                Slot::InFlight { .. } => false,
                Slot::Completed { finished_at, .. }
                    if now.duration_since(*finished_at) < self.window =>
                {
                    false
                }
                Slot::Completed { .. } => {
                    occupied.insert(Slot::InFlight { started_at: now });
                    true
                }
            },
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::InFlight { started_at: now });
                true
            }
        }
    }

    /// Clears the in-flight marker; with a result, keeps it for the window.
    pub fn finish(&self, key: &RequestKey, result: Option<Vec<u8>>) {
        match result {
            Some(bytes) => {
                self.slots.insert(
                    key.as_str().to_string(),
                    Slot::Completed {
                        finished_at: Instant::now(),
                        result: Arc::new(bytes),
                    },
                );
            }
            None => {
                self.slots
                    .remove_if(key.as_str(), |_, slot| matches!(slot, Slot::InFlight { .. }));
            }
        }
    }

    /// Scoped registration: `None` when the key is not new. The returned guard
    /// calls [`DedupLedger::finish`] when dropped.
    pub fn begin(self: &Arc<Self>, key: &RequestKey) -> Option<InFlightGuard> {
        if self.begin_if_new(key) {
            Some(InFlightGuard {
                ledger: Arc::clone(self),
                key: key.clone(),
                result: None,
            })
        } else {
            None
        }
    }

    pub fn is_in_flight(&self, key: &RequestKey) -> bool {
        matches!(
            self.slots.get(key.as_str()).as_deref(),
            Some(Slot::InFlight { .. })
        )
    }

    /// Raw result of an identical request that finished inside the window.
    pub fn recent_result(&self, key: &RequestKey) -> Option<Arc<Vec<u8>>> {
        match self.slots.get(key.as_str()).as_deref() {
            Some(Slot::Completed {
                finished_at,
                result,
            }) if finished_at.elapsed() < self.window => Some(Arc::clone(result)),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn prune(&self) {
        let window = self.window;
        self.slots.retain(|_, slot| match slot {
            Slot::InFlight { started_at } => {
                if started_at.elapsed() > Duration::from_secs(300) {
                    debug!("🧹 Dropping in-flight marker older than 5 minutes");
                    false
                } else {
                    true
                }
            }
            Slot::Completed { finished_at, .. } => finished_at.elapsed() < window,
        });
    }
}

/// Releases its ledger entry on every exit path.
#[derive(Debug)]
pub struct InFlightGuard {
    ledger: Arc<DedupLedger>,
    key: RequestKey,
    result: Option<Vec<u8>>,
}

impl InFlightGuard {
    /// Records the successful raw result to be shared inside the dedup window.
    pub fn complete(mut self, result: Vec<u8>) {
        self.result = Some(result);
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.ledger.finish(&self.key, self.result.take());
    }
}
