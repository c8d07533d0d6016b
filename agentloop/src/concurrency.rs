//! Per-key admission control.
//!
//! Each key owns a bounded slot pool. Waiters are served in FIFO order and a slot
//! is only ever handed out through a [`SlotGuard`], whose drop releases it.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::core::budget::{deadline_after, next_tick, remaining_budget};
use crate::core::key::SlotKey;
use crate::io::config::{ConcurrencyConfig, OnFull};

const CANCEL_POLL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConcurrencyRejected {
    #[error("no free slot for '{key}' (capacity {capacity})")]
    Full { key: String, capacity: usize },
    #[error("timed out after {}ms waiting for a slot for '{key}'", .waited.as_millis())]
    WaitTimeout { key: String, waited: Duration },
    #[error("cancelled while waiting for a slot for '{key}'")]
    Cancelled { key: String },
}

/// Admission policy for a manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcurrencySettings {
    pub default_capacity: usize,
    pub on_full: OnFull,
    pub wait_timeout: Option<Duration>,
    pub capacity: BTreeMap<String, usize>,
}

impl From<&ConcurrencyConfig> for ConcurrencySettings {
    fn from(config: &ConcurrencyConfig) -> Self {
        Self {
            default_capacity: config.default_capacity.max(1),
            on_full: config.on_full,
            wait_timeout: config.wait_timeout_ms.map(Duration::from_millis),
            capacity: config
                .capacity
                .iter()
                .map(|(key, cap)| (SlotKey::parse(key).to_string(), (*cap).max(1)))
                .collect(),
        }
    }
}

impl ConcurrencySettings {
    /// Capacity for a key: full key first, then its namespace, then the default.
    pub fn capacity_for(&self, key: &SlotKey) -> usize {
        key.lookup_chain()
            .iter()
            .find_map(|candidate| self.capacity.get(candidate).copied())
            .unwrap_or(self.default_capacity)
    }
}

#[derive(Debug)]
struct SlotState {
    capacity: usize,
    held: usize,
    queue: VecDeque<u64>,
}

impl SlotState {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            held: 0,
            queue: VecDeque::new(),
        }
    }
}

#[derive(Debug, Default)]
struct Pools {
    slots: HashMap<String, SlotState>,
    next_ticket: u64,
}

#[derive(Debug)]
struct Shared {
    pools: Mutex<Pools>,
    freed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Pools> {
        self.pools.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, key: &str) {
        let mut pools = self.lock();
        if let Some(slot) = pools.slots.get_mut(key) {
            slot.held = slot.held.saturating_sub(1);
            debug!(key, held = slot.held, "slot released");
        }
        drop(pools);
        self.freed.notify_all();
    }
}

#[derive(Debug)]
pub struct ConcurrencyManager {
    settings: ConcurrencySettings,
    shared: Arc<Shared>,
}

impl ConcurrencyManager {
    pub fn new(settings: ConcurrencySettings) -> Self {
        Self {
            settings,
            shared: Arc::new(Shared {
                pools: Mutex::new(Pools::default()),
                freed: Condvar::new(),
            }),
        }
    }

    pub fn settings(&self) -> &ConcurrencySettings {
        &self.settings
    }

    /// Take a slot for `key`, waiting or rejecting per the configured policy.
    ///
    /// A cancelled or timed-out waiter leaves the queue without holding a slot.
    pub fn acquire(
        &self,
        key: &SlotKey,
        cancel: Option<&CancelToken>,
    ) -> Result<SlotGuard, ConcurrencyRejected> {
        let name = key.to_string();
        let capacity = self.settings.capacity_for(key);
        let started = Instant::now();
        let deadline = self.settings.wait_timeout.map(|timeout| deadline_after(started, timeout));

        let mut pools = self.shared.lock();
        let ticket = pools.next_ticket;
        pools.next_ticket += 1;
        let slot = pools
            .slots
            .entry(name.clone())
            .or_insert_with(|| SlotState::new(capacity));
        let capacity = slot.capacity;
        if slot.held >= capacity && self.settings.on_full == OnFull::Reject {
            debug!(key = %name, capacity, "slot pool full, rejecting");
            return Err(ConcurrencyRejected::Full {
                key: name,
                capacity,
            });
        }
        slot.queue.push_back(ticket);

        loop {
            let slot = pools
                .slots
                .entry(name.clone())
                .or_insert_with(|| SlotState::new(capacity));
            if slot.held < slot.capacity && slot.queue.front() == Some(&ticket) {
                slot.queue.pop_front();
                slot.held += 1;
                debug!(key = %name, held = slot.held, capacity = slot.capacity, "slot acquired");
                let more_free = slot.held < slot.capacity && !slot.queue.is_empty();
                drop(pools);
                if more_free {
                    self.shared.freed.notify_all();
                }
                return Ok(SlotGuard {
                    key: name,
                    shared: Arc::clone(&self.shared),
                    released: false,
                });
            }

            let failure = if cancel.is_some_and(CancelToken::is_cancelled) {
                Some(ConcurrencyRejected::Cancelled { key: name.clone() })
            } else if deadline.is_some_and(|d| remaining_budget(d).is_zero()) {
                Some(ConcurrencyRejected::WaitTimeout {
                    key: name.clone(),
                    waited: started.elapsed(),
                })
            } else {
                None
            };
            if let Some(failure) = failure {
                slot.queue.retain(|t| *t != ticket);
                drop(pools);
                // The next waiter may now be at the head.
                self.shared.freed.notify_all();
                warn!(key = %name, err = %failure, "slot acquisition abandoned");
                return Err(failure);
            }

            let wait = match deadline {
                Some(deadline) => next_tick(deadline, CANCEL_POLL),
                None => CANCEL_POLL,
            };
            pools = self
                .shared
                .freed
                .wait_timeout(pools, wait)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Held slot count for `key`.
    pub fn held(&self, key: &SlotKey) -> usize {
        self.shared
            .lock()
            .slots
            .get(&key.to_string())
            .map_or(0, |slot| slot.held)
    }

    /// Callers queued for `key`.
    pub fn waiting(&self, key: &SlotKey) -> usize {
        self.shared
            .lock()
            .slots
            .get(&key.to_string())
            .map_or(0, |slot| slot.queue.len())
    }
}

/// A held slot. Released exactly once, on [`SlotGuard::release`] or drop.
#[derive(Debug)]
pub struct SlotGuard {
    key: String,
    shared: Arc<Shared>,
    released: bool,
}

impl SlotGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.shared.release(&self.key);
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.release();
    }
}
