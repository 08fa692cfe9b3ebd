//! In-process coordination backend
//!
//! Behaves like a single consistent store: leases expire on tokio's clock
//! (so paused-time tests can advance past a TTL), prefix reads are sorted and
//! paginated, and locks are truly mutually exclusive across leases. It also
//! records every granted operation and the highest number of simultaneous
//! holders ever observed per lock, which tests use as the exclusivity check.

use super::{CoordinationBackend, KeyValue, LeaseId, LockKey, Page};
use crate::common::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;

/// Re-check period for blocked lock waiters
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Operation recorded by the in-memory backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendOp {
    Put { key: String, lease: LeaseId },
    GetPrefix { prefix: String },
    LeaseGrant { lease: LeaseId },
    KeepAlive { lease: LeaseId },
    LeaseRevoke { lease: LeaseId },
    Lock { name: String, lease: LeaseId },
    Unlock { name: String, lease: LeaseId },
}

struct Entry {
    value: String,
    lease: LeaseId,
}

struct LeaseState {
    ttl: Duration,
    deadline: Instant,
}

struct State {
    kv: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, LeaseState>,
    holders: HashMap<String, BTreeSet<LeaseId>>,
    max_holders: HashMap<String, usize>,
    ops: Vec<BackendOp>,
    next_lease: LeaseId,
    available: bool,
}

impl State {
    fn check_available(&self) -> Result<()> {
        if self.available {
            Ok(())
        } else {
            Err(Error::BackendUnavailable("in-memory backend is offline".into()))
        }
    }

    /// Drop every lease past its deadline. Returns true if a lock was freed.
    fn expire(&mut self, now: Instant) -> bool {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        let mut freed = false;
        for lease in expired {
            tracing::debug!(lease, "Lease expired");
            freed |= self.drop_lease(lease);
        }
        freed
    }

    fn drop_lease(&mut self, lease: LeaseId) -> bool {
        self.leases.remove(&lease);
        self.kv.retain(|_, entry| entry.lease != lease);

        let mut freed = false;
        for holders in self.holders.values_mut() {
            freed |= holders.remove(&lease);
        }
        freed
    }

    fn lease_alive(&self, lease: LeaseId) -> Result<()> {
        if self.leases.contains_key(&lease) {
            Ok(())
        } else {
            Err(Error::LeaseExpired(lease))
        }
    }
}

pub struct MemoryBackend {
    state: Mutex<State>,
    released: Notify,
    stalled: watch::Sender<bool>,
    page_limit: u32,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_page_limit(0)
    }

    /// Cap every prefix page at `page_limit` keys (0 = unlimited), forcing
    /// callers to paginate.
    pub fn with_page_limit(page_limit: u32) -> Self {
        Self {
            state: Mutex::new(State {
                kv: BTreeMap::new(),
                leases: HashMap::new(),
                holders: HashMap::new(),
                max_holders: HashMap::new(),
                ops: Vec::new(),
                next_lease: 0x1000,
                available: true,
            }),
            released: Notify::new(),
            stalled: watch::Sender::new(false),
            page_limit,
        }
    }

    /// Simulate an outage: every call fails with `BackendUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
    }

    /// Simulate a hung backend: while stalled, every call (including lock
    /// waiters already queued) blocks instead of failing.
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.send_replace(stalled);
    }

    async fn wait_unstalled(&self) {
        let mut rx = self.stalled.subscribe();
        // the sender lives as long as self
        let _ = rx.wait_for(|stalled| !*stalled).await;
    }

    /// Expire a lease immediately, as if its owner had crashed.
    pub fn expire_lease(&self, lease: LeaseId) {
        let freed = self.state.lock().drop_lease(lease);
        if freed {
            self.released.notify_waiters();
        }
    }

    /// Current holder of a lock, if any.
    pub fn lock_holder(&self, name: &str) -> Option<LeaseId> {
        let mut state = self.state.lock();
        if state.expire(Instant::now()) {
            self.released.notify_waiters();
        }
        state
            .holders
            .get(name)
            .and_then(|holders| holders.iter().next().copied())
    }

    /// Highest number of leases ever holding `name` at the same time.
    pub fn max_concurrent_holders(&self, name: &str) -> usize {
        self.state.lock().max_holders.get(name).copied().unwrap_or(0)
    }

    /// Highest simultaneous holder count across every lock ever taken.
    pub fn max_concurrent_holders_any(&self) -> usize {
        self.state
            .lock()
            .max_holders
            .values()
            .copied()
            .max()
            .unwrap_or(0)
    }

    /// Every granted operation, in order.
    pub fn ops(&self) -> Vec<BackendOp> {
        self.state.lock().ops.clone()
    }

    pub fn lease_alive(&self, lease: LeaseId) -> bool {
        let mut state = self.state.lock();
        state.expire(Instant::now());
        state.leases.contains_key(&lease)
    }

    /// Lock bookkeeping under the state mutex. `Ok(None)` means contended.
    fn try_grant(&self, name: &str, lease: LeaseId) -> Result<Option<LockKey>> {
        let mut state = self.state.lock();
        state.check_available()?;
        if state.expire(Instant::now()) {
            self.released.notify_waiters();
        }
        state.lease_alive(lease)?;

        let holders = state.holders.entry(name.to_string()).or_default();
        if holders.iter().any(|holder| *holder != lease) {
            return Ok(None);
        }
        holders.insert(lease);
        let count = holders.len();

        let max = state.max_holders.entry(name.to_string()).or_insert(0);
        *max = (*max).max(count);
        state.ops.push(BackendOp::Lock {
            name: name.to_string(),
            lease,
        });

        Ok(Some(self.lock_key(name, lease)))
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationBackend for MemoryBackend {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn put(&self, key: &str, value: &str, lease: LeaseId) -> Result<()> {
        self.wait_unstalled().await;
        let mut state = self.state.lock();
        state.check_available()?;
        state.expire(Instant::now());
        state.lease_alive(lease)?;

        state.kv.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                lease,
            },
        );
        state.ops.push(BackendOp::Put {
            key: key.to_string(),
            lease,
        });
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str, after: Option<&str>, limit: u32) -> Result<Page> {
        self.wait_unstalled().await;
        let mut state = self.state.lock();
        state.check_available()?;
        if state.expire(Instant::now()) {
            self.released.notify_waiters();
        }

        let limit = match (limit, self.page_limit) {
            (0, 0) => usize::MAX,
            (0, cap) => cap as usize,
            (requested, 0) => requested as usize,
            (requested, cap) => requested.min(cap) as usize,
        };
        let lower = match after {
            Some(key) => Bound::Excluded(key.to_string()),
            None => Bound::Included(prefix.to_string()),
        };

        let (kvs, more) = {
            let mut matching = state
                .kv
                .range((lower, Bound::Unbounded))
                .take_while(|(key, _)| key.starts_with(prefix))
                .map(|(key, entry)| KeyValue {
                    key: key.clone(),
                    value: entry.value.clone(),
                });
            let kvs: Vec<KeyValue> = matching.by_ref().take(limit).collect();
            (kvs, matching.next().is_some())
        };

        state.ops.push(BackendOp::GetPrefix {
            prefix: prefix.to_string(),
        });
        Ok(Page { kvs, more })
    }

    async fn lease_grant(&self, ttl: Duration) -> Result<LeaseId> {
        self.wait_unstalled().await;
        let mut state = self.state.lock();
        state.check_available()?;

        let lease = state.next_lease;
        state.next_lease += 1;
        state.leases.insert(
            lease,
            LeaseState {
                ttl,
                deadline: Instant::now() + ttl,
            },
        );
        state.ops.push(BackendOp::LeaseGrant { lease });
        Ok(lease)
    }

    async fn lease_keep_alive_once(&self, lease: LeaseId) -> Result<()> {
        self.wait_unstalled().await;
        let mut state = self.state.lock();
        state.check_available()?;
        let now = Instant::now();
        if state.expire(now) {
            self.released.notify_waiters();
        }

        let entry = state.leases.get_mut(&lease).ok_or(Error::LeaseExpired(lease))?;
        entry.deadline = now + entry.ttl;
        state.ops.push(BackendOp::KeepAlive { lease });
        Ok(())
    }

    async fn lease_revoke(&self, lease: LeaseId) -> Result<()> {
        self.wait_unstalled().await;
        let freed = {
            let mut state = self.state.lock();
            state.check_available()?;
            state.ops.push(BackendOp::LeaseRevoke { lease });
            state.drop_lease(lease)
        };
        if freed {
            self.released.notify_waiters();
        }
        Ok(())
    }

    async fn lock(&self, name: &str, lease: LeaseId) -> Result<LockKey> {
        loop {
            self.wait_unstalled().await;
            if let Some(key) = self.try_grant(name, lease)? {
                return Ok(key);
            }
            tokio::select! {
                _ = self.released.notified() => {}
                _ = tokio::time::sleep(LOCK_POLL_INTERVAL) => {}
            }
        }
    }

    fn lock_key(&self, name: &str, lease: LeaseId) -> LockKey {
        LockKey {
            name: name.to_string(),
            lease,
            token: format!("{}/{:x}", name, lease).into_bytes(),
        }
    }

    async fn unlock(&self, key: &LockKey) -> Result<()> {
        self.wait_unstalled().await;
        let freed = {
            let mut state = self.state.lock();
            state.check_available()?;
            let freed = state
                .holders
                .get_mut(&key.name)
                .is_some_and(|holders| holders.remove(&key.lease));
            if freed {
                state.ops.push(BackendOp::Unlock {
                    name: key.name.clone(),
                    lease: key.lease,
                });
            }
            freed
        };
        if freed {
            self.released.notify_waiters();
        }
        Ok(())
    }
}
