//! Injected storage behind the coalescing registry: completed results with a
//! TTL, and the pending registry used to join in-flight work.
//!
//! The pending side is synchronous: create-or-join is a single `DashMap`
//! entry operation, so two callers can never both observe "no pending" for
//! the same key.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::ResolutionError;
use crate::normalize::CacheKey;
use crate::types::{Resolution, TaskTicket};

/// Terminal outcome broadcast to every waiter of a pending request.
pub type Outcome = Result<Resolution, ResolutionError>;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub value: Resolution,
    pub fetched_at: DateTime<Utc>,
    stored_at: Instant,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn new(key: CacheKey, value: Resolution, ttl: Duration) -> Self {
        Self {
            key,
            value,
            fetched_at: Utc::now(),
            stored_at: Instant::now(),
            ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.stored_at.elapsed() >= self.ttl
    }

    pub fn age(&self) -> Duration {
        self.stored_at.elapsed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingPhase {
    /// A driver is working on it.
    InFlight,
    /// The last driver ran out of budget; the ticket is kept for resumption.
    Parked,
}

#[derive(Debug)]
struct PendingRequest {
    cache_key: CacheKey,
    ticket: Option<TaskTicket>,
    created_at: Instant,
    updated_at: Instant,
    generation: u64,
    phase: PendingPhase,
    waiters: Vec<oneshot::Sender<Outcome>>,
}

impl PendingRequest {
    fn snapshot(&self) -> PendingSnapshot {
        PendingSnapshot {
            cache_key: self.cache_key.clone(),
            ticket: self.ticket.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            generation: self.generation,
            phase: self.phase,
            waiters: self.waiters.len(),
        }
    }
}

/// Read-only view of a pending request.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingSnapshot {
    pub cache_key: CacheKey,
    pub ticket: Option<TaskTicket>,
    pub created_at: Instant,
    pub updated_at: Instant,
    pub generation: u64,
    pub phase: PendingPhase,
    pub waiters: usize,
}

/// Result of [`ResolutionStore::create_pending_if_absent`]. Every caller,
/// creator included, is subscribed to the eventual outcome.
#[derive(Debug)]
pub struct PendingJoin {
    /// This caller must drive the work.
    pub created: bool,
    pub generation: u64,
    /// Ticket of a parked request being taken over; poll it instead of
    /// submitting again.
    pub resume: Option<TaskTicket>,
    pub subscription: oneshot::Receiver<Outcome>,
}

#[async_trait]
pub trait ResolutionStore: Send + Sync {
    /// Unexpired cache entry for `key`.
    async fn get(&self, key: &CacheKey) -> Option<CacheEntry>;

    async fn set(&self, key: &CacheKey, value: Resolution, ttl: Duration);

    /// Drop expired cache entries, returning how many were removed.
    async fn evict_expired(&self) -> usize;

    fn cache_len(&self) -> u64;

    fn get_pending(&self, key: &CacheKey) -> Option<PendingSnapshot>;

    /// Atomically join the pending request for `key`, creating it if there
    /// is none, resuming it if it is parked, or replacing it if it is stale.
    fn create_pending_if_absent(&self, key: &CacheKey) -> PendingJoin;

    /// Record the ticket obtained by the driver of `generation`.
    fn attach_ticket(&self, key: &CacheKey, generation: u64, ticket: TaskTicket) -> bool;

    /// Finish the driver of `generation`. A pending outcome parks the entry;
    /// anything else removes it. Waiters are notified in subscription order.
    /// Returns the number of waiters notified.
    fn complete_pending(&self, key: &CacheKey, generation: u64, outcome: &Outcome) -> usize;

    /// Drop pending requests untouched for longer than the stale age.
    fn reap_stale_pending(&self) -> usize;

    fn pending_len(&self) -> usize;
}

/// Process-local store: a moka cache plus a concurrent pending map.
pub struct MemoryStore {
    cache: moka::future::Cache<CacheKey, CacheEntry>,
    pending: DashMap<CacheKey, PendingRequest>,
    next_generation: AtomicU64,
    stale_after: Duration,
}

impl MemoryStore {
    pub fn new(capacity: u64, stale_after: Duration) -> Self {
        Self {
            cache: moka::future::Cache::builder().max_capacity(capacity).build(),
            pending: DashMap::new(),
            next_generation: AtomicU64::new(1),
            stale_after,
        }
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    fn fresh_request(&self, key: &CacheKey, waiter: oneshot::Sender<Outcome>) -> PendingRequest {
        let now = Instant::now();
        PendingRequest {
            cache_key: key.clone(),
            ticket: None,
            created_at: now,
            updated_at: now,
            generation: self.next_generation.fetch_add(1, Ordering::SeqCst),
            phase: PendingPhase::InFlight,
            waiters: vec![waiter],
        }
    }

    fn is_stale(&self, request: &PendingRequest, now: Instant) -> bool {
        now.duration_since(request.updated_at) >= self.stale_after
    }
}

#[async_trait]
impl ResolutionStore for MemoryStore {
    async fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let entry = self.cache.get(key).await?;
        if entry.is_expired() {
            debug!("Cache entry {} expired after {:?}", key, entry.age());
            self.cache.invalidate(key).await;
            return None;
        }
        Some(entry)
    }

    async fn set(&self, key: &CacheKey, value: Resolution, ttl: Duration) {
        self.cache
            .insert(key.clone(), CacheEntry::new(key.clone(), value, ttl))
            .await;
    }

    async fn evict_expired(&self) -> usize {
        let expired: Vec<CacheKey> = self
            .cache
            .iter()
            .filter(|(_, entry)| entry.is_expired())
            .map(|(key, _)| (*key).clone())
            .collect();
        for key in &expired {
            self.cache.invalidate(key).await;
        }
        self.cache.run_pending_tasks().await;
        expired.len()
    }

    fn cache_len(&self) -> u64 {
        self.cache.entry_count()
    }

    fn get_pending(&self, key: &CacheKey) -> Option<PendingSnapshot> {
        self.pending.get(key).map(|r| r.snapshot())
    }

    fn create_pending_if_absent(&self, key: &CacheKey) -> PendingJoin {
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        match self.pending.entry(key.clone()) {
            Entry::Vacant(vacant) => {
                let request = self.fresh_request(key, tx);
                let generation = request.generation;
                vacant.insert(request);
                PendingJoin {
                    created: true,
                    generation,
                    resume: None,
                    subscription: rx,
                }
            }
            Entry::Occupied(mut occupied) => {
                if self.is_stale(occupied.get(), now) {
                    warn!(
                        "Replacing stale pending request for {} (ticket {:?})",
                        key,
                        occupied.get().ticket.as_ref().map(|t| &t.ticket_id)
                    );
                    let request = self.fresh_request(key, tx);
                    let generation = request.generation;
                    // Dropping the old waiters closes their channels.
                    occupied.insert(request);
                    return PendingJoin {
                        created: true,
                        generation,
                        resume: None,
                        subscription: rx,
                    };
                }

                let request = occupied.get_mut();
                request.waiters.push(tx);
                match request.phase {
                    PendingPhase::InFlight => PendingJoin {
                        created: false,
                        generation: request.generation,
                        resume: None,
                        subscription: rx,
                    },
                    PendingPhase::Parked => {
                        request.phase = PendingPhase::InFlight;
                        request.updated_at = now;
                        request.generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
                        debug!(
                            "Resuming parked request for {} (generation {})",
                            key, request.generation
                        );
                        PendingJoin {
                            created: true,
                            generation: request.generation,
                            resume: request.ticket.clone(),
                            subscription: rx,
                        }
                    }
                }
            }
        }
    }

    fn attach_ticket(&self, key: &CacheKey, generation: u64, ticket: TaskTicket) -> bool {
        match self.pending.get_mut(key) {
            Some(mut request) if request.generation == generation => {
                request.ticket = Some(ticket);
                request.updated_at = Instant::now();
                true
            }
            _ => false,
        }
    }

    fn complete_pending(&self, key: &CacheKey, generation: u64, outcome: &Outcome) -> usize {
        let waiters = match self.pending.entry(key.clone()) {
            Entry::Occupied(mut occupied) if occupied.get().generation == generation => {
                match outcome {
                    Ok(Resolution::Pending { meta }) => {
                        let request = occupied.get_mut();
                        if request.ticket.is_none() {
                            request.ticket = Some(TaskTicket::new(meta.ticket_id.clone(), meta.kind));
                        }
                        request.phase = PendingPhase::Parked;
                        request.updated_at = Instant::now();
                        std::mem::take(&mut request.waiters)
                    }
                    _ => occupied.remove().waiters,
                }
            }
            _ => {
                debug!("Ignoring completion of superseded generation {} for {}", generation, key);
                return 0;
            }
        };

        let mut notified = 0;
        for waiter in waiters {
            if waiter.send(outcome.clone()).is_ok() {
                notified += 1;
            }
        }
        notified
    }

    fn reap_stale_pending(&self) -> usize {
        let now = Instant::now();
        let before = self.pending.len();
        self.pending.retain(|key, request| {
            let keep = !self.is_stale(request, now);
            if !keep {
                debug!("Reaping stale pending request for {} ({:?})", key, request.phase);
            }
            keep
        });
        before.saturating_sub(self.pending.len())
    }

    fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
