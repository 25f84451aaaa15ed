//! Cache & coalescing registry.
//!
//! `resolve` serves unexpired cache hits directly. On a miss the caller is
//! atomically joined to the pending request for its key; the single caller
//! that creates (or resumes) the entry spawns a detached driver running
//! `produce`. Every caller then waits on its own subscription until its own
//! deadline, so abandoning one caller never cancels the shared work.

use futures::FutureExt;
use serde::Serialize;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::error::ResolutionError;
use crate::normalize::CacheKey;
use crate::store::{Outcome, ResolutionStore};
use crate::types::{PendingMeta, Resolution, TaskTicket};

#[derive(Debug, Clone, Copy)]
pub struct ResolveOptions {
    /// Lifetime of the cache entry written on success.
    pub ttl: Duration,
    /// When this caller stops waiting.
    pub deadline: Instant,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub hits: u64,
    pub misses: u64,
    /// Misses that joined an existing pending request.
    pub coalesced: u64,
    /// Drivers started, i.e. producer invocations.
    pub drives: u64,
    /// Drivers that took over a parked ticket instead of submitting.
    pub resumed: u64,
    pub cache_entries: u64,
    pub pending: usize,
}

/// Lets a producer publish its ticket as soon as it has one, so callers
/// that time out early can still be handed something to resume.
#[derive(Clone)]
pub struct TicketSink {
    store: Arc<dyn ResolutionStore>,
    key: CacheKey,
    generation: u64,
}

impl TicketSink {
    pub fn attach(&self, ticket: &TaskTicket) {
        if !self.store.attach_ticket(&self.key, self.generation, ticket.clone()) {
            debug!("Ticket {} arrived for a superseded request", ticket.ticket_id);
        }
    }
}

fn mark_cached(value: Resolution) -> Resolution {
    match value {
        Resolution::Completed { data, mut meta } => {
            meta.cached = true;
            Resolution::Completed { data, meta }
        }
        pending => pending,
    }
}

fn pending_for(ticket: TaskTicket) -> Resolution {
    Resolution::Pending {
        meta: PendingMeta {
            ticket_id: ticket.ticket_id,
            kind: ticket.kind,
            rejected: Vec::new(),
        },
    }
}

pub struct CoalescingRegistry {
    store: Arc<dyn ResolutionStore>,
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    drives: AtomicU64,
    resumed: AtomicU64,
}

impl CoalescingRegistry {
    pub fn new(store: Arc<dyn ResolutionStore>) -> Self {
        Self {
            store,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            drives: AtomicU64::new(0),
            resumed: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<dyn ResolutionStore> {
        &self.store
    }

    pub async fn resolve<F, Fut>(&self, key: &CacheKey, options: ResolveOptions, produce: F) -> Outcome
    where
        F: FnOnce(Option<TaskTicket>, TicketSink) -> Fut + Send + 'static,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        if let Some(entry) = self.store.get(key).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!("Cache hit for {}", key);
            return Ok(mark_cached(entry.value));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let join = self.store.create_pending_if_absent(key);
        if join.created {
            self.drives.fetch_add(1, Ordering::Relaxed);
            if let Some(ticket) = &join.resume {
                self.resumed.fetch_add(1, Ordering::Relaxed);
                info!("Resuming ticket {} for {}", ticket.ticket_id, key);
            }
            self.spawn_driver(key.clone(), join.generation, join.resume, options.ttl, produce);
        } else {
            self.coalesced.fetch_add(1, Ordering::Relaxed);
            debug!("Joined pending request for {}", key);
        }

        match tokio::time::timeout_at(options.deadline, join.subscription).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => self.fallback(key, "pending request was abandoned"),
            Err(_) => self.fallback(key, "no ticket was issued before the caller deadline"),
        }
    }

    /// What a caller gets when it stops waiting before the shared work ends.
    fn fallback(&self, key: &CacheKey, reason: &str) -> Outcome {
        match self.store.get_pending(key).and_then(|p| p.ticket) {
            Some(ticket) => {
                debug!("Caller for {} gives up waiting on {}", key, ticket.ticket_id);
                Ok(pending_for(ticket))
            }
            None => Err(ResolutionError::Timeout(reason.to_string())),
        }
    }

    fn spawn_driver<F, Fut>(
        &self,
        key: CacheKey,
        generation: u64,
        resume: Option<TaskTicket>,
        ttl: Duration,
        produce: F,
    ) where
        F: FnOnce(Option<TaskTicket>, TicketSink) -> Fut + Send + 'static,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::spawn(async move {
            // A previous driver may have filled the cache after our miss.
            if let Some(entry) = store.get(&key).await {
                store.complete_pending(&key, generation, &Ok(mark_cached(entry.value)));
                return;
            }

            let sink = TicketSink {
                store: store.clone(),
                key: key.clone(),
                generation,
            };
            let outcome = match AssertUnwindSafe(async move { produce(resume, sink).await })
                .catch_unwind()
                .await
            {
                Ok(outcome) => outcome,
                Err(_) => {
                    error!("Resolution driver for {} panicked", key);
                    Err(ResolutionError::upstream("resolution task panicked"))
                }
            };

            // Failures and pending results are never cached.
            if let Ok(value @ Resolution::Completed { .. }) = &outcome {
                store.set(&key, value.clone(), ttl).await;
            }
            let notified = store.complete_pending(&key, generation, &outcome);
            debug!("Notified {} waiters for {}", notified, key);
        });
    }

    pub async fn evict_expired(&self) -> usize {
        self.store.evict_expired().await
    }

    pub fn reap_stale_pending(&self) -> usize {
        self.store.reap_stale_pending()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            drives: self.drives.load(Ordering::Relaxed),
            resumed: self.resumed.load(Ordering::Relaxed),
            cache_entries: self.store.cache_len(),
            pending: self.store.pending_len(),
        }
    }
}
