//! The resolution engine: normalizer, coalescing registry, submitter and
//! poller wired together behind one facade.

use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::coalesce::{CoalescingRegistry, RegistryStats, ResolveOptions, TicketSink};
use crate::combine::{Branch, Combiner, KeywordOverview};
use crate::config::EngineConfig;
use crate::error::{ResolutionError, ResolutionResult};
use crate::metrics::parse_payload;
use crate::normalize::{normalize_request, normalize_ticket_id, ticket_cache_key};
use crate::poller::{PollOutcome, Poller};
use crate::provider::UpstreamClient;
use crate::rate_limit::SlidingWindowLimiter;
use crate::store::{MemoryStore, Outcome, ResolutionStore};
use crate::submit::TaskSubmitter;
use crate::types::{
    KeywordRequest, OverviewRequest, PendingMeta, Resolution, ResolveMeta, TaskInput, TaskKind,
    TaskTicket,
};

const SEED_BRANCH: &str = "seed_metrics";
const RELATED_BRANCH: &str = "related_keywords";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    #[serde(flatten)]
    pub registry: RegistryStats,
    pub polls_in_window: usize,
    pub poll_capacity: usize,
}

/// Everything one producer run needs, owned so it can outlive the caller.
struct Job {
    submitter: Arc<TaskSubmitter>,
    poller: Arc<Poller>,
    kind: TaskKind,
    input: Option<TaskInput>,
    requested: Vec<String>,
    limit: Option<u32>,
    budget: Duration,
}

impl Job {
    /// Submit (unless a ticket is being resumed), poll within budget, parse.
    async fn run(self, resume: Option<TaskTicket>, sink: TicketSink) -> Outcome {
        let ticket = match (resume, &self.input) {
            (Some(ticket), _) => ticket,
            (None, Some(input)) => {
                let ticket = self.submitter.submit(self.kind, input).await?;
                sink.attach(&ticket);
                ticket
            }
            (None, None) => {
                return Err(ResolutionError::upstream("nothing to submit or resume"));
            }
        };

        match self.poller.poll(&ticket, self.budget).await? {
            PollOutcome::Completed {
                ticket, payload, ..
            } => {
                let parsed = parse_payload(self.kind, &payload, &self.requested, self.limit)?;
                if !parsed.unresolved.is_empty() {
                    debug!(
                        "{} returned no data for {} terms",
                        ticket.ticket_id,
                        parsed.unresolved.len()
                    );
                }
                Ok(Resolution::Completed {
                    data: parsed.metrics,
                    meta: ResolveMeta {
                        fetched_at: Utc::now(),
                        ticket_id: ticket.ticket_id,
                        cached: false,
                        unresolved: parsed.unresolved,
                        rejected: Vec::new(),
                    },
                })
            }
            PollOutcome::BudgetExceeded { ticket, attempts } => {
                info!(
                    "{} still queued after {} polls, returning pending",
                    ticket.ticket_id, attempts
                );
                Ok(Resolution::Pending {
                    meta: PendingMeta {
                        ticket_id: ticket.ticket_id,
                        kind: ticket.kind,
                        rejected: Vec::new(),
                    },
                })
            }
        }
    }
}

pub struct KeywordEngine {
    config: EngineConfig,
    limiter: Arc<SlidingWindowLimiter>,
    submitter: Arc<TaskSubmitter>,
    poller: Arc<Poller>,
    registry: CoalescingRegistry,
}

impl KeywordEngine {
    pub fn new(config: EngineConfig, upstream: Arc<dyn UpstreamClient>) -> Self {
        let store = Arc::new(MemoryStore::new(
            config.cache_capacity,
            config.stale_pending_after(),
        ));
        Self::with_store(config, upstream, store)
    }

    /// Build on an externally provided store.
    pub fn with_store(
        config: EngineConfig,
        upstream: Arc<dyn UpstreamClient>,
        store: Arc<dyn ResolutionStore>,
    ) -> Self {
        let limiter = Arc::new(SlidingWindowLimiter::new(
            config.poll_max_requests,
            config.poll_window,
        ));
        let retry = config.transient_retry();
        let submitter = Arc::new(TaskSubmitter::new(upstream.clone(), retry.clone()));
        let poller = Arc::new(Poller::new(
            upstream,
            limiter.clone(),
            config.backoff_schedule.clone(),
            retry,
        ));
        Self {
            config,
            limiter,
            submitter,
            poller,
            registry: CoalescingRegistry::new(store),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// How long a caller waits for a resolution of `kind`.
    fn caller_wait(&self, kind: TaskKind) -> Duration {
        self.config.budget_for(kind) + self.config.deadline_grace
    }

    fn options(&self, kind: TaskKind) -> ResolveOptions {
        ResolveOptions {
            ttl: self.config.ttl_for(kind),
            deadline: Instant::now() + self.caller_wait(kind),
        }
    }

    fn job(&self, kind: TaskKind, input: Option<TaskInput>, requested: Vec<String>, limit: Option<u32>) -> Job {
        Job {
            submitter: self.submitter.clone(),
            poller: self.poller.clone(),
            kind,
            input,
            requested,
            limit,
            budget: self.config.budget_for(kind),
        }
    }

    /// Resolve a keyword request. Returns `completed` with data, or `pending`
    /// with a ticket when the provider has not finished within budget.
    pub async fn resolve(&self, request: &KeywordRequest) -> ResolutionResult<Resolution> {
        let normalized = normalize_request(request)?;
        let key = normalized.cache_key();
        let kind = normalized.kind;
        debug!(
            "Resolving {} {} terms for location {} ({})",
            kind,
            normalized.keywords.len(),
            normalized.location.location_code,
            key
        );

        let job = self.job(
            kind,
            Some(normalized.task_input()),
            normalized.keywords.clone(),
            normalized.options.limit,
        );
        let resolution = self
            .registry
            .resolve(&key, self.options(kind), move |resume, sink| job.run(resume, sink))
            .await?;
        Ok(resolution.with_rejected(normalized.rejected))
    }

    /// Poll a ticket returned earlier as `pending`, without resubmitting.
    pub async fn resume_ticket(&self, kind: TaskKind, ticket_id: &str) -> ResolutionResult<Resolution> {
        let ticket_id = normalize_ticket_id(ticket_id)?;
        let key = ticket_cache_key(kind, &ticket_id);
        let ticket = TaskTicket::new(ticket_id, kind);
        info!("Resuming {} ticket {}", kind, ticket.ticket_id);

        let job = self.job(kind, None, Vec::new(), None);
        self.registry
            .resolve(&key, self.options(kind), move |resume, sink| {
                job.run(Some(resume.unwrap_or(ticket)), sink)
            })
            .await
    }

    /// Seed metrics and related terms, resolved concurrently. The related
    /// branch only fails the overview when `require_related` is set.
    pub async fn overview(&self, request: &OverviewRequest) -> ResolutionResult<KeywordOverview> {
        let seed = KeywordRequest::new(
            TaskKind::SearchVolume,
            vec![request.keyword.clone()],
            request.location.clone(),
        );
        let mut related = KeywordRequest::new(
            TaskKind::RelatedKeywords,
            vec![request.keyword.clone()],
            request.location.clone(),
        );
        related.limit = request.limit;

        // Reject bad input up front instead of as two failed branches.
        let normalized = normalize_request(&seed)?;
        normalize_request(&related)?;
        let keyword = normalized.keywords.into_iter().next().unwrap_or_default();

        let wait = self
            .caller_wait(TaskKind::SearchVolume)
            .max(self.caller_wait(TaskKind::RelatedKeywords))
            + Duration::from_secs(1);
        let mut composite = Combiner::run(
            vec![
                Branch::required(SEED_BRANCH, self.resolve(&seed).boxed()),
                Branch::new(RELATED_BRANCH, request.require_related, self.resolve(&related).boxed()),
            ],
            wait,
        )
        .await?;

        let missing = |name: &str| ResolutionError::upstream(format!("{name} branch did not report"));
        Ok(KeywordOverview {
            keyword,
            seed_metrics: composite.take(SEED_BRANCH).ok_or_else(|| missing(SEED_BRANCH))?,
            related_keywords: composite
                .take(RELATED_BRANCH)
                .ok_or_else(|| missing(RELATED_BRANCH))?,
        })
    }

    pub async fn evict_expired(&self) -> usize {
        self.registry.evict_expired().await
    }

    pub fn reap_stale_pending(&self) -> usize {
        self.registry.reap_stale_pending()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            registry: self.registry.stats(),
            polls_in_window: self.limiter.in_window(),
            poll_capacity: self.limiter.max_requests(),
        }
    }

    /// Periodically evict expired cache entries and reap stale pending
    /// requests. Stops once the engine is dropped.
    pub fn spawn_maintenance(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let engine: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
            loop {
                ticker.tick().await;
                let Some(engine) = engine.upgrade() else {
                    debug!("Engine dropped, stopping maintenance");
                    return;
                };
                let evicted = engine.evict_expired().await;
                let reaped = engine.reap_stale_pending();
                if evicted > 0 || reaped > 0 {
                    info!("Maintenance evicted {} cache entries, reaped {} pending", evicted, reaped);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combine::BranchOutcome;
    use crate::error::ErrorKind;
    use crate::provider::mock::volume_payload;
    use crate::provider::{PollPlan, ScriptedProvider};

    fn engine_with(provider: Arc<ScriptedProvider>, config: EngineConfig) -> Arc<KeywordEngine> {
        Arc::new(KeywordEngine::new(config, provider))
    }

    fn us(kind: TaskKind, keywords: &[&str]) -> KeywordRequest {
        KeywordRequest::new(kind, keywords.iter().map(|k| k.to_string()).collect(), "us")
    }

    #[tokio::test(start_paused = true)]
    async fn identical_requests_within_a_second_share_one_task() {
        let provider = Arc::new(ScriptedProvider::new().with_plan(
            TaskKind::SearchVolume,
            PollPlan::completes_after(2, volume_payload(&[("youtube growth", 4400, 20)])),
        ));
        let engine = engine_with(provider.clone(), EngineConfig::default());

        let first = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .resolve(&us(TaskKind::SearchVolume, &["YouTube growth"]))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(500)).await;
        let second = engine
            .resolve(&us(TaskKind::SearchVolume, &["  youtube   GROWTH"]))
            .await
            .unwrap();
        let first = first.await.unwrap().unwrap();

        assert_eq!(provider.submissions(), 1);
        let (kind, input) = &provider.submitted_inputs()[0];
        assert_eq!(*kind, TaskKind::SearchVolume);
        assert_eq!(input.keywords, vec!["youtube growth"]);
        assert_eq!(input.location_code, 2840);
        assert_eq!(input.language_code, "en");

        assert_eq!(first, second);
        assert_eq!(first.data().unwrap()[0].search_volume, 4400);
        assert_eq!(engine.stats().registry.coalesced, 1);
    }

    #[tokio::test]
    async fn empty_input_fails_before_any_network_call() {
        let provider = Arc::new(ScriptedProvider::new());
        let engine = engine_with(provider.clone(), EngineConfig::default());
        let err = engine
            .resolve(&us(TaskKind::SearchVolume, &[""]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(provider.submissions(), 0);
        assert_eq!(provider.polls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn completes_on_sixth_poll_within_budget() {
        let provider = Arc::new(ScriptedProvider::new().with_plan(
            TaskKind::SearchVolume,
            PollPlan::completes_after(5, volume_payload(&[("seo tools", 12000, 80)])),
        ));
        let config = EngineConfig {
            volume_budget: Duration::from_secs(10),
            ..EngineConfig::default()
        };
        let engine = engine_with(provider.clone(), config);
        let resolution = engine
            .resolve(&us(TaskKind::SearchVolume, &["SEO tools"]))
            .await
            .unwrap();
        let data = resolution.data().expect("completed");
        assert_eq!(data[0].term, "seo tools");
        assert_eq!(data[0].search_volume, 12000);
        assert_eq!(provider.polls(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn never_completing_task_returns_pending_then_resumes_same_ticket() {
        let provider = Arc::new(ScriptedProvider::new().with_plan(TaskKind::SearchVolume, PollPlan::NeverCompletes));
        let engine = engine_with(provider.clone(), EngineConfig::default());
        let request = us(TaskKind::SearchVolume, &["slow term"]);

        let first = engine.resolve(&request).await.unwrap();
        assert!(first.is_pending());
        let ticket_id = first.ticket_id().to_string();
        assert!(!ticket_id.is_empty());
        let polls_after_first = provider.polls_for(&ticket_id);
        assert!(polls_after_first > 0);

        let second = engine.resolve(&request).await.unwrap();
        assert!(second.is_pending());
        assert_eq!(second.ticket_id(), ticket_id);
        assert_eq!(provider.submissions(), 1);
        assert!(provider.polls_for(&ticket_id) > polls_after_first);
        assert_eq!(engine.stats().registry.resumed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_polls_park_the_ticket_instead_of_resubmitting() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .with_plan(TaskKind::SearchVolume, PollPlan::NeverCompletes)
                .with_poll_delay(Duration::from_secs(20)),
        );
        let engine = engine_with(provider.clone(), EngineConfig::default());
        let request = us(TaskKind::SearchVolume, &["sluggish term"]);

        let started = Instant::now();
        let first = engine.resolve(&request).await.unwrap();
        assert!(first.is_pending());
        assert!(started.elapsed() <= engine.config().volume_budget + Duration::from_secs(1));
        assert_eq!(engine.stats().registry.pending, 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        let later = engine.resolve(&request).await.unwrap();
        assert!(later.is_pending());
        assert_eq!(later.ticket_id(), first.ticket_id());
        assert_eq!(provider.submissions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn resume_ticket_picks_up_where_budget_ran_out() {
        let provider = Arc::new(ScriptedProvider::new().with_plan(
            TaskKind::SearchVolume,
            PollPlan::completes_after(8, volume_payload(&[("late term", 90, 10)])),
        ));
        let engine = engine_with(provider.clone(), EngineConfig::default());
        let pending = engine
            .resolve(&us(TaskKind::SearchVolume, &["late term"]))
            .await
            .unwrap();
        assert!(pending.is_pending());

        let done = engine
            .resume_ticket(TaskKind::SearchVolume, pending.ticket_id())
            .await
            .unwrap();
        assert_eq!(done.ticket_id(), pending.ticket_id());
        assert_eq!(done.data().unwrap()[0].search_volume, 90);
        assert_eq!(provider.submissions(), 1);
    }

    #[tokio::test]
    async fn resume_ticket_rejects_malformed_ids() {
        let engine = engine_with(Arc::new(ScriptedProvider::new()), EngineConfig::default());
        let err = engine
            .resume_ticket(TaskKind::Trends, "not a ticket")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test(start_paused = true)]
    async fn overview_reports_related_branch_as_pending() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .with_plan(
                    TaskKind::SearchVolume,
                    PollPlan::completes_after(0, volume_payload(&[("keyword research", 5400, 55)])),
                )
                .with_plan(TaskKind::RelatedKeywords, PollPlan::NeverCompletes),
        );
        let engine = engine_with(provider.clone(), EngineConfig::default());
        let overview = engine
            .overview(&OverviewRequest {
                keyword: "Keyword Research".into(),
                location: "US".into(),
                limit: Some(10),
                require_related: false,
            })
            .await
            .unwrap();
        assert_eq!(overview.keyword, "keyword research");
        match &overview.seed_metrics {
            BranchOutcome::Completed { data, .. } => assert_eq!(data[0].search_volume, 5400),
            other => panic!("seed should complete, got {other:?}"),
        }
        assert!(overview.related_keywords.is_pending());
        assert_eq!(provider.submissions(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn required_related_failure_fails_overview() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .with_plan(
                    TaskKind::SearchVolume,
                    PollPlan::completes_after(0, volume_payload(&[("casino", 100, 90)])),
                )
                .with_plan(
                    TaskKind::RelatedKeywords,
                    PollPlan::fails_after(0, 40505, "Restricted category"),
                ),
        );
        let engine = engine_with(provider, EngineConfig::default());
        let err = engine
            .overview(&OverviewRequest {
                keyword: "casino".into(),
                location: "us".into(),
                limit: None,
                require_related: true,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RestrictedCategory);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_limiter_bounds_calls_across_tickets() {
        let provider = Arc::new(ScriptedProvider::new().with_plan(
            TaskKind::SearchVolume,
            PollPlan::completes_after(0, serde_json::json!([])),
        ));
        let config = EngineConfig {
            poll_max_requests: 20,
            poll_window: Duration::from_secs(60),
            ..EngineConfig::default()
        };
        let engine = engine_with(provider.clone(), config);

        let handles: Vec<_> = (0..25)
            .map(|i| {
                let engine = engine.clone();
                tokio::spawn(async move {
                    engine
                        .resolve(&us(TaskKind::SearchVolume, &[&format!("term {i}")]))
                        .await
                })
            })
            .collect();
        let mut pending = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().is_pending() {
                pending += 1;
            }
        }
        assert_eq!(provider.submissions(), 25);
        assert_eq!(provider.polls(), 20);
        assert_eq!(pending, 5);
        assert_eq!(engine.stats().polls_in_window, 20);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_reaches_every_waiter_and_is_not_cached() {
        let provider = Arc::new(ScriptedProvider::new().with_plan(
            TaskKind::SearchVolume,
            PollPlan::fails_after(1, 40200, "Payment required"),
        ));
        let engine = engine_with(provider.clone(), EngineConfig::default());
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.resolve(&us(TaskKind::SearchVolume, &["seo"])).await })
            })
            .collect();
        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
        }
        assert_eq!(provider.submissions(), 1);
        assert_eq!(engine.stats().registry.cache_entries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn partially_invalid_batch_reports_rejected_and_unresolved_terms() {
        let provider = Arc::new(ScriptedProvider::new().with_plan(
            TaskKind::SearchVolume,
            PollPlan::completes_after(0, volume_payload(&[("seo", 500, 40)])),
        ));
        let engine = engine_with(provider.clone(), EngineConfig::default());
        let resolution = engine
            .resolve(&us(TaskKind::SearchVolume, &["SEO", "rocket \u{1F680}", "restricted"]))
            .await
            .unwrap();
        match resolution {
            Resolution::Completed { data, meta } => {
                assert_eq!(data.len(), 1);
                assert_eq!(meta.rejected.len(), 1);
                assert_eq!(meta.rejected[0].input, "rocket \u{1F680}");
                assert_eq!(meta.unresolved, vec!["restricted"]);
            }
            other => panic!("expected completion, got {other:?}"),
        }
        assert_eq!(provider.submitted_inputs()[0].1.keywords, vec!["restricted", "seo"]);
    }

    #[tokio::test(start_paused = true)]
    async fn maintenance_evicts_expired_entries() {
        let provider = Arc::new(ScriptedProvider::new().with_plan(
            TaskKind::SearchVolume,
            PollPlan::completes_after(0, volume_payload(&[("seo", 500, 40)])),
        ));
        let config = EngineConfig {
            cache_ttl: Duration::from_secs(30),
            ..EngineConfig::default()
        };
        let engine = engine_with(provider.clone(), config);
        engine
            .resolve(&us(TaskKind::SearchVolume, &["seo"]))
            .await
            .unwrap();
        let maintenance = engine.spawn_maintenance(Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(engine.stats().registry.cache_entries, 0);

        engine
            .resolve(&us(TaskKind::SearchVolume, &["seo"]))
            .await
            .unwrap();
        assert_eq!(provider.submissions(), 2);
        maintenance.abort();
    }
}
