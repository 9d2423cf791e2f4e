//! Feed orchestration: profile resolution, candidate retrieval, blended
//! ranking, refresh scheduling with per-cluster leases, and cluster
//! analytics.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use cof_core::{
    Category, Characteristics, ClusterKey, ClusterProfile, FeedStatus, OpportunityRecord,
    UserProfileVector,
};
use cof_pool::{
    ClusterProfileStore, OpportunityPool, ShownHistoryTracker, SweepStats, UserProfileStore,
};
use cof_providers::{
    BackoffPolicy, OpportunityProvider, OpportunitySummary, ProfileModel, ProviderError,
    RelevanceScorer,
};
use serde::Serialize;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cof-engine";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("user has no usable profile")]
    ProfileUnavailable,
    #[error("a fetch is already in flight for cluster {cluster_key}")]
    RefreshInFlight { cluster_key: String },
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Items returned per feed request.
    pub display_quota: usize,
    /// Candidates pulled from the pool before ranking.
    pub candidate_limit: usize,
    /// Pool depth below which a cluster counts as `Low`.
    pub depth_threshold: usize,
    pub suppression_days: i64,
    pub retention_days: i64,
    pub profile_max_age_days: i64,
    pub active_user_days: i64,
    /// Per-candidate scorer timeout on the serving path.
    pub scorer_timeout: StdDuration,
    /// Hard timeout around one provider fetch.
    pub fetch_timeout: StdDuration,
    /// Weight of the personalized score in the blend; the base score gets
    /// the remainder.
    pub personal_weight: f64,
    /// Cooldown after failed fetches, keyed by consecutive-failure count.
    pub fetch_backoff: BackoffPolicy,
    /// Categories requested from providers.
    pub categories: Vec<Category>,
    pub scheduler_enabled: bool,
    pub sweep_cron: String,
    /// How many of the most active clusters each scheduled sweep refreshes.
    pub sweep_top_clusters: usize,
    /// Interval used for `next_fetch_at` when a cluster is deep enough.
    pub scheduled_interval_hours: i64,
    /// Jaro-Winkler threshold above which two titles count as near
    /// duplicates in fetch telemetry.
    pub near_duplicate_threshold: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            display_quota: 6,
            candidate_limit: 20,
            depth_threshold: 20,
            suppression_days: 7,
            retention_days: 30,
            profile_max_age_days: 7,
            active_user_days: 7,
            scorer_timeout: StdDuration::from_millis(250),
            fetch_timeout: StdDuration::from_secs(20),
            personal_weight: 0.7,
            fetch_backoff: BackoffPolicy {
                max_retries: 6,
                base_delay: StdDuration::from_secs(30),
                max_delay: StdDuration::from_secs(30 * 60),
            },
            categories: vec![Category::Travel, Category::Job, Category::Investment],
            scheduler_enabled: false,
            sweep_cron: "0 0 */6 * * *".to_string(),
            sweep_top_clusters: 10,
            scheduled_interval_hours: 6,
            near_duplicate_threshold: 0.92,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            display_quota: env_parse("COF_DISPLAY_QUOTA", defaults.display_quota),
            candidate_limit: env_parse("COF_CANDIDATE_LIMIT", defaults.candidate_limit),
            depth_threshold: env_parse("COF_DEPTH_THRESHOLD", defaults.depth_threshold),
            suppression_days: env_parse("COF_SUPPRESSION_DAYS", defaults.suppression_days),
            retention_days: env_parse("COF_RETENTION_DAYS", defaults.retention_days),
            profile_max_age_days: env_parse(
                "COF_PROFILE_MAX_AGE_DAYS",
                defaults.profile_max_age_days,
            ),
            active_user_days: env_parse("COF_ACTIVE_USER_DAYS", defaults.active_user_days),
            scorer_timeout: StdDuration::from_millis(env_parse("COF_SCORER_TIMEOUT_MS", 250)),
            fetch_timeout: StdDuration::from_secs(env_parse("COF_FETCH_TIMEOUT_SECS", 20)),
            personal_weight: env_parse("COF_PERSONAL_WEIGHT", defaults.personal_weight),
            fetch_backoff: defaults.fetch_backoff,
            categories: defaults.categories,
            scheduler_enabled: std::env::var("COF_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sweep_cron: std::env::var("COF_SWEEP_CRON")
                .unwrap_or_else(|_| defaults.sweep_cron.clone()),
            sweep_top_clusters: env_parse("COF_SWEEP_TOP_CLUSTERS", defaults.sweep_top_clusters),
            scheduled_interval_hours: env_parse(
                "COF_SCHEDULED_INTERVAL_HOURS",
                defaults.scheduled_interval_hours,
            ),
            near_duplicate_threshold: defaults.near_duplicate_threshold,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchTrigger {
    User,
    Scheduled,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchOutcome {
    Success,
    Partial,
    Failed,
}

/// Immutable record of one fetch attempt, kept for operational visibility
/// and the retry heuristic.
#[derive(Debug, Clone, Serialize)]
pub struct FetchLogEntry {
    pub run_id: Uuid,
    pub trigger: FetchTrigger,
    pub cluster_key: String,
    pub fetched: usize,
    pub cached: usize,
    pub duplicates: usize,
    pub near_duplicates: usize,
    pub duration_ms: u64,
    pub outcome: FetchOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshSummary {
    pub fetched: usize,
    pub cached: usize,
    pub duplicates: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedResponse {
    pub cluster_key: Option<String>,
    pub status: FeedStatus,
    pub items: Vec<OpportunityRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterState {
    Fresh,
    Low,
    Refreshing,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub pool: SweepStats,
    pub history_purged: usize,
    pub clusters_refreshed: usize,
}

#[derive(Debug, Default, Clone)]
struct LeaseEntry {
    in_flight: bool,
    consecutive_failures: usize,
    next_attempt_at: Option<DateTime<Utc>>,
}

enum LeaseDecision {
    Acquired,
    Busy,
    CoolingDown,
}

/// Per-cluster fetch leases and the bounded fetch log. At most one fetch is
/// in flight per cluster; repeated failures push the next attempt out with
/// exponential backoff so a broken provider is not hammered on every
/// request.
struct RefreshScheduler {
    leases: Mutex<HashMap<String, LeaseEntry>>,
    log: RwLock<VecDeque<FetchLogEntry>>,
    log_cap: usize,
    backoff: BackoffPolicy,
}

impl RefreshScheduler {
    fn new(backoff: BackoffPolicy) -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
            log: RwLock::new(VecDeque::new()),
            log_cap: 512,
            backoff,
        }
    }

    fn try_acquire(
        &self,
        cluster_key: &str,
        now: DateTime<Utc>,
        ignore_backoff: bool,
    ) -> LeaseDecision {
        let mut leases = self.leases.lock().expect("lease map poisoned");
        let entry = leases.entry(cluster_key.to_string()).or_default();
        if entry.in_flight {
            return LeaseDecision::Busy;
        }
        if !ignore_backoff {
            if let Some(next) = entry.next_attempt_at {
                if next > now {
                    return LeaseDecision::CoolingDown;
                }
            }
        }
        entry.in_flight = true;
        LeaseDecision::Acquired
    }

    fn release(&self, cluster_key: &str, success: bool, now: DateTime<Utc>) {
        let mut leases = self.leases.lock().expect("lease map poisoned");
        let entry = leases.entry(cluster_key.to_string()).or_default();
        entry.in_flight = false;
        if success {
            entry.consecutive_failures = 0;
            entry.next_attempt_at = None;
        } else {
            let attempt = entry.consecutive_failures;
            entry.consecutive_failures += 1;
            let delay = self.backoff.delay_for_attempt(attempt);
            entry.next_attempt_at = Some(
                now + Duration::from_std(delay).unwrap_or_else(|_| Duration::minutes(30)),
            );
        }
    }

    fn in_flight(&self, cluster_key: &str) -> bool {
        let leases = self.leases.lock().expect("lease map poisoned");
        leases.get(cluster_key).map(|e| e.in_flight).unwrap_or(false)
    }

    fn append_log(&self, entry: FetchLogEntry) {
        let mut log = self.log.write().expect("fetch log poisoned");
        log.push_back(entry);
        while log.len() > self.log_cap {
            log.pop_front();
        }
    }

    fn entries(&self) -> Vec<FetchLogEntry> {
        let log = self.log.read().expect("fetch log poisoned");
        log.iter().rev().cloned().collect()
    }
}

/// Blended ranking over a bounded candidate list. Scoring only happens when
/// there is a surplus; a failed or slow scorer call degrades to a neutral
/// score instead of failing the request.
pub struct RelevanceRanker {
    pub display_quota: usize,
    pub personal_weight: f64,
    pub scorer_timeout: StdDuration,
}

impl RelevanceRanker {
    pub async fn rank(
        &self,
        candidates: Vec<OpportunityRecord>,
        profile: &UserProfileVector,
        scorer: &Arc<dyn RelevanceScorer>,
    ) -> Vec<OpportunityRecord> {
        if candidates.len() <= self.display_quota {
            return candidates;
        }

        let mut tasks = Vec::with_capacity(candidates.len());
        for (index, record) in candidates.iter().enumerate() {
            let scorer = Arc::clone(scorer);
            let summary = OpportunitySummary::from_record(record);
            let profile = profile.clone();
            let timeout = self.scorer_timeout;
            tasks.push(tokio::spawn(async move {
                let personal =
                    match tokio::time::timeout(timeout, scorer.score(&summary, &profile)).await {
                        Ok(Ok(score)) => score.clamp(0.0, 1.0),
                        Ok(Err(err)) => {
                            warn!(content_hash = %summary.content_hash, error = %err, "scorer failed, using neutral score");
                            0.5
                        }
                        Err(_) => {
                            warn!(content_hash = %summary.content_hash, "scorer timed out, using neutral score");
                            0.5
                        }
                    };
                (index, personal)
            }));
        }

        let mut personal_scores = vec![0.5f64; candidates.len()];
        for task in tasks {
            match task.await {
                Ok((index, personal)) => personal_scores[index] = personal,
                Err(err) => warn!(error = %err, "scorer task join error"),
            }
        }

        let mut scored = candidates
            .into_iter()
            .enumerate()
            .map(|(index, record)| {
                let blended = self.personal_weight * personal_scores[index]
                    + (1.0 - self.personal_weight) * record.base_relevance_score;
                (index, blended, record)
            })
            .collect::<Vec<_>>();
        // Descending by blended score; ties keep pool order.
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored
            .into_iter()
            .take(self.display_quota)
            .map(|(_, _, record)| record)
            .collect()
    }
}

/// Count near-duplicate title pairs in a fetched batch. Advisory telemetry
/// only — exact-hash dedup is the contract, this just surfaces fuzzy
/// overlap in the fetch log.
pub fn count_near_duplicates(items: &[cof_core::RawOpportunity], threshold: f64) -> usize {
    let normalized = items
        .iter()
        .map(|item| cof_core::normalize_key_fragment(&item.title))
        .collect::<Vec<_>>();
    let mut pairs = 0usize;
    for i in 0..normalized.len() {
        for j in (i + 1)..normalized.len() {
            if strsim::jaro_winkler(&normalized[i], &normalized[j]) >= threshold {
                pairs += 1;
            }
        }
    }
    pairs
}

/// The engine facade. Owns all stores and collaborators; constructed once
/// at process start and shared via `Arc` — no global state.
pub struct FeedEngine {
    config: EngineConfig,
    pool: Arc<OpportunityPool>,
    history: Arc<ShownHistoryTracker>,
    cluster_profiles: Arc<ClusterProfileStore>,
    user_profiles: Arc<UserProfileStore>,
    provider: Arc<dyn OpportunityProvider>,
    scorer: Arc<dyn RelevanceScorer>,
    model: Arc<dyn ProfileModel>,
    scheduler: RefreshScheduler,
    ranker: RelevanceRanker,
    /// Last-resolved characteristics per cluster, so scheduled sweeps can
    /// fetch for a cluster without a live user request.
    exemplars: RwLock<HashMap<String, Characteristics>>,
    /// Self-handle for detaching background fetches off the request path.
    weak_self: Weak<FeedEngine>,
}

impl FeedEngine {
    pub fn new(
        config: EngineConfig,
        provider: Arc<dyn OpportunityProvider>,
        scorer: Arc<dyn RelevanceScorer>,
        model: Arc<dyn ProfileModel>,
    ) -> Arc<Self> {
        let ranker = RelevanceRanker {
            display_quota: config.display_quota,
            personal_weight: config.personal_weight,
            scorer_timeout: config.scorer_timeout,
        };
        let scheduler = RefreshScheduler::new(config.fetch_backoff);
        Arc::new_cyclic(|weak_self| Self {
            history: Arc::new(ShownHistoryTracker::new(config.suppression_days)),
            pool: Arc::new(OpportunityPool::new()),
            cluster_profiles: Arc::new(ClusterProfileStore::new()),
            user_profiles: Arc::new(UserProfileStore::new()),
            provider,
            scorer,
            model,
            scheduler,
            ranker,
            exemplars: RwLock::new(HashMap::new()),
            weak_self: weak_self.clone(),
            config,
        })
    }

    pub fn pool(&self) -> &Arc<OpportunityPool> {
        &self.pool
    }

    pub fn history(&self) -> &Arc<ShownHistoryTracker> {
        &self.history
    }

    /// The read path: resolve the user's cluster, filter the pool through
    /// the suppression window, rank, record, return. Always answers with a
    /// status — provider problems never surface here.
    pub async fn list_opportunities(&self, user: &str) -> FeedResponse {
        let now = Utc::now();
        let Some(profile) = self.resolve_profile(user, now).await else {
            return FeedResponse {
                cluster_key: None,
                status: FeedStatus::ProfileMissing,
                items: Vec::new(),
            };
        };
        self.user_profiles.note_seen(user, now);
        let cluster_key = profile.cluster_key.clone();

        let seen = self.history.recently_shown(user, now);
        let candidates =
            self.pool
                .active_candidates(&cluster_key, &seen, self.config.candidate_limit, now);

        if self.pool.depth(&cluster_key, now) < self.config.depth_threshold {
            self.spawn_background_fetch(&cluster_key, FetchTrigger::User);
        }

        if candidates.is_empty() {
            return FeedResponse {
                cluster_key: Some(cluster_key),
                status: FeedStatus::Refreshing,
                items: Vec::new(),
            };
        }

        let items = self.ranker.rank(candidates, &profile, &self.scorer).await;
        for item in &items {
            self.pool.mark_shown(&item.content_hash);
            self.history.record_shown(user, &item.content_hash, now);
        }
        FeedResponse {
            cluster_key: Some(cluster_key),
            status: FeedStatus::Ok,
            items,
        }
    }

    /// Manual refresh: synchronous fetch-and-merge for the caller's
    /// cluster. Bypasses the depth check and any failure cooldown but still
    /// respects the one-in-flight-fetch-per-cluster lease.
    pub async fn refresh_now(&self, user: &str) -> Result<RefreshSummary, EngineError> {
        let now = Utc::now();
        let profile = self
            .resolve_profile(user, now)
            .await
            .ok_or(EngineError::ProfileUnavailable)?;
        self.run_fetch(
            &profile.cluster_key,
            &profile.characteristics,
            FetchTrigger::Manual,
        )
        .await
    }

    pub fn record_click(&self, user: &str, content_hash: &str) {
        let now = Utc::now();
        self.history.record_clicked(user, content_hash, now);
        self.pool.mark_clicked(content_hash);
        self.user_profiles.note_seen(user, now);
    }

    pub fn record_dismiss(&self, user: &str, content_hash: &str) {
        let now = Utc::now();
        self.history.record_dismissed(user, content_hash, now);
        self.user_profiles.note_seen(user, now);
    }

    pub fn fetch_log(&self) -> Vec<FetchLogEntry> {
        self.scheduler.entries()
    }

    pub fn cluster_profiles(&self) -> Vec<ClusterProfile> {
        self.cluster_profiles.all()
    }

    pub fn cluster_state(&self, cluster_key: &str) -> ClusterState {
        if self.scheduler.in_flight(cluster_key) {
            return ClusterState::Refreshing;
        }
        if self.pool.depth(cluster_key, Utc::now()) >= self.config.depth_threshold {
            ClusterState::Fresh
        } else {
            ClusterState::Low
        }
    }

    /// Resolve (and if needed regenerate) the user's profile vector. A
    /// stale vector is still served when the model cannot produce a fresh
    /// one — degraded personalization beats an outage.
    async fn resolve_profile(&self, user: &str, now: DateTime<Utc>) -> Option<UserProfileVector> {
        let cached = self.user_profiles.get(user);
        if let Some(profile) = &cached {
            if !profile.is_stale(now, Duration::days(self.config.profile_max_age_days)) {
                return cached;
            }
        }

        let payload = match self.model.profile_payload(user).await {
            Ok(Some(payload)) => payload,
            Ok(None) => return cached,
            Err(err) => {
                warn!(user, error = %err, "profile payload lookup failed");
                return cached;
            }
        };

        let characteristics = match self.model.extract_characteristics(&payload).await {
            Ok(characteristics) => characteristics,
            Err(err) => {
                warn!(user, error = %err, "characteristics extraction failed");
                return cached;
            }
        };
        let embedding = match self.model.embed(&payload).await {
            Ok(embedding) => embedding,
            Err(err) => {
                warn!(user, error = %err, "embedding generation failed");
                return cached;
            }
        };

        let cluster_key = ClusterKey::from_characteristics(&characteristics).wire();
        {
            let mut exemplars = self.exemplars.write().expect("exemplar map poisoned");
            exemplars.insert(cluster_key.clone(), characteristics.clone());
        }
        let vector = UserProfileVector {
            user: user.to_string(),
            embedding,
            cluster_key,
            characteristics,
            updated_at: now,
        };
        self.user_profiles.upsert(vector.clone(), now);
        Some(vector)
    }

    fn spawn_background_fetch(&self, cluster_key: &str, trigger: FetchTrigger) {
        let Some(engine) = self.weak_self.upgrade() else {
            return;
        };
        let cluster_key = cluster_key.to_string();
        tokio::spawn(async move {
            if let Err(err) = engine.run_fetch_for_cluster(&cluster_key, trigger).await {
                // Busy and cooling-down leases land here too; both are
                // expected under concurrent requests.
                warn!(%cluster_key, error = %err, "background fetch not run");
            }
        });
    }

    /// Fetch for a cluster using its last-resolved characteristics.
    pub async fn run_fetch_for_cluster(
        &self,
        cluster_key: &str,
        trigger: FetchTrigger,
    ) -> Result<RefreshSummary, EngineError> {
        let characteristics = {
            let exemplars = self.exemplars.read().expect("exemplar map poisoned");
            exemplars.get(cluster_key).cloned()
        };
        let Some(characteristics) = characteristics else {
            return Err(EngineError::Provider(ProviderError::Unavailable(format!(
                "no characteristics recorded for cluster {cluster_key}"
            ))));
        };
        self.run_fetch(cluster_key, &characteristics, trigger).await
    }

    async fn run_fetch(
        &self,
        cluster_key: &str,
        characteristics: &Characteristics,
        trigger: FetchTrigger,
    ) -> Result<RefreshSummary, EngineError> {
        let now = Utc::now();
        let ignore_backoff = trigger == FetchTrigger::Manual;
        match self.scheduler.try_acquire(cluster_key, now, ignore_backoff) {
            LeaseDecision::Acquired => {}
            LeaseDecision::Busy => {
                return Err(EngineError::RefreshInFlight {
                    cluster_key: cluster_key.to_string(),
                })
            }
            LeaseDecision::CoolingDown => {
                return Err(EngineError::Provider(ProviderError::Unavailable(format!(
                    "cluster {cluster_key} is cooling down after failed fetches"
                ))))
            }
        }

        let run_id = Uuid::new_v4();
        let span = info_span!("cluster_fetch", %run_id, cluster_key, ?trigger);
        let started = std::time::Instant::now();
        let started_at = now;

        let fetch_result = tokio::time::timeout(
            self.config.fetch_timeout,
            self.provider
                .fetch(characteristics, &self.config.categories)
                .instrument(span),
        )
        .await;

        let finished_at = Utc::now();
        let duration_ms = started.elapsed().as_millis() as u64;

        let (entry, result) = match fetch_result {
            Ok(Ok(items)) => {
                let near_duplicates =
                    count_near_duplicates(&items, self.config.near_duplicate_threshold);
                let mut cached = 0usize;
                let mut duplicates = 0usize;
                for item in &items {
                    if self.pool.insert_if_new(item, cluster_key, finished_at).is_inserted() {
                        cached += 1;
                    } else {
                        duplicates += 1;
                    }
                }
                self.scheduler.release(cluster_key, true, finished_at);
                let outcome = if items.is_empty() {
                    FetchOutcome::Partial
                } else {
                    FetchOutcome::Success
                };
                info!(
                    %run_id,
                    cluster_key,
                    fetched = items.len(),
                    cached, duplicates, near_duplicates, "cluster fetch merged"
                );
                (
                    FetchLogEntry {
                        run_id,
                        trigger,
                        cluster_key: cluster_key.to_string(),
                        fetched: items.len(),
                        cached,
                        duplicates,
                        near_duplicates,
                        duration_ms,
                        outcome,
                        started_at,
                        finished_at,
                    },
                    Ok(RefreshSummary {
                        fetched: items.len(),
                        cached,
                        duplicates,
                        duration_ms,
                    }),
                )
            }
            Ok(Err(err)) => {
                self.scheduler.release(cluster_key, false, finished_at);
                warn!(%run_id, cluster_key, error = %err, "cluster fetch failed");
                (
                    self.failed_entry(run_id, trigger, cluster_key, duration_ms, started_at, finished_at),
                    Err(EngineError::Provider(err)),
                )
            }
            Err(_) => {
                self.scheduler.release(cluster_key, false, finished_at);
                warn!(
                    %run_id,
                    cluster_key,
                    timeout_secs = self.config.fetch_timeout.as_secs(),
                    "cluster fetch timed out"
                );
                (
                    self.failed_entry(run_id, trigger, cluster_key, duration_ms, started_at, finished_at),
                    Err(EngineError::Provider(ProviderError::Timeout {
                        budget_ms: self.config.fetch_timeout.as_millis() as u64,
                    })),
                )
            }
        };

        self.scheduler.append_log(entry);
        self.recompute_cluster(cluster_key).await;
        result
    }

    fn failed_entry(
        &self,
        run_id: Uuid,
        trigger: FetchTrigger,
        cluster_key: &str,
        duration_ms: u64,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> FetchLogEntry {
        FetchLogEntry {
            run_id,
            trigger,
            cluster_key: cluster_key.to_string(),
            fetched: 0,
            cached: 0,
            duplicates: 0,
            near_duplicates: 0,
            duration_ms,
            outcome: FetchOutcome::Failed,
            started_at,
            finished_at,
        }
    }

    /// Recompute a cluster's aggregates from the pool and user stores.
    /// Serialized per cluster through the store's writer lock; safe to run
    /// concurrently for different clusters.
    pub async fn recompute_cluster(&self, cluster_key: &str) {
        let lock = self.cluster_profiles.writer_lock(cluster_key);
        let _writer = lock.lock().await;
        let now = Utc::now();

        let (live, expired, shown, clicked) = self.pool.cluster_totals(cluster_key, now);
        let (user_count, active_user_count) = self.user_profiles.counts_for_cluster(
            cluster_key,
            now,
            Duration::days(self.config.active_user_days),
        );
        let next_fetch_at = if (live as usize) < self.config.depth_threshold {
            now
        } else {
            now + Duration::hours(self.config.scheduled_interval_hours)
        };
        let avg_click_rate = cof_core::conversion_rate(clicked, shown);
        let last_fetch = self
            .fetch_log()
            .into_iter()
            .find(|entry| entry.cluster_key == cluster_key)
            .map(|entry| entry.finished_at);

        self.cluster_profiles.update(cluster_key, |profile| {
            profile.user_count = user_count;
            profile.active_user_count = active_user_count;
            profile.cached_opportunity_count = live;
            profile.expired_opportunity_count = expired;
            profile.total_shown = shown;
            profile.total_clicked = clicked;
            profile.avg_click_rate = avg_click_rate;
            if last_fetch.is_some() {
                profile.last_fetch_at = last_fetch;
            }
            profile.next_fetch_at = Some(next_fetch_at);
        });
    }

    /// Maintenance pass: expire and hard-delete pool rows, purge old shown
    /// history, recompute aggregates, then refresh the most active clusters
    /// regardless of depth so low-traffic clusters do not starve.
    pub async fn sweep(&self) -> SweepReport {
        let now = Utc::now();
        let pool_stats = self.pool.expire_and_sweep(now, self.config.retention_days);
        let history_purged = self
            .history
            .purge_older_than(now, self.config.retention_days);

        for cluster_key in self.pool.cluster_keys() {
            self.recompute_cluster(&cluster_key).await;
        }

        let mut targets = self
            .cluster_profiles
            .all()
            .into_iter()
            .filter(|profile| profile.active_user_count > 0)
            .collect::<Vec<_>>();
        targets.sort_by(|a, b| b.active_user_count.cmp(&a.active_user_count));
        targets.truncate(self.config.sweep_top_clusters);

        let mut clusters_refreshed = 0usize;
        for profile in targets {
            match self
                .run_fetch_for_cluster(&profile.cluster_key, FetchTrigger::Scheduled)
                .await
            {
                Ok(_) => clusters_refreshed += 1,
                Err(err) => {
                    warn!(cluster_key = %profile.cluster_key, error = %err, "scheduled refresh skipped")
                }
            }
        }

        info!(
            deactivated = pool_stats.deactivated,
            removed = pool_stats.removed,
            history_purged,
            clusters_refreshed,
            "sweep complete"
        );
        SweepReport {
            pool: pool_stats,
            history_purged,
            clusters_refreshed,
        }
    }

    /// Build the periodic sweep job when enabled via config.
    pub async fn maybe_build_scheduler(&self) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let engine = self
            .weak_self
            .upgrade()
            .context("engine dropped before scheduler setup")?;
        let cron = self.config.sweep_cron.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let engine = Arc::clone(&engine);
            Box::pin(async move {
                let report = engine.sweep().await;
                info!(?report, "scheduled sweep finished");
            })
        })
        .with_context(|| format!("creating sweep job for cron {cron}"))?;
        sched.add(job).await.context("adding sweep job")?;
        Ok(Some(sched))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cof_core::{Priority, RawOpportunity};
    use cof_providers::{FixtureProvider, HeuristicProfileModel};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn raw(title: &str, base: f64) -> RawOpportunity {
        RawOpportunity {
            title: title.to_string(),
            description: format!("{title} description"),
            category: Category::Travel,
            sub_category: None,
            source_url: format!("https://ex.am/{}", title.replace(' ', "-")),
            image_url: None,
            logo_url: None,
            offer_details: serde_json::Value::Null,
            base_relevance_score: Some(base),
            priority: Some(Priority::Medium),
        }
    }

    fn fixture_batch(count: usize) -> Vec<RawOpportunity> {
        (0..count)
            .map(|i| raw(&format!("offer {i:02}"), 0.9 - i as f64 * 0.01))
            .collect()
    }

    struct ScriptedScorer {
        by_title: HashMap<String, f64>,
        calls: AtomicUsize,
    }

    impl ScriptedScorer {
        fn new(by_title: &[(&str, f64)]) -> Self {
            Self {
                by_title: by_title
                    .iter()
                    .map(|(title, score)| (title.to_string(), *score))
                    .collect(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl RelevanceScorer for ScriptedScorer {
        async fn score(
            &self,
            summary: &OpportunitySummary,
            _profile: &UserProfileVector,
        ) -> Result<f64, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(*self.by_title.get(&summary.title).unwrap_or(&0.1))
        }
    }

    struct FailingScorer;

    #[async_trait]
    impl RelevanceScorer for FailingScorer {
        async fn score(
            &self,
            _summary: &OpportunitySummary,
            _profile: &UserProfileVector,
        ) -> Result<f64, ProviderError> {
            Err(ProviderError::Unavailable("scorer offline".into()))
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl OpportunityProvider for FailingProvider {
        fn provider_id(&self) -> &str {
            "failing"
        }

        async fn fetch(
            &self,
            _characteristics: &Characteristics,
            _categories: &[Category],
        ) -> Result<Vec<RawOpportunity>, ProviderError> {
            Err(ProviderError::Unavailable("transport down".into()))
        }
    }

    struct StallingProvider;

    #[async_trait]
    impl OpportunityProvider for StallingProvider {
        fn provider_id(&self) -> &str {
            "stalling"
        }

        async fn fetch(
            &self,
            _characteristics: &Characteristics,
            _categories: &[Category],
        ) -> Result<Vec<RawOpportunity>, ProviderError> {
            tokio::time::sleep(StdDuration::from_secs(3600)).await;
            Ok(vec![])
        }
    }

    fn model_with_alice() -> Arc<HeuristicProfileModel> {
        let model = HeuristicProfileModel::default();
        model.set_profile(
            "alice",
            serde_json::json!({
                "income_bracket": "50k-100k",
                "age_group": "25-35",
                "location": "Mumbai",
                "goals": ["travel"],
                "interests": ["beaches"],
            }),
        );
        Arc::new(model)
    }

    fn engine_with(
        provider: Arc<dyn OpportunityProvider>,
        scorer: Arc<dyn RelevanceScorer>,
    ) -> Arc<FeedEngine> {
        FeedEngine::new(EngineConfig::default(), provider, scorer, model_with_alice())
    }

    fn profile() -> UserProfileVector {
        UserProfileVector {
            user: "alice".into(),
            embedding: vec![],
            cluster_key: "c1".into(),
            characteristics: Characteristics::default(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn below_quota_skips_scorer_and_keeps_pool_order() {
        let scorer = Arc::new(ScriptedScorer::new(&[]));
        let engine = engine_with(
            Arc::new(FixtureProvider::new("fixtures", fixture_batch(4))),
            scorer.clone(),
        );

        let summary = engine.refresh_now("alice").await.expect("refresh");
        assert_eq!(summary.cached, 4);

        let feed = engine.list_opportunities("alice").await;
        assert_eq!(feed.status, FeedStatus::Ok);
        assert_eq!(feed.items.len(), 4);
        let titles = feed.items.iter().map(|i| i.title.as_str()).collect::<Vec<_>>();
        // Pool order: equal priority, base score descending.
        assert_eq!(titles, vec!["offer 00", "offer 01", "offer 02", "offer 03"]);
        assert_eq!(scorer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn surplus_is_ranked_by_blended_score_and_capped_at_quota() {
        // "offer 19" has the lowest base score among the 20 candidates the
        // pool hands to the ranker, but a dominant personal score.
        let scorer = Arc::new(ScriptedScorer::new(&[("offer 19", 0.95)]));
        let engine = engine_with(
            Arc::new(FixtureProvider::new("fixtures", fixture_batch(25))),
            scorer.clone(),
        );

        engine.refresh_now("alice").await.expect("refresh");
        let feed = engine.list_opportunities("alice").await;
        assert_eq!(feed.status, FeedStatus::Ok);
        assert_eq!(feed.items.len(), 6);
        assert_eq!(feed.items[0].title, "offer 19");
        assert!(scorer.calls.load(Ordering::SeqCst) >= 20);
    }

    #[tokio::test]
    async fn suppressed_items_never_appear_even_when_highest_scored() {
        let scorer = Arc::new(ScriptedScorer::new(&[("offer 19", 0.95)]));
        let engine = engine_with(
            Arc::new(FixtureProvider::new("fixtures", fixture_batch(25))),
            scorer,
        );
        engine.refresh_now("alice").await.expect("refresh");

        // First feed shows the scripted winner; the suppression window then
        // keeps it out of the next response no matter its score.
        let first = engine.list_opportunities("alice").await;
        assert_eq!(first.items[0].title, "offer 19");

        let second = engine.list_opportunities("alice").await;
        assert_eq!(second.items.len(), 6);
        assert!(second.items.iter().all(|i| i.title != "offer 19"));
        let shown_before = first.items.iter().map(|i| i.title.clone()).collect::<Vec<_>>();
        assert!(second.items.iter().all(|i| !shown_before.contains(&i.title)));
    }

    #[tokio::test]
    async fn failed_fetch_leaves_cluster_low_and_logs_failure() {
        let engine = engine_with(Arc::new(FailingProvider), Arc::new(ScriptedScorer::new(&[])));

        let err = engine.refresh_now("alice").await.expect_err("provider down");
        assert!(matches!(err, EngineError::Provider(_)));
        assert!(engine.pool().is_empty());

        let log = engine.fetch_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].outcome, FetchOutcome::Failed);
        assert_eq!(log[0].trigger, FetchTrigger::Manual);
        assert_eq!(log[0].fetched, 0);

        let cluster_key = log[0].cluster_key.clone();
        assert_eq!(engine.cluster_state(&cluster_key), ClusterState::Low);

        // The serving path stays clean: status only, no error.
        let feed = engine.list_opportunities("alice").await;
        assert_eq!(feed.status, FeedStatus::Refreshing);
        assert!(feed.items.is_empty());
    }

    #[tokio::test]
    async fn repeated_failures_cool_down_non_manual_fetches() {
        let engine = engine_with(Arc::new(FailingProvider), Arc::new(ScriptedScorer::new(&[])));
        let err = engine.refresh_now("alice").await.expect_err("provider down");
        let EngineError::Provider(_) = err else {
            panic!("expected provider error");
        };
        let cluster_key = engine.fetch_log()[0].cluster_key.clone();

        // Background/scheduled triggers respect the cooldown...
        let err = engine
            .run_fetch_for_cluster(&cluster_key, FetchTrigger::User)
            .await
            .expect_err("cooling down");
        assert!(matches!(err, EngineError::Provider(ProviderError::Unavailable(_))));
        assert_eq!(engine.fetch_log().len(), 1);

        // ...while a manual refresh punches through (and fails again).
        let err = engine.refresh_now("alice").await.expect_err("provider down");
        assert!(matches!(err, EngineError::Provider(_)));
        assert_eq!(engine.fetch_log().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn lease_allows_one_in_flight_fetch_per_cluster() {
        let engine = engine_with(Arc::new(StallingProvider), Arc::new(ScriptedScorer::new(&[])));

        let background = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.refresh_now("alice").await })
        };
        tokio::time::sleep(StdDuration::from_millis(50)).await;

        let err = engine.refresh_now("alice").await.expect_err("lease held");
        assert!(matches!(err, EngineError::RefreshInFlight { .. }));

        // The stalled fetch eventually hits the hard timeout and fails.
        let result = background.await.expect("join");
        assert!(matches!(
            result,
            Err(EngineError::Provider(ProviderError::Timeout { .. }))
        ));
        let log = engine.fetch_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].outcome, FetchOutcome::Failed);
    }

    #[tokio::test]
    async fn refresh_counts_duplicates_on_refetch() {
        let engine = engine_with(
            Arc::new(FixtureProvider::new("fixtures", fixture_batch(5))),
            Arc::new(ScriptedScorer::new(&[])),
        );

        let first = engine.refresh_now("alice").await.expect("refresh");
        assert_eq!((first.fetched, first.cached, first.duplicates), (5, 5, 0));

        let second = engine.refresh_now("alice").await.expect("refresh");
        assert_eq!((second.fetched, second.cached, second.duplicates), (5, 0, 5));

        let log = engine.fetch_log();
        assert_eq!(log.len(), 2);
        // Newest first.
        assert_eq!(log[0].duplicates, 5);
        assert_eq!(log[0].outcome, FetchOutcome::Success);
    }

    #[tokio::test]
    async fn missing_profile_yields_profile_missing_status() {
        let engine = engine_with(
            Arc::new(FixtureProvider::new("fixtures", fixture_batch(3))),
            Arc::new(ScriptedScorer::new(&[])),
        );
        let feed = engine.list_opportunities("stranger").await;
        assert_eq!(feed.status, FeedStatus::ProfileMissing);
        assert!(feed.items.is_empty());
        assert!(feed.cluster_key.is_none());

        let err = engine.refresh_now("stranger").await.expect_err("no profile");
        assert!(matches!(err, EngineError::ProfileUnavailable));
    }

    #[tokio::test]
    async fn analytics_recompute_reflects_engagement() {
        let engine = engine_with(
            Arc::new(FixtureProvider::new("fixtures", fixture_batch(4))),
            Arc::new(ScriptedScorer::new(&[])),
        );
        engine.refresh_now("alice").await.expect("refresh");
        let feed = engine.list_opportunities("alice").await;
        let clicked = &feed.items[0];
        engine.record_click("alice", &clicked.content_hash);
        engine.record_click("alice", &feed.items[1].content_hash);

        let cluster_key = feed.cluster_key.expect("cluster");
        engine.recompute_cluster(&cluster_key).await;

        let profiles = engine.cluster_profiles();
        let profile = profiles
            .iter()
            .find(|p| p.cluster_key == cluster_key)
            .expect("cluster profile");
        assert_eq!(profile.total_shown, 4);
        assert_eq!(profile.total_clicked, 2);
        assert_eq!(profile.avg_click_rate, 0.5);
        assert_eq!(profile.user_count, 1);
        assert_eq!(profile.active_user_count, 1);
        assert_eq!(profile.cached_opportunity_count, 4);
        assert!(profile.last_fetch_at.is_some());
    }

    #[tokio::test]
    async fn scorer_failure_degrades_to_base_score_order() {
        let ranker = RelevanceRanker {
            display_quota: 2,
            personal_weight: 0.7,
            scorer_timeout: StdDuration::from_millis(250),
        };
        // Build records through a pool so construction matches production.
        let pool = OpportunityPool::new();
        let candidates = (0..4)
            .map(|i| {
                let item = raw(&format!("r{i}"), 0.9 - i as f64 * 0.2);
                let cof_core::InsertOutcome::Inserted { content_hash } =
                    pool.insert_if_new(&item, "c1", Utc::now())
                else {
                    panic!("insert");
                };
                pool.snapshot(&content_hash).expect("snapshot")
            })
            .collect::<Vec<_>>();

        let scorer: Arc<dyn RelevanceScorer> = Arc::new(FailingScorer);
        let ranked = ranker.rank(candidates, &profile(), &scorer).await;
        assert_eq!(ranked.len(), 2);
        // Neutral personal scores everywhere, so base score decides.
        assert_eq!(ranked[0].title, "r0");
        assert_eq!(ranked[1].title, "r1");
    }

    #[test]
    fn near_duplicate_counting_is_fuzzy_but_bounded() {
        let items = vec![
            raw("AI Data Contributor", 0.5),
            raw("AI Data Contributer", 0.5),
            raw("Beach Villa Weekend", 0.5),
        ];
        assert_eq!(count_near_duplicates(&items, 0.92), 1);
        assert_eq!(count_near_duplicates(&items[2..], 0.92), 0);
    }

    #[tokio::test]
    async fn sweep_purges_and_refreshes_active_clusters() {
        // 25 items keeps the cluster above the depth threshold, so the feed
        // request does not race a background fetch of its own.
        let engine = engine_with(
            Arc::new(FixtureProvider::new("fixtures", fixture_batch(25))),
            Arc::new(ScriptedScorer::new(&[])),
        );
        engine.refresh_now("alice").await.expect("refresh");
        engine.list_opportunities("alice").await;

        let report = engine.sweep().await;
        assert_eq!(report.pool.removed, 0);
        // Alice's cluster is active, so the sweep re-fetched it (all
        // duplicates the second time around).
        assert_eq!(report.clusters_refreshed, 1);
        let log = engine.fetch_log();
        assert_eq!(log[0].trigger, FetchTrigger::Scheduled);
        assert_eq!(log[0].duplicates, 25);
    }
}
