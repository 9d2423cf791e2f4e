//! In-process stores for the opportunity cache: the cluster-scoped pool,
//! per-user shown history, cluster aggregates, and user profiles.
//!
//! All stores are shared via `Arc` and safe under concurrent request
//! handling. Engagement counters are atomics so concurrent `mark_shown` /
//! `mark_clicked` calls never lose updates; cluster aggregates are guarded
//! by a per-cluster writer lock handed out from a shared lock map.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Duration, Utc};
use cof_core::{
    conversion_rate, ClusterProfile, InsertOutcome, OpportunityRecord, RawOpportunity,
    UserProfileVector, UserShownRecord,
};
use serde::Serialize;
use tracing::debug;

pub const CRATE_NAME: &str = "cof-pool";

/// Cached entry. Descriptive fields and expiry are fixed at insert time;
/// only the counters and the active flag mutate afterwards.
struct PoolEntry {
    record: OpportunityRecord,
    shown_count: AtomicU64,
    click_count: AtomicU64,
    active: AtomicBool,
}

impl PoolEntry {
    fn from_raw(raw: &RawOpportunity, cluster_key: &str, now: DateTime<Utc>) -> Self {
        let content_hash = raw.content_hash();
        Self {
            record: OpportunityRecord {
                content_hash,
                title: raw.title.clone(),
                description: raw.description.clone(),
                category: raw.category,
                sub_category: raw.sub_category.clone(),
                source_url: raw.source_url.clone(),
                image_url: raw.image_url.clone(),
                logo_url: raw.logo_url.clone(),
                offer_details: raw.offer_details.clone(),
                cluster_key: cluster_key.to_string(),
                base_relevance_score: raw.effective_base_score(),
                priority: raw.effective_priority(),
                fetched_at: now,
                expires_at: now + raw.category.ttl(),
                is_active: true,
                shown_count: 0,
                click_count: 0,
                conversion_rate: 0.0,
            },
            shown_count: AtomicU64::new(0),
            click_count: AtomicU64::new(0),
            active: AtomicBool::new(true),
        }
    }

    /// Materialize the record with current counter values.
    fn snapshot(&self) -> OpportunityRecord {
        let shown = self.shown_count.load(Ordering::Relaxed);
        let clicked = self.click_count.load(Ordering::Relaxed);
        let mut record = self.record.clone();
        record.shown_count = shown;
        record.click_count = clicked;
        record.conversion_rate = conversion_rate(clicked, shown);
        record.is_active = self.active.load(Ordering::Relaxed);
        record
    }

    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.active.load(Ordering::Relaxed) && self.record.expires_at > now
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepStats {
    pub deactivated: usize,
    pub removed: usize,
}

struct PoolInner {
    entries: HashMap<String, Arc<PoolEntry>>,
    by_cluster: HashMap<String, HashSet<String>>,
}

/// Shared, cluster-scoped opportunity cache. The content hash is the global
/// unique key: an insert colliding with any existing record is rejected as a
/// duplicate regardless of cluster, so identical content fetched for two
/// clusters stays a single row targeted at the cluster of first insertion.
pub struct OpportunityPool {
    inner: RwLock<PoolInner>,
}

impl Default for OpportunityPool {
    fn default() -> Self {
        Self::new()
    }
}

impl OpportunityPool {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(PoolInner {
                entries: HashMap::new(),
                by_cluster: HashMap::new(),
            }),
        }
    }

    /// Dedup-checked insert. Atomic under the pool write lock, so two
    /// concurrent fetches carrying the same content cannot both succeed.
    pub fn insert_if_new(
        &self,
        raw: &RawOpportunity,
        cluster_key: &str,
        now: DateTime<Utc>,
    ) -> InsertOutcome {
        let content_hash = raw.content_hash();
        let mut inner = self.inner.write().expect("pool lock poisoned");
        if inner.entries.contains_key(&content_hash) {
            return InsertOutcome::Duplicate { content_hash };
        }
        let entry = Arc::new(PoolEntry::from_raw(raw, cluster_key, now));
        inner.entries.insert(content_hash.clone(), entry);
        inner
            .by_cluster
            .entry(cluster_key.to_string())
            .or_default()
            .insert(content_hash.clone());
        InsertOutcome::Inserted { content_hash }
    }

    /// Active, unexpired records for a cluster, minus `exclude`, ordered by
    /// priority then base relevance score (both descending), capped at
    /// `limit` to bound downstream ranking cost.
    pub fn active_candidates(
        &self,
        cluster_key: &str,
        exclude: &HashSet<String>,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Vec<OpportunityRecord> {
        let inner = self.inner.read().expect("pool lock poisoned");
        let Some(hashes) = inner.by_cluster.get(cluster_key) else {
            return Vec::new();
        };
        let mut candidates = hashes
            .iter()
            .filter(|hash| !exclude.contains(*hash))
            .filter_map(|hash| inner.entries.get(hash))
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.snapshot())
            .collect::<Vec<_>>();
        candidates.sort_by(|a, b| {
            b.priority
                .rank()
                .cmp(&a.priority.rank())
                .then_with(|| {
                    b.base_relevance_score
                        .partial_cmp(&a.base_relevance_score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.content_hash.cmp(&b.content_hash))
        });
        candidates.truncate(limit);
        candidates
    }

    /// Count of live records in a cluster — the "pool depth" the refresh
    /// scheduler compares against its threshold.
    pub fn depth(&self, cluster_key: &str, now: DateTime<Utc>) -> usize {
        let inner = self.inner.read().expect("pool lock poisoned");
        inner
            .by_cluster
            .get(cluster_key)
            .map(|hashes| {
                hashes
                    .iter()
                    .filter_map(|hash| inner.entries.get(hash))
                    .filter(|entry| entry.is_live(now))
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn mark_shown(&self, content_hash: &str) -> bool {
        self.bump(content_hash, |entry| {
            entry.shown_count.fetch_add(1, Ordering::Relaxed);
        })
    }

    pub fn mark_clicked(&self, content_hash: &str) -> bool {
        self.bump(content_hash, |entry| {
            entry.click_count.fetch_add(1, Ordering::Relaxed);
        })
    }

    fn bump(&self, content_hash: &str, apply: impl FnOnce(&PoolEntry)) -> bool {
        let entry = {
            let inner = self.inner.read().expect("pool lock poisoned");
            inner.entries.get(content_hash).cloned()
        };
        match entry {
            Some(entry) => {
                apply(&entry);
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self, content_hash: &str) -> Option<OpportunityRecord> {
        let inner = self.inner.read().expect("pool lock poisoned");
        inner.entries.get(content_hash).map(|e| e.snapshot())
    }

    /// Soft-delete records past expiry and hard-delete records whose expiry
    /// is older than the retention window. Runs off the request path.
    pub fn expire_and_sweep(&self, now: DateTime<Utc>, retention_days: i64) -> SweepStats {
        let retention_cutoff = now - Duration::days(retention_days);
        let mut stats = SweepStats::default();
        let mut inner = self.inner.write().expect("pool lock poisoned");

        for entry in inner.entries.values() {
            if entry.record.expires_at <= now && entry.active.swap(false, Ordering::Relaxed) {
                stats.deactivated += 1;
            }
        }

        let doomed = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.record.expires_at < retention_cutoff)
            .map(|(hash, _)| hash.clone())
            .collect::<Vec<_>>();
        for hash in doomed {
            if let Some(entry) = inner.entries.remove(&hash) {
                if let Some(cluster) = inner.by_cluster.get_mut(&entry.record.cluster_key) {
                    cluster.remove(&hash);
                }
                stats.removed += 1;
            }
        }

        if stats.deactivated > 0 || stats.removed > 0 {
            debug!(
                deactivated = stats.deactivated,
                removed = stats.removed,
                "pool sweep"
            );
        }
        stats
    }

    /// Aggregates for one cluster: (live count, expired count, total shown,
    /// total clicked). Feeds the analytics recompute.
    pub fn cluster_totals(&self, cluster_key: &str, now: DateTime<Utc>) -> (u64, u64, u64, u64) {
        let inner = self.inner.read().expect("pool lock poisoned");
        let Some(hashes) = inner.by_cluster.get(cluster_key) else {
            return (0, 0, 0, 0);
        };
        let mut live = 0u64;
        let mut expired = 0u64;
        let mut shown = 0u64;
        let mut clicked = 0u64;
        for entry in hashes.iter().filter_map(|h| inner.entries.get(h)) {
            if entry.is_live(now) {
                live += 1;
            } else {
                expired += 1;
            }
            shown += entry.shown_count.load(Ordering::Relaxed);
            clicked += entry.click_count.load(Ordering::Relaxed);
        }
        (live, expired, shown, clicked)
    }

    pub fn cluster_keys(&self) -> Vec<String> {
        let inner = self.inner.read().expect("pool lock poisoned");
        inner.by_cluster.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("pool lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-user record of shown opportunities, enforcing the "don't re-show
/// within N days" suppression window. Rows are logically partitioned by
/// user and never cross-mutated.
pub struct ShownHistoryTracker {
    window: Duration,
    by_user: RwLock<HashMap<String, HashMap<String, UserShownRecord>>>,
}

impl ShownHistoryTracker {
    pub fn new(window_days: i64) -> Self {
        Self {
            window: Duration::days(window_days),
            by_user: RwLock::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Hashes shown to `user` within the trailing window — the bulk
    /// suppression set applied before ranking.
    pub fn recently_shown(&self, user: &str, now: DateTime<Utc>) -> HashSet<String> {
        let cutoff = now - self.window;
        let by_user = self.by_user.read().expect("history lock poisoned");
        by_user
            .get(user)
            .map(|rows| {
                rows.values()
                    .filter(|row| row.shown_at > cutoff)
                    .map(|row| row.content_hash.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn filter_unseen(
        &self,
        user: &str,
        candidates: Vec<OpportunityRecord>,
        now: DateTime<Utc>,
    ) -> Vec<OpportunityRecord> {
        let seen = self.recently_shown(user, now);
        candidates
            .into_iter()
            .filter(|c| !seen.contains(&c.content_hash))
            .collect()
    }

    /// Idempotent upsert. An existing row inside the window is left alone;
    /// outside the window the impression is refreshed and prior feedback
    /// cleared — the row always describes the most recent showing.
    pub fn record_shown(&self, user: &str, content_hash: &str, now: DateTime<Utc>) {
        let cutoff = now - self.window;
        let mut by_user = self.by_user.write().expect("history lock poisoned");
        let rows = by_user.entry(user.to_string()).or_default();
        match rows.get_mut(content_hash) {
            Some(row) if row.shown_at > cutoff => {}
            Some(row) => {
                *row = UserShownRecord::new(user, content_hash, now);
            }
            None => {
                rows.insert(
                    content_hash.to_string(),
                    UserShownRecord::new(user, content_hash, now),
                );
            }
        }
    }

    /// Feedback updates are no-ops when no shown-row exists yet — a click
    /// must never fail just because the shown write lagged.
    pub fn record_clicked(&self, user: &str, content_hash: &str, now: DateTime<Utc>) -> bool {
        self.update_row(user, content_hash, |row| {
            row.clicked = true;
            row.clicked_at = Some(now);
        })
    }

    pub fn record_dismissed(&self, user: &str, content_hash: &str, now: DateTime<Utc>) -> bool {
        self.update_row(user, content_hash, |row| {
            row.dismissed = true;
            row.dismissed_at = Some(now);
        })
    }

    fn update_row(
        &self,
        user: &str,
        content_hash: &str,
        apply: impl FnOnce(&mut UserShownRecord),
    ) -> bool {
        let mut by_user = self.by_user.write().expect("history lock poisoned");
        match by_user.get_mut(user).and_then(|rows| rows.get_mut(content_hash)) {
            Some(row) => {
                apply(row);
                true
            }
            None => false,
        }
    }

    pub fn has_seen_recently(&self, user: &str, content_hash: &str, now: DateTime<Utc>) -> bool {
        let cutoff = now - self.window;
        let by_user = self.by_user.read().expect("history lock poisoned");
        by_user
            .get(user)
            .and_then(|rows| rows.get(content_hash))
            .map(|row| row.shown_at > cutoff)
            .unwrap_or(false)
    }

    pub fn get(&self, user: &str, content_hash: &str) -> Option<UserShownRecord> {
        let by_user = self.by_user.read().expect("history lock poisoned");
        by_user
            .get(user)
            .and_then(|rows| rows.get(content_hash))
            .cloned()
    }

    /// Drop rows older than the retention window. Returns removed count.
    pub fn purge_older_than(&self, now: DateTime<Utc>, retention_days: i64) -> usize {
        let cutoff = now - Duration::days(retention_days);
        let mut removed = 0usize;
        let mut by_user = self.by_user.write().expect("history lock poisoned");
        for rows in by_user.values_mut() {
            let before = rows.len();
            rows.retain(|_, row| row.shown_at >= cutoff);
            removed += before - rows.len();
        }
        by_user.retain(|_, rows| !rows.is_empty());
        removed
    }
}

struct ProfileEntry {
    vector: UserProfileVector,
    last_seen_at: DateTime<Utc>,
}

/// Per-user profile vectors plus last-activity tracking used for the
/// cluster's active-user aggregate.
pub struct UserProfileStore {
    inner: RwLock<HashMap<String, ProfileEntry>>,
}

impl Default for UserProfileStore {
    fn default() -> Self {
        Self::new()
    }
}

impl UserProfileStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, user: &str) -> Option<UserProfileVector> {
        let inner = self.inner.read().expect("profile lock poisoned");
        inner.get(user).map(|e| e.vector.clone())
    }

    pub fn upsert(&self, vector: UserProfileVector, now: DateTime<Utc>) {
        let mut inner = self.inner.write().expect("profile lock poisoned");
        let user = vector.user.clone();
        inner.insert(
            user,
            ProfileEntry {
                vector,
                last_seen_at: now,
            },
        );
    }

    pub fn note_seen(&self, user: &str, now: DateTime<Utc>) {
        let mut inner = self.inner.write().expect("profile lock poisoned");
        if let Some(entry) = inner.get_mut(user) {
            entry.last_seen_at = now;
        }
    }

    /// (total users, users active within `active_window`) for a cluster.
    pub fn counts_for_cluster(
        &self,
        cluster_key: &str,
        now: DateTime<Utc>,
        active_window: Duration,
    ) -> (u64, u64) {
        let cutoff = now - active_window;
        let inner = self.inner.read().expect("profile lock poisoned");
        let mut total = 0u64;
        let mut active = 0u64;
        for entry in inner.values() {
            if entry.vector.cluster_key == cluster_key {
                total += 1;
                if entry.last_seen_at > cutoff {
                    active += 1;
                }
            }
        }
        (total, active)
    }
}

/// Cluster aggregates plus the per-cluster writer locks that serialize
/// recomputation. Different clusters recompute concurrently; within one
/// cluster there is a single writer at a time.
pub struct ClusterProfileStore {
    profiles: RwLock<HashMap<String, ClusterProfile>>,
    writer_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Default for ClusterProfileStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterProfileStore {
    pub fn new() -> Self {
        Self {
            profiles: RwLock::new(HashMap::new()),
            writer_locks: Mutex::new(HashMap::new()),
        }
    }

    /// The writer lock for one cluster. Hold it across a read-recompute-write
    /// cycle to keep the aggregate snapshot consistent.
    pub fn writer_lock(&self, cluster_key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.writer_locks.lock().expect("writer lock map poisoned");
        locks
            .entry(cluster_key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    pub fn get(&self, cluster_key: &str) -> Option<ClusterProfile> {
        let profiles = self.profiles.read().expect("cluster profiles poisoned");
        profiles.get(cluster_key).cloned()
    }

    pub fn all(&self) -> Vec<ClusterProfile> {
        let profiles = self.profiles.read().expect("cluster profiles poisoned");
        let mut out = profiles.values().cloned().collect::<Vec<_>>();
        out.sort_by(|a, b| a.cluster_key.cmp(&b.cluster_key));
        out
    }

    /// Apply a mutation, creating the profile lazily on first touch.
    /// Clusters are reused, never hard-deleted.
    pub fn update(&self, cluster_key: &str, apply: impl FnOnce(&mut ClusterProfile)) {
        let mut profiles = self.profiles.write().expect("cluster profiles poisoned");
        let profile = profiles
            .entry(cluster_key.to_string())
            .or_insert_with(|| ClusterProfile::new(cluster_key));
        apply(profile);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use cof_core::{Category, Priority};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().expect("ts")
    }

    fn raw(title: &str, url: &str, category: Category) -> RawOpportunity {
        RawOpportunity {
            title: title.to_string(),
            description: format!("{title} description"),
            category,
            sub_category: None,
            source_url: url.to_string(),
            image_url: None,
            logo_url: None,
            offer_details: serde_json::Value::Null,
            base_relevance_score: Some(0.5),
            priority: Some(Priority::Medium),
        }
    }

    #[test]
    fn identical_content_dedups_across_casing_and_whitespace() {
        let pool = OpportunityPool::new();
        let now = t0();
        let first = raw("Goa Beach Deal", "https://ex.am/goa", Category::Travel);
        let mut second = first.clone();
        second.title = "  GOA beach DEAL ".to_string();
        second.description = "GOA BEACH DEAL DESCRIPTION  ".to_string();

        assert!(pool.insert_if_new(&first, "c1", now).is_inserted());
        assert!(!pool.insert_if_new(&second, "c1", now).is_inserted());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn duplicate_across_clusters_stays_with_first_cluster() {
        let pool = OpportunityPool::new();
        let now = t0();
        let item = raw("Remote Rust Role", "https://ex.am/rust", Category::Job);

        let outcome = pool.insert_if_new(&item, "cluster-a", now);
        let InsertOutcome::Inserted { content_hash } = outcome else {
            panic!("expected insert");
        };
        assert!(!pool.insert_if_new(&item, "cluster-b", now).is_inserted());

        let record = pool.snapshot(&content_hash).expect("record");
        assert_eq!(record.cluster_key, "cluster-a");
        assert_eq!(pool.depth("cluster-b", now), 0);
    }

    #[test]
    fn candidates_ordered_by_priority_then_base_score() {
        let pool = OpportunityPool::new();
        let now = t0();
        let mut low = raw("low", "https://ex.am/1", Category::Travel);
        low.priority = Some(Priority::Low);
        low.base_relevance_score = Some(0.99);
        let mut high = raw("high", "https://ex.am/2", Category::Travel);
        high.priority = Some(Priority::High);
        high.base_relevance_score = Some(0.10);
        let mut mid_strong = raw("mid strong", "https://ex.am/3", Category::Travel);
        mid_strong.base_relevance_score = Some(0.80);
        let mut mid_weak = raw("mid weak", "https://ex.am/4", Category::Travel);
        mid_weak.base_relevance_score = Some(0.20);

        for item in [&low, &high, &mid_strong, &mid_weak] {
            assert!(pool.insert_if_new(item, "c1", now).is_inserted());
        }

        let got = pool.active_candidates("c1", &HashSet::new(), 20, now);
        let titles = got.iter().map(|r| r.title.as_str()).collect::<Vec<_>>();
        assert_eq!(titles, vec!["high", "mid strong", "mid weak", "low"]);
    }

    #[test]
    fn candidates_respect_exclusion_and_limit() {
        let pool = OpportunityPool::new();
        let now = t0();
        let mut hashes = Vec::new();
        for i in 0..5 {
            let item = raw(&format!("item {i}"), &format!("https://ex.am/{i}"), Category::Job);
            let InsertOutcome::Inserted { content_hash } = pool.insert_if_new(&item, "c1", now)
            else {
                panic!("expected insert");
            };
            hashes.push(content_hash);
        }

        let exclude = HashSet::from([hashes[0].clone(), hashes[1].clone()]);
        let got = pool.active_candidates("c1", &exclude, 2, now);
        assert_eq!(got.len(), 2);
        assert!(got.iter().all(|r| !exclude.contains(&r.content_hash)));
    }

    #[test]
    fn expired_records_never_surface_and_sweep_hard_deletes() {
        let pool = OpportunityPool::new();
        let now = t0();
        let item = raw("24h travel deal", "https://ex.am/t", Category::Travel);
        assert!(pool.insert_if_new(&item, "c1", now).is_inserted());

        let after_expiry = now + Duration::hours(25);
        assert!(pool.active_candidates("c1", &HashSet::new(), 20, after_expiry).is_empty());
        assert_eq!(pool.depth("c1", after_expiry), 0);

        let stats = pool.expire_and_sweep(after_expiry, 30);
        assert_eq!(stats, SweepStats { deactivated: 1, removed: 0 });
        assert_eq!(pool.len(), 1);

        let past_retention = now + Duration::days(32);
        let stats = pool.expire_and_sweep(past_retention, 30);
        assert_eq!(stats.removed, 1);
        assert!(pool.is_empty());
    }

    #[test]
    fn investment_ttl_outlives_travel_ttl() {
        let pool = OpportunityPool::new();
        let now = t0();
        assert!(pool
            .insert_if_new(&raw("fund", "https://ex.am/f", Category::Investment), "c1", now)
            .is_inserted());
        let in_three_days = now + Duration::days(3);
        assert_eq!(pool.depth("c1", in_three_days), 1);
        let in_eight_days = now + Duration::days(8);
        assert_eq!(pool.depth("c1", in_eight_days), 0);
    }

    #[test]
    fn concurrent_marks_keep_conversion_rate_consistent() {
        let pool = Arc::new(OpportunityPool::new());
        let now = t0();
        let item = raw("contended", "https://ex.am/c", Category::Job);
        let InsertOutcome::Inserted { content_hash } = pool.insert_if_new(&item, "c1", now) else {
            panic!("expected insert");
        };

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            let hash = content_hash.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    pool.mark_shown(&hash);
                    pool.mark_clicked(&hash);
                }
            }));
        }
        for handle in handles {
            handle.join().expect("mark thread");
        }

        let record = pool.snapshot(&content_hash).expect("record");
        assert_eq!(record.shown_count, 800);
        assert_eq!(record.click_count, 800);
        assert_eq!(record.conversion_rate, 1.0);
    }

    #[test]
    fn suppression_window_day_three_blocks_day_eight_allows() {
        let history = ShownHistoryTracker::new(7);
        let day0 = t0();
        history.record_shown("alice", "hash-x", day0);

        let day3 = day0 + Duration::days(3);
        assert!(history.has_seen_recently("alice", "hash-x", day3));
        assert!(history.recently_shown("alice", day3).contains("hash-x"));

        let day8 = day0 + Duration::days(8);
        assert!(!history.has_seen_recently("alice", "hash-x", day8));
        assert!(history.recently_shown("alice", day8).is_empty());
    }

    #[test]
    fn reshow_outside_window_resets_feedback() {
        let history = ShownHistoryTracker::new(7);
        let day0 = t0();
        history.record_shown("alice", "hash-x", day0);
        assert!(history.record_clicked("alice", "hash-x", day0 + Duration::hours(1)));

        // Inside the window the upsert is a no-op.
        history.record_shown("alice", "hash-x", day0 + Duration::days(2));
        let row = history.get("alice", "hash-x").expect("row");
        assert_eq!(row.shown_at, day0);
        assert!(row.clicked);

        // Outside it the impression refreshes and feedback clears.
        let day9 = day0 + Duration::days(9);
        history.record_shown("alice", "hash-x", day9);
        let row = history.get("alice", "hash-x").expect("row");
        assert_eq!(row.shown_at, day9);
        assert!(!row.clicked);
        assert!(row.clicked_at.is_none());
    }

    #[test]
    fn feedback_without_shown_row_is_a_noop() {
        let history = ShownHistoryTracker::new(7);
        assert!(!history.record_clicked("bob", "missing", t0()));
        assert!(!history.record_dismissed("bob", "missing", t0()));
        assert!(history.get("bob", "missing").is_none());
    }

    #[test]
    fn purge_drops_rows_past_retention() {
        let history = ShownHistoryTracker::new(7);
        let day0 = t0();
        history.record_shown("alice", "old", day0);
        history.record_shown("alice", "new", day0 + Duration::days(20));

        let removed = history.purge_older_than(day0 + Duration::days(35), 30);
        assert_eq!(removed, 1);
        assert!(history.get("alice", "old").is_none());
        assert!(history.get("alice", "new").is_some());
    }

    #[test]
    fn user_profile_store_tracks_cluster_activity() {
        let store = UserProfileStore::new();
        let now = t0();
        for (user, seen_at) in [("a", now), ("b", now - Duration::days(10))] {
            store.upsert(
                UserProfileVector {
                    user: user.to_string(),
                    embedding: vec![0.0; 4],
                    cluster_key: "c1".to_string(),
                    characteristics: Default::default(),
                    updated_at: seen_at,
                },
                seen_at,
            );
        }

        let (total, active) = store.counts_for_cluster("c1", now, Duration::days(7));
        assert_eq!((total, active), (2, 1));

        store.note_seen("b", now);
        let (_, active) = store.counts_for_cluster("c1", now, Duration::days(7));
        assert_eq!(active, 2);
    }

    #[test]
    fn cluster_profiles_are_created_lazily_and_reused() {
        let store = ClusterProfileStore::new();
        store.update("c1", |p| p.total_shown = 10);
        store.update("c1", |p| p.total_clicked = 4);
        let profile = store.get("c1").expect("profile");
        assert_eq!(profile.total_shown, 10);
        assert_eq!(profile.total_clicked, 4);
        assert_eq!(store.all().len(), 1);
    }
}
