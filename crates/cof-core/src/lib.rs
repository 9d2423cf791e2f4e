//! Core domain model for COF: cached opportunities, cluster keys, and the
//! content-hash identity used for deduplication.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "cof-core";

/// Offer category. Drives the cache TTL: investment offers stay valid far
/// longer than travel deals or job postings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Travel,
    Job,
    Investment,
}

impl Category {
    /// Cache lifetime for a freshly inserted record of this category.
    pub fn ttl(self) -> Duration {
        match self {
            Category::Investment => Duration::days(7),
            Category::Travel | Category::Job => Duration::hours(24),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Travel => "travel",
            Category::Job => "job",
            Category::Investment => "investment",
        }
    }
}

/// Provider-assigned priority tier. Orders candidates before any
/// personalized scoring happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// Higher sorts first.
    pub fn rank(self) -> u8 {
        match self {
            Priority::High => 2,
            Priority::Medium => 1,
            Priority::Low => 0,
        }
    }
}

/// Structured user characteristics extracted by the profile model.
/// Missing fields fall back to coarse defaults when the cluster key is
/// derived, so a sparse profile still lands in a usable cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Characteristics {
    pub income_bracket: Option<String>,
    pub age_group: Option<String>,
    pub location: Option<String>,
    #[serde(default)]
    pub goals: Vec<String>,
    pub risk_tolerance: Option<String>,
    #[serde(default)]
    pub interests: Vec<String>,
}

/// Cluster identity, structured internally and serialized to a stable
/// underscore-joined string on the wire. The wire form is what gets stored
/// on records and profiles; comparisons and tests operate on the struct.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterKey {
    pub income_bracket: String,
    pub goal: String,
    pub location: String,
    pub age_group: String,
}

impl ClusterKey {
    /// Deterministic assignment: same characteristics always produce the
    /// same key. Distinct characteristics that normalize identically share a
    /// cluster, which is the intended coarse-graining.
    pub fn from_characteristics(characteristics: &Characteristics) -> Self {
        Self {
            income_bracket: normalize_key_fragment(
                characteristics.income_bracket.as_deref().unwrap_or("unknown"),
            ),
            goal: normalize_key_fragment(
                characteristics
                    .goals
                    .first()
                    .map(String::as_str)
                    .unwrap_or("general"),
            ),
            location: normalize_key_fragment(
                characteristics.location.as_deref().unwrap_or("unknown"),
            ),
            age_group: normalize_key_fragment(
                characteristics.age_group.as_deref().unwrap_or("unknown"),
            ),
        }
    }

    /// Wire serialization, e.g. `income-50k-100k_investment_mumbai_25-35`.
    pub fn wire(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            self.income_bracket, self.goal, self.location, self.age_group
        )
    }
}

/// Lower-case, trim, and collapse runs of non-alphanumeric characters to a
/// single `-` so casing and punctuation differences cannot split a cluster.
pub fn normalize_key_fragment(input: &str) -> String {
    let collapsed = input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>();
    let parts = collapsed
        .split('-')
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>();
    if parts.is_empty() {
        "unknown".to_string()
    } else {
        parts.join("-")
    }
}

/// Stable content identity: lower-cased, trimmed fields joined with a
/// newline delimiter and digested with SHA-256. Insert dedup and
/// suppression lookups MUST both go through this function; a second
/// normalization path would produce false negatives.
pub fn content_hash(title: &str, description: &str, source_url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.trim().to_lowercase());
    hasher.update(b"\n");
    hasher.update(description.trim().to_lowercase());
    hasher.update(b"\n");
    hasher.update(source_url.trim().to_lowercase());
    hex::encode(hasher.finalize())
}

/// Raw opportunity as returned by a fetch provider, before dedup and
/// TTL assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawOpportunity {
    pub title: String,
    pub description: String,
    pub category: Category,
    #[serde(default)]
    pub sub_category: Option<String>,
    pub source_url: String,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub logo_url: Option<String>,
    #[serde(default)]
    pub offer_details: serde_json::Value,
    #[serde(default)]
    pub base_relevance_score: Option<f64>,
    #[serde(default)]
    pub priority: Option<Priority>,
}

impl RawOpportunity {
    pub fn content_hash(&self) -> String {
        content_hash(&self.title, &self.description, &self.source_url)
    }

    /// Provider prior, clamped to [0, 1]; 0.5 when the provider sent none.
    pub fn effective_base_score(&self) -> f64 {
        self.base_relevance_score.unwrap_or(0.5).clamp(0.0, 1.0)
    }

    pub fn effective_priority(&self) -> Priority {
        self.priority.unwrap_or_default()
    }
}

/// One cached offer, keyed globally by `content_hash`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpportunityRecord {
    pub content_hash: String,
    pub title: String,
    pub description: String,
    pub category: Category,
    pub sub_category: Option<String>,
    pub source_url: String,
    pub image_url: Option<String>,
    pub logo_url: Option<String>,
    pub offer_details: serde_json::Value,
    pub cluster_key: String,
    pub base_relevance_score: f64,
    pub priority: Priority,
    pub fetched_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_active: bool,
    pub shown_count: u64,
    pub click_count: u64,
    pub conversion_rate: f64,
}

impl OpportunityRecord {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at > now
    }
}

/// clicks/shown with the zero-shown case pinned to 0.
pub fn conversion_rate(click_count: u64, shown_count: u64) -> f64 {
    if shown_count == 0 {
        0.0
    } else {
        click_count as f64 / shown_count as f64
    }
}

/// Outcome of a dedup-checked insert. Duplicates are a frequent,
/// non-error result and carry the colliding hash for fetch-log counting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted { content_hash: String },
    Duplicate { content_hash: String },
}

impl InsertOutcome {
    pub fn is_inserted(&self) -> bool {
        matches!(self, InsertOutcome::Inserted { .. })
    }
}

/// Per-(user, opportunity) impression row backing the suppression window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserShownRecord {
    pub user: String,
    pub content_hash: String,
    pub shown_at: DateTime<Utc>,
    pub clicked: bool,
    pub clicked_at: Option<DateTime<Utc>>,
    pub dismissed: bool,
    pub dismissed_at: Option<DateTime<Utc>>,
}

impl UserShownRecord {
    pub fn new(user: &str, content_hash: &str, shown_at: DateTime<Utc>) -> Self {
        Self {
            user: user.to_string(),
            content_hash: content_hash.to_string(),
            shown_at,
            clicked: false,
            clicked_at: None,
            dismissed: false,
            dismissed_at: None,
        }
    }
}

/// Aggregate engagement state per cluster. Recomputed by the analytics
/// accumulator under a per-cluster writer lock; never hard-deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterProfile {
    pub cluster_key: String,
    pub user_count: u64,
    pub active_user_count: u64,
    pub cached_opportunity_count: u64,
    pub expired_opportunity_count: u64,
    pub total_shown: u64,
    pub total_clicked: u64,
    pub avg_click_rate: f64,
    pub last_fetch_at: Option<DateTime<Utc>>,
    pub next_fetch_at: Option<DateTime<Utc>>,
}

impl ClusterProfile {
    pub fn new(cluster_key: &str) -> Self {
        Self {
            cluster_key: cluster_key.to_string(),
            user_count: 0,
            active_user_count: 0,
            cached_opportunity_count: 0,
            expired_opportunity_count: 0,
            total_shown: 0,
            total_clicked: 0,
            avg_click_rate: 0.0,
            last_fetch_at: None,
            next_fetch_at: None,
        }
    }
}

/// Per-user derived characteristics and cluster assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfileVector {
    pub user: String,
    pub embedding: Vec<f32>,
    pub cluster_key: String,
    pub characteristics: Characteristics,
    pub updated_at: DateTime<Utc>,
}

impl UserProfileVector {
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        now - self.updated_at > max_age
    }
}

/// Serving-path status. The feed always returns a (possibly empty) list plus
/// one of these; raw provider errors never reach the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedStatus {
    Ok,
    ProfileMissing,
    Refreshing,
}
