//! Collaborator contracts consumed by the feed engine: opportunity fetch
//! providers, the personalized relevance scorer, and the profile model,
//! plus the retry/backoff plumbing and an ordered fallback chain.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use cof_core::{Category, Characteristics, OpportunityRecord, RawOpportunity, UserProfileVector};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "cof-providers";

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider call timed out after {budget_ms}ms")]
    Timeout { budget_ms: u64 },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Exponential backoff with a hard cap. Shared by the HTTP provider's retry
/// loop and the refresh scheduler's failed-fetch cooldown.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Compact candidate view handed to the scorer; keeps the scoring payload
/// independent of pool internals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpportunitySummary {
    pub content_hash: String,
    pub title: String,
    pub description: String,
    pub category: Category,
    pub sub_category: Option<String>,
}

impl OpportunitySummary {
    pub fn from_record(record: &OpportunityRecord) -> Self {
        Self {
            content_hash: record.content_hash.clone(),
            title: record.title.clone(),
            description: record.description.clone(),
            category: record.category,
            sub_category: record.sub_category.clone(),
        }
    }
}

/// External search/AI provider producing raw opportunities for a cluster's
/// characteristics. An empty result is Ok — providers only error on
/// transport or provider failure.
#[async_trait]
pub trait OpportunityProvider: Send + Sync {
    fn provider_id(&self) -> &str;

    async fn fetch(
        &self,
        characteristics: &Characteristics,
        categories: &[Category],
    ) -> Result<Vec<RawOpportunity>, ProviderError>;
}

/// Personalized relevance scorer. Must answer inside the ranking timeout or
/// the caller substitutes a neutral score.
#[async_trait]
pub trait RelevanceScorer: Send + Sync {
    async fn score(
        &self,
        summary: &OpportunitySummary,
        profile: &UserProfileVector,
    ) -> Result<f64, ProviderError>;
}

/// Profile collaborator: owns the raw questionnaire payloads and turns them
/// into characteristics plus an opaque embedding.
#[async_trait]
pub trait ProfileModel: Send + Sync {
    /// Raw profile payload for a user; `None` means the user has not
    /// completed their profile yet.
    async fn profile_payload(
        &self,
        user: &str,
    ) -> Result<Option<serde_json::Value>, ProviderError>;

    async fn extract_characteristics(
        &self,
        payload: &serde_json::Value,
    ) -> Result<Characteristics, ProviderError>;

    async fn embed(&self, payload: &serde_json::Value) -> Result<Vec<f32>, ProviderError>;
}

/// Registry of configured fetch providers, same shape as a `providers.yaml`
/// checked in next to the deployment. Order in the file is fallback order.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderRegistry {
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub endpoint: String,
    #[serde(default)]
    pub notes: Option<String>,
}

pub fn load_provider_registry(path: impl AsRef<Path>) -> anyhow::Result<ProviderRegistry> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Reqwest-backed provider hitting a single external endpoint, with the
/// classify-and-retry loop around transient failures.
pub struct HttpOpportunityProvider {
    provider_id: String,
    endpoint: String,
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

#[derive(Debug, Serialize)]
struct FetchRequestBody<'a> {
    characteristics: &'a Characteristics,
    categories: &'a [Category],
}

impl HttpOpportunityProvider {
    pub fn new(
        provider_id: impl Into<String>,
        endpoint: impl Into<String>,
        timeout: Duration,
        backoff: BackoffPolicy,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            provider_id: provider_id.into(),
            endpoint: endpoint.into(),
            client,
            backoff,
        })
    }
}

#[async_trait]
impl OpportunityProvider for HttpOpportunityProvider {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    async fn fetch(
        &self,
        characteristics: &Characteristics,
        categories: &[Category],
    ) -> Result<Vec<RawOpportunity>, ProviderError> {
        let body = FetchRequestBody {
            characteristics,
            categories,
        };
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let resp_result = self.client.post(&self.endpoint).json(&body).send().await;
            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        return Ok(resp.json::<Vec<RawOpportunity>>().await?);
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(ProviderError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(ProviderError::Transport(err));
                }
            }
        }

        Err(last_request_error
            .map(ProviderError::Transport)
            .unwrap_or_else(|| {
                ProviderError::Unavailable("retry loop exhausted without a captured error".into())
            }))
    }
}

/// Ordered fallback chain: try each configured provider in sequence under a
/// shared wall-clock budget, returning the first successful response.
pub struct FallbackProvider {
    providers: Vec<Arc<dyn OpportunityProvider>>,
    budget: Duration,
}

impl FallbackProvider {
    pub fn new(providers: Vec<Arc<dyn OpportunityProvider>>, budget: Duration) -> Self {
        Self { providers, budget }
    }

    /// Build the chain from a registry, keeping file order for enabled
    /// entries.
    pub fn from_registry(
        registry: &ProviderRegistry,
        per_call_timeout: Duration,
        budget: Duration,
    ) -> anyhow::Result<Self> {
        let mut providers: Vec<Arc<dyn OpportunityProvider>> = Vec::new();
        for config in registry.providers.iter().filter(|c| c.enabled) {
            providers.push(Arc::new(HttpOpportunityProvider::new(
                config.provider_id.clone(),
                config.endpoint.clone(),
                per_call_timeout,
                BackoffPolicy::default(),
            )?));
        }
        Ok(Self::new(providers, budget))
    }
}

#[async_trait]
impl OpportunityProvider for FallbackProvider {
    fn provider_id(&self) -> &str {
        "fallback-chain"
    }

    async fn fetch(
        &self,
        characteristics: &Characteristics,
        categories: &[Category],
    ) -> Result<Vec<RawOpportunity>, ProviderError> {
        let deadline = tokio::time::Instant::now() + self.budget;
        let mut last_error = ProviderError::Unavailable("no providers configured".into());

        for provider in &self.providers {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(ProviderError::Timeout {
                    budget_ms: self.budget.as_millis() as u64,
                });
            }
            match tokio::time::timeout(remaining, provider.fetch(characteristics, categories))
                .await
            {
                Ok(Ok(items)) => return Ok(items),
                Ok(Err(err)) => {
                    warn!(provider_id = provider.provider_id(), error = %err, "provider failed, trying next");
                    last_error = err;
                }
                Err(_) => {
                    warn!(provider_id = provider.provider_id(), "provider exceeded fallback budget");
                    last_error = ProviderError::Timeout {
                        budget_ms: self.budget.as_millis() as u64,
                    };
                }
            }
        }
        Err(last_error)
    }
}

/// Canned provider for tests and local runs, mirroring the fixture-first
/// style used for source adapters: a JSON file of raw opportunities stands
/// in for the live provider.
pub struct FixtureProvider {
    provider_id: String,
    items: Vec<RawOpportunity>,
}

impl FixtureProvider {
    pub fn new(provider_id: impl Into<String>, items: Vec<RawOpportunity>) -> Self {
        Self {
            provider_id: provider_id.into(),
            items,
        }
    }

    pub fn from_json_file(
        provider_id: impl Into<String>,
        path: impl AsRef<Path>,
    ) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let items: Vec<RawOpportunity> =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::new(provider_id, items))
    }
}

#[async_trait]
impl OpportunityProvider for FixtureProvider {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    async fn fetch(
        &self,
        _characteristics: &Characteristics,
        categories: &[Category],
    ) -> Result<Vec<RawOpportunity>, ProviderError> {
        Ok(self
            .items
            .iter()
            .filter(|item| categories.is_empty() || categories.contains(&item.category))
            .cloned()
            .collect())
    }
}

/// Local interest-overlap scorer: fraction of the profile's interest and
/// goal terms appearing in the opportunity text, centered so an empty
/// profile scores neutral.
pub struct KeywordOverlapScorer;

#[async_trait]
impl RelevanceScorer for KeywordOverlapScorer {
    async fn score(
        &self,
        summary: &OpportunitySummary,
        profile: &UserProfileVector,
    ) -> Result<f64, ProviderError> {
        let terms = profile
            .characteristics
            .interests
            .iter()
            .chain(profile.characteristics.goals.iter())
            .map(|t| t.to_lowercase())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>();
        if terms.is_empty() {
            return Ok(0.5);
        }
        let haystack = format!("{} {}", summary.title, summary.description).to_lowercase();
        let matched = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
        Ok((matched as f64 / terms.len() as f64).clamp(0.0, 1.0))
    }
}

/// Rule-driven profile model over an in-memory payload store. Extraction
/// reads the structured questionnaire fields; the embedding is a
/// deterministic token-bucket vector so repeated generation is stable.
pub struct HeuristicProfileModel {
    payloads: RwLock<HashMap<String, serde_json::Value>>,
    embedding_dims: usize,
}

impl Default for HeuristicProfileModel {
    fn default() -> Self {
        Self::new(16)
    }
}

impl HeuristicProfileModel {
    pub fn new(embedding_dims: usize) -> Self {
        Self {
            payloads: RwLock::new(HashMap::new()),
            embedding_dims: embedding_dims.max(1),
        }
    }

    pub fn set_profile(&self, user: &str, payload: serde_json::Value) {
        let mut payloads = self.payloads.write().expect("payload lock poisoned");
        payloads.insert(user.to_string(), payload);
    }

    fn string_field(payload: &serde_json::Value, field: &str) -> Option<String> {
        payload
            .get(field)
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn string_list(payload: &serde_json::Value, field: &str) -> Vec<String> {
        payload
            .get(field)
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str())
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl ProfileModel for HeuristicProfileModel {
    async fn profile_payload(
        &self,
        user: &str,
    ) -> Result<Option<serde_json::Value>, ProviderError> {
        let payloads = self.payloads.read().expect("payload lock poisoned");
        Ok(payloads.get(user).cloned())
    }

    async fn extract_characteristics(
        &self,
        payload: &serde_json::Value,
    ) -> Result<Characteristics, ProviderError> {
        Ok(Characteristics {
            income_bracket: Self::string_field(payload, "income_bracket"),
            age_group: Self::string_field(payload, "age_group"),
            location: Self::string_field(payload, "location"),
            goals: Self::string_list(payload, "goals"),
            risk_tolerance: Self::string_field(payload, "risk_tolerance"),
            interests: Self::string_list(payload, "interests"),
        })
    }

    async fn embed(&self, payload: &serde_json::Value) -> Result<Vec<f32>, ProviderError> {
        let mut buckets = vec![0f32; self.embedding_dims];
        let text = payload.to_string().to_lowercase();
        for token in text.split(|c: char| !c.is_alphanumeric()).filter(|t| !t.is_empty()) {
            let mut acc: u64 = 1469598103934665603;
            for byte in token.bytes() {
                acc ^= byte as u64;
                acc = acc.wrapping_mul(1099511628211);
            }
            buckets[(acc % self.embedding_dims as u64) as usize] += 1.0;
        }
        let norm = buckets.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut buckets {
                *value /= norm;
            }
        }
        Ok(buckets)
    }
}
