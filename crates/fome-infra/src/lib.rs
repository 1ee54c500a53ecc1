//! Per-source health plumbing for FOME: circuit breakers, token-bucket rate
//! limiting, throttled HTTP fetching, and the TTL cache layer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use fome_core::{MatchResult, OpportunityRecord};
use moka::sync::Cache;
use moka::Expiry;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "fome-infra";

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker open.
    pub failure_threshold: u32,
    /// How long the breaker stays open before permitting one trial call.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    last_failure_at: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
}

/// Per-source health gate. One instance per source; reads are concurrent,
/// writes are serialized by the inner mutex. Transitions are logged, never
/// surfaced as caller errors.
#[derive(Debug)]
pub struct CircuitBreaker {
    source_id: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(source_id: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            source_id: source_id.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
                last_failure_at: None,
            }),
        }
    }

    /// Whether a call to this source may be dispatched right now. In the
    /// half-open state exactly one trial call is permitted.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let cooled_down = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.cooldown)
                    .unwrap_or(true);
                if cooled_down {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    debug!(source_id = %self.source_id, "breaker half-open, permitting trial call");
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if inner.state != BreakerState::Closed {
            debug!(source_id = %self.source_id, "breaker closed after successful call");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.last_failure_at = Some(Instant::now());
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    warn!(
                        source_id = %self.source_id,
                        failures = inner.consecutive_failures,
                        "breaker opened"
                    );
                }
            }
            BreakerState::HalfOpen => {
                // Trial call failed; reopen and restart the cooldown clock.
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_in_flight = false;
                inner.consecutive_failures += 1;
                warn!(source_id = %self.source_id, "breaker reopened after failed trial call");
            }
            BreakerState::Open => {
                // A late-settling abandoned call; nothing to transition.
                inner.consecutive_failures += 1;
            }
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().expect("breaker lock poisoned");
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
        }
    }
}

// ---------------------------------------------------------------------------
// Token-bucket rate limiter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub capacity: u32,
    /// Interval at which one token is restored.
    pub refill_every: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            refill_every: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct BucketState {
    tokens: u32,
    last_refill: Instant,
}

/// Non-blocking per-source token bucket. A denied acquisition means the
/// source sits out the current aggregation cycle; there is no retry or wait.
#[derive(Debug)]
pub struct TokenBucketLimiter {
    config: RateLimitConfig,
    state: Mutex<BucketState>,
}

impl TokenBucketLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BucketState {
                tokens: config.capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().expect("limiter lock poisoned");
        let elapsed = state.last_refill.elapsed();
        if self.config.refill_every.as_millis() > 0 && elapsed >= self.config.refill_every {
            let refills = (elapsed.as_millis() / self.config.refill_every.as_millis()) as u32;
            state.tokens = state.tokens.saturating_add(refills).min(self.config.capacity);
            state.last_refill = Instant::now();
        }
        if state.tokens > 0 {
            state.tokens -= 1;
            true
        } else {
            false
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP fetching
// ---------------------------------------------------------------------------

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

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Connector-facing policy: connectors never retry, the aggregation
    /// cycle owns retry cadence.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Shared outbound HTTP client with global + per-source concurrency caps and
/// optional exponential backoff on transient failures.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().expect("fetcher lock poisoned");
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        self.execute(run_id, source_id, url, None, None).await
    }

    /// POST a JSON body, optionally with a bearer token. Used by the
    /// inference client; shares the same throttle and backoff plumbing.
    pub async fn post_json(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        bearer: Option<&str>,
        body: &serde_json::Value,
    ) -> Result<FetchedResponse, FetchError> {
        self.execute(run_id, source_id, url, bearer, Some(body)).await
    }

    async fn execute(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        bearer: Option<&str>,
        body: Option<&serde_json::Value>,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_source = self.per_source_semaphore(source_id);
        let _source = per_source.acquire().await.expect("semaphore not closed");

        let span = info_span!("http_call", %run_id, source_id, url);
        async {
            let mut last_request_error: Option<reqwest::Error> = None;

            for attempt in 0..=self.backoff.max_retries {
                let mut request = match body {
                    Some(json) => self.client.post(url).json(json),
                    None => self.client.get(url),
                };
                if let Some(token) = bearer {
                    request = request.bearer_auth(token);
                }

                match request.send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        let final_url = resp.url().to_string();
                        if status.is_success() {
                            let body = resp.bytes().await?.to_vec();
                            return Ok(FetchedResponse {
                                status,
                                final_url,
                                body,
                            });
                        }
                        if classify_status(status) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }
                        return Err(FetchError::HttpStatus {
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
                        return Err(FetchError::Request(err));
                    }
                }
            }

            Err(FetchError::Request(
                last_request_error.expect("retry loop should capture a request error"),
            ))
        }
        .instrument(span)
        .await
    }
}

// ---------------------------------------------------------------------------
// Cache layer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct CachedRecord {
    record: OpportunityRecord,
    ttl: Duration,
}

#[derive(Debug, Clone)]
struct CachedIndex {
    fingerprints: Vec<Uuid>,
    ttl: Duration,
}

struct RecordExpiry;

impl Expiry<Uuid, CachedRecord> for RecordExpiry {
    fn expire_after_create(
        &self,
        _key: &Uuid,
        value: &CachedRecord,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

struct IndexExpiry;

impl Expiry<String, CachedIndex> for IndexExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedIndex,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub max_records: u64,
    pub max_scores: u64,
    /// TTL for cached match results; record TTLs come from the source
    /// registry, per source.
    pub score_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_records: 10_000,
            max_scores: 50_000,
            score_ttl: Duration::from_secs(3600),
        }
    }
}

/// Two-point cache: canonical records after normalization/dedup (per-source
/// TTL) and match results after scoring (fixed TTL). Writes are atomic per
/// key; reads may be slightly stale, never torn.
pub struct EngineCache {
    records: Cache<Uuid, CachedRecord>,
    source_index: Cache<String, CachedIndex>,
    scores: Cache<(Uuid, Uuid), MatchResult>,
}

impl EngineCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            records: Cache::builder()
                .max_capacity(config.max_records)
                .expire_after(RecordExpiry)
                .build(),
            source_index: Cache::builder()
                .max_capacity(1024)
                .expire_after(IndexExpiry)
                .build(),
            scores: Cache::builder()
                .max_capacity(config.max_scores)
                .time_to_live(config.score_ttl)
                .build(),
        }
    }

    pub fn get_record(&self, fingerprint: &Uuid) -> Option<OpportunityRecord> {
        self.records.get(fingerprint).map(|c| c.record)
    }

    pub fn put_record(&self, record: OpportunityRecord, ttl: Duration) {
        self.records
            .insert(record.fingerprint, CachedRecord { record, ttl });
    }

    /// A present index entry means the source was fetched within its TTL and
    /// its cached records may stand in for a network call.
    pub fn source_is_fresh(&self, source_id: &str) -> bool {
        self.source_index.contains_key(source_id)
    }

    pub fn put_source_index(&self, source_id: &str, fingerprints: Vec<Uuid>, ttl: Duration) {
        self.source_index
            .insert(source_id.to_string(), CachedIndex { fingerprints, ttl });
    }

    pub fn cached_source_records(&self, source_id: &str) -> Vec<OpportunityRecord> {
        let Some(index) = self.source_index.get(source_id) else {
            return Vec::new();
        };
        index
            .fingerprints
            .iter()
            .filter_map(|fp| self.get_record(fp))
            .collect()
    }

    /// Scores are keyed by (profile fingerprint, record content fingerprint),
    /// so a changed profile or a re-fetched record with changed content
    /// misses the cache immediately; the superseded entry ages out by TTL.
    pub fn get_score(&self, profile_fp: Uuid, content_fp: Uuid) -> Option<MatchResult> {
        self.scores.get(&(profile_fp, content_fp))
    }

    pub fn put_score(&self, profile_fp: Uuid, content_fp: Uuid, result: MatchResult) {
        self.scores.insert((profile_fp, content_fp), result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fome_core::{AmountRange, ScoringPath};
    use serde_json::Map;

    fn breaker(threshold: u32, cooldown_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test-source",
            BreakerConfig {
                failure_threshold: threshold,
                cooldown: Duration::from_millis(cooldown_ms),
            },
        )
    }

    #[test]
    fn breaker_opens_at_threshold_and_blocks() {
        let b = breaker(3, 10_000);
        for _ in 0..2 {
            b.record_failure();
            assert!(b.allow());
        }
        b.record_failure();
        assert_eq!(b.snapshot().state, BreakerState::Open);
        assert!(!b.allow());
    }

    #[test]
    fn breaker_half_open_permits_one_trial_then_closes_on_success() {
        let b = breaker(1, 20);
        b.record_failure();
        assert!(!b.allow());

        std::thread::sleep(Duration::from_millis(30));
        assert!(b.allow(), "cooldown elapsed, trial permitted");
        assert!(!b.allow(), "only one trial call in half-open");

        b.record_success();
        assert_eq!(b.snapshot().state, BreakerState::Closed);
        assert_eq!(b.snapshot().consecutive_failures, 0);
        assert!(b.allow());
    }

    #[test]
    fn breaker_failed_trial_restarts_cooldown() {
        let b = breaker(1, 30);
        b.record_failure();
        std::thread::sleep(Duration::from_millis(40));
        assert!(b.allow());
        b.record_failure();
        assert_eq!(b.snapshot().state, BreakerState::Open);
        assert!(!b.allow(), "cooldown clock restarted");
    }

    #[test]
    fn limiter_denies_when_empty_and_refills() {
        let limiter = TokenBucketLimiter::new(RateLimitConfig {
            capacity: 2,
            refill_every: Duration::from_millis(20),
        });
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter.try_acquire());
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    fn record(title: &str) -> OpportunityRecord {
        OpportunityRecord {
            fingerprint: fome_core::fingerprint(title, "Example Fund", None),
            title: title.to_string(),
            funder: "Example Fund".into(),
            description: None,
            amount: AmountRange::default(),
            deadline: None,
            eligibility: None,
            geo_scope: None,
            url: None,
            provenance: vec!["registry".into()],
            last_observed: Utc::now(),
            review_required: false,
            dedup_confidence: None,
            extra: Map::new(),
        }
    }

    #[test]
    fn record_cache_honors_per_entry_ttl() {
        let cache = EngineCache::new(CacheConfig::default());
        let fast = record("fast");
        let slow = record("slow");
        let fast_fp = fast.fingerprint;
        let slow_fp = slow.fingerprint;

        cache.put_record(fast, Duration::from_millis(20));
        cache.put_record(slow, Duration::from_secs(60));

        assert!(cache.get_record(&fast_fp).is_some());
        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.get_record(&fast_fp).is_none(), "short TTL expired");
        assert!(cache.get_record(&slow_fp).is_some(), "long TTL still live");
    }

    #[test]
    fn source_index_freshness_expires() {
        let cache = EngineCache::new(CacheConfig::default());
        let rec = record("indexed");
        let fp = rec.fingerprint;
        cache.put_record(rec, Duration::from_secs(60));
        cache.put_source_index("registry", vec![fp], Duration::from_millis(20));

        assert!(cache.source_is_fresh("registry"));
        assert_eq!(cache.cached_source_records("registry").len(), 1);
        std::thread::sleep(Duration::from_millis(40));
        assert!(!cache.source_is_fresh("registry"));
        assert!(cache.cached_source_records("registry").is_empty());
    }

    #[test]
    fn score_cache_keys_on_profile_and_record_content() {
        let cache = EngineCache::new(CacheConfig::default());
        let profile_fp = Uuid::new_v4();
        let rec = record("keyed");
        let content_fp = rec.content_fingerprint();
        let result = MatchResult {
            opportunity_fingerprint: rec.fingerprint,
            score: 4.2,
            confidence: 0.75,
            alignment_reasons: vec!["focus overlap".into()],
            risk_reasons: vec![],
            scoring_path: ScoringPath::HeuristicOnly,
            low_confidence: false,
        };
        cache.put_score(profile_fp, content_fp, result.clone());
        assert_eq!(cache.get_score(profile_fp, content_fp), Some(result.clone()));
        assert_eq!(cache.get_score(Uuid::new_v4(), content_fp), None);

        // Same opportunity, changed content: must not see the stale score.
        let mut changed = rec.clone();
        changed.amount = AmountRange {
            min: Some(1_000.0),
            max: Some(2_000.0),
        };
        assert_eq!(changed.fingerprint, rec.fingerprint);
        assert_eq!(cache.get_score(profile_fp, changed.content_fingerprint()), None);
    }
}
