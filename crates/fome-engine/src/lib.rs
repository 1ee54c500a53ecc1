//! The FOME matching engine: concurrent source aggregation under a deadline,
//! fingerprint-based deduplication, two-stage match scoring, and ranking.
//!
//! Data flows one direction: connectors -> orchestrator -> dedup -> scoring
//! -> ranking. The cache layer is consulted after normalization (canonical
//! records, per-source TTL) and after scoring (match results, fixed TTL), so
//! a repeated query inside the TTL window skips both network and inference.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use fome_connectors::{connector_for, FetchContext, SourceConnector, SourceQuery};
use fome_core::{
    AmountRange, MatchQuery, MatchResult, OpportunityRecord, OrgProfile, RawOpportunity,
    ScoringPath, SourceHealth, SourceKind, SourceReport,
};
use fome_infra::{
    BackoffPolicy, BreakerConfig, BreakerState, CacheConfig, CircuitBreaker, EngineCache,
    HttpClientConfig, HttpFetcher, RateLimitConfig, TokenBucketLimiter,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use strsim::jaro_winkler;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "fome-engine";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Hard bound on one aggregation fan-out, regardless of source count.
    pub aggregate_deadline: Duration,
    /// Per-connector-call timeout inside the fan-out.
    pub per_call_timeout: Duration,
    pub scoring: ScoringConfig,
    pub cache: CacheConfig,
    pub reports_dir: PathBuf,
    pub sources_path: PathBuf,
    pub scheduler_enabled: bool,
    pub refresh_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub inference: Option<InferenceSettings>,
}

#[derive(Debug, Clone)]
pub struct InferenceSettings {
    pub base_url: String,
    pub api_key: String,
    pub light_model: String,
    pub strong_model: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            aggregate_deadline: Duration::from_secs(8),
            per_call_timeout: Duration::from_secs(6),
            scoring: ScoringConfig::default(),
            cache: CacheConfig::default(),
            reports_dir: PathBuf::from("./reports"),
            sources_path: PathBuf::from("sources.yaml"),
            scheduler_enabled: false,
            refresh_cron: "0 */30 * * * *".to_string(),
            user_agent: "fome-bot/0.1".to_string(),
            http_timeout_secs: 20,
            inference: None,
        }
    }
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let scoring = ScoringConfig {
            ambiguous_band: (
                env_f64("FOME_AMBIGUOUS_LOW", 2.5),
                env_f64("FOME_AMBIGUOUS_HIGH", 4.0),
            ),
            high_value_threshold: env_f64("FOME_HIGH_VALUE_THRESHOLD", 100_000.0),
            confidence_floor: env_f64("FOME_CONFIDENCE_FLOOR", 0.5),
            strong_input_chars: env_u64("FOME_STRONG_INPUT_CHARS", 1200) as usize,
        };
        let inference = std::env::var("FOME_INFERENCE_URL").ok().map(|base_url| {
            InferenceSettings {
                base_url,
                api_key: std::env::var("FOME_INFERENCE_API_KEY").unwrap_or_default(),
                light_model: std::env::var("FOME_INFERENCE_LIGHT_MODEL")
                    .unwrap_or_else(|_| "fome-light".to_string()),
                strong_model: std::env::var("FOME_INFERENCE_STRONG_MODEL")
                    .unwrap_or_else(|_| "fome-strong".to_string()),
            }
        });
        Self {
            aggregate_deadline: Duration::from_millis(env_u64("FOME_AGGREGATE_DEADLINE_MS", 8_000)),
            per_call_timeout: Duration::from_millis(env_u64("FOME_PER_CALL_TIMEOUT_MS", 6_000)),
            scoring,
            cache: CacheConfig {
                score_ttl: Duration::from_secs(env_u64("FOME_SCORE_TTL_SECS", 3600)),
                ..CacheConfig::default()
            },
            reports_dir: std::env::var("FOME_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.reports_dir),
            sources_path: std::env::var("FOME_SOURCES_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.sources_path),
            scheduler_enabled: std::env::var("FOME_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            refresh_cron: std::env::var("FOME_REFRESH_CRON").unwrap_or(defaults.refresh_cron),
            user_agent: std::env::var("FOME_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_u64("FOME_HTTP_TIMEOUT_SECS", 20),
            inference,
        }
    }
}

// ---------------------------------------------------------------------------
// Source registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceSpec {
    pub source_id: String,
    pub display_name: String,
    pub kind: SourceKind,
    pub enabled: bool,
    /// Higher values win field conflicts during merge (government registries
    /// above scraped pages and feeds).
    pub priority: u8,
    pub endpoint: String,
    /// Freshness window for this source's cached records.
    pub ttl_secs: u64,
    #[serde(default)]
    pub rate: RateSpec,
    #[serde(default)]
    pub breaker: BreakerSpec,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RateSpec {
    pub capacity: u32,
    pub refill_ms: u64,
}

impl Default for RateSpec {
    fn default() -> Self {
        Self {
            capacity: 10,
            refill_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BreakerSpec {
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
}

impl Default for BreakerSpec {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 60,
        }
    }
}

pub async fn load_source_registry(path: &PathBuf) -> Result<SourceRegistry> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// One configured source with its private breaker and limiter. The breaker
/// and limiter are the only mutable state shared across concurrent calls for
/// a source; both serialize their own updates.
pub struct SourceHandle {
    pub spec: SourceSpec,
    connector: Box<dyn SourceConnector>,
    breaker: CircuitBreaker,
    limiter: TokenBucketLimiter,
}

impl SourceHandle {
    pub fn from_spec(spec: SourceSpec) -> Self {
        let connector = connector_for(&spec.source_id, spec.kind, &spec.endpoint);
        Self::with_connector(spec, connector)
    }

    pub fn with_connector(spec: SourceSpec, connector: Box<dyn SourceConnector>) -> Self {
        let breaker = CircuitBreaker::new(
            spec.source_id.clone(),
            BreakerConfig {
                failure_threshold: spec.breaker.failure_threshold,
                cooldown: Duration::from_secs(spec.breaker.cooldown_secs),
            },
        );
        let limiter = TokenBucketLimiter::new(RateLimitConfig {
            capacity: spec.rate.capacity,
            refill_every: Duration::from_millis(spec.rate.refill_ms),
        });
        Self {
            spec,
            connector,
            breaker,
            limiter,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.spec.ttl_secs)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum EngineError {
    /// The only condition surfaced to the caller as a hard error; everything
    /// else degrades the result instead.
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub fn validate_query(query: &MatchQuery) -> Result<(), EngineError> {
    if query.profile.mission.trim().is_empty() {
        return Err(EngineError::InvalidQuery("profile mission is required".into()));
    }
    if let Some(per_page) = query.per_page {
        if per_page == 0 || per_page > 100 {
            return Err(EngineError::InvalidQuery("per_page must be 1..=100".into()));
        }
    }
    if let Some(page) = query.page {
        if page == 0 {
            return Err(EngineError::InvalidQuery("page starts at 1".into()));
        }
    }
    if let Some(min_score) = query.min_score {
        if !(1.0..=5.0).contains(&min_score) {
            return Err(EngineError::InvalidQuery("min_score must be 1.0..=5.0".into()));
        }
    }
    if let Some(budget) = query.profile.annual_budget {
        if budget < 0.0 {
            return Err(EngineError::InvalidQuery("annual_budget must be non-negative".into()));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Aggregation orchestrator
// ---------------------------------------------------------------------------

/// Input to the merge fold: either a freshly fetched raw record or a cached
/// canonical record re-entering the reducer. Merging is commutative, so the
/// two mix freely.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeCandidate {
    pub fingerprint: Uuid,
    pub title: String,
    pub funder: String,
    pub description: Option<String>,
    pub amount: AmountRange,
    pub deadline: Option<NaiveDate>,
    pub eligibility: Option<String>,
    pub geo_scope: Option<String>,
    pub url: Option<String>,
    pub provenance: Vec<String>,
    pub priority: u8,
    pub observed_at: DateTime<Utc>,
    pub extra: Map<String, JsonValue>,
}

impl MergeCandidate {
    pub fn from_raw(raw: RawOpportunity, priority: u8) -> Self {
        let fingerprint = raw.fingerprint();
        Self {
            fingerprint,
            title: raw.title,
            funder: raw.funder,
            description: raw.description,
            amount: raw.amount,
            deadline: raw.deadline,
            eligibility: raw.eligibility,
            geo_scope: raw.geo_scope,
            url: raw.url,
            provenance: vec![raw.source_id],
            priority,
            observed_at: raw.observed_at,
            extra: raw.extra,
        }
    }

    pub fn from_cached(record: OpportunityRecord, priority: u8) -> Self {
        Self {
            fingerprint: record.fingerprint,
            title: record.title,
            funder: record.funder,
            description: record.description,
            amount: record.amount,
            deadline: record.deadline,
            eligibility: record.eligibility,
            geo_scope: record.geo_scope,
            url: record.url,
            provenance: record.provenance,
            priority,
            observed_at: record.last_observed,
            extra: record.extra,
        }
    }
}

#[derive(Debug)]
pub struct AggregateOutcome {
    pub candidates: Vec<MergeCandidate>,
    pub reports: Vec<SourceReport>,
    /// Sources fetched over the network this cycle (cache misses), eligible
    /// for a cache index refresh after merge.
    pub fetched_sources: Vec<String>,
}

impl AggregateOutcome {
    pub fn degraded(&self) -> bool {
        self.reports
            .iter()
            .any(|r| r.health != SourceHealth::Healthy)
    }
}

pub struct Orchestrator {
    sources: Vec<Arc<SourceHandle>>,
    http: Arc<HttpFetcher>,
    cache: Arc<EngineCache>,
    per_call_timeout: Duration,
}

enum FetchTaskOutcome {
    Fetched(Vec<RawOpportunity>),
    Failed(String),
}

impl Orchestrator {
    pub fn new(
        sources: Vec<Arc<SourceHandle>>,
        http: Arc<HttpFetcher>,
        cache: Arc<EngineCache>,
        per_call_timeout: Duration,
    ) -> Self {
        Self {
            sources,
            http,
            cache,
            per_call_timeout,
        }
    }

    pub fn sources(&self) -> &[Arc<SourceHandle>] {
        &self.sources
    }

    /// Fan out to every admissible source and collect what completes before
    /// the deadline. Calls still in flight when the deadline fires are
    /// abandoned: their records are discarded, but the spawned task settles
    /// its source's breaker whenever it eventually resolves.
    pub async fn aggregate(&self, query: &SourceQuery, deadline: Duration) -> AggregateOutcome {
        let run_id = Uuid::new_v4();
        let mut candidates = Vec::new();
        let mut reports: Vec<Option<SourceReport>> = vec![None; self.sources.len()];
        let mut fetched_sources = Vec::new();
        let mut set: JoinSet<(usize, FetchTaskOutcome)> = JoinSet::new();

        for (idx, handle) in self.sources.iter().enumerate() {
            let source_id = handle.spec.source_id.clone();
            if !handle.spec.enabled {
                reports[idx] = Some(SourceReport {
                    source_id,
                    health: SourceHealth::Unavailable,
                    records: 0,
                    detail: Some("disabled".into()),
                });
                continue;
            }

            if self.cache.source_is_fresh(&source_id) {
                let cached = self.cache.cached_source_records(&source_id);
                let count = cached.len();
                candidates.extend(
                    cached
                        .into_iter()
                        .map(|r| MergeCandidate::from_cached(r, handle.spec.priority)),
                );
                reports[idx] = Some(SourceReport {
                    source_id,
                    health: SourceHealth::Healthy,
                    records: count,
                    detail: Some("served from cache".into()),
                });
                continue;
            }

            if !handle.breaker.allow() {
                reports[idx] = Some(SourceReport {
                    source_id,
                    health: SourceHealth::Unavailable,
                    records: 0,
                    detail: Some("breaker open".into()),
                });
                continue;
            }
            if !handle.limiter.try_acquire() {
                reports[idx] = Some(SourceReport {
                    source_id,
                    health: SourceHealth::Degraded,
                    records: 0,
                    detail: Some("rate limited".into()),
                });
                continue;
            }

            let handle = Arc::clone(handle);
            let http = Arc::clone(&self.http);
            let query = query.clone();
            let per_call_timeout = self.per_call_timeout;
            set.spawn(async move {
                let ctx = FetchContext {
                    run_id,
                    observed_at: Utc::now(),
                };
                let outcome = match tokio::time::timeout(
                    per_call_timeout,
                    handle.connector.fetch(&http, &ctx, &query),
                )
                .await
                {
                    Ok(Ok(records)) => {
                        handle.breaker.record_success();
                        FetchTaskOutcome::Fetched(records)
                    }
                    Ok(Err(err)) => {
                        handle.breaker.record_failure();
                        FetchTaskOutcome::Failed(err.to_string())
                    }
                    Err(_) => {
                        handle.breaker.record_failure();
                        FetchTaskOutcome::Failed("per-call timeout".into())
                    }
                };
                (idx, outcome)
            });
        }

        let deadline_at = tokio::time::Instant::now() + deadline;
        while !set.is_empty() {
            match tokio::time::timeout_at(deadline_at, set.join_next()).await {
                Ok(Some(Ok((idx, outcome)))) => {
                    let handle = &self.sources[idx];
                    let source_id = handle.spec.source_id.clone();
                    match outcome {
                        FetchTaskOutcome::Fetched(records) => {
                            debug!(source_id = %source_id, records = records.len(), "source fetched");
                            reports[idx] = Some(SourceReport {
                                source_id: source_id.clone(),
                                health: SourceHealth::Healthy,
                                records: records.len(),
                                detail: None,
                            });
                            fetched_sources.push(source_id);
                            candidates.extend(
                                records
                                    .into_iter()
                                    .map(|r| MergeCandidate::from_raw(r, handle.spec.priority)),
                            );
                        }
                        FetchTaskOutcome::Failed(detail) => {
                            reports[idx] = Some(SourceReport {
                                source_id,
                                health: SourceHealth::Unavailable,
                                records: 0,
                                detail: Some(detail),
                            });
                        }
                    }
                }
                Ok(Some(Err(join_err))) => {
                    warn!(error = %join_err, "fetch task aborted");
                }
                Ok(None) => break,
                Err(_) => {
                    // Deadline elapsed: abandon what is still pending. The
                    // detached tasks settle their breakers on resolve; their
                    // records are not awaited.
                    set.detach_all();
                    break;
                }
            }
        }

        let reports = reports
            .into_iter()
            .enumerate()
            .map(|(idx, report)| {
                report.unwrap_or_else(|| SourceReport {
                    source_id: self.sources[idx].spec.source_id.clone(),
                    health: SourceHealth::Unavailable,
                    records: 0,
                    detail: Some("aggregation deadline elapsed".into()),
                })
            })
            .collect();

        AggregateOutcome {
            candidates,
            reports,
            fetched_sources,
        }
    }
}

// ---------------------------------------------------------------------------
// Deduplication engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct DedupConfig {
    /// Jaro-Winkler similarity at which two records with *different*
    /// fingerprints get flagged for review. They are never auto-merged.
    pub review_threshold: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            review_threshold: 0.93,
        }
    }
}

pub struct DedupEngine {
    config: DedupConfig,
}

impl DedupEngine {
    pub fn new(config: DedupConfig) -> Self {
        Self { config }
    }

    /// Collapse candidates into canonical records. Output is sorted by
    /// fingerprint and independent of arrival order, so re-merging the same
    /// set yields a byte-identical result.
    pub fn merge(&self, candidates: Vec<MergeCandidate>) -> Vec<OpportunityRecord> {
        let mut groups: BTreeMap<Uuid, Vec<MergeCandidate>> = BTreeMap::new();
        for candidate in candidates {
            groups.entry(candidate.fingerprint).or_default().push(candidate);
        }

        let mut records: Vec<OpportunityRecord> = groups
            .into_iter()
            .map(|(fingerprint, group)| merge_group(fingerprint, group))
            .collect();

        self.flag_near_duplicates(&mut records);
        records
    }

    fn flag_near_duplicates(&self, records: &mut [OpportunityRecord]) {
        for i in 0..records.len() {
            for j in (i + 1)..records.len() {
                let score = jaro_winkler(
                    &fome_core::normalize_text(&records[i].title),
                    &fome_core::normalize_text(&records[j].title),
                );
                if score >= self.config.review_threshold {
                    for idx in [i, j] {
                        records[idx].review_required = true;
                        let current = records[idx].dedup_confidence.unwrap_or(0.0);
                        records[idx].dedup_confidence = Some(current.max(score));
                    }
                }
            }
        }
    }
}

fn merge_group(fingerprint: Uuid, mut group: Vec<MergeCandidate>) -> OpportunityRecord {
    // Deterministic fold order: trust first, then stable source key, then
    // recency. Arrival order never matters.
    group.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.provenance.cmp(&b.provenance))
            .then_with(|| b.observed_at.cmp(&a.observed_at))
    });

    let provenance: Vec<String> = group
        .iter()
        .flat_map(|c| c.provenance.iter().cloned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let last_observed = group
        .iter()
        .map(|c| c.observed_at)
        .max()
        .expect("merge group is never empty");

    // Higher-priority entries overwrite raw-bag keys last.
    let mut extra = Map::new();
    for candidate in group.iter().rev() {
        for (k, v) in &candidate.extra {
            extra.insert(k.clone(), v.clone());
        }
    }

    let best = &group[0];
    OpportunityRecord {
        fingerprint,
        title: best.title.clone(),
        funder: best.funder.clone(),
        description: pick_text(&group, |c| c.description.as_deref()),
        amount: pick_amount(&group),
        deadline: group.iter().find_map(|c| c.deadline),
        eligibility: pick_text(&group, |c| c.eligibility.as_deref()),
        geo_scope: pick_text(&group, |c| c.geo_scope.as_deref()),
        url: pick_text(&group, |c| c.url.as_deref()),
        provenance,
        last_observed,
        review_required: false,
        dedup_confidence: None,
        extra,
    }
}

/// Highest-trust tier with a value wins; within the tier, the most complete
/// (longest) value wins.
fn pick_text<F>(group: &[MergeCandidate], accessor: F) -> Option<String>
where
    F: Fn(&MergeCandidate) -> Option<&str>,
{
    let best_priority = group
        .iter()
        .filter(|c| accessor(c).is_some())
        .map(|c| c.priority)
        .max()?;
    group
        .iter()
        .filter(|c| c.priority == best_priority)
        .filter_map(|c| accessor(c))
        .max_by_key(|s| s.len())
        .map(ToString::to_string)
}

fn pick_amount(group: &[MergeCandidate]) -> AmountRange {
    let Some(best_priority) = group
        .iter()
        .filter(|c| !c.amount.is_empty())
        .map(|c| c.priority)
        .max()
    else {
        return AmountRange::default();
    };
    group
        .iter()
        .filter(|c| c.priority == best_priority && !c.amount.is_empty())
        .max_by_key(|c| c.amount.completeness())
        .map(|c| c.amount)
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Scoring engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct ScoringConfig {
    /// Inclusive stage-1 score band that routes a pair to stage 2.
    pub ambiguous_band: (f64, f64),
    /// Opportunities at or above this amount always get a stage-2 look.
    pub high_value_threshold: f64,
    /// Results below this confidence are flagged low-confidence.
    pub confidence_floor: f64,
    /// Prompt length at which the strong inference variant takes over.
    pub strong_input_chars: usize,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            ambiguous_band: (2.5, 4.0),
            high_value_threshold: 100_000.0,
            confidence_floor: 0.5,
            strong_input_chars: 1200,
        }
    }
}

/// Fixed factor weights, summing to 1.0. Factors with no input data are
/// excluded and the remaining weights renormalized.
#[derive(Debug, Clone, Copy)]
pub struct ScoringWeights {
    pub mission: f64,
    pub geographic: f64,
    pub budget: f64,
    pub eligibility: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            mission: 0.35,
            geographic: 0.25,
            budget: 0.20,
            eligibility: 0.20,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StageOneOutcome {
    pub score: f64,
    pub confidence: f64,
    pub alignment_reasons: Vec<String>,
    pub risk_reasons: Vec<String>,
    pub factors_present: usize,
}

fn significant_tokens(text: &str) -> BTreeSet<String> {
    fome_core::normalize_text(text)
        .split_whitespace()
        .filter(|t| t.len() > 3)
        .map(ToString::to_string)
        .collect()
}

fn mission_factor(
    profile: &OrgProfile,
    record: &OpportunityRecord,
) -> (Option<f64>, Vec<String>, Vec<String>) {
    if record.description.is_none() && record.eligibility.is_none() {
        return (None, Vec::new(), Vec::new());
    }
    let mut profile_text = profile.mission.clone();
    for area in &profile.focus_areas {
        profile_text.push(' ');
        profile_text.push_str(area);
    }
    let mut record_text = record.title.clone();
    if let Some(desc) = &record.description {
        record_text.push(' ');
        record_text.push_str(desc);
    }
    if let Some(elig) = &record.eligibility {
        record_text.push(' ');
        record_text.push_str(elig);
    }

    let profile_tokens = significant_tokens(&profile_text);
    let record_tokens = significant_tokens(&record_text);
    let shared: Vec<&String> = profile_tokens.intersection(&record_tokens).collect();
    let ratio = shared.len() as f64 / profile_tokens.len().max(1) as f64;
    // Covering half the profile vocabulary maxes the factor out.
    let score = (ratio * 10.0).min(5.0);

    if shared.is_empty() {
        (
            Some(score),
            Vec::new(),
            vec!["no mission or focus-area overlap".to_string()],
        )
    } else {
        let mut terms: Vec<String> = shared.iter().take(4).map(|s| s.to_string()).collect();
        terms.sort();
        (
            Some(score),
            vec![format!("mission overlap on: {}", terms.join(", "))],
            Vec::new(),
        )
    }
}

const NATIONAL_SCOPES: &[&str] = &["national", "nationwide", "global", "any", "all states"];

fn geographic_factor(
    profile: &OrgProfile,
    record: &OpportunityRecord,
) -> (Option<f64>, Vec<String>, Vec<String>) {
    let (Some(scope), Some(area)) = (&record.geo_scope, &profile.geo_area) else {
        return (None, Vec::new(), Vec::new());
    };
    let scope_norm = fome_core::normalize_text(scope);
    if NATIONAL_SCOPES.iter().any(|s| scope_norm.contains(s)) {
        return (
            Some(5.0),
            vec![format!("open geographic scope ({scope})")],
            Vec::new(),
        );
    }
    let area_tokens = significant_tokens(area);
    let scope_tokens = significant_tokens(scope);
    if area_tokens.intersection(&scope_tokens).next().is_some() {
        (
            Some(5.0),
            vec![format!("geographic scope matches {area}")],
            Vec::new(),
        )
    } else {
        (
            Some(0.0),
            Vec::new(),
            vec![format!("outside geographic scope ({scope})")],
        )
    }
}

fn budget_factor(
    profile: &OrgProfile,
    record: &OpportunityRecord,
) -> (Option<f64>, Vec<String>, Vec<String>) {
    let (Some(budget), Some(target)) = (
        profile.annual_budget,
        record.amount.max.or(record.amount.min),
    ) else {
        return (None, Vec::new(), Vec::new());
    };
    if budget <= 0.0 {
        return (None, Vec::new(), Vec::new());
    }
    let ratio = target / budget;
    if ratio > 1.0 {
        (
            Some(1.0),
            Vec::new(),
            vec!["award exceeds annual budget capacity".to_string()],
        )
    } else if ratio >= 0.01 && ratio <= 0.5 {
        (
            Some(5.0),
            vec!["award size fits organizational capacity".to_string()],
            Vec::new(),
        )
    } else if ratio > 0.5 {
        (
            Some(3.0),
            Vec::new(),
            vec!["award is large relative to annual budget".to_string()],
        )
    } else {
        (Some(2.0), Vec::new(), Vec::new())
    }
}

fn eligibility_factor(
    profile: &OrgProfile,
    record: &OpportunityRecord,
) -> (Option<f64>, Vec<String>, Vec<String>) {
    let Some(eligibility) = &record.eligibility else {
        return (None, Vec::new(), Vec::new());
    };
    let elig_tokens = significant_tokens(eligibility);
    let mut profile_text = profile.mission.clone();
    for area in &profile.focus_areas {
        profile_text.push(' ');
        profile_text.push_str(area);
    }
    if let Some(area) = &profile.geo_area {
        profile_text.push(' ');
        profile_text.push_str(area);
    }
    let profile_tokens = significant_tokens(&profile_text);
    if elig_tokens.intersection(&profile_tokens).next().is_some() {
        (
            Some(5.0),
            vec!["eligibility terms match profile".to_string()],
            Vec::new(),
        )
    } else {
        // No contradiction detected, but no positive signal either.
        (Some(2.5), Vec::new(), Vec::new())
    }
}

/// Deterministic stage-1 heuristics: a weighted sum of independent 0..=5
/// factors, renormalized over the factors that had input data. Confidence is
/// the fraction of factors with data; a pair with no usable inputs scores a
/// neutral 2.5 at confidence 0.
pub fn stage_one(
    profile: &OrgProfile,
    record: &OpportunityRecord,
    weights: &ScoringWeights,
) -> StageOneOutcome {
    let factors = [
        (weights.mission, mission_factor(profile, record)),
        (weights.geographic, geographic_factor(profile, record)),
        (weights.budget, budget_factor(profile, record)),
        (weights.eligibility, eligibility_factor(profile, record)),
    ];

    let mut weighted_sum = 0.0;
    let mut weight_total = 0.0;
    let mut present = 0usize;
    let mut alignment_reasons = Vec::new();
    let mut risk_reasons = Vec::new();

    for (weight, (score, mut alignment, mut risks)) in factors {
        if let Some(score) = score {
            weighted_sum += weight * score;
            weight_total += weight;
            present += 1;
        }
        alignment_reasons.append(&mut alignment);
        risk_reasons.append(&mut risks);
    }

    if profile
        .past_funders
        .iter()
        .any(|f| fome_core::normalize_text(f) == fome_core::normalize_text(&record.funder))
    {
        alignment_reasons.push(format!("previously funded by {}", record.funder));
    }

    let score = if weight_total > 0.0 {
        (weighted_sum / weight_total).clamp(1.0, 5.0)
    } else {
        2.5
    };
    StageOneOutcome {
        score,
        confidence: present as f64 / 4.0,
        alignment_reasons,
        risk_reasons,
        factors_present: present,
    }
}

/// Whether a stage-1 outcome warrants the expensive inference pass: ambiguous
/// band (inclusive) or high-value opportunity.
pub fn needs_stage_two(score: f64, record: &OpportunityRecord, config: &ScoringConfig) -> bool {
    let (low, high) = config.ambiguous_band;
    if score >= low && score <= high {
        return true;
    }
    record
        .amount
        .max
        .or(record.amount.min)
        .map(|amount| amount >= config.high_value_threshold)
        .unwrap_or(false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelVariant {
    Light,
    Strong,
}

/// Pure routing rule: cheap variant for short, low-stakes inputs; strong
/// variant when the prompt is long or the money is large.
pub fn route_model(prompt_chars: usize, record: &OpportunityRecord, config: &ScoringConfig) -> ModelVariant {
    let high_stakes = record
        .amount
        .max
        .or(record.amount.min)
        .map(|amount| amount >= config.high_value_threshold)
        .unwrap_or(false);
    if prompt_chars >= config.strong_input_chars || high_stakes {
        ModelVariant::Strong
    } else {
        ModelVariant::Light
    }
}

/// Structured request sent to the inference service. Factual fields only; no
/// free-form user documents.
#[derive(Debug, Clone, Serialize)]
pub struct AssessmentRequest {
    pub mission: String,
    pub focus_areas: Vec<String>,
    pub geo_area: Option<String>,
    pub annual_budget: Option<f64>,
    pub opportunity_title: String,
    pub funder: String,
    pub description: Option<String>,
    pub amount: AmountRange,
    pub deadline: Option<NaiveDate>,
    pub eligibility: Option<String>,
    pub geo_scope: Option<String>,
    pub stage_one_score: f64,
}

impl AssessmentRequest {
    pub fn new(profile: &OrgProfile, record: &OpportunityRecord, stage_one_score: f64) -> Self {
        Self {
            mission: profile.mission.clone(),
            focus_areas: profile.focus_areas.clone(),
            geo_area: profile.geo_area.clone(),
            annual_budget: profile.annual_budget,
            opportunity_title: record.title.clone(),
            funder: record.funder.clone(),
            description: record.description.clone(),
            amount: record.amount,
            deadline: record.deadline,
            eligibility: record.eligibility.clone(),
            geo_scope: record.geo_scope.clone(),
            stage_one_score,
        }
    }

    pub fn prompt_chars(&self) -> usize {
        serde_json::to_string(self).map(|s| s.len()).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssessmentResponse {
    pub score: f64,
    pub confidence: f64,
    #[serde(default)]
    pub alignment_reasons: Vec<String>,
    #[serde(default)]
    pub risk_reasons: Vec<String>,
}

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("transport: {0}")]
    Transport(#[from] fome_infra::FetchError),
    #[error("malformed inference response: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn assess(
        &self,
        request: &AssessmentRequest,
        variant: ModelVariant,
    ) -> Result<AssessmentResponse, InferenceError>;
}

const ASSESSMENT_PREAMBLE: &str = "You assess how well a funding opportunity fits a nonprofit \
organization. Reply with a single JSON object: {\"score\": 1.0-5.0, \"confidence\": 0.0-1.0, \
\"alignment_reasons\": [..], \"risk_reasons\": [..]}.";

/// Chat-completions inference client. One call per assessment, no streaming;
/// throttled through the shared fetcher plumbing under the "inference"
/// source id.
pub struct HttpInferenceClient {
    http: HttpFetcher,
    settings: InferenceSettings,
}

impl HttpInferenceClient {
    pub fn new(settings: InferenceSettings, timeout: Duration) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout,
            backoff: BackoffPolicy::default(),
            ..HttpClientConfig::default()
        })?;
        Ok(Self { http, settings })
    }

    fn model_for(&self, variant: ModelVariant) -> &str {
        match variant {
            ModelVariant::Light => &self.settings.light_model,
            ModelVariant::Strong => &self.settings.strong_model,
        }
    }
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    async fn assess(
        &self,
        request: &AssessmentRequest,
        variant: ModelVariant,
    ) -> Result<AssessmentResponse, InferenceError> {
        let payload = serde_json::json!({
            "model": self.model_for(variant),
            "messages": [
                {"role": "system", "content": ASSESSMENT_PREAMBLE},
                {"role": "user", "content": serde_json::to_string(request)
                    .map_err(|e| InferenceError::Malformed(e.to_string()))?},
            ],
            "temperature": 0.0,
        });
        let url = format!("{}/chat/completions", self.settings.base_url);
        let resp = self
            .http
            .post_json(
                Uuid::new_v4(),
                "inference",
                &url,
                Some(&self.settings.api_key),
                &payload,
            )
            .await?;

        let body: JsonValue = serde_json::from_slice(&resp.body)
            .map_err(|e| InferenceError::Malformed(e.to_string()))?;
        let content = body
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| InferenceError::Malformed("no content in response".into()))?;
        parse_assessment(content)
    }
}

/// Validate the structured stage-2 response; anything out of bounds counts
/// as a stage-2 failure and falls back to stage 1.
pub fn parse_assessment(content: &str) -> Result<AssessmentResponse, InferenceError> {
    let parsed: AssessmentResponse = serde_json::from_str(content.trim())
        .map_err(|e| InferenceError::Malformed(e.to_string()))?;
    if !(1.0..=5.0).contains(&parsed.score) {
        return Err(InferenceError::Malformed(format!(
            "score {} out of bounds",
            parsed.score
        )));
    }
    if !(0.0..=1.0).contains(&parsed.confidence) {
        return Err(InferenceError::Malformed(format!(
            "confidence {} out of bounds",
            parsed.confidence
        )));
    }
    Ok(parsed)
}

pub struct ScoringEngine {
    weights: ScoringWeights,
    config: ScoringConfig,
    inference: Option<Arc<dyn InferenceClient>>,
}

impl ScoringEngine {
    pub fn new(
        weights: ScoringWeights,
        config: ScoringConfig,
        inference: Option<Arc<dyn InferenceClient>>,
    ) -> Self {
        Self {
            weights,
            config,
            inference,
        }
    }

    /// Score one (profile, opportunity) pair. Stage 1 always runs; stage 2
    /// runs for ambiguous or high-value pairs when an inference client is
    /// configured, and any stage-2 failure falls back to the stage-1 result
    /// marked heuristic-only.
    pub async fn score(&self, profile: &OrgProfile, record: &OpportunityRecord) -> MatchResult {
        let outcome = stage_one(profile, record, &self.weights);
        let mut result = MatchResult {
            opportunity_fingerprint: record.fingerprint,
            score: outcome.score,
            confidence: outcome.confidence,
            alignment_reasons: outcome.alignment_reasons.clone(),
            risk_reasons: outcome.risk_reasons.clone(),
            scoring_path: ScoringPath::HeuristicOnly,
            low_confidence: false,
        };

        if needs_stage_two(outcome.score, record, &self.config) {
            if let Some(client) = &self.inference {
                let request = AssessmentRequest::new(profile, record, outcome.score);
                let variant = route_model(request.prompt_chars(), record, &self.config);
                match client.assess(&request, variant).await {
                    Ok(assessment) => {
                        result = MatchResult {
                            opportunity_fingerprint: record.fingerprint,
                            score: assessment.score.clamp(1.0, 5.0),
                            confidence: assessment.confidence.clamp(0.0, 1.0),
                            alignment_reasons: assessment.alignment_reasons,
                            risk_reasons: assessment.risk_reasons,
                            scoring_path: ScoringPath::HeuristicPlusInference,
                            low_confidence: false,
                        };
                    }
                    Err(err) => {
                        warn!(
                            fingerprint = %record.fingerprint,
                            error = %err,
                            "stage-2 inference failed, keeping heuristic result"
                        );
                    }
                }
            }
        }

        result.low_confidence = result.confidence < self.config.confidence_floor;
        result
    }
}

// ---------------------------------------------------------------------------
// Ranking / result assembly
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct MatchPage {
    pub results: Vec<MatchResult>,
    pub page: usize,
    pub per_page: usize,
    pub total: usize,
    pub total_pages: usize,
}

/// Sort score desc, confidence desc, deadline asc (soonest first, undated
/// last), fingerprint as the final stable tie-break. Low-confidence results
/// stay in; display policy belongs to the caller.
pub fn rank_page(
    mut results: Vec<MatchResult>,
    deadlines: &HashMap<Uuid, Option<NaiveDate>>,
    page: usize,
    per_page: usize,
) -> MatchPage {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                b.confidence
                    .partial_cmp(&a.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| {
                let da = deadlines.get(&a.opportunity_fingerprint).copied().flatten();
                let db = deadlines.get(&b.opportunity_fingerprint).copied().flatten();
                match (da, db) {
                    (Some(a), Some(b)) => a.cmp(&b),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                }
            })
            .then_with(|| a.opportunity_fingerprint.cmp(&b.opportunity_fingerprint))
    });

    let total = results.len();
    let per_page = per_page.max(1);
    let total_pages = total.max(1).div_ceil(per_page);
    let page = page.clamp(1, total_pages);
    let start = (page - 1) * per_page;
    let results = results.into_iter().skip(start).take(per_page).collect();

    MatchPage {
        results,
        page,
        per_page,
        total,
        total_pages,
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct DegradationSummary {
    pub degraded: bool,
    pub unavailable_sources: Vec<String>,
    pub heuristic_only: usize,
    pub low_confidence: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchOutcome {
    pub run_id: Uuid,
    pub page: MatchPage,
    pub records: Vec<OpportunityRecord>,
    pub sources: Vec<SourceReport>,
    pub degradation: DegradationSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub canonical_records: usize,
    pub sources: Vec<SourceReport>,
}

pub struct MatchPipeline {
    orchestrator: Orchestrator,
    dedup: DedupEngine,
    scoring: ScoringEngine,
    cache: Arc<EngineCache>,
    config: EngineConfig,
}

impl MatchPipeline {
    /// Wire the full pipeline from env config + the `sources.yaml` registry.
    pub async fn from_env() -> Result<Self> {
        let config = EngineConfig::from_env();
        let registry = load_source_registry(&config.sources_path).await?;
        let handles = registry
            .sources
            .into_iter()
            .map(|spec| Arc::new(SourceHandle::from_spec(spec)))
            .collect();
        let inference: Option<Arc<dyn InferenceClient>> = match &config.inference {
            Some(settings) => Some(Arc::new(HttpInferenceClient::new(
                settings.clone(),
                Duration::from_secs(config.http_timeout_secs),
            )?)),
            None => None,
        };
        Self::new(config, handles, inference)
    }

    pub fn new(
        config: EngineConfig,
        sources: Vec<Arc<SourceHandle>>,
        inference: Option<Arc<dyn InferenceClient>>,
    ) -> Result<Self> {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            // Connectors never retry; cycle cadence owns retry policy.
            backoff: BackoffPolicy::none(),
            ..HttpClientConfig::default()
        })?);
        let cache = Arc::new(EngineCache::new(config.cache));
        let orchestrator = Orchestrator::new(
            sources,
            http,
            Arc::clone(&cache),
            config.per_call_timeout,
        );
        Ok(Self {
            orchestrator,
            dedup: DedupEngine::new(DedupConfig::default()),
            scoring: ScoringEngine::new(ScoringWeights::default(), config.scoring, inference),
            cache,
            config,
        })
    }

    /// Answer one inbound query: aggregate (or reuse cache), dedup, score
    /// (or reuse cached scores), rank. Only invalid queries error; source
    /// failures degrade the response and are reported alongside it.
    pub async fn run_match(&self, query: &MatchQuery) -> Result<MatchOutcome, EngineError> {
        validate_query(query)?;
        let run_id = Uuid::new_v4();

        let outcome = self
            .orchestrator
            .aggregate(&SourceQuery::default(), self.config.aggregate_deadline)
            .await;
        let degraded = outcome.degraded();
        let records = self.dedup.merge(outcome.candidates);
        self.refresh_cache(&records, &outcome.fetched_sources);

        let filtered: Vec<&OpportunityRecord> = records
            .iter()
            .filter(|r| matches_text_filter(r, query.text_filter.as_deref()))
            .collect();

        let profile_fp = query.profile.fingerprint();
        let mut results = Vec::with_capacity(filtered.len());
        for record in &filtered {
            // Content-keyed: a re-fetched record whose scoring inputs changed
            // misses here even though its fingerprint is unchanged.
            let content_fp = record.content_fingerprint();
            let result = match self.cache.get_score(profile_fp, content_fp) {
                Some(cached) => cached,
                None => {
                    let scored = self.scoring.score(&query.profile, record).await;
                    self.cache.put_score(profile_fp, content_fp, scored.clone());
                    scored
                }
            };
            results.push(result);
        }

        if let Some(min_score) = query.min_score {
            results.retain(|r| r.score >= min_score);
        }

        let deadlines: HashMap<Uuid, Option<NaiveDate>> = filtered
            .iter()
            .map(|r| (r.fingerprint, r.deadline))
            .collect();
        let page = rank_page(
            results,
            &deadlines,
            query.page.unwrap_or(1),
            query.per_page.unwrap_or(20),
        );

        let degradation = DegradationSummary {
            degraded,
            unavailable_sources: outcome
                .reports
                .iter()
                .filter(|r| r.health == SourceHealth::Unavailable)
                .map(|r| r.source_id.clone())
                .collect(),
            heuristic_only: page
                .results
                .iter()
                .filter(|r| r.scoring_path == ScoringPath::HeuristicOnly)
                .count(),
            low_confidence: page.results.iter().filter(|r| r.low_confidence).count(),
        };

        let match_outcome = MatchOutcome {
            run_id,
            page,
            records: filtered.into_iter().cloned().collect(),
            sources: outcome.reports,
            degradation,
        };
        if let Err(err) = self.write_cycle_report(run_id, &match_outcome.sources, records.len()).await {
            warn!(error = %err, "cycle report write failed");
        }
        Ok(match_outcome)
    }

    /// Scheduled warm cycle: aggregate and cache without scoring.
    pub async fn refresh_cycle(&self) -> Result<CycleSummary> {
        self.refresh_cycle_with(&SourceQuery::default()).await
    }

    /// Warm cycle narrowed by a source query, for one-off CLI runs.
    pub async fn refresh_cycle_with(&self, query: &SourceQuery) -> Result<CycleSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let outcome = self
            .orchestrator
            .aggregate(query, self.config.aggregate_deadline)
            .await;
        let records = self.dedup.merge(outcome.candidates);
        self.refresh_cache(&records, &outcome.fetched_sources);
        info!(
            %run_id,
            records = records.len(),
            sources = outcome.reports.len(),
            "refresh cycle complete"
        );
        if let Err(err) = self.write_cycle_report(run_id, &outcome.reports, records.len()).await {
            warn!(error = %err, "cycle report write failed");
        }
        Ok(CycleSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            canonical_records: records.len(),
            sources: outcome.reports,
        })
    }

    pub fn source_specs(&self) -> Vec<SourceSpec> {
        self.orchestrator
            .sources()
            .iter()
            .map(|h| h.spec.clone())
            .collect()
    }

    /// Current per-source health derived from breaker state, for the status
    /// surface. Closed = healthy, half-open = degraded, open = unavailable.
    pub fn source_snapshots(&self) -> Vec<SourceReport> {
        self.orchestrator
            .sources()
            .iter()
            .map(|handle| {
                let snapshot = handle.breaker().snapshot();
                let health = if !handle.spec.enabled {
                    SourceHealth::Unavailable
                } else {
                    match snapshot.state {
                        BreakerState::Closed => SourceHealth::Healthy,
                        BreakerState::HalfOpen => SourceHealth::Degraded,
                        BreakerState::Open => SourceHealth::Unavailable,
                    }
                };
                SourceReport {
                    source_id: handle.spec.source_id.clone(),
                    health,
                    records: 0,
                    detail: (snapshot.consecutive_failures > 0)
                        .then(|| format!("{} consecutive failures", snapshot.consecutive_failures)),
                }
            })
            .collect()
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let pipeline = Arc::clone(self);
        let cron = self.config.refresh_cron.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                if let Err(err) = pipeline.refresh_cycle().await {
                    warn!(error = %err, "scheduled refresh cycle failed");
                }
            })
        })
        .with_context(|| format!("creating refresh job for cron {cron}"))?;
        sched.add(job).await.context("adding refresh job")?;
        Ok(Some(sched))
    }

    fn refresh_cache(&self, records: &[OpportunityRecord], fetched_sources: &[String]) {
        let ttl_by_source: HashMap<&str, Duration> = self
            .orchestrator
            .sources()
            .iter()
            .map(|h| (h.spec.source_id.as_str(), h.ttl()))
            .collect();

        for record in records {
            let ttl = record
                .provenance
                .iter()
                .filter_map(|s| ttl_by_source.get(s.as_str()).copied())
                .max()
                .unwrap_or(Duration::from_secs(300));
            self.cache.put_record(record.clone(), ttl);
        }
        for source_id in fetched_sources {
            let Some(ttl) = ttl_by_source.get(source_id.as_str()).copied() else {
                continue;
            };
            let fingerprints: Vec<Uuid> = records
                .iter()
                .filter(|r| r.provenance.iter().any(|s| s == source_id))
                .map(|r| r.fingerprint)
                .collect();
            self.cache.put_source_index(source_id, fingerprints, ttl);
        }
    }

    async fn write_cycle_report(
        &self,
        run_id: Uuid,
        reports: &[SourceReport],
        canonical_records: usize,
    ) -> Result<()> {
        let dir = self.config.reports_dir.join(run_id.to_string());
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        let body = serde_json::to_vec_pretty(&serde_json::json!({
            "run_id": run_id,
            "finished_at": Utc::now(),
            "canonical_records": canonical_records,
            "sources": reports,
        }))
        .context("serializing cycle report")?;
        tokio::fs::write(dir.join("cycle_report.json"), body)
            .await
            .context("writing cycle_report.json")?;
        Ok(())
    }
}

fn matches_text_filter(record: &OpportunityRecord, filter: Option<&str>) -> bool {
    let Some(filter) = filter else {
        return true;
    };
    let needle = fome_core::normalize_text(filter);
    if needle.is_empty() {
        return true;
    }
    let mut haystack = format!("{} {}", record.title, record.funder);
    if let Some(desc) = &record.description {
        haystack.push(' ');
        haystack.push_str(desc);
    }
    let haystack = fome_core::normalize_text(&haystack);
    needle.split_whitespace().any(|t| haystack.contains(t))
}
