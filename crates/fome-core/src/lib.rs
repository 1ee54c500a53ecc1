//! Core domain model for FOME: canonical opportunity records, organization
//! profiles, match results, and fingerprint derivation.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

pub const CRATE_NAME: &str = "fome-core";

/// Namespace for all v5 fingerprints so they never collide with ids minted
/// elsewhere.
pub const FINGERPRINT_NAMESPACE: Uuid = Uuid::NAMESPACE_URL;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Registry,
    ScrapedPage,
    Feed,
}

/// Open amount interval in the source's currency; either bound may be
/// unknown.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct AmountRange {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl AmountRange {
    pub fn is_empty(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }

    /// Width of the known part of the range, used as a completeness metric
    /// when merging conflicting records.
    pub fn completeness(&self) -> u8 {
        self.min.is_some() as u8 + self.max.is_some() as u8
    }
}

/// One opportunity as a single connector observed it, before deduplication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawOpportunity {
    pub source_id: String,
    pub title: String,
    pub funder: String,
    pub description: Option<String>,
    pub amount: AmountRange,
    pub deadline: Option<NaiveDate>,
    pub eligibility: Option<String>,
    pub geo_scope: Option<String>,
    pub url: Option<String>,
    pub observed_at: DateTime<Utc>,
    /// Source fields we do not model, kept verbatim for audit/debugging.
    #[serde(default)]
    pub extra: Map<String, JsonValue>,
}

impl RawOpportunity {
    pub fn fingerprint(&self) -> Uuid {
        fingerprint(&self.title, &self.funder, self.deadline)
    }
}

/// Canonical merged opportunity. Produced by the dedup engine, never mutated
/// in place; a fresher cycle supersedes it with a new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpportunityRecord {
    pub fingerprint: Uuid,
    pub title: String,
    pub funder: String,
    pub description: Option<String>,
    pub amount: AmountRange,
    pub deadline: Option<NaiveDate>,
    pub eligibility: Option<String>,
    pub geo_scope: Option<String>,
    pub url: Option<String>,
    /// Source ids that contributed to this record, sorted, deduplicated.
    pub provenance: Vec<String>,
    pub last_observed: DateTime<Utc>,
    /// Flagged when a different fingerprint looks suspiciously similar;
    /// never auto-merged.
    pub review_required: bool,
    pub dedup_confidence: Option<f64>,
    #[serde(default)]
    pub extra: Map<String, JsonValue>,
}

impl OpportunityRecord {
    /// Digest of the fields scoring reads. Keys cached match results so a
    /// re-fetched record whose amounts, eligibility, or text changed misses
    /// the cache even though its identity fingerprint is unchanged.
    pub fn content_fingerprint(&self) -> Uuid {
        let parts = [
            normalize_text(&self.title),
            normalize_text(&self.funder),
            self.description
                .as_deref()
                .map(normalize_text)
                .unwrap_or_default(),
            self.amount
                .min
                .map(|v| format!("{v:.2}"))
                .unwrap_or_default(),
            self.amount
                .max
                .map(|v| format!("{v:.2}"))
                .unwrap_or_default(),
            self.deadline
                .map(|d| d.to_string())
                .unwrap_or_else(|| "null".to_string()),
            self.eligibility
                .as_deref()
                .map(normalize_text)
                .unwrap_or_default(),
            self.geo_scope
                .as_deref()
                .map(normalize_text)
                .unwrap_or_default(),
        ];
        Uuid::new_v5(&FINGERPRINT_NAMESPACE, parts.join("\n").as_bytes())
    }
}

/// Immutable scoring input describing the consuming organization. The engine
/// never mutates a profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrgProfile {
    pub mission: String,
    #[serde(default)]
    pub focus_areas: Vec<String>,
    pub geo_area: Option<String>,
    pub annual_budget: Option<f64>,
    #[serde(default)]
    pub past_funders: Vec<String>,
}

impl OrgProfile {
    /// Stable digest of the profile, used to key cached match results.
    pub fn fingerprint(&self) -> Uuid {
        let mut parts = vec![normalize_text(&self.mission)];
        let mut focus: Vec<String> = self.focus_areas.iter().map(|f| normalize_text(f)).collect();
        focus.sort();
        parts.extend(focus);
        parts.push(
            self.geo_area
                .as_deref()
                .map(normalize_text)
                .unwrap_or_default(),
        );
        parts.push(
            self.annual_budget
                .map(|b| format!("{b:.2}"))
                .unwrap_or_default(),
        );
        let mut funders: Vec<String> = self.past_funders.iter().map(|f| normalize_text(f)).collect();
        funders.sort();
        parts.extend(funders);
        Uuid::new_v5(&FINGERPRINT_NAMESPACE, parts.join("\n").as_bytes())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringPath {
    HeuristicOnly,
    HeuristicPlusInference,
}

/// Output of scoring one (profile, opportunity) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub opportunity_fingerprint: Uuid,
    /// Bounded 1.0..=5.0.
    pub score: f64,
    /// Bounded 0.0..=1.0.
    pub confidence: f64,
    pub alignment_reasons: Vec<String>,
    pub risk_reasons: Vec<String>,
    pub scoring_path: ScoringPath,
    /// Set when confidence fell below the configured floor. Flagged, never
    /// dropped from ranking.
    pub low_confidence: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceHealth {
    Healthy,
    Degraded,
    Unavailable,
}

/// Per-source outcome of one aggregation cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceReport {
    pub source_id: String,
    pub health: SourceHealth,
    pub records: usize,
    pub detail: Option<String>,
}

/// Inbound query shape shared by the web boundary and the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchQuery {
    pub profile: OrgProfile,
    #[serde(default)]
    pub text_filter: Option<String>,
    #[serde(default)]
    pub page: Option<usize>,
    #[serde(default)]
    pub per_page: Option<usize>,
    #[serde(default)]
    pub min_score: Option<f64>,
}

/// Lowercase, strip punctuation, collapse whitespace. The only text
/// canonicalization used for identity; keep it boring and stable.
pub fn normalize_text(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Deterministic identity of an opportunity: v5 UUID over the normalized
/// (title, funder, deadline-or-null) triple. Two records with the same
/// fingerprint are assumed to describe the same real-world opportunity
/// regardless of which source produced them.
pub fn fingerprint(title: &str, funder: &str, deadline: Option<NaiveDate>) -> Uuid {
    let key = format!(
        "{}\n{}\n{}",
        normalize_text(title),
        normalize_text(funder),
        deadline.map(|d| d.to_string()).unwrap_or_else(|| "null".to_string())
    );
    Uuid::new_v5(&FINGERPRINT_NAMESPACE, key.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_ignores_source_formatting() {
        let deadline = NaiveDate::from_ymd_opt(2025, 9, 30);
        let a = fingerprint("Community Grant 2025", "Example Fund", deadline);
        let b = fingerprint("  community   GRANT, 2025!", "EXAMPLE FUND.", deadline);
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_distinguishes_deadline_and_null() {
        let dated = fingerprint("Community Grant", "Example Fund", NaiveDate::from_ymd_opt(2025, 9, 30));
        let undated = fingerprint("Community Grant", "Example Fund", None);
        assert_ne!(dated, undated);
    }

    #[test]
    fn fingerprint_distinguishes_funders() {
        let a = fingerprint("Community Grant", "Example Fund", None);
        let b = fingerprint("Community Grant", "Other Fund", None);
        assert_ne!(a, b);
    }

    #[test]
    fn profile_fingerprint_is_order_insensitive_for_tags() {
        let mut profile = OrgProfile {
            mission: "Food security for rural families".into(),
            focus_areas: vec!["food".into(), "rural".into()],
            geo_area: Some("Oregon".into()),
            annual_budget: Some(250_000.0),
            past_funders: vec!["Example Fund".into()],
        };
        let a = profile.fingerprint();
        profile.focus_areas.reverse();
        assert_eq!(a, profile.fingerprint());
        profile.mission = "Different mission".into();
        assert_ne!(a, profile.fingerprint());
    }

    #[test]
    fn content_fingerprint_tracks_scoring_inputs_not_bookkeeping() {
        let record = OpportunityRecord {
            fingerprint: fingerprint("Community Grant 2025", "Example Fund", None),
            title: "Community Grant 2025".into(),
            funder: "Example Fund".into(),
            description: Some("Support for community programs.".into()),
            amount: AmountRange {
                min: Some(10_000.0),
                max: Some(50_000.0),
            },
            deadline: None,
            eligibility: None,
            geo_scope: None,
            url: None,
            provenance: vec!["registry".into()],
            last_observed: Utc::now(),
            review_required: false,
            dedup_confidence: None,
            extra: Map::new(),
        };
        let baseline = record.content_fingerprint();

        let mut observed_later = record.clone();
        observed_later.last_observed = Utc::now();
        observed_later.provenance.push("feed".into());
        assert_eq!(baseline, observed_later.content_fingerprint());

        let mut amount_changed = record.clone();
        amount_changed.amount.max = Some(500_000.0);
        assert_eq!(amount_changed.fingerprint, record.fingerprint);
        assert_ne!(baseline, amount_changed.content_fingerprint());

        let mut eligibility_changed = record.clone();
        eligibility_changed.eligibility = Some("Nonprofits only".into());
        assert_ne!(baseline, eligibility_changed.content_fingerprint());
    }

    #[test]
    fn normalize_text_collapses_noise() {
        assert_eq!(normalize_text("  The, Quick -- Brown!  Fox "), "the quick brown fox");
    }
}
