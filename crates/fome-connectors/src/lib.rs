//! Source connector contracts and the per-source adapters. Connectors are the
//! only component aware of source-native formats; everything downstream sees
//! canonical [`RawOpportunity`] values.
//!
//! Connector rules: never retry internally, treat zero records as success,
//! skip malformed records individually, and leave ambiguous amounts/deadlines
//! null rather than guessing.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use fome_core::{AmountRange, RawOpportunity, SourceKind};
use fome_infra::HttpFetcher;
use scraper::{Html, Selector};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "fome-connectors";

#[derive(Debug, Clone)]
pub struct FetchContext {
    pub run_id: Uuid,
    pub observed_at: DateTime<Utc>,
}

/// Shared query shape each connector translates into its source's native
/// request format.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceQuery {
    pub keywords: Vec<String>,
    pub geo: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("transport: {0}")]
    Transport(#[from] fome_infra::FetchError),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// A batch of normalized records plus the count of per-record parse failures
/// that were skipped (source-malformed-record semantics).
#[derive(Debug, Default)]
pub struct ParsedBatch {
    pub records: Vec<RawOpportunity>,
    pub skipped: usize,
}

#[async_trait]
pub trait SourceConnector: Send + Sync {
    fn source_id(&self) -> &str;
    fn kind(&self) -> SourceKind;

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &FetchContext,
        query: &SourceQuery,
    ) -> Result<Vec<RawOpportunity>, ConnectorError>;
}

pub fn connector_for(
    source_id: &str,
    kind: SourceKind,
    endpoint: &str,
) -> Box<dyn SourceConnector> {
    match kind {
        SourceKind::Registry => Box::new(RegistryConnector {
            source_id: source_id.to_string(),
            endpoint: endpoint.to_string(),
        }),
        SourceKind::ScrapedPage => Box::new(FoundationPageConnector {
            source_id: source_id.to_string(),
            endpoint: endpoint.to_string(),
        }),
        SourceKind::Feed => Box::new(FeedConnector {
            source_id: source_id.to_string(),
            endpoint: endpoint.to_string(),
        }),
    }
}

// ---------------------------------------------------------------------------
// Field normalization
// ---------------------------------------------------------------------------

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Pull dollar-ish figures out of free text: commas stripped, `k`/`m`
/// suffixes expanded, tokens split on dashes so "10k-20k" yields both bounds.
pub fn extract_amounts(text: &str) -> Vec<f64> {
    let mut out = Vec::new();
    for raw_token in text.split_whitespace() {
        for token in raw_token.split(['-', '\u{2013}', '/']) {
            let token = token
                .trim_start_matches(['$', '('])
                .trim_end_matches([',', '.', ')', ';', ':']);
            if token.is_empty() {
                continue;
            }
            let (digits, multiplier) = match token.chars().last() {
                Some('k') | Some('K') => (&token[..token.len() - 1], 1_000.0),
                Some('m') | Some('M') => (&token[..token.len() - 1], 1_000_000.0),
                _ => (token, 1.0),
            };
            let digits = digits.replace(',', "");
            if digits.is_empty() || !digits.chars().next().unwrap().is_ascii_digit() {
                continue;
            }
            if let Ok(value) = digits.parse::<f64>() {
                out.push(value * multiplier);
            }
        }
    }
    out
}

/// Classify amount text into a typed range, or leave it empty when the text
/// carries no usable figure.
pub fn parse_amount_range(text: &str) -> AmountRange {
    let lower = text.to_ascii_lowercase();
    let nums = extract_amounts(text);
    match nums.len() {
        0 => AmountRange::default(),
        1 if lower.contains("up to") || lower.contains("maximum") => AmountRange {
            min: None,
            max: Some(nums[0]),
        },
        1 if lower.contains("at least") || lower.contains("minimum") => AmountRange {
            min: Some(nums[0]),
            max: None,
        },
        1 => AmountRange {
            min: Some(nums[0]),
            max: Some(nums[0]),
        },
        _ => {
            let (mut min, mut max) = (nums[0], nums[1]);
            if min > max {
                std::mem::swap(&mut min, &mut max);
            }
            AmountRange {
                min: Some(min),
                max: Some(max),
            }
        }
    }
}

const DEADLINE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%B %d, %Y", "%b %d, %Y", "%d %B %Y"];

/// Parse a deadline string into a date, or None when the text is open-ended
/// ("rolling", "ongoing") or unparsable. Never guesses.
pub fn parse_deadline(text: &str) -> Option<NaiveDate> {
    let trimmed = text.trim().trim_end_matches('.').trim();
    let lower = trimmed.to_ascii_lowercase();
    if lower.is_empty()
        || lower.contains("rolling")
        || lower.contains("ongoing")
        || lower.contains("continuous")
    {
        return None;
    }
    DEADLINE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(trimmed, fmt).ok())
}

/// Find a deadline embedded in prose, e.g. "... Deadline: September 30, 2025."
pub fn deadline_from_text(text: &str) -> Option<NaiveDate> {
    let lower = text.to_ascii_lowercase();
    let idx = lower.find("deadline")?;
    let tail = &text[idx + "deadline".len()..];
    let tail = tail.trim_start_matches([':', ' ', '-']);
    let candidate = tail.split(['.', ';', '\n']).next()?;
    parse_deadline(candidate)
}

fn normalize_geo(text: Option<String>) -> Option<String> {
    text.and_then(text_or_none)
}

// ---------------------------------------------------------------------------
// Government registry (JSON API)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RegistryConnector {
    source_id: String,
    endpoint: String,
}

/// Keys the registry payload maps into typed fields; anything else is
/// preserved in the record's raw-field bag.
const REGISTRY_KNOWN_KEYS: &[&str] = &[
    "title",
    "funder",
    "agency",
    "description",
    "synopsis",
    "award_floor",
    "award_ceiling",
    "amount",
    "close_date",
    "deadline",
    "eligibility",
    "geo_scope",
    "coverage",
    "url",
    "link",
];

fn json_string(obj: &Map<String, JsonValue>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| obj.get(*k))
        .and_then(|v| v.as_str())
        .and_then(|s| text_or_none(s.to_string()))
}

fn json_amount(obj: &Map<String, JsonValue>, key: &str) -> Option<f64> {
    match obj.get(key)? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => extract_amounts(s).first().copied(),
        _ => None,
    }
}

pub fn parse_registry_payload(
    source_id: &str,
    bytes: &[u8],
    observed_at: DateTime<Utc>,
) -> Result<ParsedBatch, ConnectorError> {
    let value: JsonValue = serde_json::from_slice(bytes)
        .map_err(|e| ConnectorError::Message(format!("invalid registry payload: {e}")))?;
    let items = value
        .get("opportunities")
        .and_then(|v| v.as_array())
        .or_else(|| value.as_array())
        .ok_or_else(|| ConnectorError::Message("registry payload is not a list".into()))?;

    let mut batch = ParsedBatch::default();
    for item in items {
        let Some(obj) = item.as_object() else {
            batch.skipped += 1;
            continue;
        };
        let title = json_string(obj, &["title"]);
        let funder = json_string(obj, &["funder", "agency"]);
        let (Some(title), Some(funder)) = (title, funder) else {
            warn!(source_id, "skipping registry record without title/funder");
            batch.skipped += 1;
            continue;
        };

        let amount = AmountRange {
            min: json_amount(obj, "award_floor"),
            max: json_amount(obj, "award_ceiling"),
        };
        let amount = if amount.is_empty() {
            json_string(obj, &["amount"])
                .map(|s| parse_amount_range(&s))
                .unwrap_or_default()
        } else {
            amount
        };
        let deadline = json_string(obj, &["close_date", "deadline"])
            .as_deref()
            .and_then(parse_deadline);

        let extra: Map<String, JsonValue> = obj
            .iter()
            .filter(|(k, _)| !REGISTRY_KNOWN_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        batch.records.push(RawOpportunity {
            source_id: source_id.to_string(),
            title,
            funder,
            description: json_string(obj, &["description", "synopsis"]),
            amount,
            deadline,
            eligibility: json_string(obj, &["eligibility"]),
            geo_scope: normalize_geo(json_string(obj, &["geo_scope", "coverage"])),
            url: json_string(obj, &["url", "link"]),
            observed_at,
            extra,
        });
    }
    Ok(batch)
}

#[async_trait]
impl SourceConnector for RegistryConnector {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Registry
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &FetchContext,
        query: &SourceQuery,
    ) -> Result<Vec<RawOpportunity>, ConnectorError> {
        let keyword = query.keywords.join("+").replace(' ', "+");
        let url = if keyword.is_empty() {
            self.endpoint.clone()
        } else {
            format!("{}?keyword={}", self.endpoint, keyword)
        };
        let resp = http.fetch_bytes(ctx.run_id, &self.source_id, &url).await?;
        let batch = parse_registry_payload(&self.source_id, &resp.body, ctx.observed_at)?;
        if batch.skipped > 0 {
            warn!(source_id = %self.source_id, skipped = batch.skipped, "registry records skipped");
        }
        Ok(batch.records)
    }
}

// ---------------------------------------------------------------------------
// Scraped foundation pages (HTML)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FoundationPageConnector {
    source_id: String,
    endpoint: String,
}

fn select_first_text(fragment: &scraper::ElementRef, selector: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    fragment
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn select_first_attr(fragment: &scraper::ElementRef, selector: &str, attr: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    fragment
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string()))
}

pub fn parse_foundation_html(
    source_id: &str,
    html: &str,
    observed_at: DateTime<Utc>,
) -> Result<ParsedBatch, ConnectorError> {
    let document = Html::parse_document(html);
    let card_sel = Selector::parse("article.grant, .grant-card")
        .map_err(|e| ConnectorError::Message(e.to_string()))?;
    let page_funder_sel =
        Selector::parse("h1, .foundation-name").map_err(|e| ConnectorError::Message(e.to_string()))?;
    let page_funder = document
        .select(&page_funder_sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()));

    let mut batch = ParsedBatch::default();
    for card in document.select(&card_sel) {
        let title = select_first_text(&card, "h2, h3, .grant-title");
        let funder = select_first_text(&card, ".funder").or_else(|| page_funder.clone());
        let (Some(title), Some(funder)) = (title, funder) else {
            warn!(source_id, "skipping grant card without title/funder");
            batch.skipped += 1;
            continue;
        };

        let amount = select_first_text(&card, ".amount")
            .map(|s| parse_amount_range(&s))
            .unwrap_or_default();
        let deadline = select_first_text(&card, ".deadline")
            .as_deref()
            .and_then(parse_deadline);

        batch.records.push(RawOpportunity {
            source_id: source_id.to_string(),
            title,
            funder,
            description: select_first_text(&card, ".summary, p"),
            amount,
            deadline,
            eligibility: select_first_text(&card, ".eligibility"),
            geo_scope: normalize_geo(select_first_text(&card, ".geo")),
            url: select_first_attr(&card, "a[href]", "href"),
            observed_at,
            extra: Map::new(),
        });
    }
    Ok(batch)
}

#[async_trait]
impl SourceConnector for FoundationPageConnector {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::ScrapedPage
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &FetchContext,
        _query: &SourceQuery,
    ) -> Result<Vec<RawOpportunity>, ConnectorError> {
        // Scraped pages have no server-side query; filtering happens
        // downstream at ranking.
        let resp = http
            .fetch_bytes(ctx.run_id, &self.source_id, &self.endpoint)
            .await?;
        let html = String::from_utf8_lossy(&resp.body).to_string();
        let batch = parse_foundation_html(&self.source_id, &html, ctx.observed_at)?;
        if batch.skipped > 0 {
            warn!(source_id = %self.source_id, skipped = batch.skipped, "grant cards skipped");
        }
        Ok(batch.records)
    }
}

// ---------------------------------------------------------------------------
// Philanthropy news feed (RSS/Atom)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FeedConnector {
    source_id: String,
    endpoint: String,
}

pub fn parse_feed_bytes(
    source_id: &str,
    bytes: &[u8],
    observed_at: DateTime<Utc>,
) -> Result<ParsedBatch, ConnectorError> {
    let feed = feed_rs::parser::parse(bytes)
        .map_err(|e| ConnectorError::Message(format!("invalid feed: {e}")))?;

    let mut batch = ParsedBatch::default();
    for entry in feed.entries {
        let title = entry.title.as_ref().and_then(|t| text_or_none(t.content.clone()));
        // Funder attribution comes from the entry author; entries without
        // one cannot be fingerprinted and are skipped, not guessed.
        let funder = entry
            .authors
            .first()
            .and_then(|p| text_or_none(p.name.clone()));
        let (Some(title), Some(funder)) = (title, funder) else {
            warn!(source_id, "skipping feed entry without title/author");
            batch.skipped += 1;
            continue;
        };

        let summary = entry
            .summary
            .as_ref()
            .and_then(|t| text_or_none(t.content.clone()));
        let amount = summary
            .as_deref()
            .filter(|s| s.contains('$'))
            .map(parse_amount_range)
            .unwrap_or_default();
        let deadline = summary.as_deref().and_then(deadline_from_text);

        batch.records.push(RawOpportunity {
            source_id: source_id.to_string(),
            title,
            funder,
            description: summary,
            amount,
            deadline,
            eligibility: None,
            geo_scope: None,
            url: entry.links.first().map(|l| l.href.clone()),
            observed_at,
            extra: Map::new(),
        });
    }
    Ok(batch)
}

#[async_trait]
impl SourceConnector for FeedConnector {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Feed
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &FetchContext,
        _query: &SourceQuery,
    ) -> Result<Vec<RawOpportunity>, ConnectorError> {
        let resp = http
            .fetch_bytes(ctx.run_id, &self.source_id, &self.endpoint)
            .await?;
        let batch = parse_feed_bytes(&self.source_id, &resp.body, ctx.observed_at)?;
        if batch.skipped > 0 {
            warn!(source_id = %self.source_id, skipped = batch.skipped, "feed entries skipped");
        }
        Ok(batch.records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn observed() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).single().unwrap()
    }

    #[test]
    fn amount_range_classification() {
        let range = parse_amount_range("$10,000 \u{2013} $20,000");
        assert_eq!(range.min, Some(10_000.0));
        assert_eq!(range.max, Some(20_000.0));

        let cap = parse_amount_range("up to $50k");
        assert_eq!(cap.min, None);
        assert_eq!(cap.max, Some(50_000.0));

        let floor = parse_amount_range("at least $5,000 per award");
        assert_eq!(floor.min, Some(5_000.0));
        assert_eq!(floor.max, None);

        assert!(parse_amount_range("awards vary by project").is_empty());
    }

    #[test]
    fn deadline_classification_never_guesses() {
        assert_eq!(
            parse_deadline("September 30, 2025"),
            NaiveDate::from_ymd_opt(2025, 9, 30)
        );
        assert_eq!(parse_deadline("2025-09-30"), NaiveDate::from_ymd_opt(2025, 9, 30));
        assert_eq!(parse_deadline("rolling basis"), None);
        assert_eq!(parse_deadline("whenever works"), None);
    }

    #[test]
    fn deadline_extracted_from_prose() {
        let text = "Grants of $10,000 to $20,000. Deadline: September 30, 2025. Apply online.";
        assert_eq!(deadline_from_text(text), NaiveDate::from_ymd_opt(2025, 9, 30));
        assert_eq!(deadline_from_text("no dates here"), None);
    }

    #[test]
    fn registry_payload_skips_malformed_and_keeps_extra_fields() {
        let payload = serde_json::json!({
            "opportunities": [
                {
                    "title": "Community Grant 2025",
                    "agency": "Example Fund",
                    "synopsis": "Support for community food programs.",
                    "award_floor": 10000,
                    "award_ceiling": "$20,000",
                    "close_date": "2025-09-30",
                    "eligibility": "501(c)(3) organizations",
                    "coverage": "Oregon",
                    "link": "https://registry.example/1",
                    "cfda_number": "10.310"
                },
                { "agency": "No Title Fund" },
                {
                    "title": "Rolling Mini-Grants",
                    "funder": "Example Fund",
                    "deadline": "rolling"
                }
            ]
        });
        let batch =
            parse_registry_payload("registry", payload.to_string().as_bytes(), observed()).unwrap();
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.skipped, 1);

        let first = &batch.records[0];
        assert_eq!(first.amount.min, Some(10_000.0));
        assert_eq!(first.amount.max, Some(20_000.0));
        assert_eq!(first.deadline, NaiveDate::from_ymd_opt(2025, 9, 30));
        assert_eq!(first.geo_scope.as_deref(), Some("Oregon"));
        assert_eq!(
            first.extra.get("cfda_number").and_then(|v| v.as_str()),
            Some("10.310")
        );

        assert_eq!(batch.records[1].deadline, None, "rolling stays null");
    }

    #[test]
    fn registry_empty_list_is_success() {
        let batch = parse_registry_payload("registry", b"{\"opportunities\": []}", observed()).unwrap();
        assert!(batch.records.is_empty());
        assert_eq!(batch.skipped, 0);
    }

    #[test]
    fn registry_rejects_non_list_payload() {
        let err = parse_registry_payload("registry", b"{\"status\": \"down\"}", observed());
        assert!(err.is_err());
    }

    #[test]
    fn foundation_html_parses_cards_and_skips_incomplete() {
        let html = r#"
            <html><body>
            <h1>Example Foundation</h1>
            <article class="grant">
              <h2>Rural Health Initiative</h2>
              <p class="summary">Clinics serving rural counties.</p>
              <span class="amount">up to $75,000</span>
              <span class="deadline">October 15, 2025</span>
              <span class="eligibility">Nonprofit clinics</span>
              <span class="geo">Pacific Northwest</span>
              <a href="https://foundation.example/rural-health">Apply</a>
            </article>
            <article class="grant">
              <p class="summary">A card with no title.</p>
            </article>
            </body></html>
        "#;
        let batch = parse_foundation_html("foundation", html, observed()).unwrap();
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.skipped, 1);

        let rec = &batch.records[0];
        assert_eq!(rec.title, "Rural Health Initiative");
        assert_eq!(rec.funder, "Example Foundation", "falls back to page funder");
        assert_eq!(rec.amount.max, Some(75_000.0));
        assert_eq!(rec.deadline, NaiveDate::from_ymd_opt(2025, 10, 15));
        assert_eq!(rec.url.as_deref(), Some("https://foundation.example/rural-health"));
    }

    #[test]
    fn feed_entries_parse_with_author_as_funder() {
        let xml = r#"<?xml version="1.0"?>
            <rss version="2.0"><channel>
              <title>Philanthropy Wire</title>
              <item>
                <title>Community Grant 2025 now open</title>
                <author>grants@example.org (Example Fund)</author>
                <link>https://wire.example/community-grant</link>
                <description>Grants of $10,000 to $20,000. Deadline: September 30, 2025.</description>
              </item>
              <item>
                <description>An item without a title or author.</description>
              </item>
            </channel></rss>
        "#;
        let batch = parse_feed_bytes("feed", xml.as_bytes(), observed()).unwrap();
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.skipped, 1);

        let rec = &batch.records[0];
        assert_eq!(rec.title, "Community Grant 2025 now open");
        assert_eq!(rec.amount.min, Some(10_000.0));
        assert_eq!(rec.deadline, NaiveDate::from_ymd_opt(2025, 9, 30));
        assert_eq!(rec.url.as_deref(), Some("https://wire.example/community-grant"));
    }

    #[test]
    fn connector_factory_covers_all_kinds() {
        let registry = connector_for("a", SourceKind::Registry, "https://x.example");
        let page = connector_for("b", SourceKind::ScrapedPage, "https://y.example");
        let feed = connector_for("c", SourceKind::Feed, "https://z.example");
        assert_eq!(registry.kind(), SourceKind::Registry);
        assert_eq!(page.kind(), SourceKind::ScrapedPage);
        assert_eq!(feed.kind(), SourceKind::Feed);
        assert_eq!(registry.source_id(), "a");
    }
}
