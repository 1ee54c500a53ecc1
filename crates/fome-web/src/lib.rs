//! JSON API boundary for FOME: match queries in, ranked results out.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use fome_core::{MatchQuery, SourceHealth, SourceKind};
use fome_engine::{EngineError, MatchOutcome, MatchPipeline};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::error;

pub const CRATE_NAME: &str = "fome-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<MatchPipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<MatchPipeline>) -> Self {
        Self { pipeline }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceRow {
    pub source_id: String,
    pub display_name: String,
    pub kind: SourceKind,
    pub enabled: bool,
    pub priority: u8,
    pub health: SourceHealth,
    pub detail: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/match", post(match_handler))
        .route("/sources", get(sources_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env(pipeline: Arc<MatchPipeline>) -> anyhow::Result<()> {
    let port: u16 = std::env::var("FOME_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(AppState::new(pipeline))).await?;
    Ok(())
}

async fn match_handler(
    State(state): State<Arc<AppState>>,
    Json(query): Json<MatchQuery>,
) -> Response {
    match state.pipeline.run_match(&query).await {
        Ok(outcome) => Json::<MatchOutcome>(outcome).into_response(),
        Err(EngineError::InvalidQuery(reason)) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(ErrorBody { error: reason }),
        )
            .into_response(),
        Err(EngineError::Internal(err)) => {
            error!(error = %err, "match request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody {
                    error: "internal error".into(),
                }),
            )
                .into_response()
        }
    }
}

async fn sources_handler(State(state): State<Arc<AppState>>) -> Json<Vec<SourceRow>> {
    let specs = state.pipeline.source_specs();
    let snapshots = state.pipeline.source_snapshots();
    let rows = specs
        .into_iter()
        .zip(snapshots)
        .map(|(spec, snapshot)| SourceRow {
            source_id: spec.source_id,
            display_name: spec.display_name,
            kind: spec.kind,
            enabled: spec.enabled,
            priority: spec.priority,
            health: snapshot.health,
            detail: snapshot.detail,
        })
        .collect();
    Json(rows)
}

async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use chrono::Utc;
    use fome_connectors::{ConnectorError, FetchContext, SourceConnector, SourceQuery};
    use fome_core::{AmountRange, OrgProfile, RawOpportunity};
    use fome_engine::{BreakerSpec, EngineConfig, RateSpec, SourceHandle, SourceSpec};
    use fome_infra::HttpFetcher;
    use http_body_util::BodyExt;
    use serde_json::json;
    use tower::ServiceExt;

    struct StubConnector {
        source_id: String,
        records: Vec<RawOpportunity>,
    }

    #[async_trait]
    impl SourceConnector for StubConnector {
        fn source_id(&self) -> &str {
            &self.source_id
        }

        fn kind(&self) -> SourceKind {
            SourceKind::Registry
        }

        async fn fetch(
            &self,
            _http: &HttpFetcher,
            _ctx: &FetchContext,
            _query: &SourceQuery,
        ) -> Result<Vec<RawOpportunity>, ConnectorError> {
            Ok(self.records.clone())
        }
    }

    fn test_state() -> AppState {
        let record = RawOpportunity {
            source_id: "gov-registry".into(),
            title: "Community Food Security Grant".into(),
            funder: "Example Fund".into(),
            description: Some("Support for food security programs in rural counties.".into()),
            amount: AmountRange {
                min: Some(25_000.0),
                max: Some(50_000.0),
            },
            deadline: None,
            eligibility: Some("Nonprofit organizations".into()),
            geo_scope: Some("Oregon".into()),
            url: Some("https://registry.example/grants/1".into()),
            observed_at: Utc::now(),
            extra: serde_json::Map::new(),
        };
        let spec = SourceSpec {
            source_id: "gov-registry".into(),
            display_name: "Government Grants Registry".into(),
            kind: SourceKind::Registry,
            enabled: true,
            priority: 10,
            endpoint: "https://registry.example/api".into(),
            ttl_secs: 300,
            rate: RateSpec::default(),
            breaker: BreakerSpec::default(),
        };
        let handle = Arc::new(SourceHandle::with_connector(
            spec,
            Box::new(StubConnector {
                source_id: "gov-registry".into(),
                records: vec![record],
            }),
        ));
        let config = EngineConfig {
            reports_dir: tempfile::tempdir().expect("tempdir").keep(),
            ..EngineConfig::default()
        };
        let pipeline = MatchPipeline::new(config, vec![handle], None).expect("pipeline");
        AppState::new(Arc::new(pipeline))
    }

    fn match_body(profile: OrgProfile) -> Body {
        Body::from(
            serde_json::to_vec(&json!({
                "profile": profile,
            }))
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn post_match_returns_ranked_results() {
        let app = app(test_state());
        let profile = OrgProfile {
            mission: "Improve community food security across rural counties".into(),
            focus_areas: vec!["food security".into()],
            geo_area: Some("Oregon".into()),
            annual_budget: Some(400_000.0),
            past_funders: vec![],
        };
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/match")
                    .header("content-type", "application/json")
                    .body(match_body(profile))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["page"]["total"], 1);
        assert_eq!(parsed["degradation"]["degraded"], false);
        assert_eq!(parsed["sources"][0]["source_id"], "gov-registry");
    }

    #[tokio::test]
    async fn post_match_rejects_invalid_query_with_422() {
        let app = app(test_state());
        let profile = OrgProfile {
            mission: "   ".into(),
            focus_areas: vec![],
            geo_area: None,
            annual_budget: None,
            past_funders: vec![],
        };
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/match")
                    .header("content-type", "application/json")
                    .body(match_body(profile))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(parsed["error"].as_str().unwrap().contains("mission"));
    }

    #[tokio::test]
    async fn get_sources_lists_configured_sources_with_health() {
        let app = app(test_state());
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/sources")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed[0]["source_id"], "gov-registry");
        assert_eq!(parsed[0]["display_name"], "Government Grants Registry");
        assert_eq!(parsed[0]["health"], "healthy");
    }

    #[tokio::test]
    async fn healthz_is_always_ok() {
        let app = app(test_state());
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
