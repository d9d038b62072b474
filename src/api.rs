// =============================================================================
// api.rs — THE FRONT DOOR
// =============================================================================
//
// JSON in, JSON out. The brokerage web app calls these; nothing here knows
// about sessions or companies beyond the company id it is handed.
//
//   POST /api/carriers/lookup    carrier profile from QCMobile + census
//   POST /api/insurance/fetch    queue a scrape, try a quick one
//   POST /api/insurance/status   what the store knows right now
//   GET  /metrics                counters, breakers, publisher
//   GET  /health
// =============================================================================

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::error;

use crate::lookup::{Aggregator, LookupError};
use crate::metrics::MetricsCollector;
use crate::publisher::PublisherStats;
use crate::runner::{RunnerError, ScraperRunner};

#[derive(Clone)]
pub struct AppState {
    pub aggregator: Arc<Aggregator>,
    pub runner: Arc<ScraperRunner>,
    pub metrics: Arc<MetricsCollector>,
    pub publisher: Option<Arc<PublisherStats>>,
    /// Used when a lookup request carries no access key of its own.
    pub default_web_key: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/carriers/lookup", post(lookup))
        .route("/api/insurance/fetch", post(fetch_insurance))
        .route("/api/insurance/status", post(insurance_status))
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .with_state(state)
}

struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

impl From<LookupError> for ApiError {
    fn from(e: LookupError) -> Self {
        let status = match e {
            LookupError::BothIdentifiers | LookupError::NoIdentifier => StatusCode::BAD_REQUEST,
            LookupError::NoData(_) | LookupError::MissingUsdot(_) => StatusCode::NOT_FOUND,
            LookupError::InvalidStructure(_) | LookupError::Api => StatusCode::BAD_GATEWAY,
        };
        ApiError(status, e.to_string())
    }
}

impl From<RunnerError> for ApiError {
    fn from(e: RunnerError) -> Self {
        match e {
            RunnerError::MissingMc => ApiError(StatusCode::BAD_REQUEST, e.to_string()),
            RunnerError::UnknownCarrier(_) | RunnerError::CarrierNotFound(_) => {
                ApiError(StatusCode::NOT_FOUND, e.to_string())
            }
            other => {
                error!(error = %other, "Insurance request failed");
                ApiError(StatusCode::INTERNAL_SERVER_ERROR, format!("An error occurred: {}", other))
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct LookupRequest {
    mc_number: Option<String>,
    dot_number: Option<String>,
    access_key: Option<String>,
}

async fn lookup(State(state): State<AppState>, Json(req): Json<LookupRequest>) -> Result<Response, ApiError> {
    let key = req
        .access_key
        .filter(|k| !k.trim().is_empty())
        .or_else(|| state.default_web_key.clone())
        .unwrap_or_default();
    let record = state
        .aggregator
        .lookup_record(req.mc_number.as_deref(), req.dot_number.as_deref(), &key)
        .await?;
    Ok(Json(record).into_response())
}

#[derive(Debug, Deserialize)]
struct FetchRequest {
    #[serde(default)]
    mc_number: String,
}

async fn fetch_insurance(State(state): State<AppState>, Json(req): Json<FetchRequest>) -> Result<Response, ApiError> {
    let response = state.runner.fetch(&req.mc_number).await?;
    Ok(Json(response).into_response())
}

#[derive(Debug, Deserialize)]
struct StatusRequest {
    #[serde(default)]
    mc_number: String,
    company_id: Option<i64>,
}

async fn insurance_status(State(state): State<AppState>, Json(req): Json<StatusRequest>) -> Result<Response, ApiError> {
    let runner = state.runner.clone();
    let response = tokio::task::spawn_blocking(move || runner.status(&req.mc_number, req.company_id))
        .await
        .map_err(|e| ApiError(StatusCode::INTERNAL_SERVER_ERROR, format!("An error occurred: {}", e)))??;
    Ok(Json(response).into_response())
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let breakers: Vec<_> = state.aggregator.breakers().iter().map(|b| b.snapshot()).collect();
    Json(json!({
        "counters": state.metrics.snapshot(),
        "circuit_breakers": breakers,
        "publisher": state.publisher.as_ref().map(|p| p.snapshot()),
    }))
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "carrier_intel_engine",
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::lookup::http::fake::FakeHttp;
    use crate::runner::queue::MemoryQueue;
    use crate::runner::subprocess::testing::shell;
    use crate::store::{NewCarrier, Store};
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    fn app(http: FakeHttp) -> (Router, Arc<MetricsCollector>) {
        let config = Config::for_tests();
        let metrics = Arc::new(MetricsCollector::new());
        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .insert_carrier(&NewCarrier {
                company_id: Some(1),
                mc_number: "123",
                ..NewCarrier::default()
            })
            .unwrap();
        let runner = ScraperRunner::new(
            store,
            Arc::new(MemoryQueue::new()),
            shell(r#"echo '[{"type":"BIPD/Primary","insurance_carrier":"PROGRESSIVE"}]'"#),
            metrics.clone(),
            &config,
        );
        let state = AppState {
            aggregator: Arc::new(Aggregator::new(Arc::new(http), &config).with_metrics(metrics.clone())),
            runner: Arc::new(runner),
            metrics: metrics.clone(),
            publisher: None,
            default_web_key: config.fmcsa_web_key.clone(),
        };
        (router(state), metrics)
    }

    async fn call(app: Router, method: &str, uri: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_lookup_input_error_is_400() {
        let (app, metrics) = app(FakeHttp::new());
        let (status, body) = call(app, "POST", "/api/carriers/lookup", json!({ "mc_number": "1", "dot_number": "2" })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Please enter either an MC number or a DOT number, not both.");
        assert_eq!(metrics.snapshot().lookup_errors, 1);
    }

    #[tokio::test]
    async fn test_lookup_success_uses_default_key() {
        let http = FakeHttp::new()
            .route("docket-number/123/?webKey=test-key", Ok(json!({ "content": [{ "carrier": { "dotNumber": 77, "legalName": "ACME" } }] })))
            .route("/authority", Ok(json!({ "content": [] })))
            .route("az4n-8mr2", Ok(json!([])));
        let (app, _) = app(http);
        let (status, body) = call(app, "POST", "/api/carriers/lookup", json!({ "mc_number": "123" })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["USDOT_Number"], "77");
        assert_eq!(body["Email"], "Not Available");
    }

    #[tokio::test]
    async fn test_lookup_upstream_failure_is_502() {
        let (app, _) = app(FakeHttp::new());
        let (status, body) = call(app, "POST", "/api/carriers/lookup", json!({ "dot_number": "77" })).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"], "API error occurred");
    }

    #[tokio::test]
    async fn test_fetch_errors_and_success() {
        let (router, _) = app(FakeHttp::new());

        let (status, body) = call(router.clone(), "POST", "/api/insurance/fetch", json!({})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "MC number is required");

        let (status, body) = call(router.clone(), "POST", "/api/insurance/fetch", json!({ "mc_number": "404" })).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "No carriers found with MC# 404");

        let (status, body) = call(router, "POST", "/api/insurance/fetch", json!({ "mc_number": "123" })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
        assert_eq!(body["insurance_carrier"], "PROGRESSIVE");
        assert_eq!(body["carrier_count"], 1);
    }

    #[tokio::test]
    async fn test_status_before_and_after_fetch() {
        let (router, _) = app(FakeHttp::new());

        let (status, body) = call(router.clone(), "POST", "/api/insurance/status", json!({ "mc_number": "123", "company_id": 1 })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "processing");

        call(router.clone(), "POST", "/api/insurance/fetch", json!({ "mc_number": "123" })).await;

        let (_, body) = call(router.clone(), "POST", "/api/insurance/status", json!({ "mc_number": "123", "company_id": 1 })).await;
        assert_eq!(body["status"], "success");
        assert_eq!(body["insurance"][0]["type"], "BIPD/Primary");

        let (status, _) = call(router, "POST", "/api/insurance/status", json!({ "mc_number": "999" })).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_metrics_and_health() {
        let (router, _) = app(FakeHttp::new());
        let (status, body) = call(router.clone(), "GET", "/health", Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");

        let (_, body) = call(router, "GET", "/metrics", Value::Null).await;
        assert_eq!(body["counters"]["status"], "operational");
        let upstreams: Vec<_> = body["circuit_breakers"]
            .as_array()
            .unwrap()
            .iter()
            .map(|b| b["upstream"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(upstreams, ["qcmobile", "dot-census"]);
    }
}
