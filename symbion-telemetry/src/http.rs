/**
 * API REST TELEMETRY - Ingestion agents et lecture des métriques
 *
 * RÔLE :
 * Expose le point d'entrée des agents (POST /agents/payload) et les routes de
 * lecture pour le dashboard : hôtes, séries par métrique, espace disque,
 * alertes ouvertes et santé du service.
 *
 * SÉCURITÉ :
 * - Header x-api-key (SYMBION_API_KEY) obligatoire sauf /health
 * - /agents/payload est authentifié par la clé agent contenue dans le payload
 *
 * ERREURS :
 * 400 payload ou paramètre invalide, 403 clé agent, 404 hôte inconnu,
 * 409 horodatage non croissant, 500 stockage.
 */

use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::alerts::OpenAlert;
use crate::health::TelemetryHealth;
use crate::ingest::IngestError;
use crate::models::{Tier, Timestamp};
use crate::payload::AgentPayload;
use crate::query::{DiskSpace, HostSummary, Metric, QueryError, Series};
use crate::state::AppState;

pub const API_KEY_ENV: &str = "SYMBION_API_KEY";

/// Routes accessibles sans x-api-key
const OPEN_PATHS: [&str; 2] = ["/health", "/agents/payload"];

/// Erreur HTTP sérialisée en `{"error": "..."}`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, error = %self.message, "request failed");
        }
        (self.status, Json(serde_json::json!({ "error": self.message }))).into_response()
    }
}

impl From<IngestError> for ApiError {
    fn from(e: IngestError) -> Self {
        let status = match &e {
            IngestError::Unauthorized(_) => StatusCode::FORBIDDEN,
            IngestError::Payload(_) => StatusCode::BAD_REQUEST,
            IngestError::OutOfOrder { .. } => StatusCode::CONFLICT,
            IngestError::Store(_) | IngestError::Join(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl From<QueryError> for ApiError {
    fn from(e: QueryError) -> Self {
        let status = match &e {
            QueryError::Tier(_) | QueryError::UnknownMetric(_) | QueryError::EmptyWindow { .. } => {
                StatusCode::BAD_REQUEST
            }
            QueryError::UnknownHost(_) => StatusCode::NOT_FOUND,
            QueryError::Store(_) | QueryError::Join(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

async fn require_api_key(req: Request, next: Next) -> Result<Response, StatusCode> {
    let path = req.uri().path();

    if OPEN_PATHS.iter().any(|p| path.starts_with(p)) {
        return Ok(next.run(req).await);
    }

    let expected = std::env::var(API_KEY_ENV).unwrap_or_default();
    if expected.is_empty() {
        warn!("SECURITY: {API_KEY_ENV} not set - API access denied");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected);

    if !ok {
        warn!(path, "request rejected: bad api key");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/agents/payload", post(post_payload))
        .route("/hosts", get(get_hosts))
        .route("/hosts/{host}", axum::routing::delete(delete_host))
        .route("/data/disk-space", get(get_disk_space))
        .route("/data/{metric}", get(get_series))
        .route("/alerts", get(get_alerts))
        .with_state(app_state)
        .layer(middleware::from_fn(require_api_key))
}

#[derive(Debug, Serialize)]
struct PayloadAck {
    host: String,
    date: Timestamp,
    /// false pour le premier relevé d'un hôte (pas encore de débit)
    rates: bool,
}

// POST /agents/payload
async fn post_payload(
    State(app): State<AppState>,
    Json(payload): Json<AgentPayload>,
) -> Result<Json<PayloadAck>, ApiError> {
    let sample = app.ingestor.ingest(payload).await?;
    Ok(Json(PayloadAck {
        rates: sample.cpu.is_some(),
        host: sample.host,
        date: sample.timestamp,
    }))
}

// GET /hosts
async fn get_hosts(State(app): State<AppState>) -> Result<Json<Vec<HostSummary>>, ApiError> {
    Ok(Json(app.query.hosts().await?))
}

// DELETE /hosts/{host}
async fn delete_host(
    State(app): State<AppState>,
    Path(host): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !app.ingestor.remove_host(&host).await? {
        return Err(ApiError::new(StatusCode::NOT_FOUND, format!("unknown host '{host}'")));
    }
    Ok(Json(serde_json::json!({ "host": host, "status": "deleted" })))
}

#[derive(Debug, Deserialize)]
struct SeriesParams {
    host: String,
    tier: Option<String>,
    from: Option<Timestamp>,
    to: Option<Timestamp>,
}

// GET /data/{metric}?host=..&tier=..&from=..&to=..
async fn get_series(
    State(app): State<AppState>,
    Path(metric): Path<String>,
    Query(params): Query<SeriesParams>,
) -> Result<Json<Series>, ApiError> {
    let metric: Metric = metric.parse()?;
    let tier = match params.tier.as_deref() {
        Some(raw) => raw.parse::<Tier>().map_err(QueryError::from)?,
        None => Tier::FiveSeconds,
    };
    let series = app
        .query
        .series(metric, &params.host, tier, params.from, params.to)
        .await?;
    Ok(Json(series))
}

#[derive(Debug, Deserialize)]
struct HostParam {
    host: String,
}

// GET /data/disk-space?host=..
async fn get_disk_space(
    State(app): State<AppState>,
    Query(params): Query<HostParam>,
) -> Result<Json<Vec<DiskSpace>>, ApiError> {
    Ok(Json(app.query.disk_space(&params.host).await?))
}

// GET /alerts
async fn get_alerts(State(app): State<AppState>) -> Json<Vec<OpenAlert>> {
    Json(app.alerts.open_alerts())
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<TelemetryHealth> {
    Json(app.health.get_health(app.ingestor.tracked_hosts()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UnknownTier;

    #[test]
    fn test_ingest_errors_map_to_status() {
        let cases = [
            (IngestError::Unauthorized("h1".into()), StatusCode::FORBIDDEN),
            (
                IngestError::OutOfOrder {
                    host: "h1".into(),
                    date: 1,
                    last: 2,
                },
                StatusCode::CONFLICT,
            ),
            (
                IngestError::Payload(crate::payload::PayloadError::Blank("host")),
                StatusCode::BAD_REQUEST,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status, status);
        }
    }

    #[test]
    fn test_query_errors_map_to_status() {
        assert_eq!(
            ApiError::from(QueryError::UnknownHost("x".into())).status,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(QueryError::from(UnknownTier("3h".into()))).status,
            StatusCode::BAD_REQUEST
        );
    }
}
