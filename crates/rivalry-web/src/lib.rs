//! Axum HTTP surface and Askama job monitor.

use std::future::Future;
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{rejection::JsonRejection, Path as AxumPath, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rivalry_core::{ComparisonKind, JobName, JobRecord, OrchestrationError};
use rivalry_jobs::{CacheOutcome, Services};
use rivalry_runner::{JobPayload, TriggeredJob};
use serde::Deserialize;
use serde_json::{json, Map, Value as JsonValue};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "rivalry-web";

const MONITOR_PAGE_LIMIT: usize = 50;

#[derive(Clone)]
pub struct AppState {
    pub services: Services,
}

impl AppState {
    pub fn new(services: Services) -> Self {
        Self { services }
    }
}

/// Error body `{success: false, error: CODE, message}`.
///
/// Server-side failures answer with the generic code; the specific one is logged.
#[derive(Debug)]
pub struct ApiError(OrchestrationError);

impl From<OrchestrationError> for ApiError {
    fn from(err: OrchestrationError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let code = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(code = self.0.code(), error = %self.0, "request failed");
            "INTERNAL_SERVER_ERROR"
        } else {
            self.0.code()
        };
        let body = json!({
            "success": false,
            "error": code,
            "message": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

fn invalid(message: impl Into<String>) -> ApiError {
    ApiError(OrchestrationError::InvalidRequest(message.into()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CustomAnalysisRequest {
    #[serde(default)]
    brand_a: Option<String>,
    #[serde(default)]
    brand_b: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordEventRequest {
    #[serde(default)]
    event_id: Option<String>,
    #[serde(default)]
    event_name: Option<String>,
    #[serde(default)]
    metadata: Option<Map<String, JsonValue>>,
}

#[derive(Debug, Deserialize, Default)]
struct EventsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Clone)]
struct JobRow {
    job_id: String,
    job_name: String,
    created_at: String,
    metadata: String,
}

impl From<JobRecord> for JobRow {
    fn from(record: JobRecord) -> Self {
        Self {
            job_id: record.job_id,
            job_name: record.job_name.as_str().to_string(),
            created_at: record.created_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            metadata: if record.metadata.is_empty() {
                "-".to_string()
            } else {
                JsonValue::Object(record.metadata).to_string()
            },
        }
    }
}

#[derive(Template)]
#[template(path = "jobs.html")]
struct JobsTemplate {
    jobs: Vec<JobRow>,
    total: usize,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/trigger-scrape", post(trigger_scrape_handler))
        .route("/api/trigger-custom-analysis", post(trigger_custom_analysis_handler))
        .route("/api/trigger-full-analysis", post(trigger_full_analysis_handler))
        .route("/api/job-status/{job_id}", get(job_status_handler))
        .route("/api/record-event", post(record_event_handler))
        .route("/api/events", get(events_handler))
        .route("/jobs", get(jobs_page_handler))
        .with_state(Arc::new(state))
}

/// Serves until Ctrl-C.
pub async fn serve(services: Services, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "http surface listening");
    axum::serve(listener, app(AppState::new(services)))
        .with_graceful_shutdown(shutdown_signal(tokio::signal::ctrl_c()))
        .await?;
    Ok(())
}

/// Resolves when `signal` fires. If the handler cannot be installed the server keeps running.
async fn shutdown_signal<F>(signal: F)
where
    F: Future<Output = std::io::Result<()>>,
{
    match signal.await {
        Ok(()) => info!("shutdown signal received; draining connections"),
        Err(err) => {
            error!(error = %err, "could not listen for Ctrl-C; graceful shutdown disabled");
            std::future::pending::<()>().await;
        }
    }
}

fn status_url(job_id: &str) -> String {
    format!("/api/job-status/{job_id}")
}

fn accepted(job_id: &str) -> Response {
    (
        StatusCode::ACCEPTED,
        Json(json!({
            "success": true,
            "cached": false,
            "jobId": job_id,
            "statusUrl": status_url(job_id),
        })),
    )
        .into_response()
}

fn cache_response(outcome: CacheOutcome) -> Response {
    match outcome {
        CacheOutcome::Hit(analysis) => (
            StatusCode::OK,
            Json(json!({"success": true, "cached": true, "analysis": analysis})),
        )
            .into_response(),
        CacheOutcome::Miss { job_id, .. } => accepted(&job_id),
    }
}

async fn trigger_scrape_handler(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let job: TriggeredJob = state.services.trigger.trigger(JobPayload::Scrape).await?;
    state.services.ledger.record_detached(&job);
    Ok(accepted(&job.job_id))
}

async fn trigger_custom_analysis_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<CustomAnalysisRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body.map_err(|rejection| invalid(rejection.body_text()))?;
    let (Some(brand_a), Some(brand_b)) = (request.brand_a, request.brand_b) else {
        return Err(invalid("brandA and brandB are required"));
    };
    let outcome = state
        .services
        .cache
        .get_or_trigger(ComparisonKind::Custom, &[brand_a, brand_b])
        .await?;
    Ok(cache_response(outcome))
}

async fn trigger_full_analysis_handler(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let outcome = state.services.cache.get_or_trigger(ComparisonKind::Full, &[]).await?;
    Ok(cache_response(outcome))
}

async fn job_status_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(job_id): AxumPath<String>,
) -> Result<Response, ApiError> {
    match state.services.status.current(&job_id).await {
        Ok(view) => Ok(Json(view).into_response()),
        Err(OrchestrationError::JobNotFound { .. }) => {
            Ok((StatusCode::NOT_FOUND, Json(json!({"error": "Job not found"}))).into_response())
        }
        Err(err) => Err(err.into()),
    }
}

async fn record_event_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<RecordEventRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body.map_err(|rejection| invalid(rejection.body_text()))?;
    let (Some(event_id), Some(event_name)) = (request.event_id, request.event_name) else {
        return Err(invalid("eventId and eventName are required"));
    };
    let job_name: JobName = event_name.parse()?;
    let event = state
        .services
        .ledger
        .record(&event_id, job_name, request.metadata.unwrap_or_default())
        .await?;
    Ok(Json(json!({"success": true, "event": event})).into_response())
}

async fn events_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Result<Response, ApiError> {
    let events = state.services.ledger.list(query.limit).await?;
    Ok(Json(json!({"success": true, "events": events})).into_response())
}

async fn jobs_page_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.services.ledger.list(Some(MONITOR_PAGE_LIMIT)).await {
        Ok(records) => {
            let jobs = records.into_iter().map(JobRow::from).collect::<Vec<_>>();
            render_html(JobsTemplate {
                total: jobs.len(),
                jobs,
            })
        }
        Err(err) => server_error(err),
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(err),
    }
}

fn server_error(err: impl std::fmt::Display) -> Response {
    error!(error = %err, "page render failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html("Server error".to_string()),
    )
        .into_response()
}
