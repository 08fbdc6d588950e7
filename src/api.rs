use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::assemble::ChildWrites;
use crate::auth::bearer_token;
use crate::db::{InsightRow, PageRecord};
use crate::error::PipelineError;
use crate::pipeline::{EnrichmentOutcome, IngestRequest, Pipeline, RegenerateRequest};

#[derive(Clone)]
struct AppState {
    pipeline: Arc<Pipeline>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct ScrapeResponse {
    success: bool,
    page: PageRecord,
    children: ChildWrites,
    #[serde(skip_serializing_if = "Option::is_none")]
    insights: Option<InsightRow>,
}

#[derive(Debug, Serialize)]
struct InsightsResponse {
    success: bool,
    insights: InsightRow,
}

fn status_for(err: &PipelineError) -> StatusCode {
    match err {
        PipelineError::Auth(_) => StatusCode::UNAUTHORIZED,
        PipelineError::Validation(_) => StatusCode::BAD_REQUEST,
        PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
        PipelineError::UpstreamFetch(_) | PipelineError::Enrichment(_) => StatusCode::BAD_GATEWAY,
        PipelineError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        PipelineError::Config(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

pub fn router(pipeline: Arc<Pipeline>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/functions/v1/scrape-url", post(scrape_url))
        .route("/functions/v1/generate-ai-insights", post(generate_insights))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(AppState { pipeline })
}

pub async fn serve(pipeline: Arc<Pipeline>, bind: &str) -> Result<()> {
    let addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid bind address {}", bind))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "scrapemark listening");
    println!("scrapemark listening on http://{addr}");
    axum::serve(listener, router(pipeline))
        .await
        .context("server shutdown")?;
    Ok(())
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

fn authorization(headers: &HeaderMap) -> Option<&str> {
    bearer_token(headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()))
}

fn invalid_body(rejection: JsonRejection) -> PipelineError {
    debug!(error = %rejection, "rejected request body");
    PipelineError::Validation("Invalid request body. Expected JSON.".into())
}

async fn scrape_url(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<IngestRequest>, JsonRejection>,
) -> Result<Json<ScrapeResponse>, PipelineError> {
    let identity = state.pipeline.authenticate(authorization(&headers)).await?;
    let Json(request) = body.map_err(invalid_body)?;
    let outcome = state.pipeline.ingest_as(&identity, &request).await?;

    let insights = match outcome.enrichment {
        EnrichmentOutcome::Stored(row, _) => Some(row),
        _ => None,
    };
    Ok(Json(ScrapeResponse {
        success: true,
        page: outcome.page,
        children: outcome.children,
        insights,
    }))
}

async fn generate_insights(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<RegenerateRequest>, JsonRejection>,
) -> Result<Json<InsightsResponse>, PipelineError> {
    let identity = state.pipeline.authenticate(authorization(&headers)).await?;
    let Json(request) = body.map_err(invalid_body)?;
    let insights = state.pipeline.regenerate_as(&identity, &request).await?;
    Ok(Json(InsightsResponse {
        success: true,
        insights,
    }))
}
