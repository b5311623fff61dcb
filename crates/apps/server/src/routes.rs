use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use foundation::{Camera, TileCoord, TileRange};
use serde::Deserialize;
use streaming::protocol::{
    AutoFetchRequest, ErrorBody, MVT_CONTENT_TYPE, PrefetchRequest, PrefetchResponse,
    ProtocolError, RawQueryRequest, ScopeResponse, SqlBody, TileUrl, ViewportUpdate, VisibleRange,
    parse_tile_path,
};
use streaming::{EngineStats, QueryError, TileError, TilePipeline};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::query_client::encode_result;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<TilePipeline>,
    pub scheme: Arc<str>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_headers(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS]);

    Router::new()
        .route("/healthz", get(healthz))
        .route("/tiles/:z/:x/:y", get(get_tile))
        .route("/fetch", get(fetch_url))
        .route("/control/base-query", post(set_base_query))
        .route("/control/id-filter", post(set_id_filter))
        .route("/control/viewport", post(set_viewport))
        .route("/control/visible-range", post(set_visible_range))
        .route("/control/prefetch", post(prefetch))
        .route("/control/prewarm", post(prewarm))
        .route("/control/auto-fetch", post(set_auto_fetch))
        .route("/query", post(raw_query))
        .route("/stats", get(stats))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn new(status: StatusCode, code: &str, message: impl ToString) -> Self {
        Self {
            status,
            body: ErrorBody {
                code: code.to_string(),
                message: message.to_string(),
            },
        }
    }
}

impl From<TileError> for ApiError {
    fn from(err: TileError) -> Self {
        let (status, code) = match &err {
            TileError::EngineFailed(_) | TileError::Query(QueryError::Unavailable(_)) => {
                (StatusCode::SERVICE_UNAVAILABLE, "engine_failed")
            }
            TileError::Query(QueryError::Sql(_)) => (StatusCode::BAD_REQUEST, "query_rejected"),
            TileError::Canceled => (StatusCode::SERVICE_UNAVAILABLE, "canceled"),
            TileError::Decode(_) => (StatusCode::BAD_GATEWAY, "bad_result"),
        };
        Self::new(status, code, err)
    }
}

impl From<ProtocolError> for ApiError {
    fn from(err: ProtocolError) -> Self {
        let code = match &err {
            ProtocolError::Zoom(_) => "bad_range",
            _ => "bad_tile",
        };
        Self::new(StatusCode::BAD_REQUEST, code, err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!(code = %self.body.code, message = %self.body.message, "request failed");
        }
        (self.status, Json(self.body)).into_response()
    }
}

async fn healthz() -> Response {
    (StatusCode::OK, "ok").into_response()
}

async fn get_tile(
    State(state): State<AppState>,
    Path((z, x, y)): Path<(String, String, String)>,
) -> Result<Response, ApiError> {
    let coord = parse_tile_path(&format!("{z}/{x}/{y}"))?;
    serve_tile(&state, coord).await
}

#[derive(Debug, Deserialize)]
struct FetchParams {
    url: String,
}

/// Resolves a `{scheme}://z/x/y` URL as the map's protocol handler would.
async fn fetch_url(
    State(state): State<AppState>,
    Query(params): Query<FetchParams>,
) -> Result<Response, ApiError> {
    let url = TileUrl::parse(&params.url, &state.scheme)?;
    serve_tile(&state, url.coord).await
}

async fn serve_tile(state: &AppState, coord: TileCoord) -> Result<Response, ApiError> {
    let tile = state.pipeline.request_tile(coord).await?;
    let mut headers = HeaderMap::new();
    headers.insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static(MVT_CONTENT_TYPE),
    );
    Ok((StatusCode::OK, headers, Body::from(tile)).into_response())
}

async fn set_base_query(
    State(state): State<AppState>,
    Json(body): Json<SqlBody>,
) -> Result<Json<ScopeResponse>, ApiError> {
    state.pipeline.set_base_query(body.sql.as_deref()).await?;
    Ok(Json(scope_response(&state.pipeline)))
}

async fn set_id_filter(
    State(state): State<AppState>,
    Json(body): Json<SqlBody>,
) -> Result<Json<ScopeResponse>, ApiError> {
    state.pipeline.set_id_filter(body.sql.as_deref()).await?;
    Ok(Json(scope_response(&state.pipeline)))
}

fn scope_response(pipeline: &TilePipeline) -> ScopeResponse {
    let scope = pipeline.scope();
    ScopeResponse {
        revision: scope.revision,
        filter: scope.filter.to_string(),
    }
}

async fn set_viewport(State(state): State<AppState>, Json(update): Json<ViewportUpdate>) -> StatusCode {
    let pipeline = &state.pipeline;
    match (update.zoom, update.center(), update.width_px, update.height_px) {
        (Some(zoom), Some(center), Some(width_px), Some(height_px)) => {
            pipeline.set_camera(&Camera {
                center,
                zoom,
                width_px,
                height_px,
            });
        }
        (zoom, center, _, _) => {
            if let Some(zoom) = zoom {
                pipeline.set_viewport_zoom(zoom);
            }
            if let Some(center) = center {
                pipeline.set_viewport_center(center);
            }
        }
    }
    StatusCode::NO_CONTENT
}

async fn set_visible_range(
    State(state): State<AppState>,
    Json(range): Json<VisibleRange>,
) -> Result<StatusCode, ApiError> {
    let range = TileRange::try_from(range)?;
    if !state.pipeline.set_visible_tile_range(range) {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "bad_range",
            format!("zoom {} has no tile columns", range.z),
        ));
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn prefetch(
    State(state): State<AppState>,
    Json(req): Json<PrefetchRequest>,
) -> Result<Json<PrefetchResponse>, ApiError> {
    let (z, range) = req.target()?;
    let status = state.pipeline.prefetch_visible(z, range).await?;
    Ok(Json(PrefetchResponse { status }))
}

async fn prewarm(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.pipeline.prewarm().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_auto_fetch(State(state): State<AppState>, Json(req): Json<AutoFetchRequest>) -> StatusCode {
    state.pipeline.set_auto_fetch_enabled(req.enabled);
    StatusCode::NO_CONTENT
}

async fn raw_query(
    State(state): State<AppState>,
    Json(req): Json<RawQueryRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let result = state.pipeline.run_raw_query(&req.sql).await?;
    Ok(Json(encode_result(&result)))
}

async fn stats(State(state): State<AppState>) -> Json<EngineStats> {
    Json(state.pipeline.stats())
}
