use std::net::Ipv4Addr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::{
    address_space::{AddressQuery, AddressSpace, Assignment},
    engine::LivenessEngine,
    error::Error,
    netdetect,
    scanner::ProbeOptions,
    scheduler::PollingScheduler,
    types::{AddressId, LivenessMap, NewSegment, ScanSummary, Segment, SegmentId, SegmentWithStats},
};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<LivenessEngine>,
    pub scheduler: PollingScheduler,
    pub sweep: ProbeOptions,
}

impl AppState {
    fn space(&self) -> &AddressSpace {
        self.engine.address_space()
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::InvalidCidr { .. }
            | Error::InvalidGateway { .. }
            | Error::InvalidAddress(_)
            | Error::InvalidMac(_)
            | Error::SegmentTooLarge { .. } => StatusCode::BAD_REQUEST,
            Error::SegmentNotFound(_) | Error::AddressNotFound(_) => StatusCode::NOT_FOUND,
            Error::CidrOverlap { .. } | Error::InvalidTransition { .. } => StatusCode::CONFLICT,
            Error::ProbeUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::CacheWrite(_) | Error::Storage(_) | Error::Serialization(_) | Error::Io(_) => {
                error!(error = %self, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = json!({ "error": self.kind(), "message": self.to_string() });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, Error>;

#[derive(Debug, Serialize)]
pub struct CreatedSegment {
    #[serde(flatten)]
    pub segment: Segment,
    pub address_count: u64,
}

#[derive(Debug, Serialize)]
pub struct PingResponse {
    pub results: LivenessMap,
    pub summary: ScanSummary,
}

#[derive(Debug, Deserialize)]
pub struct SweepQuery {
    pub subnet: String,
}

#[derive(Debug, Deserialize)]
pub struct Visibility {
    pub visible: bool,
}

/// Build the HTTP API.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/segments", get(list_segments).post(create_segment))
        .route("/segments/{id}", get(get_segment).delete(delete_segment))
        .route("/ips", get(list_ips))
        .route("/ips/{id}", get(get_ip))
        .route("/ips/{id}/assign", post(assign_ip))
        .route("/ips/{id}/release", post(release_ip))
        .route("/ips/{id}/block", post(block_ip))
        .route("/ping/segment/{id}", post(ping_segment))
        .route("/ping/segment/{id}/latest", get(latest_for_segment))
        .route("/ping/latest", get(latest_all))
        .route("/ping/address/{ip}", get(latest_for_address))
        .route("/ping/sweep", get(sweep))
        .route("/monitor", get(monitor_status))
        .route("/monitor/select/{id}", post(monitor_select))
        .route("/monitor/stop", post(monitor_stop))
        .route("/monitor/visibility", post(monitor_visibility))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn spawn_server(bind: &str, state: AppState) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(bind = %bind, "serving API");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn create_segment(
    State(app): State<AppState>,
    Json(req): Json<NewSegment>,
) -> ApiResult<impl IntoResponse> {
    let (segment, address_count) = app.space().create_segment(req)?;
    Ok((
        StatusCode::CREATED,
        Json(CreatedSegment {
            segment,
            address_count,
        }),
    ))
}

async fn list_segments(State(app): State<AppState>) -> ApiResult<Json<Vec<SegmentWithStats>>> {
    Ok(Json(app.space().list_segments()?))
}

async fn get_segment(
    State(app): State<AppState>,
    Path(id): Path<SegmentId>,
) -> ApiResult<Json<SegmentWithStats>> {
    let segment = app.space().get_segment(id)?;
    let stats = app.space().segment_stats(id)?;
    Ok(Json(SegmentWithStats { segment, stats }))
}

async fn delete_segment(
    State(app): State<AppState>,
    Path(id): Path<SegmentId>,
) -> ApiResult<StatusCode> {
    app.scheduler.forget(id).await;
    app.space().delete_segment(id)?;
    app.engine.forget(id);
    Ok(StatusCode::NO_CONTENT)
}

async fn list_ips(
    State(app): State<AppState>,
    Query(query): Query<AddressQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(app.space().list_addresses(&query)?))
}

async fn get_ip(
    State(app): State<AppState>,
    Path(id): Path<AddressId>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(app.space().get_address(id)?))
}

async fn assign_ip(
    State(app): State<AppState>,
    Path(id): Path<AddressId>,
    Json(req): Json<Assignment>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(app.space().assign(id, req)?))
}

async fn release_ip(
    State(app): State<AppState>,
    Path(id): Path<AddressId>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(app.space().release(id)?))
}

async fn block_ip(
    State(app): State<AppState>,
    Path(id): Path<AddressId>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(app.space().block(id)?))
}

async fn ping_segment(
    State(app): State<AppState>,
    Path(id): Path<SegmentId>,
) -> ApiResult<Json<PingResponse>> {
    let report = app.engine.run_cycle(id).await?;
    Ok(Json(PingResponse {
        results: report.results,
        summary: report.summary,
    }))
}

async fn latest_for_segment(
    State(app): State<AppState>,
    Path(id): Path<SegmentId>,
) -> ApiResult<Json<LivenessMap>> {
    app.space().get_segment(id)?;
    let snapshot = app.engine.cache().latest_for_segment(id);
    Ok(Json(snapshot.as_ref().clone()))
}

async fn latest_all(State(app): State<AppState>) -> Json<LivenessMap> {
    Json(app.engine.cache().latest_all())
}

async fn latest_for_address(
    State(app): State<AppState>,
    Path(ip): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let ip: Ipv4Addr = ip.parse().map_err(|_| Error::InvalidAddress(ip.clone()))?;
    Ok(Json(app.engine.cache().latest_for_address(&ip.to_string())))
}

async fn sweep(
    State(app): State<AppState>,
    Query(q): Query<SweepQuery>,
) -> ApiResult<impl IntoResponse> {
    let net = netdetect::parse_sweep_prefix(&q.subnet)?;
    Ok(Json(app.engine.sweep(net, app.sweep).await?))
}

async fn monitor_status(State(app): State<AppState>) -> impl IntoResponse {
    Json(app.scheduler.status().await)
}

async fn monitor_select(
    State(app): State<AppState>,
    Path(id): Path<SegmentId>,
) -> ApiResult<impl IntoResponse> {
    app.scheduler.select_segment(id).await?;
    Ok((StatusCode::ACCEPTED, Json(app.scheduler.status().await)))
}

async fn monitor_stop(State(app): State<AppState>) -> impl IntoResponse {
    if let Some(id) = app.scheduler.status().await.segment_id {
        app.scheduler.stop(id).await;
    }
    Json(app.scheduler.status().await)
}

async fn monitor_visibility(
    State(app): State<AppState>,
    Json(v): Json<Visibility>,
) -> impl IntoResponse {
    app.scheduler.set_visible(v.visible).await;
    Json(app.scheduler.status().await)
}
