//! Axum handlers for the master's request surface.
//!
//! This is the boundary shim only: each route deserializes one request
//! shape, calls the corresponding [`MasterService`] operation, and maps
//! the typed error onto an HTTP status plus its stable wire code. The
//! production transport in front of the master speaks the same shapes.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use kvpool_common::{
    ClientId, ClientStatus, Error, ReplicaDescriptor, ReplicateConfig, Segment, SegmentId,
    ViewVersion,
};
use kvpool_master::MasterService;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Shared state for the request handlers
pub struct AppState {
    pub master: MasterService,
}

/// Error body sent for any failed operation
#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

/// Wrapper turning a master error into an HTTP response
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorBody {
            error: self.0.code(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

/// One slot of a batch response: either a value or a wire error code
#[derive(Serialize)]
pub struct BatchEntry<T: Serialize> {
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'static str>,
}

fn batch_entry<T: Serialize>(result: Result<T, Error>) -> BatchEntry<T> {
    match result {
        Ok(value) => BatchEntry {
            value: Some(value),
            error: None,
        },
        Err(e) => BatchEntry {
            value: None,
            error: Some(e.code()),
        },
    }
}

// ---- object routes ----

#[derive(Deserialize)]
pub struct KeyRequest {
    pub key: String,
}

#[derive(Deserialize)]
pub struct KeysRequest {
    pub keys: Vec<String>,
}

#[derive(Serialize)]
pub struct ExistKeyResponse {
    pub exists: bool,
}

pub async fn exist_key(
    State(state): State<Arc<AppState>>,
    Json(req): Json<KeyRequest>,
) -> ApiResult<ExistKeyResponse> {
    let exists = state.master.exist_key(&req.key)?;
    Ok(Json(ExistKeyResponse { exists }))
}

pub async fn batch_exist_key(
    State(state): State<Arc<AppState>>,
    Json(req): Json<KeysRequest>,
) -> Json<Vec<BatchEntry<bool>>> {
    let results = state.master.batch_exist_key(&req.keys);
    Json(results.into_iter().map(batch_entry).collect())
}

#[derive(Serialize)]
pub struct ReplicaListResponse {
    pub replicas: Vec<ReplicaDescriptor>,
}

pub async fn get_replica_list(
    State(state): State<Arc<AppState>>,
    Json(req): Json<KeyRequest>,
) -> ApiResult<ReplicaListResponse> {
    let replicas = state.master.get_replica_list(&req.key)?;
    Ok(Json(ReplicaListResponse { replicas }))
}

pub async fn batch_get_replica_list(
    State(state): State<Arc<AppState>>,
    Json(req): Json<KeysRequest>,
) -> Json<Vec<BatchEntry<Vec<ReplicaDescriptor>>>> {
    let results = state.master.batch_get_replica_list(&req.keys);
    Json(results.into_iter().map(batch_entry).collect())
}

#[derive(Deserialize)]
pub struct PutStartRequest {
    pub key: String,
    pub value_length: u64,
    pub slice_lengths: Vec<u64>,
    #[serde(default = "default_replica_num")]
    pub replica_num: usize,
    #[serde(default)]
    pub preferred_segment: Option<SegmentId>,
}

fn default_replica_num() -> usize {
    1
}

pub async fn put_start(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PutStartRequest>,
) -> ApiResult<ReplicaListResponse> {
    let config = ReplicateConfig {
        replica_num: req.replica_num,
        preferred_segment: req.preferred_segment,
    };
    let replicas = state
        .master
        .put_start(&req.key, req.value_length, &req.slice_lengths, &config)?;
    Ok(Json(ReplicaListResponse { replicas }))
}

#[derive(Deserialize)]
pub struct BatchPutStartRequest {
    pub keys: Vec<String>,
    pub value_lengths: Vec<u64>,
    pub slice_lengths: Vec<Vec<u64>>,
    #[serde(default = "default_replica_num")]
    pub replica_num: usize,
    #[serde(default)]
    pub preferred_segment: Option<SegmentId>,
}

pub async fn batch_put_start(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BatchPutStartRequest>,
) -> Json<Vec<BatchEntry<Vec<ReplicaDescriptor>>>> {
    let config = ReplicateConfig {
        replica_num: req.replica_num,
        preferred_segment: req.preferred_segment,
    };
    let results =
        state
            .master
            .batch_put_start(&req.keys, &req.value_lengths, &req.slice_lengths, &config);
    Json(results.into_iter().map(batch_entry).collect())
}

pub async fn put_end(
    State(state): State<Arc<AppState>>,
    Json(req): Json<KeyRequest>,
) -> ApiResult<()> {
    state.master.put_end(&req.key)?;
    Ok(Json(()))
}

pub async fn batch_put_end(
    State(state): State<Arc<AppState>>,
    Json(req): Json<KeysRequest>,
) -> Json<Vec<BatchEntry<()>>> {
    let results = state.master.batch_put_end(&req.keys);
    Json(results.into_iter().map(batch_entry).collect())
}

pub async fn put_revoke(
    State(state): State<Arc<AppState>>,
    Json(req): Json<KeyRequest>,
) -> ApiResult<()> {
    state.master.put_revoke(&req.key)?;
    Ok(Json(()))
}

pub async fn batch_put_revoke(
    State(state): State<Arc<AppState>>,
    Json(req): Json<KeysRequest>,
) -> Json<Vec<BatchEntry<()>>> {
    let results = state.master.batch_put_revoke(&req.keys);
    Json(results.into_iter().map(batch_entry).collect())
}

pub async fn remove(
    State(state): State<Arc<AppState>>,
    Json(req): Json<KeyRequest>,
) -> ApiResult<()> {
    state.master.remove(&req.key)?;
    Ok(Json(()))
}

#[derive(Serialize)]
pub struct RemoveAllResponse {
    pub removed: u64,
}

pub async fn remove_all(State(state): State<Arc<AppState>>) -> Json<RemoveAllResponse> {
    Json(RemoveAllResponse {
        removed: state.master.remove_all(),
    })
}

#[derive(Serialize)]
pub struct KeysResponse {
    pub keys: Vec<String>,
}

pub async fn get_all_keys(State(state): State<Arc<AppState>>) -> Json<KeysResponse> {
    Json(KeysResponse {
        keys: state.master.get_all_keys(),
    })
}

// ---- segment routes ----

#[derive(Deserialize)]
pub struct MountSegmentRequest {
    pub segment: Segment,
    pub client_id: ClientId,
}

pub async fn mount_segment(
    State(state): State<Arc<AppState>>,
    Json(req): Json<MountSegmentRequest>,
) -> ApiResult<()> {
    state.master.mount_segment(&req.segment, req.client_id)?;
    Ok(Json(()))
}

#[derive(Deserialize)]
pub struct ReMountSegmentRequest {
    pub segments: Vec<Segment>,
    pub client_id: ClientId,
}

pub async fn remount_segment(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ReMountSegmentRequest>,
) -> ApiResult<()> {
    state.master.remount_segments(&req.segments, req.client_id)?;
    Ok(Json(()))
}

#[derive(Deserialize)]
pub struct UnmountSegmentRequest {
    pub segment_id: SegmentId,
    pub client_id: ClientId,
}

pub async fn unmount_segment(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UnmountSegmentRequest>,
) -> ApiResult<()> {
    state.master.unmount_segment(req.segment_id, req.client_id)?;
    Ok(Json(()))
}

#[derive(Serialize)]
pub struct SegmentsResponse {
    pub segments: Vec<String>,
}

pub async fn get_all_segments(State(state): State<Arc<AppState>>) -> Json<SegmentsResponse> {
    Json(SegmentsResponse {
        segments: state.master.get_all_segments(),
    })
}

#[derive(Deserialize)]
pub struct QuerySegmentParams {
    pub name: String,
}

#[derive(Serialize)]
pub struct QuerySegmentResponse {
    pub used: u64,
    pub capacity: u64,
}

pub async fn query_segment(
    State(state): State<Arc<AppState>>,
    Query(params): Query<QuerySegmentParams>,
) -> ApiResult<QuerySegmentResponse> {
    let (used, capacity) = state.master.query_segment(&params.name)?;
    Ok(Json(QuerySegmentResponse { used, capacity }))
}

// ---- HA routes ----

#[derive(Deserialize)]
pub struct PingRequest {
    pub client_id: ClientId,
}

#[derive(Serialize)]
pub struct PingResponse {
    pub view_version: ViewVersion,
    pub status: ClientStatus,
}

pub async fn ping(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PingRequest>,
) -> ApiResult<PingResponse> {
    let (view_version, status) = state.master.ping(req.client_id)?;
    Ok(Json(PingResponse {
        view_version,
        status,
    }))
}

#[derive(Serialize)]
pub struct FsdirResponse {
    pub cluster_id: String,
}

pub async fn get_fsdir(State(state): State<Arc<AppState>>) -> ApiResult<FsdirResponse> {
    let cluster_id = state.master.get_fsdir()?;
    Ok(Json(FsdirResponse { cluster_id }))
}

// ---- metrics / health ----

pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.master.metrics().export_prometheus(),
    )
}

pub async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
