//! HTTP handlers.
//!
//! Each handler turns a request into a coordinator call, waits for the task's
//! terminal state (bounded by the request deadline) and answers with the
//! [`TaskOutput`] as JSON.

use super::error::ApiError;
use crate::server::telemetry::{
    decrement_tasks_inflight, increment_tasks_failed, increment_tasks_inflight,
    increment_tasks_submitted, record_task_duration,
};
use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
};
use core::time::Duration;
use keystone::{
    Coordinator, Error, TaskKind, TaskOutput,
    schema::{CollectionSchema, Row},
    tasks::{DeleteRequest, InsertRequest, SearchRequest},
};
use serde::Deserialize;
use std::{future::Future, sync::Arc, time::Instant};

/// Per-request deadline in milliseconds; the configured default applies when
/// absent.
pub const TIMEOUT_HEADER: &str = "x-request-timeout-ms";

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
}

#[derive(Debug, Deserialize)]
pub struct PartitionBody {
    pub partition: String,
}

#[derive(Debug, Deserialize)]
pub struct InsertBody {
    #[serde(default)]
    pub partition: Option<String>,
    pub rows: Vec<Row>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteBody {
    #[serde(default)]
    pub partition: Option<String>,
    pub primary_keys: Vec<i64>,
}

#[derive(Debug, Deserialize)]
pub struct SearchBody {
    #[serde(default)]
    pub partitions: Vec<String>,
    pub field: String,
    pub vectors: Vec<Vec<f32>>,
    pub top_k: u32,
}

fn deadline(headers: &HeaderMap) -> Result<Option<Duration>, ApiError> {
    let Some(value) = headers.get(TIMEOUT_HEADER) else {
        return Ok(None);
    };
    let millis = value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|&ms| ms > 0)
        .ok_or_else(|| Error::ValidationFailed {
            reason: format!("{TIMEOUT_HEADER} must be a positive number of milliseconds"),
        })?;
    Ok(Some(Duration::from_millis(millis)))
}

/// Runs one coordinator call, recording metrics around it.
async fn observe(
    kind: TaskKind,
    call: impl Future<Output = keystone::Result<TaskOutput>>,
) -> Result<Json<TaskOutput>, ApiError> {
    let start = Instant::now();
    increment_tasks_submitted(kind);
    increment_tasks_inflight();
    let result = call.await;
    decrement_tasks_inflight();
    record_task_duration(kind, start.elapsed().as_secs_f64() * 1_000.0);

    match result {
        Ok(output) => Ok(Json(output)),
        Err(e) => {
            increment_tasks_failed(kind);
            #[cfg(feature = "tracing")]
            tracing::warn!(kind = %kind, "Request failed: {e}");
            Err(e.into())
        }
    }
}

#[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(collection = %schema.name)))]
pub async fn create_collection(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(schema): Json<CollectionSchema>,
) -> Result<Json<TaskOutput>, ApiError> {
    let deadline = deadline(&headers)?;
    observe(
        TaskKind::Ddl,
        state.coordinator.create_collection(schema, deadline),
    )
    .await
}

#[cfg_attr(feature = "tracing", tracing::instrument(skip(state, headers)))]
pub async fn drop_collection(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Json<TaskOutput>, ApiError> {
    let deadline = deadline(&headers)?;
    observe(TaskKind::Ddl, state.coordinator.drop_collection(&name, deadline)).await
}

#[cfg_attr(feature = "tracing", tracing::instrument(skip(state, headers, body)))]
pub async fn create_partition(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(body): Json<PartitionBody>,
) -> Result<Json<TaskOutput>, ApiError> {
    let deadline = deadline(&headers)?;
    observe(
        TaskKind::Ddl,
        state
            .coordinator
            .create_partition(&name, &body.partition, deadline),
    )
    .await
}

#[cfg_attr(feature = "tracing", tracing::instrument(skip(state, headers)))]
pub async fn drop_partition(
    State(state): State<AppState>,
    Path((name, partition)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<TaskOutput>, ApiError> {
    let deadline = deadline(&headers)?;
    observe(
        TaskKind::Ddl,
        state.coordinator.drop_partition(&name, &partition, deadline),
    )
    .await
}

#[cfg_attr(
    feature = "tracing",
    tracing::instrument(skip(state, headers, body), fields(rows = body.rows.len()))
)]
pub async fn insert(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(body): Json<InsertBody>,
) -> Result<Json<TaskOutput>, ApiError> {
    let deadline = deadline(&headers)?;
    let request = InsertRequest {
        collection: name,
        partition: body.partition,
        rows: body.rows,
    };
    observe(
        TaskKind::Manipulation,
        state.coordinator.insert(request, deadline),
    )
    .await
}

#[cfg_attr(
    feature = "tracing",
    tracing::instrument(skip(state, headers, body), fields(keys = body.primary_keys.len()))
)]
pub async fn delete(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(body): Json<DeleteBody>,
) -> Result<Json<TaskOutput>, ApiError> {
    let deadline = deadline(&headers)?;
    let request = DeleteRequest {
        collection: name,
        partition: body.partition,
        primary_keys: body.primary_keys,
    };
    observe(
        TaskKind::Manipulation,
        state.coordinator.delete(request, deadline),
    )
    .await
}

#[cfg_attr(
    feature = "tracing",
    tracing::instrument(skip(state, headers, body), fields(top_k = body.top_k))
)]
pub async fn search(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(body): Json<SearchBody>,
) -> Result<Json<TaskOutput>, ApiError> {
    let deadline = deadline(&headers)?;
    let request = SearchRequest {
        collection: name,
        partitions: body.partitions,
        field: body.field,
        vectors: body.vectors,
        top_k: body.top_k,
    };
    observe(TaskKind::Query, state.coordinator.search(request, deadline)).await
}

pub async fn healthz(State(state): State<AppState>) -> StatusCode {
    if state.coordinator.is_running() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
