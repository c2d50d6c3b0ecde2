//! API request handlers.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::Deserialize;

use crate::core::types::CronId;
use crate::service::{CreateCronRequest, CronService, PagingRequest, UpdateCronRequest};
use crate::storage::Storage;

use super::errors::ApiError;
use super::responses::{
    CronListResponse, CronResponse, EntryListResponse, HealthResponse, MessageResponse,
    ReloadResponse,
};

/// Shared application state for API handlers.
pub struct ApiState<S: Storage> {
    pub service: CronService<S>,
}

impl<S: Storage> Clone for ApiState<S> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
        }
    }
}

/// Query parameters for the list endpoint. List filters are
/// comma-separated.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ListCronsQuery {
    pub sources: Option<String>,
    pub yml_names: Option<String>,
    pub enabled: Option<bool>,
    pub definition_ids: Option<String>,
    pub cluster_name: Option<String>,
    pub page_no: i64,
    pub page_size: i64,
    pub get_all: bool,
}

fn split_list(value: Option<String>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

impl From<ListCronsQuery> for PagingRequest {
    fn from(query: ListCronsQuery) -> Self {
        PagingRequest {
            sources: split_list(query.sources),
            yml_names: split_list(query.yml_names),
            enabled: query.enabled,
            pipeline_definition_ids: split_list(query.definition_ids),
            cluster_name: query.cluster_name,
            page_no: query.page_no,
            page_size: query.page_size,
            get_all: query.get_all,
        }
    }
}

fn parse_id(raw: &str) -> Result<CronId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::InvalidParameter(format!("invalid cron id: {}", raw)))
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse::default())
}

/// List definitions.
pub async fn list_crons<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Query(query): Query<ListCronsQuery>,
) -> Result<Json<CronListResponse>, ApiError> {
    let page = state.service.paging(query.into()).await?;
    Ok(Json(CronListResponse::from(page)))
}

/// Create (or upsert) a definition.
pub async fn create_cron<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Json(req): Json<CreateCronRequest>,
) -> Result<(StatusCode, Json<CronResponse>), ApiError> {
    let def = state.service.create(req).await?;
    Ok((StatusCode::CREATED, Json(CronResponse::from(def))))
}

/// Get a definition.
pub async fn get_cron<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Path(id): Path<String>,
) -> Result<Json<CronResponse>, ApiError> {
    let id = parse_id(&id)?;
    let def = state
        .service
        .get(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("cron not found: {}", id)))?;
    Ok(Json(CronResponse::from(def)))
}

/// Update a definition.
pub async fn update_cron<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateCronRequest>,
) -> Result<Json<CronResponse>, ApiError> {
    let def = state.service.update(parse_id(&id)?, req).await?;
    Ok(Json(CronResponse::from(def)))
}

/// Delete a definition.
pub async fn delete_cron<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Path(id): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    let id = parse_id(&id)?;
    state.service.delete(id).await?;
    Ok(Json(MessageResponse {
        message: format!("cron {} deleted", id),
    }))
}

/// Enable a definition.
pub async fn start_cron<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Path(id): Path<String>,
) -> Result<Json<CronResponse>, ApiError> {
    let def = state.service.start(parse_id(&id)?).await?;
    Ok(Json(CronResponse::from(def)))
}

/// Disable a definition.
pub async fn stop_cron<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Path(id): Path<String>,
) -> Result<Json<CronResponse>, ApiError> {
    let def = state.service.stop(parse_id(&id)?).await?;
    Ok(Json(CronResponse::from(def)))
}

/// Entries of this replica's engine.
pub async fn list_entries<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
) -> Result<Json<EntryListResponse>, ApiError> {
    let entries = state.service.crond().crond_snapshot().await?;
    let count = entries.len();
    Ok(Json(EntryListResponse { entries, count }))
}

/// Rebuild this replica's engine from the store.
pub async fn reload_crond<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
) -> Result<Json<ReloadResponse>, ApiError> {
    let logs = state.service.crond().reload_crond().await?;
    Ok(Json(ReloadResponse { logs }))
}
