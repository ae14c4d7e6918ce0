/// Certificate REST handlers
use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ApiResult, AppState};
use crate::orchestrator::{
    ApplyInput, CreateCertificateInput, MutationAck, ReapplyAutoInput, ReapplyManualAddInput,
    ReapplyManualApplyInput, TaskAck, UpdateManualAddInput, UpdateManualApplyInput,
};
use crate::types::{CertSource, CertStore, CertificateDetail, CertificateSummary};

fn default_limit() -> u32 {
    20
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub store: CertStore,
    #[serde(default)]
    pub offset: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub success: bool,
    pub total: u64,
    pub certificates: Vec<CertificateSummary>,
}

pub async fn list_certificates(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<ListResponse>> {
    let page = state
        .manager
        .list(query.store, query.offset, query.limit)
        .await?;
    Ok(Json(ListResponse {
        success: true,
        total: page.total,
        certificates: page.certificates,
    }))
}

#[derive(Debug, Serialize)]
pub struct DetailResponse {
    pub success: bool,
    pub certificate: CertificateDetail,
}

pub async fn get_certificate(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<DetailResponse>> {
    let certificate = state.manager.get(id).await?;
    Ok(Json(DetailResponse {
        success: true,
        certificate,
    }))
}

#[derive(Debug, Deserialize)]
pub struct DetailQuery {
    pub store: CertStore,
    pub domain: String,
    #[serde(default = "default_detail_source")]
    pub source: CertSource,
}

fn default_detail_source() -> CertSource {
    CertSource::Auto
}

pub async fn get_certificate_detail(
    State(state): State<AppState>,
    Query(query): Query<DetailQuery>,
) -> ApiResult<Json<DetailResponse>> {
    let certificate = state
        .manager
        .detail(query.store, &query.domain, query.source)
        .await?
        .ok_or_else(|| {
            crate::error::CertError::not_found(format!(
                "certificate not found: store='{}', domain='{}'",
                query.store, query.domain
            ))
        })?;
    Ok(Json(DetailResponse {
        success: true,
        certificate,
    }))
}

#[derive(Debug, Serialize)]
pub struct CreateResponse {
    pub success: bool,
    pub message: String,
    pub certificate: CertificateDetail,
}

pub async fn create_certificate(
    State(state): State<AppState>,
    Json(input): Json<CreateCertificateInput>,
) -> ApiResult<Json<CreateResponse>> {
    let certificate = state.manager.create_manual_add(input).await?;
    Ok(Json(CreateResponse {
        success: true,
        message: format!("Certificate created for domain '{}'", certificate.domain),
        certificate,
    }))
}

pub async fn update_manual_add_certificate(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(input): Json<UpdateManualAddInput>,
) -> ApiResult<Json<DetailResponse>> {
    let certificate = state.manager.update_manual_add(id, input).await?;
    Ok(Json(DetailResponse {
        success: true,
        certificate,
    }))
}

pub async fn update_manual_apply_certificate(
    State(state): State<AppState>,
    Json(input): Json<UpdateManualApplyInput>,
) -> ApiResult<Json<MutationAck>> {
    Ok(Json(state.manager.update_manual_apply(input).await?))
}

pub async fn delete_certificate(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<MutationAck>> {
    Ok(Json(state.manager.delete(id).await?))
}

pub async fn apply_certificate(
    State(state): State<AppState>,
    Json(input): Json<ApplyInput>,
) -> ApiResult<Json<TaskAck>> {
    Ok(Json(state.manager.apply(input).await?))
}

pub async fn reapply_auto_certificate(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(input): Json<ReapplyAutoInput>,
) -> ApiResult<Json<TaskAck>> {
    Ok(Json(state.manager.reapply_auto(id, input).await?))
}

pub async fn reapply_manual_apply_certificate(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(input): Json<ReapplyManualApplyInput>,
) -> ApiResult<Json<TaskAck>> {
    Ok(Json(state.manager.reapply_manual_apply(id, input).await?))
}

pub async fn reapply_manual_add_certificate(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(input): Json<ReapplyManualAddInput>,
) -> ApiResult<Json<TaskAck>> {
    Ok(Json(state.manager.reapply_manual_add(id, input).await?))
}

#[derive(Debug, Deserialize)]
pub struct SearchQueryParams {
    pub keyword: String,
    #[serde(default)]
    pub store: Option<CertStore>,
    #[serde(default)]
    pub source: Option<CertSource>,
    #[serde(default)]
    pub offset: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub success: bool,
    pub total: u64,
    pub items: Vec<CertificateSummary>,
}

pub async fn search_certificates(
    State(state): State<AppState>,
    Query(query): Query<SearchQueryParams>,
) -> ApiResult<Json<SearchResponse>> {
    let (items, total) = state
        .manager
        .search(
            &query.keyword,
            query.store,
            query.source,
            query.offset,
            query.limit,
        )
        .await?;
    Ok(Json(SearchResponse {
        success: true,
        total,
        items,
    }))
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub store: CertStore,
    #[serde(default = "default_trigger")]
    pub trigger: String,
}

fn default_trigger() -> String {
    crate::events::trigger::MANUAL.to_string()
}

/// Emit-only: the worker role performs the import.
pub async fn publish_refresh(
    State(state): State<AppState>,
    Json(request): Json<RefreshRequest>,
) -> ApiResult<Json<MutationAck>> {
    state.manager.refresh(request.store, &request.trigger).await?;
    Ok(Json(MutationAck {
        success: true,
        message: format!("Refresh event published for store '{}'", request.store),
    }))
}

#[derive(Debug, Deserialize)]
pub struct InvalidateCacheRequest {
    pub stores: Vec<CertStore>,
    #[serde(default = "default_trigger")]
    pub trigger: String,
}

/// Emit-only: the worker role drops the cache keys.
pub async fn invalidate_cache(
    State(state): State<AppState>,
    Json(request): Json<InvalidateCacheRequest>,
) -> ApiResult<Json<MutationAck>> {
    state
        .manager
        .invalidate_cache(request.stores, &request.trigger)
        .await?;
    Ok(Json(MutationAck {
        success: true,
        message: "Cache invalidation event published".to_string(),
    }))
}
