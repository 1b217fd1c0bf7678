use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use serverbox_domain::{InstanceId, InstanceRecord, InstanceState, LifecycleIntervals, ProviderAuthEntry, ResourceSpec};
use serverbox_lifecycle::{CreateOptions, ListOptions};

use crate::error::ApiError;
use crate::state::AppState;

pub async fn healthz() -> Json<Value> {
    Json(json!({ "ok": true }))
}

fn serialize_record(record: &InstanceRecord, proxy_base_url: &str) -> Value {
    json!({
        "id": record.id,
        "sandboxId": record.sandbox_id,
        "state": record.state,
        "url": record.url,
        "previewToken": record.preview_token,
        "username": record.username,
        "providers": record.providers_copy(),
        "labels": record.labels_copy(),
        "createdAt": record.created_at,
        "updatedAt": record.updated_at,
        "proxyUrl": format!("{}/i/{}", proxy_base_url.trim_end_matches('/'), record.id),
    })
}

// ── Admin: instances ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstanceBody {
    pub id: Option<String>,
    pub auth: Option<Vec<ProviderAuthEntry>>,
    pub language: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub resources: ResourceSpec,
    #[serde(default)]
    pub lifecycle: LifecycleIntervals,
    pub upstream_config: Option<String>,
    pub timeout_ms: Option<u64>,
}

pub async fn create_instance(
    State(state): State<AppState>,
    body: axum::body::Bytes,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let body: CreateInstanceBody = if body.is_empty() {
        CreateInstanceBody::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::bad_request(format!("invalid request body: {e}")))?
    };
    let record = state
        .manager
        .create(CreateOptions {
            id: body.id,
            auth: body.auth,
            language: body.language,
            labels: body.labels,
            resources: body.resources,
            lifecycle: body.lifecycle,
            upstream_config: body.upstream_config,
            timeout_ms: body.timeout_ms,
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({ "instance": serialize_record(&record, &state.proxy_base_url) })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub refresh: Option<bool>,
    pub state: Option<String>,
}

pub async fn list_instances(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let filter_state = q
        .state
        .as_deref()
        .map(|s| match s {
            "provisioning" => Ok(InstanceState::Provisioning),
            "bootstrapping" => Ok(InstanceState::Bootstrapping),
            "running" => Ok(InstanceState::Running),
            "stopped" => Ok(InstanceState::Stopped),
            "archived" => Ok(InstanceState::Archived),
            "error" => Ok(InstanceState::Error),
            "destroyed" => Ok(InstanceState::Destroyed),
            other => Err(ApiError::bad_request(format!("unknown state '{other}'"))),
        })
        .transpose()?;

    let records = state
        .manager
        .list(ListOptions {
            state: filter_state,
            labels: HashMap::new(),
            refresh: q.refresh.unwrap_or(false),
        })
        .await?;

    let instances: Vec<Value> = records
        .iter()
        .map(|r| serialize_record(r, &state.proxy_base_url))
        .collect();
    let count = instances.len();
    Ok(Json(json!({ "instances": instances, "count": count })))
}

pub async fn get_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let record = state.manager.get(&InstanceId::new(id)).await?;
    Ok(Json(json!({ "instance": serialize_record(&record, &state.proxy_base_url) })))
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResumeBody {
    pub resume_timeout_ms: Option<u64>,
}

pub async fn resume_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: axum::body::Bytes,
) -> Result<Json<Value>, ApiError> {
    let parsed: ResumeBody = if body.is_empty() {
        ResumeBody::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::bad_request(format!("invalid request body: {e}")))?
    };
    let record = state
        .manager
        .resume(&InstanceId::new(id), parsed.resume_timeout_ms)
        .await?;
    Ok(Json(json!({ "instance": serialize_record(&record, &state.proxy_base_url) })))
}

pub async fn stop_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let record = state.manager.stop(&InstanceId::new(id)).await?;
    Ok(Json(json!({ "instance": serialize_record(&record, &state.proxy_base_url) })))
}

pub async fn archive_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let record = state.manager.archive(&InstanceId::new(id)).await?;
    Ok(Json(json!({ "instance": serialize_record(&record, &state.proxy_base_url) })))
}

pub async fn destroy_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.manager.destroy(&InstanceId::new(id.clone())).await?;
    Ok(Json(json!({ "ok": true, "id": id })))
}
