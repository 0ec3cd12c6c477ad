//! Axum handlers. Thin wrappers: decode, call the service, wrap in the
//! envelope.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use segflow_core::types::{
    Attributes, Campaign, CampaignBehavior, ConfigDocument, EmailProvider, Event, Segment,
};
use segflow_services::{PushOutcome, Services};
use serde::{Deserialize, Serialize};

use crate::envelope::{success, ApiResult};

#[derive(Clone)]
pub struct ApiState {
    pub services: Arc<Services>,
    pub api_key: String,
}

#[derive(Deserialize)]
pub struct AttributesBody {
    #[serde(default)]
    pub attributes: Attributes,
}

#[derive(Deserialize)]
pub struct SegmentBody {
    pub evaluator: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignBody {
    pub flow: String,
    pub segments: Vec<String>,
    #[serde(default)]
    pub exclude_segments: Vec<String>,
    pub behavior: CampaignBehavior,
}

#[derive(Deserialize)]
pub struct TemplateBody {
    pub subject: String,
    pub html: String,
    #[serde(default)]
    pub preamble: String,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

// ─── Health ────────────────────────────────────────────────────────────────

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
    })
}

// ─── Users ─────────────────────────────────────────────────────────────────

pub async fn create_user(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<AttributesBody>,
) -> ApiResult<Attributes> {
    let user = state.services.create_user(&id, body.attributes)?;
    Ok(success(user.attributes))
}

pub async fn update_user(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<AttributesBody>,
) -> ApiResult<Attributes> {
    let user = state.services.update_user(&id, body.attributes)?;
    Ok(success(user.attributes))
}

pub async fn get_user(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Attributes> {
    let user = state.services.get_user(&id)?;
    Ok(success(user.attributes))
}

pub async fn delete_user(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<bool> {
    state.services.delete_user(&id)?;
    Ok(success(true))
}

// ─── Events ────────────────────────────────────────────────────────────────

pub async fn emit_event(
    State(state): State<ApiState>,
    Path((id, name)): Path<(String, String)>,
    Json(body): Json<AttributesBody>,
) -> ApiResult<Event> {
    let event = state.services.emit_event(&id, &name, body.attributes)?;
    Ok(success(event))
}

pub async fn list_user_events(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Vec<Event>> {
    Ok(success(state.services.list_user_events(&id)?))
}

// ─── Segments ──────────────────────────────────────────────────────────────

pub async fn create_segment(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<SegmentBody>,
) -> ApiResult<Segment> {
    Ok(success(state.services.create_segment(&id, &body.evaluator)?))
}

pub async fn update_segment(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<SegmentBody>,
) -> ApiResult<Segment> {
    Ok(success(state.services.update_segment(&id, &body.evaluator)?))
}

pub async fn delete_segment(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<bool> {
    state.services.delete_segment(&id)?;
    Ok(success(true))
}

pub async fn get_segment(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Segment> {
    Ok(success(state.services.get_segment(&id)?))
}

pub async fn list_segments(State(state): State<ApiState>) -> ApiResult<Vec<Segment>> {
    Ok(success(state.services.list_segments()?))
}

pub async fn list_segment_users(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Vec<String>> {
    Ok(success(state.services.list_segment_users(&id)?))
}

pub async fn list_user_segments(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Vec<String>> {
    Ok(success(state.services.list_user_segments(&id)?))
}

// ─── Campaigns ─────────────────────────────────────────────────────────────

pub async fn create_campaign(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<CampaignBody>,
) -> ApiResult<Campaign> {
    let campaign = state.services.create_campaign(
        &id,
        &body.flow,
        body.segments,
        body.exclude_segments,
        body.behavior,
    )?;
    Ok(success(campaign))
}

pub async fn delete_campaign(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<bool> {
    state.services.delete_campaign(&id)?;
    Ok(success(true))
}

pub async fn get_campaign(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Campaign> {
    Ok(success(state.services.get_campaign(&id)?))
}

pub async fn list_campaigns(State(state): State<ApiState>) -> ApiResult<Vec<Campaign>> {
    Ok(success(state.services.list_campaigns()?))
}

// ─── Templates ─────────────────────────────────────────────────────────────

pub async fn create_template(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<TemplateBody>,
) -> ApiResult<bool> {
    state
        .services
        .create_template(&id, &body.subject, &body.html, &body.preamble)?;
    Ok(success(true))
}

pub async fn update_template(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<TemplateBody>,
) -> ApiResult<bool> {
    state
        .services
        .update_template(&id, &body.subject, &body.html, &body.preamble)?;
    Ok(success(true))
}

pub async fn delete_template(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<bool> {
    state.services.delete_template(&id)?;
    Ok(success(true))
}

// ─── Email provider & config ───────────────────────────────────────────────

pub async fn set_email_config(
    State(state): State<ApiState>,
    Json(body): Json<EmailProvider>,
) -> ApiResult<bool> {
    state.services.set_email_provider(body)?;
    Ok(success(true))
}

pub async fn push_config(
    State(state): State<ApiState>,
    Json(body): Json<ConfigDocument>,
) -> ApiResult<serde_json::Value> {
    let value = match state.services.push_config(body)? {
        PushOutcome::NoChanges => serde_json::json!("no changes"),
        PushOutcome::Applied { config_id } => serde_json::json!(config_id),
    };
    Ok(success(value))
}
