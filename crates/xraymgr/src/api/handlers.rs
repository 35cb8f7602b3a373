//! Credential lifecycle endpoints.
//!
//! Every mutation that changes the allow-list publishes before answering,
//! so a success response means the live slot already serves the change.

use std::sync::LazyLock;

use axum::Json;
use axum::extract::State;
use chrono::{DateTime, SecondsFormat};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;
use xraymgr_core::db::unix_timestamp;

use super::AppState;
use super::error::ApiError;
use crate::links::RealityParams;
use crate::slots::SlotStatus;
use crate::storage::{Identity, IdentityStatus, StatusFilter};

/// Placeholder names the bot sends when the user has none.
#[allow(clippy::expect_used)]
static PLACEHOLDER_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^tg_\d+$").expect("static regex is valid"));

const SECS_PER_DAY: i64 = 86_400;

/// Name to store for a requested display name.
pub fn display_name(requested: Option<&str>, default: &str) -> String {
    let trimmed = requested.unwrap_or_default().trim();
    if trimmed.is_empty() || PLACEHOLDER_NAME.is_match(trimmed) {
        default.to_string()
    } else {
        trimmed.to_string()
    }
}

/// RFC 3339 rendering of a Unix timestamp.
pub fn rfc3339(ts: i64) -> String {
    DateTime::from_timestamp(ts, 0).map_or_else(
        || ts.to_string(),
        |dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true),
    )
}

/// Identity selector accepted by every mutation: `id`, `sub_id` or `uuid`,
/// each matching either the stable sub id or the current secret.
#[derive(Debug, Default, Deserialize)]
pub struct IdRequest {
    pub id: Option<String>,
    pub sub_id: Option<String>,
    pub uuid: Option<String>,
}

impl IdRequest {
    fn ident(&self) -> Result<&str, ApiError> {
        [&self.id, &self.sub_id, &self.uuid]
            .into_iter()
            .flatten()
            .map(|s| s.trim())
            .find(|s| !s.is_empty())
            .ok_or_else(|| ApiError::BadRequest("empty id/sub_id/uuid".to_string()))
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateRequest {
    pub name: Option<String>,
    pub days: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ResumeRequest {
    #[serde(flatten)]
    pub target: IdRequest,
    #[serde(default = "default_true")]
    pub rotate: bool,
}

const fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct SetNameRequest {
    #[serde(flatten)]
    pub target: IdRequest,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct CreateResponse {
    pub sub_id: String,
    pub uuid: String,
    pub name: String,
    pub expires_at: String,
    pub reality: String,
    pub sub_link: String,
}

#[derive(Debug, Serialize)]
pub struct LinkResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_id: Option<String>,
    pub uuid: String,
    pub reality: String,
    pub sub_link: String,
}

#[derive(Debug, Serialize)]
pub struct AckResponse {
    pub ok: bool,
    pub sub_id: String,
    pub uuid: String,
}

#[derive(Debug, Serialize)]
pub struct IdentityRecord {
    pub id: i64,
    pub sub_id: String,
    pub uuid: String,
    pub name: String,
    pub status: IdentityStatus,
    pub created_at: String,
    pub expires_at: String,
    pub upload_bytes: i64,
    pub download_bytes: i64,
    pub total_bytes: i64,
    pub total_quota_bytes: i64,
}

impl From<Identity> for IdentityRecord {
    fn from(i: Identity) -> Self {
        Self {
            total_bytes: i.total_bytes(),
            id: i.id,
            sub_id: i.sub_id,
            uuid: i.secret,
            name: i.name,
            status: i.status,
            created_at: rfc3339(i.created_at),
            expires_at: rfc3339(i.expires_at),
            upload_bytes: i.upload_bytes,
            download_bytes: i.download_bytes,
            total_quota_bytes: i.total_quota_bytes,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub slots: SlotStatus,
}

fn link_response(
    state: &AppState,
    params: &RealityParams,
    identity: &Identity,
    with_sub_id: bool,
) -> LinkResponse {
    LinkResponse {
        ok: true,
        sub_id: with_sub_id.then(|| identity.sub_id.clone()),
        uuid: identity.secret.clone(),
        reality: state
            .links
            .connection_link(params, &identity.secret, &identity.name),
        sub_link: state.links.sub_link(&identity.sub_id),
    }
}

/// `POST /create`
pub async fn create(
    State(state): State<AppState>,
    Json(req): Json<CreateRequest>,
) -> Result<Json<CreateResponse>, ApiError> {
    let expires_at = match req.days {
        Some(days) if days <= 0 => {
            return Err(ApiError::BadRequest("days must be positive".to_string()));
        }
        Some(days) => Some(unix_timestamp().saturating_add(days.saturating_mul(SECS_PER_DAY))),
        None => None,
    };
    let name = display_name(req.name.as_deref(), &state.links.config().default_name);
    let params = state.links.reality_params().await?;

    let identity = state.db.create_identity(&name, expires_at).await?;
    state.switch.publish().await?;
    info!(sub_id = %identity.sub_id, "Identity created");

    Ok(Json(CreateResponse {
        reality: state
            .links
            .connection_link(&params, &identity.secret, &identity.name),
        sub_link: state.links.sub_link(&identity.sub_id),
        expires_at: rfc3339(identity.expires_at),
        sub_id: identity.sub_id,
        uuid: identity.secret,
        name: identity.name,
    }))
}

/// `POST /refresh` and `POST /rotate`: issue a new secret.
pub async fn rotate(
    State(state): State<AppState>,
    Json(req): Json<IdRequest>,
) -> Result<Json<LinkResponse>, ApiError> {
    let ident = req.ident()?;
    let params = state.links.reality_params().await?;
    let identity = state.db.lookup(ident).await?;

    state.db.rotate_secret(&identity.sub_id).await?;
    state.switch.publish().await?;
    info!(sub_id = %identity.sub_id, "Secret rotated");

    let identity = state.db.get_identity(&identity.sub_id).await?;
    Ok(Json(link_response(&state, &params, &identity, false)))
}

/// `POST /revoke`: permanent. Revoking twice is acknowledged without a
/// second switch.
pub async fn revoke(
    State(state): State<AppState>,
    Json(req): Json<IdRequest>,
) -> Result<Json<AckResponse>, ApiError> {
    let identity = state.db.lookup(req.ident()?).await?;
    if !identity.is_deleted() {
        state
            .db
            .set_status(&identity.sub_id, IdentityStatus::Deleted)
            .await?;
        state.switch.publish().await?;
        info!(sub_id = %identity.sub_id, "Identity revoked");
    }
    Ok(Json(AckResponse {
        ok: true,
        sub_id: identity.sub_id,
        uuid: identity.secret,
    }))
}

/// `POST /pause`
pub async fn pause(
    State(state): State<AppState>,
    Json(req): Json<IdRequest>,
) -> Result<Json<AckResponse>, ApiError> {
    let identity = state.db.lookup(req.ident()?).await?;
    let identity = state
        .db
        .set_status(&identity.sub_id, IdentityStatus::Paused)
        .await?;
    state.switch.publish().await?;
    info!(sub_id = %identity.sub_id, "Identity paused");

    Ok(Json(AckResponse {
        ok: true,
        sub_id: identity.sub_id,
        uuid: identity.secret,
    }))
}

/// `POST /resume`: reactivate, rotating the secret unless `rotate=false`.
pub async fn resume(
    State(state): State<AppState>,
    Json(req): Json<ResumeRequest>,
) -> Result<Json<LinkResponse>, ApiError> {
    let ident = req.target.ident()?;
    let params = state.links.reality_params().await?;
    let identity = state.db.lookup(ident).await?;

    let identity = state.db.resume(&identity.sub_id, req.rotate).await?;
    state.switch.publish().await?;
    info!(sub_id = %identity.sub_id, rotated = req.rotate, "Identity resumed");

    Ok(Json(link_response(&state, &params, &identity, false)))
}

/// `POST /setname`: the allow-list is unchanged, so no switch.
pub async fn set_name(
    State(state): State<AppState>,
    Json(req): Json<SetNameRequest>,
) -> Result<Json<LinkResponse>, ApiError> {
    let ident = req.target.ident()?;
    let name = req.name.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("empty name".to_string()));
    }
    let params = state.links.reality_params().await?;
    let identity = state.db.lookup(ident).await?;
    let identity = state.db.rename(&identity.sub_id, name).await?;

    Ok(Json(link_response(&state, &params, &identity, true)))
}

/// `GET /list`: every non-deleted identity with its counters.
pub async fn list(State(state): State<AppState>) -> Result<Json<Vec<IdentityRecord>>, ApiError> {
    let identities = state.db.list_identities(StatusFilter::NotDeleted).await?;
    Ok(Json(identities.into_iter().map(IdentityRecord::from).collect()))
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        slots: state.switch.status().await,
    })
}
