//! `GET /sub/{id}`: subscription document for client apps.

use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use tracing::warn;

use super::AppState;
use super::error::ApiError;

/// Seconds clients should wait between subscription refreshes.
const PROFILE_UPDATE_INTERVAL: &str = "60";

#[derive(Debug, Deserialize)]
pub struct SubParams {
    #[serde(default = "default_b64")]
    pub b64: u8,
}

const fn default_b64() -> u8 {
    1
}

/// Refreshes the identity's usage first so the userinfo header is current.
pub async fn subscription(
    State(state): State<AppState>,
    Path(ident): Path<String>,
    Query(params): Query<SubParams>,
) -> Result<Response, ApiError> {
    let identity = state.db.lookup(ident.trim()).await?;
    if identity.is_deleted() {
        return Err(ApiError::NotFound("not found".to_string()));
    }

    if let Err(e) = state.traffic.refresh_identity(&identity.secret).await {
        warn!(sub_id = %identity.sub_id, error = %e, "Usage refresh failed, serving stored totals");
    }
    let identity = state.db.get_identity(&identity.sub_id).await?;

    let reality = state.links.reality_params().await?;
    let body = format!(
        "{}\n",
        state
            .links
            .connection_link(&reality, &identity.secret, &identity.name)
    );
    let body = if params.b64 == 0 {
        body
    } else {
        STANDARD.encode(body)
    };

    let userinfo = format!(
        "upload={}; download={}; total={}",
        identity.upload_bytes, identity.download_bytes, identity.total_quota_bytes
    );
    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
            (
                header::HeaderName::from_static("subscription-userinfo"),
                userinfo,
            ),
            (
                header::HeaderName::from_static("profile-update-interval"),
                PROFILE_UPDATE_INTERVAL.to_string(),
            ),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        body,
    )
        .into_response())
}
