//! `GET /sessions`: snapshot report with optional enforcement.

use std::collections::BTreeMap;

use axum::Json;
use axum::extract::{Query, State};
use serde::{Deserialize, Deserializer, Serialize, de};

use super::AppState;
use super::error::ApiError;
use crate::sessions::{SessionQuery, SessionReport, Thresholds};

#[derive(Debug, Deserialize)]
pub struct SessionsParams {
    #[serde(default, deserialize_with = "flag")]
    pub kick: bool,
    #[serde(default = "default_min_sessions")]
    pub min_sessions: usize,
    pub window: Option<u64>,
    #[serde(default)]
    pub limit: usize,
    #[serde(default, deserialize_with = "flag")]
    pub include_ips: bool,
    #[serde(default = "default_distinct_ips_min")]
    pub distinct_ips_min: usize,
}

/// Query-string boolean: `1`/`0` as well as `true`/`false`.
fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(de::Error::custom(format!("invalid boolean: {other}"))),
    }
}

const fn default_min_sessions() -> usize {
    2
}

const fn default_distinct_ips_min() -> usize {
    2
}

impl SessionsParams {
    fn to_query(&self, default_window: u64) -> Result<SessionQuery, ApiError> {
        if self.min_sessions < 2 {
            return Err(ApiError::BadRequest("min_sessions must be >= 2".to_string()));
        }
        if self.distinct_ips_min < 1 {
            return Err(ApiError::BadRequest("distinct_ips_min must be >= 1".to_string()));
        }
        let window = self.window.unwrap_or(default_window);
        if window < 5 {
            return Err(ApiError::BadRequest("window must be >= 5".to_string()));
        }
        Ok(SessionQuery {
            window,
            thresholds: Thresholds {
                min_sessions: self.min_sessions,
                distinct_ips_min: self.distinct_ips_min,
            },
            kick: self.kick,
            limit: self.limit,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct SessionItem {
    pub uuid: String,
    pub sessions: usize,
    pub last_ts: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ips: Option<BTreeMap<String, usize>>,
}

#[derive(Debug, Serialize)]
pub struct OffenderItem {
    pub uuid: String,
    pub sub_id: String,
    pub name: String,
    pub sessions: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ips: Option<BTreeMap<String, usize>>,
}

#[derive(Debug, Serialize)]
pub struct KickItem {
    pub ok: bool,
    pub sub_id: String,
    pub old_uuid: String,
    pub new_uuid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SessionsResponse {
    pub ts: i64,
    pub window: u64,
    pub threshold: usize,
    pub items: Vec<SessionItem>,
    pub offenders: Vec<OffenderItem>,
    pub kicked: Vec<KickItem>,
}

impl SessionsResponse {
    fn from_report(report: SessionReport, threshold: usize, include_ips: bool) -> Self {
        let items = report
            .snapshot
            .into_iter()
            .map(|(uuid, entry)| SessionItem {
                uuid,
                sessions: entry.count,
                last_ts: entry.last_ts,
                ips: include_ips.then_some(entry.ips),
            })
            .collect();
        let offenders = report
            .offenders
            .into_iter()
            .map(|o| OffenderItem {
                uuid: o.secret,
                sub_id: o.sub_id,
                name: o.name,
                sessions: o.entry.count,
                ips: include_ips.then_some(o.entry.ips),
            })
            .collect();
        let kicked = report
            .kicked
            .into_iter()
            .map(|k| KickItem {
                ok: k.is_published(),
                sub_id: k.sub_id,
                old_uuid: k.old_secret,
                new_uuid: k.new_secret,
                error: k.error,
            })
            .collect();

        Self {
            ts: report.ts,
            window: report.window,
            threshold,
            items,
            offenders,
            kicked,
        }
    }
}

pub async fn sessions(
    State(state): State<AppState>,
    Query(params): Query<SessionsParams>,
) -> Result<Json<SessionsResponse>, ApiError> {
    let query = params.to_query(state.default_window)?;
    let report = state.sessions.evaluate(query).await?;
    Ok(Json(SessionsResponse::from_report(
        report,
        params.min_sessions,
        params.include_ips,
    )))
}
