//! Data models for the credential store.

use std::fmt;

use serde::{Deserialize, Serialize};

/// `expires_at` used when billing is handled outside the control plane
/// (2099-12-31T00:00:00Z).
pub const FAR_FUTURE: i64 = 4_102_358_400;

/// Lifecycle state of an identity. `Deleted` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum IdentityStatus {
    Active,
    Paused,
    Deleted,
}

impl IdentityStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Deleted => "deleted",
        }
    }
}

impl fmt::Display for IdentityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One issued credential.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Identity {
    pub id: i64,
    pub sub_id: String,
    /// Current rotating credential presented to the proxy.
    pub secret: String,
    pub name: String,
    pub status: IdentityStatus,
    pub created_at: i64,
    pub expires_at: i64,
    pub upload_bytes: i64,
    pub download_bytes: i64,
    /// 0 means unlimited.
    pub total_quota_bytes: i64,
    pub first_traffic_notified: bool,
}

impl Identity {
    pub const fn total_bytes(&self) -> i64 {
        self.upload_bytes.saturating_add(self.download_bytes)
    }

    pub fn is_deleted(&self) -> bool {
        self.status == IdentityStatus::Deleted
    }
}

/// Last raw runtime counters observed for a secret.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TrafficCursor {
    pub secret: String,
    pub last_up: i64,
    pub last_down: i64,
    pub updated_at: i64,
}

/// Outcome of applying one counter sample to an identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficDelta {
    pub sub_id: String,
    pub up: i64,
    pub down: i64,
    /// Set exactly once per identity: the first positive delta on an
    /// identity that had no traffic and was never notified.
    pub first_traffic: bool,
}

impl TrafficDelta {
    pub const fn total(&self) -> i64 {
        self.up.saturating_add(self.down)
    }
}

/// Row selection for [`Database::list_identities`](super::Database::list_identities).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFilter {
    /// Everything except `deleted` (the admitted set).
    NotDeleted,
    /// Only `active`.
    ActiveOnly,
    /// Every row, including audit-retained deletions.
    All,
}
