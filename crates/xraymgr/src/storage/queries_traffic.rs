//! Traffic cursor queries and counter accounting.

use xraymgr_core::db::unix_timestamp;

use super::db::{Database, DatabaseError};
use super::models::{Identity, TrafficCursor, TrafficDelta};

/// Usage since the last observation of a monotonically growing runtime
/// counter.
///
/// A counter below its cursor means the runtime restarted and began again
/// from zero, so the whole current value is new usage. This over-counts if
/// a counter can shrink for any other reason.
pub const fn counter_delta(current: i64, last: i64) -> i64 {
    let delta = if current >= last { current - last } else { current };
    if delta < 0 { 0 } else { delta }
}

impl Database {
    /// Get the cursor for a secret, if one was ever written.
    pub async fn get_traffic_cursor(
        &self,
        secret: &str,
    ) -> Result<Option<TrafficCursor>, DatabaseError> {
        let cursor =
            sqlx::query_as::<_, TrafficCursor>("SELECT * FROM traffic_cursor WHERE secret = ?")
                .bind(secret)
                .fetch_optional(self.pool())
                .await?;
        Ok(cursor)
    }

    /// Apply one raw counter sample for `secret` in a single transaction.
    ///
    /// Adds the delta against the cursor to the owning identity's totals,
    /// overwrites the cursor with the raw values, and latches the
    /// first-traffic flag when this is the identity's first usage. Returns
    /// `None` when no identity owns `secret` (rotated away mid-poll).
    pub async fn apply_traffic_sample(
        &self,
        secret: &str,
        current_up: i64,
        current_down: i64,
    ) -> Result<Option<TrafficDelta>, DatabaseError> {
        let mut tx = self.pool().begin().await?;

        let Some(identity) =
            sqlx::query_as::<_, Identity>("SELECT * FROM identities WHERE secret = ?")
                .bind(secret)
                .fetch_optional(&mut *tx)
                .await?
        else {
            return Ok(None);
        };

        let cursor: Option<(i64, i64)> =
            sqlx::query_as("SELECT last_up, last_down FROM traffic_cursor WHERE secret = ?")
                .bind(secret)
                .fetch_optional(&mut *tx)
                .await?;
        let (last_up, last_down) = cursor.unwrap_or((0, 0));

        let up = counter_delta(current_up, last_up);
        let down = counter_delta(current_down, last_down);

        if up > 0 || down > 0 {
            sqlx::query(
                "UPDATE identities SET upload_bytes = upload_bytes + ?, download_bytes = download_bytes + ? WHERE id = ?",
            )
            .bind(up)
            .bind(down)
            .bind(identity.id)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "INSERT INTO traffic_cursor (secret, last_up, last_down, updated_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(secret) DO UPDATE SET last_up = excluded.last_up, last_down = excluded.last_down, updated_at = excluded.updated_at",
        )
        .bind(secret)
        .bind(current_up.max(0))
        .bind(current_down.max(0))
        .bind(unix_timestamp())
        .execute(&mut *tx)
        .await?;

        let mut first_traffic = false;
        if identity.total_bytes() == 0 && up.saturating_add(down) > 0 && !identity.first_traffic_notified {
            let latched = sqlx::query(
                "UPDATE identities SET first_traffic_notified = 1 WHERE id = ? AND first_traffic_notified = 0",
            )
            .bind(identity.id)
            .execute(&mut *tx)
            .await?;
            first_traffic = latched.rows_affected() > 0;
        }

        tx.commit().await?;

        Ok(Some(TrafficDelta {
            sub_id: identity.sub_id,
            up,
            down,
            first_traffic,
        }))
    }
}
