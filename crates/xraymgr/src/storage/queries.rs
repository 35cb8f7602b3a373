//! Identity queries.

use sqlx::SqliteConnection;
use xraymgr_core::db::unix_timestamp;

use super::db::{Database, DatabaseError};
use super::models::{FAR_FUTURE, Identity, IdentityStatus, StatusFilter};

fn new_secret() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Fetch an identity by `sub_id`, refusing deleted rows.
async fn fetch_live(conn: &mut SqliteConnection, sub_id: &str) -> Result<Identity, DatabaseError> {
    let identity = sqlx::query_as::<_, Identity>("SELECT * FROM identities WHERE sub_id = ?")
        .bind(sub_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("Identity {sub_id}")))?;

    if identity.is_deleted() {
        return Err(DatabaseError::NotFound(format!("Identity {sub_id} is deleted")));
    }
    Ok(identity)
}

impl Database {
    /// Issue a new active identity with fresh `sub_id` and secret.
    ///
    /// `expires_at` defaults to [`FAR_FUTURE`].
    pub async fn create_identity(
        &self,
        name: &str,
        expires_at: Option<i64>,
    ) -> Result<Identity, DatabaseError> {
        let sub_id = uuid::Uuid::new_v4().to_string();
        let now = unix_timestamp();

        sqlx::query(
            "INSERT INTO identities (sub_id, secret, name, status, created_at, expires_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&sub_id)
        .bind(new_secret())
        .bind(name)
        .bind(IdentityStatus::Active)
        .bind(now)
        .bind(expires_at.unwrap_or(FAR_FUTURE))
        .execute(self.pool())
        .await?;

        self.get_identity(&sub_id).await
    }

    /// Get an identity by its stable `sub_id`.
    pub async fn get_identity(&self, sub_id: &str) -> Result<Identity, DatabaseError> {
        sqlx::query_as::<_, Identity>("SELECT * FROM identities WHERE sub_id = ?")
            .bind(sub_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Identity {sub_id}")))
    }

    /// Resolve an identifier that is either a `sub_id` or a current secret.
    ///
    /// Retired secrets never match: only the row's current secret is stored.
    pub async fn lookup(&self, ident: &str) -> Result<Identity, DatabaseError> {
        sqlx::query_as::<_, Identity>(
            "SELECT * FROM identities WHERE sub_id = ? OR secret = ? ORDER BY id LIMIT 1",
        )
        .bind(ident)
        .bind(ident)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("Identity {ident}")))
    }

    /// Find the identity currently owning `secret`.
    pub async fn find_by_secret(&self, secret: &str) -> Result<Option<Identity>, DatabaseError> {
        let identity = sqlx::query_as::<_, Identity>("SELECT * FROM identities WHERE secret = ?")
            .bind(secret)
            .fetch_optional(self.pool())
            .await?;
        Ok(identity)
    }

    /// Replace the secret of a non-deleted identity.
    ///
    /// Returns `(old_secret, new_secret)`. Counters and status are untouched;
    /// the old secret stops resolving as soon as the transaction commits.
    pub async fn rotate_secret(&self, sub_id: &str) -> Result<(String, String), DatabaseError> {
        let mut tx = self.pool().begin().await?;
        let current = fetch_live(&mut tx, sub_id).await?;
        let fresh = new_secret();

        sqlx::query("UPDATE identities SET secret = ? WHERE sub_id = ?")
            .bind(&fresh)
            .bind(sub_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok((current.secret, fresh))
    }

    /// Change an identity's status.
    ///
    /// Deleting an already deleted identity is a no-op; any other transition
    /// out of `deleted` is refused.
    pub async fn set_status(
        &self,
        sub_id: &str,
        status: IdentityStatus,
    ) -> Result<Identity, DatabaseError> {
        let mut tx = self.pool().begin().await?;
        let current = sqlx::query_as::<_, Identity>("SELECT * FROM identities WHERE sub_id = ?")
            .bind(sub_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Identity {sub_id}")))?;

        if current.is_deleted() {
            if status == IdentityStatus::Deleted {
                return Ok(current);
            }
            return Err(DatabaseError::NotFound(format!("Identity {sub_id} is deleted")));
        }

        sqlx::query("UPDATE identities SET status = ? WHERE sub_id = ?")
            .bind(status)
            .bind(sub_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.get_identity(sub_id).await
    }

    /// Reactivate an identity, optionally issuing a new secret in the same
    /// statement.
    pub async fn resume(&self, sub_id: &str, rotate: bool) -> Result<Identity, DatabaseError> {
        let mut tx = self.pool().begin().await?;
        fetch_live(&mut tx, sub_id).await?;

        if rotate {
            sqlx::query("UPDATE identities SET status = ?, secret = ? WHERE sub_id = ?")
                .bind(IdentityStatus::Active)
                .bind(new_secret())
                .bind(sub_id)
                .execute(&mut *tx)
                .await?;
        } else {
            sqlx::query("UPDATE identities SET status = ? WHERE sub_id = ?")
                .bind(IdentityStatus::Active)
                .bind(sub_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        self.get_identity(sub_id).await
    }

    /// Update the display name.
    pub async fn rename(&self, sub_id: &str, name: &str) -> Result<Identity, DatabaseError> {
        let result =
            sqlx::query("UPDATE identities SET name = ? WHERE sub_id = ? AND status != 'deleted'")
                .bind(name)
                .bind(sub_id)
                .execute(self.pool())
                .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Identity {sub_id}")));
        }
        self.get_identity(sub_id).await
    }

    /// List identities in creation order.
    pub async fn list_identities(
        &self,
        filter: StatusFilter,
    ) -> Result<Vec<Identity>, DatabaseError> {
        let sql = match filter {
            StatusFilter::NotDeleted => {
                "SELECT * FROM identities WHERE status != 'deleted' ORDER BY id"
            }
            StatusFilter::ActiveOnly => {
                "SELECT * FROM identities WHERE status = 'active' ORDER BY id"
            }
            StatusFilter::All => "SELECT * FROM identities ORDER BY id",
        };
        let identities = sqlx::query_as::<_, Identity>(sql)
            .fetch_all(self.pool())
            .await?;
        Ok(identities)
    }

    /// Secrets admitted by the proxy: every non-deleted identity, paused
    /// ones included.
    pub async fn allow_list(&self) -> Result<Vec<String>, DatabaseError> {
        let secrets: Vec<(String,)> =
            sqlx::query_as("SELECT secret FROM identities WHERE status != 'deleted' ORDER BY id")
                .fetch_all(self.pool())
                .await?;
        Ok(secrets.into_iter().map(|(s,)| s).collect())
    }

    /// Add usage to the identity currently owning `secret`.
    ///
    /// Returns `false` when no identity owns the secret any more.
    pub async fn accumulate_traffic(
        &self,
        secret: &str,
        delta_up: i64,
        delta_down: i64,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE identities SET upload_bytes = upload_bytes + ?, download_bytes = download_bytes + ? WHERE secret = ?",
        )
        .bind(delta_up.max(0))
        .bind(delta_down.max(0))
        .bind(secret)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Latch the first-traffic flag. Returns `true` only for the call that
    /// flipped it.
    pub async fn mark_first_traffic_notified(&self, sub_id: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE identities SET first_traffic_notified = 1 WHERE sub_id = ? AND first_traffic_notified = 0",
        )
        .bind(sub_id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
