//! Abuse evaluation over session snapshots and credential kicks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};
use xraymgr_core::config::SessionConfig;
use xraymgr_core::db::unix_timestamp;

use super::tailer::{LogTailer, SessionEntry, SessionSnapshot};
use crate::notify::{Notifier, NotifyEvent, REASON_MULTI_SESSION};
use crate::slots::SlotSwitchController;
use crate::storage::{Database, DatabaseError};

#[derive(Debug, thiserror::Error)]
pub enum EnforceError {
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Offender thresholds. Both must be met.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub min_sessions: usize,
    pub distinct_ips_min: usize,
}

impl Thresholds {
    pub fn is_offending(&self, entry: &SessionEntry) -> bool {
        entry.count >= self.min_sessions && entry.ips.len() >= self.distinct_ips_min
    }
}

/// Secrets in `snapshot` that meet `thresholds`, in secret order.
pub fn offending_secrets<'a>(
    snapshot: &'a SessionSnapshot,
    thresholds: &Thresholds,
) -> Vec<(&'a str, &'a SessionEntry)> {
    snapshot
        .iter()
        .filter(|(_, entry)| thresholds.is_offending(entry))
        .map(|(secret, entry)| (secret.as_str(), entry))
        .collect()
}

#[derive(Debug, Clone, Copy)]
pub struct SessionQuery {
    pub window: u64,
    pub thresholds: Thresholds,
    pub kick: bool,
    /// Maximum kicks for this evaluation, 0 for no limit.
    pub limit: usize,
}

/// An offending secret resolved to its owner.
#[derive(Debug, Clone)]
pub struct Offender {
    pub secret: String,
    pub sub_id: String,
    pub name: String,
    pub entry: SessionEntry,
}

/// A committed rotation. `error` is set when the publish that should
/// have made it live failed; the next successful publish carries it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Kick {
    pub sub_id: String,
    pub old_secret: String,
    pub new_secret: String,
    pub error: Option<String>,
}

impl Kick {
    pub const fn is_published(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub ts: i64,
    pub window: u64,
    pub snapshot: SessionSnapshot,
    pub offenders: Vec<Offender>,
    pub kicked: Vec<Kick>,
}

/// Owns the tailer state and the per-identity kick cooldowns.
///
/// Shared by the background loop and ad-hoc `/sessions` requests; the
/// tailer is locked for the duration of a poll.
pub struct SessionMonitor {
    tailer: Mutex<LogTailer>,
    last_kick: Mutex<HashMap<String, i64>>,
    cooldown_secs: i64,
    db: Database,
    switch: Arc<SlotSwitchController>,
    notifier: Arc<dyn Notifier>,
}

impl SessionMonitor {
    pub fn new(
        tailer: LogTailer,
        cooldown: Duration,
        db: Database,
        switch: Arc<SlotSwitchController>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            tailer: Mutex::new(tailer),
            last_kick: Mutex::new(HashMap::new()),
            cooldown_secs: i64::try_from(cooldown.as_secs()).unwrap_or(i64::MAX),
            db,
            switch,
            notifier,
        }
    }

    pub async fn evaluate(&self, query: SessionQuery) -> Result<SessionReport, EnforceError> {
        self.evaluate_at(query, unix_timestamp()).await
    }

    /// Tail, find offenders and optionally kick them.
    pub async fn evaluate_at(
        &self,
        query: SessionQuery,
        now: i64,
    ) -> Result<SessionReport, EnforceError> {
        let snapshot = self.tailer.lock().await.poll_at(query.window, now).await;

        let mut offenders = Vec::new();
        for (secret, entry) in offending_secrets(&snapshot, &query.thresholds) {
            // The secret may have rotated since the line was logged.
            let Some(owner) = self.db.find_by_secret(secret).await? else {
                debug!(secret, "Offending secret has no owner, skipping");
                continue;
            };
            if owner.is_deleted() {
                continue;
            }
            offenders.push(Offender {
                secret: secret.to_string(),
                sub_id: owner.sub_id,
                name: owner.name,
                entry: entry.clone(),
            });
        }

        let mut kicked = Vec::new();
        if query.kick {
            self.prune_cooldowns(now).await;
            for offender in &offenders {
                if query.limit > 0 && kicked.len() >= query.limit {
                    break;
                }
                if self.cooling_down(&offender.sub_id, now).await {
                    debug!(sub_id = %offender.sub_id, "Kick cooldown active, skipping");
                    continue;
                }
                match self.kick(offender, now).await {
                    Ok(kick) => kicked.push(kick),
                    Err(e) => warn!(sub_id = %offender.sub_id, error = %e, "Kick rotation failed"),
                }
            }
        }

        Ok(SessionReport {
            ts: now,
            window: query.window,
            snapshot,
            offenders,
            kicked,
        })
    }

    async fn prune_cooldowns(&self, now: i64) {
        let cooldown = self.cooldown_secs;
        self.last_kick
            .lock()
            .await
            .retain(|_, at| now - *at < cooldown);
    }

    async fn cooling_down(&self, sub_id: &str, now: i64) -> bool {
        self.last_kick
            .lock()
            .await
            .get(sub_id)
            .is_some_and(|at| now - at < self.cooldown_secs)
    }

    /// Rotate the offender's secret, publish, then notify the bot.
    ///
    /// Only a failed rotation is an error. Once the store holds the new
    /// secret the bot is told about it even if the publish failed.
    async fn kick(&self, offender: &Offender, now: i64) -> Result<Kick, DatabaseError> {
        let (old_secret, new_secret) = self.db.rotate_secret(&offender.sub_id).await?;
        self.tailer.lock().await.forget(&old_secret);
        self.last_kick
            .lock()
            .await
            .insert(offender.sub_id.clone(), now);

        info!(
            sub_id = %offender.sub_id,
            sessions = offender.entry.count,
            distinct_ips = offender.entry.distinct_ips(),
            "Kicking shared credential"
        );
        let error = match self.switch.publish().await {
            Ok(_) => None,
            Err(e) => {
                warn!(sub_id = %offender.sub_id, error = %e, "Publish after kick failed, rotation kept");
                Some(e.to_string())
            }
        };

        self.notifier.emit(NotifyEvent::Kick {
            sub_id: offender.sub_id.clone(),
            old_secret: old_secret.clone(),
            new_secret: new_secret.clone(),
            reason: REASON_MULTI_SESSION.to_string(),
        });

        Ok(Kick {
            sub_id: offender.sub_id.clone(),
            old_secret,
            new_secret,
            error,
        })
    }

    /// Tail on a fixed interval until shutdown, enforcing only when
    /// `auto_kick` is set.
    pub fn spawn(
        self: Arc<Self>,
        config: SessionConfig,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let query = SessionQuery {
            window: config.window_secs,
            thresholds: Thresholds {
                min_sessions: config.min_sessions as usize,
                distinct_ips_min: config.distinct_ips_min as usize,
            },
            kick: config.auto_kick,
            limit: 0,
        };

        tokio::spawn(async move {
            let mut timer = tokio::time::interval(Duration::from_secs(config.interval_secs.max(1)));
            timer.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        match self.evaluate(query).await {
                            Ok(report) if !report.kicked.is_empty() => {
                                info!(kicked = report.kicked.len(), "Session enforcement cycle kicked credentials");
                            }
                            Ok(_) => {}
                            Err(e) => warn!(error = %e, "Session cycle failed"),
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("Session monitor shutting down");
                        return;
                    }
                }
            }
        })
    }
}
