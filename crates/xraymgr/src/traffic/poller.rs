//! Periodic counter polling.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use super::CounterSource;
use crate::notify::{Notifier, NotifyEvent};
use crate::storage::{Database, DatabaseError, StatusFilter, TrafficDelta};

/// Per-cycle accounting summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub polled: usize,
    pub skipped: usize,
    pub bytes: i64,
}

/// Turns raw counters into durable per-identity totals.
///
/// Reading a counter and applying it happen under one lock, so a sample
/// never commits after a newer one for the same secret.
pub struct TrafficPoller {
    db: Database,
    counters: Arc<dyn CounterSource>,
    notifier: Arc<dyn Notifier>,
    sample_lock: Mutex<()>,
}

impl TrafficPoller {
    pub fn new(
        db: Database,
        counters: Arc<dyn CounterSource>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            db,
            counters,
            notifier,
            sample_lock: Mutex::new(()),
        }
    }

    /// Sample and account every non-deleted identity once. A failure for
    /// one identity is logged and counted as skipped.
    pub async fn poll_all(&self) -> Result<PollSummary, DatabaseError> {
        let identities = self.db.list_identities(StatusFilter::NotDeleted).await?;
        let mut summary = PollSummary::default();

        for identity in &identities {
            match self.refresh_identity(&identity.secret).await {
                Ok(Some(delta)) => {
                    summary.polled += 1;
                    summary.bytes = summary.bytes.saturating_add(delta.total());
                }
                Ok(None) => summary.skipped += 1,
                Err(e) => {
                    warn!(sub_id = %identity.sub_id, error = %e, "Traffic sample failed, skipping");
                    summary.skipped += 1;
                }
            }
        }
        Ok(summary)
    }

    /// Sample one secret and apply the result.
    ///
    /// Returns `None` when the counters could not be read (the cursor is
    /// left untouched) or the secret no longer belongs to anyone.
    pub async fn refresh_identity(&self, secret: &str) -> Result<Option<TrafficDelta>, DatabaseError> {
        let _guard = self.sample_lock.lock().await;
        let counters = match self.counters.read(secret).await {
            Ok(c) => c,
            Err(e) => {
                debug!(error = %e, "Counter read failed, skipping");
                return Ok(None);
            }
        };

        let Some(delta) = self
            .db
            .apply_traffic_sample(secret, counters.up, counters.down)
            .await?
        else {
            return Ok(None);
        };

        if delta.first_traffic {
            info!(sub_id = %delta.sub_id, bytes = delta.total(), "First traffic observed");
            self.notifier.emit(NotifyEvent::FirstTraffic {
                sub_id: delta.sub_id.clone(),
                bytes: delta.total(),
            });
        }
        Ok(Some(delta))
    }

    /// Poll on a fixed interval until shutdown.
    pub fn spawn(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        match self.poll_all().await {
                            Ok(s) => debug!(polled = s.polled, skipped = s.skipped, bytes = s.bytes, "Traffic poll complete"),
                            Err(e) => warn!(error = %e, "Traffic poll failed"),
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("Traffic poller shutting down");
                        return;
                    }
                }
            }
        })
    }
}
