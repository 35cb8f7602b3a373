//! Blue/green publication of the allow-list.
//!
//! Every publish targets the idle slot: synthesize its configuration,
//! validate it, restart it, wait for readiness, then flip the marker. The
//! active slot is never touched, so a failure anywhere before the flip
//! leaves clients on the previous configuration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tracing::{info, warn};
use xraymgr_core::config::{SlotConfig, SlotsConfig};
use xraymgr_core::db::unix_timestamp;

use super::marker::{Slot, read_marker, write_atomic, write_marker};
use super::process::{ConfigValidator, ProcessController};
use crate::cmd;
use crate::proxy::{ProxyConfigError, Synthesizer, load_template};
use crate::storage::{Database, DatabaseError};

/// Upper bound for the optional promote hook.
const PROMOTE_HOOK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum SwitchError {
    #[error("Template error: {0}")]
    Template(#[from] ProxyConfigError),

    #[error("Failed to write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration for slot {slot} rejected: {reason}")]
    ConfigInvalid { slot: Slot, reason: String },

    #[error("Restart of slot {slot} failed: {reason}")]
    Restart { slot: Slot, reason: String },

    #[error("Slot {slot} not ready after {attempts} probes")]
    SlotPromotionTimeout { slot: Slot, attempts: u32 },

    #[error("Promote hook for slot {slot} failed: {reason}")]
    PromoteHook { slot: Slot, reason: String },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Where the controller is within a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotPhase {
    Idle,
    Configuring,
    Validating,
    Restarting,
    HealthChecking,
    Promoted,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct SlotStatus {
    pub active: Slot,
    /// Slot the current or most recent publish worked on.
    pub target: Option<Slot>,
    pub phase: SlotPhase,
    pub last_switch_at: Option<i64>,
    pub last_error: Option<String>,
}

/// Result of a successful publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOutcome {
    pub previous: Slot,
    pub active: Slot,
    pub clients: usize,
}

struct Progress {
    target: Option<Slot>,
    phase: SlotPhase,
    last_switch_at: Option<i64>,
    last_error: Option<String>,
}

pub struct SlotSwitchController {
    db: Database,
    template_path: PathBuf,
    synth: Synthesizer,
    slots: SlotsConfig,
    process: Arc<dyn ProcessController>,
    validator: Arc<dyn ConfigValidator>,
    publish_lock: Mutex<()>,
    progress: watch::Sender<Progress>,
}

impl SlotSwitchController {
    pub fn new(
        db: Database,
        template_path: PathBuf,
        synth: Synthesizer,
        slots: SlotsConfig,
        process: Arc<dyn ProcessController>,
        validator: Arc<dyn ConfigValidator>,
    ) -> Self {
        let (progress, _) = watch::channel(Progress {
            target: None,
            phase: SlotPhase::Idle,
            last_switch_at: None,
            last_error: None,
        });
        Self {
            db,
            template_path,
            synth,
            slots,
            process,
            validator,
            publish_lock: Mutex::new(()),
            progress,
        }
    }

    pub const fn slot_config(&self, slot: Slot) -> &SlotConfig {
        match slot {
            Slot::A => &self.slots.a,
            Slot::B => &self.slots.b,
        }
    }

    pub async fn active_slot(&self) -> Slot {
        read_marker(&self.slots.marker_path).await
    }

    pub async fn status(&self) -> SlotStatus {
        let active = self.active_slot().await;
        let progress = self.progress.borrow();
        SlotStatus {
            active,
            target: progress.target,
            phase: progress.phase,
            last_switch_at: progress.last_switch_at,
            last_error: progress.last_error.clone(),
        }
    }

    fn set_phase(&self, phase: SlotPhase) {
        self.progress.send_modify(|p| p.phase = phase);
    }

    /// Publish the current allow-list to the idle slot and make it active.
    ///
    /// Calls are serialized; a second caller waits and then performs its own
    /// switch from whatever slot the first one left active.
    pub async fn publish(&self) -> Result<PublishOutcome, SwitchError> {
        let _guard = self.publish_lock.lock().await;

        let previous = self.active_slot().await;
        let target = previous.other();
        info!(from = %previous, to = %target, "Publishing allow-list");
        self.progress.send_modify(|p| p.target = Some(target));

        match self.switch_to(target).await {
            Ok(clients) => {
                self.progress.send_modify(|p| {
                    p.phase = SlotPhase::Promoted;
                    p.last_switch_at = Some(unix_timestamp());
                    p.last_error = None;
                });
                info!(active = %target, clients, "Slot promoted");
                Ok(PublishOutcome {
                    previous,
                    active: target,
                    clients,
                })
            }
            Err(e) => {
                warn!(active = %previous, target = %target, error = %e, "Publish failed, active slot unchanged");
                self.progress.send_modify(|p| {
                    p.phase = SlotPhase::Failed;
                    p.last_error = Some(e.to_string());
                });
                Err(e)
            }
        }
    }

    async fn switch_to(&self, target: Slot) -> Result<usize, SwitchError> {
        let slot = self.slot_config(target);

        self.set_phase(SlotPhase::Configuring);
        let secrets = self.db.allow_list().await?;
        let template = load_template(&self.template_path).await?;
        let doc = self.synth.build(&template, slot, &secrets)?;
        let rendered = serde_json::to_vec_pretty(&doc).map_err(ProxyConfigError::from)?;
        write_atomic(&slot.config_path, &rendered)
            .await
            .map_err(|source| SwitchError::Io {
                path: slot.config_path.display().to_string(),
                source,
            })?;

        self.set_phase(SlotPhase::Validating);
        self.validator
            .validate(&slot.config_path)
            .await
            .map_err(|e| SwitchError::ConfigInvalid {
                slot: target,
                reason: e.to_string(),
            })?;

        self.set_phase(SlotPhase::Restarting);
        self.process
            .restart(slot)
            .await
            .map_err(|e| SwitchError::Restart {
                slot: target,
                reason: e.to_string(),
            })?;

        self.set_phase(SlotPhase::HealthChecking);
        self.wait_ready(target).await?;

        if let Some((program, args)) = self.slots.promote_hook.as_deref().and_then(<[_]>::split_first) {
            let mut args: Vec<&str> = args.iter().map(String::as_str).collect();
            args.push(target.letter());
            cmd::run_checked(
                &format!("Running promote hook for slot {target}"),
                program,
                &args,
                PROMOTE_HOOK_TIMEOUT,
            )
            .await
            .map_err(|e| SwitchError::PromoteHook {
                slot: target,
                reason: e.to_string(),
            })?;
        }

        write_marker(&self.slots.marker_path, target)
            .await
            .map_err(|source| SwitchError::Io {
                path: self.slots.marker_path.display().to_string(),
                source,
            })?;

        Ok(secrets.len())
    }

    async fn wait_ready(&self, target: Slot) -> Result<(), SwitchError> {
        let slot = self.slot_config(target);
        let attempts = self.slots.readiness_attempts.max(1);
        let probe_timeout = Duration::from_millis(self.slots.probe_timeout_ms);
        let backoff = Duration::from_millis(self.slots.readiness_backoff_ms);

        for attempt in 1..=attempts {
            if self.process.is_healthy(slot, probe_timeout).await {
                tracing::debug!(slot = %target, attempt, "Slot ready");
                return Ok(());
            }
            if attempt < attempts {
                tokio::time::sleep(backoff).await;
            }
        }
        Err(SwitchError::SlotPromotionTimeout {
            slot: target,
            attempts,
        })
    }
}
