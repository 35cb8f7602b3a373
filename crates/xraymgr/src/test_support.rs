//! Shared fakes for unit tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use xraymgr_core::config::{SlotConfig, SlotsConfig};

use crate::cmd::CmdError;
use crate::notify::{Notifier, NotifyEvent};
use crate::proxy::Synthesizer;
use crate::slots::{ConfigValidator, ProcessController, SlotSwitchController};
use crate::storage::Database;
use crate::traffic::{CounterError, CounterSource, Counters};

/// Captures emitted events instead of delivering them.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<NotifyEvent>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<NotifyEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn emit(&self, event: NotifyEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Counter values keyed by secret; unknown secrets fail like an
/// unreachable stats endpoint.
#[derive(Debug, Default)]
pub struct FakeCounters {
    values: Mutex<HashMap<String, Counters>>,
}

impl FakeCounters {
    pub fn set(&self, secret: &str, up: i64, down: i64) {
        self.values
            .lock()
            .unwrap()
            .insert(secret.to_string(), Counters { up, down });
    }

    pub fn clear(&self, secret: &str) {
        self.values.lock().unwrap().remove(secret);
    }
}

#[async_trait]
impl CounterSource for FakeCounters {
    async fn read(&self, secret: &str) -> Result<Counters, CounterError> {
        self.values
            .lock()
            .unwrap()
            .get(secret)
            .copied()
            .ok_or_else(|| CounterError::Unavailable(secret.to_string()))
    }
}

/// Restarts nothing; readiness is controlled by `never_ready`.
#[derive(Debug, Default)]
pub struct FakeProcess {
    pub restarts: Mutex<Vec<String>>,
    pub never_ready: AtomicBool,
}

#[async_trait]
impl ProcessController for FakeProcess {
    async fn restart(&self, slot: &SlotConfig) -> Result<(), CmdError> {
        self.restarts.lock().unwrap().push(slot.unit.clone());
        Ok(())
    }

    async fn is_healthy(&self, _slot: &SlotConfig, _timeout: Duration) -> bool {
        !self.never_ready.load(Ordering::SeqCst)
    }
}

/// Accepts every config unless `reject` is set.
#[derive(Debug, Default)]
pub struct FakeValidator {
    pub reject: AtomicBool,
}

#[async_trait]
impl ConfigValidator for FakeValidator {
    async fn validate(&self, config_path: &Path) -> Result<(), CmdError> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(CmdError::Timeout {
                cmd: format!("xray -test -config {}", config_path.display()),
                timeout: Duration::from_secs(10),
            });
        }
        Ok(())
    }
}

/// A switch controller writing into a temp dir, backed by fakes.
pub struct SwitchFixture {
    pub dir: tempfile::TempDir,
    pub slots: SlotsConfig,
    pub process: Arc<FakeProcess>,
    pub validator: Arc<FakeValidator>,
    pub controller: Arc<SlotSwitchController>,
}

pub const TEMPLATE: &str = r#"{
    "inbounds": [
        {"tag": "api-in", "protocol": "dokodemo-door"},
        {"tag": "vless-in", "protocol": "vless", "settings": {"clients": []},
         "streamSettings": {"security": "reality", "realitySettings": {
             "serverNames": ["www.example.com"], "shortIds": ["abcd"], "publicKey": "PBK"}}}
    ],
    "outbounds": [{"tag": "direct", "protocol": "freedom"}]
}"#;

pub fn switch_fixture(db: &Database, reality_tag: &str) -> SwitchFixture {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let template_path = root.join("template.json");
    std::fs::write(&template_path, TEMPLATE).unwrap();

    let mut slots = SlotsConfig {
        marker_path: root.join("active_slot"),
        readiness_attempts: 3,
        readiness_backoff_ms: 1,
        ..SlotsConfig::default()
    };
    slots.a.config_path = root.join("config-a.json");
    slots.b.config_path = root.join("config-b.json");
    slots.a.access_log = root.join("access-a.log");
    slots.b.access_log = root.join("access-b.log");

    let process = Arc::new(FakeProcess::default());
    let validator = Arc::new(FakeValidator::default());
    let controller = Arc::new(SlotSwitchController::new(
        db.clone(),
        template_path,
        Synthesizer::new(reality_tag, "api-in"),
        slots.clone(),
        process.clone(),
        validator.clone(),
    ));

    SwitchFixture {
        dir,
        slots,
        process,
        validator,
        controller,
    }
}
