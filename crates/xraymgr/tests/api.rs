#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};
use tower::ServiceExt;

use xraymgr::api::{AppState, build_router};
use xraymgr::cmd::CmdError;
use xraymgr::links::LinkBuilder;
use xraymgr::notify::{Notifier, NotifyEvent};
use xraymgr::proxy::Synthesizer;
use xraymgr::sessions::{LogTailer, SessionMonitor};
use xraymgr::slots::{ConfigValidator, ProcessController, SlotSwitchController};
use xraymgr::storage::Database;
use xraymgr::traffic::{CounterError, CounterSource, Counters, TrafficPoller};
use xraymgr_core::config::{LinkConfig, SlotConfig, SlotsConfig};

const TEMPLATE: &str = r#"{
    "inbounds": [
        {"tag": "api-in", "protocol": "dokodemo-door"},
        {"tag": "vless-in", "protocol": "vless", "settings": {"clients": []},
         "streamSettings": {"security": "reality", "realitySettings": {
             "serverNames": ["www.example.com"], "shortIds": ["abcd"], "publicKey": "PBK"}}}
    ],
    "outbounds": [{"tag": "direct", "protocol": "freedom"}]
}"#;

#[derive(Default)]
struct Process {
    restarts: Mutex<Vec<String>>,
    broken: AtomicBool,
}

#[async_trait]
impl ProcessController for Process {
    async fn restart(&self, slot: &SlotConfig) -> Result<(), CmdError> {
        self.restarts.lock().unwrap().push(slot.unit.clone());
        Ok(())
    }

    async fn is_healthy(&self, _slot: &SlotConfig, _timeout: Duration) -> bool {
        !self.broken.load(Ordering::SeqCst)
    }
}

struct AcceptAll;

#[async_trait]
impl ConfigValidator for AcceptAll {
    async fn validate(&self, _config_path: &Path) -> Result<(), CmdError> {
        Ok(())
    }
}

#[derive(Default)]
struct Counts(Mutex<Vec<(String, Counters)>>);

#[async_trait]
impl CounterSource for Counts {
    async fn read(&self, secret: &str) -> Result<Counters, CounterError> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .find(|(s, _)| s == secret)
            .map(|(_, c)| *c)
            .ok_or_else(|| CounterError::Unavailable(secret.to_string()))
    }
}

#[derive(Default)]
struct Recorder(Mutex<Vec<NotifyEvent>>);

impl Notifier for Recorder {
    fn emit(&self, event: NotifyEvent) {
        self.0.lock().unwrap().push(event);
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    slots: SlotsConfig,
    process: Arc<Process>,
    counters: Arc<Counts>,
    notifier: Arc<Recorder>,
    app: axum::Router,
}

impl Harness {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let template_path = root.join("template.json");
        std::fs::write(&template_path, TEMPLATE).unwrap();

        let mut slots = SlotsConfig {
            marker_path: root.join("active_slot"),
            readiness_attempts: 2,
            readiness_backoff_ms: 1,
            ..SlotsConfig::default()
        };
        slots.a.config_path = root.join("config-a.json");
        slots.b.config_path = root.join("config-b.json");
        slots.a.access_log = root.join("access-a.log");
        slots.b.access_log = root.join("access-b.log");

        let db = Database::open_in_memory().await.unwrap();
        let process = Arc::new(Process::default());
        let counters = Arc::new(Counts::default());
        let notifier = Arc::new(Recorder::default());

        let switch = Arc::new(SlotSwitchController::new(
            db.clone(),
            template_path.clone(),
            Synthesizer::new("vless-in", "api-in"),
            slots.clone(),
            process.clone(),
            Arc::new(AcceptAll),
        ));
        let traffic = Arc::new(TrafficPoller::new(
            db.clone(),
            counters.clone(),
            notifier.clone(),
        ));
        let sessions = Arc::new(SessionMonitor::new(
            LogTailer::new(vec![slots.a.access_log.clone(), slots.b.access_log.clone()]),
            Duration::from_secs(60),
            db.clone(),
            Arc::clone(&switch),
            notifier.clone(),
        ));
        let links = Arc::new(LinkBuilder::new(
            LinkConfig {
                domain: "vpn.example.net".to_string(),
                default_name: "NL".to_string(),
                ..LinkConfig::default()
            },
            template_path,
            "vless-in".to_string(),
        ));

        let app = build_router(AppState {
            db,
            switch,
            links,
            sessions,
            traffic,
            default_window: 45,
        });

        Self {
            _dir: dir,
            slots,
            process,
            counters,
            notifier,
            app,
        }
    }

    /// Send a request and return (status, headers, body text).
    async fn send(
        &self,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, axum::http::HeaderMap, String) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(v) => builder
                .header("content-type", "application/json")
                .body(Body::from(v.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let resp = self.app.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, headers, String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        let (status, _, text) = self.send("POST", uri, Some(body)).await;
        (status, serde_json::from_str(&text).unwrap_or(Value::Null))
    }

    async fn get_json(&self, uri: &str) -> (StatusCode, Value) {
        let (status, _, text) = self.send("GET", uri, None).await;
        (status, serde_json::from_str(&text).unwrap_or(Value::Null))
    }

    async fn create(&self, name: &str) -> Value {
        let (status, body) = self.post("/create", json!({ "name": name })).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        body
    }

    fn active_config(&self) -> String {
        let marker = std::fs::read_to_string(&self.slots.marker_path).unwrap();
        let path = if marker.trim() == "B" {
            &self.slots.b.config_path
        } else {
            &self.slots.a.config_path
        };
        std::fs::read_to_string(path).unwrap()
    }

    fn restarts(&self) -> usize {
        self.process.restarts.lock().unwrap().len()
    }

    fn append_log(&self, lines: &[String]) {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.slots.a.access_log)
            .unwrap();
        for line in lines {
            writeln!(f, "{line}").unwrap();
        }
    }
}

fn access_line(ip: &str, secret: &str) -> String {
    format!(
        "{} from {ip}:51000 accepted tcp:www.google.com:443 [vless-in -> direct] email: {secret}",
        chrono::Local::now().format("%Y/%m/%d %H:%M:%S")
    )
}

#[tokio::test]
async fn create_publishes_and_returns_links() {
    let h = Harness::new().await;
    let body = h.create("Alice").await;

    let uuid = body["uuid"].as_str().unwrap();
    let sub_id = body["sub_id"].as_str().unwrap();
    assert_eq!(body["name"], "Alice");
    assert_eq!(body["expires_at"], "2099-12-31T00:00:00Z");

    let reality = body["reality"].as_str().unwrap();
    assert!(reality.starts_with(&format!("vless://{uuid}@vpn.example.net:443?")));
    assert!(reality.contains("sni=www.example.com"));
    assert!(reality.contains("pbk=PBK"));
    assert!(reality.contains("sid=abcd"));
    assert!(reality.ends_with("#Alice"));
    assert_eq!(
        body["sub_link"],
        format!("https://vpn.example.net:8443/api/sub/{sub_id}?b64=1")
    );

    assert_eq!(h.restarts(), 1);
    assert!(h.active_config().contains(uuid));
}

#[tokio::test]
async fn create_rejects_non_positive_days() {
    let h = Harness::new().await;
    let (status, body) = h.post("/create", json!({ "days": 0 })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["detail"].is_string());
    assert_eq!(h.restarts(), 0);
}

#[tokio::test]
async fn placeholder_name_falls_back_to_default_label() {
    let h = Harness::new().await;
    let body = h.create("tg_123456").await;
    assert_eq!(body["name"], "NL");
    assert!(body["reality"].as_str().unwrap().ends_with("#NL"));
}

#[tokio::test]
async fn rotate_keeps_sub_id_and_drops_old_secret() {
    let h = Harness::new().await;
    let created = h.create("Bob").await;
    let old = created["uuid"].as_str().unwrap().to_string();
    let sub_id = created["sub_id"].as_str().unwrap().to_string();

    let (status, body) = h.post("/rotate", json!({ "sub_id": sub_id })).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let new = body["uuid"].as_str().unwrap();
    assert_ne!(new, old);
    assert!(body["sub_link"].as_str().unwrap().contains(&sub_id));

    let config = h.active_config();
    assert!(config.contains(new));
    assert!(!config.contains(&old));

    // The legacy path rotates too, and the new secret is accepted as an id.
    let (status, body) = h.post("/refresh", json!({ "uuid": new })).await;
    assert_eq!(status, StatusCode::OK);
    assert_ne!(body["uuid"], new);
}

#[tokio::test]
async fn unknown_and_empty_identifiers() {
    let h = Harness::new().await;
    let (status, body) = h.post("/rotate", json!({ "id": "nope" })).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["detail"], "not found");

    let (status, _) = h.post("/pause", json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(h.restarts(), 0);
}

#[tokio::test]
async fn pause_resume_and_revoke_lifecycle() {
    let h = Harness::new().await;
    let created = h.create("Carol").await;
    let sub_id = created["sub_id"].as_str().unwrap().to_string();
    let uuid = created["uuid"].as_str().unwrap().to_string();

    let (status, body) = h.post("/pause", json!({ "id": sub_id })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    // Paused credentials stay on the allow-list.
    assert!(h.active_config().contains(&uuid));

    let (_, list) = h.get_json("/list").await;
    assert_eq!(list[0]["status"], "paused");

    let (status, body) = h
        .post("/resume", json!({ "id": sub_id, "rotate": false }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["uuid"], uuid);

    let (status, _) = h.post("/revoke", json!({ "id": uuid })).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!h.active_config().contains(&uuid));
    let restarts = h.restarts();

    // Revoking again is acknowledged without another switch.
    let (status, body) = h.post("/revoke", json!({ "id": sub_id })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sub_id"], sub_id);
    assert_eq!(h.restarts(), restarts);

    let (_, list) = h.get_json("/list").await;
    assert_eq!(list, json!([]));
}

#[tokio::test]
async fn resume_rotates_by_default() {
    let h = Harness::new().await;
    let created = h.create("Dan").await;
    let sub_id = created["sub_id"].as_str().unwrap();

    h.post("/pause", json!({ "id": sub_id })).await;
    let (status, body) = h.post("/resume", json!({ "id": sub_id })).await;
    assert_eq!(status, StatusCode::OK);
    assert_ne!(body["uuid"], created["uuid"]);

    let (_, list) = h.get_json("/list").await;
    assert_eq!(list[0]["status"], "active");
}

#[tokio::test]
async fn setname_relabels_without_switching() {
    let h = Harness::new().await;
    let created = h.create("Eve").await;
    let restarts = h.restarts();

    let (status, body) = h
        .post(
            "/setname",
            json!({ "id": created["sub_id"], "name": "Eve Phone" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sub_id"], created["sub_id"]);
    assert!(body["reality"].as_str().unwrap().ends_with("#Eve%20Phone"));
    assert_eq!(h.restarts(), restarts);

    let (status, _) = h
        .post("/setname", json!({ "id": created["sub_id"], "name": "  " }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn list_reports_usage_totals() {
    let h = Harness::new().await;
    let created = h.create("Frank").await;
    let uuid = created["uuid"].as_str().unwrap().to_string();
    h.counters.0.lock().unwrap().push((
        uuid.clone(),
        Counters {
            up: 100,
            down: 400,
        },
    ));

    // The subscription endpoint refreshes usage for the identity it serves.
    let (status, headers, _) = h
        .send("GET", &format!("/sub/{}", created["sub_id"].as_str().unwrap()), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        headers["subscription-userinfo"],
        "upload=100; download=400; total=0"
    );

    let (_, list) = h.get_json("/list").await;
    assert_eq!(list[0]["upload_bytes"], 100);
    assert_eq!(list[0]["download_bytes"], 400);
    assert_eq!(list[0]["total_bytes"], 500);

    let events = h.notifier.0.lock().unwrap().clone();
    assert!(matches!(
        events.as_slice(),
        [NotifyEvent::FirstTraffic { bytes: 500, .. }]
    ));
}

#[tokio::test]
async fn subscription_document_encodings_and_headers() {
    let h = Harness::new().await;
    let created = h.create("Gina").await;
    let sub_id = created["sub_id"].as_str().unwrap();

    let (status, headers, body) = h.send("GET", &format!("/sub/{sub_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["content-type"], "text/plain; charset=utf-8");
    assert_eq!(headers["profile-update-interval"], "60");
    assert_eq!(headers["cache-control"], "no-cache");
    let decoded = String::from_utf8(STANDARD.decode(body.trim()).unwrap()).unwrap();
    assert_eq!(decoded, format!("{}\n", created["reality"].as_str().unwrap()));

    // Plain text, reached through the front prefix and by secret.
    let uri = format!("/api/sub/{}?b64=0", created["uuid"].as_str().unwrap());
    let (status, _, body) = h.send("GET", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.starts_with("vless://"));
    assert!(body.ends_with('\n'));

    h.post("/revoke", json!({ "id": sub_id })).await;
    let (status, _, _) = h.send("GET", &format!("/sub/{sub_id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn sessions_validates_parameters() {
    let h = Harness::new().await;
    for uri in [
        "/sessions?min_sessions=1",
        "/sessions?window=4",
        "/sessions?distinct_ips_min=0",
    ] {
        let (status, _) = h.get_json(uri).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
    }

    let (status, body) = h.get_json("/sessions").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["window"], 45);
    assert_eq!(body["threshold"], 2);
    assert_eq!(body["items"], json!([]));
}

#[tokio::test]
async fn sessions_kick_rotates_shared_credential() {
    let h = Harness::new().await;
    let shared = h.create("Shared").await;
    let single = h.create("Single").await;
    let shared_uuid = shared["uuid"].as_str().unwrap().to_string();
    let single_uuid = single["uuid"].as_str().unwrap().to_string();

    h.append_log(&[
        access_line("10.0.0.1", &shared_uuid),
        access_line("10.0.0.2", &shared_uuid),
        access_line("10.0.0.3", &single_uuid),
    ]);

    let (status, body) = h.get_json("/sessions?kick=1&include_ips=1").await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["items"].as_array().unwrap().len(), 2);
    assert_eq!(body["offenders"][0]["uuid"], shared_uuid);
    assert_eq!(body["offenders"][0]["ips"]["10.0.0.1"], 1);

    let kicked = &body["kicked"][0];
    assert_eq!(kicked["ok"], true);
    assert_eq!(kicked["sub_id"], shared["sub_id"]);
    assert_eq!(kicked["old_uuid"], shared_uuid);
    let new_uuid = kicked["new_uuid"].as_str().unwrap();
    assert_ne!(new_uuid, shared_uuid);

    let config = h.active_config();
    assert!(config.contains(new_uuid));
    assert!(!config.contains(&shared_uuid));
    assert!(config.contains(&single_uuid));

    // Same subscription, new secret.
    let (_, list) = h.get_json("/list").await;
    let row = list
        .as_array()
        .unwrap()
        .iter()
        .find(|r| r["sub_id"] == shared["sub_id"])
        .unwrap();
    assert_eq!(row["uuid"], new_uuid);
    assert_eq!(row["status"], "active");

    let events = h.notifier.0.lock().unwrap().clone();
    assert!(events.iter().any(|e| matches!(
        e,
        NotifyEvent::Kick { old_secret, .. } if *old_secret == shared_uuid
    )));
}

#[tokio::test]
async fn health_reports_slot_state() {
    let h = Harness::new().await;
    let (status, body) = h.get_json("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["slots"]["active"], "A");
    assert_eq!(body["slots"]["phase"], "idle");

    h.create("Hank").await;
    let (_, body) = h.get_json("/health").await;
    assert_eq!(body["slots"]["active"], "B");
    assert_eq!(body["slots"]["phase"], "promoted");
}

#[tokio::test]
async fn failed_promotion_maps_to_service_unavailable() {
    let h = Harness::new().await;
    h.process.broken.store(true, Ordering::SeqCst);

    let (status, body) = h.post("/create", json!({ "name": "Ivy" })).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["detail"].as_str().unwrap().contains("B"));
    assert!(!h.slots.marker_path.exists());

    let (_, health) = h.get_json("/health").await;
    assert_eq!(health["slots"]["active"], "A");
    assert_eq!(health["slots"]["phase"], "failed");
}
