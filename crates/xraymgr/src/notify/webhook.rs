//! HTTP webhook delivery.

use std::time::Duration;

use tracing::{debug, warn};

use super::{FirstTrafficPayload, KickPayload, Notifier, NotifyEvent};

/// Posts events as JSON to the bot's notify endpoint.
///
/// Kicks go to the base URL, first-traffic events to `<base>/first_traffic`.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    http: reqwest::Client,
    base_url: String,
}

impl WebhookNotifier {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        // reqwest is built without a default TLS provider.
        let _ = rustls::crypto::ring::default_provider().install_default();
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }

    /// Target URL and JSON body for an event.
    fn request_for(&self, event: &NotifyEvent) -> (String, serde_json::Value) {
        match event {
            NotifyEvent::Kick {
                sub_id,
                old_secret,
                new_secret,
                reason,
            } => (
                self.base_url.clone(),
                serde_json::json!(KickPayload {
                    sub_id,
                    old_uuid: old_secret,
                    new_uuid: new_secret,
                    reason,
                }),
            ),
            NotifyEvent::FirstTraffic { sub_id, bytes } => (
                format!("{}/first_traffic", self.base_url.trim_end_matches('/')),
                serde_json::json!(FirstTrafficPayload {
                    sub_id,
                    bytes: *bytes,
                }),
            ),
        }
    }

    /// Deliver one event and wait for the outcome.
    pub async fn deliver(&self, event: &NotifyEvent) -> Result<(), reqwest::Error> {
        let (url, body) = self.request_for(event);
        self.http
            .post(&url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        debug!(url = %url, "Notification delivered");
        Ok(())
    }
}

impl Notifier for WebhookNotifier {
    fn emit(&self, event: NotifyEvent) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.deliver(&event).await {
                warn!(error = %e, ?event, "Notification delivery failed");
            }
        });
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn notifier(base: &str) -> WebhookNotifier {
        WebhookNotifier::new(base, Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn kick_posts_to_base_url() {
        let n = notifier("http://127.0.0.1:8081/notify");
        let (url, body) = n.request_for(&NotifyEvent::Kick {
            sub_id: "sub".into(),
            old_secret: "old".into(),
            new_secret: "new".into(),
            reason: "multi_session".into(),
        });
        assert_eq!(url, "http://127.0.0.1:8081/notify");
        assert_eq!(
            body,
            serde_json::json!({
                "sub_id": "sub",
                "old_uuid": "old",
                "new_uuid": "new",
                "reason": "multi_session"
            })
        );
    }

    #[test]
    fn first_traffic_posts_to_sub_path() {
        let n = notifier("http://127.0.0.1:8081/notify/");
        let (url, body) = n.request_for(&NotifyEvent::FirstTraffic {
            sub_id: "sub".into(),
            bytes: 1234,
        });
        assert_eq!(url, "http://127.0.0.1:8081/notify/first_traffic");
        assert_eq!(body, serde_json::json!({"sub_id": "sub", "bytes": 1234}));
    }

    #[tokio::test]
    async fn delivers_json_to_listener() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let mut received = Vec::new();
            loop {
                let n = sock.read(&mut buf).await.unwrap();
                received.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&received);
                if n == 0 || text.contains("\"bytes\":42") {
                    break;
                }
            }
            sock.write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                .await
                .unwrap();
            String::from_utf8_lossy(&received).into_owned()
        });

        let n = notifier(&format!("http://{addr}/notify"));
        n.deliver(&NotifyEvent::FirstTraffic {
            sub_id: "abc".into(),
            bytes: 42,
        })
        .await
        .unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /notify/first_traffic "));
        assert!(request.contains("\"sub_id\":\"abc\""));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_an_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let n = notifier(&format!("http://127.0.0.1:{port}/notify"));
        let result = n
            .deliver(&NotifyEvent::FirstTraffic {
                sub_id: "abc".into(),
                bytes: 1,
            })
            .await;
        assert!(result.is_err());
    }
}
