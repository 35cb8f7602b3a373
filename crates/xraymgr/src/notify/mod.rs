//! Outbound notifications towards the bot.
//!
//! Delivery is best effort: emitting never blocks the caller and a failed
//! delivery is logged and dropped.

mod webhook;

pub use webhook::WebhookNotifier;

use serde::Serialize;

/// Why a credential was rotated by the enforcer.
pub const REASON_MULTI_SESSION: &str = "multi_session";

/// An event the bot wants to hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyEvent {
    /// A credential was rotated away from under its owner.
    Kick {
        sub_id: String,
        old_secret: String,
        new_secret: String,
        reason: String,
    },
    /// An identity produced usage for the first time.
    FirstTraffic { sub_id: String, bytes: i64 },
}

#[derive(Debug, Serialize)]
pub(crate) struct KickPayload<'a> {
    pub sub_id: &'a str,
    pub old_uuid: &'a str,
    pub new_uuid: &'a str,
    pub reason: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct FirstTrafficPayload<'a> {
    pub sub_id: &'a str,
    pub bytes: i64,
}

/// Fire-and-forget event sink.
pub trait Notifier: Send + Sync {
    fn emit(&self, event: NotifyEvent);
}

/// Drops every event. Used when no webhook is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn emit(&self, event: NotifyEvent) {
        tracing::debug!(?event, "Notifications disabled, dropping event");
    }
}
