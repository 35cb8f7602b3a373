//! xraymgr: control plane for an xray proxy fleet.
//!
//! - SQLite credential store with per-secret traffic cursors
//! - Per-slot configuration synthesis and blue/green slot switching
//! - Access-log tailing, session aggregation and multi-session kicks
//! - Usage polling from the proxy's stats API
//! - Webhook notifications and the HTTP API used by the bot

pub mod api;
pub mod cmd;
pub mod links;
pub mod notify;
pub mod proxy;
pub mod sessions;
pub mod slots;
pub mod storage;
pub mod traffic;
pub mod xray;

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod test_support;
