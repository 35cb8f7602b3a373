//! Access-log line parsing.

use std::sync::LazyLock;

use chrono::{Local, NaiveDateTime, TimeZone};
use regex::Regex;

#[allow(clippy::expect_used)]
static TIME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{4}/\d{2}/\d{2}\s+\d{2}:\d{2}:\d{2})").expect("static regex is valid")
});
#[allow(clippy::expect_used)]
static ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"id=([0-9a-fA-F\-]{36})").expect("static regex is valid"));
#[allow(clippy::expect_used)]
static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"email:\s*([0-9a-fA-F\-]{36})").expect("static regex is valid"));
#[allow(clippy::expect_used)]
static IP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,3}(?:\.\d{1,3}){3})").expect("static regex is valid"));

/// One connection event attributed to a secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub secret: String,
    pub ts: i64,
    pub ip: Option<String>,
}

/// Leading `YYYY/MM/DD HH:MM:SS` stamp, read as host-local time.
pub fn parse_timestamp(line: &str) -> Option<i64> {
    let caps = TIME_RE.captures(line)?;
    let naive = NaiveDateTime::parse_from_str(&caps[1], "%Y/%m/%d %H:%M:%S").ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.timestamp())
}

/// Extract an event from one log line. Lines without an identity token are
/// ignored; an unparseable timestamp falls back to `now`.
pub fn parse_line(line: &str, now: i64) -> Option<LogEvent> {
    let caps = ID_RE.captures(line).or_else(|| EMAIL_RE.captures(line))?;
    Some(LogEvent {
        secret: caps[1].to_string(),
        ts: parse_timestamp(line).unwrap_or(now),
        ip: IP_RE.captures(line).map(|c| c[1].to_string()),
    })
}
