//! Connection-log tailing, session aggregation and multi-session
//! enforcement.

mod enforcer;
mod parse;
mod tailer;

pub use enforcer::{
    EnforceError, Kick, Offender, SessionMonitor, SessionQuery, SessionReport, Thresholds,
    offending_secrets,
};
pub use parse::{LogEvent, parse_line, parse_timestamp};
pub use tailer::{LogTailer, SessionEntry, SessionSnapshot};
