//! The xray binary: configuration checks and stats queries.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::cmd::{self, CmdError};
use crate::slots::ConfigValidator;
use crate::traffic::{CounterError, CounterSource, Counters};

/// Stats counter name for one traffic direction of a user.
pub fn metric_name(secret: &str, direction: &str) -> String {
    format!("user>>>{secret}>>>traffic>>>{direction}")
}

/// Extract a counter value from `xray api stats` JSON output.
///
/// Accepts `{"stat": {"value": ..}}`, `{"value": ..}`, and list shapes
/// (`[..]` or `{"stat": [..]}`) whose entries are matched by name. Values
/// may be numbers or numeric strings; a missing value reads as zero.
pub fn parse_stat_value(output: &str, metric: &str) -> Option<i64> {
    fn value_of(v: Option<&Value>) -> Option<i64> {
        match v {
            None | Some(Value::Null) => Some(0),
            Some(Value::Number(n)) => n.as_i64(),
            Some(Value::String(s)) if s.is_empty() => Some(0),
            Some(Value::String(s)) => s.parse().ok(),
            Some(_) => None,
        }
    }

    fn from_list(items: &[Value], metric: &str) -> Option<i64> {
        items.iter().find_map(|item| {
            let entry = item.get("stat").filter(|s| s.is_object()).unwrap_or(item);
            (entry.get("name").and_then(Value::as_str) == Some(metric))
                .then(|| value_of(entry.get("value")))
                .flatten()
        })
    }

    let data: Value = serde_json::from_str(output.trim()).ok()?;
    match &data {
        Value::Array(items) => from_list(items, metric),
        Value::Object(map) => match map.get("stat") {
            Some(Value::Object(stat)) => value_of(stat.get("value")),
            Some(Value::Array(items)) => from_list(items, metric),
            _ if map.contains_key("value") => value_of(map.get("value")),
            _ => None,
        },
        _ => None,
    }
}

/// Wrapper around the proxy executable.
#[derive(Debug, Clone)]
pub struct XrayBinary {
    bin: PathBuf,
    api_ports: Vec<u16>,
    validate_timeout: Duration,
    stats_timeout: Duration,
}

impl XrayBinary {
    pub fn new(
        bin: PathBuf,
        api_ports: Vec<u16>,
        validate_timeout: Duration,
        stats_timeout: Duration,
    ) -> Self {
        Self {
            bin,
            api_ports,
            validate_timeout,
            stats_timeout,
        }
    }

    /// Query one metric on one API port, by exact name first and by
    /// pattern as a fallback.
    async fn query_port(&self, port: u16, metric: &str) -> Result<i64, CounterError> {
        let server = format!("127.0.0.1:{port}");
        let mut last_err = CounterError::Parse(format!("{metric} on {server}"));

        for selector in ["-name", "-pattern"] {
            let args = ["api", "stats", "--server", server.as_str(), selector, metric];
            match cmd::run_output(&self.bin, &args, self.stats_timeout).await {
                Ok(output) if output.status.success() => {
                    let stdout = String::from_utf8_lossy(&output.stdout);
                    if let Some(v) = parse_stat_value(&stdout, metric) {
                        return Ok(v);
                    }
                    last_err = CounterError::Parse(stdout.trim().to_string());
                }
                Ok(output) => {
                    last_err = CounterError::Parse(cmd::combined_output(&output));
                }
                Err(e) => last_err = CounterError::Cmd(e),
            }
        }
        Err(last_err)
    }

    /// Sum a metric over every API port that answered.
    async fn query_metric(&self, metric: &str) -> Result<i64, CounterError> {
        let mut total = 0i64;
        let mut answered = false;
        for &port in &self.api_ports {
            match self.query_port(port, metric).await {
                Ok(v) => {
                    total = total.saturating_add(v);
                    answered = true;
                }
                Err(e) => debug!(port, metric, error = %e, "Stats query failed"),
            }
        }
        if answered {
            Ok(total)
        } else {
            Err(CounterError::Unavailable(metric.to_string()))
        }
    }
}

#[async_trait]
impl ConfigValidator for XrayBinary {
    async fn validate(&self, config_path: &Path) -> Result<(), CmdError> {
        let path = config_path.to_string_lossy();
        cmd::run_checked(
            &format!("Validating {path}"),
            &self.bin,
            &["-test", "-config", &*path],
            self.validate_timeout,
        )
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl CounterSource for XrayBinary {
    async fn read(&self, secret: &str) -> Result<Counters, CounterError> {
        let up = self.query_metric(&metric_name(secret, "uplink")).await?;
        let down = self.query_metric(&metric_name(secret, "downlink")).await?;
        Ok(Counters { up, down })
    }
}
