//! Per-slot configuration synthesis.

use std::path::Path;

use xraymgr_core::config::SlotConfig;

use super::ProxyConfigError;
use super::document::{Client, Outbound, Port, RoutingRule, XrayConfig};

/// Outbound tag the management API traffic is routed to.
const API_OUTBOUND_TAG: &str = "api";
const LOOPBACK: &str = "127.0.0.1";

/// Load the base template from disk.
pub async fn load_template(path: &Path) -> Result<XrayConfig, ProxyConfigError> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ProxyConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
    Ok(serde_json::from_str(&raw)?)
}

/// Builds slot configurations from a template.
#[derive(Debug, Clone)]
pub struct Synthesizer {
    reality_tag: String,
    api_tag: String,
}

impl Synthesizer {
    pub fn new(reality_tag: impl Into<String>, api_tag: impl Into<String>) -> Self {
        Self {
            reality_tag: reality_tag.into(),
            api_tag: api_tag.into(),
        }
    }

    /// Produce the complete configuration for `slot`.
    ///
    /// Pure function of its inputs: per-slot log paths and loopback ports,
    /// one client per secret on the Reality inbound, and a routing rule plus
    /// `freedom` outbound keeping API traffic off the data plane.
    pub fn build(
        &self,
        template: &XrayConfig,
        slot: &SlotConfig,
        secrets: &[String],
    ) -> Result<XrayConfig, ProxyConfigError> {
        let mut doc = template.clone();

        doc.log.access = Some(slot.access_log.display().to_string());
        doc.log.error = Some(slot.error_log.display().to_string());

        if let Some(api) = doc.inbound_mut(&self.api_tag) {
            api.listen = Some(LOOPBACK.to_string());
            api.port = Some(Port::Number(slot.api_port));
        }

        let reality = doc
            .inbound_mut(&self.reality_tag)
            .ok_or_else(|| ProxyConfigError::MissingInbound(self.reality_tag.clone()))?;
        reality.listen = Some(LOOPBACK.to_string());
        reality.port = Some(Port::Number(slot.data_port));
        reality.settings.clients = Some(secrets.iter().map(|s| Client::for_secret(s)).collect());

        let has_api_rule = doc.routing.rules.iter().any(|rule| {
            rule.rule_type.as_deref() == Some("field")
                && rule
                    .inbound_tag
                    .as_ref()
                    .is_some_and(|tags| tags.iter().any(|t| t == &self.api_tag))
        });
        if !has_api_rule {
            doc.routing.rules.push(RoutingRule {
                rule_type: Some("field".to_string()),
                inbound_tag: Some(vec![self.api_tag.clone()]),
                outbound_tag: Some(API_OUTBOUND_TAG.to_string()),
                ..RoutingRule::default()
            });
        }

        if !doc
            .outbounds
            .iter()
            .any(|o| o.tag.as_deref() == Some(API_OUTBOUND_TAG))
        {
            doc.outbounds.push(Outbound {
                tag: Some(API_OUTBOUND_TAG.to_string()),
                protocol: Some("freedom".to_string()),
                ..Outbound::default()
            });
        }

        Ok(doc)
    }
}
