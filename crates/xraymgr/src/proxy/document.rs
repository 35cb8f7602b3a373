//! Typed xray configuration document.
//!
//! Only the sections the control plane rewrites are modelled; every struct
//! keeps unrecognised keys in a flattened map so template content such as
//! DNS, policy, stats or transport settings survives a rewrite untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct XrayConfig {
    #[serde(default)]
    pub log: LogSection,
    #[serde(default)]
    pub inbounds: Vec<Inbound>,
    #[serde(default)]
    pub routing: Routing,
    #[serde(default)]
    pub outbounds: Vec<Outbound>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl XrayConfig {
    pub fn inbound(&self, tag: &str) -> Option<&Inbound> {
        self.inbounds.iter().find(|ib| ib.tag.as_deref() == Some(tag))
    }

    pub fn inbound_mut(&mut self, tag: &str) -> Option<&mut Inbound> {
        self.inbounds
            .iter_mut()
            .find(|ib| ib.tag.as_deref() == Some(tag))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Listen port: xray accepts a number or a range/list string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Port {
    Number(u16),
    Spec(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Inbound {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<Port>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default)]
    pub settings: InboundSettings,
    #[serde(
        rename = "streamSettings",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub stream_settings: Option<StreamSettings>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Inbound {
    /// Reality settings, looked up in `streamSettings` first and then in
    /// `settings` (older layouts).
    pub fn reality_settings(&self) -> Option<&RealitySettings> {
        self.stream_settings
            .as_ref()
            .and_then(|s| s.reality_settings.as_ref())
            .or(self.settings.reality_settings.as_ref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InboundSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clients: Option<Vec<Client>>,
    #[serde(
        rename = "realitySettings",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub reality_settings: Option<RealitySettings>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One allow-listed client of a VLESS inbound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<u32>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Client {
    /// Client entry for a secret. The email doubles as the stats and
    /// access-log key, so it is the secret itself.
    pub fn for_secret(secret: &str) -> Self {
        Self {
            id: secret.to_string(),
            flow: Some("xtls-rprx-vision".to_string()),
            email: Some(secret.to_string()),
            level: Some(0),
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamSettings {
    #[serde(
        rename = "realitySettings",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub reality_settings: Option<RealitySettings>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RealitySettings {
    #[serde(rename = "serverNames", default, skip_serializing_if = "Vec::is_empty")]
    pub server_names: Vec<String>,
    #[serde(rename = "shortIds", default, skip_serializing_if = "Vec::is_empty")]
    pub short_ids: Vec<ShortId>,
    #[serde(rename = "publicKey", default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Reality short id, written either as a hex string or a byte array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ShortId {
    Hex(String),
    Bytes(Vec<u8>),
}

impl ShortId {
    pub fn to_hex(&self) -> String {
        match self {
            Self::Hex(s) => s.clone(),
            Self::Bytes(bytes) => bytes.iter().map(|b| format!("{b:02x}")).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Routing {
    #[serde(default)]
    pub rules: Vec<RoutingRule>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingRule {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub rule_type: Option<String>,
    #[serde(rename = "inboundTag", default, skip_serializing_if = "Option::is_none")]
    pub inbound_tag: Option<Vec<String>>,
    #[serde(rename = "outboundTag", default, skip_serializing_if = "Option::is_none")]
    pub outbound_tag: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Outbound {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
