//! Client-facing connection and subscription links.

use std::path::PathBuf;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use xraymgr_core::config::LinkConfig;

use crate::proxy::{ProxyConfigError, XrayConfig, load_template};

/// Characters left unescaped in the link fragment.
const FRAGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Missing Reality parameter `{0}`; set it in the template or via XRAY_REALITY_{1}")]
    MissingParam(&'static str, &'static str),

    #[error(transparent)]
    Template(#[from] ProxyConfigError),
}

/// Reality handshake parameters advertised to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealityParams {
    pub sni: String,
    pub sid: String,
    pub pbk: String,
}

impl RealityParams {
    /// Read from the template's Reality inbound, falling back to the
    /// configured overrides for anything the template lacks.
    pub fn resolve(
        template: &XrayConfig,
        reality_tag: &str,
        links: &LinkConfig,
    ) -> Result<Self, LinkError> {
        let inbound = template
            .inbound(reality_tag)
            .ok_or_else(|| ProxyConfigError::MissingInbound(reality_tag.to_string()))?;
        let reality = inbound.reality_settings();

        let sni = reality
            .and_then(|r| r.server_names.first().cloned())
            .filter(|s| !s.is_empty())
            .or_else(|| links.reality_sni.clone())
            .ok_or(LinkError::MissingParam("sni", "SNI"))?;
        let sid = reality
            .and_then(|r| r.short_ids.first().map(crate::proxy::ShortId::to_hex))
            .filter(|s| !s.is_empty())
            .or_else(|| links.reality_sid.clone())
            .ok_or(LinkError::MissingParam("sid", "SID"))?;
        let pbk = reality
            .and_then(|r| r.public_key.clone())
            .filter(|s| !s.is_empty())
            .or_else(|| links.reality_pbk.clone())
            .ok_or(LinkError::MissingParam("pbk", "PBK"))?;

        Ok(Self { sni, sid, pbk })
    }
}

/// Builds links from the deployment's public coordinates.
#[derive(Debug, Clone)]
pub struct LinkBuilder {
    config: LinkConfig,
    template_path: PathBuf,
    reality_tag: String,
}

impl LinkBuilder {
    pub fn new(config: LinkConfig, template_path: PathBuf, reality_tag: String) -> Self {
        Self {
            config,
            template_path,
            reality_tag,
        }
    }

    pub const fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Resolve Reality parameters from the current template.
    pub async fn reality_params(&self) -> Result<RealityParams, LinkError> {
        let template = load_template(&self.template_path).await?;
        RealityParams::resolve(&template, &self.reality_tag, &self.config)
    }

    /// `vless://` connection link for a secret.
    pub fn connection_link(&self, params: &RealityParams, secret: &str, name: &str) -> String {
        format!(
            "vless://{secret}@{domain}:{port}?encryption=none&security=reality&sni={sni}&fp=chrome&pbk={pbk}&sid={sid}&type=tcp&flow=xtls-rprx-vision#{frag}",
            domain = self.config.domain,
            port = self.config.public_port,
            sni = params.sni,
            pbk = params.pbk,
            sid = params.sid,
            frag = utf8_percent_encode(name, FRAGMENT),
        )
    }

    /// Subscription URL served by the HTTPS front.
    pub fn sub_link(&self, sub_id: &str) -> String {
        let prefix = self.config.sub_prefix.trim_matches('/');
        let path = if prefix.is_empty() {
            "/sub".to_string()
        } else {
            format!("/{prefix}/sub")
        };
        format!(
            "https://{}:{}{path}/{sub_id}?b64=1",
            self.config.domain, self.config.sub_port
        )
    }
}
