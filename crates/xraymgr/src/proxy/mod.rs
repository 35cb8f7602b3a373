//! Proxy configuration documents.
//!
//! - [`document`]: typed view of the xray JSON configuration
//! - [`synth`]: per-slot configuration synthesis from the store contents

pub mod document;
pub mod synth;

pub use document::{Client, Inbound, Port, ShortId, XrayConfig};
pub use synth::{Synthesizer, load_template};

/// Errors raised while loading or synthesizing a proxy configuration.
#[derive(Debug, thiserror::Error)]
pub enum ProxyConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid proxy configuration JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Inbound '{0}' not found in template")]
    MissingInbound(String),
}
