//! Slot identity and the durable active-slot marker.

use std::fmt;
use std::io;
use std::path::Path;

use serde::Serialize;
use tracing::warn;

/// One of the two interchangeable proxy instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Slot {
    A,
    B,
}

impl Slot {
    pub const fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }

    pub const fn letter(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
        }
    }

    /// Lenient parse of marker contents: anything that is not `B` means `A`.
    pub fn from_marker(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("b") {
            Self::B
        } else {
            Self::A
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.letter())
    }
}

/// Read the active slot. A missing or unreadable marker means `A`.
pub async fn read_marker(path: &Path) -> Slot {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => Slot::from_marker(&raw),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Slot::A,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Unreadable slot marker, assuming A");
            Slot::A
        }
    }
}

/// Persist the active slot. Readers see either the old or the new letter.
pub async fn write_marker(path: &Path, slot: Slot) -> io::Result<()> {
    write_atomic(path, slot.letter().as_bytes()).await
}

/// Write `contents` to a sibling temp file and rename it over `path`.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await
}
