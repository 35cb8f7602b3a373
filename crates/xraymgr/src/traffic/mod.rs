//! Usage accounting from the proxy's cumulative per-user counters.

mod poller;

pub use poller::{PollSummary, TrafficPoller};

use async_trait::async_trait;

use crate::cmd::CmdError;

#[derive(Debug, thiserror::Error)]
pub enum CounterError {
    #[error(transparent)]
    Cmd(#[from] CmdError),

    #[error("Unparseable stats output: {0}")]
    Parse(String),

    #[error("No stats endpoint answered for {0}")]
    Unavailable(String),
}

/// Raw cumulative counters for one secret, summed over every slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub up: i64,
    pub down: i64,
}

/// Reads runtime counters.
#[async_trait]
pub trait CounterSource: Send + Sync {
    async fn read(&self, secret: &str) -> Result<Counters, CounterError>;
}
