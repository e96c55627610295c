use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What the platform reports about the current network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub has_connection: bool,
    pub internet_reachable: bool,
}

impl ProbeResult {
    #[must_use]
    pub const fn online() -> Self {
        Self {
            has_connection: true,
            internet_reachable: true,
        }
    }

    #[must_use]
    pub const fn offline() -> Self {
        Self {
            has_connection: false,
            internet_reachable: false,
        }
    }

    /// Offline unless there is both a link and a reachable internet.
    #[must_use]
    pub const fn is_offline(&self) -> bool {
        !self.has_connection || !self.internet_reachable
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProbeError {
    #[error("connectivity probe unavailable: {0}")]
    Unavailable(String),

    #[error("connectivity probe timed out")]
    TimedOut,
}

#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn probe(&self) -> Result<ProbeResult, ProbeError>;
}
