use serde::{Deserialize, Serialize};

use crate::capabilities::ProbeResult;

/// Platform lifecycle signals forwarded by the shell.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    AppStarted,
    AppForegrounded,
    AppBackgrounded,
    ConnectivityChanged { result: ProbeResult },
}

impl LifecycleEvent {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::AppStarted => "app_started",
            Self::AppForegrounded => "app_foregrounded",
            Self::AppBackgrounded => "app_backgrounded",
            Self::ConnectivityChanged { .. } => "connectivity_changed",
        }
    }
}
