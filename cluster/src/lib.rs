pub mod controller;
pub mod health;
pub mod sql;
pub mod types;

pub use controller::FailoverController;
pub use health::{HealthProbe, PgIsReadyProbe, ProbeKind, TcpProbe};
pub use sql::{
    promote_wait_secs, PsqlConfig, PsqlExecutor, SqlExecutor, SqlFailure, SqlOutcome, Statement,
    PROMOTE_HEADROOM_SECS,
};
pub use types::*;

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Controller timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Delay between the end of one tick and the start of the next (seconds)
    pub poll_interval_secs: u64,

    /// Per-probe bound (seconds)
    pub probe_timeout_secs: u64,

    /// Per-statement bound (seconds)
    pub sql_timeout_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            probe_timeout_secs: 5,
            sql_timeout_secs: 10,
        }
    }
}

impl ControllerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn sql_timeout(&self) -> Duration {
        Duration::from_secs(self.sql_timeout_secs)
    }
}
