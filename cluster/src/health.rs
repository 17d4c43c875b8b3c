use citusha_common::HostRef;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::debug;

/// Reachability check for a database host.
///
/// Never fails: any connection or protocol problem is reported as `false`,
/// and the call returns within `timeout`.
#[async_trait::async_trait]
pub trait HealthProbe: Send + Sync {
    async fn is_reachable(&self, target: &HostRef, timeout: Duration) -> bool;
}

/// Which probe the monitor uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    /// Plain TCP connect to host:port
    Tcp,
    /// External `pg_isready` utility
    #[serde(rename = "pg_isready")]
    PgIsReady,
}

impl Default for ProbeKind {
    fn default() -> Self {
        ProbeKind::Tcp
    }
}

/// Treats a completed TCP handshake as "accepting connections"
#[derive(Debug, Clone, Default)]
pub struct TcpProbe;

impl TcpProbe {
    /// Create a TCP handshake probe
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl HealthProbe for TcpProbe {
    async fn is_reachable(&self, target: &HostRef, timeout: Duration) -> bool {
        let connect = TcpStream::connect((target.host.as_str(), target.port));
        match tokio::time::timeout(timeout, connect).await {
            Ok(Ok(_stream)) => true,
            Ok(Err(e)) => {
                debug!("TCP probe of {} failed: {}", target, e);
                false
            }
            Err(_) => {
                debug!("TCP probe of {} timed out after {:?}", target, timeout);
                false
            }
        }
    }
}

/// Runs `pg_isready`; only exit status 0 (accepting connections) counts.
/// A missing binary is reported as unreachable.
#[derive(Debug, Clone)]
pub struct PgIsReadyProbe {
    program: PathBuf,
}

impl PgIsReadyProbe {
    /// Create a probe that runs the `pg_isready` binary at `program`
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for PgIsReadyProbe {
    fn default() -> Self {
        Self::new("pg_isready")
    }
}

#[async_trait::async_trait]
impl HealthProbe for PgIsReadyProbe {
    async fn is_reachable(&self, target: &HostRef, timeout: Duration) -> bool {
        let connect_secs = timeout.as_secs().max(1);

        let mut cmd = Command::new(&self.program);
        cmd.arg("-q")
            .arg("-h")
            .arg(&target.host)
            .arg("-p")
            .arg(target.port.to_string())
            .arg("-t")
            .arg(connect_secs.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                debug!("Cannot run {}: {}", self.program.display(), e);
                return false;
            }
        };

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                debug!("pg_isready for {} failed: {}", target, e);
                false
            }
            Err(_) => {
                debug!("pg_isready for {} timed out after {:?}", target, timeout);
                false
            }
        }
    }
}
