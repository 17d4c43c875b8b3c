use citusha_common::HostRef;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Part of the statement timeout kept back from `pg_promote`'s wait for
/// connecting and the round trip, so the server gives up before we do.
pub const PROMOTE_HEADROOM_SECS: u64 = 3;

/// Connect bound for promotion; must stay below [`PROMOTE_HEADROOM_SECS`]
const PROMOTE_CONNECT_SECS: u64 = 2;

/// Seconds `pg_promote` may wait for the standby under `timeout`
pub fn promote_wait_secs(timeout: Duration) -> u64 {
    timeout.as_secs().saturating_sub(PROMOTE_HEADROOM_SECS).max(1)
}

/// Administrative statements the controller issues
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    /// Turn a standby into a writable primary. No-op on a node that is
    /// already out of recovery.
    Promote,

    /// Point coordinator metadata for `from` at `to`. Matches no rows once
    /// applied, so repeating it is harmless.
    RepointMetadata { from: HostRef, to: HostRef },
}

impl Statement {
    /// Statement class used in logs and metrics
    pub fn class(&self) -> &'static str {
        match self {
            Statement::Promote => "promote",
            Statement::RepointMetadata { .. } => "repoint_metadata",
        }
    }

    /// Render for a run bounded by `timeout`. An unconfirmed promotion
    /// raises, so psql exits non-zero under `ON_ERROR_STOP`.
    pub fn to_sql(&self, timeout: Duration) -> String {
        match self {
            Statement::Promote => {
                let wait = promote_wait_secs(timeout);
                format!(
                    "DO $$ BEGIN \
                     IF pg_is_in_recovery() THEN \
                     IF NOT pg_promote(true, {wait}) THEN \
                     RAISE EXCEPTION 'promotion not confirmed within {wait} seconds'; \
                     END IF; \
                     END IF; \
                     END $$"
                )
            }
            Statement::RepointMetadata { from, to } => format!(
                "SELECT citus_update_node(nodeid, {}, {}) FROM pg_dist_node \
                 WHERE nodename = {} AND nodeport = {}",
                quote_literal(&to.host),
                to.port,
                quote_literal(&from.host),
                from.port
            ),
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.class())
    }
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Why a statement did not succeed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlFailure {
    pub detail: String,
}

impl SqlFailure {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

impl fmt::Display for SqlFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.detail)
    }
}

pub type SqlOutcome = std::result::Result<(), SqlFailure>;

/// Runs one administrative statement against one host
#[async_trait::async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn execute(&self, target: &HostRef, statement: &Statement, timeout: Duration) -> SqlOutcome;
}

/// Connection settings for [`PsqlExecutor`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PsqlConfig {
    /// Path to the `psql` binary
    pub program: PathBuf,
    pub user: String,
    pub database: String,
    /// Passed through `PGPASSWORD`; prefer a `.pgpass` file when possible
    pub password: Option<String>,
}

impl Default for PsqlConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("psql"),
            user: "postgres".to_string(),
            database: "postgres".to_string(),
            password: None,
        }
    }
}

/// Executes statements through the `psql` client
pub struct PsqlExecutor {
    config: PsqlConfig,
}

impl PsqlExecutor {
    /// Create an executor using `config` for every connection
    pub fn new(config: PsqlConfig) -> Self {
        Self { config }
    }

    fn command(&self, target: &HostRef, statement: &Statement, timeout: Duration) -> Command {
        let connect_timeout = match statement {
            Statement::Promote => PROMOTE_CONNECT_SECS,
            Statement::RepointMetadata { .. } => timeout.as_secs().max(1),
        };

        let mut cmd = Command::new(&self.config.program);
        cmd.arg("-X")
            .arg("-q")
            .arg("-A")
            .arg("-t")
            .arg("-v")
            .arg("ON_ERROR_STOP=1")
            .arg("-h")
            .arg(&target.host)
            .arg("-p")
            .arg(target.port.to_string())
            .arg("-U")
            .arg(&self.config.user)
            .arg("-d")
            .arg(&self.config.database)
            .arg("-c")
            .arg(statement.to_sql(timeout))
            .env("PGCONNECT_TIMEOUT", connect_timeout.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(password) = &self.config.password {
            cmd.env("PGPASSWORD", password);
        }

        cmd
    }
}

#[async_trait::async_trait]
impl SqlExecutor for PsqlExecutor {
    async fn execute(&self, target: &HostRef, statement: &Statement, timeout: Duration) -> SqlOutcome {
        debug!("Executing {} on {}", statement.class(), target);

        let child = self
            .command(target, statement, timeout)
            .spawn()
            .map_err(|e| {
                SqlFailure::new(format!(
                    "failed to start {}: {}",
                    self.config.program.display(),
                    e
                ))
            })?;

        // Dropping the future on timeout drops the child, which kills it
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(SqlFailure::new(format!("psql I/O error: {}", e))),
            Err(_) => return Err(SqlFailure::new(format!("timed out after {:?}", timeout))),
        };

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = stderr.trim();
        if detail.is_empty() {
            Err(SqlFailure::new(format!("psql exited with {}", output.status)))
        } else {
            Err(SqlFailure::new(detail))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_promote_is_guarded_by_recovery_check() {
        let sql = Statement::Promote.to_sql(Duration::from_secs(10));
        assert!(sql.starts_with("DO $$"));
        assert!(sql.contains("IF pg_is_in_recovery() THEN"));
        assert_eq!(Statement::Promote.class(), "promote");
    }

    #[test]
    fn test_unconfirmed_promotion_raises() {
        let sql = Statement::Promote.to_sql(Duration::from_secs(10));

        // pg_promote returning false must end in an error, not a result row
        let check = sql.find("IF NOT pg_promote(true, 7) THEN").unwrap();
        let raise = sql.find("RAISE EXCEPTION").unwrap();
        assert!(check < raise);
        assert!(!sql.contains("SELECT"));
    }

    #[test]
    fn test_promote_wait_fits_inside_statement_timeout() {
        for secs in [4, 10, 60] {
            let timeout = Duration::from_secs(secs);
            let wait = promote_wait_secs(timeout);
            assert!(wait + PROMOTE_CONNECT_SECS < secs, "wait {} under {}s", wait, secs);
        }
        assert_eq!(promote_wait_secs(Duration::from_secs(10)), 7);
        assert_eq!(promote_wait_secs(Duration::from_secs(1)), 1);
    }

    #[test]
    fn test_repoint_targets_old_identity() {
        let statement = Statement::RepointMetadata {
            from: HostRef::pg("primary1"),
            to: HostRef::new("secondary1", 6432),
        };
        let sql = statement.to_sql(Duration::from_secs(10));

        assert!(sql.contains("citus_update_node(nodeid, 'secondary1', 6432)"));
        assert!(sql.contains("nodename = 'primary1' AND nodeport = 5432"));
        assert_eq!(statement.to_string(), "repoint_metadata");
    }

    #[test]
    fn test_literals_are_escaped() {
        assert_eq!(quote_literal("o'brien"), "'o''brien'");
    }

    #[tokio::test]
    async fn test_missing_psql_is_a_failure() {
        let executor = PsqlExecutor::new(PsqlConfig {
            program: PathBuf::from("/nonexistent/bin/psql"),
            ..Default::default()
        });

        let outcome = executor
            .execute(&HostRef::pg("127.0.0.1"), &Statement::Promote, Duration::from_secs(1))
            .await;

        let failure = outcome.unwrap_err();
        assert!(failure.detail.contains("failed to start"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_raised_statement_error_is_a_failure() {
        use std::os::unix::fs::PermissionsExt;

        // Stands in for psql reporting an exception under ON_ERROR_STOP
        let dir = tempfile::tempdir().unwrap();
        let program = dir.path().join("psql");
        std::fs::write(
            &program,
            "#!/bin/sh\necho 'ERROR:  promotion not confirmed within 7 seconds' >&2\nexit 3\n",
        )
        .unwrap();
        std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();

        let executor = PsqlExecutor::new(PsqlConfig {
            program,
            ..Default::default()
        });
        let outcome = executor
            .execute(&HostRef::pg("secondary1"), &Statement::Promote, Duration::from_secs(10))
            .await;

        let failure = outcome.unwrap_err();
        assert!(failure.detail.contains("promotion not confirmed"));
    }
}
