use citusha_cluster::{ControllerConfig, ProbeKind, PsqlConfig, PROMOTE_HEADROOM_SECS};
use citusha_common::{FailoverError, GroupTopology, HostRef, Result, Topology};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Prefix for environment overrides, e.g. `CITUSHA_POLL_INTERVAL_SECS=10`
pub const ENV_PREFIX: &str = "CITUSHA";

/// One worker group as written in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    pub primary: HostRef,
    pub secondary: HostRef,
}

/// Monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Worker groups, evaluated in this order every tick
    pub groups: Vec<GroupConfig>,

    /// Coordinators whose node metadata follows promotions
    pub coordinators: Vec<HostRef>,

    pub poll_interval_secs: u64,
    pub probe_timeout_secs: u64,
    pub sql_timeout_secs: u64,

    /// Persisted role assignments
    pub state_path: PathBuf,

    pub probe: ProbeKind,
    pub pg_isready_path: PathBuf,
    pub psql: PsqlConfig,

    /// Serve Prometheus metrics on this address when set
    pub metrics_listen: Option<SocketAddr>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        let controller = ControllerConfig::default();
        Self {
            groups: (1..=3)
                .map(|n| GroupConfig {
                    name: format!("worker{}", n),
                    primary: HostRef::pg(format!("primary{}", n)),
                    secondary: HostRef::pg(format!("secondary{}", n)),
                })
                .collect(),
            coordinators: vec![HostRef::pg("coordinator")],
            poll_interval_secs: controller.poll_interval_secs,
            probe_timeout_secs: controller.probe_timeout_secs,
            sql_timeout_secs: controller.sql_timeout_secs,
            state_path: PathBuf::from("/var/lib/citusha/roles.state"),
            probe: ProbeKind::Tcp,
            pg_isready_path: PathBuf::from("pg_isready"),
            psql: PsqlConfig::default(),
            metrics_listen: None,
        }
    }
}

impl MonitorConfig {
    /// Defaults, then `path` (if any), then `CITUSHA_*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, None)
    }

    /// Same as [`load`](Self::load) but with an explicit environment map
    pub fn load_with_env(path: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self> {
        let defaults = config::Config::try_from(&MonitorConfig::default()).map_err(config_error)?;

        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .source(env),
        );

        builder
            .build()
            .map_err(config_error)?
            .try_deserialize()
            .map_err(config_error)
    }

    pub fn controller(&self) -> ControllerConfig {
        ControllerConfig {
            poll_interval_secs: self.poll_interval_secs,
            probe_timeout_secs: self.probe_timeout_secs,
            sql_timeout_secs: self.sql_timeout_secs,
        }
    }

    /// Validate and build the topology. Any problem here is fatal at startup.
    pub fn topology(&self) -> Result<Topology> {
        for (name, value) in [
            ("poll_interval_secs", self.poll_interval_secs),
            ("probe_timeout_secs", self.probe_timeout_secs),
            ("sql_timeout_secs", self.sql_timeout_secs),
        ] {
            if value == 0 {
                return Err(FailoverError::Config(format!("{} must be greater than zero", name)));
            }
        }

        if self.sql_timeout_secs <= PROMOTE_HEADROOM_SECS {
            return Err(FailoverError::Config(format!(
                "sql_timeout_secs must be greater than {} to leave pg_promote time to confirm",
                PROMOTE_HEADROOM_SECS
            )));
        }

        let groups = self
            .groups
            .iter()
            .map(|g| GroupTopology::new(g.name.trim(), g.primary.clone(), g.secondary.clone()))
            .collect();

        Topology::new(groups, self.coordinators.clone())
    }
}

fn config_error(e: config::ConfigError) -> FailoverError {
    FailoverError::Config(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_observed_deployment() {
        let config = MonitorConfig::load_with_env(None, Some(HashMap::new())).unwrap();
        let topology = config.topology().unwrap();

        assert_eq!(topology.groups.len(), 3);
        assert_eq!(topology.groups[0].primary, HostRef::pg("primary1"));
        assert_eq!(topology.groups[2].secondary, HostRef::pg("secondary3"));
        assert_eq!(topology.coordinators, vec![HostRef::pg("coordinator")]);
        assert_eq!(config.poll_interval_secs, 30);
        assert_eq!(config.probe, ProbeKind::Tcp);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
poll_interval_secs = 10
coordinators = ["coord-a:5433", "coord-b"]
probe = "pg_isready"
state_path = "/tmp/roles.state"

[[groups]]
name = "shard1"
primary = "pg-a:6432"
secondary = "pg-b:6432"

[psql]
user = "citus"
"#
        )
        .unwrap();

        let config = MonitorConfig::load_with_env(Some(file.path()), Some(HashMap::new())).unwrap();
        let topology = config.topology().unwrap();

        assert_eq!(config.poll_interval_secs, 10);
        assert_eq!(config.probe, ProbeKind::PgIsReady);
        assert_eq!(config.psql.user, "citus");
        assert_eq!(config.psql.database, "postgres");
        assert_eq!(topology.groups.len(), 1);
        assert_eq!(topology.groups[0].primary, HostRef::new("pg-a", 6432));
        assert_eq!(
            topology.coordinators,
            vec![HostRef::new("coord-a", 5433), HostRef::pg("coord-b")]
        );
    }

    #[test]
    fn test_environment_overrides_file() {
        let mut env = HashMap::new();
        env.insert("CITUSHA_SQL_TIMEOUT_SECS".to_string(), "15".to_string());
        env.insert("CITUSHA_PSQL__DATABASE".to_string(), "citus".to_string());

        let config = MonitorConfig::load_with_env(None, Some(env)).unwrap();

        assert_eq!(config.sql_timeout_secs, 15);
        assert_eq!(config.psql.database, "citus");
        assert_eq!(config.controller().sql_timeout_secs, 15);
    }

    #[test]
    fn test_invalid_topology_refused() {
        let mut config = MonitorConfig::default();
        config.groups[1].secondary = config.groups[1].primary.clone();
        assert!(config.topology().is_err());

        let mut config = MonitorConfig::default();
        config.coordinators.clear();
        assert!(config.topology().is_err());

        let mut config = MonitorConfig::default();
        config.probe_timeout_secs = 0;
        assert!(config.topology().is_err());
    }

    #[test]
    fn test_sql_timeout_must_cover_promotion_wait() {
        let mut config = MonitorConfig::default();
        config.sql_timeout_secs = PROMOTE_HEADROOM_SECS;
        assert!(matches!(config.topology(), Err(FailoverError::Config(_))));

        config.sql_timeout_secs = PROMOTE_HEADROOM_SECS + 1;
        assert!(config.topology().is_ok());
    }

    #[test]
    fn test_group_name_that_cannot_be_stored_is_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[[groups]]
name = "shard=1"
primary = "pg-a"
secondary = "pg-b"
"#
        )
        .unwrap();

        let config = MonitorConfig::load_with_env(Some(file.path()), Some(HashMap::new())).unwrap();
        assert!(matches!(config.topology(), Err(FailoverError::Config(_))));
    }

    #[test]
    fn test_malformed_host_in_file_is_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "coordinators = [\"coord:notaport\"]").unwrap();

        let result = MonitorConfig::load_with_env(Some(file.path()), Some(HashMap::new()));
        assert!(matches!(result, Err(FailoverError::Config(_))));
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let result = MonitorConfig::load_with_env(
            Some(Path::new("/nonexistent/citusha.toml")),
            Some(HashMap::new()),
        );
        assert!(result.is_err());
    }
}
