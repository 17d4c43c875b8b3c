use crate::error::{FailoverError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Port assumed when a host is configured without one
pub const DEFAULT_PG_PORT: u16 = 5432;

/// Logical worker group identifier (e.g. "worker1")
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub String);

impl GroupId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GroupId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Network identity of a database host
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HostRef {
    pub host: String,
    pub port: u16,
}

impl HostRef {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Host on the default PostgreSQL port
    pub fn pg(host: impl Into<String>) -> Self {
        Self::new(host, DEFAULT_PG_PORT)
    }
}

impl fmt::Display for HostRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for HostRef {
    type Err = FailoverError;

    /// Accepts `host` or `host:port`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (host, port) = match s.rsplit_once(':') {
            Some((host, port)) => {
                let port: u16 = port
                    .parse()
                    .map_err(|_| FailoverError::Config(format!("invalid port in host '{}'", s)))?;
                (host, port)
            }
            None => (s, DEFAULT_PG_PORT),
        };

        // IPv6 literals are not accepted; configure a hostname instead
        if host.is_empty()
            || host
                .chars()
                .any(|c| c.is_whitespace() || c == '=' || c == '\'' || c == ':' || c == '[')
        {
            return Err(FailoverError::Config(format!("malformed host '{}'", s)));
        }
        if port == 0 {
            return Err(FailoverError::Config(format!("port must be non-zero in host '{}'", s)));
        }

        Ok(Self::new(host, port))
    }
}

impl TryFrom<String> for HostRef {
    type Error = FailoverError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<HostRef> for String {
    fn from(host: HostRef) -> Self {
        host.to_string()
    }
}

/// Role a host plays within its group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Primary,
    Secondary,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Primary => "primary",
            Role::Secondary => "secondary",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Primary/secondary pair for one group. The two hosts are never equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAssignment {
    primary: HostRef,
    secondary: HostRef,
}

impl RoleAssignment {
    pub fn new(primary: HostRef, secondary: HostRef) -> Result<Self> {
        if primary == secondary {
            return Err(FailoverError::InvalidAssignment(format!(
                "primary and secondary are both {}",
                primary
            )));
        }
        Ok(Self { primary, secondary })
    }

    pub fn primary(&self) -> &HostRef {
        &self.primary
    }

    pub fn secondary(&self) -> &HostRef {
        &self.secondary
    }

    pub fn role_of(&self, host: &HostRef) -> Option<Role> {
        if host == &self.primary {
            Some(Role::Primary)
        } else if host == &self.secondary {
            Some(Role::Secondary)
        } else {
            None
        }
    }

    /// The assignment with roles exchanged
    pub fn swapped(&self) -> Self {
        Self {
            primary: self.secondary.clone(),
            secondary: self.primary.clone(),
        }
    }
}

/// Full `{group -> assignment}` mapping. Always saved and loaded as a whole.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleMapping(BTreeMap<GroupId, RoleAssignment>);

impl RoleMapping {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, group: GroupId, assignment: RoleAssignment) -> Option<RoleAssignment> {
        self.0.insert(group, assignment)
    }

    pub fn get(&self, group: &GroupId) -> Option<&RoleAssignment> {
        self.0.get(group)
    }

    pub fn contains(&self, group: &GroupId) -> bool {
        self.0.contains_key(group)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&GroupId, &RoleAssignment)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Make `host` the primary of `group`.
    ///
    /// Returns `Ok(false)` without touching the mapping when `host` is
    /// already primary, `Ok(true)` when the pair was swapped.
    pub fn promote(&mut self, group: &GroupId, host: &HostRef) -> Result<bool> {
        let assignment = self
            .0
            .get_mut(group)
            .ok_or_else(|| FailoverError::UnknownGroup(group.to_string()))?;

        match assignment.role_of(host) {
            Some(Role::Primary) => Ok(false),
            Some(Role::Secondary) => {
                *assignment = assignment.swapped();
                Ok(true)
            }
            None => Err(FailoverError::InvalidAssignment(format!(
                "{} is not a member of group {}",
                host, group
            ))),
        }
    }
}

/// Statically configured hosts of one group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupTopology {
    pub name: GroupId,
    pub primary: HostRef,
    pub secondary: HostRef,
}

impl GroupTopology {
    pub fn new(name: impl Into<String>, primary: HostRef, secondary: HostRef) -> Self {
        Self {
            name: GroupId::new(name),
            primary,
            secondary,
        }
    }

    /// Whether `host` is one of this group's two configured hosts
    pub fn owns(&self, host: &HostRef) -> bool {
        host == &self.primary || host == &self.secondary
    }
}

/// Fixed cluster layout: worker groups in enumeration order plus the
/// coordinators whose metadata must follow promotions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub groups: Vec<GroupTopology>,
    pub coordinators: Vec<HostRef>,
}

impl Topology {
    /// Validate and build. Refuses incomplete or contradictory layouts.
    pub fn new(groups: Vec<GroupTopology>, coordinators: Vec<HostRef>) -> Result<Self> {
        if groups.is_empty() {
            return Err(FailoverError::Config("at least one group is required".into()));
        }
        if coordinators.is_empty() {
            return Err(FailoverError::Config("at least one coordinator is required".into()));
        }

        let mut seen = std::collections::BTreeSet::new();
        for group in &groups {
            if group.name.as_str().is_empty() {
                return Err(FailoverError::Config("group name must not be empty".into()));
            }
            // Names are written verbatim as `<role>:<group>=<host>` state records
            if group
                .name
                .as_str()
                .chars()
                .any(|c| c == '=' || c == '#' || c.is_whitespace() || c.is_control())
            {
                return Err(FailoverError::Config(format!(
                    "group name '{}' must not contain '=', '#', whitespace or control characters",
                    group.name.as_str().escape_debug()
                )));
            }
            if !seen.insert(group.name.clone()) {
                return Err(FailoverError::Config(format!("duplicate group '{}'", group.name)));
            }
            if group.primary == group.secondary {
                return Err(FailoverError::Config(format!(
                    "group '{}' uses {} as both primary and secondary",
                    group.name, group.primary
                )));
            }
        }

        Ok(Self {
            groups,
            coordinators,
        })
    }

    pub fn group(&self, name: &GroupId) -> Option<&GroupTopology> {
        self.groups.iter().find(|g| &g.name == name)
    }

    /// Mapping used on first boot: every group on its configured primary
    pub fn default_mapping(&self) -> RoleMapping {
        let mut mapping = RoleMapping::new();
        for group in &self.groups {
            mapping.insert(
                group.name.clone(),
                RoleAssignment {
                    primary: group.primary.clone(),
                    secondary: group.secondary.clone(),
                },
            );
        }
        mapping
    }

    /// Check a loaded mapping against the topology and fill in groups the
    /// file does not mention. Returns the reconciled mapping and the names of
    /// seeded groups.
    pub fn reconcile(&self, loaded: RoleMapping) -> Result<(RoleMapping, Vec<GroupId>)> {
        for (name, assignment) in loaded.iter() {
            let group = self.group(name).ok_or_else(|| {
                FailoverError::StateMismatch(format!("group '{}' is not configured", name))
            })?;
            for host in [assignment.primary(), assignment.secondary()] {
                if !group.owns(host) {
                    return Err(FailoverError::StateMismatch(format!(
                        "host {} is not configured for group '{}'",
                        host, name
                    )));
                }
            }
        }

        let mut mapping = loaded;
        let mut seeded = Vec::new();
        for (name, assignment) in self.default_mapping().iter() {
            if !mapping.contains(name) {
                mapping.insert(name.clone(), assignment.clone());
                seeded.push(name.clone());
            }
        }

        Ok((mapping, seeded))
    }
}
