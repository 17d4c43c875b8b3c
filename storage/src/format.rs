//! Line-oriented encoding of the role mapping.
//!
//! ```text
//! # citusha role state
//! primary:worker1=secondary1:5432
//! secondary:worker1=primary1:5432
//! ```
//!
//! Blank lines and `#` comments are ignored. Every group needs exactly one
//! `primary:` and one `secondary:` record.

use citusha_common::{FailoverError, GroupId, HostRef, Result, Role, RoleAssignment, RoleMapping};
use std::collections::BTreeMap;

const HEADER: &str = "# citusha role state: <role>:<group>=<host>:<port>";

/// Render the full mapping
pub fn encode(mapping: &RoleMapping) -> String {
    let mut out = String::with_capacity(64 * (mapping.len() + 1));
    out.push_str(HEADER);
    out.push('\n');

    for (group, assignment) in mapping.iter() {
        out.push_str(&format!("{}:{}={}\n", Role::Primary, group, assignment.primary()));
        out.push_str(&format!("{}:{}={}\n", Role::Secondary, group, assignment.secondary()));
    }

    out
}

/// Parse a full mapping, rejecting anything ambiguous
pub fn decode(text: &str) -> Result<RoleMapping> {
    let mut pending: BTreeMap<GroupId, (Option<HostRef>, Option<HostRef>)> = BTreeMap::new();

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| FailoverError::state_parse(line_no, "expected '<role>:<group>=<host>'"))?;

        let (role, group) = key
            .split_once(':')
            .ok_or_else(|| FailoverError::state_parse(line_no, "expected '<role>:<group>' key"))?;

        let role = match role.trim() {
            "primary" => Role::Primary,
            "secondary" => Role::Secondary,
            other => {
                return Err(FailoverError::state_parse(
                    line_no,
                    format!("unknown role '{}'", other),
                ))
            }
        };

        let group = group.trim();
        if group.is_empty() {
            return Err(FailoverError::state_parse(line_no, "empty group name"));
        }

        let host: HostRef = value
            .parse()
            .map_err(|e: FailoverError| FailoverError::state_parse(line_no, e.to_string()))?;

        let slot = pending.entry(GroupId::new(group)).or_default();
        let target = match role {
            Role::Primary => &mut slot.0,
            Role::Secondary => &mut slot.1,
        };
        if target.is_some() {
            return Err(FailoverError::state_parse(
                line_no,
                format!("duplicate {} record for group '{}'", role, group),
            ));
        }
        *target = Some(host);
    }

    let mut mapping = RoleMapping::new();
    for (group, slots) in pending {
        match slots {
            (Some(primary), Some(secondary)) => {
                let assignment = RoleAssignment::new(primary, secondary)
                    .map_err(|e| FailoverError::StateMismatch(format!("group '{}': {}", group, e)))?;
                mapping.insert(group, assignment);
            }
            _ => {
                return Err(FailoverError::StateMismatch(format!(
                    "group '{}' is missing a primary or secondary record",
                    group
                )))
            }
        }
    }

    Ok(mapping)
}
