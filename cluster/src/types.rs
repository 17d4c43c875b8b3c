use citusha_common::{GroupId, HostRef};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-group failover state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GroupState {
    /// Configured primary is serving writes
    StableOnPrimary,

    /// Primary is down and promotion of the secondary has not been confirmed
    PrimaryDownPromoting,

    /// Neither host is reachable
    BothDown,

    /// The former secondary has been promoted and is serving writes
    StableOnPromoted,

    /// The promoted primary is down and the only reachable host is a demoted
    /// former primary that has not been re-attached. An operator decides.
    AwaitingOperator,
}

impl fmt::Display for GroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GroupState::StableOnPrimary => "STABLE_ON_PRIMARY",
            GroupState::PrimaryDownPromoting => "PRIMARY_DOWN_PROMOTING",
            GroupState::BothDown => "BOTH_DOWN",
            GroupState::StableOnPromoted => "STABLE_ON_PROMOTED",
            GroupState::AwaitingOperator => "AWAITING_OPERATOR",
        };
        f.write_str(name)
    }
}

/// What happened to one group during a tick
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum GroupOutcome {
    /// Primary and secondary both reachable, nothing to do
    Healthy,

    /// Primary reachable, secondary not
    SecondaryDown,

    /// Secondary promoted; coordinators listed in `repoint_failures` did not
    /// accept the metadata update
    Promoted {
        new_primary: HostRef,
        repoint_failures: Vec<HostRef>,
    },

    /// Promotion statement failed; retried next tick
    PromotionFailed { target: HostRef, detail: String },

    /// Neither host reachable
    Unavailable,

    /// Demoted former primary is reachable again and was recorded as secondary
    FormerPrimaryReturned { host: HostRef },

    /// Promoted primary is down; the demoted former primary is not promoted
    /// back automatically
    ManualInterventionRequired { reachable: HostRef },
}

/// Result of one pass over every group
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TickReport {
    pub outcomes: Vec<(GroupId, GroupOutcome)>,

    /// Shutdown was requested before every group was evaluated
    pub interrupted: bool,
}

impl TickReport {
    pub fn outcome(&self, group: &str) -> Option<&GroupOutcome> {
        self.outcomes
            .iter()
            .find(|(id, _)| id.as_str() == group)
            .map(|(_, outcome)| outcome)
    }

    pub fn promotions(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, GroupOutcome::Promoted { .. }))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display_matches_log_names() {
        assert_eq!(GroupState::StableOnPrimary.to_string(), "STABLE_ON_PRIMARY");
        assert_eq!(GroupState::PrimaryDownPromoting.to_string(), "PRIMARY_DOWN_PROMOTING");
        assert_eq!(GroupState::AwaitingOperator.to_string(), "AWAITING_OPERATOR");
    }

    #[test]
    fn test_report_lookup() {
        let report = TickReport {
            outcomes: vec![
                (GroupId::from("worker1"), GroupOutcome::Healthy),
                (
                    GroupId::from("worker2"),
                    GroupOutcome::Promoted {
                        new_primary: HostRef::pg("secondary2"),
                        repoint_failures: vec![],
                    },
                ),
            ],
            interrupted: false,
        };

        assert_eq!(report.outcome("worker1"), Some(&GroupOutcome::Healthy));
        assert!(report.outcome("worker3").is_none());
        assert_eq!(report.promotions(), 1);
    }
}
