use crate::health::HealthProbe;
use crate::sql::{SqlExecutor, Statement};
use crate::types::*;
use crate::ControllerConfig;
use citusha_common::{FailoverError, GroupId, GroupTopology, HostRef, Result, RoleAssignment, RoleMapping, Topology};
use citusha_storage::RoleStateStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// In-memory bookkeeping for one group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GroupTracker {
    state: GroupState,
    /// The demoted former primary has not been seen since the promotion
    awaiting_rejoin: bool,
}

impl GroupTracker {
    fn from_assignment(group: &GroupTopology, assignment: &RoleAssignment) -> Self {
        if assignment.primary() == &group.primary {
            Self {
                state: GroupState::StableOnPrimary,
                awaiting_rejoin: false,
            }
        } else {
            Self {
                state: GroupState::StableOnPromoted,
                awaiting_rejoin: true,
            }
        }
    }

    fn stable_state(promoted: bool) -> GroupState {
        if promoted {
            GroupState::StableOnPromoted
        } else {
            GroupState::StableOnPrimary
        }
    }
}

/// What to do for a group given one round of probes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Pass,
    PassSecondaryDown,
    RecordRejoin,
    Promote,
    HoldForOperator,
    Unavailable,
}

/// Pure decision step. `promoted` means the current primary is the group's
/// configured secondary, so the current secondary is a demoted former primary.
fn decide(
    promoted: bool,
    awaiting_rejoin: bool,
    primary_up: bool,
    secondary_up: bool,
) -> Decision {
    match (primary_up, secondary_up) {
        (true, true) if awaiting_rejoin => Decision::RecordRejoin,
        (true, true) => Decision::Pass,
        (true, false) => Decision::PassSecondaryDown,
        // A demoted former primary may hold writes the promoted node never
        // saw; re-promoting it needs an operator.
        (false, true) if promoted => Decision::HoldForOperator,
        (false, true) => Decision::Promote,
        (false, false) => Decision::Unavailable,
    }
}

/// Failover controller: polls every group, promotes secondaries whose
/// primary disappeared, repoints coordinator metadata and persists the
/// resulting role mapping.
pub struct FailoverController {
    topology: Topology,
    config: ControllerConfig,
    probe: Arc<dyn HealthProbe>,
    sql: Arc<dyn SqlExecutor>,
    store: Arc<dyn RoleStateStore>,

    /// Last mapping known to be on disk; `None` until the first successful load
    committed: Option<RoleMapping>,
    trackers: BTreeMap<GroupId, GroupTracker>,
}

impl FailoverController {
    /// Create a controller. Role state is loaded on the first tick.
    pub fn new(
        topology: Topology,
        config: ControllerConfig,
        probe: Arc<dyn HealthProbe>,
        sql: Arc<dyn SqlExecutor>,
        store: Arc<dyn RoleStateStore>,
    ) -> Self {
        Self {
            topology,
            config,
            probe,
            sql,
            store,
            committed: None,
            trackers: BTreeMap::new(),
        }
    }

    /// Mapping as last persisted
    pub fn mapping(&self) -> Option<&RoleMapping> {
        self.committed.as_ref()
    }

    /// Current state of `group`, once it has been evaluated or loaded
    pub fn group_state(&self, group: &GroupId) -> Option<GroupState> {
        self.trackers.get(group).map(|t| t.state)
    }

    /// Configured cluster layout
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Run until `shutdown` is cancelled. A cancelled controller finishes
    /// the group it is working on before returning.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let interval = self.config.poll_interval();
        info!(
            "Starting failover controller: groups={}, coordinators={}, poll_interval={:?}",
            self.topology.groups.len(),
            self.topology.coordinators.len(),
            interval
        );

        loop {
            match self.tick_with_shutdown(&shutdown).await {
                Ok(report) => {
                    debug!(
                        "Tick complete: groups={}, promotions={}",
                        report.outcomes.len(),
                        report.promotions()
                    );
                }
                Err(e) => {
                    error!("Tick aborted, retrying next interval: {}", e);
                }
            }

            if shutdown.is_cancelled() {
                break;
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        info!("Failover controller stopped");
    }

    /// One full pass over every group
    pub async fn tick(&mut self) -> Result<TickReport> {
        self.tick_with_shutdown(&CancellationToken::new()).await
    }

    async fn tick_with_shutdown(&mut self, shutdown: &CancellationToken) -> Result<TickReport> {
        metrics::counter!("citusha_ticks_total").increment(1);

        self.ensure_loaded().await?;

        let mut report = TickReport::default();
        let groups = self.topology.groups.clone();

        for group in &groups {
            if shutdown.is_cancelled() {
                info!("Shutdown requested, skipping remaining groups");
                report.interrupted = true;
                break;
            }

            let outcome = self.evaluate_group(group).await?;
            report.outcomes.push((group.name.clone(), outcome));
        }

        Ok(report)
    }

    /// Load (or seed) the mapping once. Failure leaves the controller
    /// unloaded so the next tick tries again.
    async fn ensure_loaded(&mut self) -> Result<()> {
        if self.committed.is_some() {
            return Ok(());
        }

        let mapping = match self.store.load().await? {
            None => {
                let mapping = self.topology.default_mapping();
                self.store.save(&mapping).await?;
                info!("Seeded role state with configured defaults for {} groups", mapping.len());
                mapping
            }
            Some(loaded) => {
                let (mapping, seeded) = self.topology.reconcile(loaded)?;
                if !seeded.is_empty() {
                    warn!("Role state had no entry for groups {:?}; seeding defaults", seeded);
                    self.store.save(&mapping).await?;
                }
                mapping
            }
        };

        self.trackers.clear();
        for group in &self.topology.groups {
            let assignment = mapping
                .get(&group.name)
                .ok_or_else(|| FailoverError::UnknownGroup(group.name.to_string()))?;
            let tracker = GroupTracker::from_assignment(group, assignment);
            info!(
                group = %group.name,
                "Role assignment: primary={}, secondary={}, state={}",
                assignment.primary(),
                assignment.secondary(),
                tracker.state
            );
            self.trackers.insert(group.name.clone(), tracker);
        }

        self.committed = Some(mapping);
        Ok(())
    }

    /// Copy of the last persisted mapping. Never substitutes an empty one,
    /// which would wipe every group on the next save.
    fn committed_mapping(&self) -> Result<RoleMapping> {
        self.committed
            .clone()
            .ok_or_else(|| FailoverError::StateMismatch("role state has not been loaded".into()))
    }

    /// Replace the persisted mapping. The in-memory copy only moves forward
    /// once the write succeeded.
    async fn commit(&mut self, mapping: RoleMapping) -> Result<()> {
        if let Err(e) = self.store.save(&mapping).await {
            metrics::counter!("citusha_state_write_failures_total").increment(1);
            return Err(e);
        }
        self.committed = Some(mapping);
        Ok(())
    }

    async fn evaluate_group(&mut self, group: &GroupTopology) -> Result<GroupOutcome> {
        let assignment = self
            .committed
            .as_ref()
            .and_then(|m| m.get(&group.name))
            .cloned()
            .ok_or_else(|| FailoverError::UnknownGroup(group.name.to_string()))?;
        let primary = assignment.primary().clone();
        let secondary = assignment.secondary().clone();
        let promoted = primary != group.primary;

        let timeout = self.config.probe_timeout();
        let (primary_up, secondary_up) = tokio::join!(
            self.probe.is_reachable(&primary, timeout),
            self.probe.is_reachable(&secondary, timeout),
        );

        let mut tracker = self
            .trackers
            .get(&group.name)
            .copied()
            .unwrap_or_else(|| GroupTracker::from_assignment(group, &assignment));

        let decision = decide(promoted, tracker.awaiting_rejoin, primary_up, secondary_up);
        let name = &group.name;

        let outcome = match decision {
            Decision::Pass => {
                tracker.state = GroupTracker::stable_state(promoted);
                info!(group = %name, "Pass: primary {} reachable, secondary {} reachable", primary, secondary);
                GroupOutcome::Healthy
            }
            Decision::PassSecondaryDown => {
                tracker.state = GroupTracker::stable_state(promoted);
                info!(group = %name, "Pass: primary {} reachable", primary);
                warn!(group = %name, "Secondary {} unreachable, group has no standby", secondary);
                GroupOutcome::SecondaryDown
            }
            Decision::RecordRejoin => {
                // Roles already say secondary; persist the decision and tell
                // the operator replication needs re-attaching by hand.
                let mapping = self.committed_mapping()?;
                self.commit(mapping).await?;
                tracker.awaiting_rejoin = false;
                tracker.state = GroupState::StableOnPromoted;
                warn!(
                    group = %name,
                    "Former primary {} is reachable again and stays secondary of {}. \
                     Re-attach it as a streaming replica of {} manually",
                    secondary, primary, primary
                );
                GroupOutcome::FormerPrimaryReturned { host: secondary }
            }
            Decision::Promote => {
                tracker.state = GroupState::PrimaryDownPromoting;
                let outcome = match self.promote(group, &primary, &secondary).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        self.trackers.insert(name.clone(), tracker);
                        return Err(e);
                    }
                };
                if let GroupOutcome::Promoted { .. } = outcome {
                    tracker.state = GroupState::StableOnPromoted;
                    tracker.awaiting_rejoin = true;
                }
                outcome
            }
            Decision::HoldForOperator => {
                tracker.state = GroupState::AwaitingOperator;
                warn!(
                    group = %name,
                    "Primary {} unreachable; {} is a demoted former primary and will not be promoted automatically. Manual intervention required",
                    primary, secondary
                );
                GroupOutcome::ManualInterventionRequired { reachable: secondary }
            }
            Decision::Unavailable => {
                tracker.state = GroupState::BothDown;
                metrics::counter!("citusha_group_unavailable_total", "group" => name.to_string())
                    .increment(1);
                warn!(
                    group = %name,
                    "Group completely unavailable: primary {} and secondary {} unreachable",
                    primary, secondary
                );
                GroupOutcome::Unavailable
            }
        };

        self.trackers.insert(name.clone(), tracker);
        Ok(outcome)
    }

    /// Promote `secondary`, repoint every coordinator and persist the swap.
    /// A failed promotion leaves persisted state untouched.
    async fn promote(
        &mut self,
        group: &GroupTopology,
        primary: &HostRef,
        secondary: &HostRef,
    ) -> Result<GroupOutcome> {
        let name = &group.name;
        let sql_timeout = self.config.sql_timeout();

        warn!(group = %name, "Primary {} unreachable, promoting secondary {}", primary, secondary);

        // Resolve the base mapping before touching the database
        let mut next = self.committed_mapping()?;

        let promote = Statement::Promote;
        if let Err(failure) = self.sql.execute(secondary, &promote, sql_timeout).await {
            metrics::counter!("citusha_promotion_failures_total", "group" => name.to_string())
                .increment(1);
            warn!(
                group = %name,
                "Statement {} failed on {}: {}. Will retry next tick",
                promote.class(), secondary, failure
            );
            return Ok(GroupOutcome::PromotionFailed {
                target: secondary.clone(),
                detail: failure.detail,
            });
        }

        if !next.promote(name, secondary)? {
            // Already recorded as primary; nothing to swap or persist
            debug!(group = %name, "{} already primary in role state", secondary);
        }

        let repoint = Statement::RepointMetadata {
            from: primary.clone(),
            to: secondary.clone(),
        };
        let mut repoint_failures = Vec::new();
        for coordinator in &self.topology.coordinators {
            match self.sql.execute(coordinator, &repoint, sql_timeout).await {
                Ok(()) => {
                    info!(
                        group = %name,
                        "Coordinator {} now routes {} to {}",
                        coordinator, primary, secondary
                    );
                }
                Err(failure) => {
                    metrics::counter!(
                        "citusha_repoint_failures_total",
                        "coordinator" => coordinator.to_string()
                    )
                    .increment(1);
                    warn!(
                        group = %name,
                        "Statement {} failed on {}: {}",
                        repoint.class(), coordinator, failure
                    );
                    repoint_failures.push(coordinator.clone());
                }
            }
        }

        self.commit(next).await?;

        metrics::counter!("citusha_promotions_total", "group" => name.to_string()).increment(1);
        info!(
            group = %name,
            "Promoted {} to primary; {} recorded as secondary pending its return",
            secondary, primary
        );

        Ok(GroupOutcome::Promoted {
            new_primary: secondary.clone(),
            repoint_failures,
        })
    }
}
