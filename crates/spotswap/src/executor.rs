//! Replacement executor
//!
//! Drives the membership swap on one group: pick the on-demand target,
//! obtain a spot instance, attach it, detach the target with a capacity
//! decrement, then terminate. The group's declared desired/min/max are
//! never written; capacity moves only through attach and detach.
//!
//! ```text
//! Evaluate ─ no-op ──────────────────────────────▶ Done
//!    └─▶ Select ─▶ RequestSpot ─▶ WaitSpotRunning
//!                                      │
//!                                 AttachSpot
//!                                      │
//!                               DetachOnDemand
//!                                      │
//!                             TerminateOnDemand ─▶ Done
//! any step ─▶ Abort (logged, recovered from request tags next tick)
//! ```

use crate::cloud::{Connections, SpotLaunchRequest, SpotRequest};
use crate::error::{EngineError, Result};
use chrono::Utc;
use serde::Serialize;
use spotswap_core::catalog::RegionalCatalog;
use spotswap_core::config::{Config, TerminationMethod};
use spotswap_core::selector::{select_candidates, Candidate};
use spotswap_core::types::{GroupSnapshot, InstanceSnapshot, Lifecycle, VmState};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How often the spot request is re-checked while waiting
const SPOT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Pending requests older than this are no longer adopted
const PENDING_ADOPTION_MAX_AGE_SECS: i64 = 3600;

/// States of one replacement, externally observable through logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReplacementState {
    /// Counting members against the on-demand floor
    Evaluate,
    /// Running the candidate selector
    Select,
    /// Adopting or submitting a spot request
    RequestSpot,
    /// Waiting for the spot instance to run and pass its grace period
    WaitSpotRunning,
    /// Attaching the spot instance to the group
    AttachSpot,
    /// Detaching the on-demand target with a capacity decrement
    DetachOnDemand,
    /// Terminating the detached target
    TerminateOnDemand,
    /// Finished
    Done,
}

/// What happened to one group this tick
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplacementOutcome {
    /// Group the outcome is about
    pub group: String,
    /// Action taken
    pub action: ReplacementAction,
}

/// Action taken by the executor
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ReplacementAction {
    /// Nothing to do
    None {
        /// Why no replacement was attempted
        reason: String,
    },
    /// Full swap completed
    Replaced {
        /// Replaced on-demand instance
        on_demand_id: String,
        /// Attached spot instance
        spot_id: String,
    },
    /// Spot attached but the target could not be detached; the group runs
    /// with surplus capacity until the next tick
    AttachedOnly {
        /// Attached spot instance
        spot_id: String,
    },
    /// Replacement abandoned this tick
    Aborted {
        /// Why it was abandoned
        reason: String,
    },
}

/// Computes the on-demand floor for one group.
pub(crate) fn on_demand_floor(conf: &Config, group: &GroupSnapshot) -> i64 {
    let percent_floor = ((conf.min_on_demand_percentage / 100.0)
        * f64::from(group.desired_capacity))
    .ceil() as i64;
    conf.min_on_demand_number.max(percent_floor)
}

/// Picks the replacement target: the newest-launched on-demand member in
/// the zone holding the most on-demand members, ties broken by id.
pub(crate) fn pick_target<'a>(on_demand: &[&'a InstanceSnapshot]) -> Option<&'a InstanceSnapshot> {
    let mut zone_counts: HashMap<&str, usize> = HashMap::new();
    for instance in on_demand {
        *zone_counts
            .entry(instance.availability_zone.as_str())
            .or_default() += 1;
    }
    let busiest = zone_counts.values().copied().max()?;

    let mut in_busiest: Vec<&&InstanceSnapshot> = on_demand
        .iter()
        .filter(|i| zone_counts[i.availability_zone.as_str()] == busiest)
        .collect();
    in_busiest.sort_by(|a, b| {
        b.launch_time
            .cmp(&a.launch_time)
            .then_with(|| a.id.cmp(&b.id))
    });
    in_busiest.first().map(|i| **i)
}

/// Drives replacements against one region's groups
pub struct Executor<'a> {
    conf: &'a Config,
    services: &'a Connections,
    catalog: &'a RegionalCatalog,
    instances: &'a HashMap<String, InstanceSnapshot>,
}

impl<'a> Executor<'a> {
    /// Create an executor over one region's scan results
    pub fn new(
        conf: &'a Config,
        services: &'a Connections,
        catalog: &'a RegionalCatalog,
        instances: &'a HashMap<String, InstanceSnapshot>,
    ) -> Self {
        Self {
            conf,
            services,
            catalog,
            instances,
        }
    }

    /// Run at most one replacement on one group.
    pub async fn run(&self, group: &GroupSnapshot) -> Result<ReplacementOutcome> {
        let no_action = |reason: &str| ReplacementOutcome {
            group: group.name.clone(),
            action: ReplacementAction::None {
                reason: reason.to_string(),
            },
        };
        let aborted = |reason: String| ReplacementOutcome {
            group: group.name.clone(),
            action: ReplacementAction::Aborted { reason },
        };

        self.transition(group, ReplacementState::Evaluate);

        // don't race the group's own scaling activities
        match self.services.groups.scaling_activities(&group.name).await {
            Ok(activities) if activities.iter().any(|a| a.in_progress()) => {
                return Ok(no_action("scaling activity in progress"));
            }
            Ok(_) => {}
            Err(err) => {
                warn!(group = %group.name, error = %err, "could not check scaling activities");
            }
        }

        let members: Vec<&InstanceSnapshot> = group
            .member_ids
            .iter()
            .filter_map(|id| self.instances.get(id))
            .filter(|i| i.state.is_active())
            .collect();
        // scale-in protected members are never replacement targets
        let on_demand: Vec<&InstanceSnapshot> = members
            .iter()
            .copied()
            .filter(|i| i.lifecycle == Lifecycle::OnDemand)
            .filter(|i| !group.scale_in_protected.contains(&i.id))
            .collect();

        let floor = on_demand_floor(self.conf, group);
        if (on_demand.len() as i64) <= floor {
            debug!(
                group = %group.name,
                on_demand = on_demand.len(),
                floor = floor,
                "group at or below on-demand floor"
            );
            return Ok(no_action("at or below the on-demand floor"));
        }

        let Some(target) = pick_target(&on_demand) else {
            return Ok(no_action("no on-demand target"));
        };

        self.transition(group, ReplacementState::Select);
        let Some(original) = self.catalog.lookup(&target.instance_type) else {
            return Ok(aborted(format!(
                "type {} missing from the catalog",
                target.instance_type
            )));
        };

        let mut zones: Vec<String> = members
            .iter()
            .map(|i| i.availability_zone.clone())
            .collect();
        zones.sort();
        zones.dedup();

        let candidates = select_candidates(original, self.catalog, self.conf, &zones);
        if candidates.is_empty() {
            return Ok(aborted(format!(
                "no acceptable spot candidate for {}",
                target.instance_type
            )));
        }

        self.transition(group, ReplacementState::RequestSpot);
        let Some(request) = self.acquire_spot_request(group, target, &candidates).await? else {
            return Ok(aborted(
                "spot capacity unavailable for every candidate".to_string(),
            ));
        };

        self.transition(group, ReplacementState::WaitSpotRunning);
        let spot_id = match self.wait_spot_running(&request).await {
            Ok(id) => id,
            Err(err) => {
                warn!(
                    group = %group.name,
                    request = %request.request_id,
                    error = %err,
                    "spot instance did not start, cancelling request"
                );
                if let Err(cancel_err) = self
                    .services
                    .compute
                    .cancel_spot_request(&request.request_id)
                    .await
                {
                    warn!(
                        request = %request.request_id,
                        error = %cancel_err,
                        "could not cancel spot request"
                    );
                }
                return Ok(aborted(format!("spot instance did not start: {err}")));
            }
        };

        if group.health_check_grace_secs > 0 {
            debug!(
                group = %group.name,
                grace_secs = group.health_check_grace_secs,
                "waiting out health check grace period"
            );
            tokio::time::sleep(Duration::from_secs(u64::from(group.health_check_grace_secs)))
                .await;
        }

        self.transition(group, ReplacementState::AttachSpot);
        self.services
            .groups
            .attach_instance(&group.name, &spot_id)
            .await?;
        info!(group = %group.name, instance = %spot_id, "attached spot instance");

        self.transition(group, ReplacementState::DetachOnDemand);
        if let Err(err) = self
            .services
            .groups
            .detach_instance(&group.name, &target.id, true)
            .await
        {
            warn!(
                group = %group.name,
                instance = %target.id,
                error = %err,
                "detach failed; leaving group with surplus capacity for the next tick"
            );
            return Ok(ReplacementOutcome {
                group: group.name.clone(),
                action: ReplacementAction::AttachedOnly { spot_id },
            });
        }

        self.transition(group, ReplacementState::TerminateOnDemand);
        match self.conf.termination_method {
            TerminationMethod::AutoScaling => {
                self.services
                    .groups
                    .terminate_in_group(&target.id, false)
                    .await?
            }
            TerminationMethod::Terminate => {
                self.services.compute.terminate_instance(&target.id).await?
            }
        }

        self.transition(group, ReplacementState::Done);
        info!(
            group = %group.name,
            on_demand = %target.id,
            spot = %spot_id,
            "replacement complete"
        );
        Ok(ReplacementOutcome {
            group: group.name.clone(),
            action: ReplacementAction::Replaced {
                on_demand_id: target.id.clone(),
                spot_id,
            },
        })
    }

    fn transition(&self, group: &GroupSnapshot, state: ReplacementState) {
        debug!(group = %group.name, state = ?state, "replacement state");
    }

    /// Adopt a recent pending request for this group, or submit a new one
    /// for the best workable candidate. `None` means every candidate hit a
    /// capacity error.
    async fn acquire_spot_request(
        &self,
        group: &GroupSnapshot,
        target: &InstanceSnapshot,
        candidates: &[Candidate],
    ) -> Result<Option<SpotRequest>> {
        let pending = self
            .services
            .compute
            .spot_requests_for_group(&group.name)
            .await?;
        let now = Utc::now();
        if let Some(existing) = pending
            .into_iter()
            .filter(|r| {
                r.state.is_pending()
                    && (now - r.created_at)
                        < chrono::Duration::seconds(PENDING_ADOPTION_MAX_AGE_SECS)
            })
            .max_by_key(|r| r.created_at)
        {
            info!(
                group = %group.name,
                request = %existing.request_id,
                "adopting pending spot request"
            );
            return Ok(Some(existing));
        }

        for candidate in candidates {
            // a subnet is zone-specific; only reuse it in the same zone
            let subnet_id = if candidate.availability_zone == target.availability_zone {
                target.subnet_id.clone()
            } else {
                None
            };
            let request = SpotLaunchRequest {
                group_name: group.name.clone(),
                instance_type: candidate.instance_type.clone(),
                availability_zone: candidate.availability_zone.clone(),
                bid_price: candidate.bid_price,
                image_id: target.image_id.clone(),
                key_name: target.key_name.clone(),
                security_group_ids: target.security_group_ids.clone(),
                subnet_id,
            };
            match self.services.compute.request_spot(&request).await {
                Ok(spot_request) => {
                    info!(
                        group = %group.name,
                        request = %spot_request.request_id,
                        instance_type = %candidate.instance_type,
                        zone = %candidate.availability_zone,
                        bid = candidate.bid_price,
                        "submitted spot request"
                    );
                    return Ok(Some(spot_request));
                }
                Err(EngineError::Capacity(msg)) => {
                    warn!(
                        group = %group.name,
                        instance_type = %candidate.instance_type,
                        zone = %candidate.availability_zone,
                        "no spot capacity, trying next candidate: {msg}"
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    /// Wait until the request's instance is running.
    async fn wait_spot_running(&self, request: &SpotRequest) -> Result<String> {
        let timeout = Duration::from_secs(self.conf.spot_request_timeout_secs);
        let deadline = tokio::time::Instant::now() + timeout;
        let mut current = request.clone();

        loop {
            if let Some(instance_id) = current.instance_id.clone() {
                match self.services.compute.describe_instance(&instance_id).await? {
                    Some(instance) if instance.state == VmState::Running => {
                        return Ok(instance_id);
                    }
                    Some(instance)
                        if matches!(
                            instance.state,
                            VmState::Terminated | VmState::ShuttingDown
                        ) =>
                    {
                        return Err(EngineError::InstanceNotFound(instance_id));
                    }
                    _ => {}
                }
            } else if !current.state.is_pending() {
                return Err(EngineError::Capacity(format!(
                    "spot request {} ended without an instance",
                    current.request_id
                )));
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(EngineError::Timeout(timeout));
            }
            tokio::time::sleep(SPOT_POLL_INTERVAL).await;

            if let Some(updated) = self
                .services
                .compute
                .describe_spot_request(&current.request_id)
                .await?
            {
                current = updated;
            }
        }
    }
}
