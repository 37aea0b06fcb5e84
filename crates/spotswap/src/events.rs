//! Trigger event classification
//!
//! The engine is invoked with one JSON envelope per run: a scheduled
//! tick, a spot interruption warning, a rebalance recommendation, or an
//! instance-launch lifecycle action. The envelope is classified into a
//! tagged variant at the entry point; nothing downstream looks at raw
//! JSON.

use crate::cloud::Connections;
use crate::error::{EngineError, Result};
use serde_json::Value;
use spotswap_core::types::Lifecycle;
use tracing::{info, warn};

/// Interruption warning detail type
pub const INTERRUPTION_DETAIL_TYPE: &str = "Spot Instance Interruption Warning";

/// Rebalance recommendation detail type
pub const REBALANCE_DETAIL_TYPE: &str = "EC2 Instance Rebalance Recommendation";

/// Lifecycle action detail type
pub const LIFECYCLE_DETAIL_TYPE: &str = "EC2 Instance-launch Lifecycle Action";

/// One classified trigger event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Periodic tick: run the full pipeline in every enabled region
    ScheduledTick,
    /// The market is about to reclaim a spot instance
    SpotInterruption {
        /// Doomed instance
        instance_id: String,
    },
    /// The market recommends moving off a spot instance
    RebalanceRecommendation {
        /// Affected instance
        instance_id: String,
    },
    /// A spot instance just launched through a lifecycle hook
    LifecycleLaunch {
        /// Hook that fired
        hook_name: String,
        /// Launched instance
        instance_id: String,
        /// Owning group
        group_name: String,
    },
}

impl EngineEvent {
    /// Classify a raw trigger envelope.
    pub fn parse(raw: &Value) -> Result<Self> {
        let source = raw
            .get("source")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::Event("envelope has no source".to_string()))?;

        match source {
            "scheduled" => Ok(Self::ScheduledTick),
            "compute" => {
                let detail_type = detail_type(raw)?;
                let instance_id = detail_str(raw, "instance-id")?;
                match detail_type {
                    INTERRUPTION_DETAIL_TYPE => Ok(Self::SpotInterruption { instance_id }),
                    REBALANCE_DETAIL_TYPE => Ok(Self::RebalanceRecommendation { instance_id }),
                    other => Err(EngineError::Event(format!(
                        "unknown compute detail type {other:?}"
                    ))),
                }
            }
            "autoscaling" => {
                let detail_type = detail_type(raw)?;
                if detail_type != LIFECYCLE_DETAIL_TYPE {
                    return Err(EngineError::Event(format!(
                        "unknown autoscaling detail type {detail_type:?}"
                    )));
                }
                Ok(Self::LifecycleLaunch {
                    hook_name: detail_str(raw, "LifecycleHookName")?,
                    instance_id: detail_str(raw, "EC2InstanceId")?,
                    group_name: detail_str(raw, "AutoScalingGroupName")?,
                })
            }
            other => Err(EngineError::Event(format!("unknown event source {other:?}"))),
        }
    }
}

fn detail_type(raw: &Value) -> Result<&str> {
    raw.get("detail-type")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::Event("envelope has no detail-type".to_string()))
}

fn detail_str(raw: &Value, key: &str) -> Result<String> {
    raw.get("detail")
        .and_then(|d| d.get(key))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| EngineError::Event(format!("envelope detail has no {key}")))
}

/// Detach a doomed spot instance from its group so the group self-heals.
///
/// The detach does not decrement desired capacity: the group notices the
/// missing member and launches an on-demand replacement on its own.
/// Returns whether the instance was found and detached in this region.
pub async fn revert_replacement(services: &Connections, instance_id: &str) -> Result<bool> {
    let Some(instance) = services.compute.describe_instance(instance_id).await? else {
        return Ok(false);
    };
    if instance.lifecycle != Lifecycle::Spot {
        warn!(instance = %instance_id, "signalled instance is not spot, ignoring");
        return Ok(false);
    }
    let Some(group) = instance.group_name().map(str::to_string) else {
        info!(instance = %instance_id, "signalled spot instance belongs to no group");
        return Ok(false);
    };

    info!(
        instance = %instance_id,
        group = %group,
        "detaching doomed spot instance so the group can self-heal"
    );
    services
        .groups
        .detach_instance(&group, instance_id, false)
        .await?;
    Ok(true)
}
