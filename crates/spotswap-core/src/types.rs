//! Snapshot types observed from the cloud
//!
//! These are plain values: an instance carries the name of its owning
//! group, never a back-pointer, so regions can index everything by id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Tag key set by the autoscaling service on group members
pub const GROUP_MEMBERSHIP_TAG: &str = "aws:autoscaling:groupName";

/// Tag key set by CloudFormation on resources it owns
pub const STACK_NAME_TAG: &str = "aws:cloudformation:stack-name";

/// Billing lifecycle of a virtual machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lifecycle {
    /// Guaranteed capacity at list price
    OnDemand,
    /// Preemptible, market-priced capacity
    Spot,
}

/// Instance state as reported by the compute service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmState {
    /// Instance is pending
    Pending,
    /// Instance is running
    Running,
    /// Instance is stopping
    Stopping,
    /// Instance is stopped
    Stopped,
    /// Instance is shutting down
    ShuttingDown,
    /// Instance is terminated
    Terminated,
}

impl VmState {
    /// Check whether the instance can serve traffic or become healthy
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Pending)
    }
}

/// A resource tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    /// Tag key
    pub key: String,
    /// Tag value; may be a glob pattern when used as a filter
    pub value: String,
}

impl Tag {
    /// Create a tag from key and value
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// One virtual machine, as observed during the region scan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    /// Instance id
    pub id: String,

    /// Instance type (e.g. "m5.large")
    pub instance_type: String,

    /// Availability zone the instance runs in
    pub availability_zone: String,

    /// On-demand or spot
    pub lifecycle: Lifecycle,

    /// Current state
    pub state: VmState,

    /// Launch time
    pub launch_time: DateTime<Utc>,

    /// Image the instance was launched from
    pub image_id: Option<String>,

    /// Key pair name
    pub key_name: Option<String>,

    /// Security group ids
    pub security_group_ids: Vec<String>,

    /// Subnet id
    pub subnet_id: Option<String>,

    /// Resource tags
    pub tags: HashMap<String, String>,
}

impl InstanceSnapshot {
    /// Name of the autoscaling group this instance belongs to, if any
    pub fn group_name(&self) -> Option<&str> {
        self.tags.get(GROUP_MEMBERSHIP_TAG).map(String::as_str)
    }
}

/// One autoscaling group, as observed during the region scan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSnapshot {
    /// Group name
    pub name: String,

    /// Declared desired capacity
    pub desired_capacity: i32,

    /// Declared minimum size
    pub min_size: i32,

    /// Declared maximum size
    pub max_size: i32,

    /// Whether the group already mixes capacity types natively
    pub has_mixed_instances_policy: bool,

    /// Health check grace period in seconds
    pub health_check_grace_secs: u32,

    /// Ids of current members
    pub member_ids: Vec<String>,

    /// Members protected from scale-in
    pub scale_in_protected: HashSet<String>,

    /// Suspended scaling processes
    pub suspended_processes: Vec<String>,

    /// Group tags
    pub tags: HashMap<String, String>,
}

impl GroupSnapshot {
    /// Name of the CloudFormation stack that owns this group, if any
    pub fn stack_name(&self) -> Option<&str> {
        self.tags.get(STACK_NAME_TAG).map(String::as_str)
    }

    /// Whether the group carries the given tag, with glob value matching.
    ///
    /// An uncompilable pattern matches nothing.
    pub fn has_tag(&self, filter: &Tag) -> bool {
        match self.tags.get(&filter.key) {
            Some(value) => glob::Pattern::new(&filter.value)
                .map(|p| p.matches(value))
                .unwrap_or(false),
            None => false,
        }
    }
}
