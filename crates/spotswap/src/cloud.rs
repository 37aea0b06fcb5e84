//! Cloud capability seams
//!
//! The engine consumes four narrow capability sets so the region
//! controller and executor never touch SDK types directly, and tests can
//! substitute in-memory fakes. One [`Connections`] value per region
//! bundles the four implementations behind `Arc<dyn _>`.

use crate::error::{EngineError, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_types::region::Region as AwsRegion;
use chrono::{DateTime, Utc};
use spotswap_core::catalog::SpotPriceRecord;
use spotswap_core::types::{GroupSnapshot, InstanceSnapshot, Lifecycle, VmState};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Tag key marking a spot request with the group it was issued for
pub const GROUP_TAG_KEY: &str = "spotswap:group";

/// Initial backoff delay for transient API errors
const RETRY_BASE_DELAY_MS: u64 = 500;

/// State of a spot instance request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpotRequestState {
    /// Request submitted, not yet fulfilled
    Open,
    /// Request fulfilled, instance assigned
    Active,
    /// Request closed
    Closed,
    /// Request cancelled
    Cancelled,
    /// Request failed
    Failed,
}

impl SpotRequestState {
    /// Whether the request is still working towards an instance
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Open | Self::Active)
    }
}

/// One spot instance request, as observed from the cloud
#[derive(Debug, Clone)]
pub struct SpotRequest {
    /// Request id
    pub request_id: String,
    /// Fulfilled instance id, once assigned
    pub instance_id: Option<String>,
    /// Request state
    pub state: SpotRequestState,
    /// Submission time
    pub created_at: DateTime<Utc>,
}

/// Parameters for a new spot request.
///
/// Everything except market type and price is copied from the instance
/// being replaced.
#[derive(Debug, Clone)]
pub struct SpotLaunchRequest {
    /// Group the replacement is for; recorded as a request tag
    pub group_name: String,
    /// Instance type to request
    pub instance_type: String,
    /// Availability zone to place the instance in
    pub availability_zone: String,
    /// Maximum hourly price
    pub bid_price: f64,
    /// Image to launch from
    pub image_id: Option<String>,
    /// Key pair name
    pub key_name: Option<String>,
    /// Security group ids
    pub security_group_ids: Vec<String>,
    /// Subnet id
    pub subnet_id: Option<String>,
}

/// One scaling activity on a group
#[derive(Debug, Clone)]
pub struct ScalingActivity {
    /// Activity status code as reported by the service
    pub status_code: String,
}

impl ScalingActivity {
    /// Whether the group is still busy with this activity
    pub fn in_progress(&self) -> bool {
        !matches!(self.status_code.as_str(), "Successful" | "Failed" | "Cancelled")
    }
}

/// Autoscaling group operations
#[async_trait]
pub trait GroupApi: Send + Sync {
    /// Describe all groups in the region, following pagination
    async fn describe_groups(&self) -> Result<Vec<GroupSnapshot>>;

    /// Recent scaling activities for one group
    async fn scaling_activities(&self, group: &str) -> Result<Vec<ScalingActivity>>;

    /// Attach a running instance to a group
    async fn attach_instance(&self, group: &str, instance_id: &str) -> Result<()>;

    /// Detach an instance, optionally decrementing desired capacity
    async fn detach_instance(&self, group: &str, instance_id: &str, decrement: bool) -> Result<()>;

    /// Terminate an instance through the group so lifecycle hooks fire
    async fn terminate_in_group(&self, instance_id: &str, decrement: bool) -> Result<()>;
}

/// Compute operations
#[async_trait]
pub trait ComputeApi: Send + Sync {
    /// Describe all instances in the region, following pagination
    async fn describe_instances(&self) -> Result<Vec<InstanceSnapshot>>;

    /// Describe one instance; `None` when it does not exist
    async fn describe_instance(&self, instance_id: &str) -> Result<Option<InstanceSnapshot>>;

    /// Submit a spot request tagged with its group
    async fn request_spot(&self, request: &SpotLaunchRequest) -> Result<SpotRequest>;

    /// Pending spot requests previously tagged for a group
    async fn spot_requests_for_group(&self, group: &str) -> Result<Vec<SpotRequest>>;

    /// Describe one spot request; `None` when it does not exist
    async fn describe_spot_request(&self, request_id: &str) -> Result<Option<SpotRequest>>;

    /// Cancel a spot request
    async fn cancel_spot_request(&self, request_id: &str) -> Result<()>;

    /// Terminate an instance directly
    async fn terminate_instance(&self, instance_id: &str) -> Result<()>;
}

/// Spot market pricing
#[async_trait]
pub trait PricingApi: Send + Sync {
    /// Spot price history for Linux within the lookback window
    async fn spot_price_history(&self, lookback: Duration) -> Result<Vec<SpotPriceRecord>>;
}

/// Infrastructure stack status
#[async_trait]
pub trait StackApi: Send + Sync {
    /// Status of a stack by name; `None` when the stack does not exist
    async fn stack_status(&self, name: &str) -> Result<Option<String>>;
}

/// The four capability implementations for one region
#[derive(Clone)]
pub struct Connections {
    /// Group operations
    pub groups: Arc<dyn GroupApi>,
    /// Compute operations
    pub compute: Arc<dyn ComputeApi>,
    /// Spot pricing
    pub pricing: Arc<dyn PricingApi>,
    /// Stack status
    pub stacks: Arc<dyn StackApi>,
}

impl Connections {
    /// Build SDK-backed connections for one region
    pub async fn for_region(region: &str, retry_attempts: u32) -> Self {
        debug!(region = %region, "creating cloud clients");

        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(AwsRegion::new(region.to_string()))
            .load()
            .await;

        Self {
            groups: Arc::new(AwsGroupApi {
                client: aws_sdk_autoscaling::Client::new(&config),
                retries: retry_attempts,
            }),
            compute: Arc::new(AwsComputeApi {
                client: aws_sdk_ec2::Client::new(&config),
                retries: retry_attempts,
            }),
            pricing: Arc::new(AwsPricingApi {
                client: aws_sdk_ec2::Client::new(&config),
                retries: retry_attempts,
            }),
            stacks: Arc::new(AwsStackApi {
                client: aws_sdk_cloudformation::Client::new(&config),
                retries: retry_attempts,
            }),
        }
    }
}

/// List all region names visible to the account.
pub async fn discover_region_names(retry_attempts: u32) -> Result<Vec<String>> {
    let config = aws_config::defaults(BehaviorVersion::latest())
        .region(AwsRegion::new("us-east-1"))
        .load()
        .await;
    let client = aws_sdk_ec2::Client::new(&config);

    with_retries(retry_attempts, "describe regions", || async {
        let response = client
            .describe_regions()
            .send()
            .await
            .map_err(|e| EngineError::ec2("describe regions", e))?;
        Ok(response
            .regions()
            .iter()
            .filter_map(|r| r.region_name().map(str::to_string))
            .collect())
    })
    .await
}

/// Retry a call on transient errors with exponential backoff.
pub(crate) async fn with_retries<T, Fut>(
    attempts: u32,
    operation: &str,
    mut call: impl FnMut() -> Fut,
) -> Result<T>
where
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut delay = Duration::from_millis(RETRY_BASE_DELAY_MS);
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < attempts => {
                warn!(
                    operation = operation,
                    attempt = attempt,
                    error = %err,
                    "transient error, retrying"
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

// ---------------------------------------------------------------------------
// AWS implementations
// ---------------------------------------------------------------------------

struct AwsGroupApi {
    client: aws_sdk_autoscaling::Client,
    retries: u32,
}

#[async_trait]
impl GroupApi for AwsGroupApi {
    async fn describe_groups(&self) -> Result<Vec<GroupSnapshot>> {
        with_retries(self.retries, "describe groups", || async {
            let mut pages = self
                .client
                .describe_auto_scaling_groups()
                .into_paginator()
                .send();
            let mut groups = Vec::new();
            while let Some(page) = pages.next().await {
                let page = page.map_err(|e| EngineError::autoscaling("describe groups", e))?;
                for group in page.auto_scaling_groups() {
                    if let Some(snapshot) = parse_group(group) {
                        groups.push(snapshot);
                    }
                }
            }
            Ok(groups)
        })
        .await
    }

    async fn scaling_activities(&self, group: &str) -> Result<Vec<ScalingActivity>> {
        with_retries(self.retries, "describe scaling activities", || async {
            let response = self
                .client
                .describe_scaling_activities()
                .auto_scaling_group_name(group)
                .send()
                .await
                .map_err(|e| EngineError::autoscaling("describe scaling activities", e))?;
            Ok(response
                .activities()
                .iter()
                .map(|a| ScalingActivity {
                    status_code: a
                        .status_code()
                        .map(|s| s.as_str().to_string())
                        .unwrap_or_default(),
                })
                .collect())
        })
        .await
    }

    async fn attach_instance(&self, group: &str, instance_id: &str) -> Result<()> {
        with_retries(self.retries, "attach instance", || async {
            self.client
                .attach_instances()
                .auto_scaling_group_name(group)
                .instance_ids(instance_id)
                .send()
                .await
                .map_err(|e| EngineError::autoscaling("attach instance", e))?;
            Ok(())
        })
        .await
    }

    async fn detach_instance(&self, group: &str, instance_id: &str, decrement: bool) -> Result<()> {
        with_retries(self.retries, "detach instance", || async {
            self.client
                .detach_instances()
                .auto_scaling_group_name(group)
                .instance_ids(instance_id)
                .should_decrement_desired_capacity(decrement)
                .send()
                .await
                .map_err(|e| EngineError::autoscaling("detach instance", e))?;
            Ok(())
        })
        .await
    }

    async fn terminate_in_group(&self, instance_id: &str, decrement: bool) -> Result<()> {
        with_retries(self.retries, "terminate in group", || async {
            self.client
                .terminate_instance_in_auto_scaling_group()
                .instance_id(instance_id)
                .should_decrement_desired_capacity(decrement)
                .send()
                .await
                .map_err(|e| EngineError::autoscaling("terminate in group", e))?;
            Ok(())
        })
        .await
    }
}

struct AwsComputeApi {
    client: aws_sdk_ec2::Client,
    retries: u32,
}

#[async_trait]
impl ComputeApi for AwsComputeApi {
    async fn describe_instances(&self) -> Result<Vec<InstanceSnapshot>> {
        with_retries(self.retries, "describe instances", || async {
            let mut pages = self.client.describe_instances().into_paginator().send();
            let mut instances = Vec::new();
            while let Some(page) = pages.next().await {
                let page = page.map_err(|e| EngineError::ec2("describe instances", e))?;
                for reservation in page.reservations() {
                    for instance in reservation.instances() {
                        if let Some(snapshot) = parse_instance(instance) {
                            instances.push(snapshot);
                        }
                    }
                }
            }
            Ok(instances)
        })
        .await
    }

    async fn describe_instance(&self, instance_id: &str) -> Result<Option<InstanceSnapshot>> {
        let response = self
            .client
            .describe_instances()
            .instance_ids(instance_id)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(err) => {
                let err = EngineError::ec2("describe instance", err);
                // an unknown id is an answer, not a failure
                if err.to_string().contains("InvalidInstanceID") {
                    return Ok(None);
                }
                return Err(err);
            }
        };

        Ok(response
            .reservations()
            .iter()
            .flat_map(|r| r.instances())
            .find_map(parse_instance))
    }

    async fn request_spot(&self, request: &SpotLaunchRequest) -> Result<SpotRequest> {
        use aws_sdk_ec2::types::{
            RequestSpotLaunchSpecification, ResourceType, SpotInstanceType, SpotPlacement, Tag,
            TagSpecification,
        };

        let specification = RequestSpotLaunchSpecification::builder()
            .set_image_id(request.image_id.clone())
            .instance_type(aws_sdk_ec2::types::InstanceType::from(
                request.instance_type.as_str(),
            ))
            .set_key_name(request.key_name.clone())
            .set_security_group_ids(if request.security_group_ids.is_empty() {
                None
            } else {
                Some(request.security_group_ids.clone())
            })
            .set_subnet_id(request.subnet_id.clone())
            .placement(
                SpotPlacement::builder()
                    .availability_zone(&request.availability_zone)
                    .build(),
            )
            .build();

        let response = self
            .client
            .request_spot_instances()
            .spot_price(format!("{:.4}", request.bid_price))
            .instance_count(1)
            .r#type(SpotInstanceType::OneTime)
            .launch_specification(specification)
            .tag_specifications(
                TagSpecification::builder()
                    .resource_type(ResourceType::SpotInstancesRequest)
                    .tags(
                        Tag::builder()
                            .key(GROUP_TAG_KEY)
                            .value(&request.group_name)
                            .build(),
                    )
                    .build(),
            )
            .send()
            .await
            .map_err(|e| EngineError::ec2("request spot instances", e))?;

        response
            .spot_instance_requests()
            .first()
            .and_then(parse_spot_request)
            .ok_or_else(|| EngineError::Api {
                service: "ec2",
                operation: "request spot instances",
                message: "no spot request in response".to_string(),
            })
    }

    async fn spot_requests_for_group(&self, group: &str) -> Result<Vec<SpotRequest>> {
        use aws_sdk_ec2::types::Filter;

        with_retries(self.retries, "describe spot requests", || async {
            let response = self
                .client
                .describe_spot_instance_requests()
                .filters(
                    Filter::builder()
                        .name(format!("tag:{GROUP_TAG_KEY}"))
                        .values(group)
                        .build(),
                )
                .filters(
                    Filter::builder()
                        .name("state")
                        .values("open")
                        .values("active")
                        .build(),
                )
                .send()
                .await
                .map_err(|e| EngineError::ec2("describe spot requests", e))?;
            Ok(response
                .spot_instance_requests()
                .iter()
                .filter_map(parse_spot_request)
                .collect())
        })
        .await
    }

    async fn describe_spot_request(&self, request_id: &str) -> Result<Option<SpotRequest>> {
        let response = self
            .client
            .describe_spot_instance_requests()
            .spot_instance_request_ids(request_id)
            .send()
            .await
            .map_err(|e| EngineError::ec2("describe spot request", e))?;
        Ok(response
            .spot_instance_requests()
            .first()
            .and_then(parse_spot_request))
    }

    async fn cancel_spot_request(&self, request_id: &str) -> Result<()> {
        with_retries(self.retries, "cancel spot request", || async {
            self.client
                .cancel_spot_instance_requests()
                .spot_instance_request_ids(request_id)
                .send()
                .await
                .map_err(|e| EngineError::ec2("cancel spot request", e))?;
            Ok(())
        })
        .await
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<()> {
        with_retries(self.retries, "terminate instance", || async {
            self.client
                .terminate_instances()
                .instance_ids(instance_id)
                .send()
                .await
                .map_err(|e| EngineError::ec2("terminate instance", e))?;
            Ok(())
        })
        .await
    }
}

struct AwsPricingApi {
    client: aws_sdk_ec2::Client,
    retries: u32,
}

#[async_trait]
impl PricingApi for AwsPricingApi {
    async fn spot_price_history(&self, lookback: Duration) -> Result<Vec<SpotPriceRecord>> {
        let start = Utc::now() - chrono::Duration::from_std(lookback).unwrap_or_default();

        with_retries(self.retries, "describe spot price history", || async {
            let mut pages = self
                .client
                .describe_spot_price_history()
                .start_time(aws_sdk_ec2::primitives::DateTime::from_millis(
                    start.timestamp_millis(),
                ))
                .product_descriptions("Linux/UNIX")
                .into_paginator()
                .send();

            let mut records = Vec::new();
            while let Some(page) = pages.next().await {
                let page = page.map_err(|e| EngineError::ec2("describe spot price history", e))?;
                for price in page.spot_price_history() {
                    let (Some(instance_type), Some(zone), Some(raw), Some(timestamp)) = (
                        price.instance_type(),
                        price.availability_zone(),
                        price.spot_price(),
                        price.timestamp(),
                    ) else {
                        continue;
                    };
                    let Ok(parsed) = raw.parse::<f64>() else {
                        continue;
                    };
                    records.push(SpotPriceRecord {
                        instance_type: instance_type.as_str().to_string(),
                        availability_zone: zone.to_string(),
                        price: parsed,
                        timestamp: aws_time(timestamp),
                    });
                }
            }
            Ok(records)
        })
        .await
    }
}

struct AwsStackApi {
    client: aws_sdk_cloudformation::Client,
    retries: u32,
}

#[async_trait]
impl StackApi for AwsStackApi {
    async fn stack_status(&self, name: &str) -> Result<Option<String>> {
        let result = with_retries(self.retries, "describe stacks", || async {
            self.client
                .describe_stacks()
                .stack_name(name)
                .send()
                .await
                .map_err(|e| EngineError::cloudformation("describe stacks", e))
        })
        .await;

        match result {
            Ok(response) => Ok(response
                .stacks()
                .first()
                .and_then(|s| s.stack_status())
                .map(|s| s.as_str().to_string())),
            Err(err) if err.to_string().contains("does not exist") => Ok(None),
            Err(err) => Err(err),
        }
    }
}

// ---------------------------------------------------------------------------
// SDK type conversions
// ---------------------------------------------------------------------------

fn aws_time(dt: &aws_sdk_ec2::primitives::DateTime) -> DateTime<Utc> {
    chrono::DateTime::from_timestamp(dt.secs(), dt.subsec_nanos()).unwrap_or_else(Utc::now)
}

fn parse_instance(instance: &aws_sdk_ec2::types::Instance) -> Option<InstanceSnapshot> {
    use aws_sdk_ec2::types::{InstanceLifecycleType, InstanceStateName};

    let id = instance.instance_id()?.to_string();

    let state = match instance.state().and_then(|s| s.name()) {
        Some(InstanceStateName::Running) => VmState::Running,
        Some(InstanceStateName::Pending) => VmState::Pending,
        Some(InstanceStateName::Stopping) => VmState::Stopping,
        Some(InstanceStateName::Stopped) => VmState::Stopped,
        Some(InstanceStateName::ShuttingDown) => VmState::ShuttingDown,
        Some(InstanceStateName::Terminated) => VmState::Terminated,
        _ => VmState::Pending,
    };

    let lifecycle = match instance.instance_lifecycle() {
        Some(InstanceLifecycleType::Spot) => Lifecycle::Spot,
        _ => Lifecycle::OnDemand,
    };

    let tags = instance
        .tags()
        .iter()
        .filter_map(|t| Some((t.key()?.to_string(), t.value()?.to_string())))
        .collect();

    Some(InstanceSnapshot {
        id,
        instance_type: instance
            .instance_type()
            .map(|t| t.as_str().to_string())
            .unwrap_or_default(),
        availability_zone: instance
            .placement()
            .and_then(|p| p.availability_zone())
            .unwrap_or_default()
            .to_string(),
        lifecycle,
        state,
        launch_time: instance.launch_time().map(aws_time).unwrap_or_else(Utc::now),
        image_id: instance.image_id().map(str::to_string),
        key_name: instance.key_name().map(str::to_string),
        security_group_ids: instance
            .security_groups()
            .iter()
            .filter_map(|g| g.group_id().map(str::to_string))
            .collect(),
        subnet_id: instance.subnet_id().map(str::to_string),
        tags,
    })
}

fn parse_group(group: &aws_sdk_autoscaling::types::AutoScalingGroup) -> Option<GroupSnapshot> {
    let name = group.auto_scaling_group_name()?.to_string();

    let tags = group
        .tags()
        .iter()
        .filter_map(|t| Some((t.key()?.to_string(), t.value()?.to_string())))
        .collect();

    Some(GroupSnapshot {
        name,
        desired_capacity: group.desired_capacity().unwrap_or(0),
        min_size: group.min_size().unwrap_or(0),
        max_size: group.max_size().unwrap_or(0),
        has_mixed_instances_policy: group.mixed_instances_policy().is_some(),
        health_check_grace_secs: group.health_check_grace_period().unwrap_or(0).max(0) as u32,
        member_ids: group
            .instances()
            .iter()
            .filter_map(|i| i.instance_id().map(str::to_string))
            .collect(),
        scale_in_protected: group
            .instances()
            .iter()
            .filter(|i| i.protected_from_scale_in().unwrap_or(false))
            .filter_map(|i| i.instance_id().map(str::to_string))
            .collect(),
        suspended_processes: group
            .suspended_processes()
            .iter()
            .filter_map(|p| p.process_name().map(str::to_string))
            .collect(),
        tags,
    })
}

fn parse_spot_request(
    request: &aws_sdk_ec2::types::SpotInstanceRequest,
) -> Option<SpotRequest> {
    use aws_sdk_ec2::types::SpotInstanceState;

    let request_id = request.spot_instance_request_id()?.to_string();
    let state = match request.state() {
        Some(SpotInstanceState::Open) => SpotRequestState::Open,
        Some(SpotInstanceState::Active) => SpotRequestState::Active,
        Some(SpotInstanceState::Closed) => SpotRequestState::Closed,
        Some(SpotInstanceState::Cancelled) => SpotRequestState::Cancelled,
        _ => SpotRequestState::Failed,
    };

    Some(SpotRequest {
        request_id,
        instance_id: request.instance_id().map(str::to_string),
        state,
        created_at: request.create_time().map(aws_time).unwrap_or_else(Utc::now),
    })
}

// ---------------------------------------------------------------------------
// In-memory fakes
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod fakes {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Scriptable group API recording every mutation
    #[derive(Default)]
    pub struct FakeGroups {
        pub groups: Vec<GroupSnapshot>,
        pub activities: Vec<ScalingActivity>,
        pub fail_detach: bool,
        pub attached: Mutex<Vec<(String, String)>>,
        pub detached: Mutex<Vec<(String, String, bool)>>,
        pub terminated_in_group: Mutex<Vec<(String, bool)>>,
    }

    #[async_trait]
    impl GroupApi for FakeGroups {
        async fn describe_groups(&self) -> Result<Vec<GroupSnapshot>> {
            Ok(self.groups.clone())
        }

        async fn scaling_activities(&self, _group: &str) -> Result<Vec<ScalingActivity>> {
            Ok(self.activities.clone())
        }

        async fn attach_instance(&self, group: &str, instance_id: &str) -> Result<()> {
            self.attached
                .lock()
                .unwrap()
                .push((group.to_string(), instance_id.to_string()));
            Ok(())
        }

        async fn detach_instance(
            &self,
            group: &str,
            instance_id: &str,
            decrement: bool,
        ) -> Result<()> {
            if self.fail_detach {
                return Err(EngineError::Api {
                    service: "autoscaling",
                    operation: "detach instance",
                    message: "ValidationError: instance is busy".to_string(),
                });
            }
            self.detached
                .lock()
                .unwrap()
                .push((group.to_string(), instance_id.to_string(), decrement));
            Ok(())
        }

        async fn terminate_in_group(&self, instance_id: &str, decrement: bool) -> Result<()> {
            self.terminated_in_group
                .lock()
                .unwrap()
                .push((instance_id.to_string(), decrement));
            Ok(())
        }
    }

    /// Scriptable compute API; fulfilled spot requests immediately yield
    /// running instances.
    #[derive(Default)]
    pub struct FakeCompute {
        pub instances: Mutex<Vec<InstanceSnapshot>>,
        pub pending: Mutex<Vec<(String, SpotRequest)>>,
        pub capacity_error_types: Vec<String>,
        pub requested: Mutex<Vec<SpotLaunchRequest>>,
        pub cancelled: Mutex<Vec<String>>,
        pub terminated: Mutex<Vec<String>>,
        pub next_id: AtomicU32,
    }

    #[async_trait]
    impl ComputeApi for FakeCompute {
        async fn describe_instances(&self) -> Result<Vec<InstanceSnapshot>> {
            Ok(self.instances.lock().unwrap().clone())
        }

        async fn describe_instance(&self, instance_id: &str) -> Result<Option<InstanceSnapshot>> {
            Ok(self
                .instances
                .lock()
                .unwrap()
                .iter()
                .find(|i| i.id == instance_id)
                .cloned())
        }

        async fn request_spot(&self, request: &SpotLaunchRequest) -> Result<SpotRequest> {
            if self.capacity_error_types.contains(&request.instance_type) {
                return Err(EngineError::Capacity(format!(
                    "InsufficientInstanceCapacity for {}",
                    request.instance_type
                )));
            }
            self.requested.lock().unwrap().push(request.clone());

            let n = self.next_id.fetch_add(1, Ordering::SeqCst);
            let instance_id = format!("i-spot-{n}");
            let spot_request = SpotRequest {
                request_id: format!("sir-{n}"),
                instance_id: Some(instance_id.clone()),
                state: SpotRequestState::Active,
                created_at: Utc::now(),
            };

            self.instances.lock().unwrap().push(InstanceSnapshot {
                id: instance_id,
                instance_type: request.instance_type.clone(),
                availability_zone: request.availability_zone.clone(),
                lifecycle: Lifecycle::Spot,
                state: VmState::Running,
                launch_time: Utc::now(),
                image_id: request.image_id.clone(),
                key_name: request.key_name.clone(),
                security_group_ids: request.security_group_ids.clone(),
                subnet_id: request.subnet_id.clone(),
                tags: HashMap::new(),
            });
            self.pending
                .lock()
                .unwrap()
                .push((request.group_name.clone(), spot_request.clone()));
            Ok(spot_request)
        }

        async fn spot_requests_for_group(&self, group: &str) -> Result<Vec<SpotRequest>> {
            Ok(self
                .pending
                .lock()
                .unwrap()
                .iter()
                .filter(|(g, r)| g == group && r.state.is_pending())
                .map(|(_, r)| r.clone())
                .collect())
        }

        async fn describe_spot_request(&self, request_id: &str) -> Result<Option<SpotRequest>> {
            Ok(self
                .pending
                .lock()
                .unwrap()
                .iter()
                .find(|(_, r)| r.request_id == request_id)
                .map(|(_, r)| r.clone()))
        }

        async fn cancel_spot_request(&self, request_id: &str) -> Result<()> {
            self.cancelled.lock().unwrap().push(request_id.to_string());
            let mut pending = self.pending.lock().unwrap();
            for (_, request) in pending.iter_mut() {
                if request.request_id == request_id {
                    request.state = SpotRequestState::Cancelled;
                }
            }
            Ok(())
        }

        async fn terminate_instance(&self, instance_id: &str) -> Result<()> {
            self.terminated.lock().unwrap().push(instance_id.to_string());
            Ok(())
        }
    }

    /// Fixed spot price history
    #[derive(Default)]
    pub struct FakePricing {
        pub records: Vec<SpotPriceRecord>,
    }

    #[async_trait]
    impl PricingApi for FakePricing {
        async fn spot_price_history(&self, _lookback: Duration) -> Result<Vec<SpotPriceRecord>> {
            Ok(self.records.clone())
        }
    }

    /// Fixed stack statuses by name
    #[derive(Default)]
    pub struct FakeStacks {
        pub statuses: HashMap<String, String>,
    }

    #[async_trait]
    impl StackApi for FakeStacks {
        async fn stack_status(&self, name: &str) -> Result<Option<String>> {
            Ok(self.statuses.get(name).cloned())
        }
    }

    /// Bundle fakes into [`Connections`], keeping handles for assertions
    pub fn connections(
        groups: FakeGroups,
        compute: FakeCompute,
        pricing: FakePricing,
        stacks: FakeStacks,
    ) -> (Connections, Arc<FakeGroups>, Arc<FakeCompute>) {
        let groups = Arc::new(groups);
        let compute = Arc::new(compute);
        let connections = Connections {
            groups: groups.clone(),
            compute: compute.clone(),
            pricing: Arc::new(pricing),
            stacks: Arc::new(stacks),
        };
        (connections, groups, compute)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spot_request_state_pending() {
        assert!(SpotRequestState::Open.is_pending());
        assert!(SpotRequestState::Active.is_pending());
        assert!(!SpotRequestState::Closed.is_pending());
        assert!(!SpotRequestState::Cancelled.is_pending());
    }

    #[test]
    fn test_scaling_activity_in_progress() {
        assert!(ScalingActivity {
            status_code: "InProgress".to_string()
        }
        .in_progress());
        assert!(!ScalingActivity {
            status_code: "Successful".to_string()
        }
        .in_progress());
        assert!(!ScalingActivity {
            status_code: "Cancelled".to_string()
        }
        .in_progress());
    }

    #[tokio::test]
    async fn test_with_retries_gives_up_on_fatal_errors() {
        let mut calls = 0;
        let result: Result<()> = with_retries(3, "test", || {
            calls += 1;
            async { Err(EngineError::config("bad input")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_with_retries_retries_transient_errors() {
        let calls = std::sync::atomic::AtomicU32::new(0);
        let result: Result<u32> = with_retries(3, "test", || {
            let n = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(EngineError::Api {
                        service: "ec2",
                        operation: "test",
                        message: "Throttling: slow down".to_string(),
                    })
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
    }
}
