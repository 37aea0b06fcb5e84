//! Region controller
//!
//! Owns one region's tick: parse the group filter, scan instances, scan
//! and filter groups, snapshot spot pricing into the catalog, then hand
//! each enabled group to the executor. Scans run in a fixed order so the
//! executor only ever sees a consistent view.

use crate::cloud::Connections;
use crate::error::Result;
use crate::executor::{Executor, ReplacementOutcome};
use chrono::Utc;
use spotswap_core::catalog::{RegionalCatalog, StaticInstanceType, SPOT_HISTORY_LOOKBACK_SECS};
use spotswap_core::config::{Config, TagFilteringMode};
use spotswap_core::types::{GroupSnapshot, InstanceSnapshot, Tag};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of one region tick
#[derive(Debug, Default)]
pub struct RegionReport {
    /// Outcome per enabled group, in scan order
    pub outcomes: Vec<ReplacementOutcome>,
}

/// Per-region orchestrator
pub struct Region {
    /// Region name
    pub name: String,
    conf: Arc<Config>,
    dataset: Arc<Vec<StaticInstanceType>>,
    services: Connections,
    tag_filters: Vec<Tag>,
    instances: HashMap<String, InstanceSnapshot>,
    enabled_groups: Vec<GroupSnapshot>,
    catalog: RegionalCatalog,
}

impl Region {
    /// Create a controller for one region
    pub fn new(
        name: impl Into<String>,
        conf: Arc<Config>,
        dataset: Arc<Vec<StaticInstanceType>>,
        services: Connections,
    ) -> Self {
        Self {
            name: name.into(),
            conf,
            dataset,
            services,
            tag_filters: Vec::new(),
            instances: HashMap::new(),
            enabled_groups: Vec::new(),
            catalog: RegionalCatalog::default(),
        }
    }

    /// Whether this region participates in the invocation
    pub fn enabled(&self) -> bool {
        self.conf.region_enabled(&self.name)
    }

    /// Parse the configured group filter into tags.
    pub fn setup_group_filters(&mut self) {
        self.tag_filters = self.conf.filter_tags();
        debug!(region = %self.name, filters = ?self.tag_filters, "group filters");
    }

    /// Names of groups selected by the last scan
    pub fn enabled_group_names(&self) -> Vec<&str> {
        self.enabled_groups.iter().map(|g| g.name.as_str()).collect()
    }

    /// Instances observed by the last scan
    pub fn instances(&self) -> &HashMap<String, InstanceSnapshot> {
        &self.instances
    }

    /// Index every instance in the region by id.
    pub async fn scan_instances(&mut self) -> Result<()> {
        let instances = self.services.compute.describe_instances().await?;
        self.instances = instances.into_iter().map(|i| (i.id.clone(), i)).collect();
        debug!(
            region = %self.name,
            count = self.instances.len(),
            "scanned instances"
        );
        Ok(())
    }

    /// Scan all groups and keep the ones selected by the tag filter.
    ///
    /// Must run after [`Self::setup_group_filters`] and
    /// [`Self::scan_instances`].
    pub async fn scan_for_enabled_groups(&mut self) -> Result<()> {
        self.enabled_groups.clear();

        // one bad pattern disables the whole filter for this tick
        if let Some(bad) = self
            .tag_filters
            .iter()
            .find(|t| !spotswap_core::config::pattern_compiles(&t.value))
        {
            warn!(
                region = %self.name,
                pattern = %bad.value,
                "invalid filter pattern, no groups selected this tick"
            );
            return Ok(());
        }

        let groups = self.services.groups.describe_groups().await?;
        for group in groups {
            if group.has_mixed_instances_policy {
                debug!(
                    region = %self.name,
                    group = %group.name,
                    "skipping group with a mixed instances policy"
                );
                continue;
            }
            if !self.group_selected(&group) {
                continue;
            }
            if let Some(stack) = group.stack_name() {
                if self.is_stack_updating(stack).await {
                    info!(
                        region = %self.name,
                        group = %group.name,
                        stack = %stack,
                        "parent stack is updating, skipping group this tick"
                    );
                    continue;
                }
            }
            self.enabled_groups.push(group);
        }

        info!(
            region = %self.name,
            enabled = self.enabled_groups.len(),
            "scanned groups"
        );
        Ok(())
    }

    fn group_selected(&self, group: &GroupSnapshot) -> bool {
        let carries_all = self.tag_filters.iter().all(|tag| group.has_tag(tag));
        match self.conf.tag_filtering_mode {
            TagFilteringMode::OptIn => carries_all,
            TagFilteringMode::OptOut => !carries_all,
        }
    }

    /// Whether a parent stack is in a transitional state.
    ///
    /// Unknown stacks and describe failures are treated as stable so one
    /// flaky lookup cannot park every group behind it.
    async fn is_stack_updating(&self, stack: &str) -> bool {
        match self.services.stacks.stack_status(stack).await {
            Ok(Some(status)) => status.ends_with("_IN_PROGRESS"),
            Ok(None) => false,
            Err(err) => {
                warn!(
                    region = %self.name,
                    stack = %stack,
                    error = %err,
                    "could not read stack status"
                );
                false
            }
        }
    }

    /// Merge the static dataset with a fresh spot pricing snapshot.
    pub async fn build_catalog(&mut self) -> Result<()> {
        let history = self
            .services
            .pricing
            .spot_price_history(Duration::from_secs(SPOT_HISTORY_LOOKBACK_SECS as u64))
            .await?;
        self.catalog = RegionalCatalog::build(
            &self.name,
            &self.dataset,
            &history,
            self.conf.on_demand_price_multiplier,
            Utc::now(),
        );
        debug!(
            region = %self.name,
            types = self.catalog.len(),
            "built instance type catalog"
        );
        Ok(())
    }

    /// Run one full tick for this region.
    pub async fn run_once(&mut self) -> Result<RegionReport> {
        self.setup_group_filters();
        self.scan_instances().await?;
        self.scan_for_enabled_groups().await?;

        let mut report = RegionReport::default();
        if self.enabled_groups.is_empty() {
            return Ok(report);
        }

        // pricing snapshot happens once, before any group is evaluated
        self.build_catalog().await?;

        let executor = Executor::new(&self.conf, &self.services, &self.catalog, &self.instances);
        for group in &self.enabled_groups {
            match executor.run(group).await {
                Ok(outcome) => {
                    debug!(region = %self.name, group = %group.name, outcome = ?outcome.action, "group done");
                    report.outcomes.push(outcome);
                }
                Err(err) => {
                    // one group's failure never blocks its peers
                    warn!(
                        region = %self.name,
                        group = %group.name,
                        error = %err,
                        "replacement failed"
                    );
                }
            }
        }
        Ok(report)
    }
}
