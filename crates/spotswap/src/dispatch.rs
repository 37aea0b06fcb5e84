//! Top-level dispatcher
//!
//! Fans one event out over the enabled regions. Each region runs as its
//! own task under a deadline; one region's failure never aborts its
//! peers, and the invocation counts as a success while at least one
//! region finishes cleanly.

use crate::cloud::{self, Connections};
use crate::error::{EngineError, Result};
use crate::events::{revert_replacement, EngineEvent};
use crate::region::{Region, RegionReport};
use futures::stream::{self, StreamExt};
use spotswap_core::catalog::StaticInstanceType;
use spotswap_core::config::Config;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Aggregated result of one fan-out
#[derive(Debug, Default, serde::Serialize)]
pub struct TickSummary {
    /// Regions that completed their tick
    pub succeeded: Vec<String>,
    /// Regions that failed, with the error rendered
    pub failed: Vec<(String, String)>,
}

impl TickSummary {
    /// Whether every attempted region failed
    pub fn all_failed(&self) -> bool {
        self.succeeded.is_empty() && !self.failed.is_empty()
    }
}

/// Fans events out across regions
pub struct Dispatcher {
    conf: Arc<Config>,
    dataset: Arc<Vec<StaticInstanceType>>,
}

impl Dispatcher {
    /// Create a dispatcher over one invocation's config and dataset
    pub fn new(conf: Arc<Config>, dataset: Arc<Vec<StaticInstanceType>>) -> Self {
        Self { conf, dataset }
    }

    /// Handle one classified event.
    pub async fn handle(&self, event: EngineEvent) -> Result<TickSummary> {
        match event {
            EngineEvent::ScheduledTick => self.run_tick().await,
            EngineEvent::SpotInterruption { instance_id } => {
                info!(instance = %instance_id, "spot interruption warning");
                self.signal_regions(&instance_id).await?;
                Ok(TickSummary::default())
            }
            EngineEvent::RebalanceRecommendation { instance_id } => {
                info!(instance = %instance_id, "rebalance recommendation");
                self.signal_regions(&instance_id).await?;
                Ok(TickSummary::default())
            }
            EngineEvent::LifecycleLaunch {
                hook_name,
                instance_id,
                group_name,
            } => {
                // the pending-request tag is the durable state; the next
                // tick adopts this instance through it
                info!(
                    hook = %hook_name,
                    instance = %instance_id,
                    group = %group_name,
                    "instance-launch lifecycle action observed"
                );
                Ok(TickSummary::default())
            }
        }
    }

    /// Run the full pipeline in every enabled region.
    pub async fn run_tick(&self) -> Result<TickSummary> {
        let all_regions = cloud::discover_region_names(self.conf.api_retry_attempts).await?;
        let names = self.select_enabled(all_regions);
        if names.is_empty() {
            warn!("no enabled regions, nothing to do");
            return Ok(TickSummary::default());
        }

        info!(regions = names.len(), "running tick");
        let limit = names.len().max(1);
        let results: Vec<(String, Result<RegionReport>)> =
            stream::iter(names.into_iter().map(|name| self.run_region(name)))
                .buffer_unordered(limit)
                .collect()
                .await;
        Ok(summarize(results))
    }

    /// Filter the discovered regions down to the enabled ones.
    fn select_enabled(&self, all_regions: Vec<String>) -> Vec<String> {
        all_regions
            .into_iter()
            .filter(|name| self.conf.region_enabled(name))
            .collect()
    }

    async fn run_region(&self, name: String) -> (String, Result<RegionReport>) {
        let deadline = Duration::from_secs(self.conf.region_deadline_secs);
        let services = Connections::for_region(&name, self.conf.api_retry_attempts).await;
        let mut region = Region::new(
            name.clone(),
            self.conf.clone(),
            self.dataset.clone(),
            services,
        );
        // on deadline, in-flight replacements stay recoverable through
        // their request tags
        let result = match tokio::time::timeout(deadline, region.run_once()).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout(deadline)),
        };
        (name, result)
    }

    /// Find the region owning a signalled instance and detach it there.
    async fn signal_regions(&self, instance_id: &str) -> Result<()> {
        let all_regions = cloud::discover_region_names(self.conf.api_retry_attempts).await?;
        for name in self.select_enabled(all_regions) {
            let services = Connections::for_region(&name, self.conf.api_retry_attempts).await;
            match revert_replacement(&services, instance_id).await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(err) => {
                    warn!(region = %name, instance = %instance_id, error = %err, "signal handling failed");
                }
            }
        }
        info!(instance = %instance_id, "signalled instance not found in any enabled region");
        Ok(())
    }
}

fn summarize(results: Vec<(String, Result<RegionReport>)>) -> TickSummary {
    let mut summary = TickSummary::default();
    for (name, result) in results {
        match result {
            Ok(report) => {
                info!(
                    region = %name,
                    groups = report.outcomes.len(),
                    "region tick complete"
                );
                summary.succeeded.push(name);
            }
            Err(err) => {
                error!(region = %name, error = %err, "region tick failed");
                summary.failed.push((name, err.to_string()));
            }
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summarize_keeps_failures_separate() {
        let results = vec![
            ("us-east-1".to_string(), Ok(RegionReport::default())),
            (
                "eu-west-1".to_string(),
                Err(EngineError::config("broken")),
            ),
        ];
        let summary = summarize(results);
        assert_eq!(summary.succeeded, vec!["us-east-1"]);
        assert_eq!(summary.failed.len(), 1);
        assert!(!summary.all_failed());
    }

    #[test]
    fn test_all_failed_only_when_nothing_succeeded() {
        let empty = TickSummary::default();
        assert!(!empty.all_failed());

        let summary = summarize(vec![(
            "us-east-1".to_string(),
            Err(EngineError::config("broken")),
        )]);
        assert!(summary.all_failed());
    }

    #[test]
    fn test_select_enabled_applies_region_patterns() {
        let conf = Config {
            regions: "us-*, eu-west-1".to_string(),
            ..Config::default()
        };
        let dispatcher = Dispatcher::new(Arc::new(conf), Arc::new(vec![]));
        let selected = dispatcher.select_enabled(vec![
            "us-east-1".to_string(),
            "us-west-2".to_string(),
            "eu-west-1".to_string(),
            "ap-south-1".to_string(),
        ]);
        assert_eq!(selected, vec!["us-east-1", "us-west-2", "eu-west-1"]);
    }
}
