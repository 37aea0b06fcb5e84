//! spotswap engine entry point
//!
//! Every setting is both a CLI flag and an environment variable, so the
//! same binary runs as a daemon, a cron job, or a serverless handler.
//!
//! Exit codes: 0 on success, 1 on configuration errors, 2 when every
//! region failed.

use anyhow::Context;
use clap::Parser;
use serde_json::Value;
use spotswap::{Dispatcher, EngineEvent};
use spotswap_core::catalog::{parse_dataset, StaticInstanceType};
use spotswap_core::config::Config;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "spotswap")]
#[command(about = "Replace on-demand autoscaling group members with spot capacity", long_about = None)]
struct Cli {
    /// Enabled regions: names or globs, comma/whitespace separated; empty = all
    #[arg(long, env = "REGIONS", default_value = "")]
    regions: String,

    /// Group filter: comma-separated key=value pairs
    #[arg(long, env = "FILTER_BY_TAGS", default_value = "")]
    filter_by_tags: String,

    /// Tag filtering mode: opt-in or opt-out
    #[arg(long, env = "TAG_FILTERING_MODE", default_value = "opt-in")]
    tag_filtering_mode: String,

    /// Absolute on-demand floor per group
    #[arg(long, env = "MIN_ON_DEMAND_NUMBER", default_value_t = 0)]
    min_on_demand_number: i64,

    /// Percentage on-demand floor per group
    #[arg(long, env = "MIN_ON_DEMAND_PERCENTAGE", default_value_t = 0.0)]
    min_on_demand_percentage: f64,

    /// Multiplier applied to raw on-demand prices
    #[arg(long, env = "ON_DEMAND_PRICE_MULTIPLIER", default_value_t = 1.0)]
    on_demand_price_multiplier: f64,

    /// Bidding policy: normal or aggressive
    #[arg(long, env = "BIDDING_POLICY", default_value = "normal")]
    bidding_policy: String,

    /// Allowed instance type globs; empty = all
    #[arg(long, env = "ALLOWED_INSTANCE_TYPES", default_value = "")]
    allowed_instance_types: String,

    /// Disallowed instance type globs
    #[arg(long, env = "DISALLOWED_INSTANCE_TYPES", default_value = "")]
    disallowed_instance_types: String,

    /// Termination method: autoscaling or terminate
    #[arg(long, env = "INSTANCE_TERMINATION_METHOD", default_value = "autoscaling")]
    instance_termination_method: String,

    /// License tier: evaluation or full
    #[arg(long, env = "LICENSE", default_value = "evaluation")]
    license: String,

    /// How long to wait for a spot request to produce a running instance
    #[arg(long, env = "SPOT_REQUEST_TIMEOUT_SECS", default_value_t = 600)]
    spot_request_timeout_secs: u64,

    /// Retry attempts for transient cloud API errors
    #[arg(long, env = "API_RETRY_ATTEMPTS", default_value_t = 3)]
    api_retry_attempts: u32,

    /// Per-region deadline in seconds
    #[arg(long, env = "REGION_DEADLINE_SECS", default_value_t = 240)]
    region_deadline_secs: u64,

    /// Path to the static instance-type dataset
    #[arg(long, env = "INSTANCE_DATA_FILE", default_value = "instance-data.json")]
    instance_data_file: PathBuf,

    /// Path to a trigger event envelope; defaults to a scheduled tick
    #[arg(long, env = "EVENT_FILE")]
    event_file: Option<PathBuf>,
}

impl Cli {
    fn to_config(&self) -> anyhow::Result<Config> {
        let config = Config {
            regions: self.regions.clone(),
            filter_by_tags: self.filter_by_tags.clone(),
            tag_filtering_mode: self.tag_filtering_mode.parse()?,
            min_on_demand_number: self.min_on_demand_number,
            min_on_demand_percentage: self.min_on_demand_percentage,
            on_demand_price_multiplier: self.on_demand_price_multiplier,
            bidding_policy: self.bidding_policy.parse()?,
            allowed_instance_types: self.allowed_instance_types.clone(),
            disallowed_instance_types: self.disallowed_instance_types.clone(),
            termination_method: self.instance_termination_method.parse()?,
            license: self.license.parse()?,
            spot_request_timeout_secs: self.spot_request_timeout_secs,
            api_retry_attempts: self.api_retry_attempts,
            region_deadline_secs: self.region_deadline_secs,
        };
        config.validate()?;
        Ok(config)
    }

    fn load_dataset(&self) -> anyhow::Result<Vec<StaticInstanceType>> {
        let raw = std::fs::read_to_string(&self.instance_data_file).with_context(|| {
            format!(
                "could not read instance dataset {}",
                self.instance_data_file.display()
            )
        })?;
        parse_dataset(&raw).context("could not parse instance dataset")
    }

    fn load_event(&self) -> anyhow::Result<EngineEvent> {
        let Some(path) = &self.event_file else {
            return Ok(EngineEvent::ScheduledTick);
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("could not read event file {}", path.display()))?;
        let value: Value = serde_json::from_str(&raw).context("event file is not JSON")?;
        Ok(EngineEvent::parse(&value)?)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "spotswap=info,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let (config, dataset, event) =
        match (cli.to_config(), cli.load_dataset(), cli.load_event()) {
            (Ok(config), Ok(dataset), Ok(event)) => (config, dataset, event),
            (config, dataset, event) => {
                for err in [config.err(), dataset.err(), event.err()]
                    .into_iter()
                    .flatten()
                {
                    error!("startup failed: {err:#}");
                }
                return ExitCode::from(1);
            }
        };

    info!(event = ?event, "starting spotswap");
    let dispatcher = Dispatcher::new(Arc::new(config), Arc::new(dataset));

    match dispatcher.handle(event).await {
        Ok(summary) => {
            if summary.all_failed() {
                error!(
                    failed = summary.failed.len(),
                    "every region failed this invocation"
                );
                ExitCode::from(2)
            } else {
                info!(
                    succeeded = summary.succeeded.len(),
                    failed = summary.failed.len(),
                    "invocation complete"
                );
                ExitCode::SUCCESS
            }
        }
        Err(err) => {
            error!("invocation failed: {err}");
            ExitCode::from(2)
        }
    }
}
