//! Instance-type catalog
//!
//! Merges the static instance-type dataset with a live snapshot of spot
//! price history for one region. The stored on-demand price is already
//! adjusted by the configured multiplier, so the selector never sees raw
//! list prices.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How far back spot price history is considered current
pub const SPOT_HISTORY_LOOKBACK_SECS: i64 = 3600;

/// Instance storage description from the static dataset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticStorage {
    /// Number of attached volumes
    pub devices: u32,
    /// Size of each volume in GB
    pub size: f64,
    /// Whether the volumes are SSD-backed
    #[serde(default)]
    pub ssd: bool,
}

/// Per-region Linux pricing from the static dataset
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinuxPricing {
    /// Raw on-demand price in USD per hour
    #[serde(default)]
    pub ondemand: f64,
}

/// Pricing entry for one region
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegionPricing {
    /// Linux pricing
    #[serde(default)]
    pub linux: LinuxPricing,
}

/// One entry of the read-only instance-type dataset.
///
/// Field names follow the published dataset this is loaded from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticInstanceType {
    /// Type id, e.g. "m5.large"
    pub instance_type: String,

    /// Virtual CPU count
    #[serde(rename = "vCPU")]
    pub vcpu: u32,

    /// Memory in GiB
    pub memory: f64,

    /// Instance storage, absent for EBS-only types
    #[serde(default)]
    pub storage: Option<StaticStorage>,

    /// Network performance class, e.g. "Moderate" or "10 Gigabit"
    #[serde(default)]
    pub network_performance: String,

    /// Number of attached GPUs
    #[serde(rename = "GPU", default)]
    pub gpu: u32,

    /// Supported CPU architectures
    #[serde(default)]
    pub arch: Vec<String>,

    /// Supported virtualization types ("HVM", "PV")
    #[serde(default)]
    pub linux_virtualization_types: Vec<String>,

    /// Per-region pricing
    #[serde(default)]
    pub pricing: HashMap<String, RegionPricing>,
}

/// One spot price observation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpotPriceRecord {
    /// Instance type the price applies to
    pub instance_type: String,
    /// Availability zone the price applies to
    pub availability_zone: String,
    /// Price in USD per hour
    pub price: f64,
    /// When the price was published
    pub timestamp: DateTime<Utc>,
}

/// Instance storage summary used for compatibility comparisons
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InstanceStorage {
    /// Total attached storage in GB
    pub total_gb: f64,
    /// Whether the storage is SSD-backed
    pub ssd: bool,
}

/// Catalog entry for one instance type in one region
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeInfo {
    /// Type id
    pub instance_type: String,
    /// Virtual CPU count
    pub vcpu: u32,
    /// Memory in GiB
    pub memory_gib: f64,
    /// Instance storage, if any
    pub storage: Option<InstanceStorage>,
    /// Comparable network performance rank
    pub network_rank: u32,
    /// GPU count
    pub gpu_count: u32,
    /// Supported CPU architectures
    pub architectures: Vec<String>,
    /// Supported virtualization types
    pub virtualization: Vec<String>,
    /// On-demand price, already multiplier-adjusted
    pub on_demand_price: f64,
    /// Most recent spot price per availability zone
    pub spot_price_by_az: HashMap<String, f64>,
}

impl TypeInfo {
    /// Current spot price in one availability zone, if the history had one
    pub fn spot_price(&self, az: &str) -> Option<f64> {
        self.spot_price_by_az.get(az).copied()
    }
}

/// Rank a network performance class so "equal or greater" is well-defined.
///
/// Gigabit tiers rank above every named class; unknown strings rank lowest.
pub fn network_rank(performance: &str) -> u32 {
    match performance {
        "Very Low" => 1,
        "Low" => 2,
        "Low to Moderate" => 3,
        "Moderate" => 4,
        "High" => 6,
        other => other
            .split_whitespace()
            .find_map(|word| word.parse::<u32>().ok())
            .map(|gigabit| 10 * gigabit)
            .unwrap_or(0),
    }
}

/// Read-only per-region catalog
#[derive(Debug, Clone, Default)]
pub struct RegionalCatalog {
    region: String,
    entries: HashMap<String, TypeInfo>,
}

impl RegionalCatalog {
    /// Build the catalog for one region.
    ///
    /// Only spot records younger than the lookback window count, and only
    /// the newest record per (type, zone) is kept. Types without pricing
    /// data for this region are left out entirely.
    pub fn build(
        region: &str,
        dataset: &[StaticInstanceType],
        spot_history: &[SpotPriceRecord],
        multiplier: f64,
        now: DateTime<Utc>,
    ) -> Self {
        let cutoff = now - Duration::seconds(SPOT_HISTORY_LOOKBACK_SECS);

        let mut latest_spot: HashMap<(String, String), (DateTime<Utc>, f64)> = HashMap::new();
        for record in spot_history {
            if record.timestamp < cutoff {
                continue;
            }
            let key = (record.instance_type.clone(), record.availability_zone.clone());
            match latest_spot.get(&key) {
                Some((seen, _)) if *seen >= record.timestamp => {}
                _ => {
                    latest_spot.insert(key, (record.timestamp, record.price));
                }
            }
        }

        let mut entries = HashMap::new();
        for static_type in dataset {
            let Some(pricing) = static_type.pricing.get(region) else {
                continue;
            };

            let spot_price_by_az = latest_spot
                .iter()
                .filter(|((ty, _), _)| *ty == static_type.instance_type)
                .map(|((_, az), (_, price))| (az.clone(), *price))
                .collect();

            entries.insert(
                static_type.instance_type.clone(),
                TypeInfo {
                    instance_type: static_type.instance_type.clone(),
                    vcpu: static_type.vcpu,
                    memory_gib: static_type.memory,
                    storage: static_type.storage.as_ref().map(|s| InstanceStorage {
                        total_gb: f64::from(s.devices) * s.size,
                        ssd: s.ssd,
                    }),
                    network_rank: network_rank(&static_type.network_performance),
                    gpu_count: static_type.gpu,
                    architectures: static_type.arch.clone(),
                    virtualization: static_type.linux_virtualization_types.clone(),
                    on_demand_price: pricing.linux.ondemand * multiplier,
                    spot_price_by_az,
                },
            );
        }

        Self {
            region: region.to_string(),
            entries,
        }
    }

    /// Assemble a catalog directly from prepared entries.
    ///
    /// Useful for harnesses that already hold merged pricing data.
    pub fn from_entries(region: &str, entries: HashMap<String, TypeInfo>) -> Self {
        Self {
            region: region.to_string(),
            entries,
        }
    }

    /// Region this catalog was built for
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Look up one instance type
    pub fn lookup(&self, instance_type: &str) -> Option<&TypeInfo> {
        self.entries.get(instance_type)
    }

    /// Iterate over entries satisfying a predicate
    pub fn for_each<'a>(
        &'a self,
        predicate: impl Fn(&TypeInfo) -> bool + 'a,
    ) -> impl Iterator<Item = &'a TypeInfo> {
        self.entries.values().filter(move |info| predicate(info))
    }

    /// Number of catalogued types
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the catalog holds no types
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Parse the static dataset from its JSON representation.
pub fn parse_dataset(raw: &str) -> crate::error::Result<Vec<StaticInstanceType>> {
    Ok(serde_json::from_str(raw)?)
}
