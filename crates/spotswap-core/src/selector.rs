//! Spot candidate selection
//!
//! Pure and deterministic: given the same catalog, config and group
//! zones, [`select_candidates`] always returns the same ordered list.

use crate::catalog::{RegionalCatalog, TypeInfo};
use crate::config::{matches_any_pattern, BiddingPolicy, Config};

/// One acceptable spot replacement, best candidates first
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// Instance type to request
    pub instance_type: String,
    /// Availability zone to place it in
    pub availability_zone: String,
    /// Maximum price to bid
    pub bid_price: f64,
    /// Current spot price that justified the candidate
    pub spot_price: f64,
}

/// Select spot candidates for one on-demand instance.
///
/// Candidates must match the original's hardware on every axis, pass the
/// allow/deny type patterns, and currently trade below the original's
/// adjusted on-demand price in a zone where the group already runs.
pub fn select_candidates(
    original: &TypeInfo,
    catalog: &RegionalCatalog,
    config: &Config,
    group_zones: &[String],
) -> Vec<Candidate> {
    let allowed = config.allowed_type_patterns();
    let disallowed = config.disallowed_type_patterns();

    let mut candidates: Vec<Candidate> = catalog
        .for_each(|info| is_compatible(info, original))
        .filter(|info| passes_type_policy(&info.instance_type, &allowed, &disallowed))
        .flat_map(|info| {
            group_zones.iter().filter_map(move |zone| {
                let spot_price = info.spot_price(zone)?;
                if spot_price >= original.on_demand_price {
                    return None;
                }
                Some(Candidate {
                    instance_type: info.instance_type.clone(),
                    availability_zone: zone.clone(),
                    bid_price: bid_price(config.bidding_policy, spot_price, original),
                    spot_price,
                })
            })
        })
        .collect();

    candidates.sort_by(|a, b| {
        a.spot_price
            .total_cmp(&b.spot_price)
            .then_with(|| {
                // deeper discount below the candidate's own list price wins
                let a_list = candidate_list_price(catalog, a);
                let b_list = candidate_list_price(catalog, b);
                b_list.total_cmp(&a_list)
            })
            .then_with(|| a.instance_type.cmp(&b.instance_type))
            .then_with(|| a.availability_zone.cmp(&b.availability_zone))
    });
    candidates
}

fn candidate_list_price(catalog: &RegionalCatalog, candidate: &Candidate) -> f64 {
    catalog
        .lookup(&candidate.instance_type)
        .map(|info| info.on_demand_price)
        .unwrap_or(0.0)
}

/// Whether `candidate` can stand in for `original` on every hardware axis.
fn is_compatible(candidate: &TypeInfo, original: &TypeInfo) -> bool {
    if candidate.vcpu < original.vcpu || candidate.memory_gib < original.memory_gib {
        return false;
    }
    if candidate.gpu_count < original.gpu_count {
        return false;
    }
    if candidate.network_rank < original.network_rank {
        return false;
    }
    if let Some(required) = &original.storage {
        match &candidate.storage {
            None => return false,
            Some(offered) => {
                if offered.total_gb < required.total_gb || offered.ssd != required.ssd {
                    return false;
                }
            }
        }
    }
    if !original
        .architectures
        .iter()
        .any(|arch| candidate.architectures.contains(arch))
    {
        return false;
    }
    if !original
        .virtualization
        .iter()
        .any(|virt| candidate.virtualization.contains(virt))
    {
        return false;
    }
    true
}

fn passes_type_policy(instance_type: &str, allowed: &[&str], disallowed: &[&str]) -> bool {
    if !allowed.is_empty() && !matches_any_pattern(allowed, instance_type) {
        return false;
    }
    !matches_any_pattern(disallowed, instance_type)
}

fn bid_price(policy: BiddingPolicy, spot_price: f64, original: &TypeInfo) -> f64 {
    match policy {
        BiddingPolicy::Normal => original.on_demand_price,
        BiddingPolicy::Aggressive => (spot_price * 2.0).max(original.on_demand_price),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{InstanceStorage, TypeInfo};
    use crate::config::License;
    use std::collections::HashMap;

    fn type_info(instance_type: &str, vcpu: u32, memory: f64, on_demand: f64) -> TypeInfo {
        TypeInfo {
            instance_type: instance_type.to_string(),
            vcpu,
            memory_gib: memory,
            storage: None,
            network_rank: 4,
            gpu_count: 0,
            architectures: vec!["x86_64".to_string()],
            virtualization: vec!["HVM".to_string()],
            on_demand_price: on_demand,
            spot_price_by_az: HashMap::new(),
        }
    }

    fn with_spot(mut info: TypeInfo, prices: &[(&str, f64)]) -> TypeInfo {
        info.spot_price_by_az = prices
            .iter()
            .map(|(az, p)| (az.to_string(), *p))
            .collect();
        info
    }

    fn catalog_of(entries: Vec<TypeInfo>) -> RegionalCatalog {
        RegionalCatalog::from_entries(
            "us-east-1",
            entries
                .into_iter()
                .map(|e| (e.instance_type.clone(), e))
                .collect(),
        )
    }

    fn zones(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn full_license() -> Config {
        Config {
            license: License::Full,
            ..Config::default()
        }
    }

    #[test]
    fn test_orders_by_spot_price_ascending() {
        let original = with_spot(type_info("m4.large", 2, 8.0, 0.10), &[]);
        let catalog = catalog_of(vec![
            original.clone(),
            with_spot(type_info("c4.xlarge", 4, 8.0, 0.20), &[("us-east-1a", 0.05)]),
            with_spot(type_info("m4.xlarge", 4, 16.0, 0.20), &[("us-east-1a", 0.03)]),
        ]);

        let got = select_candidates(&original, &catalog, &full_license(), &zones(&["us-east-1a"]));
        let types: Vec<&str> = got.iter().map(|c| c.instance_type.as_str()).collect();
        assert_eq!(types, vec!["m4.xlarge", "c4.xlarge"]);
    }

    #[test]
    fn test_rejects_spot_at_or_above_on_demand() {
        let original = type_info("m4.large", 2, 8.0, 0.10);
        let catalog = catalog_of(vec![
            with_spot(type_info("c4.xlarge", 4, 8.0, 0.20), &[("us-east-1a", 0.10)]),
            with_spot(type_info("m4.xlarge", 4, 16.0, 0.20), &[("us-east-1a", 0.12)]),
        ]);

        let got = select_candidates(&original, &catalog, &full_license(), &zones(&["us-east-1a"]));
        assert!(got.is_empty());
    }

    #[test]
    fn test_zone_without_history_yields_no_candidate() {
        let original = type_info("m4.large", 2, 8.0, 0.10);
        let catalog = catalog_of(vec![with_spot(
            type_info("m4.xlarge", 4, 16.0, 0.20),
            &[("us-east-1a", 0.03)],
        )]);

        let got = select_candidates(&original, &catalog, &full_license(), &zones(&["us-east-1b"]));
        assert!(got.is_empty());
    }

    #[test]
    fn test_compatibility_axes() {
        let mut original = type_info("m4.large", 2, 8.0, 0.10);
        original.gpu_count = 1;
        original.storage = Some(InstanceStorage {
            total_gb: 100.0,
            ssd: true,
        });
        original.network_rank = 6;

        let mut smaller_cpu = with_spot(type_info("a1.large", 1, 8.0, 0.2), &[("z", 0.01)]);
        smaller_cpu.gpu_count = 1;
        smaller_cpu.storage = original.storage;
        smaller_cpu.network_rank = 6;

        let mut hdd_storage = with_spot(type_info("d2.xlarge", 4, 16.0, 0.2), &[("z", 0.01)]);
        hdd_storage.gpu_count = 1;
        hdd_storage.storage = Some(InstanceStorage {
            total_gb: 2000.0,
            ssd: false,
        });
        hdd_storage.network_rank = 6;

        let mut arm = with_spot(type_info("m6g.xlarge", 4, 16.0, 0.2), &[("z", 0.01)]);
        arm.gpu_count = 1;
        arm.storage = original.storage;
        arm.network_rank = 6;
        arm.architectures = vec!["arm64".to_string()];

        let mut good = with_spot(type_info("g3.xlarge", 4, 16.0, 0.2), &[("z", 0.01)]);
        good.gpu_count = 2;
        good.storage = Some(InstanceStorage {
            total_gb: 200.0,
            ssd: true,
        });
        good.network_rank = 100;

        let catalog = catalog_of(vec![smaller_cpu, hdd_storage, arm, good]);
        let got = select_candidates(&original, &catalog, &full_license(), &zones(&["z"]));
        let types: Vec<&str> = got.iter().map(|c| c.instance_type.as_str()).collect();
        assert_eq!(types, vec!["g3.xlarge"]);
    }

    #[test]
    fn test_allowed_and_disallowed_patterns() {
        let original = type_info("m4.large", 2, 8.0, 0.10);
        let catalog = catalog_of(vec![
            with_spot(type_info("c4.xlarge", 4, 8.0, 0.20), &[("z", 0.02)]),
            with_spot(type_info("m4.xlarge", 4, 16.0, 0.20), &[("z", 0.03)]),
        ]);

        let only_m4 = Config {
            allowed_instance_types: "m4.*".to_string(),
            ..full_license()
        };
        let got = select_candidates(&original, &catalog, &only_m4, &zones(&["z"]));
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].instance_type, "m4.xlarge");

        let no_c4 = Config {
            disallowed_instance_types: "c4.*".to_string(),
            ..full_license()
        };
        let got = select_candidates(&original, &catalog, &no_c4, &zones(&["z"]));
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].instance_type, "m4.xlarge");
    }

    #[test]
    fn test_evaluation_license_blocks_large_types() {
        let original = type_info("m4.large", 2, 8.0, 0.10);
        let catalog = catalog_of(vec![with_spot(
            type_info("m4.16xlarge", 64, 256.0, 3.2),
            &[("z", 0.02)],
        )]);

        let evaluation = Config::default();
        assert!(select_candidates(&original, &catalog, &evaluation, &zones(&["z"])).is_empty());

        let full = full_license();
        assert_eq!(
            select_candidates(&original, &catalog, &full, &zones(&["z"])).len(),
            1
        );
    }

    #[test]
    fn test_bid_prices() {
        let original = type_info("m4.large", 2, 8.0, 0.10);
        let catalog = catalog_of(vec![with_spot(
            type_info("m4.xlarge", 4, 16.0, 0.20),
            &[("z", 0.03)],
        )]);

        let normal = select_candidates(&original, &catalog, &full_license(), &zones(&["z"]));
        assert!((normal[0].bid_price - 0.10).abs() < 1e-9);

        let aggressive = Config {
            bidding_policy: BiddingPolicy::Aggressive,
            ..full_license()
        };
        let got = select_candidates(&original, &catalog, &aggressive, &zones(&["z"]));
        // max(0.03 * 2, 0.10) = 0.10; with a higher spot price the doubled
        // bid takes over.
        assert!((got[0].bid_price - 0.10).abs() < 1e-9);

        let catalog = catalog_of(vec![with_spot(
            type_info("m4.xlarge", 4, 16.0, 0.20),
            &[("z", 0.08)],
        )]);
        let got = select_candidates(&original, &catalog, &aggressive, &zones(&["z"]));
        assert!((got[0].bid_price - 0.16).abs() < 1e-9);
    }

    #[test]
    fn test_selection_is_deterministic() {
        let original = type_info("m4.large", 2, 8.0, 0.10);
        let catalog = catalog_of(vec![
            with_spot(type_info("c4.xlarge", 4, 8.0, 0.20), &[("a", 0.03), ("b", 0.03)]),
            with_spot(type_info("m4.xlarge", 4, 16.0, 0.20), &[("a", 0.03)]),
        ]);

        let first = select_candidates(&original, &catalog, &full_license(), &zones(&["a", "b"]));
        for _ in 0..10 {
            let again =
                select_candidates(&original, &catalog, &full_license(), &zones(&["a", "b"]));
            assert_eq!(first, again);
        }
    }

    #[test]
    fn test_tie_break_prefers_deeper_discount() {
        let original = type_info("m4.large", 2, 8.0, 0.10);
        // Equal spot prices; c4.xlarge lists higher, so its discount is deeper.
        let catalog = catalog_of(vec![
            with_spot(type_info("c4.xlarge", 4, 8.0, 0.30), &[("z", 0.04)]),
            with_spot(type_info("m4.xlarge", 4, 16.0, 0.20), &[("z", 0.04)]),
        ]);

        let got = select_candidates(&original, &catalog, &full_license(), &zones(&["z"]));
        let types: Vec<&str> = got.iter().map(|c| c.instance_type.as_str()).collect();
        assert_eq!(types, vec!["c4.xlarge", "m4.xlarge"]);
    }
}
