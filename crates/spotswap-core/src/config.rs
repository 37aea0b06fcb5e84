//! Engine configuration
//!
//! One immutable [`Config`] is built per invocation from the environment
//! and handed to every region by reference.

use crate::error::{CoreError, Result};
use crate::types::Tag;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Default tag key used when no filter is configured
pub const DEFAULT_FILTER_TAG_KEY: &str = "spot-enabled";

/// Instance type patterns excluded while running under an evaluation license
pub const EVALUATION_DISALLOWED_TYPES: &[&str] = &[
    "*.8xlarge",
    "*.9xlarge",
    "*.10xlarge",
    "*.12xlarge",
    "*.16xlarge",
    "*.18xlarge",
    "*.24xlarge",
    "*.32xlarge",
    "*.metal",
];

/// How the tag filter selects groups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TagFilteringMode {
    /// Act only on groups carrying every filter tag
    #[default]
    OptIn,
    /// Act on every group except those carrying every filter tag
    OptOut,
}

impl FromStr for TagFilteringMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "opt-in" | "" => Ok(Self::OptIn),
            "opt-out" => Ok(Self::OptOut),
            other => Err(CoreError::config(format!(
                "unknown tag filtering mode {other:?}, expected opt-in or opt-out"
            ))),
        }
    }
}

/// How aggressively to bid on spot capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BiddingPolicy {
    /// Bid the adjusted on-demand price
    #[default]
    Normal,
    /// Bid the greater of twice the current spot price and the adjusted
    /// on-demand price
    Aggressive,
}

impl FromStr for BiddingPolicy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "normal" | "" => Ok(Self::Normal),
            "aggressive" => Ok(Self::Aggressive),
            other => Err(CoreError::config(format!(
                "unknown bidding policy {other:?}, expected normal or aggressive"
            ))),
        }
    }
}

/// How the replaced on-demand instance is terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TerminationMethod {
    /// Terminate through the autoscaling service so lifecycle hooks fire
    #[default]
    AutoScaling,
    /// Terminate directly through the compute service
    Terminate,
}

impl FromStr for TerminationMethod {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "autoscaling" | "" => Ok(Self::AutoScaling),
            "terminate" => Ok(Self::Terminate),
            other => Err(CoreError::config(format!(
                "unknown termination method {other:?}, expected autoscaling or terminate"
            ))),
        }
    }
}

/// License tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum License {
    /// Evaluation tier, with a built-in disallowed type list
    #[default]
    Evaluation,
    /// Full license
    Full,
}

impl FromStr for License {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "evaluation" | "" => Ok(Self::Evaluation),
            "full" => Ok(Self::Full),
            other => Err(CoreError::config(format!(
                "unknown license {other:?}, expected evaluation or full"
            ))),
        }
    }
}

/// Immutable settings for one invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Enabled regions: comma/whitespace separated names or globs; empty = all
    pub regions: String,

    /// Group filter: comma/whitespace separated `key=value` tokens
    pub filter_by_tags: String,

    /// Filter mode
    pub tag_filtering_mode: TagFilteringMode,

    /// Absolute on-demand floor per group
    pub min_on_demand_number: i64,

    /// Percentage on-demand floor per group, 0..=100
    pub min_on_demand_percentage: f64,

    /// Multiplier applied to raw on-demand prices
    pub on_demand_price_multiplier: f64,

    /// Bidding policy
    pub bidding_policy: BiddingPolicy,

    /// Allowed instance type globs; empty = all
    pub allowed_instance_types: String,

    /// Disallowed instance type globs
    pub disallowed_instance_types: String,

    /// Termination method for replaced instances
    pub termination_method: TerminationMethod,

    /// License tier
    pub license: License,

    /// How long to wait for a spot request to produce a running instance
    pub spot_request_timeout_secs: u64,

    /// Retry attempts for transient cloud API errors
    pub api_retry_attempts: u32,

    /// Per-region deadline, the invocation budget minus a safety margin
    pub region_deadline_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            regions: String::new(),
            filter_by_tags: String::new(),
            tag_filtering_mode: TagFilteringMode::OptIn,
            min_on_demand_number: 0,
            min_on_demand_percentage: 0.0,
            on_demand_price_multiplier: 1.0,
            bidding_policy: BiddingPolicy::Normal,
            allowed_instance_types: String::new(),
            disallowed_instance_types: String::new(),
            termination_method: TerminationMethod::AutoScaling,
            license: License::Evaluation,
            spot_request_timeout_secs: 600,
            api_retry_attempts: 3,
            region_deadline_secs: 240,
        }
    }
}

impl Config {
    /// Validate settings that cannot be expressed in the type system.
    pub fn validate(&self) -> Result<()> {
        if !self.on_demand_price_multiplier.is_finite() || self.on_demand_price_multiplier <= 0.0 {
            return Err(CoreError::config(format!(
                "on-demand price multiplier must be a positive number, got {}",
                self.on_demand_price_multiplier
            )));
        }
        if !(0.0..=100.0).contains(&self.min_on_demand_percentage) {
            return Err(CoreError::config(format!(
                "minimum on-demand percentage must be within 0..=100, got {}",
                self.min_on_demand_percentage
            )));
        }
        if self.min_on_demand_number < 0 {
            return Err(CoreError::config(format!(
                "minimum on-demand number must not be negative, got {}",
                self.min_on_demand_number
            )));
        }
        if self.api_retry_attempts == 0 {
            return Err(CoreError::config(
                "api retry attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether a region participates in this invocation.
    ///
    /// Tokens are separated by commas and/or whitespace and may be globs.
    /// Concatenated names without a separator match nothing.
    pub fn region_enabled(&self, region: &str) -> bool {
        let tokens: Vec<&str> = split_tokens(&self.regions);
        if tokens.is_empty() {
            return true;
        }
        tokens.iter().any(|token| {
            glob::Pattern::new(token)
                .map(|p| p.matches(region))
                .unwrap_or(false)
        })
    }

    /// Parse the group filter into tags.
    ///
    /// Tokens without a `=` are discarded. An empty result falls back to
    /// `spot-enabled=true` in opt-in mode and `spot-enabled=false` in
    /// opt-out mode.
    pub fn filter_tags(&self) -> Vec<Tag> {
        let mut tags: Vec<Tag> = split_tokens(&self.filter_by_tags)
            .into_iter()
            .filter_map(|token| {
                let (key, value) = token.split_once('=')?;
                if key.is_empty() || value.is_empty() {
                    return None;
                }
                Some(Tag::new(key, value))
            })
            .collect();

        if tags.is_empty() {
            let default_value = match self.tag_filtering_mode {
                TagFilteringMode::OptIn => "true",
                TagFilteringMode::OptOut => "false",
            };
            tags.push(Tag::new(DEFAULT_FILTER_TAG_KEY, default_value));
        }
        tags
    }

    /// Allowed instance type patterns; empty means every type is allowed.
    pub fn allowed_type_patterns(&self) -> Vec<&str> {
        split_tokens(&self.allowed_instance_types)
    }

    /// Disallowed instance type patterns, including the evaluation list
    /// when running under an evaluation license.
    pub fn disallowed_type_patterns(&self) -> Vec<&str> {
        let mut patterns = split_tokens(&self.disallowed_instance_types);
        if self.license == License::Evaluation {
            patterns.extend(EVALUATION_DISALLOWED_TYPES);
        }
        patterns
    }
}

/// Split a comma/whitespace separated list into non-empty tokens.
fn split_tokens(raw: &str) -> Vec<&str> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Whether a filter pattern compiles at all.
pub fn pattern_compiles(pattern: &str) -> bool {
    glob::Pattern::new(pattern).is_ok()
}

/// Whether `value` matches any of the given glob patterns.
///
/// Uncompilable patterns match nothing.
pub fn matches_any_pattern(patterns: &[&str], value: &str) -> bool {
    patterns.iter().any(|pattern| {
        glob::Pattern::new(pattern)
            .map(|p| p.matches(value))
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_regions(regions: &str) -> Config {
        Config {
            regions: regions.to_string(),
            ..Config::default()
        }
    }

    #[test]
    fn test_region_enabled_empty_list_allows_all() {
        assert!(config_with_regions("").region_enabled("us-east-1"));
    }

    #[test]
    fn test_region_enabled_literal_names() {
        assert!(!config_with_regions("eu-west-1").region_enabled("us-east-1"));
        assert!(!config_with_regions("eu-west-1 ca-central-1").region_enabled("us-east-1"));
        assert!(config_with_regions("us-east-1 eu-west-1").region_enabled("us-east-1"));
        assert!(config_with_regions("us-east-1,eu-west-1").region_enabled("us-east-1"));
        assert!(config_with_regions("us-east-1, eu-west-1").region_enabled("us-east-1"));
    }

    #[test]
    fn test_region_enabled_globs() {
        assert!(config_with_regions("us-*, eu-*").region_enabled("us-east-1"));
        assert!(!config_with_regions("ap-*, eu-*").region_enabled("us-east-1"));
        assert!(config_with_regions("us*, eu*").region_enabled("us-east-1"));
        assert!(!config_with_regions("ap*, eu*").region_enabled("us-east-1"));
    }

    #[test]
    fn test_region_enabled_concatenated_names_match_nothing() {
        let cfg = config_with_regions("us-east-1eu-west-1");
        assert!(!cfg.region_enabled("us-east-1"));
        assert!(!cfg.region_enabled("eu-west-1"));
    }

    #[test]
    fn test_region_enabled_ignores_token_order() {
        assert!(config_with_regions("eu-west-1, us-east-1").region_enabled("us-east-1"));
        assert!(config_with_regions("us-east-1, eu-west-1").region_enabled("us-east-1"));
    }

    #[test]
    fn test_filter_tags_defaults() {
        let opt_in = Config::default();
        assert_eq!(
            opt_in.filter_tags(),
            vec![Tag::new("spot-enabled", "true")]
        );

        let opt_out = Config {
            tag_filtering_mode: TagFilteringMode::OptOut,
            ..Config::default()
        };
        assert_eq!(
            opt_out.filter_tags(),
            vec![Tag::new("spot-enabled", "false")]
        );
    }

    #[test]
    fn test_filter_tags_parsing() {
        let cfg = Config {
            filter_by_tags: "spot-enabled=true, environment=dev,team=interactive".to_string(),
            ..Config::default()
        };
        assert_eq!(
            cfg.filter_tags(),
            vec![
                Tag::new("spot-enabled", "true"),
                Tag::new("environment", "dev"),
                Tag::new("team", "interactive"),
            ]
        );
    }

    #[test]
    fn test_filter_tags_discards_bare_tokens() {
        let cfg = Config {
            filter_by_tags: "bob".to_string(),
            ..Config::default()
        };
        assert_eq!(cfg.filter_tags(), vec![Tag::new("spot-enabled", "true")]);

        let cfg = Config {
            filter_by_tags: "bob=value".to_string(),
            ..Config::default()
        };
        assert_eq!(cfg.filter_tags(), vec![Tag::new("bob", "value")]);
    }

    #[test]
    fn test_validate_rejects_bad_multiplier() {
        let mut cfg = Config::default();
        cfg.on_demand_price_multiplier = 0.0;
        assert!(cfg.validate().is_err());

        cfg.on_demand_price_multiplier = f64::NAN;
        assert!(cfg.validate().is_err());

        cfg.on_demand_price_multiplier = 0.99;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_percentage() {
        let mut cfg = Config::default();
        cfg.min_on_demand_percentage = 120.0;
        assert!(cfg.validate().is_err());

        cfg.min_on_demand_percentage = 50.0;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_enum_parsing() {
        assert_eq!(
            "opt-out".parse::<TagFilteringMode>().unwrap(),
            TagFilteringMode::OptOut
        );
        assert!("opt-up".parse::<TagFilteringMode>().is_err());

        assert_eq!(
            "aggressive".parse::<BiddingPolicy>().unwrap(),
            BiddingPolicy::Aggressive
        );
        assert!("bold".parse::<BiddingPolicy>().is_err());

        assert_eq!(
            "terminate".parse::<TerminationMethod>().unwrap(),
            TerminationMethod::Terminate
        );
        assert_eq!("full".parse::<License>().unwrap(), License::Full);
    }

    #[test]
    fn test_evaluation_license_extends_disallowed_patterns() {
        let cfg = Config {
            disallowed_instance_types: "t2.*".to_string(),
            ..Config::default()
        };
        let patterns = cfg.disallowed_type_patterns();
        assert!(patterns.contains(&"t2.*"));
        assert!(patterns.contains(&"*.metal"));

        let full = Config {
            license: License::Full,
            disallowed_instance_types: "t2.*".to_string(),
            ..Config::default()
        };
        assert_eq!(full.disallowed_type_patterns(), vec!["t2.*"]);
    }

    #[test]
    fn test_matches_any_pattern_invalid_pattern_matches_nothing() {
        assert!(!matches_any_pattern(&["[oops"], "m5.large"));
        assert!(matches_any_pattern(&["m5.*"], "m5.large"));
        assert!(!matches_any_pattern(&[], "m5.large"));
    }
}
