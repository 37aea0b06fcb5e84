//! # spotswap-core
//!
//! Domain logic for the spotswap replacement engine: configuration,
//! the per-region instance-type catalog, and the spot candidate selector.
//!
//! Everything in this crate is pure and cloud-agnostic. The engine crate
//! owns all SDK traffic and feeds snapshots into these types.

pub mod catalog;
pub mod config;
pub mod error;
pub mod selector;
pub mod types;

pub use catalog::{RegionalCatalog, SpotPriceRecord, StaticInstanceType, TypeInfo};
pub use config::{
    BiddingPolicy, Config, License, TagFilteringMode, TerminationMethod,
};
pub use error::{CoreError, Result};
pub use selector::{select_candidates, Candidate};
pub use types::{GroupSnapshot, InstanceSnapshot, Lifecycle, Tag, VmState};
