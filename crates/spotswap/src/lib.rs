//! # spotswap
//!
//! Regional replacement engine: swaps on-demand autoscaling group
//! members for equivalent spot capacity while preserving declared
//! capacity and zone balance.
//!
//! ## Architecture
//!
//! ```text
//! event ─▶ dispatcher ─▶ region controller ─▶ executor ─▶ cloud APIs
//!                            │
//!                      catalog + selector
//! ```
//!
//! Each enabled region runs as its own task under a deadline. Within a
//! region the controller scans instances, filters groups by tag policy,
//! snapshots spot pricing into the catalog, and hands each group to the
//! executor, which drives the attach/detach/terminate swap. The only
//! durable state is tags on cloud resources: pending spot requests carry
//! their group's name, so a crashed or timed-out invocation is resumed
//! by the next tick.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cloud;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod executor;
pub mod region;

pub use cloud::{Connections, GroupApi, ComputeApi, PricingApi, StackApi};
pub use dispatch::{Dispatcher, TickSummary};
pub use error::{EngineError, Result};
pub use events::EngineEvent;
pub use executor::{Executor, ReplacementAction, ReplacementOutcome, ReplacementState};
pub use region::{Region, RegionReport};
