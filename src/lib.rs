//! # streamgate
//!
//! Bounded-memory streaming pipelines over paged data sources.
//!
//! A pipeline pulls records from a [`SourceAdapter`](source::SourceAdapter)
//! in chunks, transforms each record, maintains global and grouped
//! aggregations incrementally, and delivers results to the caller through a
//! bounded, lazily pulled stream. Memory stays bounded end to end:
//!
//! - **Demand-driven production**: the Producer fetches only what the
//!   Aggregate Stage asked for, and the stage asks only for what fits in the
//!   caller's output buffer.
//! - **Memory circuit breaker**: production degrades and then pauses as
//!   process memory approaches a configured limit.
//! - **Bounded grouping**: each grouped aggregation caps its number of keys
//!   and counts the records it had to reject.
//! - **Supervision**: a registry reconciles pipeline status from the exit of
//!   its execution units, and a health monitor pauses, then kills, pipelines
//!   under sustained memory pressure.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use std::sync::Arc;
//! use streamgate::config::{AggregationSpec, GroupedAggregationSpec, PipelineConfig};
//! use streamgate::coordinator::Coordinator;
//! use streamgate::source::VecSource;
//! use streamgate::transform::IdentityTransform;
//!
//! # async fn run(records: Vec<streamgate::record::Record>) -> Result<(), streamgate::error::PipelineError> {
//! let coordinator = Coordinator::new();
//! let config = PipelineConfig::default()
//!   .with_aggregation(AggregationSpec::sum("revenue", "amount"))
//!   .with_grouped_aggregation(
//!     GroupedAggregationSpec::new("by_territory", ["territory"])
//!       .with_aggregation(AggregationSpec::count("orders")),
//!   );
//! let (id, mut stream) = coordinator
//!   .start(config, Arc::new(VecSource::new(records)), Arc::new(IdentityTransform))
//!   .await?;
//! while let Some(item) = stream.next().await {
//!   let _item = item?;
//! }
//! println!("{:?}", coordinator.status(&id)?);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod aggregate;
pub mod config;
pub mod control;
pub mod coordinator;
pub mod error;
pub mod health;
pub mod memory;
pub mod metrics;
pub mod producer;
pub mod record;
pub mod registry;
pub mod retry;
pub mod source;
pub mod stage;
pub mod supervision;
pub mod telemetry;
pub mod transform;

pub use aggregate::{AggregationSnapshot, AggregationState};
pub use config::{AggregateFunction, AggregationSpec, GroupedAggregationSpec, PipelineConfig, SortOrder};
pub use coordinator::{Coordinator, PipelineStatusReport, PipelineStream};
pub use error::{ConfigError, PipelineError, SourceError, TransformError};
pub use health::{HealthMonitor, HealthMonitorConfig, HealthReport};
pub use record::{FieldPath, Record};
pub use registry::{PipelineId, PipelineInfo, PipelineStatus, Registry};
pub use source::{SourceAdapter, VecSource};
pub use stage::StreamItem;
pub use telemetry::{Reporter, TelemetryEvent};
pub use transform::RecordTransform;

#[cfg(test)]
mod producer_test;
#[cfg(test)]
mod registry_test;
#[cfg(test)]
mod stage_test;
#[cfg(test)]
mod test_support;
