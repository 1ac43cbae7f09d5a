//! Shared configuration, error types, IDs, memory budgets and observability
//! primitives for Tessera crates.
//!
//! Architecture role:
//! - defines engine configuration passed across layers
//! - provides common [`TesseraError`] / [`Result`] contracts
//! - hosts the worker buffer pool and per-operator budgets
//! - hosts the metrics sink contract and its prometheus implementation
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`ipc`]
//! - [`memory`]
//! - [`metrics`]

pub mod config;
pub mod error;
pub mod ids;
pub mod ipc;
pub mod memory;
pub mod metrics;

pub use config::{EngineConfig, SpillLocation, SpillTier};
pub use error::{Result, TesseraError};
pub use ids::*;
pub use memory::{BufferPool, MemoryPressure, MemoryReservation, OperatorBufferPool};
pub use metrics::{MetricsRegistry, MetricsSink, NoopMetrics, OperatorMetric};
