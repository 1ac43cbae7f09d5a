//! Distributed batch operators: grouped aggregation, joins, window and
//! cumulative transforms.
//!
//! Architecture role:
//! - consumes Arrow record batches pushed by the host pipeline
//! - coordinates workers through [`tessera_exchange::Collective`]
//! - bounds memory with per-operator budgets and spills through
//!   [`tessera_spill`]
//!
//! Key modules:
//! - [`operator`] host-facing operators and options
//! - [`groupby`] partitioned hash aggregation with recursive spill partitioning
//! - [`join`] hash and nested-loop joins
//! - [`window`] sort-based window functions
//! - [`cumulative`] prefix-scan and shuffle cumulative transforms
//! - [`colset`] per-function accumulators

pub mod colset;
pub mod column;
pub mod cumulative;
pub mod group_index;
pub mod groupby;
pub mod join;
pub mod operator;
pub mod output;
pub mod sort;
pub mod sync;
pub mod window;

pub use colset::{AggFunc, ColSet, FuncKind};
pub use join::{JoinType, RowPredicate};
pub use operator::{
    BatchOperator, Collaborators, CumulativeOperator, FunctionSpec, GroupbyOperator,
    HashJoinOperator, JoinSpec, OperatorOptions, WindowOperator,
};
pub use sort::{GlobalSort, LocalSort, SampleSort, SortKey};
