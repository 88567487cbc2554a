//! Batching and demultiplexing for GraphQL requests.
//!
//! Requests that arrive within one cooperative scheduler turn are merged
//! into a single upstream document, executed once, and the combined response
//! is split back into per-request responses:
//!
//! * [`BatchingExecutor`] batches whole operations, aliasing each
//!   constituent's top-level fields so the combined response demultiplexes
//!   without a side table.
//! * [`KeyedBatchLoader`] batches keyed lookups, deduplicating keys across
//!   concurrent callers.
//! * [`signal`] aggregates the constituents' cancellation sources so the one
//!   upstream call aborts as soon as any caller does.

#![warn(unreachable_pub)]

pub mod alias;
pub mod context;
pub mod error;
pub mod executor;
pub mod graphql;
pub mod json_ext;
pub mod loader;
pub mod merge;
pub mod signal;
pub mod split;

pub use crate::context::Context;
pub use crate::error::FetchError;
pub use crate::executor::BatchingExecutor;
pub use crate::executor::ExecutionRequest;
pub use crate::executor::Executor;
pub use crate::executor::OperationKind;
pub use crate::loader::KeyedBatchLoader;
pub use crate::loader::KeyedResolver;
pub use crate::loader::LoadError;
pub use crate::merge::MergedRequest;
pub use crate::merge::SelectionSetBuilder;
pub use crate::merge::merge_operations;
pub use crate::merge::merge_operations_with;
pub use crate::signal::AbortController;
pub use crate::signal::AbortSignal;
pub use crate::signal::TimeoutSignal;
pub use crate::split::split_response;
