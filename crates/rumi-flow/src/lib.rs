// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! rumi-flow
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cancel;
mod condition;
mod executor;
mod model;
mod order;
mod resolver;

pub use cancel::CancellationFlag;
pub use condition::eval_condition;
pub use executor::{FlowExecutor, FlowOutcome, StepHandler};
pub use model::{FlowDef, OnError, Step, StepKind};
pub use order::execution_order;
pub use resolver::{MAX_RESOLVE_DEPTH, VariableResolver};

/// Hard bound on nested `flow.run` chains.
pub const MAX_FLOW_CHAIN_DEPTH: usize = 8;

/// Context key a cooperative timeout is signalled through.
pub const FLOW_TIMEOUT_KEY: &str = "_flow_timeout";

/// Context key `parallel` merges branch results into.
pub const PARALLEL_RESULTS_KEY: &str = "_parallel_results";

/// Context key `retry` records the last attempt's error under.
pub const RETRY_ERROR_KEY: &str = "_retry_error";
