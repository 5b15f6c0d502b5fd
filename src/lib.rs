//! Strata: stack-graph deployment orchestrator.
//!
//! Declared stacks form a dependency graph, explicit or discovered from
//! `${output ...}` lookups in their variables. Deploys walk the graph with
//! bounded concurrency, destroys walk it in reverse, and lifecycle hooks run
//! around both.

pub mod cli;
pub mod core;
pub mod error;
pub mod hooks;
pub mod lookups;
pub mod provider;
