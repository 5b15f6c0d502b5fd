//! Core engine: types, parsing, context, graph, planning, execution.

pub mod context;
pub mod eventlog;
pub mod executor;
pub mod graph;
pub mod parser;
pub mod planner;
pub mod plugin;
pub mod report;
pub mod template;
pub mod types;
