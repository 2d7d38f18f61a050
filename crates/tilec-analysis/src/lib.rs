//! Analyses over the tile IR shared by the lowering stages.
//!
//! Nothing here mutates a kernel: def-use chains and loop dependencies feed
//! the pipeline scheduler, access patterns and the bank model feed the
//! swizzle optimizer, and effect traces check pipelined loops against their
//! original bodies.

pub mod access;
pub mod bank;
pub mod dataflow;
pub mod trace;

pub use access::{AccessPattern, LaneAccess, access_pattern, access_patterns, natural_vector};
pub use bank::{BankModel, conflict_degree};
pub use dataflow::{
    DefUse, DependencyKind, LoopDependency, Port, Stage, Use, classify_stage, loop_dependencies,
};
pub use trace::{Access, Effect, LogicalEffect, Region, trace_body, trace_loop};
