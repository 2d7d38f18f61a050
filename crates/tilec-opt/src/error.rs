//! Stage errors of the lowering pipeline.

use std::fmt;

use tilec_ir::IrError;

/// Two ops need incompatible layouts for one buffer and no materializing
/// copy may be inserted between them.
#[derive(Debug, thiserror::Error)]
#[error("layout conflict on `{buffer}`: {first}, but {second}")]
pub struct LayoutConflictError {
    pub buffer: String,
    /// The constraint that narrowed the buffer first.
    pub first: String,
    /// The constraint that left no layout.
    pub second: String,
}

/// No member of the swizzle family makes every accessor conflict-free.
#[derive(Debug, thiserror::Error)]
#[error(
    "no swizzle removes bank conflicts on `{buffer}` (worst degree {worst_degree}, accessed by {})",
    join(.accessors)
)]
pub struct SwizzleInfeasibleError {
    pub buffer: String,
    pub accessors: Vec<String>,
    /// Worst accesses per bank per wavefront without a swizzle.
    pub worst_degree: u32,
}

fn join(names: &[String]) -> String {
    names.join(", ")
}

/// Why a loop cannot be pipelined at the requested depth.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DependencyViolation {
    /// A compute op reads a staged buffer before the iteration's load writes it.
    ReadBeforeWrite,
    /// A load reads a buffer written by a compute op of the loop.
    ComputeFeedsLoad,
    /// A staged buffer is also written by a compute op.
    StagedBufferWrittenByCompute,
    /// A staged buffer is accessed outside the loop.
    StagedBufferLiveOut,
    /// The body has no load stage to overlap.
    NoLoadStage,
    /// Fewer iterations than the prologue issues.
    TripCountTooSmall,
}

impl fmt::Display for DependencyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ReadBeforeWrite => "a compute reads a staged buffer before its load in the same iteration",
            Self::ComputeFeedsLoad => "a load depends on a value computed in the loop",
            Self::StagedBufferWrittenByCompute => "a staged buffer is written by a compute op",
            Self::StagedBufferLiveOut => "a staged buffer is used outside the loop",
            Self::NoLoadStage => "the body has no load stage",
            Self::TripCountTooSmall => "the trip count is smaller than the prologue",
        })
    }
}

/// A loop body whose dependencies do not allow the requested depth.
#[derive(Debug, thiserror::Error)]
#[error("cannot pipeline loop `{loop_name}` at depth {depth}: {reason}{}", context(.op, .buffer))]
pub struct PipelineDependencyError {
    pub loop_name: String,
    pub depth: u32,
    pub op: Option<String>,
    pub buffer: Option<String>,
    pub reason: DependencyViolation,
}

fn context(op: &Option<String>, buffer: &Option<String>) -> String {
    match (op, buffer) {
        (Some(op), Some(buffer)) => format!(" (op `{op}`, buffer `{buffer}`)"),
        (Some(op), None) => format!(" (op `{op}`)"),
        (None, Some(buffer)) => format!(" (buffer `{buffer}`)"),
        (None, None) => String::new(),
    }
}

/// Any failure of [`lower`](crate::lower).
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error(transparent)]
    Ir(#[from] IrError),
    #[error(transparent)]
    LayoutConflict(#[from] LayoutConflictError),
    #[error(transparent)]
    SwizzleInfeasible(#[from] SwizzleInfeasibleError),
    #[error(transparent)]
    PipelineDependency(#[from] PipelineDependencyError),
}
