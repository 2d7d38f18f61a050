//! Error types for the tile IR.

/// Errors that can occur when constructing or mutating a kernel.
#[derive(Debug, thiserror::Error)]
pub enum IrError {
    /// A handle index is out of bounds for its arena.
    #[error("{kind} handle index {index} out of bounds (arena size: {size})")]
    BadHandle {
        kind: &'static str,
        index: usize,
        size: usize,
    },

    /// A buffer declaration is malformed or its name is taken.
    #[error("invalid buffer `{name}`: {reason}")]
    InvalidBuffer { name: String, reason: String },

    /// Adding a dependency edge would close a cycle.
    #[error("dependency `{op}` -> `{on}` would create a cycle")]
    DependencyCycle { op: String, on: String },

    /// The dependency graph is not acyclic.
    #[error("dependency graph contains a cycle ({visited} of {total} ops ordered)")]
    Cycle { visited: usize, total: usize },

    /// An op is placed before one of its dependencies.
    #[error("op `{op}` runs before its dependency `{on}`")]
    DependencyOrder { op: String, on: String },

    /// An op's operands do not fit its kind.
    #[error("invalid operands for `{op}`: {reason}")]
    Operands { op: String, reason: String },

    /// A fragment does not fit the hardware's native tile or its buffer.
    #[error("invalid fragment: {reason}")]
    InvalidFragment { reason: String },

    /// A dense layout or swizzle description is malformed.
    #[error("invalid layout: {reason}")]
    InvalidLayout { reason: String },

    /// A layout cannot be attached to the buffer.
    #[error("cannot attach layout to `{buffer}`: {reason}")]
    LayoutMismatch { buffer: String, reason: String },

    /// A buffer already carries a layout.
    #[error("buffer `{buffer}` already has a layout")]
    LayoutAlreadyAttached { buffer: String },

    /// A swizzle cannot be attached to the buffer.
    #[error("cannot attach swizzle to `{buffer}`: {reason}")]
    SwizzleMismatch { buffer: String, reason: String },

    /// An op mixes element types and the conversion cannot be made explicit.
    #[error("`{op}` reads input {input} as {from} but computes in {to}, and no cast can stage it")]
    ImplicitConversion {
        op: String,
        input: usize,
        from: String,
        to: String,
    },

    /// A buffer reached a later stage without a layout.
    #[error("buffer `{buffer}` has no layout")]
    Unresolved { buffer: String },

    /// The op already carries scheduling metadata and cannot be rewired.
    #[error("op `{op}` is scheduled and can no longer be rewired")]
    OpFrozen { op: String },

    /// The op is not placed in any live block of the kernel.
    #[error("op `{op}` is not placed in the kernel body")]
    NotPlaced { op: String },

    /// A loop nest is malformed.
    #[error("invalid loop `{name}`: {reason}")]
    InvalidLoop { name: String, reason: String },
}
