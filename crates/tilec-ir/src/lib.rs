//! Tile-level kernel intermediate representation.
//!
//! A [`Kernel`] owns arenas of [`Buffer`]s, [`TileOp`]s and [`LoopNest`]s.
//! Later stages annotate the same kernel in place: layouts and swizzles are
//! attached to buffers, loops receive a [`Pipelined`] expansion, and passes
//! insert or replace ops.

pub mod arena;
mod buffer;
mod display;
mod error;
mod kernel;
mod layout;
mod op;
mod swizzle;
mod target;
mod types;

pub use arena::{Arena, Handle};
pub use buffer::{Buffer, Scope};
pub use display::{dump_kernel, format_operand};
pub use error::IrError;
pub use kernel::{Block, Kernel, LoopNest, Pipelined, Ring, Stmt};
pub use layout::{DenseLayout, Fragment, FragmentKind, Layout, Location, MmaOperand};
pub use op::{
    AtomicOp, BarrierKind, BinaryOp, COMPUTE_STAGE, IterRef, LOAD_STAGE, OpKind, OpTag, Operand,
    Phase, ReduceOp, SchedInfo, Step, TileOp,
};
pub use swizzle::{Swizzle, SwizzleKind};
pub use target::TargetSpec;
pub use types::{Bytes, Literal, Scalar, ScalarKind};
