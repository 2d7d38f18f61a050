//! Tile operations.

use std::collections::BTreeSet;

use crate::arena::Handle;
use crate::buffer::Buffer;
use crate::types::Literal;

/// Reduction combiner.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum ReduceOp {
    Sum,
    Max,
    Min,
}

/// Element-wise binary operator.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Max,
    Min,
}

impl BinaryOp {
    pub fn eval(self, a: f64, b: f64) -> f64 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Max => a.max(b),
            BinaryOp::Min => a.min(b),
        }
    }
}

/// Read-modify-write update performed by an atomic op.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum AtomicOp {
    Add,
    Max,
    Min,
    Exchange,
}

/// Synchronization flavour.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum BarrierKind {
    /// Block-wide execution and memory barrier.
    Sync,
    /// Wait until at most `pending` groups of asynchronous copies are in flight.
    AsyncWait { pending: u32 },
}

/// The closed set of tile operation kinds.
#[derive(Clone, Debug, PartialEq)]
pub enum OpKind {
    /// `outputs[0] = inputs[0]`. `vector` is the per-lane chunk chosen by
    /// store planning; `materialize` marks copies inserted to change layout.
    Copy { vector: Option<u32>, materialize: bool },
    /// `outputs[0] = value` everywhere.
    Fill { value: Literal },
    /// Reduce `inputs[0]` along `axis` into `outputs[0]`.
    Reduce { op: ReduceOp, axis: usize },
    /// `outputs[0] = inputs[0] op inputs[1]`.
    Elementwise { op: BinaryOp },
    /// `C (+)= A * B` with inputs `[A, B]` and output `C`.
    Gemm { accumulate: bool },
    /// `outputs[0] = outputs[0] op inputs[0]`, element-wise and atomically.
    Atomic { op: AtomicOp, vector: Option<u32> },
    /// Element type conversion, `outputs[0] = inputs[0] as dtype`.
    Cast,
    Barrier(BarrierKind),
}

/// Field-less discriminant of [`OpKind`], used as a lookup key.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum OpTag {
    Copy,
    Fill,
    Reduce,
    Elementwise,
    Gemm,
    Atomic,
    Cast,
    Barrier,
}

impl OpKind {
    pub fn tag(&self) -> OpTag {
        match self {
            OpKind::Copy { .. } => OpTag::Copy,
            OpKind::Fill { .. } => OpTag::Fill,
            OpKind::Reduce { .. } => OpTag::Reduce,
            OpKind::Elementwise { .. } => OpTag::Elementwise,
            OpKind::Gemm { .. } => OpTag::Gemm,
            OpKind::Atomic { .. } => OpTag::Atomic,
            OpKind::Cast => OpTag::Cast,
            OpKind::Barrier(_) => OpTag::Barrier,
        }
    }

    /// Whether the op reads its own output before writing it.
    pub fn reads_output(&self) -> bool {
        matches!(
            self,
            OpKind::Gemm { accumulate: true } | OpKind::Atomic { .. }
        )
    }

    /// `(inputs, outputs)` the kind expects.
    pub fn arity(&self) -> (usize, usize) {
        match self {
            OpKind::Copy { .. } | OpKind::Reduce { .. } | OpKind::Atomic { .. } | OpKind::Cast => {
                (1, 1)
            }
            OpKind::Fill { .. } => (0, 1),
            OpKind::Elementwise { .. } | OpKind::Gemm { .. } => (2, 1),
            OpKind::Barrier(_) => (0, 0),
        }
    }

    /// The per-lane chunk recorded by store planning.
    pub fn vector(&self) -> Option<u32> {
        match self {
            OpKind::Copy { vector, .. } | OpKind::Atomic { vector, .. } => *vector,
            _ => None,
        }
    }
}

/// A window of a buffer advancing with the enclosing loop.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct Step {
    pub axis: usize,
    /// Window extent along `axis`; iteration `i` covers `[i * extent, (i + 1) * extent)`.
    pub extent: u32,
}

/// One buffer argument of a tile op.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct Operand {
    pub buffer: Handle<Buffer>,
    pub step: Option<Step>,
    /// Set on pipeline clones: the physical instance is picked from the
    /// buffer's ring by the op's iteration.
    pub rotating: bool,
}

impl Operand {
    pub fn whole(buffer: Handle<Buffer>) -> Self {
        Self {
            buffer,
            step: None,
            rotating: false,
        }
    }

    pub fn stepped(buffer: Handle<Buffer>, axis: usize, extent: u32) -> Self {
        Self {
            buffer,
            step: Some(Step { axis, extent }),
            rotating: false,
        }
    }

    pub fn rotating(self) -> Self {
        Self {
            rotating: true,
            ..self
        }
    }

    /// Shape of the region one execution touches.
    pub fn tile_shape(&self, buffer: &Buffer) -> Vec<u32> {
        let mut shape = buffer.shape.clone();
        if let Some(step) = self.step {
            if let Some(d) = shape.get_mut(step.axis) {
                *d = step.extent;
            }
        }
        shape
    }

    /// First index of the region touched in `iteration`.
    pub fn origin(&self, rank: usize, iteration: u32) -> Vec<u32> {
        let mut origin = vec![0; rank];
        if let Some(step) = self.step {
            if let Some(o) = origin.get_mut(step.axis) {
                *o = iteration * step.extent;
            }
        }
        origin
    }
}

/// Part of a pipelined loop an op was placed in.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum Phase {
    Prologue,
    Steady,
    Epilogue,
}

/// Which source iteration a scheduled op executes.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum IterRef {
    /// A fixed iteration (prologue and epilogue).
    Absolute(u32),
    /// `i + k` where `i` is the steady-state loop counter.
    Relative(u32),
}

impl IterRef {
    pub fn resolve(self, i: u32) -> u32 {
        match self {
            IterRef::Absolute(n) => n,
            IterRef::Relative(k) => i + k,
        }
    }
}

/// Load stage id.
pub const LOAD_STAGE: u32 = 0;
/// Compute stage id.
pub const COMPUTE_STAGE: u32 = 1;

/// Scheduling metadata attached by the pipeline scheduler.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SchedInfo {
    pub stage: u32,
    pub phase: Phase,
    pub iteration: IterRef,
    /// The loop-body op this one was cloned from.
    pub origin: Handle<TileOp>,
}

/// One semantic action over tile-shaped buffers.
///
/// Ops are immutable once added to a [`Kernel`](crate::Kernel), except for
/// dependency edges and [`SchedInfo`], which only the kernel can attach.
#[derive(Clone, Debug)]
pub struct TileOp {
    pub name: String,
    pub kind: OpKind,
    pub inputs: Vec<Operand>,
    pub outputs: Vec<Operand>,
    pub(crate) deps: BTreeSet<Handle<TileOp>>,
    pub(crate) sched: Option<SchedInfo>,
}

impl TileOp {
    pub fn new(
        name: impl Into<String>,
        kind: OpKind,
        inputs: Vec<Operand>,
        outputs: Vec<Operand>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            inputs,
            outputs,
            deps: BTreeSet::new(),
            sched: None,
        }
    }

    pub fn copy(name: impl Into<String>, src: Operand, dst: Operand) -> Self {
        Self::new(
            name,
            OpKind::Copy {
                vector: None,
                materialize: false,
            },
            vec![src],
            vec![dst],
        )
    }

    pub fn fill(name: impl Into<String>, value: Literal, dst: Operand) -> Self {
        Self::new(name, OpKind::Fill { value }, vec![], vec![dst])
    }

    pub fn gemm(name: impl Into<String>, a: Operand, b: Operand, c: Operand) -> Self {
        Self::new(name, OpKind::Gemm { accumulate: true }, vec![a, b], vec![c])
    }

    pub fn reduce(name: impl Into<String>, op: ReduceOp, axis: usize, src: Operand, dst: Operand) -> Self {
        Self::new(name, OpKind::Reduce { op, axis }, vec![src], vec![dst])
    }

    pub fn elementwise(
        name: impl Into<String>,
        op: BinaryOp,
        lhs: Operand,
        rhs: Operand,
        dst: Operand,
    ) -> Self {
        Self::new(name, OpKind::Elementwise { op }, vec![lhs, rhs], vec![dst])
    }

    pub fn atomic(name: impl Into<String>, op: AtomicOp, src: Operand, dst: Operand) -> Self {
        Self::new(name, OpKind::Atomic { op, vector: None }, vec![src], vec![dst])
    }

    pub fn cast(name: impl Into<String>, src: Operand, dst: Operand) -> Self {
        Self::new(name, OpKind::Cast, vec![src], vec![dst])
    }

    pub fn barrier(name: impl Into<String>, kind: BarrierKind) -> Self {
        Self::new(name, OpKind::Barrier(kind), vec![], vec![])
    }

    /// Ops that must complete before this one.
    pub fn deps(&self) -> impl Iterator<Item = Handle<TileOp>> + '_ {
        self.deps.iter().copied()
    }

    pub fn sched(&self) -> Option<&SchedInfo> {
        self.sched.as_ref()
    }

    /// A copy of the op without dependencies or scheduling metadata.
    pub fn detached(&self) -> TileOp {
        TileOp::new(
            self.name.clone(),
            self.kind.clone(),
            self.inputs.clone(),
            self.outputs.clone(),
        )
    }

    /// Operands read, including the output for read-modify-write kinds.
    pub fn reads(&self) -> impl Iterator<Item = &Operand> {
        let rmw = if self.kind.reads_output() {
            &self.outputs[..]
        } else {
            &[]
        };
        self.inputs.iter().chain(rmw)
    }

    pub fn writes(&self) -> impl Iterator<Item = &Operand> {
        self.outputs.iter()
    }

    pub fn touches(&self, buffer: Handle<Buffer>) -> bool {
        self.inputs
            .iter()
            .chain(&self.outputs)
            .any(|o| o.buffer == buffer)
    }

    pub fn is_barrier(&self) -> bool {
        matches!(self.kind, OpKind::Barrier(_))
    }
}
