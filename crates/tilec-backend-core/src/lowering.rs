//! Table-driven instruction selection.
//!
//! A [`LoweringTable`] lists, per op kind, the operand layout combinations a
//! target can execute. [`lower_kernel`] walks a resolved kernel and selects
//! the first matching rule for every op, in registration order. An op with
//! no matching rule is an [`UnsupportedOpError`]; there is no generic
//! fallback.

use std::fmt;

use tilec_ir::{
    AtomicOp, BarrierKind, Buffer, FragmentKind, IterRef, Kernel, Layout, MmaOperand, OpKind,
    OpTag, Operand, Pipelined, ReduceOp, Scalar, Scope, Step, Stmt, Swizzle, TileOp,
};

use crate::{BackendError, UnsupportedOpError};

/// How an operand's buffer is laid out, as far as instruction selection
/// is concerned.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum LayoutClass {
    /// Dense device memory.
    Global,
    /// Dense shared memory, possibly behind a swizzle.
    Shared {
        /// Whether addresses go through a swizzle.
        swizzled: bool,
    },
    /// Dense per-lane memory.
    Local,
    /// Register tile in the layout a cooperative copy produces.
    Strip,
    /// Register tile in the matrix unit's operand layout.
    Mma(MmaOperand),
}

impl LayoutClass {
    /// Classifies a buffer. The buffer must carry a layout.
    pub fn of(buffer: &Buffer) -> Result<Self, tilec_ir::IrError> {
        let layout = buffer.layout().ok_or_else(|| tilec_ir::IrError::Unresolved {
            buffer: buffer.name.clone(),
        })?;
        Ok(match (layout, buffer.scope) {
            (Layout::Fragment(frag), _) => match frag.kind {
                FragmentKind::Strip { .. } => Self::Strip,
                FragmentKind::Mma(operand) => Self::Mma(operand),
            },
            (Layout::Dense(_), Scope::Global) => Self::Global,
            (Layout::Dense(_), Scope::Shared) => Self::Shared {
                swizzled: buffer.swizzle().is_some(),
            },
            (Layout::Dense(_), Scope::Local | Scope::Fragment) => Self::Local,
        })
    }

    /// Whether the buffer lives in registers distributed over lanes.
    pub fn is_fragment(self) -> bool {
        matches!(self, Self::Strip | Self::Mma(_))
    }
}

impl fmt::Display for LayoutClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => f.write_str("global"),
            Self::Shared { swizzled: false } => f.write_str("shared"),
            Self::Shared { swizzled: true } => f.write_str("shared+swizzle"),
            Self::Local => f.write_str("local"),
            Self::Strip => f.write_str("strip"),
            Self::Mma(MmaOperand::A) => f.write_str("mma.a"),
            Self::Mma(MmaOperand::B) => f.write_str("mma.b"),
            Self::Mma(MmaOperand::Accumulator) => f.write_str("mma.acc"),
        }
    }
}

/// A pattern over one operand's [`LayoutClass`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Slot {
    /// Dense device memory.
    Global,
    /// Dense shared memory, swizzled or not.
    Shared,
    /// Dense per-lane memory.
    Local,
    /// Any dense buffer.
    Dense,
    /// A cooperative-copy register tile.
    Strip,
    /// A specific matrix-unit operand fragment.
    Mma(MmaOperand),
    /// A matrix-unit input: a shared tile or the matching operand fragment.
    Feed(MmaOperand),
    /// Any register tile.
    Fragment,
    /// Anything.
    Any,
}

impl Slot {
    /// Whether `class` matches this pattern.
    pub fn admits(self, class: LayoutClass) -> bool {
        match self {
            Self::Global => class == LayoutClass::Global,
            Self::Shared => matches!(class, LayoutClass::Shared { .. }),
            Self::Local => class == LayoutClass::Local,
            Self::Dense => !class.is_fragment(),
            Self::Strip => class == LayoutClass::Strip,
            Self::Mma(op) => class == LayoutClass::Mma(op),
            Self::Feed(op) => {
                matches!(class, LayoutClass::Shared { .. }) || class == LayoutClass::Mma(op)
            }
            Self::Fragment => class.is_fragment(),
            Self::Any => true,
        }
    }
}

/// One entry of a lowering table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lowering {
    /// Op kind the rule applies to.
    pub tag: OpTag,
    /// Patterns for the inputs followed by the outputs.
    pub slots: Vec<Slot>,
    /// Instruction or intrinsic the op becomes.
    pub mnemonic: &'static str,
}

impl Lowering {
    fn matches(&self, tag: OpTag, classes: &[LayoutClass]) -> bool {
        self.tag == tag
            && self.slots.len() == classes.len()
            && self.slots.iter().zip(classes).all(|(s, &c)| s.admits(c))
    }
}

/// The op/layout combinations one target can execute.
#[derive(Clone, Debug)]
pub struct LoweringTable {
    target: String,
    rules: Vec<Lowering>,
}

impl LoweringTable {
    /// Creates an empty table for the named target.
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            rules: Vec::new(),
        }
    }

    /// Appends a rule. Earlier rules take precedence.
    pub fn rule(mut self, tag: OpTag, slots: &[Slot], mnemonic: &'static str) -> Self {
        self.rules.push(Lowering {
            tag,
            slots: slots.to_vec(),
            mnemonic,
        });
        self
    }

    /// Name of the target the table describes.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the table has no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Selects the lowering for `op`.
    pub fn select(&self, kernel: &Kernel, op: &TileOp) -> Result<&Lowering, BackendError> {
        let mut classes = Vec::with_capacity(op.inputs.len() + op.outputs.len());
        for operand in op.inputs.iter().chain(&op.outputs) {
            classes.push(LayoutClass::of(kernel.buffer(operand.buffer))?);
        }
        let tag = op.kind.tag();
        if let Some(rule) = self.rules.iter().find(|r| r.matches(tag, &classes)) {
            return Ok(rule);
        }

        let layouts = op
            .inputs
            .iter()
            .chain(&op.outputs)
            .map(|o| {
                let buffer = kernel.buffer(o.buffer);
                match (buffer.layout(), buffer.swizzle()) {
                    (Some(layout), Some(sw)) => format!("{}: {layout} swizzle {sw}", buffer.name),
                    (Some(layout), None) => format!("{}: {layout}", buffer.name),
                    (None, _) => format!("{}: <unresolved>", buffer.name),
                }
            })
            .collect();
        Err(UnsupportedOpError {
            op: op.name.clone(),
            kind: op.kind.to_string(),
            layouts,
            target: self.target.clone(),
        }
        .into())
    }
}

/// A buffer as the emitter declares it.
#[derive(Clone, Debug, PartialEq)]
pub struct LoweredBuffer {
    /// Buffer name.
    pub name: String,
    /// Memory space.
    pub scope: Scope,
    /// Element type.
    pub dtype: Scalar,
    /// Total element count.
    pub elements: u64,
    /// Layout class.
    pub class: LayoutClass,
    /// Attached layout, as text.
    pub layout: String,
    /// Attached swizzle.
    pub swizzle: Option<Swizzle>,
    /// Registers per lane for register tiles.
    pub regs_per_lane: Option<u32>,
}

/// An op operand after ring resolution.
#[derive(Clone, Debug, PartialEq)]
pub struct LoweredOperand {
    /// The buffer accessed when the instance is fixed, the logical buffer
    /// otherwise.
    pub buffer: String,
    /// Instances selected by `iteration % ring.len()`, empty when fixed.
    pub ring: Vec<String>,
    /// Loop window, if the operand advances with the loop.
    pub step: Option<Step>,
    /// Layout class of the buffer.
    pub class: LayoutClass,
    /// Swizzle applied to addresses.
    pub swizzle: Option<Swizzle>,
}

/// One selected instruction.
#[derive(Clone, Debug, PartialEq)]
pub struct LoweredOp {
    /// Name of the IR op.
    pub name: String,
    /// The IR op kind.
    pub kind: OpKind,
    /// Selected instruction.
    pub mnemonic: &'static str,
    /// Lowered inputs.
    pub inputs: Vec<LoweredOperand>,
    /// Lowered outputs.
    pub outputs: Vec<LoweredOperand>,
    /// Source iteration for ops inside loops; `Relative(k)` is relative to
    /// the enclosing loop counter.
    pub iteration: Option<IterRef>,
}

impl LoweredOp {
    /// Compile-time parameters of the instruction, in a fixed order per kind.
    pub fn params(&self) -> Vec<String> {
        match self.kind {
            OpKind::Copy { vector, .. } => vec![vector.unwrap_or(1).to_string()],
            OpKind::Fill { .. } | OpKind::Cast => Vec::new(),
            OpKind::Reduce { op, axis } => {
                let op = match op {
                    ReduceOp::Sum => "sum",
                    ReduceOp::Max => "max",
                    ReduceOp::Min => "min",
                };
                vec![op.to_string(), axis.to_string()]
            }
            OpKind::Elementwise { op } => vec![op.to_string()],
            OpKind::Gemm { accumulate } => vec![accumulate.to_string()],
            OpKind::Atomic { op, vector } => {
                let op = match op {
                    AtomicOp::Add => "add",
                    AtomicOp::Max => "max",
                    AtomicOp::Min => "min",
                    AtomicOp::Exchange => "exch",
                };
                vec![op.to_string(), vector.unwrap_or(1).to_string()]
            }
            OpKind::Barrier(BarrierKind::Sync) => Vec::new(),
            OpKind::Barrier(BarrierKind::AsyncWait { pending }) => vec![pending.to_string()],
        }
    }
}

/// A statement of the lowered kernel body.
#[derive(Clone, Debug, PartialEq)]
pub enum LoweredStmt {
    /// A straight-line instruction.
    Op(LoweredOp),
    /// A counted loop with counter starting at zero.
    Loop {
        /// Loop name.
        name: String,
        /// Trip count.
        trips: u32,
        /// Instructions of one trip.
        body: Vec<LoweredOp>,
    },
}

/// A kernel after instruction selection, ready for text emission.
#[derive(Clone, Debug, PartialEq)]
pub struct LoweredKernel {
    /// Kernel name.
    pub name: String,
    /// Target the instructions were selected for.
    pub target: String,
    /// Every buffer, in declaration order.
    pub buffers: Vec<LoweredBuffer>,
    /// The body. Pipelined loops appear as prologue ops, a steady loop and
    /// epilogue ops.
    pub body: Vec<LoweredStmt>,
}

impl LoweredKernel {
    /// Every instruction in emission order.
    pub fn ops(&self) -> impl Iterator<Item = &LoweredOp> {
        self.body.iter().flat_map(|stmt| match stmt {
            LoweredStmt::Op(op) => std::slice::from_ref(op).iter(),
            LoweredStmt::Loop { body, .. } => body.iter(),
        })
    }

    /// Looks up a buffer by name.
    pub fn buffer(&self, name: &str) -> Option<&LoweredBuffer> {
        self.buffers.iter().find(|b| b.name == name)
    }
}

/// Runs instruction selection over a fully resolved kernel.
pub fn lower_kernel(kernel: &Kernel, table: &LoweringTable) -> Result<LoweredKernel, BackendError> {
    kernel.check_resolved()?;

    let mut buffers = Vec::with_capacity(kernel.buffer_count());
    for (_, b) in kernel.buffers() {
        let layout = b.layout().ok_or_else(|| tilec_ir::IrError::Unresolved {
            buffer: b.name.clone(),
        })?;
        buffers.push(LoweredBuffer {
            name: b.name.clone(),
            scope: b.scope,
            dtype: b.dtype,
            elements: b.elements(),
            class: LayoutClass::of(b)?,
            layout: layout.to_string(),
            swizzle: b.swizzle().copied(),
            regs_per_lane: layout.as_fragment().map(|f| f.regs_per_lane()),
        });
    }

    let lower = |h, expansion: Option<&Pipelined>, fallback: Option<IterRef>| {
        let op = kernel.op(h);
        let iteration = op.sched().map(|s| s.iteration).or(fallback);
        lower_op(kernel, table, op, expansion, iteration)
    };

    let mut body = Vec::new();
    for stmt in kernel.body() {
        match *stmt {
            Stmt::Op(h) => body.push(LoweredStmt::Op(lower(h, None, None)?)),
            Stmt::Loop(l) => {
                let nest = kernel.loop_nest(l);
                match nest.expansion() {
                    None => {
                        let ops = nest
                            .body()
                            .iter()
                            .map(|&h| lower(h, None, Some(IterRef::Relative(0))))
                            .collect::<Result<_, _>>()?;
                        body.push(LoweredStmt::Loop {
                            name: nest.name.clone(),
                            trips: nest.extent,
                            body: ops,
                        });
                    }
                    Some(p) => {
                        for &h in &p.prologue {
                            body.push(LoweredStmt::Op(lower(h, Some(p), None)?));
                        }
                        let steady = p
                            .steady
                            .iter()
                            .map(|&h| lower(h, Some(p), None))
                            .collect::<Result<_, _>>()?;
                        body.push(LoweredStmt::Loop {
                            name: nest.name.clone(),
                            trips: p.steady_trips,
                            body: steady,
                        });
                        for &h in &p.epilogue {
                            body.push(LoweredStmt::Op(lower(h, Some(p), None)?));
                        }
                    }
                }
            }
        }
    }

    let lowered = LoweredKernel {
        name: kernel.name.clone(),
        target: table.target.clone(),
        buffers,
        body,
    };
    log::debug!(
        "selected {} instruction(s) for `{}` on {}",
        lowered.ops().count(),
        lowered.name,
        lowered.target
    );
    Ok(lowered)
}

fn lower_op(
    kernel: &Kernel,
    table: &LoweringTable,
    op: &TileOp,
    expansion: Option<&Pipelined>,
    iteration: Option<IterRef>,
) -> Result<LoweredOp, BackendError> {
    let rule = table.select(kernel, op)?;
    let operands = |list: &[Operand]| -> Result<Vec<_>, BackendError> {
        list.iter()
            .map(|o| lower_operand(kernel, o, expansion, iteration))
            .collect()
    };
    Ok(LoweredOp {
        name: op.name.clone(),
        kind: op.kind.clone(),
        mnemonic: rule.mnemonic,
        inputs: operands(&op.inputs)?,
        outputs: operands(&op.outputs)?,
        iteration,
    })
}

fn lower_operand(
    kernel: &Kernel,
    operand: &Operand,
    expansion: Option<&Pipelined>,
    iteration: Option<IterRef>,
) -> Result<LoweredOperand, BackendError> {
    let buffer = kernel.buffer(operand.buffer);
    let mut name = buffer.name.clone();
    let mut ring = Vec::new();
    if let Some(r) = expansion.and_then(|p| p.ring_of(operand.buffer)) {
        if operand.rotating {
            match iteration {
                // Prologue and epilogue iterations pick their instance statically.
                Some(IterRef::Absolute(t)) => name = kernel.buffer(r.instance(t)).name.clone(),
                _ => {
                    ring = r
                        .instances
                        .iter()
                        .map(|&b| kernel.buffer(b).name.clone())
                        .collect();
                }
            }
        }
    }
    Ok(LoweredOperand {
        buffer: name,
        ring,
        step: operand.step,
        class: LayoutClass::of(buffer)?,
        swizzle: buffer.swizzle().copied(),
    })
}
