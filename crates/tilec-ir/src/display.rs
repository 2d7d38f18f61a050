//! Display implementations and text dump for debugging.

use std::fmt::{self, Write};

use crate::Kernel;
use crate::arena::Handle;
use crate::buffer::{Buffer, Scope};
use crate::kernel::Stmt;
use crate::layout::{DenseLayout, Fragment, FragmentKind, Layout, MmaOperand};
use crate::op::{AtomicOp, BarrierKind, BinaryOp, IterRef, OpKind, Operand, ReduceOp, TileOp};
use crate::swizzle::{Swizzle, SwizzleKind};
use crate::types::{Literal, Scalar, ScalarKind};

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ScalarKind::Bool => write!(f, "bool"),
            ScalarKind::Sint => write!(f, "i{}", self.width * 8),
            ScalarKind::Uint => write!(f, "u{}", self.width * 8),
            ScalarKind::Float => write!(f, "f{}", self.width * 8),
            ScalarKind::BFloat => write!(f, "bf{}", self.width * 8),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Scope::Global => "global",
            Scope::Shared => "shared",
            Scope::Fragment => "fragment",
            Scope::Local => "local",
        })
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Float(v) => write!(f, "{v:?}"),
            Literal::Int(v) => write!(f, "{v}"),
            Literal::Bool(v) => write!(f, "{v}"),
        }
    }
}

impl fmt::Display for DenseLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let order: Vec<_> = self.order().iter().map(|d| d.to_string()).collect();
        write!(f, "dense[{}]", order.join(","))
    }
}

impl fmt::Display for Fragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [r, c] = self.tile;
        match self.kind {
            FragmentKind::Strip { vector } => write!(f, "frag.strip<{r}x{c},v{vector}>"),
            FragmentKind::Mma(op) => {
                let name = match op {
                    MmaOperand::A => "a",
                    MmaOperand::B => "b",
                    MmaOperand::Accumulator => "acc",
                };
                write!(f, "frag.mma_{name}<{r}x{c}>")
            }
        }
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layout::Dense(d) => fmt::Display::fmt(d, f),
            Layout::Fragment(fr) => fmt::Display::fmt(fr, f),
        }
    }
}

impl fmt::Display for Swizzle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            SwizzleKind::Xor => "xor",
            SwizzleKind::Rotate => "rot",
            SwizzleKind::RotateInverse => "rot_inv",
        };
        write!(
            f,
            "{kind}(bits={}, base={}, shift={})",
            self.bits, self.base, self.shift
        )
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Max => "max",
            BinaryOp::Min => "min",
        })
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Copy { vector, materialize } => {
                f.write_str(if *materialize { "relayout" } else { "copy" })?;
                if let Some(v) = vector {
                    write!(f, ".v{v}")?;
                }
                Ok(())
            }
            OpKind::Fill { value } => write!(f, "fill({value})"),
            OpKind::Reduce { op, axis } => {
                let op = match op {
                    ReduceOp::Sum => "sum",
                    ReduceOp::Max => "max",
                    ReduceOp::Min => "min",
                };
                write!(f, "reduce.{op}[{axis}]")
            }
            OpKind::Elementwise { op } => write!(f, "{op}"),
            OpKind::Gemm { accumulate } => {
                f.write_str(if *accumulate { "gemm.acc" } else { "gemm" })
            }
            OpKind::Atomic { op, vector } => {
                let op = match op {
                    AtomicOp::Add => "add",
                    AtomicOp::Max => "max",
                    AtomicOp::Min => "min",
                    AtomicOp::Exchange => "exch",
                };
                write!(f, "atomic.{op}")?;
                if let Some(v) = vector {
                    write!(f, ".v{v}")?;
                }
                Ok(())
            }
            OpKind::Cast => f.write_str("cast"),
            OpKind::Barrier(BarrierKind::Sync) => f.write_str("sync"),
            OpKind::Barrier(BarrierKind::AsyncWait { pending }) => write!(f, "wait({pending})"),
        }
    }
}

impl fmt::Display for IterRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IterRef::Absolute(n) => write!(f, "{n}"),
            IterRef::Relative(0) => f.write_str("i"),
            IterRef::Relative(k) => write!(f, "i+{k}"),
        }
    }
}

fn format_shape(shape: &[u32]) -> String {
    let dims: Vec<_> = shape.iter().map(|d| d.to_string()).collect();
    format!("[{}]", dims.join(", "))
}

/// Formats an operand as `name`, `name{axis@extent}` for loop windows and
/// a trailing `~` for ring-rotated operands.
pub fn format_operand(kernel: &Kernel, operand: &Operand) -> String {
    let mut s = kernel.buffer(operand.buffer).name.clone();
    if let Some(step) = operand.step {
        let _ = write!(s, "{{{}@{}}}", step.axis, step.extent);
    }
    if operand.rotating {
        s.push('~');
    }
    s
}

fn format_buffer(buffer: &Buffer) -> String {
    let mut s = format!(
        "{}: {} {}{}",
        buffer.name,
        buffer.scope,
        buffer.dtype,
        format_shape(&buffer.shape)
    );
    match buffer.layout() {
        Some(layout) => {
            let _ = write!(s, " {layout}");
        }
        None => s.push_str(" <unresolved>"),
    }
    if let Some(sw) = buffer.swizzle() {
        let _ = write!(s, " swizzle {sw}");
    }
    if let Some((logical, instance)) = buffer.instance_of {
        let _ = write!(s, " (instance {instance} of [{}])", logical.index());
    }
    s
}

fn format_op(kernel: &Kernel, handle: Handle<TileOp>) -> String {
    let op = kernel.op(handle);
    let list = |operands: &[Operand]| -> String {
        operands
            .iter()
            .map(|o| format_operand(kernel, o))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let mut s = format!("%{} {} = {}", handle.index(), op.name, op.kind);
    if !op.inputs.is_empty() {
        let _ = write!(s, " {}", list(&op.inputs));
    }
    if !op.outputs.is_empty() {
        let _ = write!(s, " -> {}", list(&op.outputs));
    }
    if let Some(info) = op.sched() {
        let _ = write!(s, " @{} stage {}", info.iteration, info.stage);
    }
    let deps: Vec<_> = op.deps().map(|d| format!("%{}", d.index())).collect();
    if !deps.is_empty() {
        let _ = write!(s, " after {}", deps.join(" "));
    }
    s
}

/// Dumps a kernel in a human-readable text format.
pub fn dump_kernel(kernel: &Kernel) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "kernel {} {{", kernel.name);
    for (_, buffer) in kernel.buffers() {
        let _ = writeln!(out, "  buffer {}", format_buffer(buffer));
    }
    for stmt in kernel.body() {
        match *stmt {
            Stmt::Op(h) => {
                let _ = writeln!(out, "  {}", format_op(kernel, h));
            }
            Stmt::Loop(l) => {
                let nest = kernel.loop_nest(l);
                let _ = write!(out, "  loop {} 0..{}", nest.name, nest.extent);
                match nest.expansion() {
                    None => {
                        if let Some(d) = nest.depth {
                            let _ = write!(out, " depth {d}");
                        }
                        let _ = writeln!(out, " {{");
                        for &h in nest.body() {
                            let _ = writeln!(out, "    {}", format_op(kernel, h));
                        }
                    }
                    Some(p) => {
                        let _ = writeln!(
                            out,
                            " pipelined depth {} steady x{} {{",
                            p.depth, p.steady_trips
                        );
                        for ring in &p.rings {
                            let names: Vec<_> = ring
                                .instances
                                .iter()
                                .map(|&b| kernel.buffer(b).name.as_str())
                                .collect();
                            let _ = writeln!(
                                out,
                                "    ring {}: {}",
                                kernel.buffer(ring.logical).name,
                                names.join(", ")
                            );
                        }
                        for (label, ops) in [
                            ("prologue", &p.prologue),
                            ("steady", &p.steady),
                            ("epilogue", &p.epilogue),
                        ] {
                            let _ = writeln!(out, "    {label}:");
                            for &h in ops {
                                let _ = writeln!(out, "      {}", format_op(kernel, h));
                            }
                        }
                    }
                }
                let _ = writeln!(out, "  }}");
            }
        }
    }
    let _ = writeln!(out, "}}");
    out
}
