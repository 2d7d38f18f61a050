//! Effect traces: a loop unrolled into its ordered buffer accesses.
//!
//! A trace lists, per executed op, which regions of which buffers it reads
//! and writes. Ring instances of a pipelined loop are reported both by their
//! logical buffer and by the physical instance, so the trace of a pipelined
//! loop can be compared with the trace of the original body.

use tilec_ir::{Buffer, Handle, Kernel, LoopNest, Operand, Pipelined, TileOp};

/// One region touched by an op execution.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Access {
    /// Logical buffer (the ring's instance 0 for pipelined instances).
    pub buffer: Handle<Buffer>,
    /// Buffer actually addressed.
    pub physical: Handle<Buffer>,
    /// First index of the region.
    pub origin: Vec<u32>,
    /// Extent of the region.
    pub tile: Vec<u32>,
}

/// One executed op.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Effect {
    /// The loop-body op this execution stems from.
    pub op: Handle<TileOp>,
    pub iteration: u32,
    pub reads: Vec<Access>,
    pub writes: Vec<Access>,
}

/// A region named by logical buffer and origin only.
pub type Region = (Handle<Buffer>, Vec<u32>);

/// An [`Effect`] with physical instances erased.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogicalEffect {
    pub op: Handle<TileOp>,
    pub iteration: u32,
    pub reads: Vec<Region>,
    pub writes: Vec<Region>,
}

impl Effect {
    pub fn logical(&self) -> LogicalEffect {
        let erase = |accesses: &[Access]| -> Vec<Region> {
            accesses
                .iter()
                .map(|a| (a.buffer, a.origin.clone()))
                .collect()
        };
        LogicalEffect {
            op: self.op,
            iteration: self.iteration,
            reads: erase(&self.reads),
            writes: erase(&self.writes),
        }
    }
}

/// Unrolls a loop into its effects, in execution order.
///
/// Barriers are skipped; they order effects but touch no buffer.
pub fn trace_loop(kernel: &Kernel, nest: Handle<LoopNest>) -> Vec<Effect> {
    let lp = kernel.loop_nest(nest);
    let mut effects = Vec::new();
    match lp.expansion() {
        None => {
            for i in 0..lp.extent {
                trace_body(kernel, lp.body(), i, None, &mut effects);
            }
        }
        Some(p) => {
            trace_body(kernel, &p.prologue, 0, Some(p), &mut effects);
            for i in 0..p.steady_trips {
                trace_body(kernel, &p.steady, i, Some(p), &mut effects);
            }
            trace_body(kernel, &p.epilogue, 0, Some(p), &mut effects);
        }
    }
    effects
}

/// Appends the effects of one pass over `ops` with loop counter `i`.
pub fn trace_body(
    kernel: &Kernel,
    ops: &[Handle<TileOp>],
    i: u32,
    pipelined: Option<&Pipelined>,
    effects: &mut Vec<Effect>,
) {
    for &h in ops {
        let op = kernel.op(h);
        let (origin, iteration) = match op.sched() {
            Some(info) => (info.origin, info.iteration.resolve(i)),
            None => (h, i),
        };
        let access = |operand: &Operand| resolve(kernel, operand, iteration, pipelined);
        let reads: Vec<_> = op.reads().map(access).collect();
        let writes: Vec<_> = op.writes().map(access).collect();
        if reads.is_empty() && writes.is_empty() {
            continue;
        }
        effects.push(Effect {
            op: origin,
            iteration,
            reads,
            writes,
        });
    }
}

fn resolve(
    kernel: &Kernel,
    operand: &Operand,
    iteration: u32,
    pipelined: Option<&Pipelined>,
) -> Access {
    let buffer = kernel.buffer(operand.buffer);
    let logical = buffer
        .instance_of
        .map(|(logical, _)| logical)
        .unwrap_or(operand.buffer);
    let physical = match pipelined.and_then(|p| p.ring_of(logical)) {
        Some(ring) if operand.rotating => ring.instance(iteration),
        _ => operand.buffer,
    };
    Access {
        buffer: logical,
        physical,
        origin: operand.origin(buffer.rank(), iteration),
        tile: operand.tile_shape(buffer),
    }
}
