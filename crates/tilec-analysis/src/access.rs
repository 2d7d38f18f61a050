//! Per-lane address patterns of ops touching a dense buffer.
//!
//! The pattern depends on what is on the other side of the access:
//! - a matrix-unit operand load gathers 8 lines of one 8x8 atom at a time;
//! - a register fragment is read or written one register group at a time,
//!   every lane addressing the element its fragment slot holds;
//! - anything else is a cooperative sweep where consecutive lanes take
//!   consecutive vectors along the partner's contiguous axis.

use tilec_ir::{
    Buffer, DenseLayout, Fragment, Handle, Kernel, Layout, OpKind, Operand, TargetSpec, TileOp,
};

use crate::dataflow::DefUse;

/// One lane's access: `elems` consecutive elements starting at `offset`
/// (element offset in the buffer's dense layout, before swizzling).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LaneAccess {
    pub lane: u32,
    pub offset: u64,
    pub elems: u32,
}

/// The accesses one op issues against one buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessPattern {
    pub op: Handle<TileOp>,
    /// Elements each lane moves per access.
    pub vector: u32,
    /// Accesses issued together, one list per instruction.
    pub phases: Vec<Vec<LaneAccess>>,
}

/// Patterns of every live op touching `buffer`.
pub fn access_patterns(
    kernel: &Kernel,
    target: &TargetSpec,
    def_use: &DefUse,
    buffer: Handle<Buffer>,
) -> Vec<AccessPattern> {
    let patterns: Vec<_> = def_use
        .accessors(buffer)
        .into_iter()
        .filter_map(|op| access_pattern(kernel, target, op, buffer))
        .collect();
    log::trace!(
        "{} access pattern(s) for `{}`",
        patterns.len(),
        kernel.buffer(buffer).name
    );
    patterns
}

/// The pattern of `op` against `buffer`, or `None` when the op does not
/// touch it or the buffer has no dense layout yet.
pub fn access_pattern(
    kernel: &Kernel,
    target: &TargetSpec,
    op: Handle<TileOp>,
    buffer: Handle<Buffer>,
) -> Option<AccessPattern> {
    let buf = kernel.buffer(buffer);
    let dense = buf.layout()?.as_dense()?;
    let top = kernel.op(op);
    let operand = operand_of(top, buffer)?;
    let site = Site {
        op,
        dense,
        origin: operand.origin(buf.rank(), 0),
        tile: operand.tile_shape(buf),
        elem: buf.dtype.bytes(),
    };
    let partner = top
        .inputs
        .iter()
        .chain(&top.outputs)
        .find(|o| o.buffer != buffer)
        .and_then(|o| kernel.buffer(o.buffer).layout());

    if matches!(top.kind, OpKind::Gemm { .. }) {
        if let Some(p) = row_gather(&site, target) {
            return Some(p);
        }
    }
    match partner {
        Some(Layout::Fragment(f)) => fragment_sweep(&site, f),
        other => cooperative(&site, top, other.and_then(Layout::as_dense), target),
    }
}

fn operand_of(op: &TileOp, buffer: Handle<Buffer>) -> Option<&Operand> {
    op.inputs
        .iter()
        .chain(&op.outputs)
        .find(|o| o.buffer == buffer)
}

struct Site<'a> {
    op: Handle<TileOp>,
    dense: &'a DenseLayout,
    origin: Vec<u32>,
    tile: Vec<u32>,
    elem: u32,
}

impl Site<'_> {
    fn offset(&self, local: &[u32]) -> Option<u64> {
        let index: Vec<u32> = local.iter().zip(&self.origin).map(|(l, o)| l + o).collect();
        self.dense.offset(&index)
    }
}

/// Matrix-unit operand loads: each instruction phase reads the 8 lines of
/// one 8x8 atom, a line being contiguous along the layout's innermost axis.
fn row_gather(site: &Site<'_>, target: &TargetSpec) -> Option<AccessPattern> {
    if site.tile.len() != 2 {
        return None;
    }
    let inner = site.dense.innermost();
    let outer = 1 - inner;
    let line = (target.vector_bytes / site.elem).clamp(1, 8);
    if site.tile[inner] % line != 0 || site.tile[outer] % 8 != 0 {
        return None;
    }
    let mut phases = Vec::new();
    for ob in (0..site.tile[outer]).step_by(8) {
        for ib in (0..site.tile[inner]).step_by(line as usize) {
            let mut phase = Vec::with_capacity(8);
            for j in 0..8 {
                let mut local = [0u32; 2];
                local[outer] = ob + j;
                local[inner] = ib;
                phase.push(LaneAccess {
                    lane: j,
                    offset: site.offset(&local)?,
                    elems: line,
                });
            }
            phases.push(phase);
        }
    }
    Some(AccessPattern {
        op: site.op,
        vector: line,
        phases,
    })
}

/// Register-fragment transfers: one phase per register group.
fn fragment_sweep(site: &Site<'_>, frag: &Fragment) -> Option<AccessPattern> {
    let contiguous = site.dense.innermost() == frag.contiguous_axis();
    let vector = if contiguous { frag.lane_run() } else { 1 };
    let mut phases = Vec::new();
    for reg in (0..frag.regs_per_lane()).step_by(vector as usize) {
        let mut phase = Vec::with_capacity(frag.lanes as usize);
        for lane in 0..frag.lanes {
            let rc = frag.unmap(lane, reg)?;
            phase.push(LaneAccess {
                lane,
                offset: site.offset(&rc)?,
                elems: vector,
            });
        }
        phases.push(phase);
    }
    Some(AccessPattern {
        op: site.op,
        vector,
        phases,
    })
}

/// Cooperative sweeps: lanes take consecutive `vector`-element chunks along
/// the partner's contiguous axis (or the buffer's own, without a dense
/// partner).
fn cooperative(
    site: &Site<'_>,
    op: &TileOp,
    partner: Option<&DenseLayout>,
    target: &TargetSpec,
) -> Option<AccessPattern> {
    let rank = site.tile.len();
    let axis = match partner {
        Some(p) if p.shape().len() == rank => p.innermost(),
        _ => site.dense.innermost(),
    };
    let extent = site.tile[axis];
    let vector = if site.dense.innermost() != axis {
        1
    } else {
        op.kind
            .vector()
            .unwrap_or_else(|| natural_vector(extent, site.elem, target.vector_bytes))
    };
    if vector == 0 || extent % vector != 0 {
        return None;
    }

    let mut counts = site.tile.clone();
    counts[axis] /= vector;
    let mut order: Vec<usize> = (0..rank).filter(|&d| d != axis).collect();
    order.push(axis);
    let sweep = DenseLayout::with_order(&counts, order).ok()?;

    let lanes = u64::from(target.lanes.max(1));
    let mut phases: Vec<Vec<LaneAccess>> = Vec::new();
    for n in 0..sweep.extent() {
        let mut local = sweep.index_of(n)?;
        local[axis] *= vector;
        let access = LaneAccess {
            lane: (n % lanes) as u32,
            offset: site.offset(&local)?,
            elems: vector,
        };
        if n % lanes == 0 {
            phases.push(Vec::with_capacity(lanes as usize));
        }
        if let Some(phase) = phases.last_mut() {
            phase.push(access);
        }
    }
    Some(AccessPattern {
        op: site.op,
        vector,
        phases,
    })
}

/// Widest power-of-two element count within `vector_bytes` that divides `extent`.
pub fn natural_vector(extent: u32, elem_bytes: u32, vector_bytes: u32) -> u32 {
    let max = (vector_bytes / elem_bytes.max(1)).max(1);
    let mut v = 1;
    while v * 2 <= max && extent % (v * 2) == 0 {
        v *= 2;
    }
    v
}
