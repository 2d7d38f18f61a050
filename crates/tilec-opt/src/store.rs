//! Store-granularity correction.
//!
//! Every copy and atomic update records the per-lane chunk it moves. The
//! chunk is the widest power of two that the target can issue in one
//! vector (or atomic) access and that both sides of the op can deliver
//! contiguously.

use tilec_ir::{IrError, Kernel, Layout, OpKind, Operand, TargetSpec, TileOp};

use crate::Pass;

/// Picks legal per-lane vector widths for copies and atomics.
#[derive(Debug)]
pub struct StoreGranularity {
    target: TargetSpec,
}

impl StoreGranularity {
    pub fn new(target: TargetSpec) -> Self {
        Self { target }
    }

    /// Widest legal chunk for `op`, or `None` for kinds without one.
    pub fn legal_vector(&self, kernel: &Kernel, op: &TileOp) -> Option<u32> {
        let budget = match op.kind {
            OpKind::Copy { .. } => self.target.vector_bytes,
            OpKind::Atomic { .. } => self.target.atomic_bytes,
            _ => return None,
        };
        let elem = op
            .inputs
            .iter()
            .chain(&op.outputs)
            .map(|o| kernel.buffer(o.buffer).dtype.bytes())
            .max()
            .unwrap_or(1);
        let mut cap = (budget / elem.max(1)).max(1);

        let mut axis = None;
        let mut extents = Vec::new();
        for operand in op.inputs.iter().chain(&op.outputs) {
            let side = side_limit(kernel, operand);
            match (axis, side.axis) {
                (Some(a), Some(b)) if a != b => return Some(1),
                (None, Some(b)) => axis = Some(b),
                _ => {}
            }
            cap = cap.min(side.cap);
            extents.extend(side.extent);
        }

        let mut v = 1;
        while v * 2 <= cap && extents.iter().all(|e| e % (v * 2) == 0) {
            v *= 2;
        }
        Some(v)
    }
}

/// What one operand allows: a contiguous axis, a maximum chunk and an
/// extent the chunk has to divide.
struct Side {
    axis: Option<usize>,
    cap: u32,
    extent: Option<u32>,
}

fn side_limit(kernel: &Kernel, operand: &Operand) -> Side {
    let buffer = kernel.buffer(operand.buffer);
    match buffer.layout() {
        Some(Layout::Dense(dense)) => {
            let axis = dense.innermost();
            let extent = operand.tile_shape(buffer).get(axis).copied().unwrap_or(1);
            let cap = buffer
                .swizzle()
                .map_or(u32::MAX, |s| u32::try_from(s.chunk_elems()).unwrap_or(u32::MAX));
            Side {
                axis: Some(axis),
                cap,
                extent: Some(extent),
            }
        }
        Some(Layout::Fragment(frag)) => Side {
            axis: Some(frag.contiguous_axis()),
            cap: frag.lane_run(),
            extent: None,
        },
        None => Side {
            axis: None,
            cap: 1,
            extent: None,
        },
    }
}

fn with_vector(kind: &OpKind, v: u32) -> OpKind {
    match *kind {
        OpKind::Copy { materialize, .. } => OpKind::Copy {
            vector: Some(v),
            materialize,
        },
        OpKind::Atomic { op, .. } => OpKind::Atomic {
            op,
            vector: Some(v),
        },
        ref other => other.clone(),
    }
}

impl Pass for StoreGranularity {
    fn name(&self) -> &str {
        "store-granularity"
    }

    fn run(&self, kernel: &mut Kernel) -> Result<bool, IrError> {
        let mut changed = false;
        for h in kernel.live_ops() {
            let op = kernel.op(h);
            let Some(legal) = self.legal_vector(kernel, op) else {
                continue;
            };
            // Any narrower power of two is legal as well.
            if op.kind.vector().is_some_and(|v| v.is_power_of_two() && legal % v == 0) {
                continue;
            }
            let mut new = op.detached();
            new.kind = with_vector(&op.kind, legal);
            log::trace!("`{}` moves {legal} element(s) per lane", op.name);
            kernel.replace_op(h, new)?;
            changed = true;
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use tilec_ir::{
        AtomicOp, Buffer, DenseLayout, Fragment, Handle, MmaOperand, Scalar, Scope, Swizzle,
    };

    use super::*;

    fn buffer(k: &mut Kernel, name: &str, shape: &[u32], dtype: Scalar, scope: Scope) -> Handle<Buffer> {
        k.add_buffer(Buffer::new(name, shape.to_vec(), dtype, scope)).unwrap()
    }

    fn pushed(k: &mut Kernel, op: TileOp) -> Handle<TileOp> {
        let h = k.add_op(op).unwrap();
        k.push(h).unwrap();
        h
    }

    fn vectors(k: &Kernel) -> Vec<Option<u32>> {
        k.live_ops().into_iter().map(|h| k.op(h).kind.vector()).collect()
    }

    #[test]
    fn copy_takes_the_widest_vector() {
        let mut k = Kernel::new("c");
        let g = buffer(&mut k, "g", &[64, 128], Scalar::F16, Scope::Global);
        let s = buffer(&mut k, "s", &[64, 32], Scalar::F16, Scope::Shared);
        k.attach_layout(g, Layout::row_major(&[64, 128])).unwrap();
        k.attach_layout(s, Layout::row_major(&[64, 32])).unwrap();
        pushed(&mut k, TileOp::copy("load", Operand::stepped(g, 1, 32), Operand::whole(s)));

        let pass = StoreGranularity::new(TargetSpec::sm80());
        assert!(pass.run(&mut k).unwrap());
        assert_eq!(vectors(&k), [Some(8)]);
        assert!(!pass.run(&mut k).unwrap());
    }

    #[test]
    fn swizzle_chunk_bounds_the_vector() {
        let mut k = Kernel::new("c");
        let g = buffer(&mut k, "g", &[64, 32], Scalar::F16, Scope::Global);
        let s = buffer(&mut k, "s", &[64, 32], Scalar::F16, Scope::Shared);
        k.attach_layout(g, Layout::row_major(&[64, 32])).unwrap();
        k.attach_layout(s, Layout::row_major(&[64, 32])).unwrap();
        k.attach_swizzle(s, Swizzle::xor(2, 2, 3).unwrap()).unwrap();
        pushed(&mut k, TileOp::copy("load", Operand::whole(g), Operand::whole(s)));

        StoreGranularity::new(TargetSpec::sm80()).run(&mut k).unwrap();
        assert_eq!(vectors(&k), [Some(4)]);
    }

    #[test]
    fn transposing_copy_is_scalar() {
        let mut k = Kernel::new("t");
        let g = buffer(&mut k, "g", &[32, 32], Scalar::F32, Scope::Global);
        let s = buffer(&mut k, "s", &[32, 32], Scalar::F32, Scope::Shared);
        k.attach_layout(g, Layout::row_major(&[32, 32])).unwrap();
        k.attach_layout(s, Layout::Dense(DenseLayout::col_major(&[32, 32])))
            .unwrap();
        pushed(&mut k, TileOp::copy("load", Operand::whole(g), Operand::whole(s)));

        StoreGranularity::new(TargetSpec::sm80()).run(&mut k).unwrap();
        assert_eq!(vectors(&k), [Some(1)]);
    }

    #[test]
    fn fragment_store_moves_lane_pairs() {
        let t = TargetSpec::sm80();
        let mut k = Kernel::new("f");
        let acc = buffer(&mut k, "acc", &[16, 8], Scalar::F32, Scope::Fragment);
        let out = buffer(&mut k, "out", &[16, 8], Scalar::F32, Scope::Global);
        k.attach_layout(
            acc,
            Layout::Fragment(Fragment::mma(MmaOperand::Accumulator, [16, 8], &t).unwrap()),
        )
        .unwrap();
        k.attach_layout(out, Layout::row_major(&[16, 8])).unwrap();
        pushed(&mut k, TileOp::copy("store", Operand::whole(acc), Operand::whole(out)));

        StoreGranularity::new(t).run(&mut k).unwrap();
        assert_eq!(vectors(&k), [Some(2)]);
    }

    #[test]
    fn atomics_respect_the_atomic_width() {
        let mut k = Kernel::new("a");
        let acc = buffer(&mut k, "acc", &[16, 16], Scalar::F32, Scope::Local);
        let out = buffer(&mut k, "out", &[16, 16], Scalar::F32, Scope::Global);
        k.attach_layout(acc, Layout::row_major(&[16, 16])).unwrap();
        k.attach_layout(out, Layout::row_major(&[16, 16])).unwrap();
        pushed(
            &mut k,
            TileOp::atomic("reduce", AtomicOp::Add, Operand::whole(acc), Operand::whole(out)),
        );

        StoreGranularity::new(TargetSpec::sm80()).run(&mut k).unwrap();
        assert_eq!(vectors(&k), [Some(1)]);
        let mut k2 = k.clone();
        // A narrower width already recorded stays.
        assert!(!StoreGranularity::new(TargetSpec::cpu()).run(&mut k2).unwrap());
    }

    #[test]
    fn keeps_dependents_wired() {
        let mut k = Kernel::new("d");
        let g = buffer(&mut k, "g", &[8, 8], Scalar::F32, Scope::Global);
        let s = buffer(&mut k, "s", &[8, 8], Scalar::F32, Scope::Shared);
        let out = buffer(&mut k, "out", &[8, 8], Scalar::F32, Scope::Global);
        for b in [g, s, out] {
            k.attach_layout(b, Layout::row_major(&[8, 8])).unwrap();
        }
        let load = pushed(&mut k, TileOp::copy("load", Operand::whole(g), Operand::whole(s)));
        let store = pushed(&mut k, TileOp::copy("store", Operand::whole(s), Operand::whole(out)));
        k.add_dependency(store, load).unwrap();

        StoreGranularity::new(TargetSpec::sm80()).run(&mut k).unwrap();
        let ops = k.live_ops();
        assert_eq!(vectors(&k), [Some(4), Some(4)]);
        assert!(k.op(ops[1]).deps().any(|d| d == ops[0]));
        k.validate().unwrap();
    }
}
