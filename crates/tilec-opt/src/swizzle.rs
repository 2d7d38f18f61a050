//! Swizzle selection for shared-memory buffers.
//!
//! Every shared buffer with a conflicting accessor gets the first member of
//! the configured family that makes all of its accessors conflict-free at
//! once. Candidates are enumerated in a fixed order (kind, then field width,
//! then base, then shift) so the choice is deterministic.

use std::collections::BTreeSet;

use tilec_analysis::{AccessPattern, BankModel, DefUse, access_patterns};
use tilec_ir::{Buffer, Handle, IrError, Kernel, Scope, Swizzle, SwizzleKind};

use crate::CompileOptions;
use crate::error::{CompileError, SwizzleInfeasibleError};

/// The permutations the optimizer may choose from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SwizzleFamily {
    /// Permutation kinds, tried in order.
    pub kinds: Vec<SwizzleKind>,
    /// Widest permuted field. Defaults to the bits needed to address every
    /// vector chunk of one bank row.
    pub max_bits: Option<u32>,
}

impl Default for SwizzleFamily {
    fn default() -> Self {
        Self {
            kinds: vec![SwizzleKind::Xor, SwizzleKind::Rotate],
            max_bits: None,
        }
    }
}

impl SwizzleFamily {
    /// Candidates for a buffer of `extent` elements, in search order.
    ///
    /// `min_base` keeps the widest accessor vector contiguous; `row_elems`
    /// is the number of elements in one bank row.
    pub fn candidates(&self, extent: u64, min_base: u32, row_elems: u32) -> Vec<Swizzle> {
        if extent == 0 {
            return Vec::new();
        }
        let extent_bits = 63 - extent.leading_zeros();
        let row_bits = 31 - row_elems.max(1).leading_zeros();
        let max_bits = self
            .max_bits
            .unwrap_or_else(|| row_bits.saturating_sub(min_base));

        let mut out = Vec::new();
        for &kind in &self.kinds {
            for bits in 1..=max_bits {
                for base in min_base..extent_bits {
                    for shift in bits.. {
                        if base + shift + bits > extent_bits {
                            break;
                        }
                        if let Ok(s) = Swizzle::new(kind, bits, base, shift) {
                            if s.is_bijective_on(extent) {
                                out.push(s);
                            }
                        }
                    }
                }
            }
        }
        out
    }
}

/// Attaches a conflict-free swizzle to every shared buffer that needs one.
///
/// Buffers marked `no_swizzle`, ring instances and buffers that already
/// carry a swizzle are left alone. Returns the swizzles attached.
pub fn optimize_swizzles(
    kernel: &mut Kernel,
    options: &CompileOptions,
) -> Result<Vec<(Handle<Buffer>, Swizzle)>, CompileError> {
    swizzle_where(kernel, options, |_| true)
}

/// Like [`optimize_swizzles`], but only for buffers not in `known`.
///
/// Passes that run after the swizzle stage may add shared buffers; this
/// gives those the same treatment without revisiting buffers whose accessors
/// have since been rewritten.
pub fn optimize_new_swizzles(
    kernel: &mut Kernel,
    options: &CompileOptions,
    known: &BTreeSet<Handle<Buffer>>,
) -> Result<Vec<(Handle<Buffer>, Swizzle)>, CompileError> {
    swizzle_where(kernel, options, |h| !known.contains(&h))
}

fn swizzle_where(
    kernel: &mut Kernel,
    options: &CompileOptions,
    include: impl Fn(Handle<Buffer>) -> bool,
) -> Result<Vec<(Handle<Buffer>, Swizzle)>, CompileError> {
    let target = &options.target;
    let model = BankModel::for_target(target);
    let def_use = DefUse::build(kernel);

    let shared: Vec<_> = kernel
        .buffers()
        .filter(|&(h, b)| {
            b.scope == Scope::Shared
                && !b.no_swizzle
                && b.swizzle().is_none()
                && b.instance_of.is_none()
                && include(h)
        })
        .map(|(h, _)| h)
        .collect();

    let mut chosen = Vec::new();
    for h in shared {
        let buffer = kernel.buffer(h);
        if buffer.layout().is_none() {
            return Err(IrError::Unresolved {
                buffer: buffer.name.clone(),
            }
            .into());
        }
        let patterns = access_patterns(kernel, target, &def_use, h);
        if patterns.is_empty() {
            continue;
        }
        let elem = buffer.dtype.bytes();
        let worst = worst_degree(&model, &patterns, elem, None);
        if worst <= 1 {
            log::debug!("`{}` is conflict-free", buffer.name);
            continue;
        }

        let min_base = patterns
            .iter()
            .map(|p| p.vector.max(1).next_power_of_two().trailing_zeros())
            .max()
            .unwrap_or(0);
        let row_elems = (target.bank_row_bytes() / elem.max(1)).max(1);
        let found = options
            .swizzle_family
            .candidates(buffer.elements(), min_base, row_elems)
            .into_iter()
            .find(|s| worst_degree(&model, &patterns, elem, Some(s)) == 1);

        let Some(swizzle) = found else {
            let mut accessors: Vec<String> = Vec::new();
            for p in &patterns {
                let name = &kernel.op(p.op).name;
                if !accessors.contains(name) {
                    accessors.push(name.clone());
                }
            }
            return Err(SwizzleInfeasibleError {
                buffer: buffer.name.clone(),
                accessors,
                worst_degree: worst,
            }
            .into());
        };
        log::debug!(
            "`{}`: {swizzle} removes {worst}-way bank conflicts",
            buffer.name
        );
        kernel.attach_swizzle(h, swizzle)?;
        chosen.push((h, swizzle));
    }
    log::info!("swizzled {} shared buffer(s)", chosen.len());
    Ok(chosen)
}

fn worst_degree(
    model: &BankModel,
    patterns: &[AccessPattern],
    elem: u32,
    swizzle: Option<&Swizzle>,
) -> u32 {
    patterns
        .iter()
        .map(|p| model.conflict_degree(p, elem, swizzle))
        .max()
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use tilec_ir::{Fragment, Layout, MmaOperand, Operand, Scalar, TargetSpec, TileOp};

    use super::*;

    fn add(k: &mut Kernel, b: Buffer) -> Handle<Buffer> {
        let shape = b.shape.clone();
        let dense = b.scope.is_dense();
        let h = k.add_buffer(b).unwrap();
        if dense {
            k.attach_layout(h, Layout::row_major(&shape)).unwrap();
        }
        h
    }

    /// `acc += s_a * s_b` with both operands staged from global memory.
    fn staged_gemm(no_swizzle_b: bool) -> Kernel {
        let t = TargetSpec::sm80();
        let mut k = Kernel::new("gemm");
        let a = add(&mut k, Buffer::new("a", vec![64, 32], Scalar::F16, Scope::Global));
        let b = add(&mut k, Buffer::new("b", vec![32, 64], Scalar::F16, Scope::Global));
        let s_a = add(&mut k, Buffer::new("s_a", vec![64, 32], Scalar::F16, Scope::Shared));
        let mut sb = Buffer::new("s_b", vec![32, 64], Scalar::F16, Scope::Shared);
        if no_swizzle_b {
            sb = sb.without_swizzle();
        }
        let s_b = add(&mut k, sb);
        let acc = add(&mut k, Buffer::new("acc", vec![64, 64], Scalar::F32, Scope::Fragment));
        k.attach_layout(
            acc,
            Layout::Fragment(Fragment::mma(MmaOperand::Accumulator, [64, 64], &t).unwrap()),
        )
        .unwrap();

        let load_a = k
            .add_op(TileOp::copy("load_a", Operand::whole(a), Operand::whole(s_a)))
            .unwrap();
        let load_b = k
            .add_op(TileOp::copy("load_b", Operand::whole(b), Operand::whole(s_b)))
            .unwrap();
        let mma = k
            .add_op(TileOp::gemm(
                "mma",
                Operand::whole(s_a),
                Operand::whole(s_b),
                Operand::whole(acc),
            ))
            .unwrap();
        for h in [load_a, load_b, mma] {
            k.push(h).unwrap();
        }
        k.add_dependency(mma, load_a).unwrap();
        k.add_dependency(mma, load_b).unwrap();
        k
    }

    #[test]
    fn candidate_order() {
        let c = SwizzleFamily::default().candidates(2048, 3, 64);
        assert_eq!(c[0], Swizzle::xor(1, 3, 1).unwrap());
        assert_eq!(c[1], Swizzle::xor(1, 3, 2).unwrap());
        assert!(c.iter().all(|s| s.bits <= 3 && s.base >= 3));
        let first_rotate = c.iter().position(|s| s.kind == SwizzleKind::Rotate).unwrap();
        assert!(c[..first_rotate].iter().all(|s| s.kind == SwizzleKind::Xor));
    }

    #[test]
    fn picks_smallest_conflict_free_swizzle() {
        let mut k = staged_gemm(false);
        let chosen = optimize_swizzles(&mut k, &CompileOptions::default()).unwrap();
        let s_a = k.find_buffer("s_a").unwrap();
        let s_b = k.find_buffer("s_b").unwrap();
        assert_eq!(
            chosen,
            vec![
                (s_a, Swizzle::xor(2, 3, 3).unwrap()),
                (s_b, Swizzle::xor(3, 3, 3).unwrap()),
            ]
        );
        assert_eq!(k.buffer(s_a).swizzle(), Some(&Swizzle::xor(2, 3, 3).unwrap()));
    }

    #[test]
    fn chosen_swizzle_round_trips() {
        let mut k = staged_gemm(false);
        optimize_swizzles(&mut k, &CompileOptions::default()).unwrap();
        let s_b = k.find_buffer("s_b").unwrap();
        let sw = *k.buffer(s_b).swizzle().unwrap();
        for offset in 0..k.buffer(s_b).elements() {
            let physical = sw.apply(offset);
            assert!(physical < 2048);
            assert_eq!(sw.inverse().apply(physical), offset);
        }
    }

    #[test]
    fn opted_out_buffer_is_skipped() {
        let mut k = staged_gemm(true);
        let chosen = optimize_swizzles(&mut k, &CompileOptions::default()).unwrap();
        assert_eq!(chosen.len(), 1);
        assert!(k.buffer(k.find_buffer("s_b").unwrap()).swizzle().is_none());
    }

    #[test]
    fn narrow_family_is_infeasible() {
        let mut k = staged_gemm(true);
        let mut options = CompileOptions::default();
        options.swizzle_family.max_bits = Some(1);
        let err = optimize_swizzles(&mut k, &options).unwrap_err();
        match err {
            CompileError::SwizzleInfeasible(e) => {
                assert_eq!(e.buffer, "s_a");
                assert_eq!(e.worst_degree, 4);
                assert_eq!(e.accessors, ["load_a", "mma"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unbanked_target_needs_no_swizzle() {
        let mut k = staged_gemm(false);
        let options = CompileOptions::for_target(TargetSpec::cpu());
        assert!(optimize_swizzles(&mut k, &options).unwrap().is_empty());
    }
}
