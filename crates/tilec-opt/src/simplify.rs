//! Simplification: literal normalization, constant folding and removal of
//! ops whose results nobody consumes.

use std::collections::BTreeSet;

use tilec_analysis::DefUse;
use tilec_ir::{Buffer, Handle, IrError, Kernel, Literal, OpKind, Scope, TileOp};

use crate::Pass;

/// Folds ops over constant buffers and removes dead ops.
///
/// An op is live if it writes global memory, is an atomic update or a
/// barrier, or writes a buffer read by a live op.
#[derive(Debug)]
pub struct Simplify;

impl Pass for Simplify {
    fn name(&self) -> &str {
        "simplify"
    }

    fn run(&self, kernel: &mut Kernel) -> Result<bool, IrError> {
        let mut changed = normalize_fills(kernel)?;
        changed |= fold_constants(kernel)?;
        changed |= remove_dead(kernel)?;
        Ok(changed)
    }

    /// Folding a chain of constant ops turns one link into a fill per round.
    fn repeat_until_stable(&self) -> bool {
        true
    }
}

/// Rounds fill literals to the representation of the destination type.
fn normalize_fills(kernel: &mut Kernel) -> Result<bool, IrError> {
    let mut changed = false;
    for h in kernel.live_ops() {
        let op = kernel.op(h);
        let OpKind::Fill { value } = op.kind else {
            continue;
        };
        let normalized = value.cast(kernel.buffer(op.outputs[0].buffer).dtype);
        if normalized == value {
            continue;
        }
        let mut new = op.detached();
        new.kind = OpKind::Fill { value: normalized };
        kernel.replace_op(h, new)?;
        changed = true;
    }
    Ok(changed)
}

/// The value of `buffer` at the point `reader` runs, if a single earlier
/// whole-buffer fill is its only writer.
fn constant(
    kernel: &Kernel,
    def_use: &DefUse,
    buffer: Handle<Buffer>,
    reader: Handle<TileOp>,
) -> Option<Literal> {
    if kernel.buffer(buffer).scope == Scope::Global {
        return None;
    }
    let mut writers = def_use.writers(buffer);
    let writer = writers.next()?;
    if writers.next().is_some() || def_use.position(writer)? >= def_use.position(reader)? {
        return None;
    }
    let op = kernel.op(writer);
    match op.kind {
        OpKind::Fill { value } if op.outputs[0].step.is_none() => Some(value),
        _ => None,
    }
}

fn fold_constants(kernel: &mut Kernel) -> Result<bool, IrError> {
    let def_use = DefUse::build(kernel);
    let mut folds = Vec::new();
    for h in kernel.live_ops() {
        let op = kernel.op(h);
        let Some(out) = op.outputs.first() else {
            continue;
        };
        if op.inputs.iter().any(|i| i.buffer == out.buffer) {
            continue;
        }
        let dtype = kernel.buffer(out.buffer).dtype;
        let inputs: Option<Vec<Literal>> = op
            .inputs
            .iter()
            .map(|i| constant(kernel, &def_use, i.buffer, h))
            .collect();
        let value = match (&op.kind, inputs.as_deref()) {
            (OpKind::Elementwise { op: bin }, Some(&[a, b])) => {
                Literal::Float(bin.eval(a.as_f64(), b.as_f64())).cast(dtype)
            }
            (OpKind::Cast, Some(&[a])) => a.cast(dtype),
            _ => continue,
        };
        log::debug!("folded `{}` to {value}", op.name);
        folds.push((h, TileOp::fill(op.name.clone(), value, *out)));
    }

    let changed = !folds.is_empty();
    for (h, fill) in folds {
        kernel.replace_op(h, fill)?;
    }
    Ok(changed)
}

fn remove_dead(kernel: &mut Kernel) -> Result<bool, IrError> {
    let def_use = DefUse::build(kernel);
    let ops = kernel.live_ops();
    let is_root = |op: &TileOp| {
        op.is_barrier()
            || matches!(op.kind, OpKind::Atomic { .. })
            || op
                .writes()
                .any(|o| kernel.buffer(o.buffer).scope == Scope::Global)
    };

    let mut live: BTreeSet<Handle<TileOp>> = BTreeSet::new();
    let mut worklist: Vec<_> = ops.iter().copied().filter(|&h| is_root(kernel.op(h))).collect();
    while let Some(h) = worklist.pop() {
        if !live.insert(h) {
            continue;
        }
        for operand in kernel.op(h).reads() {
            worklist.extend(def_use.writers(operand.buffer).filter(|w| !live.contains(w)));
        }
    }

    let mut changed = false;
    for h in ops.into_iter().filter(|h| !live.contains(h)) {
        log::debug!("removing dead op `{}`", kernel.op(h).name);
        kernel.remove_op(h)?;
        changed = true;
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use tilec_ir::{BinaryOp, LoopNest, Operand, Scalar};

    use super::*;
    use crate::PassManager;

    fn buffer(k: &mut Kernel, name: &str, dtype: Scalar, scope: Scope) -> Handle<Buffer> {
        k.add_buffer(Buffer::new(name, vec![8, 8], dtype, scope)).unwrap()
    }

    fn pushed(k: &mut Kernel, op: TileOp) -> Handle<TileOp> {
        let h = k.add_op(op).unwrap();
        k.push(h).unwrap();
        h
    }

    fn simplify(k: &mut Kernel) -> bool {
        let mut pm = PassManager::new();
        pm.add_pass(Box::new(Simplify));
        pm.run(k).unwrap()
    }

    fn kinds(k: &Kernel) -> Vec<OpKind> {
        k.live_ops().iter().map(|&h| k.op(h).kind.clone()).collect()
    }

    #[test]
    fn fill_literals_take_the_buffer_type() {
        let mut k = Kernel::new("f");
        let out = buffer(&mut k, "out", Scalar::F32, Scope::Global);
        let idx = buffer(&mut k, "idx", Scalar::I8, Scope::Global);
        pushed(&mut k, TileOp::fill("a", Literal::Float(0.1), Operand::whole(out)));
        pushed(&mut k, TileOp::fill("b", Literal::Float(300.0), Operand::whole(idx)));

        assert!(Simplify.run(&mut k).unwrap());
        assert_eq!(
            kinds(&k),
            [
                OpKind::Fill { value: Literal::Float(f64::from(0.1f32)) },
                OpKind::Fill { value: Literal::Int(44) },
            ]
        );
        assert!(!Simplify.run(&mut k).unwrap());
    }

    #[test]
    fn constant_chain_folds_into_one_fill() {
        let mut k = Kernel::new("c");
        let a = buffer(&mut k, "a", Scalar::F32, Scope::Local);
        let b = buffer(&mut k, "b", Scalar::F32, Scope::Local);
        let c = buffer(&mut k, "c", Scalar::F32, Scope::Local);
        let out = buffer(&mut k, "out", Scalar::F16, Scope::Global);
        let fa = pushed(&mut k, TileOp::fill("fa", Literal::Float(1.5), Operand::whole(a)));
        let fb = pushed(&mut k, TileOp::fill("fb", Literal::Float(2.0), Operand::whole(b)));
        let mul = pushed(
            &mut k,
            TileOp::elementwise(
                "mul",
                BinaryOp::Mul,
                Operand::whole(a),
                Operand::whole(b),
                Operand::whole(c),
            ),
        );
        let cast = pushed(&mut k, TileOp::cast("narrow", Operand::whole(c), Operand::whole(out)));
        k.add_dependency(mul, fa).unwrap();
        k.add_dependency(mul, fb).unwrap();
        k.add_dependency(cast, mul).unwrap();

        assert!(simplify(&mut k));
        assert_eq!(kinds(&k), [OpKind::Fill { value: Literal::Float(3.0) }]);
        assert_eq!(k.op(k.live_ops()[0]).name, "narrow");
        k.validate().unwrap();
    }

    #[test]
    fn unread_results_are_removed() {
        let mut k = Kernel::new("d");
        let g = buffer(&mut k, "g", Scalar::F32, Scope::Global);
        let s = buffer(&mut k, "s", Scalar::F32, Scope::Shared);
        let scratch = buffer(&mut k, "scratch", Scalar::F32, Scope::Local);
        let out = buffer(&mut k, "out", Scalar::F32, Scope::Global);
        pushed(&mut k, TileOp::copy("load", Operand::whole(g), Operand::whole(s)));
        pushed(&mut k, TileOp::copy("spill", Operand::whole(s), Operand::whole(scratch)));
        pushed(&mut k, TileOp::copy("store", Operand::whole(s), Operand::whole(out)));

        assert!(Simplify.run(&mut k).unwrap());
        let names: Vec<_> = k.live_ops().iter().map(|&h| k.op(h).name.clone()).collect();
        assert_eq!(names, ["load", "store"]);
        assert!(!Simplify.run(&mut k).unwrap());
    }

    #[test]
    fn accumulators_are_not_folded() {
        let mut k = Kernel::new("acc");
        let acc = buffer(&mut k, "acc", Scalar::F32, Scope::Local);
        let one = buffer(&mut k, "one", Scalar::F32, Scope::Local);
        let out = buffer(&mut k, "out", Scalar::F32, Scope::Global);
        pushed(&mut k, TileOp::fill("clear", Literal::Float(0.0), Operand::whole(acc)));
        pushed(&mut k, TileOp::fill("ones", Literal::Float(1.0), Operand::whole(one)));
        let lp = k.push_loop(LoopNest::new("l", 4)).unwrap();
        let inc = k
            .add_op(TileOp::elementwise(
                "inc",
                BinaryOp::Add,
                Operand::whole(acc),
                Operand::whole(one),
                Operand::whole(acc),
            ))
            .unwrap();
        k.push_to_loop(lp, inc).unwrap();
        pushed(&mut k, TileOp::copy("store", Operand::whole(acc), Operand::whole(out)));

        assert!(!simplify(&mut k));
        assert_eq!(k.live_ops().len(), 4);
    }
}
