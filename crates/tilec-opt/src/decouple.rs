//! Type decoupling.
//!
//! Ops that combine operands of different element types get an explicit
//! cast into a temporary of the common type, so that later stages and
//! backends only ever see uniformly typed arithmetic.

use tilec_ir::{
    Buffer, DenseLayout, Handle, IrError, Kernel, Layout, OpKind, Operand, Scalar, Scope, TileOp,
};

use crate::Pass;

/// Makes every implicit element type conversion an explicit cast op.
#[derive(Debug)]
pub struct TypeDecoupling;

impl Pass for TypeDecoupling {
    fn name(&self) -> &str {
        "type-decoupling"
    }

    fn run(&self, kernel: &mut Kernel) -> Result<bool, IrError> {
        let mut changed = false;
        for h in kernel.live_ops() {
            let wanted = conversions(kernel, kernel.op(h));
            if wanted.is_empty() {
                continue;
            }
            decouple(kernel, h, &wanted)?;
            changed = true;
        }
        Ok(changed)
    }
}

/// Inputs of `op` that need a cast, with the type to cast to.
fn conversions(kernel: &Kernel, op: &TileOp) -> Vec<(usize, Scalar)> {
    let dtype = |o: &Operand| kernel.buffer(o.buffer).dtype;
    match op.kind {
        OpKind::Elementwise { .. } | OpKind::Reduce { .. } | OpKind::Atomic { .. } => {
            let to = dtype(&op.outputs[0]);
            op.inputs
                .iter()
                .enumerate()
                .filter(|(_, o)| dtype(o) != to)
                .map(|(i, _)| (i, to))
                .collect()
        }
        // The accumulator may be wider than the operands; only A and B must agree.
        OpKind::Gemm { .. } => {
            let (a, b) = (dtype(&op.inputs[0]), dtype(&op.inputs[1]));
            if a == b {
                return Vec::new();
            }
            let to = a.promote(b);
            [(0, a), (1, b)]
                .into_iter()
                .filter(|&(_, d)| d != to)
                .map(|(i, _)| (i, to))
                .collect()
        }
        _ => Vec::new(),
    }
}

/// A temporary holding `operand` converted to `dtype`.
fn temp_for(kernel: &Kernel, operand: &Operand, dtype: Scalar) -> Option<(Buffer, Layout)> {
    let source = kernel.buffer(operand.buffer);
    let tile = operand.tile_shape(source);
    let layout = match source.layout()? {
        Layout::Dense(dense) => {
            Layout::Dense(DenseLayout::with_order(&tile, dense.order().to_vec()).ok()?)
        }
        Layout::Fragment(frag) if operand.step.is_none() => Layout::Fragment(frag.clone()),
        Layout::Fragment(_) => return None,
    };
    let scope = match source.scope {
        Scope::Global => Scope::Local,
        other => other,
    };
    let name = format!("{}_as_{dtype}", source.name);
    Some((Buffer::new(name, tile, dtype, scope), layout))
}

fn unique_name(kernel: &Kernel, base: &str) -> String {
    let mut name = base.to_string();
    let mut n = 1;
    while kernel.find_buffer(&name).is_some() {
        name = format!("{base}_{n}");
        n += 1;
    }
    name
}

fn decouple(kernel: &mut Kernel, h: Handle<TileOp>, wanted: &[(usize, Scalar)]) -> Result<(), IrError> {
    let op = kernel.op(h).clone();
    let mut temps = Vec::with_capacity(wanted.len());
    for &(i, dtype) in wanted {
        let t = temp_for(kernel, &op.inputs[i], dtype).ok_or_else(|| IrError::ImplicitConversion {
            op: op.name.clone(),
            input: i,
            from: kernel.buffer(op.inputs[i].buffer).dtype.to_string(),
            to: dtype.to_string(),
        })?;
        temps.push((i, t));
    }

    let mut new = op.detached();
    let mut casts = Vec::with_capacity(temps.len());
    for (i, (mut buffer, layout)) in temps {
        buffer.name = unique_name(kernel, &buffer.name);
        log::debug!("`{}`: casting input {i} through `{}`", op.name, buffer.name);
        let temp = kernel.add_buffer(buffer)?;
        kernel.attach_layout(temp, layout)?;
        let cast = TileOp::cast(format!("{}_cast{i}", op.name), op.inputs[i], Operand::whole(temp));
        let c = kernel.insert_before(h, cast)?;
        for dep in op.deps() {
            kernel.add_dependency(c, dep)?;
        }
        new.inputs[i] = Operand::whole(temp);
        casts.push(c);
    }
    let replaced = kernel.replace_op(h, new)?;
    for c in casts {
        kernel.add_dependency(replaced, c)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use tilec_ir::{BinaryOp, Fragment, MmaOperand, ReduceOp, TargetSpec};

    use super::*;

    fn dense(k: &mut Kernel, name: &str, shape: &[u32], dtype: Scalar, scope: Scope) -> Handle<Buffer> {
        let h = k
            .add_buffer(Buffer::new(name, shape.to_vec(), dtype, scope))
            .unwrap();
        k.attach_layout(h, Layout::row_major(shape)).unwrap();
        h
    }

    fn names(k: &Kernel) -> Vec<String> {
        k.live_ops().iter().map(|&h| k.op(h).name.clone()).collect()
    }

    #[test]
    fn mixed_elementwise_gets_a_cast() {
        let mut k = Kernel::new("mix");
        let a = dense(&mut k, "a", &[16, 16], Scalar::F16, Scope::Local);
        let b = dense(&mut k, "b", &[16, 16], Scalar::F32, Scope::Local);
        let out = dense(&mut k, "out", &[16, 16], Scalar::F32, Scope::Local);
        let add = k
            .add_op(TileOp::elementwise(
                "add",
                BinaryOp::Add,
                Operand::whole(a),
                Operand::whole(b),
                Operand::whole(out),
            ))
            .unwrap();
        k.push(add).unwrap();

        assert!(TypeDecoupling.run(&mut k).unwrap());
        assert_eq!(names(&k), ["add_cast0", "add"]);
        let temp = k.find_buffer("a_as_f32").unwrap();
        assert_eq!(k.buffer(temp).scope, Scope::Local);
        assert_eq!(k.buffer(temp).dtype, Scalar::F32);
        let ops = k.live_ops();
        assert_eq!(k.op(ops[1]).inputs[0].buffer, temp);
        assert!(k.op(ops[1]).deps().any(|d| d == ops[0]));
        assert_eq!(k.op(ops[0]).kind, OpKind::Cast);
        k.validate().unwrap();

        assert!(!TypeDecoupling.run(&mut k).unwrap());
    }

    #[test]
    fn unstageable_input_is_an_error() {
        let mut k = Kernel::new("mix");
        // No layout to derive the temporary's layout from.
        let a = k
            .add_buffer(Buffer::new("a", vec![16, 16], Scalar::F16, Scope::Local))
            .unwrap();
        let b = dense(&mut k, "b", &[16, 16], Scalar::F32, Scope::Local);
        let out = dense(&mut k, "out", &[16, 16], Scalar::F32, Scope::Local);
        let add = k
            .add_op(TileOp::elementwise(
                "add",
                BinaryOp::Add,
                Operand::whole(a),
                Operand::whole(b),
                Operand::whole(out),
            ))
            .unwrap();
        k.push(add).unwrap();

        let err = TypeDecoupling.run(&mut k).unwrap_err();
        assert!(matches!(
            err,
            IrError::ImplicitConversion { ref op, input: 0, ref from, ref to }
                if op == "add" && from == "f16" && to == "f32"
        ));
        assert_eq!(names(&k), ["add"]);
    }

    #[test]
    fn global_window_is_staged_locally() {
        let mut k = Kernel::new("reduce");
        let x = dense(&mut k, "x", &[16, 128], Scalar::F16, Scope::Global);
        let out = dense(&mut k, "out", &[16], Scalar::F32, Scope::Global);
        let sum = k
            .add_op(TileOp::reduce(
                "sum",
                ReduceOp::Sum,
                1,
                Operand::stepped(x, 1, 32),
                Operand::whole(out),
            ))
            .unwrap();
        k.push(sum).unwrap();

        assert!(TypeDecoupling.run(&mut k).unwrap());
        let temp = k.buffer(k.find_buffer("x_as_f32").unwrap());
        assert_eq!(temp.scope, Scope::Local);
        assert_eq!(temp.shape, [16, 32]);
        assert_eq!(temp.layout(), Some(&Layout::row_major(&[16, 32])));
        let cast = k.op(k.live_ops()[0]);
        assert_eq!(cast.inputs[0].step, Operand::stepped(x, 1, 32).step);
    }

    #[test]
    fn gemm_operands_meet_at_the_promoted_type() {
        let t = TargetSpec::sm80();
        let mut k = Kernel::new("g");
        let a = dense(&mut k, "a", &[16, 16], Scalar::F16, Scope::Shared);
        let b = dense(&mut k, "b", &[16, 8], Scalar::F32, Scope::Shared);
        let c = k
            .add_buffer(Buffer::new("c", vec![16, 8], Scalar::F32, Scope::Fragment))
            .unwrap();
        k.attach_layout(
            c,
            Layout::Fragment(Fragment::mma(MmaOperand::Accumulator, [16, 8], &t).unwrap()),
        )
        .unwrap();
        let mma = k
            .add_op(TileOp::gemm("mma", Operand::whole(a), Operand::whole(b), Operand::whole(c)))
            .unwrap();
        k.push(mma).unwrap();

        assert!(TypeDecoupling.run(&mut k).unwrap());
        assert_eq!(names(&k), ["mma_cast0", "mma"]);
        let temp = k.find_buffer("a_as_f32").unwrap();
        assert_eq!(k.buffer(temp).scope, Scope::Shared);
    }

    #[test]
    fn temp_names_stay_unique() {
        let mut k = Kernel::new("names");
        dense(&mut k, "a_as_f32", &[4], Scalar::F32, Scope::Local);
        let a = dense(&mut k, "a", &[4], Scalar::F16, Scope::Local);
        let out = dense(&mut k, "out", &[4], Scalar::F32, Scope::Local);
        let mul = k
            .add_op(TileOp::elementwise(
                "mul",
                BinaryOp::Mul,
                Operand::whole(a),
                Operand::whole(a),
                Operand::whole(out),
            ))
            .unwrap();
        k.push(mul).unwrap();

        assert!(TypeDecoupling.run(&mut k).unwrap());
        assert!(k.find_buffer("a_as_f32_1").is_some());
        assert!(k.find_buffer("a_as_f32_2").is_some());
        assert_eq!(names(&k), ["mul_cast0", "mul_cast1", "mul"]);
    }
}
