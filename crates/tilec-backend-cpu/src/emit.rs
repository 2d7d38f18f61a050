//! Portable C++ emission for host CPUs.

use tilec_backend_core::{LoweredKernel, LoweredOp, LoweredOperand, LoweredStmt};
use tilec_ir::{IterRef, Literal, OpKind, Scalar, ScalarKind, Scope};

pub(crate) fn cpp_type(dtype: Scalar) -> String {
    let bits = u32::from(dtype.width) * 8;
    match dtype.kind {
        ScalarKind::Bool => "bool".into(),
        ScalarKind::Float => match bits {
            16 => "tilec_cpu::half".into(),
            64 => "double".into(),
            _ => "float".into(),
        },
        ScalarKind::BFloat => "tilec_cpu::bfloat16".into(),
        ScalarKind::Sint => format!("std::int{bits}_t"),
        ScalarKind::Uint => format!("std::uint{bits}_t"),
    }
}

fn iteration(it: Option<IterRef>) -> String {
    match it {
        Some(IterRef::Absolute(t)) => t.to_string(),
        Some(IterRef::Relative(0)) => "i".into(),
        Some(IterRef::Relative(k)) => format!("i + {k}"),
        None => "0".into(),
    }
}

/// A `tilec_cpu::View` over the operand's current instance and window.
fn view(o: &LoweredOperand, it: Option<IterRef>) -> String {
    let base = if o.ring.is_empty() {
        o.buffer.clone()
    } else {
        format!("{}_ring[({}) % {}]", o.buffer, iteration(it), o.ring.len())
    };
    let mut expr = format!("tilec_cpu::view({base})");
    if let Some(sw) = o.swizzle {
        expr.push_str(&format!(".swizzle({}, {}, {})", sw.bits, sw.base, sw.shift));
    }
    if let Some(step) = o.step {
        expr.push_str(&format!(".window({}, {}, {})", step.axis, step.extent, iteration(it)));
    }
    expr
}

fn literal(value: Literal) -> String {
    match value {
        Literal::Float(v) if v.is_nan() => "std::numeric_limits<double>::quiet_NaN()".into(),
        Literal::Float(v) if v.is_infinite() => {
            let sign = if v > 0.0 { "" } else { "-" };
            format!("{sign}std::numeric_limits<double>::infinity()")
        }
        Literal::Float(v) => format!("{v:?}"),
        Literal::Int(v) => v.to_string(),
        Literal::Bool(v) => v.to_string(),
    }
}

fn statement(op: &LoweredOp) -> String {
    let mut args: Vec<String> = op
        .outputs
        .iter()
        .chain(&op.inputs)
        .map(|o| view(o, op.iteration))
        .collect();
    if let OpKind::Fill { value } = op.kind {
        args.push(literal(value));
    }
    args.extend(op.params().into_iter().map(|p| match p.parse::<i64>() {
        Ok(_) => p,
        Err(_) => format!("tilec_cpu::Op::{p}"),
    }));
    format!("{}({});  // {}", op.mnemonic, args.join(", "), op.name)
}

/// Renders a lowered kernel as a C++ function.
pub fn emit(kernel: &LoweredKernel) -> String {
    let mut out = String::new();
    out.push_str(&format!("// Generated by tilec for {}.\n", kernel.target));
    out.push_str("#include <tilec/cpu.hpp>\n\n");

    let params: Vec<String> = kernel
        .buffers
        .iter()
        .filter(|b| b.scope == Scope::Global)
        .map(|b| format!("{}* {}", cpp_type(b.dtype), b.name))
        .collect();
    out.push_str(&format!(
        "extern \"C\" void {}({}) {{\n",
        kernel.name,
        params.join(", ")
    ));

    for b in kernel.buffers.iter().filter(|b| b.scope != Scope::Global) {
        out.push_str(&format!(
            "  alignas(64) {} {}[{}];\n",
            cpp_type(b.dtype),
            b.name,
            b.elements
        ));
    }
    let mut declared = Vec::new();
    for o in kernel.ops().flat_map(|op| op.inputs.iter().chain(&op.outputs)) {
        if o.ring.is_empty() || declared.contains(&o.buffer) {
            continue;
        }
        let ty = kernel
            .buffer(&o.buffer)
            .map(|b| cpp_type(b.dtype))
            .unwrap_or_else(|| "void".into());
        out.push_str(&format!(
            "  {ty}* const {}_ring[{}] = {{{}}};\n",
            o.buffer,
            o.ring.len(),
            o.ring.join(", ")
        ));
        declared.push(o.buffer.clone());
    }
    out.push('\n');

    for stmt in &kernel.body {
        match stmt {
            LoweredStmt::Op(op) => out.push_str(&format!("  {}\n", statement(op))),
            LoweredStmt::Loop { name, trips, body } => {
                out.push_str(&format!("  // {name}\n"));
                out.push_str(&format!("  for (std::uint32_t i = 0; i < {trips}; ++i) {{\n"));
                for op in body {
                    out.push_str(&format!("    {}\n", statement(op)));
                }
                out.push_str("  }\n");
            }
        }
    }
    out.push_str("}\n");
    out
}

#[cfg(test)]
mod tests {
    use tilec_backend_core::LayoutClass;
    use tilec_ir::Step;

    use super::*;

    #[test]
    fn host_types() {
        assert_eq!(cpp_type(Scalar::F16), "tilec_cpu::half");
        assert_eq!(cpp_type(Scalar::I32), "std::int32_t");
        assert_eq!(cpp_type(Scalar::F32), "float");
    }

    #[test]
    fn windowed_ring_view() {
        let o = LoweredOperand {
            buffer: "s_x".into(),
            ring: vec!["s_x".into(), "s_x_stage1".into()],
            step: Some(Step { axis: 1, extent: 32 }),
            class: LayoutClass::Shared { swizzled: false },
            swizzle: None,
        };
        assert_eq!(
            view(&o, Some(IterRef::Relative(1))),
            "tilec_cpu::view(s_x_ring[(i + 1) % 2]).window(1, 32, i + 1)"
        );
    }

    #[test]
    fn reduce_parameters_follow_operands() {
        let part = LoweredOperand {
            buffer: "part".into(),
            ring: vec![],
            step: None,
            class: LayoutClass::Local,
            swizzle: None,
        };
        let op = LoweredOp {
            name: "partial".into(),
            kind: OpKind::Reduce {
                op: tilec_ir::ReduceOp::Sum,
                axis: 1,
            },
            mnemonic: "tilec_cpu::reduce",
            inputs: vec![LoweredOperand {
                buffer: "s_x".into(),
                ..part.clone()
            }],
            outputs: vec![part],
            iteration: Some(IterRef::Relative(0)),
        };
        assert_eq!(
            statement(&op),
            "tilec_cpu::reduce(tilec_cpu::view(part), tilec_cpu::view(s_x), tilec_cpu::Op::sum, 1);  // partial"
        );
    }
}
