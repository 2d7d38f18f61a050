//! CUDA C++ text emission.
//!
//! The emitted source targets a small header-only support library
//! (`tilec/cuda.cuh`) that provides the `tilec::` intrinsics named by the
//! lowering table.

use std::collections::BTreeSet;

use tilec_backend_core::{
    BackendOptions, LoweredBuffer, LoweredKernel, LoweredOp, LoweredOperand, LoweredStmt,
};
use tilec_ir::{IterRef, Literal, OpKind, Scalar, ScalarKind, Scope, SwizzleKind};

/// Static shared memory a block may declare without opting in to the
/// larger carve-out.
pub const STATIC_SHARED_LIMIT: u64 = 48 * 1024;

/// CUDA spelling of an element type.
pub fn c_type(dtype: Scalar) -> String {
    let bits = u32::from(dtype.width) * 8;
    match dtype.kind {
        ScalarKind::Bool => "bool".into(),
        ScalarKind::Float => match bits {
            16 => "half".into(),
            64 => "double".into(),
            _ => "float".into(),
        },
        ScalarKind::BFloat => "__nv_bfloat16".into(),
        ScalarKind::Sint => format!("int{bits}_t"),
        ScalarKind::Uint => format!("uint{bits}_t"),
    }
}

/// Bytes of shared memory the kernel declares.
pub fn shared_bytes(kernel: &LoweredKernel) -> u64 {
    kernel
        .buffers
        .iter()
        .filter(|b| b.scope == Scope::Shared)
        .map(|b| b.elements * u64::from(b.dtype.bytes()))
        .sum()
}

fn literal(value: Literal) -> String {
    match value {
        Literal::Float(v) if v.is_nan() => "NAN".into(),
        Literal::Float(v) if v.is_infinite() => {
            if v > 0.0 {
                "INFINITY".into()
            } else {
                "-INFINITY".into()
            }
        }
        Literal::Float(v) => format!("{v:?}f"),
        Literal::Int(v) => v.to_string(),
        Literal::Bool(v) => v.to_string(),
    }
}

fn counter(iteration: Option<IterRef>) -> String {
    match iteration {
        Some(IterRef::Absolute(t)) => t.to_string(),
        Some(IterRef::Relative(0)) => "i".into(),
        Some(IterRef::Relative(k)) => format!("(i + {k})"),
        None => "0".into(),
    }
}

fn declaration(buffer: &LoweredBuffer) -> Option<String> {
    let ty = c_type(buffer.dtype);
    match (buffer.scope, buffer.regs_per_lane) {
        (Scope::Global, _) => None,
        (_, Some(regs)) => Some(format!("tilec::Fragment<{ty}, {regs}> {};", buffer.name)),
        (Scope::Shared, None) => Some(format!(
            "__shared__ __align__(16) {ty} {}[{}];",
            buffer.name, buffer.elements
        )),
        (Scope::Local | Scope::Fragment, None) => {
            Some(format!("{ty} {}[{}];", buffer.name, buffer.elements))
        }
    }
}

/// Rotating buffers, declared once as an array of instance pointers.
fn rings(kernel: &LoweredKernel) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut decls = Vec::new();
    for operand in kernel.ops().flat_map(|op| op.inputs.iter().chain(&op.outputs)) {
        if operand.ring.is_empty() || !seen.insert(operand.buffer.as_str()) {
            continue;
        }
        let Some(buffer) = kernel.buffer(&operand.buffer) else {
            continue;
        };
        let ty = match buffer.regs_per_lane {
            Some(regs) => format!("tilec::Fragment<{}, {regs}>", c_type(buffer.dtype)),
            None => c_type(buffer.dtype),
        };
        let amp = if operand.class.is_fragment() { "&" } else { "" };
        let instances: Vec<String> = operand.ring.iter().map(|n| format!("{amp}{n}")).collect();
        decls.push(format!(
            "{ty}* const {}_ring[{}] = {{{}}};",
            operand.buffer,
            operand.ring.len(),
            instances.join(", ")
        ));
    }
    decls
}

fn operand(o: &LoweredOperand, iteration: Option<IterRef>) -> String {
    let mut expr = if o.ring.is_empty() {
        o.buffer.clone()
    } else {
        let deref = if o.class.is_fragment() { "*" } else { "" };
        format!(
            "{deref}{}_ring[{} % {}]",
            o.buffer,
            counter(iteration),
            o.ring.len()
        )
    };
    if let Some(sw) = o.swizzle {
        let kind = match sw.kind {
            SwizzleKind::Xor => "Xor",
            SwizzleKind::Rotate => "Rotate",
            SwizzleKind::RotateInverse => "RotateInverse",
        };
        expr = format!(
            "tilec::swizzled<tilec::{kind}, {}, {}, {}>({expr})",
            sw.bits, sw.base, sw.shift
        );
    }
    if let Some(step) = o.step {
        expr = format!(
            "tilec::window<{}, {}>({expr}, {})",
            step.axis,
            step.extent,
            counter(iteration)
        );
    }
    expr
}

fn template_arg(param: &str) -> String {
    if param.parse::<i64>().is_ok() || param == "true" || param == "false" {
        param.to_string()
    } else {
        format!("tilec::op::{param}")
    }
}

/// One instruction as a statement, without indentation.
pub fn instruction(op: &LoweredOp, opts: &BackendOptions) -> String {
    let params = op.params();
    let mut text = op.mnemonic.to_string();
    if !params.is_empty() {
        let args: Vec<String> = params.iter().map(|p| template_arg(p)).collect();
        text.push_str(&format!("<{}>", args.join(", ")));
    }

    let mut args: Vec<String> = op
        .outputs
        .iter()
        .chain(&op.inputs)
        .map(|o| operand(o, op.iteration))
        .collect();
    if let OpKind::Fill { value } = op.kind {
        args.push(literal(value));
    }
    text.push_str(&format!("({});", args.join(", ")));

    if opts.line_info {
        match op.iteration {
            Some(it) => text.push_str(&format!("  // {} @ {it}", op.name)),
            None => text.push_str(&format!("  // {}", op.name)),
        }
    }
    text
}

fn signature(kernel: &LoweredKernel) -> String {
    let written: BTreeSet<&str> = kernel
        .ops()
        .flat_map(|op| op.outputs.iter().map(|o| o.buffer.as_str()))
        .collect();
    let params: Vec<String> = kernel
        .buffers
        .iter()
        .filter(|b| b.scope == Scope::Global)
        .map(|b| {
            let constness = if written.contains(b.name.as_str()) { "" } else { "const " };
            format!("{constness}{}* __restrict__ {}", c_type(b.dtype), b.name)
        })
        .collect();
    format!(
        "extern \"C\" __global__ void {}({})",
        kernel.name,
        params.join(", ")
    )
}

/// Renders a lowered kernel as a CUDA translation unit.
pub fn emit(kernel: &LoweredKernel, opts: &BackendOptions) -> String {
    let mut out = String::new();
    out.push_str(&format!("// Generated by tilec for {}.\n", kernel.target));
    out.push_str("#include <tilec/cuda.cuh>\n\n");
    out.push_str(&format!("{} {{\n", signature(kernel)));

    let decls: Vec<String> = kernel.buffers.iter().filter_map(declaration).collect();
    for decl in &decls {
        out.push_str(&format!("  {decl}\n"));
    }
    for ring in rings(kernel) {
        out.push_str(&format!("  {ring}\n"));
    }
    if !decls.is_empty() {
        out.push('\n');
    }

    for stmt in &kernel.body {
        match stmt {
            LoweredStmt::Op(op) => out.push_str(&format!("  {}\n", instruction(op, opts))),
            LoweredStmt::Loop { name, trips, body } => {
                out.push_str(&format!(
                    "  for (int i = 0; i < {trips}; ++i) {{  // {name}\n"
                ));
                for op in body {
                    out.push_str(&format!("    {}\n", instruction(op, opts)));
                }
                out.push_str("  }\n");
            }
        }
    }
    out.push_str("}\n");
    out
}

/// Whether any register tile is declared, which requires a full warp.
pub fn uses_fragments(kernel: &LoweredKernel) -> bool {
    kernel.buffers.iter().any(|b| b.class.is_fragment())
}
