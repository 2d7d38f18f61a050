use tilec_backend_core::{Backend, BackendError, BackendOptions, BackendOutput};
use tilec_ir::{
    BinaryOp, Buffer, Handle, Kernel, Literal, LoopNest, Operand, Scalar, Scope, TargetSpec,
    TileOp,
};
use tilec_opt::{CompileError, CompileOptions};

/// Lower a kernel with default options for `target`.
#[allow(dead_code)]
pub fn lower_for(mut kernel: Kernel, target: TargetSpec) -> Kernel {
    tilec_opt::lower(&mut kernel, &CompileOptions::for_target(target)).expect("lowering failed");
    kernel
}

/// Like `lower_for` but with explicit options, returning the error.
#[allow(dead_code)]
pub fn try_lower(mut kernel: Kernel, options: &CompileOptions) -> Result<Kernel, CompileError> {
    tilec_opt::lower(&mut kernel, options)?;
    Ok(kernel)
}

/// Options for `target` with one loop's depth overridden.
#[allow(dead_code)]
pub fn with_depth(target: TargetSpec, loop_name: &str, depth: u32) -> CompileOptions {
    let mut options = CompileOptions::for_target(target);
    options.pipeline_depth.insert(loop_name.into(), depth);
    options
}

/// Compile a lowered kernel, panicking on backend errors.
#[allow(dead_code)]
pub fn compile(kernel: &Kernel, backend: &dyn Backend) -> BackendOutput {
    try_compile(kernel, backend).expect("backend compilation failed")
}

/// Like `compile` but returns a Result instead of panicking.
#[allow(dead_code)]
pub fn try_compile(kernel: &Kernel, backend: &dyn Backend) -> Result<BackendOutput, BackendError> {
    backend.compile(kernel, &BackendOptions::default())
}

/// Extract the first text output from a `BackendOutput`.
#[allow(dead_code)]
pub fn first_text(output: &BackendOutput) -> &str {
    &output.files[0].text
}

/// Handle of the loop named `name`.
#[allow(dead_code)]
pub fn loop_named(kernel: &Kernel, name: &str) -> Handle<LoopNest> {
    kernel
        .loops()
        .find(|(_, l)| l.name == name)
        .map(|(h, _)| h)
        .unwrap_or_else(|| panic!("no loop named {name}"))
}

/// Handle of the buffer named `name`.
#[allow(dead_code)]
pub fn buffer_named(kernel: &Kernel, name: &str) -> Handle<Buffer> {
    kernel
        .find_buffer(name)
        .unwrap_or_else(|| panic!("no buffer named {name}"))
}

/// A loop whose compute op reads the staged buffer before the load that
/// fills it, so iteration `i` consumes what iteration `i - 1` loaded.
#[allow(dead_code)]
pub fn read_before_load(extent: u32) -> Kernel {
    let mut k = Kernel::new("read_before_load");
    let x = k
        .add_buffer(Buffer::new("x", vec![16, 16 * extent], Scalar::F32, Scope::Global))
        .unwrap();
    let s = k
        .add_buffer(Buffer::new("s", vec![16, 16], Scalar::F32, Scope::Shared))
        .unwrap();
    let acc = k
        .add_buffer(Buffer::new("acc", vec![16, 16], Scalar::F32, Scope::Local))
        .unwrap();
    let out = k
        .add_buffer(Buffer::new("out", vec![16, 16], Scalar::F32, Scope::Global))
        .unwrap();

    let clear = k
        .add_op(TileOp::fill("clear", Literal::Float(0.0), Operand::whole(acc)))
        .unwrap();
    k.push(clear).unwrap();
    let lp = k
        .push_loop(LoopNest::new("k_loop", extent).with_depth(3))
        .unwrap();
    let add = k
        .add_op(TileOp::elementwise(
            "add",
            BinaryOp::Add,
            Operand::whole(s),
            Operand::whole(acc),
            Operand::whole(acc),
        ))
        .unwrap();
    k.push_to_loop(lp, add).unwrap();
    let load = k
        .add_op(TileOp::copy("load", Operand::stepped(x, 1, 16), Operand::whole(s)))
        .unwrap();
    k.push_to_loop(lp, load).unwrap();
    k.add_dependency(add, clear).unwrap();
    let store = k
        .add_op(TileOp::copy("store", Operand::whole(acc), Operand::whole(out)))
        .unwrap();
    k.push(store).unwrap();
    k.add_dependency(store, add).unwrap();
    k
}

/// `c = s_a * s_b` with an f16 and an f32 operand, both staged in shared
/// memory, so type decoupling has to widen `s_a` into a new shared buffer.
#[allow(dead_code)]
pub fn mixed_shared_gemm() -> Kernel {
    let mut k = Kernel::new("mixed_gemm");
    let s_a = k
        .add_buffer(Buffer::new("s_a", vec![64, 32], Scalar::F16, Scope::Shared))
        .unwrap();
    let s_b = k
        .add_buffer(Buffer::new("s_b", vec![32, 64], Scalar::F32, Scope::Shared))
        .unwrap();
    let acc = k
        .add_buffer(Buffer::new("acc", vec![64, 64], Scalar::F32, Scope::Fragment))
        .unwrap();
    let c = k
        .add_buffer(Buffer::new("c", vec![64, 64], Scalar::F32, Scope::Global))
        .unwrap();

    let mma = k
        .add_op(TileOp::gemm("mma", Operand::whole(s_a), Operand::whole(s_b), Operand::whole(acc)))
        .unwrap();
    k.push(mma).unwrap();
    let store = k
        .add_op(TileOp::copy("store", Operand::whole(acc), Operand::whole(c)))
        .unwrap();
    k.push(store).unwrap();
    k.add_dependency(store, mma).unwrap();
    k
}
