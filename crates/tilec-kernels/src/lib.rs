//! Reference tile kernels.
//!
//! These builders stand in for a front end: each returns an unlowered
//! [`Kernel`] with shapes, scopes, loop annotations and dependencies set,
//! ready for `tilec_opt::lower`.

use tilec_ir::{
    AtomicOp, BinaryOp, Buffer, Handle, IrError, Kernel, Literal, LoopNest, OpKind, Operand,
    ReduceOp, Scalar, Scope, TileOp,
};

/// Kernels available by name, with a one-line description.
pub const KERNELS: &[(&str, &str)] = &[
    ("gemm", "64x64 GEMM, both operands staged through shared memory"),
    ("streamed-gemm", "64x256 GEMM with resident A and B streamed per column tile"),
    ("fragment-gemm", "GEMM with A copied straight into registers"),
    ("row-reduce", "row sums of a 16-row f16 matrix into f32"),
    ("split-k-gemm", "GEMM slice accumulated into global memory atomically"),
];

/// Builds a kernel by name with its default parameters.
pub fn by_name(name: &str) -> Option<Result<Kernel, IrError>> {
    Some(match name {
        "gemm" => gemm(4, 2),
        "streamed-gemm" => streamed_gemm(4, 2),
        "fragment-gemm" => fragment_conflict_gemm(false),
        "row-reduce" => row_reduce(8, 2),
        "split-k-gemm" => split_k_gemm(4),
        _ => return None,
    })
}

/// Appends ops and their dependencies to a kernel.
struct Builder {
    kernel: Kernel,
}

impl Builder {
    fn new(name: &str) -> Self {
        Self {
            kernel: Kernel::new(name),
        }
    }

    fn buffer(
        &mut self,
        name: &str,
        shape: &[u32],
        dtype: Scalar,
        scope: Scope,
    ) -> Result<Handle<Buffer>, IrError> {
        self.kernel
            .add_buffer(Buffer::new(name, shape.to_vec(), dtype, scope))
    }

    fn op(&mut self, op: TileOp, after: &[Handle<TileOp>]) -> Result<Handle<TileOp>, IrError> {
        let h = self.kernel.add_op(op)?;
        self.kernel.push(h)?;
        self.depend(h, after)?;
        Ok(h)
    }

    fn looped(
        &mut self,
        nest: Handle<LoopNest>,
        op: TileOp,
        after: &[Handle<TileOp>],
    ) -> Result<Handle<TileOp>, IrError> {
        let h = self.kernel.add_op(op)?;
        self.kernel.push_to_loop(nest, h)?;
        self.depend(h, after)?;
        Ok(h)
    }

    fn depend(&mut self, op: Handle<TileOp>, after: &[Handle<TileOp>]) -> Result<(), IrError> {
        for &dep in after {
            self.kernel.add_dependency(op, dep)?;
        }
        Ok(())
    }

    fn finish(self) -> Result<Kernel, IrError> {
        self.kernel.validate()?;
        Ok(self.kernel)
    }
}

/// `c = a * b` for a 64x64 output over `k_tiles` 32-deep slices.
///
/// ```text
/// acc = 0
/// for k in 0..k_tiles (depth):
///     s_a = a[:, k*32 ..]
///     s_b = b[k*32 .., :]
///     acc += s_a * s_b
/// c = acc
/// ```
pub fn gemm(k_tiles: u32, depth: u32) -> Result<Kernel, IrError> {
    let mut b = Builder::new("gemm");
    let (acc, mma) = gemm_main_loop(&mut b, k_tiles, depth)?;
    let c = b.buffer("c", &[64, 64], Scalar::F32, Scope::Global)?;
    b.op(TileOp::copy("store", Operand::whole(acc), Operand::whole(c)), &[mma])?;
    b.finish()
}

/// Declares the operands and the K loop shared by [`gemm`] and
/// [`split_k_gemm`]. Returns the accumulator and the matrix op.
fn gemm_main_loop(
    b: &mut Builder,
    k_tiles: u32,
    depth: u32,
) -> Result<(Handle<Buffer>, Handle<TileOp>), IrError> {
    let k = 32 * k_tiles;
    let a = b.buffer("a", &[64, k], Scalar::F16, Scope::Global)?;
    let bm = b.buffer("b", &[k, 64], Scalar::F16, Scope::Global)?;
    let s_a = b.buffer("s_a", &[64, 32], Scalar::F16, Scope::Shared)?;
    let s_b = b.buffer("s_b", &[32, 64], Scalar::F16, Scope::Shared)?;
    let acc = b.buffer("acc", &[64, 64], Scalar::F32, Scope::Fragment)?;

    let clear = b.op(TileOp::fill("clear", Literal::Float(0.0), Operand::whole(acc)), &[])?;
    let lp = b
        .kernel
        .push_loop(LoopNest::new("k_loop", k_tiles).with_depth(depth))?;
    let load_a = b.looped(
        lp,
        TileOp::copy("load_a", Operand::stepped(a, 1, 32), Operand::whole(s_a)),
        &[],
    )?;
    let load_b = b.looped(
        lp,
        TileOp::copy("load_b", Operand::stepped(bm, 0, 32), Operand::whole(s_b)),
        &[],
    )?;
    let mma = b.looped(
        lp,
        TileOp::gemm("mma", Operand::whole(s_a), Operand::whole(s_b), Operand::whole(acc)),
        &[clear, load_a, load_b],
    )?;
    Ok((acc, mma))
}

/// A 64x(64 * `n_tiles`) product with A resident in shared memory and one
/// B column tile staged per iteration.
///
/// The loop has exactly one staging buffer (`s_b`), so pipelining it at
/// depth `d` allocates `d` instances of it and nothing else.
pub fn streamed_gemm(n_tiles: u32, depth: u32) -> Result<Kernel, IrError> {
    let n = 64 * n_tiles;
    let mut b = Builder::new("streamed_gemm");
    let a = b.buffer("a", &[64, 32], Scalar::F16, Scope::Global)?;
    let bm = b.buffer("b", &[32, n], Scalar::F16, Scope::Global)?;
    let c = b.buffer("c", &[64, n], Scalar::F32, Scope::Global)?;
    let s_a = b.buffer("s_a", &[64, 32], Scalar::F16, Scope::Shared)?;
    let s_b = b.buffer("s_b", &[32, 64], Scalar::F16, Scope::Shared)?;
    let acc = b.buffer("acc", &[64, n], Scalar::F32, Scope::Fragment)?;

    let clear = b.op(TileOp::fill("clear", Literal::Float(0.0), Operand::whole(acc)), &[])?;
    let load_a = b.op(TileOp::copy("load_a", Operand::whole(a), Operand::whole(s_a)), &[])?;
    let lp = b
        .kernel
        .push_loop(LoopNest::new("n_loop", n_tiles).with_depth(depth))?;
    let load_b = b.looped(
        lp,
        TileOp::copy("load_b", Operand::stepped(bm, 1, 64), Operand::whole(s_b)),
        &[],
    )?;
    let mma = b.looped(
        lp,
        TileOp::gemm(
            "mma",
            Operand::whole(s_a),
            Operand::whole(s_b),
            Operand::stepped(acc, 1, 64),
        ),
        &[clear, load_a, load_b],
    )?;
    b.op(TileOp::copy("store", Operand::whole(acc), Operand::whole(c)), &[mma])?;
    b.finish()
}

/// A single 16x8 MMA step whose A operand is copied from global memory
/// straight into registers.
///
/// The copy's natural register layout hands each lane a run of one 8x32
/// strip, which the 16x16 A operand tile does not divide. Lowering either
/// inserts a materializing copy or, with `forbid_copies`, reports the
/// conflict on `a_frag`.
pub fn fragment_conflict_gemm(forbid_copies: bool) -> Result<Kernel, IrError> {
    let mut b = Builder::new("fragment_gemm");
    let a = b.buffer("a", &[16, 32], Scalar::F16, Scope::Global)?;
    let bm = b.buffer("b", &[32, 8], Scalar::F16, Scope::Global)?;
    let c = b.buffer("c", &[16, 8], Scalar::F32, Scope::Global)?;
    let mut frag = Buffer::new("a_frag", vec![16, 32], Scalar::F16, Scope::Fragment);
    if forbid_copies {
        frag = frag.forbid_copies();
    }
    let a_frag = b.kernel.add_buffer(frag)?;
    let s_b = b.buffer("s_b", &[32, 8], Scalar::F16, Scope::Shared)?;
    let acc = b.buffer("acc", &[16, 8], Scalar::F32, Scope::Fragment)?;

    let load_a = b.op(TileOp::copy("load_a", Operand::whole(a), Operand::whole(a_frag)), &[])?;
    let load_b = b.op(TileOp::copy("load_b", Operand::whole(bm), Operand::whole(s_b)), &[])?;
    let mma = TileOp::new(
        "mma",
        OpKind::Gemm { accumulate: false },
        vec![Operand::whole(a_frag), Operand::whole(s_b)],
        vec![Operand::whole(acc)],
    );
    let mma = b.op(mma, &[load_a, load_b])?;
    b.op(TileOp::copy("store", Operand::whole(acc), Operand::whole(c)), &[mma])?;
    b.finish()
}

/// Row sums of a 16 x (32 * `tiles`) f16 matrix, accumulated in f32.
///
/// The partial reduction reads f16 and writes f32, so type decoupling has
/// a conversion to make explicit.
pub fn row_reduce(tiles: u32, depth: u32) -> Result<Kernel, IrError> {
    let mut b = Builder::new("row_reduce");
    let x = b.buffer("x", &[16, 32 * tiles], Scalar::F16, Scope::Global)?;
    let out = b.buffer("out", &[16], Scalar::F32, Scope::Global)?;
    let s_x = b.buffer("s_x", &[16, 32], Scalar::F16, Scope::Shared)?;
    let part = b.buffer("part", &[16], Scalar::F32, Scope::Local)?;
    let acc = b.buffer("acc", &[16], Scalar::F32, Scope::Local)?;

    let clear = b.op(TileOp::fill("clear", Literal::Float(0.0), Operand::whole(acc)), &[])?;
    let lp = b
        .kernel
        .push_loop(LoopNest::new("col_loop", tiles).with_depth(depth))?;
    let load = b.looped(
        lp,
        TileOp::copy("load", Operand::stepped(x, 1, 32), Operand::whole(s_x)),
        &[],
    )?;
    let partial = b.looped(
        lp,
        TileOp::reduce("partial", ReduceOp::Sum, 1, Operand::whole(s_x), Operand::whole(part)),
        &[load],
    )?;
    let add = b.looped(
        lp,
        TileOp::elementwise(
            "accumulate",
            BinaryOp::Add,
            Operand::whole(part),
            Operand::whole(acc),
            Operand::whole(acc),
        ),
        &[clear, partial],
    )?;
    b.op(TileOp::copy("store", Operand::whole(acc), Operand::whole(out)), &[add])?;
    b.finish()
}

/// One K slice of a split-K GEMM: the partial product is added into `c`
/// with atomics, as other slices of the same output may run concurrently.
pub fn split_k_gemm(k_tiles: u32) -> Result<Kernel, IrError> {
    let mut b = Builder::new("split_k_gemm");
    let (acc, mma) = gemm_main_loop(&mut b, k_tiles, 1)?;
    let c = b.buffer("c", &[64, 64], Scalar::F32, Scope::Global)?;
    b.op(
        TileOp::atomic("reduce", AtomicOp::Add, Operand::whole(acc), Operand::whole(c)),
        &[mma],
    )?;
    b.finish()
}
