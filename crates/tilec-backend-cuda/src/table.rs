//! Instruction selection table for MMA-capable GPUs.

use tilec_backend_core::{LoweringTable, Slot};
use tilec_ir::{MmaOperand, OpTag};

use MmaOperand::{A, Accumulator, B};
use Slot::{Dense, Feed, Fragment, Global, Local, Mma, Shared, Strip};

/// Every op/layout combination the CUDA emitter supports.
///
/// Rules are tried in order, so specialised forms (asynchronous copies,
/// `ldmatrix`) come before their generic fallbacks.
pub fn table(target: &str) -> LoweringTable {
    LoweringTable::new(target)
        // Copies.
        .rule(OpTag::Copy, &[Global, Shared], "tilec::cp_async")
        .rule(OpTag::Copy, &[Shared, Mma(A)], "tilec::ldmatrix")
        .rule(OpTag::Copy, &[Shared, Mma(B)], "tilec::ldmatrix_trans")
        .rule(OpTag::Copy, &[Dense, Fragment], "tilec::load_fragment")
        .rule(OpTag::Copy, &[Strip, Mma(A)], "tilec::shuffle_fragment")
        .rule(OpTag::Copy, &[Strip, Mma(B)], "tilec::shuffle_fragment")
        .rule(OpTag::Copy, &[Mma(Accumulator), Dense], "tilec::store_accumulator")
        .rule(OpTag::Copy, &[Fragment, Dense], "tilec::store_fragment")
        .rule(OpTag::Copy, &[Fragment, Fragment], "tilec::move_fragment")
        .rule(OpTag::Copy, &[Dense, Dense], "tilec::copy")
        // Initialisation and arithmetic.
        .rule(OpTag::Fill, &[Fragment], "tilec::fill_fragment")
        .rule(OpTag::Fill, &[Dense], "tilec::fill")
        .rule(OpTag::Reduce, &[Dense, Local], "tilec::reduce")
        .rule(OpTag::Reduce, &[Dense, Shared], "tilec::reduce")
        .rule(OpTag::Reduce, &[Fragment, Dense], "tilec::warp_reduce")
        .rule(OpTag::Elementwise, &[Dense, Dense, Dense], "tilec::elementwise")
        .rule(OpTag::Elementwise, &[Fragment, Fragment, Fragment], "tilec::elementwise_fragment")
        .rule(OpTag::Cast, &[Dense, Dense], "tilec::convert")
        .rule(OpTag::Cast, &[Fragment, Fragment], "tilec::convert_fragment")
        // Matrix unit.
        .rule(OpTag::Gemm, &[Mma(A), Mma(B), Mma(Accumulator)], "tilec::mma_sync")
        .rule(OpTag::Gemm, &[Feed(A), Feed(B), Mma(Accumulator)], "tilec::mma_smem")
        // Atomics.
        .rule(OpTag::Atomic, &[Slot::Any, Global], "tilec::red_global")
        .rule(OpTag::Atomic, &[Slot::Any, Shared], "tilec::atomic_shared")
        // Synchronisation.
        .rule(OpTag::Barrier, &[], "tilec::barrier")
}
