//! Software pipelining of load/compute loops.
//!
//! A loop of depth `d > 1` is rewritten into
//!
//! - a prologue issuing the loads of iterations `0..d-1`,
//! - a steady block run `extent - (d - 1)` times that issues the load of
//!   iteration `i + d - 1`, waits until at most `d - 1` load groups are in
//!   flight, computes iteration `i` and synchronizes,
//! - an epilogue computing the remaining iterations while draining the
//!   outstanding loads.
//!
//! Every buffer written by a load gets a ring of `d` rotating instances, so
//! the load for iteration `t` and the compute for iteration `t` meet in
//! instance `t % d` while the other instances are in flight.

use std::collections::{BTreeMap, BTreeSet};

use tilec_analysis::{DependencyKind, Stage, classify_stage, loop_dependencies};
use tilec_ir::{
    BarrierKind, Buffer, COMPUTE_STAGE, Handle, IrError, IterRef, Kernel, LOAD_STAGE, LoopNest,
    Phase, Pipelined, Ring, SchedInfo, TileOp,
};

use crate::CompileOptions;
use crate::error::{CompileError, DependencyViolation, PipelineDependencyError};

/// Pipelines every loop with a requested depth. The depth comes from
/// [`CompileOptions::pipeline_depth`] or, failing that, the loop's own
/// annotation. Returns the loops rewritten.
pub fn pipeline_loops(
    kernel: &mut Kernel,
    options: &CompileOptions,
) -> Result<Vec<Handle<LoopNest>>, CompileError> {
    let nests: Vec<_> = kernel
        .loops()
        .filter(|(_, lp)| lp.expansion().is_none())
        .map(|(h, lp)| (h, options.pipeline_depth.get(&lp.name).copied().or(lp.depth)))
        .collect();

    let mut done = Vec::new();
    for (nest, depth) in nests {
        let Some(depth) = depth else { continue };
        pipeline_loop(kernel, nest, depth)?;
        done.push(nest);
    }
    Ok(done)
}

/// Rewrites one loop at `depth`.
pub fn pipeline_loop(
    kernel: &mut Kernel,
    nest: Handle<LoopNest>,
    depth: u32,
) -> Result<(), CompileError> {
    let lp = kernel.loop_nest(nest);
    if depth == 0 {
        return Err(IrError::InvalidLoop {
            name: lp.name.clone(),
            reason: "pipeline depth must be at least 1".into(),
        }
        .into());
    }
    let name = lp.name.clone();
    let extent = lp.extent;
    let body = lp.body().to_vec();
    let stages: Vec<Stage> = body
        .iter()
        .map(|&h| classify_stage(kernel, kernel.op(h)))
        .collect();

    let staged = if depth > 1 {
        check_pipelinable(kernel, nest, depth, &body, &stages)?
    } else {
        if !stages.contains(&Stage::Load) {
            log::warn!("loop `{name}` has no load stage; nothing to overlap");
        }
        Vec::new()
    };

    let rings = staged
        .iter()
        .map(|&b| allocate_ring(kernel, b, depth))
        .collect::<Result<Vec<_>, _>>()?;

    let mut builder = Builder {
        body: &body,
        stages: &stages,
        staged: &staged,
        clones: BTreeMap::new(),
    };
    let mut pipelined = Pipelined {
        depth,
        steady_trips: extent,
        prologue: Vec::new(),
        steady: Vec::new(),
        epilogue: Vec::new(),
        rings,
    };

    if depth == 1 {
        let all: Vec<usize> = (0..body.len()).collect();
        builder.slot(kernel, &all, Phase::Steady, IterRef::Relative(0), None, &mut pipelined.steady)?;
    } else {
        let ahead = depth - 1;
        let loads: Vec<usize> = (0..body.len()).filter(|&i| stages[i] == Stage::Load).collect();
        let computes: Vec<usize> = (0..body.len()).filter(|&i| stages[i] == Stage::Compute).collect();
        pipelined.steady_trips = extent - ahead;

        for t in 0..ahead {
            builder.slot(kernel, &loads, Phase::Prologue, IterRef::Absolute(t), None, &mut pipelined.prologue)?;
        }

        let issued = builder.slot(
            kernel,
            &loads,
            Phase::Steady,
            IterRef::Relative(ahead),
            None,
            &mut pipelined.steady,
        )?;
        let wait = barrier(kernel, BarrierKind::AsyncWait { pending: ahead }, Phase::Steady, &issued)?;
        pipelined.steady.push(wait);
        let computed = builder.slot(
            kernel,
            &computes,
            Phase::Steady,
            IterRef::Relative(0),
            Some(wait),
            &mut pipelined.steady,
        )?;
        let sync = barrier(kernel, BarrierKind::Sync, Phase::Steady, &computed)?;
        pipelined.steady.push(sync);

        for t in pipelined.steady_trips..extent {
            let pending = extent - 1 - t;
            let wait = barrier(kernel, BarrierKind::AsyncWait { pending }, Phase::Epilogue, &[])?;
            pipelined.epilogue.push(wait);
            builder.slot(
                kernel,
                &computes,
                Phase::Epilogue,
                IterRef::Absolute(t),
                Some(wait),
                &mut pipelined.epilogue,
            )?;
        }
    }

    let last_clone = builder.clones;
    log::debug!(
        "loop `{name}`: {} prologue, {} steady ({} trips), {} epilogue ops",
        pipelined.prologue.len(),
        pipelined.steady.len(),
        pipelined.steady_trips,
        pipelined.epilogue.len()
    );
    kernel.set_expansion(nest, pipelined)?;
    for (original, last) in last_clone {
        kernel.redirect_dependents(original, last);
    }
    log::info!("pipelined loop `{name}` at depth {depth}");
    Ok(())
}

/// Checks that a depth greater than one preserves the body's semantics.
/// Returns the staged buffers (load destinations) in body order.
fn check_pipelinable(
    kernel: &Kernel,
    nest: Handle<LoopNest>,
    depth: u32,
    body: &[Handle<TileOp>],
    stages: &[Stage],
) -> Result<Vec<Handle<Buffer>>, PipelineDependencyError> {
    let lp = kernel.loop_nest(nest);
    let violation = |reason, op: Option<Handle<TileOp>>, buffer: Option<Handle<Buffer>>| {
        PipelineDependencyError {
            loop_name: lp.name.clone(),
            depth,
            op: op.map(|h| kernel.op(h).name.clone()),
            buffer: buffer.map(|b| kernel.buffer(b).name.clone()),
            reason,
        }
    };

    if !stages.contains(&Stage::Load) {
        return Err(violation(DependencyViolation::NoLoadStage, None, None));
    }
    if lp.extent < depth - 1 {
        return Err(violation(DependencyViolation::TripCountTooSmall, None, None));
    }

    let mut staged: Vec<Handle<Buffer>> = Vec::new();
    for (&h, _) in body.iter().zip(stages).filter(|(_, s)| **s == Stage::Load) {
        for o in kernel.op(h).writes() {
            if !staged.contains(&o.buffer) {
                staged.push(o.buffer);
            }
        }
    }

    for dep in loop_dependencies(kernel, nest) {
        if dep.kind == DependencyKind::DataFlow
            && stages[dep.from] == Stage::Compute
            && stages[dep.to] == Stage::Load
        {
            return Err(violation(
                DependencyViolation::ComputeFeedsLoad,
                Some(body[dep.to]),
                Some(dep.buffer),
            ));
        }
    }

    for &buffer in &staged {
        let first_load = body
            .iter()
            .zip(stages)
            .position(|(&h, &s)| s == Stage::Load && kernel.op(h).writes().any(|o| o.buffer == buffer))
            .unwrap_or(0);
        for (i, (&h, &stage)) in body.iter().zip(stages).enumerate() {
            if stage != Stage::Compute {
                continue;
            }
            let op = kernel.op(h);
            if op.writes().any(|o| o.buffer == buffer) {
                return Err(violation(
                    DependencyViolation::StagedBufferWrittenByCompute,
                    Some(h),
                    Some(buffer),
                ));
            }
            if i < first_load && op.reads().any(|o| o.buffer == buffer) {
                return Err(violation(
                    DependencyViolation::ReadBeforeWrite,
                    Some(h),
                    Some(buffer),
                ));
            }
        }
        let outside = kernel
            .live_ops()
            .into_iter()
            .find(|h| !body.contains(h) && kernel.op(*h).touches(buffer));
        if let Some(h) = outside {
            return Err(violation(
                DependencyViolation::StagedBufferLiveOut,
                Some(h),
                Some(buffer),
            ));
        }
    }
    Ok(staged)
}

/// Instance 0 is the buffer itself; the others inherit its layout and swizzle.
fn allocate_ring(kernel: &mut Kernel, logical: Handle<Buffer>, depth: u32) -> Result<Ring, IrError> {
    let buffer = kernel.buffer(logical).clone();
    let mut instances = vec![logical];
    for j in 1..depth {
        let mut instance = buffer.renamed(format!("{}_stage{j}", buffer.name));
        instance.instance_of = Some((logical, j));
        let h = kernel.add_buffer(instance)?;
        if let Some(layout) = buffer.layout() {
            kernel.attach_layout(h, layout.clone())?;
        }
        if let Some(swizzle) = buffer.swizzle() {
            kernel.attach_swizzle(h, *swizzle)?;
        }
        instances.push(h);
    }
    log::debug!("ring of {depth} instances for `{}`", buffer.name);
    Ok(Ring { logical, instances })
}

fn barrier(
    kernel: &mut Kernel,
    kind: BarrierKind,
    phase: Phase,
    after: &[Handle<TileOp>],
) -> Result<Handle<TileOp>, IrError> {
    let name = match kind {
        BarrierKind::Sync => "sync",
        BarrierKind::AsyncWait { .. } => "wait",
    };
    let h = kernel.add_op(TileOp::barrier(name, kind))?;
    kernel.set_sched(
        h,
        SchedInfo {
            stage: COMPUTE_STAGE,
            phase,
            iteration: IterRef::Relative(0),
            origin: h,
        },
    )?;
    for &op in after {
        kernel.add_dependency(h, op)?;
    }
    Ok(h)
}

/// Clones body ops into expansion blocks.
struct Builder<'a> {
    body: &'a [Handle<TileOp>],
    stages: &'a [Stage],
    staged: &'a [Handle<Buffer>],
    /// Latest clone of every body op, in program order.
    clones: BTreeMap<Handle<TileOp>, Handle<TileOp>>,
}

impl Builder<'_> {
    /// Clones the body ops at `indices` for one source iteration and appends
    /// them to `block`.
    ///
    /// Dependencies between body ops are mirrored within the slot; those on
    /// ops outside the loop are kept. Every clone also waits for `after`.
    fn slot(
        &mut self,
        kernel: &mut Kernel,
        indices: &[usize],
        phase: Phase,
        iteration: IterRef,
        after: Option<Handle<TileOp>>,
        block: &mut Vec<Handle<TileOp>>,
    ) -> Result<Vec<Handle<TileOp>>, IrError> {
        let mut local: BTreeMap<Handle<TileOp>, Handle<TileOp>> = BTreeMap::new();
        let mut out = Vec::with_capacity(indices.len());
        for &i in indices {
            let original = self.body[i];
            let mut op = kernel.op(original).detached();
            for o in op.inputs.iter_mut().chain(op.outputs.iter_mut()) {
                if self.staged.contains(&o.buffer) {
                    o.rotating = true;
                }
            }
            let deps: BTreeSet<_> = kernel.op(original).deps().collect();
            let h = kernel.add_op(op)?;
            let stage = match self.stages[i] {
                Stage::Load => LOAD_STAGE,
                Stage::Compute => COMPUTE_STAGE,
            };
            kernel.set_sched(
                h,
                SchedInfo {
                    stage,
                    phase,
                    iteration,
                    origin: original,
                },
            )?;
            for dep in deps {
                if !self.body.contains(&dep) {
                    kernel.add_dependency(h, dep)?;
                } else if let Some(&clone) = local.get(&dep) {
                    kernel.add_dependency(h, clone)?;
                }
            }
            if let Some(barrier) = after {
                kernel.add_dependency(h, barrier)?;
            }
            local.insert(original, h);
            self.clones.insert(original, h);
            block.push(h);
            out.push(h);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use tilec_analysis::trace_loop;
    use tilec_ir::{BinaryOp, Literal, Operand, Scalar, Scope};

    use super::*;

    /// `acc += x[:, i] + x[:, i]` over `extent` column tiles of `x`, staged
    /// through `s`.
    fn staged_sum(extent: u32) -> (Kernel, Handle<LoopNest>) {
        staged_sum_ordered(extent, true)
    }

    fn staged_sum_ordered(extent: u32, load_first: bool) -> (Kernel, Handle<LoopNest>) {
        let mut k = Kernel::new("sum");
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
        let lp = k.push_loop(LoopNest::new("k_loop", extent)).unwrap();
        let load = k
            .add_op(TileOp::copy("load", Operand::stepped(x, 1, 16), Operand::whole(s)))
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
        if load_first {
            k.push_to_loop(lp, load).unwrap();
            k.push_to_loop(lp, add).unwrap();
            k.add_dependency(add, load).unwrap();
        } else {
            k.push_to_loop(lp, add).unwrap();
            k.push_to_loop(lp, load).unwrap();
        }
        k.add_dependency(add, clear).unwrap();
        let store = k
            .add_op(TileOp::copy("store", Operand::whole(acc), Operand::whole(out)))
            .unwrap();
        k.push(store).unwrap();
        k.add_dependency(store, add).unwrap();
        (k, lp)
    }

    fn violation(k: &mut Kernel, lp: Handle<LoopNest>, depth: u32) -> DependencyViolation {
        match pipeline_loop(k, lp, depth) {
            Err(CompileError::PipelineDependency(e)) => e.reason,
            other => panic!("expected a dependency error, got {other:?}"),
        }
    }

    #[test]
    fn depth_one_preserves_trace() {
        let (mut k, lp) = staged_sum(4);
        let before: Vec<_> = trace_loop(&k, lp).iter().map(|e| e.logical()).collect();
        pipeline_loop(&mut k, lp, 1).unwrap();
        let after: Vec<_> = trace_loop(&k, lp).iter().map(|e| e.logical()).collect();
        assert_eq!(before, after);

        let p = k.loop_nest(lp).expansion().unwrap();
        assert!(p.prologue.is_empty() && p.epilogue.is_empty() && p.rings.is_empty());
        assert_eq!(p.steady_trips, 4);
        k.validate().unwrap();
    }

    #[test]
    fn depth_two_rotates_two_instances() {
        let (mut k, lp) = staged_sum(4);
        let before: Vec<_> = trace_loop(&k, lp).iter().map(|e| e.logical()).collect();
        pipeline_loop(&mut k, lp, 2).unwrap();
        k.validate().unwrap();

        let p = k.loop_nest(lp).expansion().unwrap();
        assert_eq!(p.steady_trips, 3);
        assert_eq!(p.prologue.len(), 1);
        assert_eq!(p.rings.len(), 1);
        assert_eq!(p.rings[0].instances.len(), 2);
        assert_eq!(k.buffer(p.rings[0].instances[1]).name, "s_stage1");
        let kinds: Vec<_> = p.steady.iter().map(|&h| k.op(h).kind.clone()).collect();
        assert_eq!(kinds[1], tilec_ir::OpKind::Barrier(BarrierKind::AsyncWait { pending: 1 }));
        assert_eq!(kinds[3], tilec_ir::OpKind::Barrier(BarrierKind::Sync));

        // Same effects per op, and every compute reads the instance its
        // iteration's load wrote.
        let trace = trace_loop(&k, lp);
        let mut after: Vec<_> = trace.iter().map(|e| e.logical()).collect();
        let mut sorted_before = before.clone();
        let key = |e: &tilec_analysis::LogicalEffect| (e.op, e.iteration);
        sorted_before.sort_by_key(key);
        after.sort_by_key(key);
        assert_eq!(sorted_before, after);

        let ring = &k.loop_nest(lp).expansion().unwrap().rings[0];
        for e in &trace {
            let touched = e.reads.iter().chain(&e.writes).find(|a| a.buffer == ring.logical);
            if let Some(a) = touched {
                assert_eq!(a.physical, ring.instance(e.iteration));
            }
        }
    }

    #[test]
    fn outside_dependents_follow_last_clone() {
        let (mut k, lp) = staged_sum(3);
        pipeline_loop(&mut k, lp, 2).unwrap();
        let store = *k.live_ops().last().unwrap();
        assert_eq!(k.op(store).name, "store");
        let p = k.loop_nest(lp).expansion().unwrap();
        let last_add = *p.epilogue.last().unwrap();
        assert!(k.op(store).deps().any(|d| d == last_add));
        assert_eq!(k.op(last_add).sched().unwrap().iteration, IterRef::Absolute(2));
    }

    #[test]
    fn epilogue_drains_outstanding_loads() {
        let (mut k, lp) = staged_sum(4);
        pipeline_loop(&mut k, lp, 3).unwrap();
        let p = k.loop_nest(lp).expansion().unwrap();
        assert_eq!(p.prologue.len(), 2);
        assert_eq!(p.steady_trips, 2);
        let waits: Vec<_> = p
            .epilogue
            .iter()
            .filter_map(|&h| match k.op(h).kind {
                tilec_ir::OpKind::Barrier(BarrierKind::AsyncWait { pending }) => Some(pending),
                _ => None,
            })
            .collect();
        assert_eq!(waits, [1, 0]);
    }

    #[test]
    fn read_before_load_is_rejected() {
        let (mut k, lp) = staged_sum_ordered(4, false);
        assert_eq!(violation(&mut k, lp, 3), DependencyViolation::ReadBeforeWrite);
    }

    #[test]
    fn short_loop_is_rejected() {
        let (mut k, lp) = staged_sum(1);
        assert_eq!(violation(&mut k, lp, 3), DependencyViolation::TripCountTooSmall);
    }

    #[test]
    fn loop_without_loads_needs_depth_one() {
        let mut k = Kernel::new("c");
        let s = k
            .add_buffer(Buffer::new("s", vec![8], Scalar::F32, Scope::Shared))
            .unwrap();
        let lp = k.push_loop(LoopNest::new("l", 4)).unwrap();
        let fill = k
            .add_op(TileOp::fill("fill", Literal::Float(1.0), Operand::whole(s)))
            .unwrap();
        k.push_to_loop(lp, fill).unwrap();
        let mut k1 = k.clone();
        assert_eq!(violation(&mut k, lp, 2), DependencyViolation::NoLoadStage);
        pipeline_loop(&mut k1, lp, 1).unwrap();
    }

    #[test]
    fn staged_buffer_used_after_loop_is_rejected() {
        let (mut k, lp) = staged_sum(4);
        let s = k.find_buffer("s").unwrap();
        let out = k.find_buffer("out").unwrap();
        let peek = k
            .add_op(TileOp::copy("peek", Operand::whole(s), Operand::whole(out)))
            .unwrap();
        k.push(peek).unwrap();
        assert_eq!(violation(&mut k, lp, 2), DependencyViolation::StagedBufferLiveOut);
    }

    #[test]
    fn compute_feeding_a_load_is_rejected() {
        let mut k = Kernel::new("feedback");
        let g = k
            .add_buffer(Buffer::new("g", vec![8], Scalar::F32, Scope::Global))
            .unwrap();
        let s = k
            .add_buffer(Buffer::new("s", vec![8], Scalar::F32, Scope::Shared))
            .unwrap();
        let lp = k.push_loop(LoopNest::new("l", 4)).unwrap();
        let load = k
            .add_op(TileOp::copy("load", Operand::whole(g), Operand::whole(s)))
            .unwrap();
        let bump = k
            .add_op(TileOp::elementwise(
                "bump",
                BinaryOp::Add,
                Operand::whole(s),
                Operand::whole(s),
                Operand::whole(g),
            ))
            .unwrap();
        k.push_to_loop(lp, load).unwrap();
        k.push_to_loop(lp, bump).unwrap();
        assert_eq!(violation(&mut k, lp, 2), DependencyViolation::ComputeFeedsLoad);
    }

    #[test]
    fn options_override_declared_depth() {
        let (mut k, lp) = staged_sum(4);
        let mut options = CompileOptions::default();
        options.pipeline_depth.insert("k_loop".into(), 2);
        assert_eq!(pipeline_loops(&mut k, &options).unwrap(), vec![lp]);
        assert_eq!(k.loop_nest(lp).expansion().unwrap().depth, 2);
        // Already expanded loops are skipped.
        assert!(pipeline_loops(&mut k, &options).unwrap().is_empty());
    }
}
