mod common;

use tilec_analysis::{LogicalEffect, trace_loop};
use tilec_ir::{IterRef, Kernel, OpKind, TargetSpec};
use tilec_opt::{CompileError, DependencyViolation};

fn logical_trace(kernel: &Kernel, loop_name: &str) -> Vec<LogicalEffect> {
    trace_loop(kernel, common::loop_named(kernel, loop_name))
        .iter()
        .map(|e| e.logical())
        .collect()
}

fn iterations(kernel: &Kernel, ops: &[tilec_ir::Handle<tilec_ir::TileOp>]) -> Vec<(String, IterRef)> {
    ops.iter()
        .map(|&h| {
            let op = kernel.op(h);
            let sched = op.sched().expect("pipeline clones carry a schedule");
            (op.name.clone(), sched.iteration)
        })
        .collect()
}

#[test]
fn depth_one_keeps_the_original_trace() {
    let original = tilec_kernels::gemm(4, 1).unwrap();
    let before = logical_trace(&original, "k_loop");

    let lowered = common::lower_for(original, TargetSpec::sm80());
    let after = logical_trace(&lowered, "k_loop");
    assert_eq!(before.len(), 12);
    assert_eq!(before, after);
}

#[test]
fn deeper_pipelines_reorder_but_preserve_effects() {
    let original = tilec_kernels::gemm(4, 2).unwrap();
    let mut before = logical_trace(&original, "k_loop");

    let lowered = common::lower_for(original, TargetSpec::sm80());
    let nest = common::loop_named(&lowered, "k_loop");
    let effects = trace_loop(&lowered, nest);
    let mut after: Vec<_> = effects.iter().map(|e| e.logical()).collect();
    assert_ne!(before, after);

    let key = |e: &LogicalEffect| (e.op, e.iteration);
    before.sort_by_key(key);
    after.sort_by_key(key);
    assert_eq!(before, after);

    // Every compute reads the instance its own iteration's load wrote.
    for e in &effects {
        for read in &e.reads {
            let writer = effects.iter().find(|w| {
                w.iteration == e.iteration && w.writes.iter().any(|a| a.buffer == read.buffer)
            });
            if let Some(w) = writer {
                let written = w.writes.iter().find(|a| a.buffer == read.buffer).unwrap();
                assert_eq!(written.physical, read.physical);
            }
        }
    }
}

#[test]
fn streamed_operand_gets_a_two_instance_ring() {
    let k = common::lower_for(tilec_kernels::streamed_gemm(4, 2).unwrap(), TargetSpec::sm80());
    let nest = k.loop_nest(common::loop_named(&k, "n_loop"));
    let p = nest.expansion().expect("n_loop is pipelined");

    assert_eq!(p.depth, 2);
    assert_eq!(p.steady_trips, 3);
    assert_eq!(p.rings.len(), 1);
    let names: Vec<_> = p.rings[0]
        .instances
        .iter()
        .map(|&b| k.buffer(b).name.as_str())
        .collect();
    assert_eq!(names, ["s_b", "s_b_stage1"]);

    assert_eq!(iterations(&k, &p.prologue), [("load_b".into(), IterRef::Absolute(0))]);

    let steady = iterations(&k, &p.steady);
    assert!(steady.contains(&("load_b".into(), IterRef::Relative(1))));
    assert!(steady.contains(&("mma".into(), IterRef::Relative(0))));
    let kinds: Vec<_> = p.steady.iter().map(|&h| k.op(h).kind.to_string()).collect();
    assert_eq!(kinds, ["copy.v8", "wait(1)", "gemm.acc", "sync"]);

    let epilogue = iterations(&k, &p.epilogue);
    assert_eq!(epilogue.last(), Some(&("mma".into(), IterRef::Absolute(3))));
    assert!(matches!(
        k.op(p.epilogue[0]).kind,
        OpKind::Barrier(tilec_ir::BarrierKind::AsyncWait { pending: 0 })
    ));
}

#[test]
fn read_before_load_cannot_be_pipelined() {
    let mut options = common::with_depth(TargetSpec::sm80(), "k_loop", 3);
    options.swizzle = false;
    let err = common::try_lower(common::read_before_load(4), &options).unwrap_err();
    let CompileError::PipelineDependency(e) = err else {
        panic!("expected a pipeline dependency error, got {err}");
    };
    assert_eq!(e.loop_name, "k_loop");
    assert_eq!(e.depth, 3);
    assert_eq!(e.reason, DependencyViolation::ReadBeforeWrite);
    assert_eq!(e.op.as_deref(), Some("add"));
    assert_eq!(e.buffer.as_deref(), Some("s"));
}

#[test]
fn short_loops_are_rejected_at_depth() {
    let options = common::with_depth(TargetSpec::sm80(), "k_loop", 4);
    let err = common::try_lower(tilec_kernels::gemm(2, 2).unwrap(), &options).unwrap_err();
    assert!(matches!(
        err,
        CompileError::PipelineDependency(ref e) if e.reason == DependencyViolation::TripCountTooSmall
    ));
}

#[test]
fn lowering_is_deterministic() {
    let a = common::lower_for(tilec_kernels::gemm(4, 2).unwrap(), TargetSpec::sm80());
    let b = common::lower_for(tilec_kernels::gemm(4, 2).unwrap(), TargetSpec::sm80());
    assert_eq!(tilec_ir::dump_kernel(&a), tilec_ir::dump_kernel(&b));
}
