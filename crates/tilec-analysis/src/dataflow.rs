//! Buffer def-use chains and loop-body dependency classification.
//!
//! [`DefUse`] records, for every buffer, which live ops read or write it and
//! through which operand. [`loop_dependencies`] compares the read/write sets
//! of a loop body's ops, both within one iteration and from one iteration
//! into the next.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use tilec_ir::{Buffer, Handle, Kernel, LoopNest, OpKind, Scope, TileOp};

/// Operand slot of an op.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Port {
    Input(usize),
    Output(usize),
}

/// One access of a buffer by an op.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Use {
    pub op: Handle<TileOp>,
    pub port: Port,
    pub reads: bool,
    pub writes: bool,
}

/// Def-use chains of every buffer over the live ops of a kernel.
#[derive(Clone, Debug, Default)]
pub struct DefUse {
    uses: BTreeMap<Handle<Buffer>, Vec<Use>>,
    position: HashMap<Handle<TileOp>, usize>,
}

impl DefUse {
    /// Walks live ops in program order.
    pub fn build(kernel: &Kernel) -> Self {
        let mut def_use = Self::default();
        for (pos, h) in kernel.live_ops().into_iter().enumerate() {
            def_use.position.insert(h, pos);
            let op = kernel.op(h);
            for (i, operand) in op.inputs.iter().enumerate() {
                def_use.uses.entry(operand.buffer).or_default().push(Use {
                    op: h,
                    port: Port::Input(i),
                    reads: true,
                    writes: false,
                });
            }
            for (i, operand) in op.outputs.iter().enumerate() {
                def_use.uses.entry(operand.buffer).or_default().push(Use {
                    op: h,
                    port: Port::Output(i),
                    reads: op.kind.reads_output(),
                    writes: true,
                });
            }
        }
        def_use
    }

    /// All accesses of `buffer` in program order.
    pub fn uses(&self, buffer: Handle<Buffer>) -> &[Use] {
        self.uses.get(&buffer).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn writers(&self, buffer: Handle<Buffer>) -> impl Iterator<Item = Handle<TileOp>> + '_ {
        self.uses(buffer).iter().filter(|u| u.writes).map(|u| u.op)
    }

    pub fn readers(&self, buffer: Handle<Buffer>) -> impl Iterator<Item = Handle<TileOp>> + '_ {
        self.uses(buffer).iter().filter(|u| u.reads).map(|u| u.op)
    }

    /// Distinct ops touching `buffer`, in program order.
    pub fn accessors(&self, buffer: Handle<Buffer>) -> Vec<Handle<TileOp>> {
        let mut out: Vec<Handle<TileOp>> = Vec::new();
        for u in self.uses(buffer) {
            if !out.contains(&u.op) {
                out.push(u.op);
            }
        }
        out
    }

    /// Program-order index of a live op.
    pub fn position(&self, op: Handle<TileOp>) -> Option<usize> {
        self.position.get(&op).copied()
    }

    pub fn is_unused(&self, buffer: Handle<Buffer>) -> bool {
        self.uses(buffer).is_empty()
    }
}

/// Pipeline stage of a loop-body op.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    /// A copy from global memory into a faster scope.
    Load,
    Compute,
}

pub fn classify_stage(kernel: &Kernel, op: &TileOp) -> Stage {
    match op.kind {
        OpKind::Copy { .. } => {
            let src = kernel.buffer(op.inputs[0].buffer).scope;
            let dst = kernel.buffer(op.outputs[0].buffer).scope;
            if src == Scope::Global && dst != Scope::Global {
                Stage::Load
            } else {
                Stage::Compute
            }
        }
        _ => Stage::Compute,
    }
}

/// The kind of a dependency between two ops.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DependencyKind {
    /// Read-after-write.
    DataFlow,
    /// Write-after-read.
    AntiDependency,
    /// Write-after-write.
    OutputDependency,
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::DataFlow => "RAW",
            Self::AntiDependency => "WAR",
            Self::OutputDependency => "WAW",
        })
    }
}

/// A dependency between two ops of a loop body, identified by body index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoopDependency {
    pub from: usize,
    pub to: usize,
    pub buffer: Handle<Buffer>,
    pub kind: DependencyKind,
    /// `from` runs in iteration `n` and `to` in iteration `n + 1`.
    pub carried: bool,
}

/// Dependencies among the ops of a loop's original body.
///
/// Windowed operands touch a different region every iteration and never
/// carry a dependency into the next one.
pub fn loop_dependencies(kernel: &Kernel, nest: Handle<LoopNest>) -> Vec<LoopDependency> {
    let body = kernel.loop_nest(nest).body();
    let sets: Vec<_> = body.iter().map(|&h| access_sets(kernel.op(h))).collect();
    let mut deps = Vec::new();

    for (i, from) in sets.iter().enumerate() {
        for (j, to) in sets.iter().enumerate() {
            for carried in [false, true] {
                if !carried && j <= i {
                    continue;
                }
                let pairs = [
                    (&from.writes, &to.reads, DependencyKind::DataFlow),
                    (&from.reads, &to.writes, DependencyKind::AntiDependency),
                    (&from.writes, &to.writes, DependencyKind::OutputDependency),
                ];
                for (a, b, kind) in pairs {
                    for &(buffer, windowed) in a.iter() {
                        let hit = b
                            .iter()
                            .any(|&(other, w)| other == buffer && !(carried && (windowed || w)));
                        if hit {
                            deps.push(LoopDependency {
                                from: i,
                                to: j,
                                buffer,
                                kind,
                                carried,
                            });
                        }
                    }
                }
            }
        }
    }
    deps
}

struct AccessSets {
    reads: Vec<(Handle<Buffer>, bool)>,
    writes: Vec<(Handle<Buffer>, bool)>,
}

fn access_sets(op: &TileOp) -> AccessSets {
    AccessSets {
        reads: op.reads().map(|o| (o.buffer, o.step.is_some())).collect(),
        writes: op.writes().map(|o| (o.buffer, o.step.is_some())).collect(),
    }
}

#[cfg(test)]
mod tests {
    use tilec_ir::{Literal, Operand, Scalar};

    use super::*;

    /// `for k: load s <- g[k]; acc += s; ` with `acc` filled before the loop.
    fn accumulate_loop() -> (Kernel, Handle<LoopNest>) {
        let mut k = Kernel::new("acc");
        let g = k
            .add_buffer(Buffer::new("g", vec![16, 64], Scalar::F32, Scope::Global))
            .unwrap();
        let s = k
            .add_buffer(Buffer::new("s", vec![16, 16], Scalar::F32, Scope::Shared))
            .unwrap();
        let acc = k
            .add_buffer(Buffer::new("acc", vec![16, 16], Scalar::F32, Scope::Local))
            .unwrap();
        let fill = k
            .add_op(TileOp::fill("zero", Literal::Float(0.0), Operand::whole(acc)))
            .unwrap();
        k.push(fill).unwrap();
        let lp = k.push_loop(LoopNest::new("l", 4)).unwrap();
        let load = k
            .add_op(TileOp::copy("load", Operand::stepped(g, 1, 16), Operand::whole(s)))
            .unwrap();
        let add = k
            .add_op(TileOp::elementwise(
                "add",
                tilec_ir::BinaryOp::Add,
                Operand::whole(acc),
                Operand::whole(s),
                Operand::whole(acc),
            ))
            .unwrap();
        k.push_to_loop(lp, load).unwrap();
        k.push_to_loop(lp, add).unwrap();
        (k, lp)
    }

    #[test]
    fn def_use_chains() {
        let (k, _) = accumulate_loop();
        let du = DefUse::build(&k);
        let acc = k.find_buffer("acc").unwrap();
        assert_eq!(du.writers(acc).count(), 2);
        assert_eq!(du.readers(acc).count(), 1);
        assert_eq!(du.accessors(acc).len(), 2);
        assert_eq!(du.position(k.live_ops()[2]), Some(2));
    }

    #[test]
    fn stages() {
        let (k, lp) = accumulate_loop();
        let body = k.loop_nest(lp).body();
        assert_eq!(classify_stage(&k, k.op(body[0])), Stage::Load);
        assert_eq!(classify_stage(&k, k.op(body[1])), Stage::Compute);
    }

    #[test]
    fn carried_and_intra_dependencies() {
        let (k, lp) = accumulate_loop();
        let deps = loop_dependencies(&k, lp);
        let s = k.find_buffer("s").unwrap();
        let acc = k.find_buffer("acc").unwrap();

        assert!(deps.contains(&LoopDependency {
            from: 0,
            to: 1,
            buffer: s,
            kind: DependencyKind::DataFlow,
            carried: false,
        }));
        // The accumulator feeds the next iteration.
        assert!(deps.contains(&LoopDependency {
            from: 1,
            to: 1,
            buffer: acc,
            kind: DependencyKind::DataFlow,
            carried: true,
        }));
        // Next iteration's load overwrites what this iteration's add read.
        assert!(deps.contains(&LoopDependency {
            from: 1,
            to: 0,
            buffer: s,
            kind: DependencyKind::AntiDependency,
            carried: true,
        }));
        // The windowed global source never carries.
        let g = k.find_buffer("g").unwrap();
        assert!(deps.iter().all(|d| d.buffer != g));
        assert_eq!(DependencyKind::DataFlow.to_string(), "RAW");
    }
}
