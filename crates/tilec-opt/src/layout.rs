//! Layout assignment.
//!
//! Every buffer starts with a domain of candidate layouts: its hint, or the
//! defaults of its scope. Each live op constrains the buffers it touches,
//! either on its own ([`Requirement`]) or relative to another operand
//! ([`Relation`]). Domains are narrowed to arc consistency, then the most
//! constrained undecided buffer (ties by declaration order) is fixed to its
//! first candidate until every buffer has exactly one layout.
//!
//! When a domain runs empty, a materializing copy is inserted next to one of
//! the two disagreeing ops and assignment restarts, unless copies are
//! disabled, in which case the conflict is reported.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use tilec_analysis::DefUse;
use tilec_ir::{
    Buffer, DenseLayout, Fragment, FragmentKind, Handle, IrError, Kernel, Layout, MmaOperand,
    OpKind, Operand, Scope, TargetSpec, TileOp,
};

use crate::{CompileError, CompileOptions, LayoutConflictError};

/// What one op accepts for one buffer, on its own.
#[derive(Clone, Debug, PartialEq)]
enum Requirement {
    /// The matrix unit's native fragment for this operand.
    Mma(MmaOperand),
    /// A lane-strip fragment (register accumulation without a matrix unit).
    Strip,
    /// The natural result of a cooperative copy into registers: its strip
    /// layout, or an MMA fragment whose tile divides the strip tile.
    CopyInto(Option<Fragment>),
}

impl Requirement {
    fn admits(&self, layout: &Layout) -> bool {
        let Layout::Fragment(f) = layout else {
            return false;
        };
        match self {
            Requirement::Mma(operand) => f.kind == FragmentKind::Mma(*operand),
            Requirement::Strip => matches!(f.kind, FragmentKind::Strip { .. }),
            Requirement::CopyInto(None) => false,
            Requirement::CopyInto(Some(strip)) => {
                f == strip || (matches!(f.kind, FragmentKind::Mma(_)) && f.divides(strip.tile))
            }
        }
    }
}

/// What one op needs between the layouts of two of its operands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Relation {
    Equal,
    /// Both dense with unit stride along the same dimension, so one lane
    /// index walks both contiguously.
    SameInnermost,
}

impl Relation {
    fn holds(self, a: &Layout, b: &Layout) -> bool {
        match self {
            Relation::Equal => a == b,
            Relation::SameInnermost => match (a.as_dense(), b.as_dense()) {
                (Some(x), Some(y)) => x.innermost() == y.innermost(),
                _ => false,
            },
        }
    }
}

#[derive(Clone, Debug)]
enum Constraint {
    Unary {
        op: Handle<TileOp>,
        buffer: Handle<Buffer>,
        requirement: Requirement,
    },
    Binary {
        op: Handle<TileOp>,
        a: Handle<Buffer>,
        b: Handle<Buffer>,
        relation: Relation,
    },
}

impl Constraint {
    fn op(&self) -> Handle<TileOp> {
        match *self {
            Constraint::Unary { op, .. } | Constraint::Binary { op, .. } => op,
        }
    }

    fn touches(&self, buffer: Handle<Buffer>) -> bool {
        match *self {
            Constraint::Unary { buffer: b, .. } => b == buffer,
            Constraint::Binary { a, b, .. } => a == buffer || b == buffer,
        }
    }
}

/// Constraints declared by one op, per kind.
fn op_constraints(kernel: &Kernel, target: &TargetSpec, h: Handle<TileOp>) -> Vec<Constraint> {
    let op = kernel.op(h);
    let buf = |o: &Operand| kernel.buffer(o.buffer);
    let unary = |buffer, requirement| Constraint::Unary {
        op: h,
        buffer,
        requirement,
    };
    let binary = |a: &Operand, b: &Operand, relation| Constraint::Binary {
        op: h,
        a: a.buffer,
        b: b.buffer,
        relation,
    };
    let dense_pair = |a: &Operand, b: &Operand| {
        buf(a).scope.is_dense() && buf(b).scope.is_dense() && buf(a).rank() == buf(b).rank()
    };

    let mut out = Vec::new();
    match &op.kind {
        OpKind::Gemm { .. } => {
            let roles = [
                (&op.inputs[0], MmaOperand::A),
                (&op.inputs[1], MmaOperand::B),
                (&op.outputs[0], MmaOperand::Accumulator),
            ];
            for (operand, role) in roles {
                // Shared operands are read by row gathers and take any order.
                if buf(operand).scope != Scope::Fragment {
                    continue;
                }
                let requirement = if target.mma.is_some() {
                    Requirement::Mma(role)
                } else {
                    Requirement::Strip
                };
                out.push(unary(operand.buffer, requirement));
            }
        }
        OpKind::Copy { materialize, .. } => {
            let (src, dst) = (&op.inputs[0], &op.outputs[0]);
            let (src_dense, dst_dense) = (buf(src).scope.is_dense(), buf(dst).scope.is_dense());
            if *materialize {
                // A relayout accepts anything on either side.
            } else if dense_pair(src, dst) {
                out.push(binary(src, dst, Relation::SameInnermost));
            } else if src_dense && !dst_dense {
                let dst_buf = buf(dst);
                let strip = Fragment::strip([dst_buf.shape[0], dst_buf.shape[1]], dst_buf.dtype, target).ok();
                out.push(unary(dst.buffer, Requirement::CopyInto(strip)));
            } else if !src_dense && !dst_dense {
                out.push(binary(src, dst, Relation::Equal));
            }
        }
        OpKind::Elementwise { .. } => {
            let dst = &op.outputs[0];
            for src in op.inputs.iter().filter(|s| s.buffer != dst.buffer) {
                let (a, b) = (buf(src), buf(dst));
                if a.scope == Scope::Fragment && b.scope == Scope::Fragment && a.dtype == b.dtype {
                    out.push(binary(src, dst, Relation::Equal));
                } else if dense_pair(src, dst) {
                    let relation = if a.shape == b.shape {
                        Relation::Equal
                    } else {
                        Relation::SameInnermost
                    };
                    out.push(binary(src, dst, relation));
                }
            }
        }
        OpKind::Atomic { .. } | OpKind::Cast => {
            let (src, dst) = (&op.inputs[0], &op.outputs[0]);
            if dense_pair(src, dst) {
                out.push(binary(src, dst, Relation::SameInnermost));
            }
        }
        OpKind::Reduce { .. } | OpKind::Fill { .. } | OpKind::Barrier(_) => {}
    }
    out
}

/// Candidate layouts of a buffer without hints, in preference order.
pub fn scope_candidates(buffer: &Buffer, target: &TargetSpec) -> Vec<Layout> {
    match buffer.scope {
        Scope::Global => vec![Layout::row_major(&buffer.shape)],
        Scope::Shared | Scope::Local => DenseLayout::all_orders(&buffer.shape)
            .into_iter()
            .map(Layout::Dense)
            .collect(),
        Scope::Fragment => {
            let shape = [buffer.shape[0], buffer.shape[1]];
            let mut out = Vec::new();
            if let Ok(f) = Fragment::strip(shape, buffer.dtype, target) {
                out.push(Layout::Fragment(f));
            }
            for operand in [MmaOperand::A, MmaOperand::B, MmaOperand::Accumulator] {
                if let Ok(f) = Fragment::mma(operand, shape, target) {
                    out.push(Layout::Fragment(f));
                }
            }
            out
        }
    }
}

fn initial_domain(
    buffer: &Buffer,
    options: &CompileOptions,
) -> Result<Vec<Layout>, IrError> {
    if let Some(layout) = buffer.layout() {
        return Ok(vec![layout.clone()]);
    }
    let Some(hint) = options.layout_hints.get(&buffer.name).or(buffer.hint.as_ref()) else {
        let candidates = scope_candidates(buffer, &options.target);
        if candidates.is_empty() {
            return Err(IrError::InvalidFragment {
                reason: format!(
                    "`{}` ({} {:?}) fits no strip or matrix-unit fragment on {}",
                    buffer.name, buffer.dtype, buffer.shape, options.target.name
                ),
            });
        }
        return Ok(candidates);
    };
    let mismatch = |reason: String| IrError::LayoutMismatch {
        buffer: buffer.name.clone(),
        reason,
    };
    if hint.shape() != buffer.shape.as_slice() {
        return Err(mismatch(format!(
            "hint shape {:?} differs from buffer shape {:?}",
            hint.shape(),
            buffer.shape
        )));
    }
    match (hint, buffer.scope) {
        (Layout::Fragment(f), Scope::Fragment) => f.validate(&options.target)?,
        (Layout::Dense(_), scope) if scope.is_dense() => {}
        (_, scope) => return Err(mismatch(format!("hint {hint} does not suit a {scope} buffer"))),
    }
    Ok(vec![hint.clone()])
}

/// One side of a conflict: an op or the buffer's own declaration, with the
/// layouts it admits.
struct Side {
    op: Option<Handle<TileOp>>,
    admits: Vec<Layout>,
}

impl Side {
    fn describe(&self, kernel: &Kernel) -> String {
        let who = match self.op {
            Some(op) => format!("`{}`", kernel.op(op).name),
            None => "the declaration".to_string(),
        };
        format!("{who} admits {}", LayoutList(&self.admits))
    }
}

struct LayoutList<'a>(&'a [Layout]);

impl fmt::Display for LayoutList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const SHOWN: usize = 4;
        f.write_str("[")?;
        for (i, layout) in self.0.iter().take(SHOWN).enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{layout}")?;
        }
        if self.0.len() > SHOWN {
            write!(f, ", ... {} more", self.0.len() - SHOWN)?;
        }
        f.write_str("]")
    }
}

struct Conflict {
    buffer: Handle<Buffer>,
    /// The other operand of a relation that emptied the domain.
    partner: Option<Handle<Buffer>>,
    first: Side,
    second: Side,
}

type Domains = BTreeMap<Handle<Buffer>, Vec<Layout>>;

struct Solver<'a> {
    constraints: &'a [Constraint],
    initial: &'a Domains,
    domains: Domains,
}

impl<'a> Solver<'a> {
    fn new(constraints: &'a [Constraint], initial: &'a Domains) -> Self {
        Self {
            constraints,
            initial,
            domains: initial.clone(),
        }
    }

    fn solve(mut self) -> Result<BTreeMap<Handle<Buffer>, Layout>, Conflict> {
        for (i, c) in self.constraints.iter().enumerate() {
            if let Constraint::Unary {
                buffer,
                requirement,
                ..
            } = c
            {
                let domain = self.domains.entry(*buffer).or_default();
                domain.retain(|l| requirement.admits(l));
                if domain.is_empty() {
                    return Err(self.conflict(*buffer, i));
                }
            }
        }
        let all: Vec<usize> = (0..self.constraints.len()).collect();
        self.propagate(all)?;

        loop {
            let undecided = self
                .domains
                .iter()
                .filter(|(_, d)| d.len() > 1)
                .min_by_key(|&(&h, d)| (d.len(), h))
                .map(|(&h, _)| h);
            let Some(buffer) = undecided else { break };
            if let Some(domain) = self.domains.get_mut(&buffer) {
                domain.truncate(1);
            }
            let touching = self.arcs_touching(buffer, None);
            self.propagate(touching)?;
        }

        Ok(self
            .domains
            .into_iter()
            .filter_map(|(h, mut d)| d.pop().map(|l| (h, l)))
            .collect())
    }

    /// AC-3 over the binary constraints in `queue`.
    fn propagate(&mut self, queue: Vec<usize>) -> Result<(), Conflict> {
        let mut queue: VecDeque<usize> = queue.into();
        while let Some(i) = queue.pop_front() {
            let Constraint::Binary { a, b, relation, .. } = self.constraints[i] else {
                continue;
            };
            for (x, y) in [(a, b), (b, a)] {
                if self.revise(x, y, relation) {
                    if self.domains.get(&x).is_none_or(Vec::is_empty) {
                        return Err(self.conflict(x, i));
                    }
                    for j in self.arcs_touching(x, Some(i)) {
                        if !queue.contains(&j) {
                            queue.push_back(j);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Drops layouts of `x` without support in `y`. Returns whether `x` shrank.
    fn revise(&mut self, x: Handle<Buffer>, y: Handle<Buffer>, relation: Relation) -> bool {
        let support = self.domains.get(&y).cloned().unwrap_or_default();
        let Some(domain) = self.domains.get_mut(&x) else {
            return false;
        };
        let before = domain.len();
        domain.retain(|l| support.iter().any(|s| relation.holds(l, s)));
        domain.len() != before
    }

    fn arcs_touching(&self, buffer: Handle<Buffer>, except: Option<usize>) -> Vec<usize> {
        self.constraints
            .iter()
            .enumerate()
            .filter(|&(j, c)| Some(j) != except && matches!(c, Constraint::Binary { .. }) && c.touches(buffer))
            .map(|(j, _)| j)
            .collect()
    }

    /// Layouts of `buffer` that constraint `i` admits on its own.
    fn admitted(&self, i: usize, buffer: Handle<Buffer>) -> Vec<Layout> {
        let initial = self.initial.get(&buffer).cloned().unwrap_or_default();
        match &self.constraints[i] {
            Constraint::Unary { requirement, .. } => {
                initial.into_iter().filter(|l| requirement.admits(l)).collect()
            }
            Constraint::Binary { a, b, relation, .. } => {
                let other = if *a == buffer { *b } else { *a };
                let support = self.domains.get(&other).cloned().unwrap_or_default();
                initial
                    .into_iter()
                    .filter(|l| support.iter().any(|s| relation.holds(l, s)))
                    .collect()
            }
        }
    }

    /// Names the constraint `second` ran into: the earliest other
    /// constraint on the buffer admitting nothing `second` admits, else the
    /// latest one, else the declaration.
    fn conflict(&self, buffer: Handle<Buffer>, second: usize) -> Conflict {
        let admits = self.admitted(second, buffer);
        let others: Vec<usize> = (0..self.constraints.len())
            .filter(|&j| j != second && self.constraints[j].touches(buffer))
            .collect();
        let disjoint = others.iter().copied().find(|&j| {
            let theirs = self.admitted(j, buffer);
            !theirs.iter().any(|l| admits.contains(l))
        });
        let first = match disjoint.or(others.last().copied()) {
            Some(j) => Side {
                op: Some(self.constraints[j].op()),
                admits: self.admitted(j, buffer),
            },
            None => Side {
                op: None,
                admits: self.initial.get(&buffer).cloned().unwrap_or_default(),
            },
        };
        let partner = match self.constraints[second] {
            Constraint::Binary { a, b, .. } => Some(if a == buffer { b } else { a }),
            Constraint::Unary { .. } => None,
        };
        Conflict {
            buffer,
            partner,
            first,
            second: Side {
                op: Some(self.constraints[second].op()),
                admits,
            },
        }
    }
}

/// Attaches a layout to every buffer without one.
///
/// Returns the materializing copies inserted to resolve conflicts.
pub fn assign_layouts(
    kernel: &mut Kernel,
    options: &CompileOptions,
) -> Result<Vec<Handle<TileOp>>, CompileError> {
    let mut copies = Vec::new();
    let mut budget = kernel.live_ops().len();

    let assignment = loop {
        let def_use = DefUse::build(kernel);
        let mut initial = Domains::new();
        for (h, buffer) in kernel.buffers() {
            if copies.is_empty() && def_use.is_unused(h) {
                log::warn!("buffer `{}` is never accessed", buffer.name);
            }
            initial.insert(h, initial_domain(buffer, options)?);
        }
        let constraints: Vec<Constraint> = kernel
            .live_ops()
            .into_iter()
            .flat_map(|h| op_constraints(kernel, &options.target, h))
            .collect();

        match Solver::new(&constraints, &initial).solve() {
            Ok(assignment) => break assignment,
            Err(conflict) => {
                let mut candidates = vec![
                    (conflict.second.op, conflict.buffer),
                    (conflict.first.op, conflict.buffer),
                ];
                if let Some(partner) = conflict.partner {
                    candidates.push((conflict.second.op, partner));
                }
                let site = candidates
                    .into_iter()
                    .filter(|&(_, b)| options.layout_copies && !kernel.buffer(b).no_copy)
                    .find_map(|(op, b)| copy_site(kernel, op?, b))
                    .filter(|_| budget > 0);
                match site {
                    Some(site) => {
                        budget -= 1;
                        copies.push(materialize(kernel, site)?);
                    }
                    None => {
                        return Err(LayoutConflictError {
                            buffer: kernel.buffer(conflict.buffer).name.clone(),
                            first: conflict.first.describe(kernel),
                            second: conflict.second.describe(kernel),
                        }
                        .into());
                    }
                }
            }
        }
    };

    for (h, layout) in assignment {
        if kernel.buffer(h).layout().is_some() {
            continue;
        }
        log::debug!("layout of `{}`: {layout}", kernel.buffer(h).name);
        kernel.attach_layout(h, layout)?;
    }
    log::info!(
        "assigned layouts to {} buffers of `{}` ({} materializing copies)",
        kernel.buffer_count(),
        kernel.name,
        copies.len()
    );
    Ok(copies)
}

/// Where a materializing copy can decouple `op` from `buffer`.
#[derive(Clone, Copy)]
enum CopySite {
    /// `op` only reads `buffer`: copy into a fresh buffer before it.
    Reader(Handle<TileOp>, Handle<Buffer>),
    /// `op` only writes `buffer`: let it write a fresh buffer and copy after.
    Writer(Handle<TileOp>, Handle<Buffer>),
}

fn copy_site(kernel: &Kernel, h: Handle<TileOp>, buffer: Handle<Buffer>) -> Option<CopySite> {
    let b = kernel.buffer(buffer);
    if b.scope == Scope::Global {
        return None;
    }
    let op = kernel.op(h);
    let whole = |o: &Operand| o.buffer != buffer || (o.step.is_none() && !o.rotating);
    let reads = op.reads().any(|o| o.buffer == buffer);
    let writes = op.writes().any(|o| o.buffer == buffer);
    if reads && !writes && op.inputs.iter().all(whole) {
        return Some(CopySite::Reader(h, buffer));
    }
    if writes && !reads && op.outputs.iter().all(whole) {
        return Some(CopySite::Writer(h, buffer));
    }
    None
}

fn fresh_name(kernel: &Kernel, base: &str) -> String {
    (0..)
        .map(|n| format!("{base}_r{n}"))
        .find(|name| kernel.find_buffer(name).is_none())
        .unwrap_or_else(|| base.to_string())
}

fn relayout(name: String, src: Handle<Buffer>, dst: Handle<Buffer>) -> TileOp {
    TileOp::new(
        name,
        OpKind::Copy {
            vector: None,
            materialize: true,
        },
        vec![Operand::whole(src)],
        vec![Operand::whole(dst)],
    )
}

fn retarget(op: &TileOp, from: Handle<Buffer>, to: Handle<Buffer>) -> TileOp {
    let mut new = op.detached();
    for operand in new.inputs.iter_mut().chain(new.outputs.iter_mut()) {
        if operand.buffer == from {
            operand.buffer = to;
        }
    }
    new
}

/// Inserts one materializing copy. Returns the copy op.
fn materialize(kernel: &mut Kernel, site: CopySite) -> Result<Handle<TileOp>, IrError> {
    let (CopySite::Reader(op, buffer) | CopySite::Writer(op, buffer)) = site;
    let name = fresh_name(kernel, &kernel.buffer(buffer).name);
    let fresh = kernel.add_buffer(kernel.buffer(buffer).renamed(name.clone()))?;
    let copy_name = format!("relayout_{name}");
    let rewritten = retarget(kernel.op(op), buffer, fresh);

    let copy = match site {
        CopySite::Reader(..) => {
            let copy = kernel.insert_before(op, relayout(copy_name, buffer, fresh))?;
            let deps: Vec<_> = kernel.op(op).deps().collect();
            for dep in deps {
                kernel.add_dependency(copy, dep)?;
            }
            let new = kernel.replace_op(op, rewritten)?;
            kernel.add_dependency(new, copy)?;
            copy
        }
        CopySite::Writer(..) => {
            let new = kernel.replace_op(op, rewritten)?;
            let copy = kernel.insert_after(new, relayout(copy_name, fresh, buffer))?;
            kernel.redirect_dependents(new, copy);
            kernel.add_dependency(copy, new)?;
            copy
        }
    };
    log::debug!(
        "materializing `{}` -> `{name}` for `{}`",
        kernel.buffer(buffer).name,
        kernel.op(op).name
    );
    Ok(copy)
}

#[cfg(test)]
mod tests {
    use tilec_ir::{Literal, Scalar, dump_kernel};

    use super::*;

    fn declare(k: &mut Kernel, name: &str, shape: Vec<u32>, dtype: Scalar, scope: Scope) -> Handle<Buffer> {
        k.add_buffer(Buffer::new(name, shape, dtype, scope)).unwrap()
    }

    /// `a_frag <- a` then `acc += a_frag * s_b`, with `a_frag` of `rows` rows.
    fn register_operand(rows: u32, forbid: bool) -> Kernel {
        let mut k = Kernel::new("frag");
        let a = declare(&mut k, "a", vec![rows, 32], Scalar::F16, Scope::Global);
        let mut frag = Buffer::new("a_frag", vec![rows, 32], Scalar::F16, Scope::Fragment);
        if forbid {
            frag = frag.forbid_copies();
        }
        let a_frag = k.add_buffer(frag).unwrap();
        let s_b = declare(&mut k, "s_b", vec![32, 8], Scalar::F16, Scope::Shared);
        let acc = declare(&mut k, "acc", vec![rows, 8], Scalar::F32, Scope::Fragment);
        let load = k
            .add_op(TileOp::copy("load", Operand::whole(a), Operand::whole(a_frag)))
            .unwrap();
        let mma = k
            .add_op(TileOp::gemm("mma", Operand::whole(a_frag), Operand::whole(s_b), Operand::whole(acc)))
            .unwrap();
        k.push(load).unwrap();
        k.push(mma).unwrap();
        k.add_dependency(mma, load).unwrap();
        k
    }

    #[test]
    fn scope_defaults() {
        let t = TargetSpec::sm80();
        let g = Buffer::new("g", vec![4, 8], Scalar::F32, Scope::Global);
        assert_eq!(scope_candidates(&g, &t), vec![Layout::row_major(&[4, 8])]);
        let s = Buffer::new("s", vec![4, 8, 2], Scalar::F32, Scope::Shared);
        let c = scope_candidates(&s, &t);
        assert_eq!(c.len(), 6);
        assert_eq!(c[0], Layout::row_major(&[4, 8, 2]));
        let f = Buffer::new("f", vec![16, 16], Scalar::F16, Scope::Fragment);
        let kinds: Vec<_> = scope_candidates(&f, &t)
            .iter()
            .filter_map(|l| l.as_fragment().map(|f| f.kind))
            .collect();
        assert_eq!(
            kinds,
            [
                FragmentKind::Strip { vector: 8 },
                FragmentKind::Mma(MmaOperand::A),
                FragmentKind::Mma(MmaOperand::B),
                FragmentKind::Mma(MmaOperand::Accumulator),
            ]
        );
    }

    #[test]
    fn copy_into_registers_feeds_mma_directly_when_tiles_nest() {
        // A 16x32 f16 strip tile is 8x32, which no 16x16 operand tile divides.
        // A 16-column buffer gives a 16x16 strip tile.
        let mut k = Kernel::new("direct");
        let a = declare(&mut k, "a", vec![32, 16], Scalar::F16, Scope::Global);
        let a_frag = declare(&mut k, "a_frag", vec![32, 16], Scalar::F16, Scope::Fragment);
        let s_b = declare(&mut k, "s_b", vec![16, 8], Scalar::F16, Scope::Shared);
        let acc = declare(&mut k, "acc", vec![32, 8], Scalar::F32, Scope::Fragment);
        let load = k
            .add_op(TileOp::copy("load", Operand::whole(a), Operand::whole(a_frag)))
            .unwrap();
        let mma = k
            .add_op(TileOp::gemm("mma", Operand::whole(a_frag), Operand::whole(s_b), Operand::whole(acc)))
            .unwrap();
        k.push(load).unwrap();
        k.push(mma).unwrap();

        let copies = assign_layouts(&mut k, &CompileOptions::default()).unwrap();
        assert!(copies.is_empty());
        let frag = k.buffer(a_frag).layout().and_then(Layout::as_fragment).unwrap();
        assert_eq!(frag.kind, FragmentKind::Mma(MmaOperand::A));
        let acc_frag = k.buffer(acc).layout().and_then(Layout::as_fragment).unwrap();
        assert_eq!(acc_frag.kind, FragmentKind::Mma(MmaOperand::Accumulator));
        assert_eq!(k.buffer(s_b).layout(), Some(&Layout::row_major(&[16, 8])));
    }

    #[test]
    fn unplaceable_fragment_is_reported_before_any_copy() {
        for copy in [false, true] {
            let mut k = Kernel::new("odd");
            let g = declare(&mut k, "g", vec![8, 12], Scalar::F32, Scope::Global);
            let f = declare(&mut k, "f", vec![8, 12], Scalar::F32, Scope::Fragment);
            let writer = if copy {
                TileOp::copy("load", Operand::whole(g), Operand::whole(f))
            } else {
                TileOp::fill("clear", Literal::Float(0.0), Operand::whole(f))
            };
            let h = k.add_op(writer).unwrap();
            k.push(h).unwrap();

            let err = assign_layouts(&mut k, &CompileOptions::default()).unwrap_err();
            let CompileError::Ir(IrError::InvalidFragment { reason }) = err else {
                panic!("expected an invalid fragment, got {err}");
            };
            assert!(reason.contains("`f`"), "{reason}");
            assert!(k.find_buffer("f_r0").is_none());
            assert_eq!(k.live_ops(), [h]);
        }
    }

    #[test]
    fn incompatible_fragment_gets_a_materializing_copy() {
        let mut k = register_operand(16, false);
        let copies = assign_layouts(&mut k, &CompileOptions::default()).unwrap();
        assert_eq!(copies.len(), 1);
        assert!(matches!(
            k.op(copies[0]).kind,
            OpKind::Copy {
                materialize: true,
                ..
            }
        ));

        let a_frag = k.find_buffer("a_frag").unwrap();
        let fresh = k.find_buffer("a_frag_r0").unwrap();
        let strip = k.buffer(a_frag).layout().and_then(Layout::as_fragment).unwrap();
        assert!(matches!(strip.kind, FragmentKind::Strip { .. }));
        let mma = k.buffer(fresh).layout().and_then(Layout::as_fragment).unwrap();
        assert_eq!(mma.kind, FragmentKind::Mma(MmaOperand::A));

        let names: Vec<_> = k.live_ops().iter().map(|&h| k.op(h).name.clone()).collect();
        assert_eq!(names, ["load", "relayout_a_frag_r0", "mma"]);
        k.validate().unwrap();
        k.check_resolved().unwrap();
    }

    #[test]
    fn forbidden_copy_reports_conflict() {
        for (forbid, layout_copies) in [(true, true), (false, false)] {
            let mut k = register_operand(16, forbid);
            let options = CompileOptions {
                layout_copies,
                ..CompileOptions::default()
            };
            let err = assign_layouts(&mut k, &options).unwrap_err();
            let CompileError::LayoutConflict(e) = err else {
                panic!("expected a layout conflict, got {err}");
            };
            assert_eq!(e.buffer, "a_frag");
            assert!(e.first.starts_with("`load` admits [frag.strip"), "{}", e.first);
            assert!(e.second.starts_with("`mma` admits [frag.mma_a"), "{}", e.second);
        }
    }

    #[test]
    fn shared_staging_follows_global_contiguity() {
        let mut k = Kernel::new("stage");
        let g = declare(&mut k, "g", vec![16, 64], Scalar::F32, Scope::Global);
        let s = declare(&mut k, "s", vec![16, 64], Scalar::F32, Scope::Shared);
        let load = k
            .add_op(TileOp::copy("load", Operand::whole(g), Operand::whole(s)))
            .unwrap();
        k.push(load).unwrap();
        assign_layouts(&mut k, &CompileOptions::default()).unwrap();
        assert_eq!(k.buffer(s).layout(), Some(&Layout::row_major(&[16, 64])));
    }

    #[test]
    fn hinted_writer_gets_a_copy_after_it() {
        let mut k = Kernel::new("hinted");
        let g = declare(&mut k, "g", vec![16, 64], Scalar::F32, Scope::Global);
        let s = k
            .add_buffer(
                Buffer::new("s", vec![16, 64], Scalar::F32, Scope::Shared)
                    .with_hint(Layout::Dense(DenseLayout::col_major(&[16, 64]))),
            )
            .unwrap();
        let out = declare(&mut k, "out", vec![16, 64], Scalar::F32, Scope::Local);
        let load = k
            .add_op(TileOp::copy("load", Operand::whole(g), Operand::whole(s)))
            .unwrap();
        let fill = k
            .add_op(TileOp::fill("fill", Literal::Float(0.0), Operand::whole(out)))
            .unwrap();
        k.push(load).unwrap();
        k.push(fill).unwrap();

        let copies = assign_layouts(&mut k, &CompileOptions::default()).unwrap();
        assert_eq!(copies.len(), 1);
        let staged = k.find_buffer("s_r0").unwrap();
        assert_eq!(k.buffer(staged).layout(), Some(&Layout::row_major(&[16, 64])));
        assert_eq!(
            k.buffer(s).layout(),
            Some(&Layout::Dense(DenseLayout::col_major(&[16, 64])))
        );
        let names: Vec<_> = k.live_ops().iter().map(|&h| k.op(h).name.clone()).collect();
        assert_eq!(names, ["load", "relayout_s_r0", "fill"]);
    }

    #[test]
    fn hint_of_wrong_kind_is_rejected() {
        let mut k = Kernel::new("bad");
        declare(&mut k, "s", vec![16, 16], Scalar::F16, Scope::Shared);
        let frag = Fragment::mma(MmaOperand::A, [16, 16], &TargetSpec::sm80()).unwrap();
        let mut options = CompileOptions::default();
        options.layout_hints.insert("s".into(), Layout::Fragment(frag));
        let err = assign_layouts(&mut k, &options).unwrap_err();
        assert!(matches!(err, CompileError::Ir(IrError::LayoutMismatch { .. })));
    }

    #[test]
    fn assignment_is_deterministic() {
        let run = || {
            let mut k = register_operand(16, false);
            assign_layouts(&mut k, &CompileOptions::default()).unwrap();
            dump_kernel(&k)
        };
        assert_eq!(run(), run());
    }
}
