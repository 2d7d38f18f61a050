//! The kernel: the single owning arena of a compilation.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::arena::{Arena, Handle};
use crate::buffer::{Buffer, Scope};
use crate::error::IrError;
use crate::layout::Layout;
use crate::op::{OpKind, Operand, SchedInfo, TileOp};
use crate::swizzle::Swizzle;

/// A top-level statement of the kernel body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stmt {
    Op(Handle<TileOp>),
    Loop(Handle<LoopNest>),
}

/// A counted loop whose body is a straight-line list of tile ops.
#[derive(Clone, Debug)]
pub struct LoopNest {
    pub name: String,
    /// Trip count.
    pub extent: u32,
    /// Declared pipeline depth.
    pub depth: Option<u32>,
    pub(crate) body: Vec<Handle<TileOp>>,
    pub(crate) expansion: Option<Pipelined>,
}

impl LoopNest {
    pub fn new(name: impl Into<String>, extent: u32) -> Self {
        Self {
            name: name.into(),
            extent,
            depth: None,
            body: Vec::new(),
            expansion: None,
        }
    }

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = Some(depth);
        self
    }

    /// The original iteration body.
    pub fn body(&self) -> &[Handle<TileOp>] {
        &self.body
    }

    /// The prologue/steady/epilogue rewrite, once scheduled.
    pub fn expansion(&self) -> Option<&Pipelined> {
        self.expansion.as_ref()
    }
}

/// A software-pipelined loop.
///
/// The steady block runs `steady_trips` times with counter `i`; its ops
/// carry [`IterRef::Relative`](crate::IterRef) iterations. Prologue and
/// epilogue ops run once with absolute iterations.
#[derive(Clone, Debug)]
pub struct Pipelined {
    pub depth: u32,
    pub steady_trips: u32,
    pub prologue: Vec<Handle<TileOp>>,
    pub steady: Vec<Handle<TileOp>>,
    pub epilogue: Vec<Handle<TileOp>>,
    pub rings: Vec<Ring>,
}

impl Pipelined {
    pub fn ring_of(&self, buffer: Handle<Buffer>) -> Option<&Ring> {
        self.rings.iter().find(|r| r.logical == buffer)
    }
}

/// Rotating physical instances of one staged buffer. Instance 0 is the
/// logical buffer itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ring {
    pub logical: Handle<Buffer>,
    pub instances: Vec<Handle<Buffer>>,
}

impl Ring {
    /// Instance used by source iteration `iteration`.
    pub fn instance(&self, iteration: u32) -> Handle<Buffer> {
        if self.instances.is_empty() {
            return self.logical;
        }
        self.instances[iteration as usize % self.instances.len()]
    }
}

/// Where an op is placed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Block {
    Body,
    Loop(Handle<LoopNest>),
    Prologue(Handle<LoopNest>),
    Steady(Handle<LoopNest>),
    Epilogue(Handle<LoopNest>),
}

impl Block {
    pub fn loop_nest(self) -> Option<Handle<LoopNest>> {
        match self {
            Block::Body => None,
            Block::Loop(l) | Block::Prologue(l) | Block::Steady(l) | Block::Epilogue(l) => Some(l),
        }
    }
}

/// A tile kernel.
///
/// Buffers, ops and loops live in arenas owned by the kernel and refer to
/// each other through handles. Stages annotate the kernel in place.
#[derive(Clone, Debug, Default)]
pub struct Kernel {
    pub name: String,
    buffers: Arena<Buffer>,
    ops: Arena<TileOp>,
    loops: Arena<LoopNest>,
    body: Vec<Stmt>,
    removed: BTreeSet<Handle<TileOp>>,
}

impl Kernel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    // -- buffers ---------------------------------------------------------

    pub fn add_buffer(&mut self, buffer: Buffer) -> Result<Handle<Buffer>, IrError> {
        let invalid = |reason: &str| IrError::InvalidBuffer {
            name: buffer.name.clone(),
            reason: reason.into(),
        };
        if self.find_buffer(&buffer.name).is_some() {
            return Err(invalid("name already declared"));
        }
        if buffer.shape.is_empty() || buffer.shape.contains(&0) {
            return Err(invalid("shape must be non-empty with non-zero extents"));
        }
        if buffer.scope == Scope::Fragment && buffer.rank() != 2 {
            return Err(invalid("fragment buffers must be rank 2"));
        }
        if let Some(hint) = &buffer.hint {
            if hint.shape() != buffer.shape.as_slice() {
                return Err(invalid("layout hint shape differs from buffer shape"));
            }
        }
        Ok(self.buffers.append(buffer))
    }

    pub fn buffer(&self, handle: Handle<Buffer>) -> &Buffer {
        &self.buffers[handle]
    }

    pub fn buffers(&self) -> impl Iterator<Item = (Handle<Buffer>, &Buffer)> {
        self.buffers.iter()
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn find_buffer(&self, name: &str) -> Option<Handle<Buffer>> {
        self.buffers
            .iter()
            .find(|(_, b)| b.name == name)
            .map(|(h, _)| h)
    }

    /// Attaches the buffer's one and only layout.
    pub fn attach_layout(&mut self, handle: Handle<Buffer>, layout: Layout) -> Result<(), IrError> {
        let buffer = self.try_buffer(handle)?;
        let mismatch = |reason: String| IrError::LayoutMismatch {
            buffer: buffer.name.clone(),
            reason,
        };
        if buffer.layout.is_some() {
            return Err(IrError::LayoutAlreadyAttached {
                buffer: buffer.name.clone(),
            });
        }
        if layout.shape() != buffer.shape.as_slice() {
            return Err(mismatch(format!(
                "layout shape {:?} differs from buffer shape {:?}",
                layout.shape(),
                buffer.shape
            )));
        }
        match (&layout, buffer.scope) {
            (Layout::Fragment(_), scope) if scope != Scope::Fragment => {
                return Err(mismatch(format!("fragment layout on {scope:?} buffer")));
            }
            (Layout::Dense(_), Scope::Fragment) => {
                return Err(mismatch("dense layout on a register fragment".into()));
            }
            _ => {}
        }
        self.buffers[handle].layout = Some(layout);
        Ok(())
    }

    /// Attaches a swizzle to a shared buffer with a dense layout.
    pub fn attach_swizzle(&mut self, handle: Handle<Buffer>, swizzle: Swizzle) -> Result<(), IrError> {
        let buffer = self.try_buffer(handle)?;
        let mismatch = |reason: &str| IrError::SwizzleMismatch {
            buffer: buffer.name.clone(),
            reason: reason.into(),
        };
        if buffer.scope != Scope::Shared {
            return Err(mismatch("only shared buffers are swizzled"));
        }
        if buffer.swizzle.is_some() {
            return Err(mismatch("a swizzle is already attached"));
        }
        match &buffer.layout {
            None => {
                return Err(IrError::Unresolved {
                    buffer: buffer.name.clone(),
                });
            }
            Some(Layout::Fragment(_)) => return Err(mismatch("layout is not dense")),
            Some(Layout::Dense(_)) => {}
        }
        if !swizzle.is_bijective_on(buffer.elements()) {
            return Err(mismatch("permutation leaves the allocation"));
        }
        self.buffers[handle].swizzle = Some(swizzle);
        Ok(())
    }

    fn try_buffer(&self, handle: Handle<Buffer>) -> Result<&Buffer, IrError> {
        self.buffers.try_get(handle).ok_or(IrError::BadHandle {
            kind: "buffer",
            index: handle.index(),
            size: self.buffers.len(),
        })
    }

    fn check_op(&self, handle: Handle<TileOp>) -> Result<&TileOp, IrError> {
        self.ops.try_get(handle).ok_or(IrError::BadHandle {
            kind: "op",
            index: handle.index(),
            size: self.ops.len(),
        })
    }

    // -- ops and placement -----------------------------------------------

    /// Adds an unplaced op after checking its operands.
    pub fn add_op(&mut self, op: TileOp) -> Result<Handle<TileOp>, IrError> {
        self.check_operands(&op)?;
        for dep in op.deps() {
            self.check_op(dep)?;
        }
        Ok(self.ops.append(op))
    }

    pub fn op(&self, handle: Handle<TileOp>) -> &TileOp {
        &self.ops[handle]
    }

    /// Every op ever added, including removed ones.
    pub fn ops(&self) -> impl Iterator<Item = (Handle<TileOp>, &TileOp)> {
        self.ops.iter()
    }

    /// Appends an op to the top-level body.
    pub fn push(&mut self, op: Handle<TileOp>) -> Result<(), IrError> {
        self.check_unplaced(op)?;
        self.body.push(Stmt::Op(op));
        Ok(())
    }

    /// Appends a loop to the top-level body.
    pub fn push_loop(&mut self, nest: LoopNest) -> Result<Handle<LoopNest>, IrError> {
        if nest.extent == 0 || nest.depth == Some(0) {
            return Err(IrError::InvalidLoop {
                name: nest.name,
                reason: "extent and depth must be at least 1".into(),
            });
        }
        if !nest.body.is_empty() || nest.expansion.is_some() {
            return Err(IrError::InvalidLoop {
                name: nest.name,
                reason: "ops are added through push_to_loop".into(),
            });
        }
        let handle = self.loops.append(nest);
        self.body.push(Stmt::Loop(handle));
        Ok(handle)
    }

    /// Appends an op to a loop's iteration body.
    pub fn push_to_loop(&mut self, nest: Handle<LoopNest>, op: Handle<TileOp>) -> Result<(), IrError> {
        self.check_unplaced(op)?;
        let lp = self.loops.try_get(nest).ok_or(IrError::BadHandle {
            kind: "loop",
            index: nest.index(),
            size: self.loops.len(),
        })?;
        if lp.expansion.is_some() {
            return Err(IrError::InvalidLoop {
                name: lp.name.clone(),
                reason: "loop is already pipelined".into(),
            });
        }
        self.loops[nest].body.push(op);
        Ok(())
    }

    fn check_unplaced(&self, op: Handle<TileOp>) -> Result<(), IrError> {
        let o = self.check_op(op)?;
        if self.placement(op).is_some() || self.removed.contains(&op) {
            return Err(IrError::Operands {
                op: o.name.clone(),
                reason: "op is already placed".into(),
            });
        }
        Ok(())
    }

    pub fn body(&self) -> &[Stmt] {
        &self.body
    }

    pub fn loops(&self) -> impl Iterator<Item = (Handle<LoopNest>, &LoopNest)> {
        self.loops.iter()
    }

    pub fn loop_nest(&self, handle: Handle<LoopNest>) -> &LoopNest {
        &self.loops[handle]
    }

    /// The block an op currently sits in, if it is live.
    pub fn placement(&self, op: Handle<TileOp>) -> Option<Block> {
        if self.removed.contains(&op) {
            return None;
        }
        for stmt in &self.body {
            match *stmt {
                Stmt::Op(h) if h == op => return Some(Block::Body),
                Stmt::Op(_) => {}
                Stmt::Loop(l) => {
                    let nest = &self.loops[l];
                    match &nest.expansion {
                        Some(p) => {
                            if p.prologue.contains(&op) {
                                return Some(Block::Prologue(l));
                            }
                            if p.steady.contains(&op) {
                                return Some(Block::Steady(l));
                            }
                            if p.epilogue.contains(&op) {
                                return Some(Block::Epilogue(l));
                            }
                        }
                        None if nest.body.contains(&op) => return Some(Block::Loop(l)),
                        None => {}
                    }
                }
            }
        }
        None
    }

    pub fn is_live(&self, op: Handle<TileOp>) -> bool {
        self.placement(op).is_some()
    }

    /// Live ops in program order. Pipelined loops contribute their
    /// prologue, steady and epilogue blocks.
    pub fn live_ops(&self) -> Vec<Handle<TileOp>> {
        let mut out = Vec::new();
        for stmt in &self.body {
            match *stmt {
                Stmt::Op(h) => out.push(h),
                Stmt::Loop(l) => {
                    let nest = &self.loops[l];
                    match &nest.expansion {
                        Some(p) => {
                            out.extend(&p.prologue);
                            out.extend(&p.steady);
                            out.extend(&p.epilogue);
                        }
                        None => out.extend(&nest.body),
                    }
                }
            }
        }
        out.retain(|h| !self.removed.contains(h));
        out
    }

    fn block_ops_mut(&mut self, block: Block) -> Option<&mut Vec<Handle<TileOp>>> {
        match block {
            Block::Body => None,
            Block::Loop(l) => Some(&mut self.loops[l].body),
            Block::Prologue(l) => self.loops[l].expansion.as_mut().map(|p| &mut p.prologue),
            Block::Steady(l) => self.loops[l].expansion.as_mut().map(|p| &mut p.steady),
            Block::Epilogue(l) => self.loops[l].expansion.as_mut().map(|p| &mut p.epilogue),
        }
    }

    fn not_placed(&self, op: Handle<TileOp>) -> IrError {
        IrError::NotPlaced {
            op: self.ops[op].name.clone(),
        }
    }

    /// Places a new op immediately before `anchor`, in the same block.
    /// The new op inherits the anchor's scheduling metadata.
    pub fn insert_before(&mut self, anchor: Handle<TileOp>, op: TileOp) -> Result<Handle<TileOp>, IrError> {
        self.check_op(anchor)?;
        let block = self.placement(anchor).ok_or_else(|| self.not_placed(anchor))?;
        let mut op = op;
        if op.sched.is_none() {
            op.sched = self.ops[anchor].sched;
        }
        let handle = self.add_op(op)?;
        match self.block_ops_mut(block) {
            Some(list) => {
                let pos = list.iter().position(|&h| h == anchor).unwrap_or(0);
                list.insert(pos, handle);
            }
            None => {
                let pos = self
                    .body
                    .iter()
                    .position(|s| *s == Stmt::Op(anchor))
                    .unwrap_or(0);
                self.body.insert(pos, Stmt::Op(handle));
            }
        }
        Ok(handle)
    }

    /// Places a new op immediately after `anchor`, in the same block.
    /// The new op inherits the anchor's scheduling metadata.
    pub fn insert_after(&mut self, anchor: Handle<TileOp>, op: TileOp) -> Result<Handle<TileOp>, IrError> {
        self.check_op(anchor)?;
        let block = self.placement(anchor).ok_or_else(|| self.not_placed(anchor))?;
        let mut op = op;
        if op.sched.is_none() {
            op.sched = self.ops[anchor].sched;
        }
        let handle = self.add_op(op)?;
        match self.block_ops_mut(block) {
            Some(list) => {
                let pos = list.iter().position(|&h| h == anchor).map_or(list.len(), |p| p + 1);
                list.insert(pos, handle);
            }
            None => {
                let pos = self
                    .body
                    .iter()
                    .position(|s| *s == Stmt::Op(anchor))
                    .map_or(self.body.len(), |p| p + 1);
                self.body.insert(pos, Stmt::Op(handle));
            }
        }
        Ok(handle)
    }

    /// Replaces `old` by `op` in place.
    ///
    /// The replacement takes over `old`'s dependencies, dependents and
    /// scheduling metadata; `old` is removed.
    pub fn replace_op(&mut self, old: Handle<TileOp>, op: TileOp) -> Result<Handle<TileOp>, IrError> {
        self.check_op(old)?;
        let block = self.placement(old).ok_or_else(|| self.not_placed(old))?;
        self.check_operands(&op)?;
        let mut op = op;
        op.deps = self.ops[old].deps.clone();
        op.sched = self.ops[old].sched;
        let new = self.ops.append(op);
        self.redirect_dependents(old, new);
        match self.block_ops_mut(block) {
            Some(list) => {
                for h in list.iter_mut().filter(|h| **h == old) {
                    *h = new;
                }
            }
            None => {
                for s in self.body.iter_mut().filter(|s| **s == Stmt::Op(old)) {
                    *s = Stmt::Op(new);
                }
            }
        }
        self.removed.insert(old);
        Ok(new)
    }

    /// Removes a live op. Its dependents inherit its dependencies.
    pub fn remove_op(&mut self, op: Handle<TileOp>) -> Result<(), IrError> {
        self.check_op(op)?;
        let block = self.placement(op).ok_or_else(|| self.not_placed(op))?;
        let inherited = self.ops[op].deps.clone();
        for dependent in self.dependents(op) {
            let deps = &mut self.ops[dependent].deps;
            deps.remove(&op);
            deps.extend(inherited.iter().copied());
        }
        match self.block_ops_mut(block) {
            Some(list) => list.retain(|&h| h != op),
            None => self.body.retain(|s| *s != Stmt::Op(op)),
        }
        self.removed.insert(op);
        Ok(())
    }

    /// Ops (not removed) that depend on `op`.
    pub fn dependents(&self, op: Handle<TileOp>) -> Vec<Handle<TileOp>> {
        self.ops
            .iter()
            .filter(|(h, o)| !self.removed.contains(h) && o.deps.contains(&op))
            .map(|(h, _)| h)
            .collect()
    }

    /// Makes every dependent of `from` depend on `to` instead.
    ///
    /// `to` must not itself depend on any of those dependents.
    pub fn redirect_dependents(&mut self, from: Handle<TileOp>, to: Handle<TileOp>) {
        for dependent in self.dependents(from) {
            if dependent == to {
                continue;
            }
            let deps = &mut self.ops[dependent].deps;
            deps.remove(&from);
            deps.insert(to);
        }
    }

    /// Attaches scheduling metadata. Ops are scheduled at most once.
    pub fn set_sched(&mut self, op: Handle<TileOp>, info: SchedInfo) -> Result<(), IrError> {
        let o = self.check_op(op)?;
        if o.sched.is_some() {
            return Err(IrError::OpFrozen { op: o.name.clone() });
        }
        self.ops[op].sched = Some(info);
        Ok(())
    }

    /// Installs the pipelined rewrite of a loop. The original body ops are
    /// removed; their outside dependents are left for the caller to redirect.
    pub fn set_expansion(&mut self, nest: Handle<LoopNest>, pipelined: Pipelined) -> Result<(), IrError> {
        let lp = &self.loops[nest];
        if lp.expansion.is_some() || pipelined.depth == 0 {
            return Err(IrError::InvalidLoop {
                name: lp.name.clone(),
                reason: "loop is already pipelined or depth is 0".into(),
            });
        }
        for &op in pipelined
            .prologue
            .iter()
            .chain(&pipelined.steady)
            .chain(&pipelined.epilogue)
        {
            self.check_unplaced(op)?;
        }
        let original = lp.body.clone();
        self.removed.extend(original);
        self.loops[nest].expansion = Some(pipelined);
        Ok(())
    }

    // -- dependencies ----------------------------------------------------

    /// Records that `op` must run after `on`. Rejects edges closing a cycle.
    pub fn add_dependency(&mut self, op: Handle<TileOp>, on: Handle<TileOp>) -> Result<(), IrError> {
        self.check_op(op)?;
        self.check_op(on)?;
        if self.depends_on(on, op) {
            return Err(IrError::DependencyCycle {
                op: self.ops[op].name.clone(),
                on: self.ops[on].name.clone(),
            });
        }
        self.ops[op].deps.insert(on);
        Ok(())
    }

    /// Whether `op` transitively depends on `target` (or is `target`).
    pub fn depends_on(&self, op: Handle<TileOp>, target: Handle<TileOp>) -> bool {
        let mut stack = vec![op];
        let mut seen = HashSet::new();
        while let Some(h) = stack.pop() {
            if h == target {
                return true;
            }
            if seen.insert(h) {
                stack.extend(self.ops[h].deps.iter().copied());
            }
        }
        false
    }

    /// Live ops in dependency order (Kahn's algorithm, ties by handle).
    pub fn topological_order(&self) -> Result<Vec<Handle<TileOp>>, IrError> {
        let live: BTreeSet<_> = self.live_ops().into_iter().collect();
        let mut in_degree: BTreeMap<Handle<TileOp>, usize> = BTreeMap::new();
        let mut users: BTreeMap<Handle<TileOp>, Vec<Handle<TileOp>>> = BTreeMap::new();
        for &h in &live {
            let deps: Vec<_> = self.ops[h].deps().filter(|d| live.contains(d)).collect();
            in_degree.insert(h, deps.len());
            for d in deps {
                users.entry(d).or_default().push(h);
            }
        }

        let mut ready: BTreeSet<_> = in_degree
            .iter()
            .filter(|&(_, &n)| n == 0)
            .map(|(&h, _)| h)
            .collect();
        let mut order = Vec::with_capacity(live.len());
        while let Some(h) = ready.pop_first() {
            order.push(h);
            for &user in users.get(&h).into_iter().flatten() {
                if let Some(n) = in_degree.get_mut(&user) {
                    *n -= 1;
                    if *n == 0 {
                        ready.insert(user);
                    }
                }
            }
        }

        if order.len() != live.len() {
            return Err(IrError::Cycle {
                visited: order.len(),
                total: live.len(),
            });
        }
        Ok(order)
    }

    // -- checks ----------------------------------------------------------

    /// Checks operand shapes and scopes for an op's kind.
    pub fn check_operands(&self, op: &TileOp) -> Result<(), IrError> {
        let fail = |reason: String| IrError::Operands {
            op: op.name.clone(),
            reason,
        };
        let (ni, no) = op.kind.arity();
        if op.inputs.len() != ni || op.outputs.len() != no {
            return Err(fail(format!(
                "expected {ni} inputs and {no} outputs, got {} and {}",
                op.inputs.len(),
                op.outputs.len()
            )));
        }
        for operand in op.inputs.iter().chain(&op.outputs) {
            let buffer = self.try_buffer(operand.buffer)?;
            if let Some(step) = operand.step {
                let fits = buffer
                    .shape
                    .get(step.axis)
                    .is_some_and(|&n| step.extent > 0 && n % step.extent == 0);
                if !fits {
                    return Err(fail(format!(
                        "window {}@{} does not tile `{}`",
                        step.extent, step.axis, buffer.name
                    )));
                }
            }
        }

        let shape = |o: &Operand| o.tile_shape(&self.buffers[o.buffer]);
        let buf = |o: &Operand| &self.buffers[o.buffer];
        match &op.kind {
            OpKind::Copy { .. } => {
                let (src, dst) = (&op.inputs[0], &op.outputs[0]);
                if src.buffer == dst.buffer {
                    return Err(fail("copy onto itself".into()));
                }
                if buf(src).dtype != buf(dst).dtype {
                    return Err(fail("copy changes element type; use a cast".into()));
                }
                if shape(src) != shape(dst) {
                    return Err(fail(format!(
                        "tile {:?} copied into {:?}",
                        shape(src),
                        shape(dst)
                    )));
                }
            }
            OpKind::Cast | OpKind::Atomic { .. } => {
                let (src, dst) = (&op.inputs[0], &op.outputs[0]);
                if shape(src) != shape(dst) {
                    return Err(fail(format!("shapes {:?} and {:?} differ", shape(src), shape(dst))));
                }
                if matches!(op.kind, OpKind::Atomic { .. })
                    && !matches!(buf(dst).scope, Scope::Global | Scope::Shared)
                {
                    return Err(fail("atomic destination must be global or shared".into()));
                }
            }
            OpKind::Elementwise { .. } => {
                let out = shape(&op.outputs[0]);
                if op.inputs.iter().any(|i| shape(i) != out) {
                    return Err(fail("operand shapes differ".into()));
                }
            }
            OpKind::Reduce { axis, .. } => {
                let input = shape(&op.inputs[0]);
                let out = shape(&op.outputs[0]);
                if *axis >= input.len() {
                    return Err(fail(format!("axis {axis} out of range")));
                }
                let mut dropped = input.clone();
                dropped.remove(*axis);
                let mut kept = input.clone();
                kept[*axis] = 1;
                let ok = out == dropped || out == kept || (dropped.is_empty() && out == [1]);
                if !ok {
                    return Err(fail(format!("cannot reduce {input:?} along {axis} into {out:?}")));
                }
            }
            OpKind::Gemm { .. } => {
                let (a, b, c) = (shape(&op.inputs[0]), shape(&op.inputs[1]), shape(&op.outputs[0]));
                let ok = a.len() == 2
                    && b.len() == 2
                    && c.len() == 2
                    && a[1] == b[0]
                    && a[0] == c[0]
                    && b[1] == c[1];
                if !ok {
                    return Err(fail(format!("{a:?} x {b:?} does not produce {c:?}")));
                }
                if buf(&op.outputs[0]).scope != Scope::Fragment {
                    return Err(fail("accumulator must be a register fragment".into()));
                }
                for input in &op.inputs {
                    if !matches!(buf(input).scope, Scope::Shared | Scope::Fragment) {
                        return Err(fail(format!(
                            "operand `{}` must be shared or a fragment",
                            buf(input).name
                        )));
                    }
                }
            }
            OpKind::Fill { .. } | OpKind::Barrier(_) => {}
        }
        Ok(())
    }

    /// Checks the whole kernel: operands, acyclicity, program order and
    /// loop windows.
    pub fn validate(&self) -> Result<(), IrError> {
        let live = self.live_ops();
        for &h in &live {
            self.check_operands(&self.ops[h])?;
        }
        self.topological_order()?;

        let position: BTreeMap<_, _> = live.iter().enumerate().map(|(i, &h)| (h, i)).collect();
        for &h in &live {
            for dep in self.ops[h].deps() {
                let before = position.get(&dep).is_none_or(|&p| p < position[&h]);
                if !before {
                    return Err(IrError::DependencyOrder {
                        op: self.ops[h].name.clone(),
                        on: self.ops[dep].name.clone(),
                    });
                }
            }
        }

        for (_, nest) in self.loops.iter() {
            for &h in &nest.body {
                let op = &self.ops[h];
                for operand in op.inputs.iter().chain(&op.outputs) {
                    let Some(step) = operand.step else { continue };
                    let buffer = &self.buffers[operand.buffer];
                    if u64::from(step.extent) * u64::from(nest.extent)
                        > u64::from(buffer.shape[step.axis])
                    {
                        return Err(IrError::InvalidLoop {
                            name: nest.name.clone(),
                            reason: format!(
                                "{} windows of {} overrun `{}` along axis {}",
                                nest.extent, step.extent, buffer.name, step.axis
                            ),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Checks that every buffer carries a layout.
    pub fn check_resolved(&self) -> Result<(), IrError> {
        for (_, buffer) in self.buffers.iter() {
            if buffer.layout.is_none() {
                return Err(IrError::Unresolved {
                    buffer: buffer.name.clone(),
                });
            }
        }
        Ok(())
    }
}
