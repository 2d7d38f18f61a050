//! Lowering stages for tile kernels.
//!
//! [`lower`] runs the fixed pipeline over a [`Kernel`] in place:
//!
//! 1. [`assign_layouts`] attaches one layout to every buffer, inserting
//!    materializing copies where two ops disagree;
//! 2. [`optimize_swizzles`] attaches bank-conflict-free permutations to
//!    shared buffers;
//! 3. [`pipeline_loops`] rewrites annotated loops into prologue, steady state
//!    and epilogue with rotating buffer instances;
//! 4. the [`PassManager`] runs store-granularity correction, type decoupling
//!    and simplification, in that order. Shared buffers the passes create are
//!    swizzled afterwards like any other.

mod decouple;
mod error;
pub mod layout;
pub mod pipeline;
mod simplify;
mod store;
pub mod swizzle;

pub use decouple::TypeDecoupling;
pub use error::{
    CompileError, DependencyViolation, LayoutConflictError, PipelineDependencyError,
    SwizzleInfeasibleError,
};
pub use layout::assign_layouts;
pub use pipeline::{pipeline_loop, pipeline_loops};
pub use simplify::Simplify;
pub use store::StoreGranularity;
pub use swizzle::{SwizzleFamily, optimize_new_swizzles, optimize_swizzles};

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;

use tilec_ir::{IrError, Kernel, Layout, TargetSpec};

/// A rewrite over a layout- and schedule-resolved kernel.
pub trait Pass: Debug {
    /// Human-readable name of the pass.
    fn name(&self) -> &str;

    /// Runs the pass once. Returns `true` if anything was modified.
    fn run(&self, kernel: &mut Kernel) -> Result<bool, IrError>;

    /// Whether the manager reruns the pass until it stops changing the
    /// kernel. Passes opting in must document why one round is not enough.
    fn repeat_until_stable(&self) -> bool {
        false
    }
}

/// Maximum number of rounds of a repeat-until-stable pass.
const MAX_ITERATIONS: usize = 10;

/// Runs passes in a fixed order, each exactly once unless it opts into
/// repetition.
#[derive(Debug)]
pub struct PassManager {
    passes: Vec<Box<dyn Pass>>,
}

impl Default for PassManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PassManager {
    /// Creates an empty pass manager with no passes.
    pub fn new() -> Self {
        Self { passes: Vec::new() }
    }

    /// Store-granularity correction, type decoupling, simplification.
    pub fn standard(target: &TargetSpec) -> Self {
        let mut pm = Self::new();
        pm.add_pass(Box::new(StoreGranularity::new(target.clone())));
        pm.add_pass(Box::new(TypeDecoupling));
        pm.add_pass(Box::new(Simplify));
        pm
    }

    /// Adds a pass to the end of the order.
    pub fn add_pass(&mut self, pass: Box<dyn Pass>) {
        self.passes.push(pass);
    }

    pub fn pass_names(&self) -> Vec<&str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    /// Runs every pass in order. Returns `true` if any pass changed the kernel.
    ///
    /// Stops at the first pass that fails.
    pub fn run(&self, kernel: &mut Kernel) -> Result<bool, IrError> {
        let mut changed = false;
        for pass in &self.passes {
            let rounds = if pass.repeat_until_stable() {
                MAX_ITERATIONS
            } else {
                1
            };
            for round in 0..rounds {
                if !pass.run(kernel)? {
                    break;
                }
                log::debug!("pass `{}` changed `{}` (round {round})", pass.name(), kernel.name);
                changed = true;
            }
        }
        Ok(changed)
    }
}

/// The configuration surface of the lowering pipeline.
#[derive(Clone, Debug)]
pub struct CompileOptions {
    pub target: TargetSpec,
    /// Pipeline depth per loop name, overriding the loop's declared depth.
    pub pipeline_depth: BTreeMap<String, u32>,
    /// Run the swizzle optimizer.
    pub swizzle: bool,
    /// Allow materializing copies to resolve layout conflicts.
    pub layout_copies: bool,
    /// Layouts by buffer name, taking precedence over hints on the buffers.
    pub layout_hints: BTreeMap<String, Layout>,
    pub swizzle_family: SwizzleFamily,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self::for_target(TargetSpec::default())
    }
}

impl CompileOptions {
    pub fn for_target(target: TargetSpec) -> Self {
        Self {
            target,
            pipeline_depth: BTreeMap::new(),
            swizzle: true,
            layout_copies: true,
            layout_hints: BTreeMap::new(),
            swizzle_family: SwizzleFamily::default(),
        }
    }
}

/// Lowers a kernel in place: validate, assign layouts, swizzle, pipeline,
/// run the standard passes and check that the result is fully resolved.
pub fn lower(kernel: &mut Kernel, options: &CompileOptions) -> Result<(), CompileError> {
    kernel.validate()?;

    let copies = assign_layouts(kernel, options)?;
    let swizzled = if options.swizzle {
        optimize_swizzles(kernel, options)?.len()
    } else {
        0
    };
    let pipelined = pipeline_loops(kernel, options)?;

    let known: BTreeSet<_> = kernel.buffers().map(|(h, _)| h).collect();
    PassManager::standard(&options.target).run(kernel)?;
    let swizzled = if options.swizzle {
        swizzled + optimize_new_swizzles(kernel, options, &known)?.len()
    } else {
        0
    };

    kernel.validate()?;
    kernel.check_resolved()?;
    log::info!(
        "lowered `{}` for {}: {} materializing copies, {swizzled} swizzled buffers, {} pipelined loops",
        kernel.name,
        options.target.name,
        copies.len(),
        pipelined.len()
    );
    Ok(())
}
