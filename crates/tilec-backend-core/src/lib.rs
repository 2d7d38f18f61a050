#![warn(missing_docs)]
//! Backend trait and emitter plumbing for tilec.
//!
//! Defines the [`Backend`] trait that every target emitter implements,
//! along with supporting types ([`BackendOptions`], [`BackendOutput`],
//! [`BackendError`]), a [`BackendRegistry`] for CLI dispatch and the
//! table-driven instruction selection in [`lowering`].

pub mod lowering;

use std::fmt::{self, Debug};

use tilec_ir::{IrError, Kernel, TargetSpec};

pub use lowering::{
    LayoutClass, Lowering, LoweredBuffer, LoweredKernel, LoweredOp, LoweredOperand, LoweredStmt,
    LoweringTable, Slot, lower_kernel,
};

/// A backend that turns a lowered kernel into target-specific output.
pub trait Backend: Debug + Send + Sync {
    /// Human-readable name (e.g. "CUDA").
    fn name(&self) -> &str;

    /// Target identifiers this backend handles (for `--target` dispatch).
    fn targets(&self) -> &[&str];

    /// The hardware model kernels must be lowered against before
    /// [`compile`](Backend::compile) is called.
    fn target_spec(&self) -> TargetSpec {
        TargetSpec::default()
    }

    /// Emit a fully resolved kernel.
    fn compile(
        &self,
        kernel: &Kernel,
        opts: &BackendOptions,
    ) -> Result<BackendOutput, BackendError>;
}

/// Options passed to a backend during compilation.
#[derive(Clone, Debug, Default)]
pub struct BackendOptions {
    /// Annotate emitted instructions with the IR op and iteration they
    /// come from.
    pub line_info: bool,
}

/// The output produced by a backend.
#[derive(Clone, Debug)]
pub struct BackendOutput {
    /// One or more output files.
    pub files: Vec<OutputFile>,
    /// Non-fatal diagnostics.
    pub diagnostics: Vec<Diagnostic>,
}

/// A single generated source file.
#[derive(Clone, Debug)]
pub struct OutputFile {
    /// Suggested filename (e.g. "gemm.cu", "gemm.tir").
    pub name: String,
    /// The source text.
    pub text: String,
}

/// A non-fatal diagnostic message from a backend.
#[derive(Clone, Debug)]
pub struct Diagnostic {
    /// Severity level.
    pub level: DiagnosticLevel,
    /// Human-readable message.
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.level, self.message)
    }
}

/// Severity level for diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiagnosticLevel {
    /// A warning that does not prevent compilation.
    Warning,
    /// An informational note.
    Info,
}

impl fmt::Display for DiagnosticLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Warning => "Warning",
            Self::Info => "Info",
        })
    }
}

/// An op/layout combination the target has no lowering for.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error(
    "no lowering for `{op}` ({kind}) with [{}] on {target}",
    .layouts.join(", ")
)]
pub struct UnsupportedOpError {
    /// Name of the offending op.
    pub op: String,
    /// Its kind.
    pub kind: String,
    /// `buffer: layout` for each operand, inputs first.
    pub layouts: Vec<String>,
    /// Target name.
    pub target: String,
}

/// Errors that can occur during backend compilation.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// An op has no lowering on this target.
    #[error(transparent)]
    UnsupportedOp(#[from] UnsupportedOpError),
    /// The kernel has not been fully lowered.
    #[error("kernel is not lowered: {0}")]
    Ir(#[from] IrError),
}

/// Registry of available backends, used for CLI `--target` dispatch.
pub struct BackendRegistry {
    backends: Vec<Box<dyn Backend>>,
}

impl BackendRegistry {
    /// Creates a registry holding only the built-in [`IrDumpBackend`].
    pub fn with_builtins() -> Self {
        Self {
            backends: vec![Box::new(IrDumpBackend)],
        }
    }

    /// Registers a backend. Earlier registrations win on shared targets.
    pub fn register(&mut self, backend: Box<dyn Backend>) {
        self.backends.push(backend);
    }

    /// Finds a backend that handles the given target identifier.
    pub fn find(&self, target: &str) -> Option<&dyn Backend> {
        self.backends
            .iter()
            .find(|b| b.targets().contains(&target))
            .map(|b| &**b)
    }

    /// Lists all supported target identifiers.
    pub fn list_targets(&self) -> Vec<&str> {
        self.backends
            .iter()
            .flat_map(|b| b.targets().iter().copied())
            .collect()
    }
}

/// Built-in backend that dumps the kernel as text using
/// [`tilec_ir::dump_kernel`].
///
/// Unlike the code emitters it accepts kernels at any stage.
#[derive(Debug)]
pub struct IrDumpBackend;

impl Backend for IrDumpBackend {
    fn name(&self) -> &str {
        "IR Dump"
    }

    fn targets(&self) -> &[&str] {
        &["ir-dump", "ir"]
    }

    fn compile(
        &self,
        kernel: &Kernel,
        _opts: &BackendOptions,
    ) -> Result<BackendOutput, BackendError> {
        Ok(BackendOutput {
            files: vec![OutputFile {
                name: format!("{}.tir", kernel.name),
                text: tilec_ir::dump_kernel(kernel),
            }],
            diagnostics: vec![],
        })
    }
}
