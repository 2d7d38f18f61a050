//! Host CPU backend emitter for tilec.
//!
//! Emits portable C++ (`.cpp`) over dense buffers only. Register tiles and
//! matrix-unit ops have no lowering here; kernels that need them must be
//! compiled for a GPU target.

use tilec_backend_core::{
    Backend, BackendError, BackendOptions, BackendOutput, Diagnostic, DiagnosticLevel,
    LoweringTable, OutputFile, Slot, lower_kernel,
};
use tilec_ir::{Kernel, OpTag, TargetSpec};

mod emit;

/// Dense-only lowering table for host CPUs.
pub fn table(target: &str) -> LoweringTable {
    use Slot::Dense;
    LoweringTable::new(target)
        .rule(OpTag::Copy, &[Dense, Dense], "tilec_cpu::copy")
        .rule(OpTag::Fill, &[Dense], "tilec_cpu::fill")
        .rule(OpTag::Reduce, &[Dense, Dense], "tilec_cpu::reduce")
        .rule(OpTag::Elementwise, &[Dense, Dense, Dense], "tilec_cpu::elementwise")
        .rule(OpTag::Cast, &[Dense, Dense], "tilec_cpu::convert")
        .rule(OpTag::Atomic, &[Dense, Dense], "tilec_cpu::atomic")
        .rule(OpTag::Barrier, &[], "tilec_cpu::fence")
}

/// Portable C++ backend for host CPUs.
#[derive(Debug)]
pub struct CpuBackend;

impl Backend for CpuBackend {
    fn name(&self) -> &str {
        "CPU"
    }

    fn targets(&self) -> &[&str] {
        &["cpu", "host"]
    }

    fn target_spec(&self) -> TargetSpec {
        TargetSpec::cpu()
    }

    fn compile(
        &self,
        kernel: &Kernel,
        _opts: &BackendOptions,
    ) -> Result<BackendOutput, BackendError> {
        let lowered = lower_kernel(kernel, &table(&self.target_spec().name))?;

        let mut diagnostics = Vec::new();
        let fences = lowered
            .ops()
            .filter(|op| op.mnemonic == "tilec_cpu::fence")
            .count();
        if fences > 0 {
            diagnostics.push(Diagnostic {
                level: DiagnosticLevel::Info,
                message: format!(
                    "kernel '{}': {fences} barrier(s) lowered to thread fences",
                    lowered.name
                ),
            });
        }

        let source = emit::emit(&lowered);
        log::debug!("emitted {} bytes of C++ for `{}`", source.len(), lowered.name);
        Ok(BackendOutput {
            files: vec![OutputFile {
                name: format!("{}.cpp", lowered.name),
                text: source,
            }],
            diagnostics,
        })
    }
}
