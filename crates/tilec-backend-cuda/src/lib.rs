//! CUDA backend emitter for tilec.
//!
//! Selects instructions for MMA-capable GPUs and emits a CUDA C++
//! translation unit (`.cu`) built against the `tilec/cuda.cuh` support
//! header.

use tilec_backend_core::{
    Backend, BackendError, BackendOptions, BackendOutput, Diagnostic, DiagnosticLevel,
    OutputFile, lower_kernel,
};
use tilec_ir::{Kernel, TargetSpec};

pub mod emit;
mod table;

pub use table::table;

/// CUDA backend targeting Ampere-class GPUs.
#[derive(Debug)]
pub struct CudaBackend;

impl Backend for CudaBackend {
    fn name(&self) -> &str {
        "CUDA"
    }

    fn targets(&self) -> &[&str] {
        &["cuda", "sm80"]
    }

    fn target_spec(&self) -> TargetSpec {
        TargetSpec::sm80()
    }

    fn compile(
        &self,
        kernel: &Kernel,
        opts: &BackendOptions,
    ) -> Result<BackendOutput, BackendError> {
        let lowered = lower_kernel(kernel, &table(&self.target_spec().name))?;

        let mut diagnostics = Vec::new();
        let shared = emit::shared_bytes(&lowered);
        diagnostics.push(Diagnostic {
            level: DiagnosticLevel::Info,
            message: format!("kernel '{}': {shared} bytes of shared memory", lowered.name),
        });
        if shared > emit::STATIC_SHARED_LIMIT {
            diagnostics.push(Diagnostic {
                level: DiagnosticLevel::Warning,
                message: format!(
                    "kernel '{}' needs {shared} bytes of shared memory, above the {} byte static limit; \
                     launch with cudaFuncAttributeMaxDynamicSharedMemorySize",
                    lowered.name,
                    emit::STATIC_SHARED_LIMIT
                ),
            });
        }
        if emit::uses_fragments(&lowered) {
            diagnostics.push(Diagnostic {
                level: DiagnosticLevel::Info,
                message: "register tiles are warp-wide: launch whole warps per block".into(),
            });
        }

        let source = emit::emit(&lowered, opts);
        log::debug!("emitted {} bytes of CUDA for `{}`", source.len(), lowered.name);
        Ok(BackendOutput {
            files: vec![OutputFile {
                name: format!("{}.cu", lowered.name),
                text: source,
            }],
            diagnostics,
        })
    }
}
