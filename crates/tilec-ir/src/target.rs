//! Hardware parameters consumed by layout, swizzle and store planning.

use crate::layout::MmaOperand;

/// Description of the device a kernel is compiled for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetSpec {
    /// Short name used in diagnostics (`sm80`, `cpu`, ...).
    pub name: String,
    /// Native matrix-multiply-accumulate tile `[m, n, k]`, if the device has one.
    pub mma: Option<[u32; 3]>,
    /// Lanes cooperating on one register tile.
    pub lanes: u32,
    /// Number of shared-memory banks.
    pub bank_count: u32,
    /// Width of one bank word in bytes.
    pub bank_width: u32,
    /// Widest vector load/store per lane in bytes.
    pub vector_bytes: u32,
    /// Widest atomic update per lane in bytes.
    pub atomic_bytes: u32,
}

impl TargetSpec {
    /// An Ampere-class GPU: `m16n8k16` tensor cores, 32-lane warps and
    /// 32 four-byte shared-memory banks.
    pub fn sm80() -> Self {
        Self {
            name: "sm80".into(),
            mma: Some([16, 8, 16]),
            lanes: 32,
            bank_count: 32,
            bank_width: 4,
            vector_bytes: 16,
            atomic_bytes: 4,
        }
    }

    /// A host CPU with 256-bit vectors and no matrix unit.
    pub fn cpu() -> Self {
        Self {
            name: "cpu".into(),
            mma: None,
            lanes: 1,
            bank_count: 1,
            bank_width: 64,
            vector_bytes: 32,
            atomic_bytes: 8,
        }
    }

    /// Native `[rows, cols]` tile of one MMA operand.
    pub fn mma_tile(&self, operand: MmaOperand) -> Option<[u32; 2]> {
        let [m, n, k] = self.mma?;
        Some(match operand {
            MmaOperand::A => [m, k],
            MmaOperand::B => [k, n],
            MmaOperand::Accumulator => [m, n],
        })
    }

    /// Bytes served by all banks in one wavefront.
    pub fn bank_row_bytes(&self) -> u32 {
        self.bank_count * self.bank_width
    }
}

impl Default for TargetSpec {
    fn default() -> Self {
        Self::sm80()
    }
}
