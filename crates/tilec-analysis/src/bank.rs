//! Abstract banked shared-memory model.
//!
//! Memory is split into `banks` banks of `width`-byte words, word `w` living
//! in bank `w % banks`. Lanes of one instruction are served in wavefronts of
//! `banks * width` bytes; within a wavefront, a bank serves one distinct
//! word per cycle (lanes reading the same word are broadcast). A single
//! bank models unbanked memory and never conflicts.

use std::collections::{BTreeMap, BTreeSet};

use tilec_ir::{Swizzle, TargetSpec};

use crate::access::AccessPattern;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BankModel {
    pub banks: u32,
    pub width: u32,
}

impl BankModel {
    pub fn new(banks: u32, width: u32) -> Self {
        Self {
            banks: banks.max(1),
            width: width.max(1),
        }
    }

    pub fn for_target(target: &TargetSpec) -> Self {
        Self::new(target.bank_count, target.bank_width)
    }

    /// Worst-case number of distinct words requested from one bank within
    /// one wavefront. `1` means conflict-free.
    pub fn conflict_degree(
        &self,
        pattern: &AccessPattern,
        elem_bytes: u32,
        swizzle: Option<&Swizzle>,
    ) -> u32 {
        if self.banks <= 1 {
            return 1;
        }
        let eb = u64::from(elem_bytes.max(1));
        let width = u64::from(self.width);
        let banks = u64::from(self.banks);
        let access_bytes = u64::from(pattern.vector.max(1)) * eb;
        let per_wave = ((banks * width) / access_bytes).max(1) as usize;

        let mut worst = 1;
        for phase in &pattern.phases {
            for wave in phase.chunks(per_wave) {
                let mut words: BTreeMap<u64, BTreeSet<u64>> = BTreeMap::new();
                for lane in wave {
                    for e in 0..u64::from(lane.elems) {
                        let offset = lane.offset + e;
                        let physical = swizzle.map_or(offset, |s| s.apply(offset));
                        let word = physical * eb / width;
                        words.entry(word % banks).or_default().insert(word);
                    }
                }
                let degree = words.values().map(BTreeSet::len).max().unwrap_or(1);
                worst = worst.max(degree as u32);
            }
        }
        worst
    }
}

/// Conflict degree of `pattern` under the target's bank model.
pub fn conflict_degree(
    target: &TargetSpec,
    pattern: &AccessPattern,
    elem_bytes: u32,
    swizzle: Option<&Swizzle>,
) -> u32 {
    BankModel::for_target(target).conflict_degree(pattern, elem_bytes, swizzle)
}

#[cfg(test)]
mod tests {
    use tilec_ir::Handle;

    use super::*;
    use crate::access::LaneAccess;

    fn pattern(vector: u32, offsets: &[u64]) -> AccessPattern {
        AccessPattern {
            op: dummy_handle(),
            vector,
            phases: vec![
                offsets
                    .iter()
                    .enumerate()
                    .map(|(lane, &offset)| LaneAccess {
                        lane: lane as u32,
                        offset,
                        elems: vector,
                    })
                    .collect(),
            ],
        }
    }

    fn dummy_handle() -> Handle<tilec_ir::TileOp> {
        let mut k = tilec_ir::Kernel::new("d");
        k.add_op(tilec_ir::TileOp::barrier("b", tilec_ir::BarrierKind::Sync))
            .unwrap()
    }

    #[test]
    fn atom_rows_conflict_without_swizzle() {
        // 8 rows of a 64x32 f16 tile, 16 bytes each, same column chunk.
        let rows: Vec<u64> = (0..8).map(|r| r * 32).collect();
        let p = pattern(8, &rows);
        let model = BankModel::new(32, 4);
        assert_eq!(model.conflict_degree(&p, 2, None), 4);
        let sw = Swizzle::xor(2, 3, 3).unwrap();
        assert_eq!(model.conflict_degree(&p, 2, Some(&sw)), 1);
    }

    #[test]
    fn unbanked_memory_never_conflicts() {
        let col: Vec<u64> = (0..8).map(|r| r * 64).collect();
        let p = pattern(1, &col);
        assert_eq!(conflict_degree(&TargetSpec::cpu(), &p, 4, None), 1);
    }

    #[test]
    fn broadcast_is_not_a_conflict() {
        let p = pattern(1, &[0; 32]);
        assert_eq!(BankModel::new(32, 4).conflict_degree(&p, 4, None), 1);
    }

    #[test]
    fn strided_column_access() {
        // 32 lanes reading one f32 column of a row-major [32, 32] tile.
        let col: Vec<u64> = (0..32).map(|r| r * 32).collect();
        let p = pattern(1, &col);
        let t = TargetSpec::sm80();
        assert_eq!(conflict_degree(&t, &p, 4, None), 32);
        let sw = Swizzle::xor(5, 0, 5).unwrap();
        assert_eq!(conflict_degree(&t, &p, 4, Some(&sw)), 1);
    }
}
