//! Shared-memory address permutations.
//!
//! A swizzle rewrites a `bits`-wide field of an element offset, starting at
//! bit `base`, using the field found `shift` bits higher. The source field
//! is never modified, so every swizzle is a bijection on any range whose
//! length is a multiple of [`Swizzle::span`].

use crate::error::IrError;

/// Combination of the target field with the source field.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum SwizzleKind {
    /// `field ^ source`. Self-inverse.
    Xor,
    /// `field + source` modulo the field width.
    Rotate,
    /// `field - source` modulo the field width; the inverse of `Rotate`.
    RotateInverse,
}

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct Swizzle {
    pub kind: SwizzleKind,
    pub bits: u32,
    pub base: u32,
    pub shift: u32,
}

impl Swizzle {
    pub fn new(kind: SwizzleKind, bits: u32, base: u32, shift: u32) -> Result<Self, IrError> {
        if bits == 0 || shift < bits || base + shift + bits > 63 {
            return Err(IrError::InvalidLayout {
                reason: format!("swizzle bits={bits} base={base} shift={shift} overlaps itself"),
            });
        }
        Ok(Self {
            kind,
            bits,
            base,
            shift,
        })
    }

    pub fn xor(bits: u32, base: u32, shift: u32) -> Result<Self, IrError> {
        Self::new(SwizzleKind::Xor, bits, base, shift)
    }

    /// Permuted element offset used for accesses.
    pub fn apply(&self, offset: u64) -> u64 {
        let mask = (1u64 << self.bits) - 1;
        let field = (offset >> self.base) & mask;
        let source = (offset >> (self.base + self.shift)) & mask;
        let permuted = match self.kind {
            SwizzleKind::Xor => field ^ source,
            SwizzleKind::Rotate => field.wrapping_add(source) & mask,
            SwizzleKind::RotateInverse => field.wrapping_sub(source) & mask,
        };
        (offset & !(mask << self.base)) | (permuted << self.base)
    }

    /// The function undoing [`Self::apply`].
    pub fn inverse(&self) -> Swizzle {
        let kind = match self.kind {
            SwizzleKind::Xor => SwizzleKind::Xor,
            SwizzleKind::Rotate => SwizzleKind::RotateInverse,
            SwizzleKind::RotateInverse => SwizzleKind::Rotate,
        };
        Swizzle { kind, ..*self }
    }

    pub fn is_self_inverse(&self) -> bool {
        self.kind == SwizzleKind::Xor
    }

    /// Elements kept contiguous by the permutation.
    pub fn chunk_elems(&self) -> u64 {
        1u64 << self.base
    }

    /// Smallest block the permutation maps onto itself.
    pub fn span(&self) -> u64 {
        1u64 << (self.base + self.bits)
    }

    /// Whether the permutation stays inside `[0, extent)`.
    pub fn is_bijective_on(&self, extent: u64) -> bool {
        extent > 0 && extent % self.span() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xor_moves_chunk_by_row() {
        let s = Swizzle::xor(2, 3, 3).unwrap();
        assert_eq!(s.apply(0), 0);
        assert_eq!(s.apply(64), 72);
        assert_eq!(s.apply(5), 5);
        assert!(s.is_self_inverse());
        assert_eq!(s.chunk_elems(), 8);
    }

    #[test]
    fn round_trips_through_inverse() {
        for kind in [SwizzleKind::Xor, SwizzleKind::Rotate] {
            let s = Swizzle::new(kind, 3, 2, 4).unwrap();
            let inv = s.inverse();
            for addr in 0..4096u64 {
                assert_eq!(inv.apply(s.apply(addr)), addr);
                assert_eq!(s.apply(inv.apply(addr)), addr);
            }
        }
    }

    #[test]
    fn stays_in_range() {
        let s = Swizzle::new(SwizzleKind::Rotate, 2, 3, 3).unwrap();
        assert!(s.is_bijective_on(2048));
        assert!(!s.is_bijective_on(20));
        let mut seen = vec![false; 2048];
        for addr in 0..2048 {
            let a = s.apply(addr) as usize;
            assert!(!seen[a]);
            seen[a] = true;
        }
    }

    #[test]
    fn rejects_overlapping_fields() {
        assert!(Swizzle::xor(3, 3, 2).is_err());
        assert!(Swizzle::xor(0, 3, 3).is_err());
    }
}
