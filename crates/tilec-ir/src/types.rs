//! Element types and literal values.

/// Width of a scalar type in bytes.
pub type Bytes = u8;

/// The kind of a scalar type.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum ScalarKind {
    /// Boolean.
    Bool,
    /// Signed integer.
    Sint,
    /// Unsigned integer.
    Uint,
    /// Floating point.
    Float,
    /// Brain floating point.
    BFloat,
}

/// A scalar type: kind + byte width.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Scalar {
    pub kind: ScalarKind,
    pub width: Bytes,
}

impl Scalar {
    pub const BOOL: Self = Self {
        kind: ScalarKind::Bool,
        width: 1,
    };
    pub const I8: Self = Self {
        kind: ScalarKind::Sint,
        width: 1,
    };
    pub const U8: Self = Self {
        kind: ScalarKind::Uint,
        width: 1,
    };
    pub const I32: Self = Self {
        kind: ScalarKind::Sint,
        width: 4,
    };
    pub const U32: Self = Self {
        kind: ScalarKind::Uint,
        width: 4,
    };
    pub const F16: Self = Self {
        kind: ScalarKind::Float,
        width: 2,
    };
    pub const BF16: Self = Self {
        kind: ScalarKind::BFloat,
        width: 2,
    };
    pub const F32: Self = Self {
        kind: ScalarKind::Float,
        width: 4,
    };

    /// Size of one element in bytes.
    pub fn bytes(self) -> u32 {
        u32::from(self.width)
    }

    /// Returns `true` for `Float` and `BFloat` kinds.
    pub fn is_float(self) -> bool {
        matches!(self.kind, ScalarKind::Float | ScalarKind::BFloat)
    }

    /// The type both `self` and `other` convert to without losing range.
    ///
    /// Floats win over integers; otherwise the wider type wins, ties keep `self`.
    pub fn promote(self, other: Scalar) -> Scalar {
        match (self.is_float(), other.is_float()) {
            (true, false) => self,
            (false, true) => other,
            _ if other.width > self.width => other,
            _ => self,
        }
    }
}

/// A compile-time constant, e.g. the value of a `Fill`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Literal {
    Float(f64),
    Int(i64),
    Bool(bool),
}

impl Literal {
    /// Converts the literal to the representation of `to`.
    ///
    /// 32-bit floats are rounded through `f32`; integers wrap to the target width.
    pub fn cast(self, to: Scalar) -> Literal {
        match to.kind {
            ScalarKind::Bool => Literal::Bool(match self {
                Literal::Float(v) => v != 0.0,
                Literal::Int(v) => v != 0,
                Literal::Bool(v) => v,
            }),
            ScalarKind::Float | ScalarKind::BFloat => {
                let v = self.as_f64();
                if to.width == 4 {
                    Literal::Float(f64::from(v as f32))
                } else {
                    Literal::Float(v)
                }
            }
            ScalarKind::Sint | ScalarKind::Uint => {
                let v = match self {
                    Literal::Float(v) => v as i64,
                    Literal::Int(v) => v,
                    Literal::Bool(v) => i64::from(v),
                };
                Literal::Int(wrap_int(v, to))
            }
        }
    }

    /// Numeric value as `f64`.
    pub fn as_f64(self) -> f64 {
        match self {
            Literal::Float(v) => v,
            Literal::Int(v) => v as f64,
            Literal::Bool(v) => f64::from(u8::from(v)),
        }
    }
}

fn wrap_int(v: i64, to: Scalar) -> i64 {
    let bits = u32::from(to.width) * 8;
    if bits >= 64 {
        return v;
    }
    let mask = (1i64 << bits) - 1;
    let raw = v & mask;
    if to.kind == ScalarKind::Sint && (raw >> (bits - 1)) & 1 == 1 {
        raw - (1i64 << bits)
    } else {
        raw
    }
}
