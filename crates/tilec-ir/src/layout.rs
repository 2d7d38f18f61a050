//! Physical layouts: dense dimension orders and register fragments.
//!
//! A [`Layout`] maps a logical multi-index of a buffer to a [`Location`]:
//! a linear element offset for dense scopes, or a `(lane, register)` slot
//! for register fragments. Both mappings are bijective on the buffer's
//! index space, and [`Layout::index_of`] inverts [`Layout::locate`].

use crate::error::IrError;
use crate::target::TargetSpec;
use crate::types::Scalar;

/// A dense layout: the buffer's dimensions in memory order.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DenseLayout {
    shape: Vec<u32>,
    /// Dimension indices from outermost to innermost.
    order: Vec<usize>,
}

impl DenseLayout {
    pub fn row_major(shape: &[u32]) -> Self {
        Self {
            shape: shape.to_vec(),
            order: (0..shape.len()).collect(),
        }
    }

    pub fn col_major(shape: &[u32]) -> Self {
        Self {
            shape: shape.to_vec(),
            order: (0..shape.len()).rev().collect(),
        }
    }

    /// A layout with an explicit dimension order (outermost first).
    pub fn with_order(shape: &[u32], order: Vec<usize>) -> Result<Self, IrError> {
        let mut seen = vec![false; shape.len()];
        if order.len() != shape.len() {
            return Err(IrError::InvalidLayout {
                reason: format!("order {order:?} does not cover rank {}", shape.len()),
            });
        }
        for &d in &order {
            if d >= shape.len() || seen[d] {
                return Err(IrError::InvalidLayout {
                    reason: format!("order {order:?} is not a permutation"),
                });
            }
            seen[d] = true;
        }
        Ok(Self {
            shape: shape.to_vec(),
            order,
        })
    }

    /// Every dimension order of `shape`, row-major first.
    ///
    /// Ranks above 4 only yield row- and column-major.
    pub fn all_orders(shape: &[u32]) -> Vec<Self> {
        let rank = shape.len();
        if rank > 4 {
            let mut out = vec![Self::row_major(shape)];
            if rank > 1 {
                out.push(Self::col_major(shape));
            }
            return out;
        }
        let mut perms = Vec::new();
        permutations(&mut (0..rank).collect::<Vec<_>>(), 0, &mut perms);
        perms.sort();
        perms
            .into_iter()
            .map(|order| Self {
                shape: shape.to_vec(),
                order,
            })
            .collect()
    }

    pub fn shape(&self) -> &[u32] {
        &self.shape
    }

    pub fn order(&self) -> &[usize] {
        &self.order
    }

    pub fn is_row_major(&self) -> bool {
        self.order.iter().enumerate().all(|(i, &d)| i == d)
    }

    /// The dimension with unit stride.
    pub fn innermost(&self) -> usize {
        self.order.last().copied().unwrap_or(0)
    }

    /// Number of contiguous elements along the innermost dimension.
    pub fn innermost_extent(&self) -> u32 {
        self.shape.get(self.innermost()).copied().unwrap_or(1)
    }

    /// Element stride of every dimension, indexed by dimension.
    pub fn strides(&self) -> Vec<u64> {
        let mut strides = vec![0u64; self.shape.len()];
        let mut acc = 1u64;
        for &d in self.order.iter().rev() {
            strides[d] = acc;
            acc *= u64::from(self.shape[d]);
        }
        strides
    }

    /// Total number of elements.
    pub fn extent(&self) -> u64 {
        self.shape.iter().map(|&d| u64::from(d)).product()
    }

    /// Linear offset of a logical index, or `None` when out of range.
    pub fn offset(&self, index: &[u32]) -> Option<u64> {
        if index.len() != self.shape.len() {
            return None;
        }
        let strides = self.strides();
        let mut off = 0u64;
        for (d, (&i, &n)) in index.iter().zip(&self.shape).enumerate() {
            if i >= n {
                return None;
            }
            off += u64::from(i) * strides[d];
        }
        Some(off)
    }

    /// Logical index stored at `offset`.
    pub fn index_of(&self, offset: u64) -> Option<Vec<u32>> {
        if offset >= self.extent() {
            return None;
        }
        let strides = self.strides();
        let mut rest = offset;
        let mut index = vec![0u32; self.shape.len()];
        for &d in &self.order {
            index[d] = (rest / strides[d]) as u32;
            rest %= strides[d];
        }
        Some(index)
    }
}

fn permutations(items: &mut Vec<usize>, k: usize, out: &mut Vec<Vec<usize>>) {
    if k == items.len() {
        out.push(items.clone());
        return;
    }
    for i in k..items.len() {
        items.swap(k, i);
        permutations(items, k + 1, out);
        items.swap(k, i);
    }
}

/// Which operand of the matrix unit a fragment feeds.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum MmaOperand {
    A,
    B,
    Accumulator,
}

/// How a fragment tile is spread over lanes.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum FragmentKind {
    /// Row-major tile cut into `vector`-element runs, one run per lane.
    /// This is what a cooperative copy into registers produces.
    Strip { vector: u32 },
    /// The matrix unit's operand mapping: 8x8 atoms, two adjacent elements
    /// per lane per atom.
    Mma(MmaOperand),
}

/// A register-tile layout.
///
/// The buffer (`shape`) is covered by `tile`-shaped pieces in row-major
/// order; each piece is distributed over `lanes` lanes by `kind`.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct Fragment {
    pub kind: FragmentKind,
    pub shape: [u32; 2],
    pub tile: [u32; 2],
    pub lanes: u32,
}

impl Fragment {
    /// The native operand fragment of the target's matrix unit.
    pub fn mma(operand: MmaOperand, shape: [u32; 2], target: &TargetSpec) -> Result<Self, IrError> {
        let tile = target
            .mma_tile(operand)
            .ok_or_else(|| IrError::InvalidFragment {
                reason: format!("target `{}` has no matrix unit", target.name),
            })?;
        let frag = Self {
            kind: FragmentKind::Mma(operand),
            shape,
            tile,
            lanes: target.lanes,
        };
        frag.validate(target)?;
        Ok(frag)
    }

    /// The natural layout of a cooperative copy of `shape` into registers:
    /// each lane takes the widest vector the target allows.
    pub fn strip(shape: [u32; 2], dtype: Scalar, target: &TargetSpec) -> Result<Self, IrError> {
        let max_vec = (target.vector_bytes / dtype.bytes()).max(1);
        let mut vector = 1;
        while vector * 2 <= max_vec && shape[1] % (vector * 2) == 0 {
            vector *= 2;
        }
        let total = target.lanes * vector;
        let cols = if shape[1] >= total { total } else { shape[1] };
        if cols == 0 || shape[1] % cols != 0 || total % cols != 0 {
            return Err(IrError::InvalidFragment {
                reason: format!(
                    "{}x{} cannot be split into {total}-element lane strips",
                    shape[0], shape[1]
                ),
            });
        }
        let frag = Self {
            kind: FragmentKind::Strip { vector },
            shape,
            tile: [total / cols, cols],
            lanes: target.lanes,
        };
        frag.validate(target)?;
        Ok(frag)
    }

    /// Checks the fragment against the target and its own buffer shape.
    pub fn validate(&self, target: &TargetSpec) -> Result<(), IrError> {
        let invalid = |reason: String| -> Result<(), IrError> {
            Err(IrError::InvalidFragment { reason })
        };
        let [r, c] = self.tile;
        if r == 0 || c == 0 || self.shape[0] == 0 || self.shape[1] == 0 {
            return invalid("empty tile or shape".into());
        }
        if self.lanes != target.lanes {
            return invalid(format!(
                "fragment spans {} lanes, target `{}` has {}",
                self.lanes, target.name, target.lanes
            ));
        }
        if self.shape[0] % r != 0 || self.shape[1] % c != 0 {
            return invalid(format!(
                "shape {}x{} is not a multiple of tile {r}x{c}",
                self.shape[0], self.shape[1]
            ));
        }
        match self.kind {
            FragmentKind::Mma(operand) => {
                let Some([nr, nc]) = target.mma_tile(operand) else {
                    return invalid(format!("target `{}` has no matrix unit", target.name));
                };
                if nr % r != 0 || nc % c != 0 {
                    return invalid(format!(
                        "tile {r}x{c} does not divide native {operand:?} tile {nr}x{nc}"
                    ));
                }
                if r % 8 != 0 || c % 8 != 0 || self.lanes != 32 {
                    return invalid(format!(
                        "tile {r}x{c} over {} lanes is not built from 8x8 atoms",
                        self.lanes
                    ));
                }
            }
            FragmentKind::Strip { vector } => {
                if vector == 0 || c % vector != 0 || r * c != self.lanes * vector {
                    return invalid(format!(
                        "tile {r}x{c} is not {} lanes of {vector} elements",
                        self.lanes
                    ));
                }
            }
        }
        Ok(())
    }

    /// Registers each lane holds per tile.
    pub fn regs_per_tile(&self) -> u32 {
        self.tile[0] * self.tile[1] / self.lanes.max(1)
    }

    /// Registers each lane holds for the whole buffer.
    pub fn regs_per_lane(&self) -> u32 {
        self.shape[0] * self.shape[1] / self.lanes.max(1)
    }

    /// Tile grid `[rows, cols]`.
    pub fn tiles(&self) -> [u32; 2] {
        [self.shape[0] / self.tile[0], self.shape[1] / self.tile[1]]
    }

    /// Adjacent elements owned by one lane along [`Self::contiguous_axis`].
    pub fn lane_run(&self) -> u32 {
        match self.kind {
            FragmentKind::Strip { vector } => vector,
            FragmentKind::Mma(_) => 2,
        }
    }

    /// Axis along which a lane's elements are adjacent.
    pub fn contiguous_axis(&self) -> usize {
        match self.kind {
            FragmentKind::Mma(MmaOperand::B) => 0,
            _ => 1,
        }
    }

    /// Whether this fragment's tile evenly subdivides `tile`.
    pub fn divides(&self, tile: [u32; 2]) -> bool {
        tile[0] % self.tile[0] == 0 && tile[1] % self.tile[1] == 0
    }

    /// `(lane, register)` slot of element `(row, col)`.
    pub fn map(&self, row: u32, col: u32) -> Option<(u32, u32)> {
        if row >= self.shape[0] || col >= self.shape[1] {
            return None;
        }
        let [r, c] = self.tile;
        let tile_id = (row / r) * self.tiles()[1] + col / c;
        let (lane, reg) = self.map_in_tile(row % r, col % c);
        Some((lane, tile_id * self.regs_per_tile() + reg))
    }

    /// Element held in `(lane, reg)`.
    pub fn unmap(&self, lane: u32, reg: u32) -> Option<[u32; 2]> {
        let per_tile = self.regs_per_tile();
        if lane >= self.lanes || per_tile == 0 {
            return None;
        }
        let [tr, tc] = self.tiles();
        let tile_id = reg / per_tile;
        if tile_id >= tr * tc {
            return None;
        }
        let (rr, cc) = self.unmap_in_tile(lane, reg % per_tile);
        Some([
            (tile_id / tc) * self.tile[0] + rr,
            (tile_id % tc) * self.tile[1] + cc,
        ])
    }

    fn map_in_tile(&self, rr: u32, cc: u32) -> (u32, u32) {
        match self.kind {
            FragmentKind::Strip { vector } => {
                let flat = rr * self.tile[1] + cc;
                (flat / vector, flat % vector)
            }
            FragmentKind::Mma(MmaOperand::B) => atom_map(cc, rr, self.tile[1]),
            FragmentKind::Mma(_) => atom_map(rr, cc, self.tile[0]),
        }
    }

    fn unmap_in_tile(&self, lane: u32, reg: u32) -> (u32, u32) {
        match self.kind {
            FragmentKind::Strip { vector } => {
                let flat = lane * vector + reg;
                (flat / self.tile[1], flat % self.tile[1])
            }
            FragmentKind::Mma(MmaOperand::B) => {
                let (cc, rr) = atom_unmap(lane, reg, self.tile[1]);
                (rr, cc)
            }
            FragmentKind::Mma(_) => atom_unmap(lane, reg, self.tile[0]),
        }
    }
}

/// 8x8 atom mapping with pairs along the column axis. Atoms are numbered
/// column-major over a tile with `rows` rows.
fn atom_map(rr: u32, cc: u32, rows: u32) -> (u32, u32) {
    let atom = (cc / 8) * (rows / 8) + rr / 8;
    let (r8, c8) = (rr % 8, cc % 8);
    (r8 * 4 + c8 / 2, atom * 2 + c8 % 2)
}

fn atom_unmap(lane: u32, reg: u32, rows: u32) -> (u32, u32) {
    let atom = reg / 2;
    let per_col = (rows / 8).max(1);
    let (ra, ca) = (atom % per_col, atom / per_col);
    (ra * 8 + lane / 4, ca * 8 + (lane % 4) * 2 + reg % 2)
}

/// Physical position of one element.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum Location {
    /// Element offset from the start of the allocation.
    Offset(u64),
    Register { lane: u32, reg: u32 },
}

/// The physical layout attached to a buffer.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub enum Layout {
    Dense(DenseLayout),
    Fragment(Fragment),
}

impl Layout {
    pub fn row_major(shape: &[u32]) -> Self {
        Layout::Dense(DenseLayout::row_major(shape))
    }

    pub fn shape(&self) -> &[u32] {
        match self {
            Layout::Dense(d) => d.shape(),
            Layout::Fragment(f) => &f.shape,
        }
    }

    pub fn as_dense(&self) -> Option<&DenseLayout> {
        match self {
            Layout::Dense(d) => Some(d),
            Layout::Fragment(_) => None,
        }
    }

    pub fn as_fragment(&self) -> Option<&Fragment> {
        match self {
            Layout::Fragment(f) => Some(f),
            Layout::Dense(_) => None,
        }
    }

    pub fn locate(&self, index: &[u32]) -> Option<Location> {
        match self {
            Layout::Dense(d) => d.offset(index).map(Location::Offset),
            Layout::Fragment(f) => match index {
                &[row, col] => f
                    .map(row, col)
                    .map(|(lane, reg)| Location::Register { lane, reg }),
                _ => None,
            },
        }
    }

    /// Inverse of [`Self::locate`].
    pub fn index_of(&self, location: Location) -> Option<Vec<u32>> {
        match (self, location) {
            (Layout::Dense(d), Location::Offset(off)) => d.index_of(off),
            (Layout::Fragment(f), Location::Register { lane, reg }) => {
                f.unmap(lane, reg).map(|rc| rc.to_vec())
            }
            _ => None,
        }
    }
}
