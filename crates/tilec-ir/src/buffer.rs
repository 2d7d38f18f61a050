//! Logical tensors and their memory scopes.

use crate::arena::Handle;
use crate::layout::Layout;
use crate::swizzle::Swizzle;
use crate::types::Scalar;

/// Memory space a buffer lives in.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum Scope {
    /// Device memory.
    Global,
    /// Banked scratchpad shared by all lanes of a block.
    Shared,
    /// Register tile distributed over the lanes of a warp.
    Fragment,
    /// Per-lane private memory.
    Local,
}

impl Scope {
    /// Whether buffers in this scope are addressed by linear offsets.
    pub fn is_dense(self) -> bool {
        !matches!(self, Scope::Fragment)
    }
}

/// A logical tensor.
///
/// Shape, dtype and scope are fixed at declaration. The layout and swizzle
/// are attached once through [`Kernel`](crate::Kernel) and are never replaced.
#[derive(Clone, Debug)]
pub struct Buffer {
    pub name: String,
    /// Dimension extents, outermost first.
    pub shape: Vec<u32>,
    pub dtype: Scalar,
    pub scope: Scope,
    /// Explicit layout annotation from the front end.
    pub hint: Option<Layout>,
    /// Forbid materializing copies on behalf of this buffer.
    pub no_copy: bool,
    /// Never swizzle this buffer.
    pub no_swizzle: bool,
    /// Set on pipeline ring instances: the logical buffer and the instance index.
    pub instance_of: Option<(Handle<Buffer>, u32)>,
    pub(crate) layout: Option<Layout>,
    pub(crate) swizzle: Option<Swizzle>,
}

impl Buffer {
    pub fn new(name: impl Into<String>, shape: Vec<u32>, dtype: Scalar, scope: Scope) -> Self {
        Self {
            name: name.into(),
            shape,
            dtype,
            scope,
            hint: None,
            no_copy: false,
            no_swizzle: false,
            instance_of: None,
            layout: None,
            swizzle: None,
        }
    }

    pub fn with_hint(mut self, layout: Layout) -> Self {
        self.hint = Some(layout);
        self
    }

    pub fn forbid_copies(mut self) -> Self {
        self.no_copy = true;
        self
    }

    pub fn without_swizzle(mut self) -> Self {
        self.no_swizzle = true;
        self
    }

    /// The attached layout, once assignment has run.
    pub fn layout(&self) -> Option<&Layout> {
        self.layout.as_ref()
    }

    pub fn swizzle(&self) -> Option<&Swizzle> {
        self.swizzle.as_ref()
    }

    /// Number of elements.
    pub fn elements(&self) -> u64 {
        self.shape.iter().map(|&d| u64::from(d)).product()
    }

    pub fn size_bytes(&self) -> u64 {
        self.elements() * u64::from(self.dtype.bytes())
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// A fresh, unattached copy of this declaration under a new name.
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shape: self.shape.clone(),
            dtype: self.dtype,
            scope: self.scope,
            hint: None,
            no_copy: self.no_copy,
            no_swizzle: self.no_swizzle,
            instance_of: None,
            layout: None,
            swizzle: None,
        }
    }
}
