//! Hardware data-layout descriptors.
//!
//! A layout answers two questions for a tensor of known shape and element type:
//! - which threads, warps and CTAs own each logical element (the *distributed* layouts:
//!   [`BlockedEncoding`], [`MmaEncoding`], [`SliceEncoding`], [`DotOperandEncoding`]);
//! - how a memory-resident tensor is arranged in shared memory, swizzle included
//!   ([`SharedEncoding`]).
//!
//! Descriptors are immutable and interned by a [`Context`](crate::context::Context): building the
//! same parameters twice yields the same [`Layout`] handle.

use std::{
    collections::BTreeSet,
    hash::{Hash, Hasher},
    sync::Arc,
};

use itertools::Itertools;
use thiserror::Error;

use crate::{
    context::Context,
    num::ScalarType,
    shape::{self, erase_dim, erase_order, insert_dim},
    verify::{Operation, VerifyError},
};

pub use blocked::BlockedEncoding;
pub use cta::CtaLayout;
pub use dot::DotOperandEncoding;
pub use mma::{MmaEncoding, MmaVersion, VoltaStates, NUM_BITS_TO_HOLD_MMA_V1_ID};
pub use shared::SharedEncoding;
pub use slice::SliceEncoding;
pub use text::{LayoutSeed, ParseError};

pub mod blocked;
pub mod cta;
pub mod dot;
pub mod mma;
pub mod shared;
pub mod slice;
pub mod text;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutError {
    #[error("rank mismatch: expected {expected}, found {found}")]
    Rank { expected: usize, found: usize },
    #[error("invalid layout parameter: {0}")]
    Invalid(String),
    #[error("unsupported shared memory layout: contiguous dimension of {0} bytes")]
    SwizzleExtent(i64),
    #[error("unsupported tensor-core version {0}")]
    MmaVersion(u32),
    #[error("invalid operand index {0}, expected 0 or 1")]
    OperandIndex(u32),
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),
    #[error("{0} is not supported for layout {1}")]
    Unsupported(&'static str, Layout),
    #[error("{0} is not well-defined for layout {1}")]
    Undefined(&'static str, Layout),
    #[error("{0} expects a distributed parent, got {1}")]
    NotDistributed(&'static str, Layout),
}

/// The capability every layout variant provides to the host compiler.
pub trait LayoutInterface {
    /// Number of elements each dimension of a tensor contributes to one thread.
    fn elems_per_thread(&self, shape: &[i64], ty: ScalarType) -> Result<Vec<u32>, LayoutError>;

    /// Number of elements owned by one thread.
    fn total_elems_per_thread(&self, shape: &[i64], ty: ScalarType) -> Result<u32, LayoutError> {
        self.elems_per_thread(shape, ty)
            .map(|elems| shape::product(&elems))
    }

    /// Layout-specific checks of an operation's operand carrying this layout.
    fn verify_for_operand(&self, _op: &dyn Operation, _operand: usize) -> Result<(), VerifyError> {
        Ok(())
    }
}

/// All layout variants, compared and hashed structurally.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Encoding {
    Blocked(BlockedEncoding),
    Mma(MmaEncoding),
    Slice(SliceEncoding),
    DotOperand(DotOperandEncoding),
    Shared(SharedEncoding),
}

impl From<BlockedEncoding> for Encoding {
    fn from(value: BlockedEncoding) -> Self {
        Self::Blocked(value)
    }
}

impl From<MmaEncoding> for Encoding {
    fn from(value: MmaEncoding) -> Self {
        Self::Mma(value)
    }
}

impl From<SliceEncoding> for Encoding {
    fn from(value: SliceEncoding) -> Self {
        Self::Slice(value)
    }
}

impl From<DotOperandEncoding> for Encoding {
    fn from(value: DotOperandEncoding) -> Self {
        Self::DotOperand(value)
    }
}

impl From<SharedEncoding> for Encoding {
    fn from(value: SharedEncoding) -> Self {
        Self::Shared(value)
    }
}

/// An interned layout descriptor.
///
/// Handles compare and hash by identity: two handles obtained from the same context are equal
/// exactly when their descriptors are structurally equal.
#[derive(Clone)]
pub struct Layout(Arc<Encoding>);

impl Layout {
    #[inline]
    pub(crate) fn from_interned(encoding: Arc<Encoding>) -> Self {
        Self(encoding)
    }

    #[inline]
    pub fn encoding(&self) -> &Encoding {
        &self.0
    }

    /// Returns `true` if both handles point to the same interned descriptor.
    #[inline]
    pub fn ptr_eq(&self, other: &Layout) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Runs the layout's own checks and then the verifier the context registered for the
    /// operation.
    pub fn verify_for_operand(
        &self,
        context: &Context,
        op: &dyn Operation,
        operand: usize,
    ) -> Result<(), VerifyError> {
        let ty = op
            .operands()
            .get(operand)
            .ok_or_else(|| VerifyError::new(op, operand, "operand index out of range"))?;
        if !self.accepts_rank(ty.shape.len()) {
            let message = format!("layout {self} does not apply to a tensor of rank {}", ty.shape.len());
            return Err(VerifyError::new(op, operand, message));
        }
        self.encoding().verify_for_operand(op, operand)?;
        match context.verifier(op.name()) {
            Some(verifier) => verifier.verify(op, operand, self),
            None => Ok(()),
        }
    }
}

impl std::ops::Deref for Layout {
    type Target = Encoding;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl PartialEq for Layout {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Layout {}

impl Hash for Layout {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.0).hash(state)
    }
}

impl std::fmt::Debug for Layout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Layout").field(self.encoding()).finish()
    }
}

impl LayoutInterface for Encoding {
    fn elems_per_thread(&self, shape: &[i64], ty: ScalarType) -> Result<Vec<u32>, LayoutError> {
        match self {
            Encoding::Blocked(layout) => layout.elems_per_thread(shape, ty),
            Encoding::Mma(layout) => layout.elems_per_thread(shape, ty),
            Encoding::Slice(layout) => layout.elems_per_thread(shape, ty),
            Encoding::DotOperand(layout) => layout.elems_per_thread(shape, ty),
            Encoding::Shared(layout) => layout.elems_per_thread(shape, ty),
        }
    }

    fn total_elems_per_thread(&self, shape: &[i64], ty: ScalarType) -> Result<u32, LayoutError> {
        match self {
            Encoding::Blocked(layout) => layout.total_elems_per_thread(shape, ty),
            Encoding::Mma(layout) => layout.total_elems_per_thread(shape, ty),
            Encoding::Slice(layout) => layout.total_elems_per_thread(shape, ty),
            Encoding::DotOperand(layout) => layout.total_elems_per_thread(shape, ty),
            Encoding::Shared(layout) => layout.total_elems_per_thread(shape, ty),
        }
    }

    fn verify_for_operand(&self, op: &dyn Operation, operand: usize) -> Result<(), VerifyError> {
        match self {
            Encoding::Blocked(layout) => layout.verify_for_operand(op, operand),
            Encoding::Mma(layout) => layout.verify_for_operand(op, operand),
            Encoding::Slice(layout) => layout.verify_for_operand(op, operand),
            Encoding::DotOperand(layout) => layout.verify_for_operand(op, operand),
            Encoding::Shared(layout) => layout.verify_for_operand(op, operand),
        }
    }
}

impl Encoding {
    /// Checks the invariants of the descriptor; run by the context before interning.
    pub fn validate(&self) -> Result<(), LayoutError> {
        match self {
            Encoding::Blocked(layout) => layout.validate(),
            Encoding::Mma(layout) => layout.validate(),
            Encoding::Slice(layout) => layout.validate(),
            Encoding::DotOperand(layout) => layout.validate(),
            Encoding::Shared(layout) => layout.validate(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Encoding::Blocked(_) => "blocked",
            Encoding::Mma(_) => "mma",
            Encoding::Slice(_) => "slice",
            Encoding::DotOperand(_) => "dot_op",
            Encoding::Shared(_) => "shared",
        }
    }

    /// Returns `true` for register-resident layouts.
    #[inline]
    pub fn is_distributed(&self) -> bool {
        !self.is_shared()
    }

    #[inline]
    pub fn is_shared(&self) -> bool {
        matches!(self, Encoding::Shared(_))
    }

    pub fn as_mma(&self) -> Option<&MmaEncoding> {
        match self {
            Encoding::Mma(layout) => Some(layout),
            _ => None,
        }
    }

    pub fn as_dot_operand(&self) -> Option<&DotOperandEncoding> {
        match self {
            Encoding::DotOperand(layout) => Some(layout),
            _ => None,
        }
    }

    /// Rank of the tensors this layout applies to.
    pub fn rank(&self) -> usize {
        match self {
            Encoding::Blocked(layout) => layout.rank(),
            Encoding::Mma(layout) => layout.warps_per_cta().len(),
            Encoding::Slice(layout) => layout.parent().rank().saturating_sub(1),
            Encoding::DotOperand(layout) => layout.parent().rank(),
            Encoding::Shared(layout) => layout.order().len(),
        }
    }

    /// Shared layouts also accept one extra leading dimension (the pipelining stage count).
    fn accepts_rank(&self, rank: usize) -> bool {
        match self {
            Encoding::Shared(layout) => {
                rank == layout.order().len() || rank == layout.order().len() + 1
            }
            _ => rank == self.rank(),
        }
    }
}

/// Queries shared by the distributed layouts, recursing through slice and dot-operand views.
impl Layout {
    pub fn size_per_thread(&self) -> Result<Vec<u32>, LayoutError> {
        match self.encoding() {
            Encoding::Blocked(layout) => Ok(layout.size_per_thread().clone()),
            Encoding::Mma(layout) => Ok(layout.size_per_thread()),
            Encoding::Slice(layout) => {
                let parent = layout.parent().size_per_thread()?;
                Ok(erase_dim(&parent, layout.dim() as usize))
            }
            Encoding::DotOperand(layout) => match layout.parent().as_mma() {
                Some(mma) if mma.is_ampere() => match layout.op_idx() {
                    0 => Ok(vec![2, 4]),
                    _ => Ok(vec![4, 2]),
                },
                _ => Err(LayoutError::Unsupported("size_per_thread", self.clone())),
            },
            Encoding::Shared(_) => Err(LayoutError::Unsupported("size_per_thread", self.clone())),
        }
    }

    pub fn threads_per_warp(&self) -> Result<Vec<u32>, LayoutError> {
        match self.encoding() {
            Encoding::Blocked(layout) => Ok(layout.threads_per_warp().clone()),
            Encoding::Mma(layout) => Ok(layout.threads_per_warp()),
            Encoding::Slice(layout) => {
                let dim = layout.dim() as usize;
                let parent = layout.parent().threads_per_warp()?;
                Ok(erase_dim(&parent, dim)
                    .into_iter()
                    .map(|x| x * parent[dim])
                    .collect())
            }
            Encoding::DotOperand(layout) => layout.parent().threads_per_warp(),
            Encoding::Shared(_) => Err(LayoutError::Unsupported("threads_per_warp", self.clone())),
        }
    }

    pub fn warps_per_cta(&self) -> Result<Vec<u32>, LayoutError> {
        match self.encoding() {
            Encoding::Blocked(layout) => Ok(layout.warps_per_cta().clone()),
            Encoding::Mma(layout) => Ok(layout.warps_per_cta().clone()),
            Encoding::Slice(layout) => {
                let dim = layout.dim() as usize;
                let parent = layout.parent().warps_per_cta()?;
                Ok(erase_dim(&parent, dim)
                    .into_iter()
                    .map(|x| x * parent[dim])
                    .collect())
            }
            Encoding::DotOperand(layout) => layout.parent().warps_per_cta(),
            Encoding::Shared(_) => Err(LayoutError::Unsupported("warps_per_cta", self.clone())),
        }
    }

    /// Total number of warps in one CTA.
    pub fn num_warps(&self) -> Result<u32, LayoutError> {
        match self.encoding() {
            Encoding::Slice(layout) => layout.parent().num_warps(),
            _ => self.warps_per_cta().map(|warps| shape::product(&warps)),
        }
    }

    /// Dimension order, fastest-changing first.
    pub fn order(&self) -> Vec<u32> {
        match self.encoding() {
            Encoding::Blocked(layout) => layout.order().clone(),
            Encoding::Mma(_) => vec![1, 0],
            Encoding::Slice(layout) => erase_order(&layout.parent().order(), layout.dim()),
            Encoding::DotOperand(layout) => layout.parent().order(),
            Encoding::Shared(layout) => layout.order().clone(),
        }
    }

    /// Number of consecutive elements along each dimension held by one thread.
    pub fn contig_per_thread(&self) -> Result<Vec<u32>, LayoutError> {
        match self.encoding() {
            Encoding::Blocked(layout) => Ok(layout.size_per_thread().clone()),
            Encoding::Mma(_) => Ok(vec![1, 2]),
            Encoding::Slice(layout) => {
                let parent = layout.parent().contig_per_thread()?;
                Ok(erase_dim(&parent, layout.dim() as usize))
            }
            Encoding::DotOperand(_) | Encoding::Shared(_) => {
                Err(LayoutError::Unsupported("contig_per_thread", self.clone()))
            }
        }
    }

    /// Extent covered by one CTA before the layout repeats.
    pub fn shape_per_cta_tile(&self) -> Result<Vec<u32>, LayoutError> {
        match self.encoding() {
            Encoding::Blocked(layout) => Ok(layout.shape_per_cta_tile()),
            Encoding::Mma(layout) => Ok(layout.shape_per_cta_tile()),
            Encoding::Slice(layout) => {
                let parent = layout.parent().shape_per_cta_tile()?;
                Ok(erase_dim(&parent, layout.dim() as usize))
            }
            Encoding::DotOperand(layout) => match layout.parent().as_mma() {
                Some(mma) if mma.is_ampere() => {
                    let parent = mma.shape_per_cta_tile();
                    match layout.op_idx() {
                        0 => Ok(vec![parent[0], 16]),
                        _ => Ok(vec![16, parent[1]]),
                    }
                }
                _ => Err(LayoutError::Unsupported("shape_per_cta_tile", self.clone())),
            },
            Encoding::Shared(_) => Err(LayoutError::Unsupported("shape_per_cta_tile", self.clone())),
        }
    }

    /// The partition descriptor of the layout, if it carries one directly.
    pub fn cta_layout(&self) -> Option<&CtaLayout> {
        match self.encoding() {
            Encoding::Blocked(layout) => Some(layout.cta_layout()),
            Encoding::Mma(layout) => Some(layout.cta_layout()),
            Encoding::Shared(layout) => Some(layout.cta_layout()),
            Encoding::Slice(_) | Encoding::DotOperand(_) => None,
        }
    }

    pub fn ctas_per_cga(&self) -> Result<Vec<u32>, LayoutError> {
        match self.encoding() {
            Encoding::Slice(layout) => {
                let dim = layout.dim() as usize;
                let parent = layout.parent().ctas_per_cga()?;
                // the dropped dimension must not be split across CTAs
                match parent[dim] {
                    1 => Ok(erase_dim(&parent, dim)),
                    _ => Err(LayoutError::Undefined("ctas_per_cga", self.clone())),
                }
            }
            Encoding::DotOperand(layout) => layout.parent().ctas_per_cga(),
            _ => Ok(self.direct_cta_layout().ctas_per_cga().clone()),
        }
    }

    pub fn cta_split_num(&self) -> Vec<u32> {
        match self.encoding() {
            Encoding::Slice(layout) => {
                erase_dim(&layout.parent().cta_split_num(), layout.dim() as usize)
            }
            Encoding::DotOperand(layout) => {
                let mut split = layout.parent().cta_split_num();
                // the reduction dimension of an operand is never split
                let k = match layout.op_idx() {
                    0 => 1,
                    _ => 0,
                };
                if let Some(x) = split.get_mut(k) {
                    *x = 1;
                }
                split
            }
            _ => self.direct_cta_layout().cta_split_num().clone(),
        }
    }

    pub fn cta_order(&self) -> Vec<u32> {
        match self.encoding() {
            Encoding::Slice(layout) => erase_order(&layout.parent().cta_order(), layout.dim()),
            Encoding::DotOperand(layout) => layout.parent().cta_order(),
            _ => self.direct_cta_layout().cta_order().clone(),
        }
    }

    pub fn num_ctas(&self) -> Result<u32, LayoutError> {
        match self.encoding() {
            Encoding::Slice(layout) => layout.parent().num_ctas(),
            _ => self.ctas_per_cga().map(|ctas| shape::product(&ctas)),
        }
    }

    /// Splits a global shape into the shape one CTA holds.
    pub fn shape_per_cta(&self, shape: &[i64]) -> Result<Vec<i64>, LayoutError> {
        if let Encoding::Shared(layout) = self.encoding() {
            let split = layout.cta_layout().cta_split_num();
            if shape.len() == split.len() + 1 {
                let mut result = shape::shape_per_cta(split, &shape[1..])?;
                result.insert(0, shape[0]);
                return Ok(result);
            }
        }
        shape::shape_per_cta(&self.cta_split_num(), shape)
    }

    /// For each element of a per-CTA tensor (in row-major order), the linear ids
    /// (`warp * warp_size + lane`) of the threads holding a copy of it.
    pub fn owners(&self, shape: &[i64]) -> Result<Vec<BTreeSet<u32>>, LayoutError> {
        match self.encoding() {
            Encoding::Blocked(layout) => layout.owners(shape),
            Encoding::Mma(layout) if layout.is_ampere() => layout.owners(shape),
            Encoding::Slice(layout) => {
                let padded = layout.padded_shape(shape);
                layout.parent().owners(&padded)
            }
            _ => Err(LayoutError::Unsupported("owners", self.clone())),
        }
    }

    /// Projects out `axis`, giving a slice view of this layout.
    pub fn squeeze(&self, axis: u32) -> Result<SliceEncoding, LayoutError> {
        SliceEncoding::new(axis, self.clone())
    }

    fn direct_cta_layout(&self) -> &CtaLayout {
        match self.encoding() {
            Encoding::Blocked(layout) => layout.cta_layout(),
            Encoding::Mma(layout) => layout.cta_layout(),
            Encoding::Shared(layout) => layout.cta_layout(),
            Encoding::Slice(layout) => layout.parent().direct_cta_layout(),
            Encoding::DotOperand(layout) => layout.parent().direct_cta_layout(),
        }
    }
}

/// Ownership of one coordinate along one dimension: the `(lane, warp)` positions holding it.
pub(crate) type DimOwners = Vec<(u32, u32)>;

/// Assembles per-dimension ownership into per-element sets of linear thread ids.
pub(crate) fn collect_owners(
    shape: &[i64],
    dim_owners: impl Fn(usize, i64) -> DimOwners,
    lanes: (&[u32], &[u32]),
    warps: (&[u32], &[u32]),
) -> Vec<BTreeSet<u32>> {
    let (threads_per_warp, lane_order) = lanes;
    let (warps_per_cta, warp_order) = warps;
    let warp_size = shape::product(threads_per_warp);

    let table = shape
        .iter()
        .enumerate()
        .map(|(d, &extent)| (0..extent).map(|x| dim_owners(d, x)).collect_vec())
        .collect_vec();

    shape
        .iter()
        .map(|&extent| 0..extent)
        .multi_cartesian_product()
        .map(|coord| {
            coord
                .iter()
                .enumerate()
                .map(|(d, &x)| table[d][x as usize].iter().copied())
                .multi_cartesian_product()
                .map(|positions| {
                    let (lane, warp): (Vec<_>, Vec<_>) = positions.into_iter().unzip();
                    let lane = shape::linearize(&lane, threads_per_warp, lane_order);
                    let warp = shape::linearize(&warp, warps_per_cta, warp_order);
                    warp * warp_size + lane
                })
                .collect()
        })
        .collect()
}

/// Positions inside a repeating tile of `tile` elements that hold coordinate `x` of a dimension
/// of `extent` elements; smaller tensors are replicated across the tile.
pub(crate) fn tile_positions(x: i64, extent: i64, tile: i64) -> impl Iterator<Item = i64> {
    let period = extent.min(tile).max(1);
    (0..tile).filter(move |p| p % period == x % period)
}

/// Inserts a unit dimension at `dim`, the shape a slice's parent sees.
pub(crate) fn pad_shape(shape: &[i64], dim: u32) -> Vec<i64> {
    insert_dim(shape, dim as usize, 1)
}
