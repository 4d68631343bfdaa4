use derive_getters::Getters;

use super::{CtaLayout, DotOperandEncoding, LayoutError, LayoutInterface};
use crate::{
    num::ScalarType,
    shape::{self, check_rank, saturate},
};

/// Swizzled arrangement of a tensor resident in shared memory.
///
/// Rows are grouped into phases of `per_phase` rows; within a row, runs of `vec` contiguous
/// elements are XOR-permuted by the phase index modulo `max_phase`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Getters)]
pub struct SharedEncoding {
    #[getter(copy)]
    vec: u32,
    #[getter(copy)]
    per_phase: u32,
    #[getter(copy)]
    max_phase: u32,
    order: Vec<u32>,
    cta_layout: CtaLayout,
    #[getter(copy)]
    has_leading_offset: bool,
}

impl SharedEncoding {
    pub fn new(
        vec: u32,
        per_phase: u32,
        max_phase: u32,
        order: Vec<u32>,
        cta_layout: CtaLayout,
    ) -> Result<Self, LayoutError> {
        Self::with_leading_offset(vec, per_phase, max_phase, order, cta_layout, false)
    }

    pub fn with_leading_offset(
        vec: u32,
        per_phase: u32,
        max_phase: u32,
        order: Vec<u32>,
        cta_layout: CtaLayout,
        has_leading_offset: bool,
    ) -> Result<Self, LayoutError> {
        let layout = Self {
            vec,
            per_phase,
            max_phase,
            order,
            cta_layout,
            has_leading_offset,
        };
        layout.validate()?;
        Ok(layout)
    }

    fn unswizzled(order: Vec<u32>, cta_layout: CtaLayout) -> Result<Self, LayoutError> {
        Self::new(1, 1, 1, order, cta_layout)
    }

    /// Picks the swizzle that lets an operand of a matrix multiply be loaded conflict-free into
    /// the `dot` layout.
    pub fn from_dot_operand(
        dot: &DotOperandEncoding,
        shape: &[i64],
        order: Vec<u32>,
        cta_layout: CtaLayout,
        bit_width: u32,
    ) -> Result<Self, LayoutError> {
        #[cfg(feature = "trace")]
        let _span = tracing::trace_span!("swizzle_dot_operand").entered();

        check_rank(2, shape.len())?;
        check_rank(2, order.len())?;
        if !shape::is_permutation(&order) {
            return Err(LayoutError::Invalid(format!(
                "order {order:?} is not a permutation"
            )));
        }
        let Some(mma) = dot.parent().as_mma() else {
            return Self::unswizzled(order, cta_layout);
        };

        let op_idx = dot.op_idx();
        let shape_per_cta = shape::shape_per_cta(cta_layout.cta_split_num(), shape)?;
        let contig = saturate(shape_per_cta[order[0] as usize]).max(1);
        let bit_width = bit_width.max(1);
        // A[M, K] keeps M at index 0, B[K, N] keeps N at index 1
        let inner = op_idx;

        if mma.is_volta() {
            let per_phase = (128 / (contig * bit_width / 8).max(1)).max(1);
            let is_row = order[0] != 0;
            let is_vec4 = match op_idx {
                0 => !is_row && contig <= 16,
                _ => is_row && contig <= 16,
            };
            let pack = super::mma::volta_pack_size(op_idx, is_row, is_vec4);
            let rep = 2 * pack;
            let max_phase = match order[inner as usize] == 1 {
                true => 8,
                false => 4,
            } / per_phase;
            return Self::new(2 * rep, per_phase, max_phase.max(1), order, cta_layout);
        }

        if mma.is_ampere() {
            let widen = dot.widen_factor();
            let per_phase = (128 / (contig * 4 / widen.max(1)).max(1)).max(1);
            let mat_shape = [8, 8, 4 * widen];

            // transposed narrow-width operands are loaded without swizzling
            if 32 / bit_width != widen && order[0] == inner {
                log::warn!(
                    "swizzling disabled for transposed operand {op_idx} of {bit_width}-bit elements"
                );
                return Self::unswizzled(order, cta_layout);
            }

            let (vec, stride) = match (op_idx, order[0]) {
                (0, 1) => (mat_shape[2], mat_shape[0]),
                (0, _) => (mat_shape[0], mat_shape[2]),
                (_, 1) => (mat_shape[1], mat_shape[2]),
                (_, _) => (mat_shape[2], mat_shape[1]),
            };
            let max_phase = (stride / per_phase).max(1);
            return Self::new(vec, per_phase, max_phase, order, cta_layout);
        }

        Err(LayoutError::NotImplemented(
            "shared layout swizzling for generation-3 tensor-core operands",
        ))
    }

    pub fn from_dot_operand_element(
        dot: &DotOperandEncoding,
        shape: &[i64],
        order: Vec<u32>,
        cta_layout: CtaLayout,
        ty: ScalarType,
    ) -> Result<Self, LayoutError> {
        Self::from_dot_operand(dot, shape, order, cta_layout, ty.bit_width())
    }

    /// The tiered swizzle used for operand storage of generation-3 tensor cores, chosen from the
    /// byte extent of the contiguous dimension.
    pub fn from_shape(
        shape: &[i64],
        order: Vec<u32>,
        cta_layout: CtaLayout,
        ty: ScalarType,
    ) -> Result<Self, LayoutError> {
        check_rank(order.len(), shape.len())?;
        let shape_per_cta = shape::shape_per_cta(cta_layout.cta_split_num(), shape)?;
        let bit_width = ty.bit_width();
        let contig = shape_per_cta
            .get(order.first().copied().unwrap_or_default() as usize)
            .copied()
            .unwrap_or(1);
        let bytes = contig * bit_width as i64 / 8;

        let vec = 128 / bit_width;
        let (per_phase, max_phase) = match bytes {
            x if x >= 128 && x % 128 == 0 => (1, 8),
            x if x >= 64 && x % 64 == 0 => (2, 4),
            x if x >= 32 && x % 32 == 0 => (4, 2),
            x => return Err(LayoutError::SwizzleExtent(x)),
        };
        log::debug!("swizzle for {bytes}-byte rows of {ty}: vec {vec}, phase {per_phase}/{max_phase}");
        Self::with_leading_offset(vec, per_phase, max_phase, order, cta_layout, true)
    }

    pub fn validate(&self) -> Result<(), LayoutError> {
        check_rank(self.cta_layout.rank(), self.order.len())?;
        self.cta_layout.validate()?;
        if !shape::is_permutation(&self.order) {
            return Err(LayoutError::Invalid(format!(
                "order {:?} is not a permutation",
                self.order
            )));
        }
        if self.vec == 0 || self.per_phase == 0 || self.max_phase == 0 {
            return Err(LayoutError::Invalid(
                "vec, perPhase and maxPhase must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl LayoutInterface for SharedEncoding {
    fn elems_per_thread(&self, _shape: &[i64], _ty: ScalarType) -> Result<Vec<u32>, LayoutError> {
        Err(LayoutError::NotImplemented(
            "per-thread element counts of a shared memory layout",
        ))
    }
}
