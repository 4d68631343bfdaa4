use derive_getters::Getters;
use rustc_hash::FxHashSet;

use super::{
    mma::{volta_pack_size, VoltaStates},
    Encoding, Layout, LayoutError, LayoutInterface,
};
use crate::{
    num::ScalarType,
    shape::{self, check_rank, saturate},
    verify::{Operation, VerifyError},
};

/// Vector width multiplier a generation-2 operand of element type `ty` is loaded with.
#[inline]
pub fn widen_factor_for(ty: ScalarType) -> u32 {
    (32 / ty.bit_width()).max(1)
}

/// The view of a matrix-multiply input operand onto the layout of the result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Getters)]
pub struct DotOperandEncoding {
    /// 0 for the left operand `A[M, K]`, 1 for the right operand `B[K, N]`.
    #[getter(copy)]
    op_idx: u32,
    parent: Layout,
    /// Only meaningful for generation-2 tensor-core parents, 0 otherwise.
    #[getter(copy)]
    widen_factor: u32,
}

impl DotOperandEncoding {
    pub fn new(op_idx: u32, parent: Layout, widen_factor: u32) -> Result<Self, LayoutError> {
        let layout = Self {
            op_idx,
            parent,
            widen_factor,
        };
        layout.validate()?;
        Ok(layout)
    }

    /// Derives the widen factor from the operand's element type.
    pub fn from_element(op_idx: u32, parent: Layout, ty: ScalarType) -> Result<Self, LayoutError> {
        let widen_factor = match parent.as_mma() {
            Some(mma) if mma.is_ampere() => widen_factor_for(ty),
            _ => 0,
        };
        Self::new(op_idx, parent, widen_factor)
    }

    pub fn validate(&self) -> Result<(), LayoutError> {
        if self.op_idx > 1 {
            return Err(LayoutError::OperandIndex(self.op_idx));
        }
        if !self.parent.is_distributed() {
            return Err(LayoutError::NotDistributed("dot_op", self.parent.clone()));
        }
        check_rank(2, self.parent.rank())?;
        let ampere = self.parent.as_mma().is_some_and(|mma| mma.is_ampere());
        match (ampere, self.widen_factor) {
            (true, 0) => Err(LayoutError::Invalid(
                "kWidth is mandatory for a generation-2 tensor-core parent".into(),
            )),
            (false, widen) if widen != 0 => Err(LayoutError::Invalid(format!(
                "kWidth = {widen} given for a parent that is not generation-2 tensor-core"
            ))),
            _ => Ok(()),
        }
    }

    fn volta_states(&self) -> Result<VoltaStates, LayoutError> {
        match self.parent.as_mma() {
            Some(mma) if mma.is_volta() => Ok(mma.decode_volta_layout_states()),
            _ => Err(LayoutError::Unsupported("mmav1", self.parent.clone())),
        }
    }

    fn parent_warps(&self) -> [u32; 2] {
        match self.parent.encoding() {
            Encoding::Mma(mma) => [mma.warps_per_cta()[0], mma.warps_per_cta()[1]],
            _ => [1, 1],
        }
    }

    pub fn mmav1_is_row(&self) -> Result<bool, LayoutError> {
        let states = self.volta_states()?;
        Ok(match self.op_idx {
            0 => states.is_a_row,
            _ => states.is_b_row,
        })
    }

    pub fn mmav1_is_vec4(&self) -> Result<bool, LayoutError> {
        let states = self.volta_states()?;
        Ok(match self.op_idx {
            0 => states.is_a_vec4,
            _ => states.is_b_vec4,
        })
    }

    /// Replication `[M, N, K]`; only the entry of this operand's outer dimension is set.
    pub fn mmav1_rep(&self) -> Result<[u32; 3], LayoutError> {
        let rep = 2 * volta_pack_size(self.op_idx, self.mmav1_is_row()?, self.mmav1_is_vec4()?);
        Ok(match self.op_idx {
            0 => [rep, 0, 1],
            _ => [0, rep, 1],
        })
    }

    pub fn mmav1_shape_per_warp(&self) -> Result<[u32; 3], LayoutError> {
        let rep = self.mmav1_rep()?;
        Ok(match self.op_idx {
            0 => [8 * rep[0], 0, 1],
            _ => [0, 8 * rep[1], 1],
        })
    }

    pub fn mmav1_vec(&self) -> Result<u32, LayoutError> {
        let rep = self.mmav1_rep()?;
        Ok(2 * rep[self.op_idx as usize])
    }

    /// Number of outer (M for A, N for B) repetitions over a tensor of `shape`.
    pub fn mmav1_num_outer(&self, shape: &[i64]) -> Result<u32, LayoutError> {
        check_rank(2, shape.len())?;
        let d = self.op_idx as usize;
        let rep = self.mmav1_rep()?[d] as i64;
        let spw = self.mmav1_shape_per_warp()?[d] as i64;
        let warps = self.parent_warps()[d] as i64;
        Ok(saturate(rep * shape[d] / (spw * warps)))
    }

    /// Generation-2 repetitions of the operand tile: `[M, K]` for A, `[K, N]` for B.
    pub fn mmav2_rep(&self, shape: &[i64], bit_width: u32) -> Result<[u32; 2], LayoutError> {
        check_rank(2, shape.len())?;
        match self.parent.as_mma() {
            Some(mma) if mma.is_ampere() => {}
            _ => return Err(LayoutError::Unsupported("mmav2", self.parent.clone())),
        }
        let warps = self.parent_warps().map(|x| x as i64);
        let shape_per_warp = [16, 8, 4 * 64 / bit_width.max(1) as i64];
        let rep = |x: i64| saturate(x).max(1);
        Ok(match self.op_idx {
            0 => [
                rep(shape[0] / (shape_per_warp[0] * warps[0])),
                rep(shape[1] / shape_per_warp[2]),
            ],
            _ => [
                rep(shape[0] / shape_per_warp[2]),
                rep(shape[1] / (shape_per_warp[1] * warps[1])),
            ],
        })
    }

    /// Counts the distinct 2-element registers a generation-1 operand load touches.
    fn volta_total_elems(&self, shape: &[i64]) -> Result<u32, LayoutError> {
        let is_row = self.mmav1_is_row()?;
        let vec = self.mmav1_vec()?;
        let num_outer = self.mmav1_num_outer(shape)? as i64;
        let k_extent = match self.op_idx {
            0 => shape[1],
            _ => shape[0],
        };

        // A advances along K when row-major, B when column-major
        let along_k = match self.op_idx {
            0 => is_row,
            _ => !is_row,
        };
        let mut visited = FxHashSet::default();
        for k in (0..k_extent).step_by(4) {
            for outer in 0..num_outer / 2 {
                if !visited.insert((outer, k)) {
                    continue;
                }
                if vec > 4 {
                    match along_k {
                        true => visited.insert((outer, k + 4)),
                        false => visited.insert((outer + 1, k)),
                    };
                }
            }
        }
        Ok(visited.len() as u32 * 2)
    }

    fn blocked_total_elems(&self, shape: &[i64]) -> Result<u32, LayoutError> {
        let (size_per_thread, tile) = match self.parent.encoding() {
            Encoding::Blocked(blocked) => (blocked.size_per_thread(), blocked.shape_per_cta_tile()),
            _ => return Err(LayoutError::Unsupported("total_elems_per_thread", self.parent.clone())),
        };
        let (k, other, d) = match self.op_idx {
            0 => (shape[1], shape[0], 0),
            _ => (shape[0], shape[1], 1),
        };
        let reps = (other / tile[d] as i64).max(1);
        Ok(saturate(k * reps) * size_per_thread[d])
    }
}

impl LayoutInterface for DotOperandEncoding {
    fn elems_per_thread(&self, shape: &[i64], ty: ScalarType) -> Result<Vec<u32>, LayoutError> {
        let shape_per_cta = shape::shape_per_cta(&self.parent.cta_split_num(), shape)?;
        let rep = self.mmav2_rep(&shape_per_cta, ty.bit_width())?;
        Ok(match self.op_idx {
            0 => vec![2 * rep[0], 2 * rep[1]],
            _ => vec![2 * rep[0], 2 * (rep[1] / 2).max(1)],
        })
    }

    fn total_elems_per_thread(&self, shape: &[i64], ty: ScalarType) -> Result<u32, LayoutError> {
        check_rank(2, shape.len())?;
        let shape_per_cta = shape::shape_per_cta(&self.parent.cta_split_num(), shape)?;
        match self.parent.encoding() {
            Encoding::Mma(mma) if mma.is_ampere() => {
                let rep = self.mmav2_rep(&shape_per_cta, ty.bit_width())?;
                Ok(match self.op_idx {
                    0 => 4 * rep[0] * rep[1],
                    _ => 4 * rep[0] * (rep[1] / 2).max(1),
                })
            }
            Encoding::Mma(mma) if mma.is_volta() => self.volta_total_elems(&shape_per_cta),
            Encoding::Blocked(_) => self.blocked_total_elems(&shape_per_cta),
            _ => Err(LayoutError::Unsupported(
                "total_elems_per_thread",
                self.parent.clone(),
            )),
        }
    }

    fn verify_for_operand(&self, op: &dyn Operation, operand: usize) -> Result<(), VerifyError> {
        let Some(ty) = op.operands().get(operand) else {
            return Err(VerifyError::new(op, operand, "operand index out of range"));
        };
        match self.parent.as_mma() {
            Some(mma) if mma.is_ampere() => {
                let expected = widen_factor_for(ty.element);
                match self.widen_factor == expected {
                    true => Ok(()),
                    false => Err(VerifyError::new(
                        op,
                        operand,
                        format!(
                            "kWidth = {} does not match element type {} (expected {expected})",
                            self.widen_factor, ty.element
                        ),
                    )),
                }
            }
            _ => Ok(()),
        }
    }
}
