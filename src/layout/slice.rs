use derive_getters::Getters;

use super::{pad_shape, Layout, LayoutError, LayoutInterface};
use crate::{num::ScalarType, shape::erase_dim};

/// A view of a distributed parent with dimension `dim` projected out.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Getters)]
pub struct SliceEncoding {
    #[getter(copy)]
    dim: u32,
    parent: Layout,
}

impl SliceEncoding {
    pub fn new(dim: u32, parent: Layout) -> Result<Self, LayoutError> {
        let layout = Self { dim, parent };
        layout.validate()?;
        Ok(layout)
    }

    pub fn validate(&self) -> Result<(), LayoutError> {
        if !self.parent.is_distributed() {
            return Err(LayoutError::NotDistributed("slice", self.parent.clone()));
        }
        let rank = self.parent.rank();
        match (self.dim as usize) < rank {
            true => Ok(()),
            false => Err(LayoutError::Invalid(format!(
                "slice dim {} out of range for a parent of rank {rank}",
                self.dim
            ))),
        }
    }

    /// The shape the parent sees: `shape` with a unit dimension put back at `dim`.
    #[inline]
    pub fn padded_shape(&self, shape: &[i64]) -> Vec<i64> {
        pad_shape(shape, self.dim)
    }
}

impl LayoutInterface for SliceEncoding {
    fn elems_per_thread(&self, shape: &[i64], ty: ScalarType) -> Result<Vec<u32>, LayoutError> {
        let padded = self.padded_shape(shape);
        let elems = self.parent.elems_per_thread(&padded, ty)?;
        Ok(erase_dim(&elems, self.dim as usize))
    }
}
