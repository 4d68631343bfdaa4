use derive_getters::Getters;
use serde::{Deserialize, Serialize};

use super::LayoutError;
use crate::shape;

/// How a tensor is split across the CTAs of a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Getters, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CtaLayout {
    /// Number of CTAs along each dimension.
    ctas_per_cga: Vec<u32>,
    /// Number of distinct shape splits along each dimension; CTAs beyond it hold replicas.
    cta_split_num: Vec<u32>,
    /// CTA traversal order, fastest-changing first.
    cta_order: Vec<u32>,
}

impl CtaLayout {
    pub fn new(
        ctas_per_cga: Vec<u32>,
        cta_split_num: Vec<u32>,
        cta_order: Vec<u32>,
    ) -> Result<Self, LayoutError> {
        let layout = Self {
            ctas_per_cga,
            cta_split_num,
            cta_order,
        };
        layout.validate()?;
        Ok(layout)
    }

    /// A single CTA, traversed in row-major order.
    pub fn default_for(rank: usize) -> Self {
        Self {
            ctas_per_cga: vec![1; rank],
            cta_split_num: vec![1; rank],
            cta_order: (0..rank as u32).rev().collect(),
        }
    }

    #[inline]
    pub fn is_default(&self) -> bool {
        *self == Self::default_for(self.rank())
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.cta_order.len()
    }

    #[inline]
    pub fn num_ctas(&self) -> u32 {
        shape::product(&self.ctas_per_cga)
    }

    pub fn validate(&self) -> Result<(), LayoutError> {
        let rank = self.rank();
        shape::check_rank(rank, self.ctas_per_cga.len())?;
        shape::check_rank(rank, self.cta_split_num.len())?;
        if !shape::is_permutation(&self.cta_order) {
            return Err(LayoutError::Invalid(format!(
                "CTAOrder {:?} is not a permutation",
                self.cta_order
            )));
        }
        for (&ctas, &split) in self.ctas_per_cga.iter().zip(self.cta_split_num.iter()) {
            if split == 0 || ctas < split {
                return Err(LayoutError::Invalid(format!(
                    "CTAsPerCGA {:?} must cover CTASplitNum {:?}, both at least 1",
                    self.ctas_per_cga, self.cta_split_num
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::CtaLayout;

    #[test]
    fn test_default() {
        let layout = CtaLayout::default_for(3);
        assert_eq!(layout.cta_order(), &vec![2, 1, 0]);
        assert!(layout.is_default());
        assert_eq!(layout.num_ctas(), 1);
    }

    #[test]
    fn test_validate() {
        assert!(CtaLayout::new(vec![2, 1], vec![2, 1], vec![1, 0]).is_ok());
        assert!(CtaLayout::new(vec![4, 1], vec![2, 1], vec![0, 1]).is_ok());
        assert!(CtaLayout::new(vec![1, 1], vec![2, 1], vec![1, 0]).is_err());
        assert!(CtaLayout::new(vec![1, 1], vec![0, 1], vec![1, 0]).is_err());
        assert!(CtaLayout::new(vec![1, 1], vec![1, 1], vec![1, 1]).is_err());
        assert!(CtaLayout::new(vec![1], vec![1, 1], vec![1, 0]).is_err());
    }

    #[test]
    fn test_serde() {
        let layout = CtaLayout::new(vec![2, 2], vec![2, 1], vec![1, 0]).unwrap();
        let json = serde_json::to_string(&layout).unwrap();
        assert_eq!(
            json,
            r#"{"ctasPerCga":[2,2],"ctaSplitNum":[2,1],"ctaOrder":[1,0]}"#
        );
        let back: CtaLayout = serde_json::from_str(&json).unwrap();
        assert_eq!(back, layout);
    }
}
