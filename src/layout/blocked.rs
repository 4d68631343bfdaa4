use std::collections::BTreeSet;

use derive_getters::Getters;
use itertools::Itertools;

use super::{collect_owners, tile_positions, CtaLayout, LayoutError, LayoutInterface};
use crate::{
    num::ScalarType,
    shape::{self, ceil_div, check_rank, clamp, saturate},
};

/// Elements are divided into contiguous per-thread, per-warp and per-CTA tiles.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Getters)]
pub struct BlockedEncoding {
    size_per_thread: Vec<u32>,
    threads_per_warp: Vec<u32>,
    warps_per_cta: Vec<u32>,
    order: Vec<u32>,
    cta_layout: CtaLayout,
}

impl BlockedEncoding {
    pub fn new(
        size_per_thread: Vec<u32>,
        threads_per_warp: Vec<u32>,
        warps_per_cta: Vec<u32>,
        order: Vec<u32>,
        cta_layout: CtaLayout,
    ) -> Result<Self, LayoutError> {
        let layout = Self {
            size_per_thread,
            threads_per_warp,
            warps_per_cta,
            order,
            cta_layout,
        };
        layout.validate()?;
        Ok(layout)
    }

    /// Distributes `num_warps` warps of `threads_per_warp` threads over `shape`.
    ///
    /// Dimensions are visited from the fastest-changing one; each takes as many threads as its
    /// per-CTA extent can use, lanes first and warps second. The slowest-changing dimension absorbs
    /// whatever lanes and warps are left, so the products always match the requested counts.
    pub fn from_shape(
        shape: &[i64],
        size_per_thread: &[u32],
        order: &[u32],
        num_warps: u32,
        threads_per_warp: u32,
        cta_layout: CtaLayout,
    ) -> Result<Self, LayoutError> {
        #[cfg(feature = "trace")]
        let _span = tracing::trace_span!("blocked").entered();

        let rank = size_per_thread.len();
        check_rank(rank, shape.len())?;
        check_rank(rank, order.len())?;
        check_rank(rank, cta_layout.rank())?;
        check_builder_inputs(size_per_thread, order, num_warps, threads_per_warp)?;

        let shape_per_cta = shape::shape_per_cta(cta_layout.cta_split_num(), shape)?;

        let mut lanes = vec![1; rank];
        let mut warps = vec![1; rank];
        let mut remaining_lanes = threads_per_warp;
        let mut remaining_threads = num_warps.checked_mul(threads_per_warp).ok_or_else(|| {
            LayoutError::Invalid(format!(
                "{num_warps} warps of {threads_per_warp} threads overflow the thread count"
            ))
        })?;
        let mut remaining_warps = num_warps;
        let mut prev_lanes = 1;
        let mut prev_warps = 1;

        for &i in &order[..rank - 1] {
            let i = i as usize;
            let capacity = saturate(shape_per_cta[i] / size_per_thread[i] as i64);
            let threads_per_cta = clamp(remaining_threads, 1, capacity);
            lanes[i] = clamp(threads_per_cta, 1, remaining_lanes);
            warps[i] = clamp(threads_per_cta / lanes[i], 1, remaining_warps);
            remaining_warps /= warps[i];
            remaining_lanes /= lanes[i];
            remaining_threads /= threads_per_cta;
            prev_lanes *= lanes[i];
            prev_warps *= warps[i];
        }

        let last = order[rank - 1] as usize;
        lanes[last] = threads_per_warp / prev_lanes;
        warps[last] = num_warps / prev_warps;

        if shape::product(&lanes) != threads_per_warp || shape::product(&warps) != num_warps {
            return Err(LayoutError::Invalid(format!(
                "cannot distribute {num_warps} warps of {threads_per_warp} threads over shape {shape:?}"
            )));
        }

        let layout = Self::new(
            size_per_thread.to_vec(),
            lanes,
            warps,
            order.to_vec(),
            cta_layout,
        )?;
        log::debug!(
            "blocked layout for {shape:?}: threads per warp {:?}, warps per CTA {:?}",
            layout.threads_per_warp,
            layout.warps_per_cta
        );
        if !layout.fits(shape) {
            log::debug!("blocked layout tile exceeds {shape:?} and wraps");
        }
        Ok(layout)
    }

    /// Like [`BlockedEncoding::from_shape`], but first splits the tensor over `num_ctas` CTAs.
    ///
    /// CTAs are allocated from the slowest-changing dimension inward; the fastest-changing
    /// dimension absorbs the CTAs left over by multiplication.
    pub fn from_shape_with_ctas(
        shape: &[i64],
        size_per_thread: &[u32],
        order: &[u32],
        num_warps: u32,
        threads_per_warp: u32,
        num_ctas: u32,
    ) -> Result<Self, LayoutError> {
        let rank = size_per_thread.len();
        check_rank(rank, shape.len())?;
        check_rank(rank, order.len())?;
        check_builder_inputs(size_per_thread, order, num_warps, threads_per_warp)?;
        if num_ctas == 0 {
            return Err(LayoutError::Invalid("CTA count must be at least 1".into()));
        }

        let mut ctas_per_cga = vec![1; rank];
        let mut cta_split_num = vec![1; rank];
        let mut remaining_ctas = num_ctas;

        for &i in order.iter().rev() {
            let i = i as usize;
            let capacity = saturate(shape[i] / size_per_thread[i] as i64);
            ctas_per_cga[i] = clamp(remaining_ctas, 1, capacity);
            cta_split_num[i] = ctas_per_cga[i];
            remaining_ctas /= ctas_per_cga[i];
        }
        ctas_per_cga[order[0] as usize] *= remaining_ctas;

        if shape::product(&ctas_per_cga) != num_ctas {
            return Err(LayoutError::Invalid(format!(
                "cannot distribute {num_ctas} CTAs over shape {shape:?}"
            )));
        }

        let cta_layout = CtaLayout::new(ctas_per_cga, cta_split_num, order.to_vec())?;
        Self::from_shape(
            shape,
            size_per_thread,
            order,
            num_warps,
            threads_per_warp,
            cta_layout,
        )
    }

    pub fn validate(&self) -> Result<(), LayoutError> {
        let rank = self.rank();
        check_rank(rank, self.size_per_thread.len())?;
        check_rank(rank, self.threads_per_warp.len())?;
        check_rank(rank, self.warps_per_cta.len())?;
        check_rank(rank, self.cta_layout.rank())?;
        self.cta_layout.validate()?;
        if !shape::is_permutation(&self.order) {
            return Err(LayoutError::Invalid(format!(
                "order {:?} is not a permutation",
                self.order
            )));
        }
        let params = [
            &self.size_per_thread,
            &self.threads_per_warp,
            &self.warps_per_cta,
        ];
        if params.iter().any(|values| values.contains(&0)) {
            return Err(LayoutError::Invalid(
                "blocked layout parameters must be at least 1".into(),
            ));
        }
        Ok(())
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.order.len()
    }

    /// Extent one CTA covers along each dimension before repeating.
    pub fn shape_per_cta_tile(&self) -> Vec<u32> {
        itertools::izip!(
            &self.size_per_thread,
            &self.threads_per_warp,
            &self.warps_per_cta
        )
        .map(|(x, y, z)| x * y * z)
        .collect()
    }

    /// Returns `true` if the cluster-wide tile does not exceed the power-of-two padded `shape`.
    pub fn fits(&self, shape: &[i64]) -> bool {
        shape.len() == self.rank()
            && self
                .shape_per_cta_tile()
                .iter()
                .zip_eq(self.cta_layout.ctas_per_cga())
                .zip_eq(shape)
                .all(|((&tile, &ctas), &dim)| {
                    let padded = (dim.max(1) as u64).next_power_of_two();
                    (tile as u64) * (ctas as u64) <= padded
                })
    }

    pub(crate) fn owners(&self, shape: &[i64]) -> Result<Vec<BTreeSet<u32>>, LayoutError> {
        check_rank(self.rank(), shape.len())?;
        let tile = self.shape_per_cta_tile();
        let dim_owners = |d: usize, x: i64| {
            let size = self.size_per_thread[d] as i64;
            let lanes = self.threads_per_warp[d] as i64;
            let warps = self.warps_per_cta[d] as i64;
            tile_positions(x, shape[d], tile[d] as i64)
                .map(|p| (((p / size) % lanes) as u32, ((p / (size * lanes)) % warps) as u32))
                .unique()
                .collect()
        };
        Ok(collect_owners(
            shape,
            dim_owners,
            (self.threads_per_warp.as_slice(), self.order.as_slice()),
            (self.warps_per_cta.as_slice(), self.order.as_slice()),
        ))
    }
}

impl LayoutInterface for BlockedEncoding {
    fn elems_per_thread(&self, shape: &[i64], _ty: ScalarType) -> Result<Vec<u32>, LayoutError> {
        check_rank(self.rank(), shape.len())?;
        let shape_per_cta = shape::shape_per_cta(self.cta_layout.cta_split_num(), shape)?;
        Ok(self
            .shape_per_cta_tile()
            .iter()
            .zip_eq(&shape_per_cta)
            .zip_eq(&self.size_per_thread)
            .map(|((&tile, &dim), &size)| saturate(ceil_div(dim, tile as i64)) * size)
            .collect())
    }
}

fn check_builder_inputs(
    size_per_thread: &[u32],
    order: &[u32],
    num_warps: u32,
    threads_per_warp: u32,
) -> Result<(), LayoutError> {
    if size_per_thread.is_empty() {
        return Err(LayoutError::Invalid("blocked layout of rank 0".into()));
    }
    if size_per_thread.contains(&0) || num_warps == 0 || threads_per_warp == 0 {
        return Err(LayoutError::Invalid(
            "sizes, warp count and warp size must be at least 1".into(),
        ));
    }
    if !shape::is_permutation(order) {
        return Err(LayoutError::Invalid(format!(
            "order {order:?} is not a permutation"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use anyhow::Result;
    use itertools::Itertools;

    use super::BlockedEncoding;
    use crate::{
        context::ContextBuilder,
        layout::{CtaLayout, LayoutError, LayoutInterface},
        num::ScalarType,
    };

    #[test]
    fn test_row_major() -> Result<()> {
        let layout = BlockedEncoding::from_shape(
            &[128, 64],
            &[1, 4],
            &[1, 0],
            4,
            32,
            CtaLayout::default_for(2),
        )?;
        assert_eq!(layout.threads_per_warp(), &vec![2, 16]);
        assert_eq!(layout.warps_per_cta(), &vec![4, 1]);
        assert_eq!(layout.shape_per_cta_tile(), vec![8, 64]);
        assert!(layout.fits(&[128, 64]));
        assert_eq!(layout.elems_per_thread(&[128, 64], ScalarType::F16)?, vec![16, 4]);
        assert_eq!(layout.total_elems_per_thread(&[128, 64], ScalarType::F16)?, 64);
        Ok(())
    }

    #[test]
    fn test_column_fastest() -> Result<()> {
        let layout = BlockedEncoding::from_shape(
            &[32, 32],
            &[2, 2],
            &[0, 1],
            2,
            32,
            CtaLayout::default_for(2),
        )?;
        // dimension 0 can hold 32 / 2 = 16 threads and takes 16 lanes; dimension 1 absorbs the
        // remaining lanes and both warps
        assert_eq!(layout.threads_per_warp(), &vec![16, 2]);
        assert_eq!(layout.warps_per_cta(), &vec![1, 2]);
        assert_eq!(layout.shape_per_cta_tile(), vec![32, 8]);
        assert_eq!(layout.elems_per_thread(&[32, 32], ScalarType::F32)?, vec![2, 8]);
        Ok(())
    }

    #[test]
    fn test_small_shape_wraps() -> Result<()> {
        let layout = BlockedEncoding::from_shape(
            &[4, 4],
            &[1, 1],
            &[1, 0],
            4,
            32,
            CtaLayout::default_for(2),
        )?;
        assert_eq!(layout.threads_per_warp(), &vec![8, 4]);
        assert_eq!(layout.warps_per_cta(), &vec![4, 1]);
        assert!(!layout.fits(&[4, 4]));
        assert_eq!(layout.total_elems_per_thread(&[4, 4], ScalarType::F32)?, 1);
        Ok(())
    }

    #[test]
    fn test_products() -> Result<()> {
        fastrand::seed(42);
        for _ in 0..256 {
            let rank = fastrand::usize(1..=3);
            let shape = (0..rank)
                .map(|_| 1i64 << fastrand::u32(0..9))
                .collect_vec();
            let size_per_thread = (0..rank)
                .map(|_| 1u32 << fastrand::u32(0..3))
                .collect_vec();
            let mut order = (0..rank as u32).collect_vec();
            fastrand::shuffle(&mut order);
            let num_warps = 1 << fastrand::u32(0..4);
            let threads_per_warp = [32, 64][fastrand::usize(0..2)];
            let num_ctas = 1 << fastrand::u32(0..3);

            let layout = BlockedEncoding::from_shape_with_ctas(
                &shape,
                &size_per_thread,
                &order,
                num_warps,
                threads_per_warp,
                num_ctas,
            )?;
            assert_eq!(layout.threads_per_warp().iter().product::<u32>(), threads_per_warp);
            assert_eq!(layout.warps_per_cta().iter().product::<u32>(), num_warps);
            assert_eq!(layout.cta_layout().num_ctas(), num_ctas);
        }
        Ok(())
    }

    #[test]
    fn test_cta_split() -> Result<()> {
        let layout = BlockedEncoding::from_shape_with_ctas(&[64, 64], &[1, 4], &[1, 0], 4, 32, 4)?;
        let cta = layout.cta_layout();
        assert_eq!(cta.ctas_per_cga(), &vec![4, 1]);
        assert_eq!(cta.cta_split_num(), &vec![4, 1]);
        assert_eq!(cta.cta_order(), &vec![1, 0]);
        assert_eq!(layout.elems_per_thread(&[64, 64], ScalarType::F32)?, vec![2, 4]);

        // more CTAs than the tensor can be split into: the fastest dimension replicates
        let layout = BlockedEncoding::from_shape_with_ctas(&[2, 4], &[1, 4], &[1, 0], 1, 32, 4)?;
        let cta = layout.cta_layout();
        assert_eq!(cta.ctas_per_cga(), &vec![2, 2]);
        assert_eq!(cta.cta_split_num(), &vec![2, 1]);
        Ok(())
    }

    #[test]
    fn test_invalid_inputs() {
        let cta = CtaLayout::default_for(2);
        assert!(matches!(
            BlockedEncoding::from_shape(&[32, 32], &[1, 1], &[0, 0], 4, 32, cta.clone()),
            Err(LayoutError::Invalid(_))
        ));
        assert!(matches!(
            BlockedEncoding::from_shape(&[32], &[1, 1], &[1, 0], 4, 32, cta.clone()),
            Err(LayoutError::Rank { .. })
        ));
        assert!(BlockedEncoding::from_shape(&[32, 32], &[1, 1], &[1, 0], 0, 32, cta.clone()).is_err());
        assert!(matches!(
            BlockedEncoding::from_shape(&[32, 32], &[1, 1], &[1, 0], 1 << 16, 1 << 16, cta),
            Err(LayoutError::Invalid(_))
        ));
    }

    #[test]
    fn test_owners() -> Result<()> {
        let context = ContextBuilder::new().build();
        let layout = context.get(BlockedEncoding::new(
            vec![1, 1],
            vec![4, 4],
            vec![1, 1],
            vec![1, 0],
            CtaLayout::default_for(2),
        )?)?;

        let owners = layout.owners(&[4, 4])?;
        assert_eq!(owners.len(), 16);
        assert!(owners.iter().all(|set| set.len() == 1));
        let all: BTreeSet<_> = owners.iter().flatten().copied().collect();
        assert_eq!(all.len(), 16);
        assert_eq!(owners[4], BTreeSet::from([4]));

        // rows replicate when the tensor is smaller than the tile
        let owners = layout.owners(&[2, 4])?;
        assert_eq!(owners[0], BTreeSet::from([0, 8]));
        assert_eq!(owners[5], BTreeSet::from([5, 13]));
        Ok(())
    }

    #[test]
    fn test_owners_with_warps() -> Result<()> {
        let context = ContextBuilder::new().build();
        let layout = context.get(BlockedEncoding::new(
            vec![2, 1],
            vec![2, 2],
            vec![1, 2],
            vec![1, 0],
            CtaLayout::default_for(2),
        )?)?;
        let owners = layout.owners(&[4, 4])?;
        // element (1, 0): lane (0, 0) of warp 0; element (2, 3): lane (1, 1) of warp 1
        assert_eq!(owners[4], BTreeSet::from([0]));
        assert_eq!(owners[2 * 4 + 3], BTreeSet::from([4 + 3]));
        Ok(())
    }
}
