use std::collections::BTreeSet;

use derive_getters::Getters;
use itertools::Itertools;

use super::{collect_owners, tile_positions, CtaLayout, LayoutError, LayoutInterface};
use crate::{
    num::ScalarType,
    shape::{self, ceil_div, check_rank, clamp, saturate},
};

/// Bits of a generation-1 `versionMinor` reserved for the instance id, above the 4 flag bits.
pub const NUM_BITS_TO_HOLD_MMA_V1_ID: u32 = 5;

const VOLTA_FLAG_BITS: u32 = 4;

/// Operand storage flags of a generation-1 tensor-core layout, plus the instance id that keeps
/// otherwise identical layouts apart.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VoltaStates {
    pub is_a_row: bool,
    pub is_b_row: bool,
    pub is_a_vec4: bool,
    pub is_b_vec4: bool,
    pub id: u32,
}

impl VoltaStates {
    /// Packs the flags into bits `[0, 4)` and the id into bits `[4, 4 + NUM_BITS_TO_HOLD_MMA_V1_ID)`.
    #[inline]
    pub fn encode(&self) -> u32 {
        (self.is_a_row as u32)
            | (self.is_b_row as u32) << 1
            | (self.is_a_vec4 as u32) << 2
            | (self.is_b_vec4 as u32) << 3
            | self.id << VOLTA_FLAG_BITS
    }

    /// Exact inverse of [`VoltaStates::encode`] on the valid bit range.
    #[inline]
    pub fn decode(minor: u32) -> Self {
        let id_mask = (1 << NUM_BITS_TO_HOLD_MMA_V1_ID) - 1;
        Self {
            is_a_row: minor & 1 != 0,
            is_b_row: minor & (1 << 1) != 0,
            is_a_vec4: minor & (1 << 2) != 0,
            is_b_vec4: minor & (1 << 3) != 0,
            id: (minor >> VOLTA_FLAG_BITS) & id_mask,
        }
    }

    /// Number of representable instance ids.
    pub const fn max_id() -> u32 {
        1 << NUM_BITS_TO_HOLD_MMA_V1_ID
    }

    /// Operand packing factors `[A, B]`.
    pub fn pack_size(&self) -> [u32; 2] {
        [
            volta_pack_size(0, self.is_a_row, self.is_a_vec4),
            volta_pack_size(1, self.is_b_row, self.is_b_vec4),
        ]
    }

    /// Replication factors `[M, N]`.
    pub fn rep(&self) -> [u32; 2] {
        self.pack_size().map(|x| 2 * x)
    }

    /// Shape covered by one warp, `[M, N]`.
    pub fn shape_per_warp(&self) -> [u32; 2] {
        const FPW: [u32; 2] = [2, 2];
        let rep = self.rep();
        [FPW[0] * 4 * rep[0], FPW[1] * 4 * rep[1]]
    }
}

/// How many 2-element pairs a generation-1 operand load packs together.
pub(crate) fn volta_pack_size(op_idx: u32, is_row: bool, is_vec4: bool) -> u32 {
    match op_idx {
        0 if is_row || is_vec4 => 1,
        0 => 2,
        _ if is_row && !is_vec4 => 2,
        _ => 1,
    }
}

/// The tensor-core generation, with its generation-specific sub-variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MmaVersion {
    Volta(VoltaStates),
    Ampere { minor: u32 },
    Hopper { minor: u32 },
}

impl MmaVersion {
    pub fn new(major: u32, minor: u32) -> Result<Self, LayoutError> {
        match major {
            1 => {
                let bits = VOLTA_FLAG_BITS + NUM_BITS_TO_HOLD_MMA_V1_ID;
                match minor >> bits {
                    0 => Ok(Self::Volta(VoltaStates::decode(minor))),
                    _ => Err(LayoutError::Invalid(format!(
                        "versionMinor {minor} of a generation-1 layout exceeds {bits} bits"
                    ))),
                }
            }
            2 => Ok(Self::Ampere { minor }),
            3 => Ok(Self::Hopper { minor }),
            major => Err(LayoutError::MmaVersion(major)),
        }
    }

    #[inline]
    pub fn major(&self) -> u32 {
        match self {
            MmaVersion::Volta(_) => 1,
            MmaVersion::Ampere { .. } => 2,
            MmaVersion::Hopper { .. } => 3,
        }
    }

    #[inline]
    pub fn minor(&self) -> u32 {
        match self {
            MmaVersion::Volta(states) => states.encode(),
            MmaVersion::Ampere { minor } | MmaVersion::Hopper { minor } => *minor,
        }
    }
}

/// Elements as produced by the matrix-multiply units of one tensor-core generation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Getters)]
pub struct MmaEncoding {
    version: MmaVersion,
    warps_per_cta: Vec<u32>,
    cta_layout: CtaLayout,
    instr_shape: Vec<u32>,
}

impl MmaEncoding {
    pub fn new(
        version_major: u32,
        version_minor: u32,
        warps_per_cta: Vec<u32>,
        cta_layout: CtaLayout,
        instr_shape: Vec<u32>,
    ) -> Result<Self, LayoutError> {
        let version = MmaVersion::new(version_major, version_minor)?;
        Self::with_version(version, warps_per_cta, cta_layout, instr_shape)
    }

    pub fn with_version(
        version: MmaVersion,
        warps_per_cta: Vec<u32>,
        cta_layout: CtaLayout,
        instr_shape: Vec<u32>,
    ) -> Result<Self, LayoutError> {
        let layout = Self {
            version,
            warps_per_cta,
            cta_layout,
            instr_shape,
        };
        layout.validate()?;
        Ok(layout)
    }

    /// Builds a generation-1 layout for a `shape_c` result computed by `num_warps` warps.
    ///
    /// Warps are doubled along M and then N, each capped by how many warp tiles fit the result,
    /// until `num_warps` is reached or neither dimension can grow.
    pub fn volta(
        num_warps: u32,
        cta_layout: CtaLayout,
        instr_shape: Vec<u32>,
        shape_c: &[i64],
        states: VoltaStates,
    ) -> Result<Self, LayoutError> {
        #[cfg(feature = "trace")]
        let _span = tracing::trace_span!("mma_v1").entered();

        check_rank(2, shape_c.len())?;
        if states.id >= VoltaStates::max_id() {
            return Err(LayoutError::Invalid(format!(
                "generation-1 layout id {} needs more than {NUM_BITS_TO_HOLD_MMA_V1_ID} bits",
                states.id
            )));
        }

        let spw = states.shape_per_warp();
        let ceiling = [
            saturate(shape_c[0] / spw[0] as i64),
            saturate(shape_c[1] / spw[1] as i64),
        ];

        let mut wpt = [1u32, 1];
        loop {
            let prev = wpt;
            if wpt[0].saturating_mul(wpt[1]) < num_warps {
                wpt[0] = clamp(wpt[0].saturating_mul(2), 1, ceiling[0]);
            }
            if wpt[0].saturating_mul(wpt[1]) < num_warps {
                wpt[1] = clamp(wpt[1].saturating_mul(2), 1, ceiling[1]);
            }
            if prev == wpt {
                break;
            }
        }

        log::debug!("generation-1 mma layout for {shape_c:?}: warps per CTA {wpt:?}, {states:?}");
        Self::with_version(
            MmaVersion::Volta(states),
            wpt.to_vec(),
            cta_layout,
            instr_shape,
        )
    }

    /// Like [`MmaEncoding::volta`], deriving the vec4 flags from the operand shapes.
    #[allow(clippy::too_many_arguments)]
    pub fn volta_from_operands(
        num_warps: u32,
        cta_layout: CtaLayout,
        instr_shape: Vec<u32>,
        shape_a: &[i64],
        shape_b: &[i64],
        shape_c: &[i64],
        is_a_row: bool,
        is_b_row: bool,
        id: u32,
    ) -> Result<Self, LayoutError> {
        check_rank(2, shape_a.len())?;
        check_rank(2, shape_b.len())?;
        let states = VoltaStates {
            is_a_row,
            is_b_row,
            is_a_vec4: !is_a_row && shape_a[is_a_row as usize] <= 16,
            is_b_vec4: is_b_row && shape_b[is_b_row as usize] <= 16,
            id,
        };
        Self::volta(num_warps, cta_layout, instr_shape, shape_c, states)
    }

    pub fn validate(&self) -> Result<(), LayoutError> {
        check_rank(2, self.warps_per_cta.len())?;
        check_rank(2, self.cta_layout.rank())?;
        self.cta_layout.validate()?;
        if self.warps_per_cta.contains(&0) || self.instr_shape.contains(&0) {
            return Err(LayoutError::Invalid(
                "mma warps and instruction shape must be at least 1".into(),
            ));
        }
        match self.version {
            MmaVersion::Volta(states) if states.id >= VoltaStates::max_id() => {
                Err(LayoutError::Invalid(format!(
                    "generation-1 layout id {} needs more than {NUM_BITS_TO_HOLD_MMA_V1_ID} bits",
                    states.id
                )))
            }
            MmaVersion::Hopper { .. } if self.instr_shape.len() < 2 => Err(LayoutError::Invalid(
                format!("instrShape {:?} lacks the N extent", self.instr_shape),
            )),
            _ => Ok(()),
        }
    }

    #[inline]
    pub fn version_major(&self) -> u32 {
        self.version.major()
    }

    #[inline]
    pub fn version_minor(&self) -> u32 {
        self.version.minor()
    }

    #[inline]
    pub fn is_volta(&self) -> bool {
        matches!(self.version, MmaVersion::Volta(_))
    }

    #[inline]
    pub fn is_ampere(&self) -> bool {
        matches!(self.version, MmaVersion::Ampere { .. })
    }

    #[inline]
    pub fn is_hopper(&self) -> bool {
        matches!(self.version, MmaVersion::Hopper { .. })
    }

    /// Unpacks `versionMinor` as generation-1 operand flags and instance id.
    #[inline]
    pub fn decode_volta_layout_states(&self) -> VoltaStates {
        VoltaStates::decode(self.version_minor())
    }

    pub fn size_per_thread(&self) -> Vec<u32> {
        match self.version {
            MmaVersion::Volta(_) => vec![1, 2],
            MmaVersion::Ampere { .. } => vec![2, 2],
            MmaVersion::Hopper { .. } => {
                vec![self.instr_shape[0] * 4 / 32, self.instr_shape[1] / 4]
            }
        }
    }

    pub fn threads_per_warp(&self) -> Vec<u32> {
        match self.version {
            MmaVersion::Volta(_) => vec![4, 8],
            MmaVersion::Ampere { .. } | MmaVersion::Hopper { .. } => vec![8, 4],
        }
    }

    pub fn shape_per_cta_tile(&self) -> Vec<u32> {
        let wpc = &self.warps_per_cta;
        match self.version {
            MmaVersion::Volta(_) => vec![16 * wpc[0], 16 * wpc[1]],
            MmaVersion::Ampere { .. } => vec![16 * wpc[0], 8 * wpc[1]],
            MmaVersion::Hopper { .. } => vec![16 * wpc[0], self.instr_shape[1] * wpc[1]],
        }
    }

    /// Generation-2 accumulator fragments: each warp covers a 16x8 tile, lane `l` holding rows
    /// `l / 4` and `l / 4 + 8` at columns `2 * (l % 4)` and the one after.
    pub(crate) fn owners(&self, shape: &[i64]) -> Result<Vec<BTreeSet<u32>>, LayoutError> {
        check_rank(2, shape.len())?;
        let tile = self.shape_per_cta_tile();
        let wpc = &self.warps_per_cta;
        let dim_owners = |d: usize, x: i64| {
            let warps = wpc[d] as i64;
            tile_positions(x, shape[d], tile[d] as i64)
                .map(|p| match d {
                    0 => (((p % 16) % 8) as u32, ((p / 16) % warps) as u32),
                    _ => (((p % 8) / 2) as u32, ((p / 8) % warps) as u32),
                })
                .unique()
                .collect()
        };
        Ok(collect_owners(
            shape,
            dim_owners,
            (&[8, 4], &[1, 0]),
            (wpc.as_slice(), &[0, 1]),
        ))
    }
}

impl LayoutInterface for MmaEncoding {
    fn elems_per_thread(&self, shape: &[i64], _ty: ScalarType) -> Result<Vec<u32>, LayoutError> {
        check_rank(2, shape.len())?;
        let shape_per_cta = shape::shape_per_cta(self.cta_layout.cta_split_num(), shape)?;
        let wpc = &self.warps_per_cta;

        let elems = match self.version {
            MmaVersion::Volta(states) => {
                let rep = states.rep();
                let spw = states.shape_per_warp();
                let res_m =
                    rep[0] * saturate(shape_per_cta[0] / (spw[0] * wpc[0]) as i64).max(1);
                let res_n =
                    2 * rep[1] * saturate(shape_per_cta[1] / (spw[1] * wpc[1]) as i64).max(1);
                vec![res_m, res_n]
            }
            MmaVersion::Ampere { .. } => {
                let rows = saturate(ceil_div(shape_per_cta[0], 16 * wpc[0] as i64)) * 2;
                let cols = saturate(ceil_div(shape_per_cta[1], 8 * wpc[1] as i64)) * 2;
                vec![rows, cols]
            }
            MmaVersion::Hopper { .. } => {
                let instr = &self.instr_shape;
                let rep_m = saturate(ceil_div(shape_per_cta[0], (instr[0] * wpc[0]) as i64));
                let rep_n = saturate(ceil_div(shape_per_cta[1], (instr[1] * wpc[1]) as i64));
                vec![2 * rep_m, (instr[1] / 4) * rep_n]
            }
        };
        Ok(elems)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use anyhow::Result;
    use itertools::Itertools;

    use super::{MmaEncoding, MmaVersion, VoltaStates, NUM_BITS_TO_HOLD_MMA_V1_ID};
    use crate::{
        context::ContextBuilder,
        layout::{CtaLayout, LayoutError, LayoutInterface},
        num::ScalarType,
    };

    #[test]
    fn test_volta_states_bijection() {
        for id in 0..VoltaStates::max_id() {
            for flags in 0..16u32 {
                let states = VoltaStates {
                    is_a_row: flags & 1 != 0,
                    is_b_row: flags & 2 != 0,
                    is_a_vec4: flags & 4 != 0,
                    is_b_vec4: flags & 8 != 0,
                    id,
                };
                let minor = states.encode();
                assert_eq!(minor, flags | id << 4);
                assert!(minor < 1 << (4 + NUM_BITS_TO_HOLD_MMA_V1_ID));
                assert_eq!(VoltaStates::decode(minor), states);
            }
        }
    }

    #[test]
    fn test_version() {
        assert_eq!(MmaVersion::new(2, 1), Ok(MmaVersion::Ampere { minor: 1 }));
        assert_eq!(MmaVersion::new(1, 0b1_0011).map(|v| v.minor()), Ok(0b1_0011));
        assert!(MmaVersion::new(1, 1 << 9).is_err());
        assert_eq!(MmaVersion::new(4, 0), Err(LayoutError::MmaVersion(4)));

        let layout = MmaEncoding::new(3, 0, vec![4, 1], CtaLayout::default_for(2), vec![16, 64, 16])
            .unwrap();
        assert!(layout.is_hopper() && !layout.is_ampere() && !layout.is_volta());
        assert_eq!(layout.version_major(), 3);
    }

    #[test]
    fn test_volta_warps() -> Result<()> {
        let states = VoltaStates {
            is_a_row: true,
            is_b_row: true,
            is_a_vec4: false,
            is_b_vec4: false,
            id: 3,
        };
        // spw = [16, 32]
        assert_eq!(states.shape_per_warp(), [16, 32]);

        let layout =
            MmaEncoding::volta(4, CtaLayout::default_for(2), vec![16, 16], &[128, 128], states)?;
        assert_eq!(layout.warps_per_cta(), &vec![2, 2]);
        assert_eq!(layout.version_minor(), 0b11 | 3 << 4);
        assert_eq!(layout.decode_volta_layout_states(), states);

        // M cannot grow past one warp tile, N takes the rest
        let layout =
            MmaEncoding::volta(8, CtaLayout::default_for(2), vec![16, 16], &[16, 256], states)?;
        assert_eq!(layout.warps_per_cta(), &vec![1, 8]);

        // neither dimension can reach the requested count
        let layout =
            MmaEncoding::volta(8, CtaLayout::default_for(2), vec![16, 16], &[32, 32], states)?;
        assert_eq!(layout.warps_per_cta(), &vec![2, 1]);

        // warp counts near the integer limit stop growing instead of overflowing
        let layout = MmaEncoding::volta(
            u32::MAX,
            CtaLayout::default_for(2),
            vec![16, 16],
            &[1 << 40, 1 << 40],
            states,
        )?;
        assert_eq!(layout.warps_per_cta(), &vec![1 << 16, 1 << 16]);

        let states = VoltaStates { id: 32, ..states };
        assert!(MmaEncoding::volta(4, CtaLayout::default_for(2), vec![16, 16], &[64, 64], states)
            .is_err());
        Ok(())
    }

    #[test]
    fn test_volta_from_operands() -> Result<()> {
        let layout = MmaEncoding::volta_from_operands(
            4,
            CtaLayout::default_for(2),
            vec![16, 16],
            &[16, 64],
            &[64, 16],
            &[64, 64],
            false,
            true,
            0,
        )?;
        let states = layout.decode_volta_layout_states();
        assert!(!states.is_a_row && states.is_b_row);
        assert!(states.is_a_vec4 && states.is_b_vec4);
        Ok(())
    }

    #[test]
    fn test_elems_per_thread() -> Result<()> {
        let cta = CtaLayout::default_for(2);
        let ampere = MmaEncoding::new(2, 0, vec![2, 2], cta.clone(), vec![16, 8])?;
        assert_eq!(ampere.elems_per_thread(&[64, 64], ScalarType::F32)?, vec![4, 8]);
        assert_eq!(ampere.total_elems_per_thread(&[64, 64], ScalarType::F32)?, 32);

        let hopper = MmaEncoding::new(3, 0, vec![4, 1], cta.clone(), vec![16, 64, 16])?;
        assert_eq!(hopper.elems_per_thread(&[64, 64], ScalarType::F32)?, vec![2, 16]);
        assert_eq!(hopper.size_per_thread(), vec![2, 16]);

        let states = VoltaStates {
            is_a_row: true,
            is_b_row: true,
            ..Default::default()
        };
        let volta = MmaEncoding::volta(4, cta, vec![16, 16], &[64, 64], states)?;
        assert_eq!(volta.warps_per_cta(), &vec![2, 2]);
        // rep = [2, 4], spw = [16, 32]
        assert_eq!(volta.elems_per_thread(&[64, 64], ScalarType::F16)?, vec![4, 8]);
        Ok(())
    }

    #[test]
    fn test_ampere_owners() -> Result<()> {
        let context = ContextBuilder::new().build();
        let layout = context.get(MmaEncoding::new(
            2,
            0,
            vec![2, 1],
            CtaLayout::default_for(2),
            vec![16, 8],
        )?)?;
        let owners = layout.owners(&[32, 8])?;
        assert!(owners.iter().all(|set| set.len() == 1));
        let threads = owners.iter().flatten().copied().collect::<BTreeSet<_>>();
        assert_eq!(threads.len(), 64);

        let at = |row: usize, col: usize| owners[row * 8 + col].iter().copied().collect_vec();
        assert_eq!(at(0, 0), vec![0]);
        assert_eq!(at(0, 1), vec![0]);
        assert_eq!(at(8, 1), vec![0]);
        assert_eq!(at(1, 2), vec![5]);
        assert_eq!(at(16, 0), vec![32]);
        Ok(())
    }
}
