//! Shape arithmetic shared by the layout builders.

use itertools::Itertools;

use crate::layout::LayoutError;

/// Splits a global tensor shape across the CTAs of a cluster.
///
/// A dimension smaller than its split count wraps: it is split at most `dim` times.
pub fn shape_per_cta(cta_split_num: &[u32], shape: &[i64]) -> Result<Vec<i64>, LayoutError> {
    check_rank(cta_split_num.len(), shape.len())?;
    Ok(shape
        .iter()
        .zip_eq(cta_split_num)
        .map(|(&dim, &split)| {
            let split = (split as i64).min(dim).max(1);
            dim / split
        })
        .collect())
}

#[inline]
pub fn check_rank(expected: usize, found: usize) -> Result<(), LayoutError> {
    match expected == found {
        true => Ok(()),
        false => Err(LayoutError::Rank { expected, found }),
    }
}

#[inline]
pub fn product(values: &[u32]) -> u32 {
    values.iter().product()
}

#[inline]
pub fn ceil_div(x: i64, y: i64) -> i64 {
    (x + y - 1) / y
}

/// Like [`Ord::clamp`], except that an upper bound below `lo` is raised to `lo`.
#[inline]
pub fn clamp(x: u32, lo: u32, hi: u32) -> u32 {
    x.min(hi.max(lo)).max(lo)
}

/// Narrows an extent to `u32`, saturating at both ends.
#[inline]
pub fn saturate(x: i64) -> u32 {
    x.clamp(0, u32::MAX as i64) as u32
}

/// Removes the entry at `dim`.
pub fn erase_dim<T: Clone>(values: &[T], dim: usize) -> Vec<T> {
    values
        .iter()
        .enumerate()
        .filter(|&(d, _)| d != dim)
        .map(|(_, x)| x.clone())
        .collect()
}

/// Inserts `value` so that it lands at index `dim`.
pub fn insert_dim<T: Clone>(values: &[T], dim: usize, value: T) -> Vec<T> {
    let mut values = values.to_vec();
    values.insert(dim.min(values.len()), value);
    values
}

/// Removes `dim` from a dimension order and renumbers the dimensions above it.
pub fn erase_order(order: &[u32], dim: u32) -> Vec<u32> {
    order
        .iter()
        .filter(|&&d| d != dim)
        .map(|&d| if d > dim { d - 1 } else { d })
        .collect()
}

/// Returns `true` if `order` is a permutation of `0..order.len()`.
pub fn is_permutation(order: &[u32]) -> bool {
    let rank = order.len();
    order.iter().all(|&d| (d as usize) < rank) && order.iter().all_unique()
}

/// Splits a linear index into coordinates, `order[0]` being the fastest-changing dimension.
pub fn delinearize(mut index: u32, shape: &[u32], order: &[u32]) -> Vec<u32> {
    let mut coord = vec![0; shape.len()];
    for &d in order {
        let d = d as usize;
        coord[d] = index % shape[d];
        index /= shape[d];
    }
    coord
}

/// Inverse of [`delinearize`].
pub fn linearize(coord: &[u32], shape: &[u32], order: &[u32]) -> u32 {
    order
        .iter()
        .rev()
        .fold(0, |acc, &d| acc * shape[d as usize] + coord[d as usize])
}
