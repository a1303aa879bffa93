//! Global cell order and subarray ranges.

use super::{ArraySchema, Layout};

/// Maps coordinates to sort keys whose lexicographic order is the global order:
/// space-tile coordinates in tile order, then cell coordinates in cell order.
#[derive(Clone, Debug)]
pub(crate) struct GlobalOrder {
    lows: Vec<i128>,
    extents: Vec<i128>,
    tile_perm: Vec<usize>,
    cell_perm: Vec<usize>,
}

fn permutation(layout: Layout, dims: usize) -> Vec<usize> {
    match layout {
        Layout::RowMajor => (0..dims).collect(),
        Layout::ColMajor => (0..dims).rev().collect(),
    }
}

impl GlobalOrder {
    pub(crate) fn new(schema: &ArraySchema) -> Self {
        let dims = schema.dim_num();
        Self {
            lows: schema.dimensions.iter().map(|d| d.domain[0] as i128).collect(),
            extents: schema
                .dimensions
                .iter()
                .map(|d| d.tile_extent.max(1) as i128)
                .collect(),
            tile_perm: permutation(schema.tile_order, dims),
            cell_perm: permutation(schema.cell_order, dims),
        }
    }

    /// Length of one key in `i128` words.
    pub(crate) fn key_len(&self) -> usize {
        self.lows.len() * 2
    }

    /// Append the sort key of `coords` (one value per dimension) to `out`.
    pub(crate) fn push_key(&self, coords: &[i128], out: &mut Vec<i128>) {
        for &dim in &self.tile_perm {
            out.push((coords[dim] - self.lows[dim]).div_euclid(self.extents[dim]));
        }
        for &dim in &self.cell_perm {
            out.push(coords[dim]);
        }
    }

    /// Sort key of one cell.
    pub(crate) fn key(&self, coords: &[i128]) -> Vec<i128> {
        let mut out = Vec::with_capacity(self.key_len());
        self.push_key(coords, &mut out);
        out
    }
}

/// Per-dimension inclusive coordinate ranges restricting a read.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Subarray {
    ranges: Vec<Vec<(i128, i128)>>,
}

impl Subarray {
    /// An unrestricted subarray over `dim_num` dimensions.
    pub fn new(dim_num: usize) -> Self {
        Self {
            ranges: vec![Vec::new(); dim_num],
        }
    }

    /// Add an inclusive range on one dimension. Dimensions without ranges are
    /// unrestricted.
    #[must_use]
    pub fn with_range(mut self, dim: usize, low: i64, high: i64) -> Self {
        if dim >= self.ranges.len() {
            self.ranges.resize(dim + 1, Vec::new());
        }
        self.ranges[dim].push((low as i128, high as i128));
        self
    }

    /// Ranges of one dimension.
    pub fn ranges(&self, dim: usize) -> &[(i128, i128)] {
        self.ranges.get(dim).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Sort each dimension's ranges and coalesce overlapping or adjacent ones.
    pub(crate) fn coalesce(&mut self) {
        for ranges in &mut self.ranges {
            ranges.sort_unstable();
            let mut merged: Vec<(i128, i128)> = Vec::with_capacity(ranges.len());
            for &(lo, hi) in ranges.iter() {
                match merged.last_mut() {
                    Some(last) if lo <= last.1.saturating_add(1) => last.1 = last.1.max(hi),
                    _ => merged.push((lo, hi)),
                }
            }
            *ranges = merged;
        }
    }

    /// `true` when the cell lies inside every restricted dimension.
    pub(crate) fn contains(&self, coords: &[i128]) -> bool {
        self.ranges.iter().enumerate().all(|(dim, ranges)| {
            ranges.is_empty()
                || coords
                    .get(dim)
                    .is_some_and(|c| ranges.iter().any(|&(lo, hi)| lo <= *c && *c <= hi))
        })
    }

    /// `true` when the bounding box `mbr` may hold cells inside the subarray.
    pub(crate) fn intersects(&self, mbr: &[(i128, i128)]) -> bool {
        self.ranges.iter().enumerate().all(|(dim, ranges)| {
            ranges.is_empty()
                || mbr
                    .get(dim)
                    .is_some_and(|&(mlo, mhi)| ranges.iter().any(|&(lo, hi)| lo <= mhi && mlo <= hi))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Attribute, Datatype, Dimension};

    fn schema(tile: Layout, cell: Layout) -> ArraySchema {
        ArraySchema::builder()
            .dimension(Dimension::new("r", Datatype::Int32, [1, 4], 2))
            .dimension(Dimension::new("c", Datatype::Int32, [1, 4], 2))
            .attribute(Attribute::new("a", Datatype::Int32))
            .order(tile, cell)
            .build()
            .expect("schema")
    }

    #[test]
    fn row_major_tiles_come_first() {
        let order = GlobalOrder::new(&schema(Layout::RowMajor, Layout::RowMajor));
        // (1,3) is in tile (0,1); (2,1) is in tile (0,0), so it sorts first.
        assert!(order.key(&[2, 1]) < order.key(&[1, 3]));
        assert!(order.key(&[1, 1]) < order.key(&[1, 2]));
        assert!(order.key(&[1, 2]) < order.key(&[2, 1]));
        assert!(order.key(&[2, 2]) < order.key(&[3, 1]));
    }

    #[test]
    fn col_major_cells_vary_first_dimension_fastest() {
        let order = GlobalOrder::new(&schema(Layout::RowMajor, Layout::ColMajor));
        assert!(order.key(&[2, 1]) < order.key(&[1, 2]));
        assert_eq!(order.key_len(), 4);
    }

    #[test]
    fn subarray_coalesces_and_filters() {
        let mut sub = Subarray::new(2)
            .with_range(0, 3, 4)
            .with_range(0, 1, 2)
            .with_range(0, 2, 3);
        sub.coalesce();
        assert_eq!(sub.ranges(0), &[(1, 4)]);
        assert!(sub.contains(&[2, 100]));
        assert!(!sub.contains(&[5, 1]));
        assert!(sub.intersects(&[(4, 9), (0, 0)]));
        assert!(!sub.intersects(&[(5, 9), (0, 0)]));
    }
}
