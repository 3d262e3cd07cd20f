//! The per-dimension tiling algorithm (§4.8): resolved VArray-absolute axes
//! in, an ordered list of [`ArrayPosition`] records out.

use itertools::Itertools;

use crate::error::Result;
use crate::indexing::AxisIndex;

/// One tile's contribution to a VArray operation: which tile (`v_position`),
/// what region of it is touched (`tile_bounds`, local to the tile), and
/// where that region lands in the operation's result/input buffer
/// (`data_slice`, one entry per non-dropped axis).
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayPosition {
    /// Tile coordinates in the vgrid.
    pub v_position: Vec<i64>,
    /// The region of the tile touched, local to the tile's own shape.
    pub tile_bounds: Vec<AxisIndex>,
    /// Destination placement within the operation's result buffer, one
    /// entry per axis that was not an integer indexer (those drop the axis
    /// entirely, per §4.2).
    pub data_slice: Vec<(u64, u64)>,
}

struct AxisTile {
    tile_index: i64,
    tile_bound: AxisIndex,
    dest: Option<(u64, u64)>,
}

fn axis_tiles(axis: &AxisIndex, tile: i64) -> Vec<AxisTile> {
    match *axis {
        AxisIndex::Point(idx) => {
            let tile_index = idx.div_euclid(tile);
            let local = idx.rem_euclid(tile);
            vec![AxisTile {
                tile_index,
                tile_bound: AxisIndex::Point(local),
                dest: None,
            }]
        }
        AxisIndex::Range { start, stop } => {
            let off_start = start.rem_euclid(tile);
            let remainder = stop.rem_euclid(tile);
            let off_end = if remainder != 0 { remainder - tile } else { 0 };
            let first_boundary = start - off_start;
            let last_boundary = stop - off_end;

            let mut out = Vec::new();
            let mut p = first_boundary;
            let mut dest_cursor = 0u64;
            while p < last_boundary {
                let tile_index = p.div_euclid(tile);
                let is_first = p == first_boundary;
                let is_last = p + tile >= last_boundary;
                let (local_start, local_end) = match (is_first, is_last) {
                    (true, true) => (off_start, off_end),
                    (true, false) => (off_start, 0),
                    (false, true) => (0, off_end),
                    (false, false) => (0, 0),
                };
                let local_stop = tile + local_end;
                let len = (local_stop - local_start) as u64;
                out.push(AxisTile {
                    tile_index,
                    tile_bound: AxisIndex::Range {
                        start: local_start,
                        stop: local_stop,
                    },
                    dest: Some((dest_cursor, dest_cursor + len)),
                });
                dest_cursor += len;
                p += tile;
            }
            out
        }
    }
}

/// Compute the ordered [`ArrayPosition`] list for `axes` (already resolved,
/// absolute in VArray coordinates, per §4.2) against `tile_shape`.
///
/// # Errors
/// Returns [`Error::Index`] if `axes`, `shape`, and `vgrid` lengths disagree
/// (an internal-consistency check; callers always supply matched lengths).
pub fn compute_positions(axes: &[AxisIndex], shape: &[u64], vgrid: &[u64]) -> Result<Vec<ArrayPosition>> {
    debug_assert_eq!(axes.len(), shape.len());
    debug_assert_eq!(axes.len(), vgrid.len());

    let per_axis: Vec<Vec<AxisTile>> = axes
        .iter()
        .zip(shape)
        .zip(vgrid)
        .map(|((axis, size), factor)| axis_tiles(axis, (size / factor) as i64))
        .collect();

    let positions = per_axis
        .into_iter()
        .multi_cartesian_product()
        .map(|combo| {
            let mut v_position = Vec::with_capacity(combo.len());
            let mut tile_bounds = Vec::with_capacity(combo.len());
            let mut data_slice = Vec::new();
            for axis_tile in combo {
                v_position.push(axis_tile.tile_index);
                tile_bounds.push(axis_tile.tile_bound);
                if let Some(range) = axis_tile.dest {
                    data_slice.push(range);
                }
            }
            ArrayPosition {
                v_position,
                tile_bounds,
                data_slice,
            }
        })
        .collect();
    Ok(positions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_tile_point_indexer_drops_axis() {
        let axes = [AxisIndex::Point(5)];
        let positions = compute_positions(&axes, &[10], &[2]).unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].v_position, vec![1]);
        assert_eq!(positions[0].tile_bounds, vec![AxisIndex::Point(0)]);
        assert!(positions[0].data_slice.is_empty());
    }

    #[test]
    fn range_spanning_two_tiles_splits_offsets() {
        // shape 10, vgrid 2 -> tile size 5; range [3, 8) spans tile 0 ([3,5)) and tile 1 ([0,3)).
        let axes = [AxisIndex::Range { start: 3, stop: 8 }];
        let positions = compute_positions(&axes, &[10], &[2]).unwrap();
        assert_eq!(positions.len(), 2);
        assert_eq!(positions[0].v_position, vec![0]);
        assert_eq!(positions[0].tile_bounds, vec![AxisIndex::Range { start: 3, stop: 5 }]);
        assert_eq!(positions[0].data_slice, vec![(0, 2)]);
        assert_eq!(positions[1].v_position, vec![1]);
        assert_eq!(positions[1].tile_bounds, vec![AxisIndex::Range { start: 0, stop: 3 }]);
        assert_eq!(positions[1].data_slice, vec![(2, 5)]);
    }

    #[test]
    fn range_within_single_tile_keeps_both_offsets() {
        let axes = [AxisIndex::Range { start: 6, stop: 9 }];
        let positions = compute_positions(&axes, &[10], &[2]).unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].v_position, vec![1]);
        assert_eq!(positions[0].tile_bounds, vec![AxisIndex::Range { start: 1, stop: 4 }]);
        assert_eq!(positions[0].data_slice, vec![(0, 3)]);
    }

    #[test]
    fn two_dimensional_cartesian_product_is_row_major() {
        let axes = [
            AxisIndex::Range { start: 0, stop: 4 },
            AxisIndex::Range { start: 0, stop: 4 },
        ];
        let positions = compute_positions(&axes, &[4, 4], &[2, 2]).unwrap();
        assert_eq!(positions.len(), 4);
        let v_positions: Vec<_> = positions.iter().map(|p| p.v_position.clone()).collect();
        assert_eq!(
            v_positions,
            vec![vec![0, 0], vec![0, 1], vec![1, 0], vec![1, 1]]
        );
    }
}
