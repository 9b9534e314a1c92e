//! Voxel walk along a ray (Amanatides & Woo DDA).
//!
//! The walk visits every cell a segment crosses, in order, for a cost
//! proportional to the number of cells crossed, independent of cell size
//! or segment length. The index drives it for ray casts, but the walk
//! itself only knows about a [`CellVisitor`], so it can be pointed at any
//! grid-shaped structure.

use nalgebra::{Point3, Vector3};

use crate::coord::CellCoord;

/// Direction components below this magnitude are treated as zero: the
/// walk never crosses a boundary on that axis.
const DEGENERATE_EPSILON: f64 = 1e-5;

/// The grid geometry and per-cell callback driving a [`walk_cells`] run.
pub trait CellVisitor {
    /// Cell containing a world-space point.
    fn cell_at(&self, point: Point3<f64>) -> CellCoord;

    /// World-space minimum corner of a cell.
    fn cell_corner(&self, cell: CellCoord) -> Point3<f64>;

    /// Size of one cell.
    fn cell_size(&self) -> Vector3<f64>;

    /// Called for each visited cell, in crossing order starting with the
    /// cell containing the segment origin. Return `true` to stop the walk.
    fn visit(&mut self, cell: CellCoord) -> bool;
}

/// Walks the cells crossed by the segment `origin → origin + direction ·
/// length` and invokes the visitor on each.
///
/// `direction` is expected to be normalized. The walk visits at most
/// `1 + manhattan_distance(start_cell, end_cell)` cells; it ends early if
/// the visitor returns `true`, and the return value reports whether that
/// happened. Axis ties advance x before y before z. Directions containing
/// NaN visit nothing.
///
/// # Example
///
/// ```
/// use cf_spatial_hash::{walk_cells, CellCoord, CellVisitor};
/// use nalgebra::{Point3, Vector3};
///
/// struct UnitGrid(Vec<CellCoord>);
///
/// impl CellVisitor for UnitGrid {
///     fn cell_at(&self, point: Point3<f64>) -> CellCoord {
///         CellCoord::floor_of(point.coords)
///     }
///     fn cell_corner(&self, cell: CellCoord) -> Point3<f64> {
///         cell.to_point()
///     }
///     fn cell_size(&self) -> Vector3<f64> {
///         Vector3::repeat(1.0)
///     }
///     fn visit(&mut self, cell: CellCoord) -> bool {
///         self.0.push(cell);
///         false
///     }
/// }
///
/// let mut grid = UnitGrid(Vec::new());
/// walk_cells(Point3::new(0.5, 0.5, 0.5), Vector3::x(), 2.0, &mut grid);
/// assert_eq!(
///     grid.0,
///     vec![
///         CellCoord::new(0, 0, 0),
///         CellCoord::new(1, 0, 0),
///         CellCoord::new(2, 0, 0),
///     ],
/// );
/// ```
pub fn walk_cells<V: CellVisitor>(
    origin: Point3<f64>,
    direction: Vector3<f64>,
    length: f64,
    visitor: &mut V,
) -> bool {
    if direction.x.is_nan() || direction.y.is_nan() || direction.z.is_nan() {
        return false;
    }

    let start = visitor.cell_at(origin);
    let end = visitor.cell_at(origin + direction * length);
    let max_cells = start.manhattan_distance(end).saturating_add(1);

    let cell_size = visitor.cell_size();

    // Zero direction components step positive; their boundary distance is
    // infinite, so the step is never taken.
    let step = [
        if direction.x < 0.0 { -1i32 } else { 1 },
        if direction.y < 0.0 { -1 } else { 1 },
        if direction.z < 0.0 { -1 } else { 1 },
    ];

    // First boundary ahead of the origin on each axis: the near corner for
    // negative steps, the far corner otherwise.
    let boundary = visitor.cell_corner(
        start
            + CellCoord::new(
                i32::from(step[0] > 0),
                i32::from(step[1] > 0),
                i32::from(step[2] > 0),
            ),
    );

    let mut t_max = [f64::INFINITY; 3];
    let mut t_delta = [f64::INFINITY; 3];
    for axis in 0..3 {
        if direction[axis].abs() >= DEGENERATE_EPSILON {
            t_max[axis] = (boundary[axis] - origin[axis]) / direction[axis];
            t_delta[axis] = f64::from(step[axis]) * cell_size[axis] / direction[axis];
        }
    }

    let mut cell = start;
    let mut visited = 0u32;
    loop {
        if visitor.visit(cell) {
            return true;
        }
        visited += 1;
        if visited >= max_cells {
            return false;
        }

        let axis = if t_max[0] <= t_max[1] {
            if t_max[0] <= t_max[2] {
                0
            } else {
                2
            }
        } else if t_max[1] <= t_max[2] {
            1
        } else {
            2
        };

        match axis {
            0 => cell.x = cell.x.wrapping_add(step[0]),
            1 => cell.y = cell.y.wrapping_add(step[1]),
            _ => cell.z = cell.z.wrapping_add(step[2]),
        }
        t_max[axis] += t_delta[axis];
    }
}
