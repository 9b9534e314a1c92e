//! Integer cell coordinates and cell hashing.

use nalgebra::{Point3, Vector3};

/// A discrete 3D cell coordinate in grid space.
///
/// Uses `i32` components so rays and out-of-world probes can address cells
/// on either side of the grid; items themselves are always clamped into
/// the non-negative cell range of their world bounds.
///
/// # Example
///
/// ```
/// use cf_spatial_hash::CellCoord;
///
/// let cell = CellCoord::new(1, 2, 3);
/// assert_eq!(cell.x, 1);
/// assert_eq!(cell + CellCoord::new(1, 1, 1), CellCoord::new(2, 3, 4));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CellCoord {
    /// X coordinate (width axis).
    pub x: i32,
    /// Y coordinate (depth axis).
    pub y: i32,
    /// Z coordinate (height axis).
    pub z: i32,
}

impl CellCoord {
    /// Creates a new cell coordinate.
    #[must_use]
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// The coordinate at the grid origin.
    #[must_use]
    pub const fn origin() -> Self {
        Self::new(0, 0, 0)
    }

    /// Componentwise floor of a float vector.
    ///
    /// # Example
    ///
    /// ```
    /// use cf_spatial_hash::CellCoord;
    /// use nalgebra::Vector3;
    ///
    /// let cell = CellCoord::floor_of(Vector3::new(1.7, -0.3, 2.0));
    /// assert_eq!(cell, CellCoord::new(1, -1, 2));
    /// ```
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn floor_of(v: Vector3<f64>) -> Self {
        // Truncation is intentional: continuous coordinates snap to cells.
        Self::new(
            v.x.floor() as i32,
            v.y.floor() as i32,
            v.z.floor() as i32,
        )
    }

    /// Componentwise ceiling of a float vector.
    ///
    /// # Example
    ///
    /// ```
    /// use cf_spatial_hash::CellCoord;
    /// use nalgebra::Vector3;
    ///
    /// let cell = CellCoord::ceil_of(Vector3::new(1.2, -0.3, 2.0));
    /// assert_eq!(cell, CellCoord::new(2, 0, 2));
    /// ```
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn ceil_of(v: Vector3<f64>) -> Self {
        Self::new(v.x.ceil() as i32, v.y.ceil() as i32, v.z.ceil() as i32)
    }

    /// Componentwise minimum.
    #[must_use]
    pub fn component_min(self, other: Self) -> Self {
        Self::new(
            self.x.min(other.x),
            self.y.min(other.y),
            self.z.min(other.z),
        )
    }

    /// Componentwise maximum.
    #[must_use]
    pub fn component_max(self, other: Self) -> Self {
        Self::new(
            self.x.max(other.x),
            self.y.max(other.y),
            self.z.max(other.z),
        )
    }

    /// Sum of the three components, widened to avoid overflow.
    #[must_use]
    pub const fn component_sum(self) -> i64 {
        self.x as i64 + self.y as i64 + self.z as i64
    }

    /// Product of the three components, widened to avoid overflow.
    ///
    /// # Example
    ///
    /// ```
    /// use cf_spatial_hash::CellCoord;
    ///
    /// assert_eq!(CellCoord::new(30, 30, 30).component_product(), 27_000);
    /// ```
    #[must_use]
    pub const fn component_product(self) -> i64 {
        self.x as i64 * self.y as i64 * self.z as i64
    }

    /// Manhattan distance to another coordinate.
    ///
    /// # Example
    ///
    /// ```
    /// use cf_spatial_hash::CellCoord;
    ///
    /// let a = CellCoord::new(0, 0, 0);
    /// let b = CellCoord::new(3, 4, 5);
    /// assert_eq!(a.manhattan_distance(b), 12);
    /// ```
    #[must_use]
    pub const fn manhattan_distance(self, other: Self) -> u32 {
        let dx = self.x.abs_diff(other.x);
        let dy = self.y.abs_diff(other.y);
        let dz = self.z.abs_diff(other.z);
        dx.saturating_add(dy).saturating_add(dz)
    }

    /// Mixes the three components into a 32-bit bucket key.
    ///
    /// Classic large-prime spatial hash; deterministic and stable within a
    /// process. Different cells may collide; queries re-filter candidates
    /// by their stored bounds, so a collision only costs a little extra
    /// work, never a wrong result.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub const fn bucket_hash(self) -> u32 {
        (self.x as u32).wrapping_mul(73_856_093)
            ^ (self.y as u32).wrapping_mul(19_349_663)
            ^ (self.z as u32).wrapping_mul(83_492_791)
    }

    /// Converts to a floating-point point.
    #[must_use]
    pub fn to_point(self) -> Point3<f64> {
        Point3::new(f64::from(self.x), f64::from(self.y), f64::from(self.z))
    }

    /// Converts to a floating-point vector.
    #[must_use]
    pub fn to_vector(self) -> Vector3<f64> {
        Vector3::new(f64::from(self.x), f64::from(self.y), f64::from(self.z))
    }
}

impl From<(i32, i32, i32)> for CellCoord {
    fn from((x, y, z): (i32, i32, i32)) -> Self {
        Self::new(x, y, z)
    }
}

impl From<[i32; 3]> for CellCoord {
    fn from([x, y, z]: [i32; 3]) -> Self {
        Self::new(x, y, z)
    }
}

impl From<CellCoord> for [i32; 3] {
    fn from(coord: CellCoord) -> Self {
        [coord.x, coord.y, coord.z]
    }
}

impl std::ops::Add for CellCoord {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self::new(
            self.x.wrapping_add(other.x),
            self.y.wrapping_add(other.y),
            self.z.wrapping_add(other.z),
        )
    }
}

impl std::ops::Sub for CellCoord {
    type Output = Self;

    fn sub(self, other: Self) -> Self {
        Self::new(
            self.x.wrapping_sub(other.x),
            self.y.wrapping_sub(other.y),
            self.z.wrapping_sub(other.z),
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn floor_of_negative_snaps_down() {
        let cell = CellCoord::floor_of(Vector3::new(-0.05, -1.0, 0.99));
        assert_eq!(cell, CellCoord::new(-1, -1, 0));
    }

    #[test]
    fn ceil_of_integral_is_identity() {
        let cell = CellCoord::ceil_of(Vector3::new(3.0, -2.0, 0.0));
        assert_eq!(cell, CellCoord::new(3, -2, 0));
    }

    #[test]
    fn component_min_max() {
        let a = CellCoord::new(1, 5, -3);
        let b = CellCoord::new(2, 4, -4);
        assert_eq!(a.component_min(b), CellCoord::new(1, 4, -4));
        assert_eq!(a.component_max(b), CellCoord::new(2, 5, -3));
    }

    #[test]
    fn component_product_widens() {
        let c = CellCoord::new(100_000, 100_000, 2);
        assert_eq!(c.component_product(), 20_000_000_000);
    }

    #[test]
    fn manhattan_distance_symmetric() {
        let a = CellCoord::new(-5, 0, 5);
        let b = CellCoord::new(5, 4, 0);
        assert_eq!(a.manhattan_distance(b), 19);
        assert_eq!(b.manhattan_distance(a), 19);
    }

    #[test]
    fn bucket_hash_is_stable_and_spreads_neighbors() {
        let c = CellCoord::new(3, 7, 11);
        assert_eq!(c.bucket_hash(), c.bucket_hash());
        for neighbor in [
            CellCoord::new(4, 7, 11),
            CellCoord::new(3, 8, 11),
            CellCoord::new(3, 7, 12),
        ] {
            assert_ne!(c.bucket_hash(), neighbor.bucket_hash());
        }
    }

    #[test]
    fn bucket_hash_handles_negative_coordinates() {
        let a = CellCoord::new(-1, -2, -3);
        let b = CellCoord::new(1, 2, 3);
        assert_ne!(a.bucket_hash(), b.bucket_hash());
    }

    #[test]
    fn add_sub_roundtrip() {
        let a = CellCoord::new(1, 2, 3);
        let b = CellCoord::new(10, -20, 30);
        assert_eq!(a + b - b, a);
    }

    #[test]
    fn conversions() {
        let c: CellCoord = (1, 2, 3).into();
        assert_eq!(c, CellCoord::from([1, 2, 3]));
        let arr: [i32; 3] = c.into();
        assert_eq!(arr, [1, 2, 3]);
        assert_eq!(c.to_point().x, 1.0);
        assert_eq!(c.to_vector().z, 3.0);
    }
}
