//! Axis-aligned bounds, rays, and the oriented-box clips built on them.
//!
//! The [`Aabb`] here is stored as centre + half-extents (the index clamps,
//! expands, and re-centres boxes constantly, and that representation makes
//! those operations cheap); `min`/`max` are derived. The slab clip and the
//! rotated-frame clip on top of it are what the index's query pruning and
//! ray casting stand on, so their edge cases (degenerate axes, touching
//! faces) are load-bearing and pinned by tests.

use nalgebra::{Point3, Rotation3, Vector3};

use crate::coord::CellCoord;

/// An axis-aligned bounding box stored as centre and half-extents.
///
/// # Example
///
/// ```
/// use cf_spatial_hash::Aabb;
/// use nalgebra::{Point3, Vector3};
///
/// let aabb = Aabb::from_center(Point3::new(5.0, 5.0, 5.0), Vector3::new(2.0, 2.0, 2.0));
/// assert_eq!(aabb.min(), Point3::new(3.0, 3.0, 3.0));
/// assert_eq!(aabb.max(), Point3::new(7.0, 7.0, 7.0));
/// assert_eq!(aabb.size(), Vector3::new(4.0, 4.0, 4.0));
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Aabb {
    /// Centre of the box.
    pub center: Point3<f64>,
    /// Half-extents along each axis (half of the full size).
    pub half_extents: Vector3<f64>,
}

impl Aabb {
    /// Creates a box from its centre and half-extents.
    #[must_use]
    pub const fn from_center(center: Point3<f64>, half_extents: Vector3<f64>) -> Self {
        Self {
            center,
            half_extents,
        }
    }

    /// Creates a box covering the two corners.
    ///
    /// # Example
    ///
    /// ```
    /// use cf_spatial_hash::Aabb;
    /// use nalgebra::Point3;
    ///
    /// let aabb = Aabb::from_min_max(Point3::origin(), Point3::new(2.0, 4.0, 6.0));
    /// assert_eq!(aabb.center, Point3::new(1.0, 2.0, 3.0));
    /// ```
    #[must_use]
    pub fn from_min_max(min: Point3<f64>, max: Point3<f64>) -> Self {
        let half_extents = (max - min) * 0.5;
        Self {
            center: min + half_extents,
            half_extents,
        }
    }

    /// Re-derives centre and half-extents from new corners.
    pub fn set_min_max(&mut self, min: Point3<f64>, max: Point3<f64>) {
        self.half_extents = (max - min) * 0.5;
        self.center = min + self.half_extents;
    }

    /// Minimum corner.
    #[must_use]
    pub fn min(&self) -> Point3<f64> {
        self.center - self.half_extents
    }

    /// Maximum corner.
    #[must_use]
    pub fn max(&self) -> Point3<f64> {
        self.center + self.half_extents
    }

    /// Full size along each axis (twice the half-extents).
    #[must_use]
    pub fn size(&self) -> Vector3<f64> {
        self.half_extents * 2.0
    }

    /// Grows the box to cover a point.
    pub fn encapsulate_point(&mut self, point: Point3<f64>) {
        let min = self.min().coords.inf(&point.coords);
        let max = self.max().coords.sup(&point.coords);
        self.set_min_max(min.into(), max.into());
    }

    /// Grows the box to cover another box.
    pub fn encapsulate(&mut self, other: &Self) {
        let min = self.min().coords.inf(&other.min().coords);
        let max = self.max().coords.sup(&other.max().coords);
        self.set_min_max(min.into(), max.into());
    }

    /// Clamps this box into `world`, componentwise on both corners.
    ///
    /// A box wholly outside `world` collapses onto the nearest world face
    /// with zero extent on the offending axes.
    pub fn clamp_to(&mut self, world: &Self) {
        let wmin = world.min();
        let wmax = world.max();
        let min = self.min().coords.sup(&wmin.coords).inf(&wmax.coords);
        let max = self.max().coords.sup(&wmin.coords).inf(&wmax.coords);
        self.set_min_max(min.into(), max.into());
    }

    /// Returns this box clamped into `world`.
    #[must_use]
    pub fn clamped_to(&self, world: &Self) -> Self {
        let mut out = *self;
        out.clamp_to(world);
        out
    }

    /// Grows the box so each side lengthens by `amount`.
    pub fn expand(&mut self, amount: f64) {
        self.half_extents += Vector3::repeat(amount * 0.5);
    }

    /// Grows the box so each side lengthens by the matching component of
    /// `amount`.
    pub fn expand_by(&mut self, amount: Vector3<f64>) {
        self.half_extents += amount * 0.5;
    }

    /// Whether this box intersects another; touching faces count.
    ///
    /// # Example
    ///
    /// ```
    /// use cf_spatial_hash::Aabb;
    /// use nalgebra::Point3;
    ///
    /// let a = Aabb::from_min_max(Point3::origin(), Point3::new(1.0, 1.0, 1.0));
    /// let b = Aabb::from_min_max(Point3::new(1.0, 0.0, 0.0), Point3::new(2.0, 1.0, 1.0));
    /// assert!(a.intersects(&b));
    /// ```
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        let (amin, amax) = (self.min(), self.max());
        let (bmin, bmax) = (other.min(), other.max());
        amin.x <= bmax.x
            && amax.x >= bmin.x
            && amin.y <= bmax.y
            && amax.y >= bmin.y
            && amin.z <= bmax.z
            && amax.z >= bmin.z
    }

    /// Whether a point lies inside the box; the boundary counts.
    #[must_use]
    pub fn contains(&self, point: &Point3<f64>) -> bool {
        let local = point - self.center;
        local.x.abs() <= self.half_extents.x
            && local.y.abs() <= self.half_extents.y
            && local.z.abs() <= self.half_extents.z
    }

    /// Number of grid cells of size `cell` this box spans on each axis,
    /// rounded up.
    #[must_use]
    pub fn cell_count(&self, cell: Vector3<f64>) -> CellCoord {
        CellCoord::ceil_of(self.size().component_div(&cell))
    }

    /// Clips the segment `origin → origin + direction · length` against
    /// the box and returns the entry point, or `None` if the segment
    /// misses.
    ///
    /// Standard three-slab clip over the parametric range `[0, 1]` along
    /// the segment. An axis with a near-zero direction component does not
    /// constrain the range; instead the segment must already lie between
    /// that axis' slabs.
    ///
    /// # Example
    ///
    /// ```
    /// use cf_spatial_hash::Aabb;
    /// use nalgebra::{Point3, Vector3};
    ///
    /// let aabb = Aabb::from_min_max(Point3::origin(), Point3::new(1.0, 1.0, 1.0));
    /// let entry = aabb.clip_ray(Point3::new(-2.0, 0.5, 0.5), Vector3::x(), 5.0);
    /// assert_eq!(entry, Some(Point3::new(0.0, 0.5, 0.5)));
    /// ```
    #[must_use]
    pub fn clip_ray(
        &self,
        origin: Point3<f64>,
        direction: Vector3<f64>,
        length: f64,
    ) -> Option<Point3<f64>> {
        let delta = direction * length;
        let min = self.min();
        let max = self.max();
        let mut low = 0.0f64;
        let mut high = 1.0f64;

        for axis in 0..3 {
            if delta[axis].abs() < f64::EPSILON {
                if origin[axis] < min[axis] || origin[axis] > max[axis] {
                    return None;
                }
            } else {
                let t1 = (min[axis] - origin[axis]) / delta[axis];
                let t2 = (max[axis] - origin[axis]) / delta[axis];
                let (near, far) = if t1 <= t2 { (t1, t2) } else { (t2, t1) };
                low = low.max(near);
                high = high.min(far);
                if low > high {
                    return None;
                }
            }
        }

        Some(origin + delta * low)
    }

    /// Clips a segment against this box rotated by `rotation` about its
    /// centre, returning the entry point in world space.
    ///
    /// The segment is carried into the box's local frame with the inverse
    /// rotation, handed to [`clip_ray`](Self::clip_ray), and the entry
    /// point is rotated back out.
    #[must_use]
    pub fn clip_ray_obb(
        &self,
        origin: Point3<f64>,
        direction: Vector3<f64>,
        length: f64,
        rotation: &Rotation3<f64>,
    ) -> Option<Point3<f64>> {
        let inverse = rotation.inverse();
        let entry = self.clip_ray(
            self.center + inverse * (origin - self.center),
            inverse * direction,
            length,
        )?;
        Some(self.center + rotation * (entry - self.center))
    }

    /// Hit test against this box rotated about its centre, with the
    /// inverse rotation supplied by the caller.
    ///
    /// Same clip as [`clip_ray_obb`](Self::clip_ray_obb) minus the
    /// world-space entry point; the oriented-box query uses this per
    /// candidate cell, so the inverse is computed once per query rather
    /// than once per cell.
    #[must_use]
    pub fn hit_by_rotated_ray(
        &self,
        origin: Point3<f64>,
        direction: Vector3<f64>,
        length: f64,
        inverse_rotation: &Rotation3<f64>,
    ) -> bool {
        self.clip_ray(
            self.center + inverse_rotation * (origin - self.center),
            inverse_rotation * direction,
            length,
        )
        .is_some()
    }

    /// World-aligned box guaranteed to cover this box rotated by
    /// `rotation` about its centre.
    ///
    /// The cover's half-extents are `|R| · half_extents` (componentwise
    /// absolute value of the rotation matrix); the centre is unchanged.
    /// This is conservative: for most rotations it is larger than the
    /// tight bounds of the rotated box, and the query pruning relies on
    /// exactly that slack.
    ///
    /// # Example
    ///
    /// ```
    /// use cf_spatial_hash::Aabb;
    /// use nalgebra::{Point3, Rotation3, Vector3};
    ///
    /// let obb = Aabb::from_center(Point3::origin(), Vector3::new(2.0, 1.0, 1.0));
    /// let quarter_turn = Rotation3::from_euler_angles(0.0, 0.0, std::f64::consts::FRAC_PI_2);
    /// let cover = obb.rotated_enclosure(&quarter_turn);
    /// assert!((cover.half_extents.x - 1.0).abs() < 1e-9);
    /// assert!((cover.half_extents.y - 2.0).abs() < 1e-9);
    /// ```
    #[must_use]
    pub fn rotated_enclosure(&self, rotation: &Rotation3<f64>) -> Self {
        Self {
            center: self.center,
            half_extents: rotation.matrix().abs() * self.half_extents,
        }
    }
}

impl Default for Aabb {
    fn default() -> Self {
        Self::from_center(Point3::origin(), Vector3::zeros())
    }
}

/// A ray defined by an origin point and a direction vector.
///
/// The direction does not need to be normalized; the index normalizes
/// before walking cells.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ray {
    /// The origin of the ray.
    pub origin: Point3<f64>,
    /// The direction of the ray (not necessarily normalized).
    pub direction: Vector3<f64>,
}

impl Ray {
    /// Creates a new ray with the given origin and direction.
    #[must_use]
    pub const fn new(origin: Point3<f64>, direction: Vector3<f64>) -> Self {
        Self { origin, direction }
    }

    /// Returns the point `origin + t * direction`.
    #[must_use]
    pub fn point_at(&self, t: f64) -> Point3<f64> {
        self.origin + self.direction * t
    }

    /// Returns the direction normalized to unit length, or the zero
    /// vector if the direction is zero.
    #[must_use]
    pub fn direction_normalized(&self) -> Vector3<f64> {
        let norm = self.direction.norm();
        if norm < f64::EPSILON {
            return Vector3::zeros();
        }
        self.direction / norm
    }
}

impl Default for Ray {
    fn default() -> Self {
        Self::new(Point3::origin(), Vector3::x())
    }
}
