//! Concurrent uniform-grid spatial index.
//!
//! This crate answers three questions at interactive rates for tens of
//! thousands of axis-aligned bounded items:
//!
//! - which items overlap this AABB ([`SpatialHash::query_aabb`]),
//! - which items overlap this oriented box ([`SpatialHash::query_obb`]),
//! - what is the first item this ray hits ([`SpatialHash::ray_cast`]).
//!
//! Items are added, moved, and removed by id; a batch of insertions can
//! run from many worker threads in parallel through a
//! [`ConcurrentWriter`].
//!
//! # Layout
//!
//! A [`SpatialHash`] keeps three tables coherent: a bucket multimap from
//! hashed cell coordinates to item ids, and two reverse maps from id to
//! the item's clamped bounds and payload. Queries prune with the bucket
//! stage and decide with the stored bounds, so cell-hash collisions cost
//! work, never correctness. Ray casts walk cells with an
//! Amanatides & Woo DDA ([`walk_cells`]), visiting only the cells the ray
//! actually crosses.
//!
//! # Access modes
//!
//! The exclusive handle (`&mut SpatialHash`) performs every operation
//! without taking a lock. [`SpatialHash::to_concurrent`] derives a
//! shared-write handle for parallel insertion; while any copy of it is
//! alive, the borrow checker keeps the exclusive surface (queries,
//! removes, resizes) unreachable. Capacity for a shared-write pass is
//! reserved up front with [`SpatialHash::prepare_free_place`].
//!
//! # Example
//!
//! ```
//! use cf_spatial_hash::{Aabb, ItemId, Ray, SpatialHash, SpatialItem};
//! use nalgebra::{Point3, Vector3};
//!
//! #[derive(Clone)]
//! struct Prop {
//!     center: Point3<f64>,
//!     size: Vector3<f64>,
//!     grid_id: Option<ItemId>,
//! }
//!
//! impl SpatialItem for Prop {
//!     fn center(&self) -> Point3<f64> {
//!         self.center
//!     }
//!     fn size(&self) -> Vector3<f64> {
//!         self.size
//!     }
//!     fn grid_id(&self) -> Option<ItemId> {
//!         self.grid_id
//!     }
//!     fn set_grid_id(&mut self, id: ItemId) {
//!         self.grid_id = Some(id);
//!     }
//! }
//!
//! let world = Aabb::from_center(Point3::new(15.0, 15.0, 15.0), Vector3::repeat(15.0));
//! let mut grid = SpatialHash::new(world, Vector3::repeat(1.0), 128)?;
//!
//! let mut crate_prop = Prop {
//!     center: Point3::new(10.5, 10.5, 10.5),
//!     size: Vector3::repeat(1.0),
//!     grid_id: None,
//! };
//! let id = grid.add(&mut crate_prop);
//!
//! // AABB query around the prop.
//! let mut nearby = Vec::new();
//! grid.query_aabb(
//!     &Aabb::from_center(Point3::new(10.0, 10.0, 10.0), Vector3::repeat(2.0)),
//!     &mut nearby,
//! );
//! assert_eq!(nearby.len(), 1);
//!
//! // First item along a ray.
//! let ray = Ray::new(Point3::new(2.0, 10.5, 10.5), Vector3::x());
//! let hit = grid.ray_cast(&ray, 20.0).expect("the prop is on the path");
//! assert_eq!(hit.id, id);
//!
//! // Move the prop; only the cells it leaves and enters are touched.
//! crate_prop.center = Point3::new(20.5, 10.5, 10.5);
//! grid.move_item(&crate_prop)?;
//! # Ok::<(), cf_spatial_hash::SpatialHashError>(())
//! ```
//!
//! # Batch orchestration
//!
//! The [`mirror`] module carries the per-tick contract for callers that
//! drive the index from a change-tracked store: group dirty items into a
//! [`BatchUpdate`], hand it to [`apply_batch`], and keep ids in a
//! [`MirrorSet`]. Insertion parallelizes via rayon under the `parallel`
//! feature (enabled by default).
//!
//! # Limits
//!
//! World extent and cell size are fixed at construction. There is no
//! nearest-neighbour search, no hierarchy, and no persistence; callers
//! needing those put them on top. Coordinates must be NaN-free except
//! where the ray-cast path documents otherwise.

// Safety: Deny unwrap/expect in library code. Tests may use them.
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod bounds;
mod coord;
mod error;
mod index;
mod item;
pub mod mirror;
mod traversal;
mod writer;

pub use bounds::{Aabb, Ray};
pub use coord::CellCoord;
pub use error::SpatialHashError;
pub use index::{RayHit, SpatialHash};
pub use item::{ItemId, SpatialItem};
pub use mirror::{apply_batch, BatchUpdate, MirrorSet};
pub use traversal::{walk_cells, CellVisitor};
pub use writer::ConcurrentWriter;

// Re-export the nalgebra types that appear in the public API.
pub use nalgebra::{Point3, Rotation3, Vector3};
