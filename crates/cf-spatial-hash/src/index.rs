//! The uniform-grid index: three coherent tables over sharded storage.
//!
//! A [`SpatialHash`] owns three tables that must stay in lock-step:
//!
//! - `buckets`: cell-hash to item ids (the forward multimap),
//! - `bounds`: item id to its clamped world AABB,
//! - `items`: item id to the caller's payload.
//!
//! Every table is split across shards behind [`parking_lot::Mutex`]es.
//! With exclusive access (`&mut self`) all operations go through
//! [`Mutex::get_mut`] and never take a lock; the shards only earn their
//! keep when a [`ConcurrentWriter`] is live, which the borrow checker
//! guarantees cannot overlap with any exclusive operation.
//!
//! [`ConcurrentWriter`]: crate::ConcurrentWriter

use std::num::{NonZeroU32, NonZeroUsize};
use std::sync::atomic::{AtomicU32, Ordering};

use hashbrown::{HashMap, HashSet};
use nalgebra::{Point3, Rotation3, Vector3};
use parking_lot::Mutex;

use crate::bounds::{Aabb, Ray};
use crate::coord::CellCoord;
use crate::error::SpatialHashError;
use crate::item::{ItemId, SpatialItem};
use crate::traversal::{walk_cells, CellVisitor};

/// Upper limit on the shard count; beyond this, extra shards only cost
/// memory without reducing contention.
const MAX_SHARDS: usize = 64;

/// One shard of the forward multimap: cell-hash to the ids recorded under
/// that hash. Hash collisions between different cells legitimately put the
/// same id into one bucket more than once (once per colliding cell), so
/// removal always takes exactly one occurrence.
pub(crate) struct BucketShard {
    pub(crate) cells: HashMap<u32, Vec<ItemId>>,
}

/// One shard of the two reverse tables, keyed by item id.
pub(crate) struct IdShard<T> {
    pub(crate) bounds: HashMap<ItemId, Aabb>,
    pub(crate) items: HashMap<ItemId, T>,
}

/// A uniform-grid spatial index over axis-aligned bounded items.
///
/// World extent and cell size are fixed at construction. Items are added,
/// moved, and removed through the exclusive handle (`&mut self`); a
/// [`to_concurrent`] writer supports parallel insertion. Queries append to
/// caller-owned output lists and never clear them.
///
/// [`to_concurrent`]: SpatialHash::to_concurrent
///
/// # Example
///
/// ```
/// use cf_spatial_hash::{Aabb, ItemId, SpatialHash, SpatialItem};
/// use nalgebra::{Point3, Vector3};
///
/// #[derive(Clone)]
/// struct Prop {
///     center: Point3<f64>,
///     size: Vector3<f64>,
///     grid_id: Option<ItemId>,
/// }
///
/// impl SpatialItem for Prop {
///     fn center(&self) -> Point3<f64> {
///         self.center
///     }
///     fn size(&self) -> Vector3<f64> {
///         self.size
///     }
///     fn grid_id(&self) -> Option<ItemId> {
///         self.grid_id
///     }
///     fn set_grid_id(&mut self, id: ItemId) {
///         self.grid_id = Some(id);
///     }
/// }
///
/// let world = Aabb::from_center(Point3::new(15.0, 15.0, 15.0), Vector3::repeat(15.0));
/// let mut grid = SpatialHash::new(world, Vector3::repeat(1.0), 64)?;
///
/// let mut prop = Prop {
///     center: Point3::new(5.5, 5.5, 5.5),
///     size: Vector3::repeat(1.0),
///     grid_id: None,
/// };
/// let id = grid.add(&mut prop);
/// assert_eq!(prop.grid_id, Some(id));
///
/// let mut hits = Vec::new();
/// grid.query_aabb(
///     &Aabb::from_center(Point3::new(5.0, 5.0, 5.0), Vector3::repeat(1.0)),
///     &mut hits,
/// );
/// assert_eq!(hits.len(), 1);
/// # Ok::<(), cf_spatial_hash::SpatialHashError>(())
/// ```
pub struct SpatialHash<T> {
    world: Aabb,
    cell_size: Vector3<f64>,
    cell_count: CellCoord,
    pub(crate) shard_mask: usize,
    pub(crate) buckets: Box<[Mutex<BucketShard>]>,
    pub(crate) ids: Box<[Mutex<IdShard<T>>]>,
    pub(crate) next_id: AtomicU32,
    /// Query dedup scratch, reused across calls.
    seen: HashSet<ItemId>,
    /// Move scratch: cells of the old placement.
    old_cells: HashSet<CellCoord>,
    /// Move scratch: cells of the new placement.
    new_cells: HashSet<CellCoord>,
}

/// Result of a successful [`SpatialHash::ray_cast`].
#[derive(Debug, Clone, PartialEq)]
pub struct RayHit<T> {
    /// Id of the item that was hit.
    pub id: ItemId,
    /// World-space point where the ray enters the item's bounds.
    pub point: Point3<f64>,
    /// The stored payload.
    pub item: T,
}

impl<T> SpatialHash<T> {
    /// Creates an empty index over `world_bounds` with the given cell size
    /// and initial table capacity.
    ///
    /// # Errors
    ///
    /// [`SpatialHashError::InvalidCapacity`] when `initial_size` is zero;
    /// [`SpatialHashError::InvalidCellSize`] when any cell-size component
    /// is not strictly positive and finite.
    pub fn new(
        world_bounds: Aabb,
        cell_size: Vector3<f64>,
        initial_size: usize,
    ) -> Result<Self, SpatialHashError> {
        if initial_size < 1 {
            return Err(SpatialHashError::InvalidCapacity(initial_size));
        }
        if !cell_size.iter().all(|c| c.is_finite() && *c > 0.0) {
            return Err(SpatialHashError::InvalidCellSize(cell_size));
        }

        let shard_count = std::thread::available_parallelism()
            .map_or(8, NonZeroUsize::get)
            .next_power_of_two()
            .min(MAX_SHARDS);
        let per_shard = initial_size / shard_count + 1;

        let buckets = (0..shard_count)
            .map(|_| {
                Mutex::new(BucketShard {
                    cells: HashMap::with_capacity(per_shard),
                })
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let ids = (0..shard_count)
            .map(|_| {
                Mutex::new(IdShard {
                    bounds: HashMap::with_capacity(per_shard),
                    items: HashMap::with_capacity(per_shard),
                })
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            cell_count: world_bounds.cell_count(cell_size),
            world: world_bounds,
            cell_size,
            shard_mask: shard_count - 1,
            buckets,
            ids,
            next_id: AtomicU32::new(0),
            seen: HashSet::new(),
            old_cells: HashSet::new(),
            new_cells: HashSet::new(),
        })
    }

    /// The world bounds fixed at construction.
    #[must_use]
    pub fn world_bounds(&self) -> Aabb {
        self.world
    }

    /// The cell size fixed at construction.
    #[must_use]
    pub fn cell_size(&self) -> Vector3<f64> {
        self.cell_size
    }

    /// Number of cells along each axis of the world bounds.
    #[must_use]
    pub fn cell_count(&self) -> CellCoord {
        self.cell_count
    }

    /// Cell containing a world-space point. Not clamped: points outside
    /// the world map to out-of-range cells.
    #[must_use]
    pub fn cell_of(&self, point: Point3<f64>) -> CellCoord {
        CellCoord::floor_of((point - self.world.min()).component_div(&self.cell_size))
    }

    /// World-space minimum corner of a cell.
    #[must_use]
    pub fn cell_min(&self, cell: CellCoord) -> Point3<f64> {
        self.world.min() + cell.to_vector().component_mul(&self.cell_size)
    }

    /// World-space center of a cell.
    #[must_use]
    pub fn cell_center(&self, cell: CellCoord) -> Point3<f64> {
        self.world.min()
            + (cell.to_vector() + Vector3::repeat(0.5)).component_mul(&self.cell_size)
    }

    /// Number of live items.
    #[must_use]
    pub fn item_count(&self) -> usize {
        self.ids.iter().map(|shard| shard.lock().items.len()).sum()
    }

    /// Whether the index holds no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.item_count() == 0
    }

    /// Total number of (cell, item) records in the forward multimap: the
    /// sum over items of how many cells each one overlaps.
    #[must_use]
    pub fn bucket_item_count(&self) -> usize {
        self.buckets
            .iter()
            .map(|shard| shard.lock().cells.values().map(Vec::len).sum::<usize>())
            .sum()
    }

    /// Grows every table so it can take `additional` more entries without
    /// rehashing. Capacities grow in powers of two.
    ///
    /// Must be called before deriving a [`ConcurrentWriter`] for a
    /// parallel insert pass: shared-write mode can never resize.
    ///
    /// [`ConcurrentWriter`]: crate::ConcurrentWriter
    pub fn prepare_free_place(&mut self, additional: usize) {
        let per_shard = additional / (self.shard_mask + 1) + 1;
        for shard in self.buckets.iter_mut() {
            reserve_pow2(&mut shard.get_mut().cells, per_shard);
        }
        for shard in self.ids.iter_mut() {
            let shard = shard.get_mut();
            reserve_pow2(&mut shard.bounds, per_shard);
            reserve_pow2(&mut shard.items, per_shard);
        }
    }

    /// Empties all three tables. The id counter keeps its value: ids are
    /// never reused, even across a clear.
    pub fn clear(&mut self) {
        for shard in self.buckets.iter_mut() {
            shard.get_mut().cells.clear();
        }
        for shard in self.ids.iter_mut() {
            let shard = shard.get_mut();
            shard.bounds.clear();
            shard.items.clear();
        }
        self.seen.clear();
        self.old_cells.clear();
        self.new_cells.clear();
    }

    /// Takes the next id from the shared counter (pre-increment: the first
    /// id issued is 1).
    pub(crate) fn issue_id(&self) -> ItemId {
        let raw = self.next_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        debug_assert!(raw != 0, "item id counter overflowed");
        ItemId::from_raw(NonZeroU32::new(raw).unwrap_or(NonZeroU32::MIN))
    }

    pub(crate) fn bucket_shard_of(&self, hash: u32) -> usize {
        (hash as usize) & self.shard_mask
    }

    pub(crate) fn id_shard_of(&self, id: ItemId) -> usize {
        (id.get() as usize) & self.shard_mask
    }

    /// Half-open cell interval covered by an already-clamped AABB.
    pub(crate) fn cell_range(&self, clamped: &Aabb) -> (CellCoord, CellCoord) {
        let world_min = self.world.min();
        let start = CellCoord::floor_of((clamped.min() - world_min).component_div(&self.cell_size));
        let end = CellCoord::ceil_of((clamped.max() - world_min).component_div(&self.cell_size));
        (start, end)
    }

    fn insert_into_cell(&mut self, id: ItemId, cell: CellCoord) {
        let hash = cell.bucket_hash();
        let shard = self.bucket_shard_of(hash);
        self.buckets[shard]
            .get_mut()
            .cells
            .entry(hash)
            .or_default()
            .push(id);
    }

    fn remove_from_cell(&mut self, id: ItemId, cell: CellCoord) {
        let hash = cell.bucket_hash();
        let shard = self.bucket_shard_of(hash);
        let mut found = false;
        if let Some(bucket) = self.buckets[shard].get_mut().cells.get_mut(&hash) {
            if let Some(position) = bucket.iter().position(|&entry| entry == id) {
                // Emptied buckets keep their allocation: moving items churn
                // through the same cells tick after tick.
                bucket.swap_remove(position);
                found = true;
            }
        }
        debug_assert!(
            found,
            "bucket entry for {id:?} missing in cell {cell:?}; double remove or stale id"
        );
    }

    fn insert_into_cells(&mut self, id: ItemId, start: CellCoord, end: CellCoord) {
        for x in start.x..end.x {
            for y in start.y..end.y {
                for z in start.z..end.z {
                    self.insert_into_cell(id, CellCoord::new(x, y, z));
                }
            }
        }
    }

    fn remove_from_cells(&mut self, id: ItemId, start: CellCoord, end: CellCoord) {
        for x in start.x..end.x {
            for y in start.y..end.y {
                for z in start.z..end.z {
                    self.remove_from_cell(id, CellCoord::new(x, y, z));
                }
            }
        }
    }
}

impl<T: SpatialItem + Clone> SpatialHash<T> {
    /// The clamped world AABB an item occupies.
    pub(crate) fn clamped_bounds_of(&self, item: &T) -> Aabb {
        Aabb::from_center(item.center(), item.size() * 0.5).clamped_to(&self.world)
    }

    /// Inserts an item, assigns it a fresh id, writes the id back into the
    /// item, and records it in every cell its clamped bounds overlap.
    ///
    /// Items wholly outside the world bounds degenerate to an empty cell
    /// range but are still tracked and removable by id.
    pub fn add(&mut self, item: &mut T) -> ItemId {
        let bounds = self.clamped_bounds_of(item);
        let id = self.issue_id();
        item.set_grid_id(id);

        let shard = self.id_shard_of(id);
        {
            let shard = self.ids[shard].get_mut();
            shard.bounds.insert(id, bounds);
            shard.items.insert(id, item.clone());
        }

        let (start, end) = self.cell_range(&bounds);
        self.insert_into_cells(id, start, end);
        id
    }

    /// Re-inserts an item under the id it already carries, overwriting the
    /// reverse-table entries. Only meaningful as the second half of a move
    /// whose first half was [`remove_fast`](Self::remove_fast).
    ///
    /// # Errors
    ///
    /// [`SpatialHashError::MissingId`] when the item carries no id.
    pub fn add_fast(&mut self, item: &T) -> Result<(), SpatialHashError> {
        let id = item.grid_id().ok_or(SpatialHashError::MissingId)?;
        let bounds = self.clamped_bounds_of(item);

        let shard = self.id_shard_of(id);
        {
            let shard = self.ids[shard].get_mut();
            shard.bounds.insert(id, bounds);
            shard.items.insert(id, item.clone());
        }

        let (start, end) = self.cell_range(&bounds);
        self.insert_into_cells(id, start, end);
        Ok(())
    }

    /// Removes an item from all three tables and returns its payload.
    ///
    /// # Errors
    ///
    /// [`SpatialHashError::UnknownId`] when the id is not present; no
    /// state is mutated in that case.
    pub fn remove(&mut self, id: ItemId) -> Result<T, SpatialHashError> {
        let shard_index = self.id_shard_of(id);
        let (bounds, item) = {
            let shard = self.ids[shard_index].get_mut();
            let Some(bounds) = shard.bounds.get(&id).copied() else {
                return Err(SpatialHashError::UnknownId(id));
            };
            shard.bounds.remove(&id);
            let item = shard.items.remove(&id);
            debug_assert!(item.is_some(), "bounds present without item for {id:?}");
            (bounds, item)
        };

        let (start, end) = self.cell_range(&bounds);
        self.remove_from_cells(id, start, end);
        item.ok_or(SpatialHashError::UnknownId(id))
    }

    /// Removes an item from the forward multimap only, leaving the reverse
    /// tables intact so its cached bounds remain available for the
    /// [`add_fast`](Self::add_fast) half of a move.
    ///
    /// # Errors
    ///
    /// [`SpatialHashError::UnknownId`] when the id is not present.
    pub fn remove_fast(&mut self, id: ItemId) -> Result<(), SpatialHashError> {
        let shard = self.id_shard_of(id);
        let bounds = self.ids[shard]
            .get_mut()
            .bounds
            .get(&id)
            .copied()
            .ok_or(SpatialHashError::UnknownId(id))?;

        let (start, end) = self.cell_range(&bounds);
        self.remove_from_cells(id, start, end);
        Ok(())
    }

    /// Moves an item to the placement it currently describes, touching
    /// only the cells it leaves and the cells it enters; cells covered by
    /// both the old and new placement are not rewritten.
    ///
    /// # Errors
    ///
    /// [`SpatialHashError::MissingId`] when the item carries no id;
    /// [`SpatialHashError::UnknownId`] when that id is not present.
    pub fn move_item(&mut self, item: &T) -> Result<(), SpatialHashError> {
        let id = item.grid_id().ok_or(SpatialHashError::MissingId)?;
        let shard_index = self.id_shard_of(id);
        let old_bounds = self.ids[shard_index]
            .get_mut()
            .bounds
            .get(&id)
            .copied()
            .ok_or(SpatialHashError::UnknownId(id))?;
        let new_bounds = self.clamped_bounds_of(item);

        let (old_start, old_end) = self.cell_range(&old_bounds);
        let (new_start, new_end) = self.cell_range(&new_bounds);

        let mut old_cells = std::mem::take(&mut self.old_cells);
        let mut new_cells = std::mem::take(&mut self.new_cells);
        collect_cells(old_start, old_end, &mut old_cells);
        collect_cells(new_start, new_end, &mut new_cells);

        for x in old_start.x..old_end.x {
            for y in old_start.y..old_end.y {
                for z in old_start.z..old_end.z {
                    let cell = CellCoord::new(x, y, z);
                    if !new_cells.contains(&cell) {
                        self.remove_from_cell(id, cell);
                    }
                }
            }
        }
        for x in new_start.x..new_end.x {
            for y in new_start.y..new_end.y {
                for z in new_start.z..new_end.z {
                    let cell = CellCoord::new(x, y, z);
                    if !old_cells.contains(&cell) {
                        self.insert_into_cell(id, cell);
                    }
                }
            }
        }

        self.old_cells = old_cells;
        self.new_cells = new_cells;

        let shard = self.ids[shard_index].get_mut();
        shard.bounds.insert(id, new_bounds);
        shard.items.insert(id, item.clone());
        Ok(())
    }

    /// Returns a copy of the stored payload for a live id.
    #[must_use]
    pub fn get(&self, id: ItemId) -> Option<T> {
        let shard = self.id_shard_of(id);
        self.ids[shard].lock().items.get(&id).cloned()
    }

    /// Returns the clamped bounds recorded for a live id.
    #[must_use]
    pub fn bounds_of(&self, id: ItemId) -> Option<Aabb> {
        let shard = self.id_shard_of(id);
        self.ids[shard].lock().bounds.get(&id).copied()
    }

    /// Appends every item recorded in one cell's bucket, de-duplicated.
    ///
    /// Emits by bucket membership alone; under a cell-hash collision this
    /// can include an item from a different cell that shares the hash.
    pub fn query_cell(&mut self, cell: CellCoord, out: &mut Vec<T>) {
        let mut seen = std::mem::take(&mut self.seen);
        seen.clear();

        let hash = cell.bucket_hash();
        let shard = self.bucket_shard_of(hash);
        if let Some(bucket) = self.buckets[shard].get_mut().cells.get(&hash) {
            seen.extend(bucket.iter().copied());
        }

        for &id in &seen {
            let shard = self.id_shard_of(id);
            if let Some(item) = self.ids[shard].get_mut().items.get(&id) {
                out.push(item.clone());
            }
        }
        self.seen = seen;
    }

    /// Appends every item whose stored bounds intersect `bounds` (clamped
    /// to the world).
    ///
    /// Two-stage filter: cell buckets provide candidates, the stored AABB
    /// decides. The cell stage alone is necessary but not sufficient (cell
    /// overlap and hash collisions both over-approximate).
    pub fn query_aabb(&mut self, bounds: &Aabb, out: &mut Vec<T>) {
        let clamped = bounds.clamped_to(&self.world);
        let (start, end) = self.cell_range(&clamped);

        let mut seen = std::mem::take(&mut self.seen);
        seen.clear();
        for x in start.x..end.x {
            for y in start.y..end.y {
                for z in start.z..end.z {
                    let hash = CellCoord::new(x, y, z).bucket_hash();
                    let shard = self.bucket_shard_of(hash);
                    if let Some(bucket) = self.buckets[shard].get_mut().cells.get(&hash) {
                        seen.extend(bucket.iter().copied());
                    }
                }
            }
        }

        for &id in &seen {
            let shard = self.id_shard_of(id);
            let shard = self.ids[shard].get_mut();
            if let Some(item_bounds) = shard.bounds.get(&id) {
                if clamped.intersects(item_bounds) {
                    if let Some(item) = shard.items.get(&id) {
                        out.push(item.clone());
                    }
                }
            }
        }
        self.seen = seen;
    }

    /// Appends every item whose stored bounds intersect the conservative
    /// enclosure of `obb` rotated about its centre.
    ///
    /// Candidate cells come from the enclosure; each cell is kept when any
    /// of three short axis rays across the cell hits the obb expanded by
    /// one cell. That three-ray test is the accepted approximation from
    /// the original design, not an exact obb-vs-cell overlap test; callers
    /// needing exactness post-filter via
    /// [`query_cells_obb`](Self::query_cells_obb).
    pub fn query_obb(&mut self, obb: &Aabb, rotation: &Rotation3<f64>, out: &mut Vec<T>) {
        let enclosure = obb.rotated_enclosure(rotation).clamped_to(&self.world);
        let (start, end) = self.cell_range(&enclosure);

        let mut expanded = *obb;
        expanded.expand_by(self.cell_size);
        let inverse = rotation.inverse();

        let mut seen = std::mem::take(&mut self.seen);
        seen.clear();
        for x in start.x..end.x {
            for y in start.y..end.y {
                for z in start.z..end.z {
                    let cell = CellCoord::new(x, y, z);
                    if !self.cell_hit_by_obb(cell, &expanded, &inverse) {
                        continue;
                    }
                    let hash = cell.bucket_hash();
                    let shard = self.bucket_shard_of(hash);
                    if let Some(bucket) = self.buckets[shard].get_mut().cells.get(&hash) {
                        seen.extend(bucket.iter().copied());
                    }
                }
            }
        }

        for &id in &seen {
            let shard = self.id_shard_of(id);
            let shard = self.ids[shard].get_mut();
            if let Some(item_bounds) = shard.bounds.get(&id) {
                if enclosure.intersects(item_bounds) {
                    if let Some(item) = shard.items.get(&id) {
                        out.push(item.clone());
                    }
                }
            }
        }
        self.seen = seen;
    }

    /// Appends the cell coordinates an AABB query would visit.
    pub fn query_cells_aabb(&self, bounds: &Aabb, out_cells: &mut Vec<CellCoord>) {
        let clamped = bounds.clamped_to(&self.world);
        let (start, end) = self.cell_range(&clamped);
        for x in start.x..end.x {
            for y in start.y..end.y {
                for z in start.z..end.z {
                    out_cells.push(CellCoord::new(x, y, z));
                }
            }
        }
    }

    /// Appends the cell coordinates an OBB query would keep after the
    /// three-ray cell test.
    pub fn query_cells_obb(
        &self,
        obb: &Aabb,
        rotation: &Rotation3<f64>,
        out_cells: &mut Vec<CellCoord>,
    ) {
        let enclosure = obb.rotated_enclosure(rotation).clamped_to(&self.world);
        let (start, end) = self.cell_range(&enclosure);

        let mut expanded = *obb;
        expanded.expand_by(self.cell_size);
        let inverse = rotation.inverse();

        for x in start.x..end.x {
            for y in start.y..end.y {
                for z in start.z..end.z {
                    let cell = CellCoord::new(x, y, z);
                    if self.cell_hit_by_obb(cell, &expanded, &inverse) {
                        out_cells.push(cell);
                    }
                }
            }
        }
    }

    /// Three short axis-aligned rays across the cell, each as long as the
    /// matching cell side, shot from the cell's negative faces. The cell
    /// survives if any of them enters the rotated box.
    fn cell_hit_by_obb(&self, cell: CellCoord, obb: &Aabb, inverse: &Rotation3<f64>) -> bool {
        let center = self.cell_center(cell);
        for axis in 0..3 {
            let mut direction = Vector3::zeros();
            direction[axis] = 1.0;
            let length = self.cell_size[axis];
            let origin = center - direction * (length * 0.5);
            if obb.hit_by_rotated_ray(origin, direction, length, inverse) {
                return true;
            }
        }
        false
    }

    /// Casts a ray and returns the first item whose stored bounds it
    /// enters, walking cells in crossing order.
    ///
    /// The walk stops once a cell coordinate exceeds the grid's cell count
    /// (the ray has left the world on the far side); rays entering from
    /// outside simply cross empty cells first. Directions containing NaN
    /// hit nothing.
    pub fn ray_cast(&mut self, ray: &Ray, length: f64) -> Option<RayHit<T>> {
        let direction = ray.direction_normalized();
        if direction.norm_squared() < 0.5 {
            // Zero direction; NaN falls through to the walk's short-circuit.
            return None;
        }

        let mut visitor = RayVisitor {
            grid: self,
            origin: ray.origin,
            direction,
            length,
            hit: None,
        };
        walk_cells(ray.origin, direction, length, &mut visitor);
        let (id, point) = visitor.hit?;

        let item = self.get(id)?;
        Some(RayHit { id, point, item })
    }
}

/// In-flight state of one ray cast: the grid plays the visitor, the hit
/// lives here so consecutive casts can never observe stale state.
struct RayVisitor<'a, T> {
    grid: &'a mut SpatialHash<T>,
    origin: Point3<f64>,
    direction: Vector3<f64>,
    length: f64,
    hit: Option<(ItemId, Point3<f64>)>,
}

impl<T> CellVisitor for RayVisitor<'_, T> {
    fn cell_at(&self, point: Point3<f64>) -> CellCoord {
        self.grid.cell_of(point)
    }

    fn cell_corner(&self, cell: CellCoord) -> Point3<f64> {
        self.grid.cell_min(cell)
    }

    fn cell_size(&self) -> Vector3<f64> {
        self.grid.cell_size
    }

    fn visit(&mut self, cell: CellCoord) -> bool {
        let count = self.grid.cell_count;
        if cell.x > count.x || cell.y > count.y || cell.z > count.z {
            // Past the far side of the world: nothing left to hit.
            return true;
        }

        let hash = cell.bucket_hash();
        let shard = self.grid.bucket_shard_of(hash);
        if let Some(bucket) = self.grid.buckets[shard].get_mut().cells.get(&hash) {
            for &id in bucket {
                let id_shard = (id.get() as usize) & self.grid.shard_mask;
                if let Some(bounds) = self.grid.ids[id_shard].get_mut().bounds.get(&id) {
                    if let Some(point) = bounds.clip_ray(self.origin, self.direction, self.length) {
                        self.hit = Some((id, point));
                        return true;
                    }
                }
            }
        }
        false
    }
}

/// Fills `out` with every cell in the half-open interval, reserving for
/// the full range first.
fn collect_cells(start: CellCoord, end: CellCoord, out: &mut HashSet<CellCoord>) {
    out.clear();
    let span = (end - start).component_max(CellCoord::origin());
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    out.reserve(span.component_product() as usize);
    for x in start.x..end.x {
        for y in start.y..end.y {
            for z in start.z..end.z {
                out.insert(CellCoord::new(x, y, z));
            }
        }
    }
}

/// Grows a table to the next power-of-two capacity that fits `additional`
/// more entries.
fn reserve_pow2<K, V>(map: &mut HashMap<K, V>, additional: usize)
where
    K: Eq + std::hash::Hash,
{
    let target = (map.len() + additional).next_power_of_two();
    if target > map.capacity() {
        map.reserve(target - map.len());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use std::f64::consts::FRAC_PI_4;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Block {
        center: Point3<f64>,
        size: Vector3<f64>,
        grid_id: Option<ItemId>,
    }

    impl Block {
        fn new(center: (f64, f64, f64), size: (f64, f64, f64)) -> Self {
            Self {
                center: Point3::new(center.0, center.1, center.2),
                size: Vector3::new(size.0, size.1, size.2),
                grid_id: None,
            }
        }
    }

    impl SpatialItem for Block {
        fn center(&self) -> Point3<f64> {
            self.center
        }
        fn size(&self) -> Vector3<f64> {
            self.size
        }
        fn grid_id(&self) -> Option<ItemId> {
            self.grid_id
        }
        fn set_grid_id(&mut self, id: ItemId) {
            self.grid_id = Some(id);
        }
    }

    fn world() -> Aabb {
        Aabb::from_center(Point3::new(15.0, 15.0, 15.0), Vector3::repeat(15.0))
    }

    fn grid() -> SpatialHash<Block> {
        SpatialHash::new(world(), Vector3::repeat(1.0), 16).unwrap()
    }

    #[test]
    fn construction_rejects_bad_config() {
        assert!(matches!(
            SpatialHash::<Block>::new(world(), Vector3::repeat(1.0), 0),
            Err(SpatialHashError::InvalidCapacity(0))
        ));
        assert!(matches!(
            SpatialHash::<Block>::new(world(), Vector3::new(1.0, 0.0, 1.0), 16),
            Err(SpatialHashError::InvalidCellSize(_))
        ));
        assert!(matches!(
            SpatialHash::<Block>::new(world(), Vector3::new(1.0, -2.0, 1.0), 16),
            Err(SpatialHashError::InvalidCellSize(_))
        ));
        assert!(matches!(
            SpatialHash::<Block>::new(world(), Vector3::new(f64::NAN, 1.0, 1.0), 16),
            Err(SpatialHashError::InvalidCellSize(_))
        ));
    }

    #[test]
    fn cell_count_covers_the_world() {
        let grid = grid();
        assert_eq!(grid.cell_count(), CellCoord::new(30, 30, 30));
    }

    #[test]
    fn single_cell_insert() {
        let mut grid = grid();
        let mut block = Block::new((5.5, 5.5, 5.5), (1.0, 1.0, 1.0));
        let id = grid.add(&mut block);
        assert_eq!(block.grid_id, Some(id));
        assert_eq!(grid.item_count(), 1);
        assert_eq!(grid.bucket_item_count(), 1);
    }

    #[test]
    fn multi_cell_insert_spans_a_3x3x3_block() {
        let mut grid = grid();
        let mut block = Block::new((5.5, 5.5, 5.5), (1.1, 1.1, 1.1));
        grid.add(&mut block);
        assert_eq!(grid.item_count(), 1);
        assert_eq!(grid.bucket_item_count(), 27);
    }

    #[test]
    fn over_world_insert_fills_the_grid() {
        let mut grid = grid();
        let mut block = Block::new((15.0, 15.0, 15.0), (40.0, 40.0, 40.0));
        grid.add(&mut block);
        assert_eq!(grid.item_count(), 1);
        assert_eq!(grid.bucket_item_count(), 27_000);
    }

    #[test]
    fn wholly_outside_item_occupies_no_cells_but_is_tracked() {
        let mut grid = grid();
        let mut block = Block::new((50.0, 50.0, 50.0), (1.0, 1.0, 1.0));
        let id = grid.add(&mut block);
        assert_eq!(grid.item_count(), 1);
        assert_eq!(grid.bucket_item_count(), 0);
        assert!(grid.get(id).is_some());
        grid.remove(id).unwrap();
        assert_eq!(grid.item_count(), 0);
    }

    #[test]
    fn remove_restores_the_empty_state() {
        let mut grid = grid();
        let mut block = Block::new((5.5, 5.5, 5.5), (1.1, 1.1, 1.1));
        let id = grid.add(&mut block);
        let removed = grid.remove(id).unwrap();
        assert_eq!(removed.center, block.center);
        assert_eq!(grid.item_count(), 0);
        assert_eq!(grid.bucket_item_count(), 0);
        assert_eq!(grid.get(id), None);
    }

    #[test]
    fn remove_unknown_id_is_an_error_and_mutates_nothing() {
        let mut grid = grid();
        let mut block = Block::new((5.5, 5.5, 5.5), (1.0, 1.0, 1.0));
        let id = grid.add(&mut block);
        grid.remove(id).unwrap();
        assert_eq!(grid.remove(id), Err(SpatialHashError::UnknownId(id)));
        assert_eq!(grid.item_count(), 0);
    }

    #[test]
    fn per_cell_query_roundtrip() {
        let mut grid = grid();
        let mut block = Block::new((5.5, 5.5, 5.5), (1.1, 1.1, 1.1));
        grid.add(&mut block);

        let mut out = Vec::new();
        for x in 4..7 {
            for y in 4..7 {
                for z in 4..7 {
                    out.clear();
                    let center = Point3::new(
                        f64::from(x) + 0.5,
                        f64::from(y) + 0.5,
                        f64::from(z) + 0.5,
                    );
                    grid.query_aabb(
                        &Aabb::from_center(center, Vector3::repeat(0.475)),
                        &mut out,
                    );
                    assert_eq!(out.len(), 1, "cell ({x},{y},{z})");
                }
            }
        }
    }

    #[test]
    fn oversized_query_finds_the_item_once() {
        let mut grid = grid();
        let mut block = Block::new((5.5, 5.5, 5.5), (1.1, 1.1, 1.1));
        grid.add(&mut block);

        let mut out = Vec::new();
        grid.query_aabb(
            &Aabb::from_center(Point3::new(15.0, 15.0, 15.0), Vector3::repeat(25.0)),
            &mut out,
        );
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn query_filters_by_stored_bounds_not_just_cells() {
        let mut grid = grid();
        let mut near = Block::new((5.25, 5.5, 5.5), (0.2, 0.2, 0.2));
        let mut far = Block::new((5.85, 5.5, 5.5), (0.2, 0.2, 0.2));
        grid.add(&mut near);
        grid.add(&mut far);
        // Both blocks share cell (5,5,5); only `near` overlaps the probe.
        let mut out = Vec::new();
        grid.query_aabb(
            &Aabb::from_center(Point3::new(5.2, 5.5, 5.5), Vector3::repeat(0.1)),
            &mut out,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].center, near.center);
    }

    #[test]
    fn full_world_query_emits_every_item_exactly_once() {
        let mut grid = grid();
        let mut ids = Vec::new();
        for i in 0..20 {
            let offset = 1.5 * f64::from(i);
            let mut block = Block::new((1.0 + offset % 27.0, 5.5, 5.5), (0.9, 0.9, 0.9));
            ids.push(grid.add(&mut block));
        }

        let mut out = Vec::new();
        grid.query_aabb(&world(), &mut out);
        assert_eq!(out.len(), 20);
        let mut seen: Vec<_> = out.iter().map(|b| b.grid_id.unwrap()).collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 20);
    }

    #[test]
    fn queries_append_without_clearing() {
        let mut grid = grid();
        let mut block = Block::new((5.5, 5.5, 5.5), (1.0, 1.0, 1.0));
        grid.add(&mut block);

        let probe = Aabb::from_center(Point3::new(5.5, 5.5, 5.5), Vector3::repeat(0.4));
        let mut out = Vec::new();
        grid.query_aabb(&probe, &mut out);
        grid.query_aabb(&probe, &mut out);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn query_cell_reports_bucket_membership() {
        let mut grid = grid();
        let mut block = Block::new((5.5, 5.5, 5.5), (1.1, 1.1, 1.1));
        grid.add(&mut block);

        let mut out = Vec::new();
        grid.query_cell(CellCoord::new(4, 5, 6), &mut out);
        assert_eq!(out.len(), 1);

        out.clear();
        grid.query_cell(CellCoord::new(10, 10, 10), &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn ids_are_strictly_increasing_and_survive_clear() {
        let mut grid = grid();
        let mut a = Block::new((1.5, 1.5, 1.5), (0.5, 0.5, 0.5));
        let mut b = Block::new((2.5, 2.5, 2.5), (0.5, 0.5, 0.5));
        let id_a = grid.add(&mut a);
        let id_b = grid.add(&mut b);
        assert!(id_b > id_a);

        grid.clear();
        assert_eq!(grid.item_count(), 0);
        assert_eq!(grid.bucket_item_count(), 0);

        let mut c = Block::new((3.5, 3.5, 3.5), (0.5, 0.5, 0.5));
        let id_c = grid.add(&mut c);
        assert!(id_c > id_b, "clear must not reset the id counter");
    }

    #[test]
    fn move_roundtrip_restores_the_original_state() {
        let mut grid = grid();
        let mut block = Block::new((5.5, 5.5, 5.5), (1.1, 1.1, 1.1));
        let id = grid.add(&mut block);
        let original_bounds = grid.bounds_of(id).unwrap();

        block.center = Point3::new(12.2, 8.3, 7.7);
        grid.move_item(&block).unwrap();
        assert_eq!(grid.item_count(), 1);
        assert_eq!(grid.bucket_item_count(), 27);

        block.center = Point3::new(5.5, 5.5, 5.5);
        grid.move_item(&block).unwrap();

        assert_eq!(grid.item_count(), 1);
        assert_eq!(grid.bucket_item_count(), 27);
        assert_eq!(grid.bounds_of(id), Some(original_bounds));

        let mut out = Vec::new();
        grid.query_aabb(
            &Aabb::from_center(Point3::new(5.5, 5.5, 5.5), Vector3::repeat(0.4)),
            &mut out,
        );
        assert_eq!(out.len(), 1);
        out.clear();
        grid.query_aabb(
            &Aabb::from_center(Point3::new(12.2, 8.3, 7.7), Vector3::repeat(0.6)),
            &mut out,
        );
        assert!(out.is_empty());
    }

    #[test]
    fn move_between_overlapping_placements_keeps_shared_cells() {
        let mut grid = grid();
        let mut block = Block::new((5.5, 5.5, 5.5), (1.1, 1.1, 1.1));
        grid.add(&mut block);

        // Shift one cell along x: old cells 4..7, new cells 5..8.
        block.center = Point3::new(6.5, 5.5, 5.5);
        grid.move_item(&block).unwrap();
        assert_eq!(grid.bucket_item_count(), 27);

        let mut out = Vec::new();
        grid.query_aabb(
            &Aabb::from_center(Point3::new(7.5, 5.5, 5.5), Vector3::repeat(0.45)),
            &mut out,
        );
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn move_unknown_item_is_an_error() {
        let mut grid = grid();
        let block = Block::new((5.5, 5.5, 5.5), (1.0, 1.0, 1.0));
        assert_eq!(grid.move_item(&block), Err(SpatialHashError::MissingId));

        let mut other = Block::new((5.5, 5.5, 5.5), (1.0, 1.0, 1.0));
        let id = grid.add(&mut other);
        grid.remove(id).unwrap();
        assert_eq!(grid.move_item(&other), Err(SpatialHashError::UnknownId(id)));
    }

    #[test]
    fn remove_fast_then_add_fast_is_a_move() {
        let mut grid = grid();
        let mut block = Block::new((5.5, 5.5, 5.5), (1.0, 1.0, 1.0));
        let id = grid.add(&mut block);

        grid.remove_fast(id).unwrap();
        assert_eq!(grid.bucket_item_count(), 0);
        // Reverse tables still know the item.
        assert!(grid.get(id).is_some());

        block.center = Point3::new(20.5, 20.5, 20.5);
        grid.add_fast(&block).unwrap();
        assert_eq!(grid.item_count(), 1);
        assert_eq!(grid.bucket_item_count(), 1);

        let mut out = Vec::new();
        grid.query_aabb(
            &Aabb::from_center(Point3::new(20.5, 20.5, 20.5), Vector3::repeat(0.4)),
            &mut out,
        );
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn query_obb_axis_aligned_matches_aabb_query() {
        let mut grid = grid();
        let mut block = Block::new((5.5, 5.5, 5.5), (1.0, 1.0, 1.0));
        grid.add(&mut block);

        let mut out = Vec::new();
        grid.query_obb(
            &Aabb::from_center(Point3::new(5.5, 5.5, 5.5), Vector3::repeat(0.5)),
            &Rotation3::identity(),
            &mut out,
        );
        assert_eq!(out.len(), 1);

        out.clear();
        grid.query_obb(
            &Aabb::from_center(Point3::new(25.5, 25.5, 25.5), Vector3::repeat(0.5)),
            &Rotation3::identity(),
            &mut out,
        );
        assert!(out.is_empty());
    }

    #[test]
    fn query_obb_rotated_finds_items_under_the_swept_cover() {
        let mut grid = grid();
        // A wall of small blocks along x at y = 10.5.
        for x in 0..10 {
            let mut block =
                Block::new((f64::from(x) + 10.5, 10.5, 10.5), (0.8, 0.8, 0.8));
            grid.add(&mut block);
        }

        // A long thin box through the wall, rotated 45 degrees about z.
        let obb = Aabb::from_center(Point3::new(14.5, 10.5, 10.5), Vector3::new(4.0, 0.3, 0.3));
        let rotation = Rotation3::from_euler_angles(0.0, 0.0, FRAC_PI_4);
        let mut out = Vec::new();
        grid.query_obb(&obb, &rotation, &mut out);
        assert!(!out.is_empty());
        assert!(out.len() < 10, "rotated probe must prune most of the wall");
    }

    #[test]
    fn query_cells_aabb_enumerates_in_x_y_z_order() {
        let grid = grid();
        let mut cells = Vec::new();
        grid.query_cells_aabb(
            &Aabb::from_min_max(Point3::new(1.2, 2.2, 3.2), Point3::new(2.8, 3.8, 4.8)),
            &mut cells,
        );
        assert_eq!(
            cells,
            vec![
                CellCoord::new(1, 2, 3),
                CellCoord::new(1, 2, 4),
                CellCoord::new(1, 3, 3),
                CellCoord::new(1, 3, 4),
                CellCoord::new(2, 2, 3),
                CellCoord::new(2, 2, 4),
                CellCoord::new(2, 3, 3),
                CellCoord::new(2, 3, 4),
            ],
        );
    }

    #[test]
    fn query_cells_obb_keeps_cells_near_the_box() {
        let grid = grid();
        let obb = Aabb::from_center(Point3::new(10.5, 10.5, 10.5), Vector3::new(2.0, 0.3, 0.3));
        let rotation = Rotation3::from_euler_angles(0.0, 0.0, FRAC_PI_4);

        let mut kept = Vec::new();
        grid.query_cells_obb(&obb, &rotation, &mut kept);
        let mut visited = Vec::new();
        grid.query_cells_aabb(&obb.rotated_enclosure(&rotation), &mut visited);

        assert!(!kept.is_empty());
        assert!(kept.len() <= visited.len());
        // The cell containing the box centre always survives.
        assert!(kept.contains(&CellCoord::new(10, 10, 10)));
    }

    #[test]
    fn ray_hits_the_first_item_in_crossing_order() {
        let mut grid = grid();
        let mut near = Block::new((10.5, 15.5, 15.5), (1.0, 1.0, 1.0));
        let mut far = Block::new((20.5, 15.5, 15.5), (1.0, 1.0, 1.0));
        let near_id = grid.add(&mut near);
        grid.add(&mut far);

        let ray = Ray::new(Point3::new(2.0, 15.5, 15.5), Vector3::x());
        let hit = grid.ray_cast(&ray, 25.0).unwrap();
        assert_eq!(hit.id, near_id);
        assert!((hit.point.x - 10.0).abs() < 1e-9);
    }

    #[test]
    fn ray_from_outside_the_world_still_hits() {
        let mut grid = grid();
        let mut block = Block::new((0.0, 0.0, 0.0), (1.0, 1.0, 1.0));
        let id = grid.add(&mut block);

        let ray = Ray::new(Point3::new(-5.0, 0.0, 0.0), Vector3::x());
        let hit = grid.ray_cast(&ray, 10.0).unwrap();
        assert_eq!(hit.id, id);

        assert!(grid.ray_cast(&ray, 3.0).is_none());
    }

    #[test]
    fn ray_misses_when_nothing_is_on_the_path() {
        let mut grid = grid();
        let mut block = Block::new((10.5, 20.5, 10.5), (1.0, 1.0, 1.0));
        grid.add(&mut block);

        let ray = Ray::new(Point3::new(2.0, 10.5, 10.5), Vector3::x());
        assert!(grid.ray_cast(&ray, 25.0).is_none());
    }

    #[test]
    fn ray_with_nan_direction_hits_nothing() {
        let mut grid = grid();
        let mut block = Block::new((10.5, 15.5, 15.5), (2.0, 2.0, 2.0));
        grid.add(&mut block);

        let ray = Ray::new(Point3::new(2.0, 15.5, 15.5), Vector3::new(f64::NAN, 0.0, 0.0));
        assert!(grid.ray_cast(&ray, 25.0).is_none());
    }

    #[test]
    fn consecutive_ray_casts_do_not_leak_state() {
        let mut grid = grid();
        let mut block = Block::new((10.5, 15.5, 15.5), (1.0, 1.0, 1.0));
        grid.add(&mut block);

        let hitting = Ray::new(Point3::new(2.0, 15.5, 15.5), Vector3::x());
        assert!(grid.ray_cast(&hitting, 25.0).is_some());

        let missing = Ray::new(Point3::new(2.0, 25.5, 15.5), Vector3::x());
        assert!(grid.ray_cast(&missing, 25.0).is_none());
    }

    #[test]
    fn prepare_free_place_grows_capacity() {
        let mut grid = grid();
        grid.prepare_free_place(1_000);
        let capacity: usize = grid
            .ids
            .iter_mut()
            .map(|shard| shard.get_mut().items.capacity())
            .sum();
        assert!(capacity >= 1_000);
    }

    #[test]
    fn bucket_count_matches_cell_cover_after_mixed_churn() {
        let mut grid = grid();
        let mut blocks: Vec<Block> = (0..12)
            .map(|i| {
                Block::new(
                    (2.0 + 2.3 * f64::from(i), 3.0 + 1.7 * f64::from(i % 5), 9.5),
                    (1.1, 1.1, 1.1),
                )
            })
            .collect();
        for block in &mut blocks {
            grid.add(block);
        }

        let expected: usize = blocks
            .iter()
            .map(|block| {
                let bounds = grid.clamped_bounds_of(block);
                let (start, end) = grid.cell_range(&bounds);
                let span = end - start;
                (span.component_product().max(0)) as usize
            })
            .sum();
        assert_eq!(grid.bucket_item_count(), expected);

        // Remove every other block and re-check coherence.
        for block in blocks.iter().step_by(2) {
            grid.remove(block.grid_id.unwrap()).unwrap();
        }
        let expected: usize = blocks
            .iter()
            .skip(1)
            .step_by(2)
            .map(|block| {
                let bounds = grid.clamped_bounds_of(block);
                let (start, end) = grid.cell_range(&bounds);
                let span = end - start;
                (span.component_product().max(0)) as usize
            })
            .sum();
        assert_eq!(grid.bucket_item_count(), expected);
        assert_eq!(grid.item_count(), 6);
    }
}
