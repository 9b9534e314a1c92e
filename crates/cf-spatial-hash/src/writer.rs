//! Shared-write handle: parallel insertion into a [`SpatialHash`].
//!
//! The original design shared one mutable table set across threads behind
//! an external safety handle. Here the split is carried by the borrow
//! checker instead: [`SpatialHash::to_concurrent`] takes `&mut self` and
//! hands out a [`ConcurrentWriter`] holding a shared borrow, so while any
//! copy of the writer is alive no exclusive operation (queries, removes,
//! resizes) can be reached, and once the writer is gone exclusive access
//! resumes with no locks taken.
//!
//! Writers only insert. Capacity is reserved up front with
//! [`SpatialHash::prepare_free_place`]; a writer that runs out of headroom
//! reports `false` and leaves no partial state behind.

use parking_lot::MutexGuard;
use smallvec::SmallVec;

use crate::bounds::Aabb;
use crate::index::{BucketShard, SpatialHash};
use crate::item::{ItemId, SpatialItem};

impl<T: SpatialItem + Clone> SpatialHash<T> {
    /// Derives a shared-write handle for a parallel insert pass.
    ///
    /// The handle is `Copy` and can be captured by any number of worker
    /// threads; the exclusive handle stays borrowed until the last copy is
    /// gone. Call [`prepare_free_place`](Self::prepare_free_place) first:
    /// shared-write mode never resizes.
    ///
    /// # Example
    ///
    /// ```
    /// # use cf_spatial_hash::{Aabb, ItemId, SpatialHash, SpatialItem};
    /// # use nalgebra::{Point3, Vector3};
    /// # #[derive(Clone)]
    /// # struct Prop(Point3<f64>, Option<ItemId>);
    /// # impl SpatialItem for Prop {
    /// #     fn center(&self) -> Point3<f64> { self.0 }
    /// #     fn size(&self) -> Vector3<f64> { Vector3::repeat(1.0) }
    /// #     fn grid_id(&self) -> Option<ItemId> { self.1 }
    /// #     fn set_grid_id(&mut self, id: ItemId) { self.1 = Some(id); }
    /// # }
    /// let world = Aabb::from_center(Point3::new(15.0, 15.0, 15.0), Vector3::repeat(15.0));
    /// let mut grid = SpatialHash::new(world, Vector3::repeat(1.0), 16)?;
    /// grid.prepare_free_place(2);
    ///
    /// let mut a = Prop(Point3::new(3.5, 3.5, 3.5), None);
    /// let mut b = Prop(Point3::new(9.5, 9.5, 9.5), None);
    /// let writer = grid.to_concurrent();
    /// assert!(writer.try_add(&mut a));
    /// assert!(writer.try_add(&mut b));
    ///
    /// // The writer is gone; exclusive access resumes.
    /// assert_eq!(grid.item_count(), 2);
    /// # Ok::<(), cf_spatial_hash::SpatialHashError>(())
    /// ```
    pub fn to_concurrent(&mut self) -> ConcurrentWriter<'_, T> {
        ConcurrentWriter { grid: self }
    }
}

/// Insert-only view over a [`SpatialHash`] that is safe to copy across
/// worker threads.
///
/// Supports [`try_add`](Self::try_add) and [`add_fast`](Self::add_fast);
/// no removes, no queries, no resizes. Id assignment goes through the
/// grid's atomic counter, so ids observed across threads are unique and
/// strictly increasing in acquisition order; bucket append order within a
/// cell is unspecified.
pub struct ConcurrentWriter<'g, T> {
    grid: &'g SpatialHash<T>,
}

impl<T> Clone for ConcurrentWriter<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ConcurrentWriter<'_, T> {}

impl<T: SpatialItem + Clone> ConcurrentWriter<'_, T> {
    /// Inserts an item under a freshly assigned id, writing the id back
    /// into the item.
    ///
    /// Returns `false` when any touched table shard is out of reserved
    /// headroom. The insert is all-or-nothing: on `false` the reverse
    /// tables are rolled back and no bucket was written; the assigned id
    /// is discarded (ids are monotonic, not dense). The caller finishes
    /// the tick, grows capacity in exclusive mode, and retries.
    #[must_use]
    pub fn try_add(&self, item: &mut T) -> bool {
        let grid = self.grid;
        let bounds = grid.clamped_bounds_of(item);
        let id = grid.issue_id();
        item.set_grid_id(id);

        {
            let mut shard = grid.ids[grid.id_shard_of(id)].lock();
            if shard.bounds.len() >= shard.bounds.capacity()
                || shard.items.len() >= shard.items.capacity()
            {
                return false;
            }
            shard.bounds.insert(id, bounds);
            shard.items.insert(id, item.clone());
        }

        if self.append_to_buckets(id, &bounds) {
            return true;
        }

        // Bucket headroom ran out; take the reverse entries back so the
        // failed insert leaves no trace.
        let mut shard = grid.ids[grid.id_shard_of(id)].lock();
        shard.bounds.remove(&id);
        shard.items.remove(&id);
        false
    }

    /// Re-inserts an item under the id it already carries, overwriting the
    /// reverse-table entries; the shared-write half of a
    /// [`remove_fast`](SpatialHash::remove_fast) move pairing.
    ///
    /// Returns `false` when the item carries no id or a shard is out of
    /// headroom. On `false` no bucket was written; the reverse tables may
    /// already hold the new placement, which the exclusive
    /// [`add_fast`](SpatialHash::add_fast) retry overwrites again.
    #[must_use]
    pub fn add_fast(&self, item: &T) -> bool {
        let Some(id) = item.grid_id() else {
            return false;
        };
        let grid = self.grid;
        let bounds = grid.clamped_bounds_of(item);

        {
            let mut shard = grid.ids[grid.id_shard_of(id)].lock();
            let needs_bounds_slot = !shard.bounds.contains_key(&id);
            let needs_item_slot = !shard.items.contains_key(&id);
            if (needs_bounds_slot && shard.bounds.len() >= shard.bounds.capacity())
                || (needs_item_slot && shard.items.len() >= shard.items.capacity())
            {
                return false;
            }
            shard.bounds.insert(id, bounds);
            shard.items.insert(id, item.clone());
        }

        self.append_to_buckets(id, &bounds)
    }

    /// Appends `id` to the bucket of every cell the bounds cover, or does
    /// nothing at all.
    ///
    /// All shards the cell range touches are locked in ascending index
    /// order (writers can never deadlock each other), headroom for the new
    /// keys is validated across every shard, and only then are the
    /// appends performed.
    fn append_to_buckets(&self, id: ItemId, bounds: &Aabb) -> bool {
        let grid = self.grid;
        let (start, end) = grid.cell_range(bounds);

        let mut hashes: SmallVec<[u32; 32]> = SmallVec::new();
        for x in start.x..end.x {
            for y in start.y..end.y {
                for z in start.z..end.z {
                    hashes.push(crate::CellCoord::new(x, y, z).bucket_hash());
                }
            }
        }
        if hashes.is_empty() {
            // Wholly out-of-world items occupy no cells.
            return true;
        }

        let mut shard_indices: SmallVec<[usize; 8]> =
            hashes.iter().map(|&hash| grid.bucket_shard_of(hash)).collect();
        shard_indices.sort_unstable();
        shard_indices.dedup();

        let mut guards: SmallVec<[(usize, MutexGuard<'_, BucketShard>); 8]> = shard_indices
            .iter()
            .map(|&index| (index, grid.buckets[index].lock()))
            .collect();

        // Distinct hashes decide how many fresh keys each shard needs.
        let mut unique = hashes.clone();
        unique.sort_unstable();
        unique.dedup();
        for &(index, ref guard) in &guards {
            let fresh = unique
                .iter()
                .filter(|&&hash| {
                    grid.bucket_shard_of(hash) == index && !guard.cells.contains_key(&hash)
                })
                .count();
            if guard.cells.len() + fresh > guard.cells.capacity() {
                return false;
            }
        }

        for &hash in &hashes {
            let index = grid.bucket_shard_of(hash);
            if let Some((_, guard)) = guards.iter_mut().find(|(i, _)| *i == index) {
                guard.cells.entry(hash).or_default().push(id);
            }
        }
        true
    }
}
