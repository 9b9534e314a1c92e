//! Batch boundary: the per-tick contract between an orchestrator and the
//! index.
//!
//! An orchestrator (an ECS change-tracking pass, a scene graph diff) groups
//! dirty items into added / moved / removed and hands them over once per
//! tick. [`apply_batch`] then does the whole dance: pre-size the tables,
//! run the parallel insert pass over the shared-write handle, pair
//! `remove_fast`/`add_fast` for moves, and serially remove the dead items.
//!
//! Insertion parallelizes across CPU cores via rayon when the `parallel`
//! feature is enabled; sequential fallback when disabled. The index core
//! itself never logs; this boundary layer emits `tracing::debug!` events
//! with the tick's group sizes.

use std::hash::Hash;

#[cfg(feature = "parallel")]
use rayon::prelude::*;
use tracing::debug;

use hashbrown::HashMap;

use crate::error::SpatialHashError;
use crate::index::SpatialHash;
use crate::item::{ItemId, SpatialItem};

/// The orchestrator-side map from item payloads to their mirror ids.
///
/// Keys are compared with the payload's own `Eq`/`Hash`; use an identity
/// that survives movement (an entity tag, not a position) so a moved item
/// still resolves to its mirror id. One live mirror per payload identity:
/// recording the same identity twice keeps only the latest id.
#[derive(Debug, Clone)]
pub struct MirrorSet<T> {
    ids: HashMap<T, ItemId>,
}

impl<T: Eq + Hash> MirrorSet<T> {
    /// Creates an empty mirror set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ids: HashMap::new(),
        }
    }

    /// Number of recorded mirrors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether no mirrors are recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// The mirror id recorded for a payload, if any.
    #[must_use]
    pub fn id_of(&self, item: &T) -> Option<ItemId> {
        self.ids.get(item).copied()
    }

    /// Records the mirror id for a payload.
    pub fn record(&mut self, item: T, id: ItemId) {
        self.ids.insert(item, id);
    }

    /// Removes and returns the mirror id for a payload.
    pub fn take(&mut self, item: &T) -> Option<ItemId> {
        self.ids.remove(item)
    }
}

impl<T: Eq + Hash> Default for MirrorSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// One tick's worth of dirty items, grouped the way the index consumes
/// them.
#[derive(Debug, Clone)]
pub struct BatchUpdate<T> {
    /// Items inserted this tick; ids are assigned during
    /// [`apply_batch`] and written back in place.
    pub added: Vec<T>,
    /// Items that moved or resized; each must already carry its id.
    pub moved: Vec<T>,
    /// Items deleted this tick; resolved to ids through the
    /// [`MirrorSet`].
    pub removed: Vec<T>,
}

impl<T> BatchUpdate<T> {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self {
            added: Vec::new(),
            moved: Vec::new(),
            removed: Vec::new(),
        }
    }

    /// Whether all three groups are empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.moved.is_empty() && self.removed.is_empty()
    }

    /// Empties all three groups.
    pub fn clear(&mut self) {
        self.added.clear();
        self.moved.clear();
        self.removed.clear();
    }
}

impl<T> Default for BatchUpdate<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Applies one tick of grouped changes to the index.
///
/// In order:
///
/// 1. Pre-sizes the tables for one-and-a-half times the added count, so
///    the parallel pass never needs to resize.
/// 2. Inserts the added items through the shared-write handle (parallel
///    under the `parallel` feature); inserts the handle rejected again,
///    serially, in exclusive mode where growth is allowed.
/// 3. Records a mirror id for every added item.
/// 4. For moved items: serial `remove_fast`, then `add_fast` through the
///    shared-write handle, with the same serial retry.
/// 5. Serially removes deleted items under their mirror ids.
///
/// The batch is cleared on success; assigned ids live on in `mirrors`.
///
/// # Errors
///
/// [`SpatialHashError::MissingId`] when a moved item carries no id or a
/// removed item has no recorded mirror;
/// [`SpatialHashError::UnknownId`] when a carried or mirrored id is not
/// live in the index. The batch is left unconsumed in that case.
pub fn apply_batch<T>(
    grid: &mut SpatialHash<T>,
    batch: &mut BatchUpdate<T>,
    mirrors: &mut MirrorSet<T>,
) -> Result<(), SpatialHashError>
where
    T: SpatialItem + Clone + Eq + Hash + Send,
{
    if batch.is_empty() {
        return Ok(());
    }

    grid.prepare_free_place(batch.added.len() * 3 / 2);

    let retried_adds = {
        let writer = grid.to_concurrent();
        let rejected: Vec<usize> = insert_pass(&mut batch.added, |item| writer.try_add(item));
        drop(writer);
        for &index in &rejected {
            grid.add(&mut batch.added[index]);
        }
        rejected.len()
    };
    for item in &batch.added {
        let id = item.grid_id().ok_or(SpatialHashError::MissingId)?;
        mirrors.record(item.clone(), id);
    }

    for item in &batch.moved {
        let id = item.grid_id().ok_or(SpatialHashError::MissingId)?;
        grid.remove_fast(id)?;
    }
    let retried_moves = {
        let writer = grid.to_concurrent();
        let rejected: Vec<usize> = insert_pass(&mut batch.moved, |item| writer.add_fast(item));
        drop(writer);
        for &index in &rejected {
            grid.add_fast(&batch.moved[index])?;
        }
        rejected.len()
    };

    for item in &batch.removed {
        let id = mirrors.take(item).ok_or(SpatialHashError::MissingId)?;
        grid.remove(id)?;
    }

    debug!(
        added = batch.added.len(),
        moved = batch.moved.len(),
        removed = batch.removed.len(),
        retried_adds,
        retried_moves,
        "applied spatial batch"
    );

    batch.clear();
    Ok(())
}

/// Runs `insert` over every item and returns the indices it rejected.
#[cfg(feature = "parallel")]
fn insert_pass<T, F>(items: &mut [T], insert: F) -> Vec<usize>
where
    T: Send,
    F: Fn(&mut T) -> bool + Sync,
{
    items
        .par_iter_mut()
        .enumerate()
        .filter_map(|(index, item)| (!insert(item)).then_some(index))
        .collect()
}

/// Runs `insert` over every item and returns the indices it rejected.
#[cfg(not(feature = "parallel"))]
fn insert_pass<T, F>(items: &mut [T], insert: F) -> Vec<usize>
where
    T: Send,
    F: Fn(&mut T) -> bool + Sync,
{
    items
        .iter_mut()
        .enumerate()
        .filter_map(|(index, item)| (!insert(item)).then_some(index))
        .collect()
}
