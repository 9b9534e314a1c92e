//! Error types for the spatial index.

use nalgebra::Vector3;

use crate::item::ItemId;

/// Errors that can occur while building or mutating a [`SpatialHash`].
///
/// [`SpatialHash`]: crate::SpatialHash
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum SpatialHashError {
    /// The cell size must be strictly positive and finite on every axis.
    #[error("cell size must be strictly positive and finite on every axis, got {0:?}")]
    InvalidCellSize(Vector3<f64>),

    /// The initial capacity must be at least one.
    #[error("initial capacity must be at least 1, got {0}")]
    InvalidCapacity(usize),

    /// An id was passed that is not present in the index.
    ///
    /// The operation did not mutate any table.
    #[error("item id {0:?} is not present in the index")]
    UnknownId(ItemId),

    /// An item was passed to an operation that requires its id to already
    /// be assigned (`add_fast`, `move_item`).
    #[error("item has no assigned id")]
    MissingId,

    /// A shared-write insert could not reserve space in one of the tables.
    ///
    /// Surfaced as `false` from [`ConcurrentWriter::try_add`]; the caller
    /// finishes the current tick, grows capacity in exclusive mode, and
    /// retries.
    ///
    /// [`ConcurrentWriter::try_add`]: crate::ConcurrentWriter::try_add
    #[error("concurrent insert exhausted the reserved table capacity")]
    CapacityExhausted,
}
