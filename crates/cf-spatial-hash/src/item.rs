//! The item contract: what the index needs from a payload type.

use std::num::NonZeroU32;

use nalgebra::{Point3, Vector3};

/// Identity of an item inside one [`SpatialHash`].
///
/// Ids are 32-bit, non-zero, strictly increasing in assignment order, and
/// never reused within a grid's lifetime (not even across [`clear`]).
/// The index writes the id back into the item via
/// [`SpatialItem::set_grid_id`] so later removes and moves skip a reverse
/// search.
///
/// [`SpatialHash`]: crate::SpatialHash
/// [`clear`]: crate::SpatialHash::clear
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ItemId(NonZeroU32);

impl ItemId {
    /// Wraps a raw non-zero id.
    ///
    /// Only useful for mirroring ids through external storage; fresh ids
    /// always come from an insert.
    #[must_use]
    pub const fn from_raw(raw: NonZeroU32) -> Self {
        Self(raw)
    }

    /// The raw id value.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0.get()
    }
}

/// Payload contract for items stored in a [`SpatialHash`].
///
/// An item is an axis-aligned box described by its `center` and full
/// `size` (extents, not half-extents), plus a slot the index uses to write
/// the assigned [`ItemId`] back into the item.
///
/// # Example
///
/// ```
/// use cf_spatial_hash::{ItemId, SpatialItem};
/// use nalgebra::{Point3, Vector3};
///
/// #[derive(Clone)]
/// struct Crate {
///     center: Point3<f64>,
///     size: Vector3<f64>,
///     grid_id: Option<ItemId>,
/// }
///
/// impl SpatialItem for Crate {
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
/// ```
///
/// [`SpatialHash`]: crate::SpatialHash
pub trait SpatialItem {
    /// World-space center of the item's bounding box.
    fn center(&self) -> Point3<f64>;

    /// Full extents of the item's bounding box (not half-extents).
    fn size(&self) -> Vector3<f64>;

    /// The id assigned by the index, or `None` before the first insert.
    fn grid_id(&self) -> Option<ItemId>;

    /// Stores the id assigned by the index.
    fn set_grid_id(&mut self, id: ItemId);
}
