use std::io::{Read, Write};

use crate::core::{Coord, CoordBBox, VoxelValue};

use super::LeafNode;

/// Contract shared by every non-root node of the tree.
///
/// The root recurses into its children through this trait; internal nodes
/// recurse into theirs the same way, with [`LeafNode`] as the base case.
/// Everything is monomorphized; there is no dynamic dispatch anywhere in
/// the tree.
pub trait TreeNode<T: VoxelValue>: Sized {
    /// 0 for leaves, counting up toward the root's children.
    const LEVEL: u32;
    /// Log2 of this node's own fan-out per axis.
    const LOG2DIM: u32;
    /// Log2 of the side length of the cube this node covers.
    const TOTAL_LOG2: u32;
    /// Side length of the covered cube in voxels.
    const DIM: i32;
    /// Number of voxels in the covered cube.
    const NUM_VOXELS: u64;

    /// A node at `origin` uniformly holding `value` with the given active
    /// state. The origin is aligned down to `DIM` internally.
    fn new(origin: Coord, value: T, active: bool) -> Self;

    /// A node with the same topology (child layout and active states) as
    /// `other` but every value set to `value`.
    fn topology_copy_from(other: &Self, value: T) -> Self;

    fn origin(&self) -> Coord;

    fn get_value(&self, xyz: Coord) -> T;
    fn is_value_on(&self, xyz: Coord) -> bool;
    /// Writes the value at `xyz` into `value` and returns its active state.
    fn probe_value(&self, xyz: Coord, value: &mut T) -> bool;
    /// Level at which the value at `xyz` is stored (0 = leaf voxel,
    /// `Self::LEVEL` = tile in this node).
    fn value_level(&self, xyz: Coord) -> u32;

    fn set_value_on(&mut self, xyz: Coord, value: T);
    /// Sets the value without touching the active state.
    fn set_value_only(&mut self, xyz: Coord, value: T);
    fn set_value_off(&mut self, xyz: Coord, value: T);
    fn set_active_state(&mut self, xyz: Coord, on: bool);
    fn set_value_on_min(&mut self, xyz: Coord, value: T);
    fn set_value_on_max(&mut self, xyz: Coord, value: T);
    fn set_value_on_sum(&mut self, xyz: Coord, addend: T);
    /// Marks every voxel and tile active without changing values.
    fn set_values_on(&mut self);

    /// Assigns `value` and `active` to every voxel in `bbox` clipped to
    /// this node's cube, tiling wherever whole child cubes are covered.
    fn fill(&mut self, bbox: &CoordBBox, value: T, active: bool);

    /// Value of the first voxel in index order (minimum corner).
    fn first_value(&self) -> T;
    /// Value of the last voxel in index order (maximum corner).
    fn last_value(&self) -> T;

    fn leaf_count(&self) -> u64;
    fn on_voxel_count(&self) -> u64;
    /// True if no voxel and no tile in this subtree is active.
    fn is_inactive(&self) -> bool;
    fn has_active_tiles(&self) -> bool;
    fn eval_active_bbox(&self, bbox: &mut CoordBBox);

    /// Returns the leaf containing `xyz`, materializing it (and any tiles
    /// along the way) if necessary.
    fn touch_leaf(&mut self, xyz: Coord) -> &mut LeafNode<T>;
    fn probe_leaf(&mut self, xyz: Coord) -> Option<&mut LeafNode<T>>;
    fn probe_const_leaf(&self, xyz: Coord) -> Option<&LeafNode<T>>;
    fn for_each_leaf_mut(&mut self, f: &mut dyn FnMut(&mut LeafNode<T>));

    /// Bottom-up collapse of uniform regions. Returns `Some((value,
    /// active))` if this whole node is uniform within `tolerance` and the
    /// caller should replace it with that tile.
    fn prune(&mut self, tolerance: T) -> Option<(T, bool)>;
    /// Collapses fully inactive subtrees to `(value, off)` tiles.
    fn prune_inactive(&mut self, value: T) -> Option<(T, bool)>;
    /// Collapses inactive sign-uniform regions of a level set to
    /// `±outside` tiles.
    fn prune_level_set(&mut self, outside: T) -> Option<(T, bool)>;

    /// Gives every inactive voxel and tile the sign of the nearest active
    /// value along a z-scan. Active values are never modified.
    fn signed_flood_fill(&mut self, outside: T, inside: T);
    /// Replaces every active tile with a fully-active child subtree.
    fn voxelize_active_tiles(&mut self);
    /// Rewrites inactive `±old` values as `±new`.
    fn reset_background(&mut self, old: T, new: T);

    /// Steals `other`'s subtrees wherever this node holds tiles.
    fn merge(&mut self, other: Self, other_background: T, background: T);
    /// Unions `other`'s active topology into this node; values on this
    /// side are untouched.
    fn topology_union(&mut self, other: &Self);
    fn has_same_topology(&self, other: &Self) -> bool;

    /// Pointwise combination of this subtree (the A side) with `other`
    /// (the B side): `op(a, a_active, b, b_active) -> (result, active)`.
    fn combine<F>(&mut self, other: Self, op: &mut F)
    where
        F: FnMut(T, bool, T, bool) -> (T, bool);
    /// Combines this subtree with a constant tile. `tile_is_a` selects
    /// which side of `op` the tile occupies.
    fn combine_with_tile<F>(&mut self, value: T, active: bool, tile_is_a: bool, op: &mut F)
    where
        F: FnMut(T, bool, T, bool) -> (T, bool);
    /// Builds a node from the pointwise combination of `a` and `b`.
    fn combine2<F>(a: &Self, b: &Self, op: &mut F) -> Self
    where
        F: FnMut(T, bool, T, bool) -> (T, bool);
    /// Builds a node from the combination of `child` with a constant tile.
    fn combine2_with_tile<F>(child: &Self, value: T, active: bool, tile_is_a: bool, op: &mut F) -> Self
    where
        F: FnMut(T, bool, T, bool) -> (T, bool);

    fn write_topology<W: Write>(&self, writer: &mut W) -> std::io::Result<()>;
    fn read_topology<R: Read>(reader: &mut R, origin: Coord, background: T) -> std::io::Result<Self>;
    fn write_buffers<W: Write>(&self, writer: &mut W) -> std::io::Result<()>;
    fn read_buffers<R: Read>(&mut self, reader: &mut R) -> std::io::Result<()>;
}
