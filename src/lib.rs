//! Sparse hierarchical voxel tree for volumes that are mostly constant
//! with locally complex detail, prototypically narrow-band signed
//! distance fields.
//!
//! The structure indexes the full signed 32-bit 3D lattice with a fixed
//! four-level tree (root, two internal levels, 8^3 leaves). Constant
//! regions collapse to tiles at any level; a global background covers
//! everything else. Point access goes through [`Tree`] or, for coherent
//! access patterns, a caching [`ValueAccessor`]. Bulk algorithms
//! (morphology, signed flood fill, pruning, structural combiners) walk
//! the nodes directly.

pub mod core;
pub mod io;
pub mod tools;
pub mod tree;

pub use crate::core::{ByteConversion, Coord, CoordBBox, MaskWord, NodeMask, VoxelValue};
pub use crate::io::{read_tree, write_tree};
pub use crate::tools::{dilate_voxels, dilate_voxels_with, erode_voxels, erode_voxels_with};
pub use crate::tree::{
    BoolTree, DoubleTree, FloatTree, Int32Tree, Internal1, Internal2, InternalNode, LeafManager,
    LeafMask, LeafNode, ReadAccessor, RootNode, Slot, Tile, Tree, TreeNode, ValueAccessor,
};
