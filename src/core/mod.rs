mod bbox;
mod coord;
mod mask;
mod voxel;

pub use bbox::CoordBBox;
pub use coord::Coord;
pub use mask::{MaskWord, NodeMask};
pub use voxel::{ByteConversion, VoxelValue};
