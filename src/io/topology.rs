use std::io::{Read, Write};

use crate::core::VoxelValue;
use crate::tree::Tree;

/// Writes the full tree stream: the topology pass followed by the leaf
/// buffer pass. Returns false if the tree was empty (the stream then holds
/// only the background and zero counts).
#[cfg_attr(feature = "tracing", tracing::instrument(skip_all, name = "io::write_tree"))]
pub fn write_tree<T: VoxelValue, W: Write>(tree: &Tree<T>, writer: &mut W) -> std::io::Result<bool> {
    if !tree.write_topology(writer)? {
        return Ok(false);
    }
    tree.write_buffers(writer)?;
    Ok(true)
}

/// Reads a full tree stream into `tree`, replacing its contents. Returns
/// false if the stream held an empty tree; the stored background is
/// adopted either way.
#[cfg_attr(feature = "tracing", tracing::instrument(skip_all, name = "io::read_tree"))]
pub fn read_tree<T: VoxelValue, R: Read>(tree: &mut Tree<T>, reader: &mut R) -> std::io::Result<bool> {
    if !tree.read_topology(reader)? {
        return Ok(false);
    }
    tree.read_buffers(reader)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Coord, CoordBBox};

    #[test]
    fn test_empty_tree_round_trip() {
        let tree = Tree::new(5.0f32);
        let mut bytes = Vec::new();
        assert!(!write_tree(&tree, &mut bytes).unwrap());
        // background + two u32 counts
        assert_eq!(bytes.len(), 4 + 4 + 4);

        let mut read = Tree::new(2.0f32);
        assert!(!read_tree(&mut read, &mut bytes.as_slice()).unwrap());
        assert_eq!(read.background(), 5.0);
        assert!(read.is_empty());
    }

    #[test]
    fn test_two_voxel_round_trip() {
        let mut tree = Tree::new(5.0f32);
        tree.set_value_on(Coord::new(5, 10, 20), 0.234);
        tree.set_value_on(Coord::new(50000, 20000, 30000), 4.5678);

        let mut bytes = Vec::new();
        assert!(write_tree(&tree, &mut bytes).unwrap());

        let mut read = Tree::new(2.0f32);
        assert!(read_tree(&mut read, &mut bytes.as_slice()).unwrap());
        // The stored background replaces the fresh tree's own.
        assert_eq!(read.background(), 5.0);
        assert_eq!(read.get_value(Coord::new(5, 10, 20)), 0.234);
        assert_eq!(read.get_value(Coord::new(50000, 20000, 30000)), 4.5678);
        assert!(read.is_value_on(Coord::new(5, 10, 20)));
        assert!(tree.has_same_topology(&read));
        assert_eq!(read.active_voxel_count(), 2);
    }

    #[test]
    fn test_tiles_and_children_round_trip() {
        let mut tree = Tree::new(1.0f32);
        let dim = crate::tree::RootNode::<f32>::CHILD_DIM;
        // A root-level active tile, an inactive non-background tile and a
        // partially refined child.
        tree.fill(&CoordBBox::new(Coord::ZERO, Coord::splat(dim - 1)), 3.0, true);
        tree.fill(
            &CoordBBox::new(Coord::new(dim, 0, 0), Coord::new(2 * dim - 1, dim - 1, dim - 1)),
            -3.0,
            false,
        );
        tree.set_value_on(Coord::new(-5, -5, -5), 7.0);
        tree.set_value_off(Coord::new(-100, 3, 3), -7.0);

        let mut bytes = Vec::new();
        assert!(write_tree(&tree, &mut bytes).unwrap());
        let mut read = Tree::new(0.0f32);
        assert!(read_tree(&mut read, &mut bytes.as_slice()).unwrap());

        assert!(tree.has_same_topology(&read));
        assert_eq!(read.active_voxel_count(), tree.active_voxel_count());
        assert_eq!(read.get_value(Coord::new(5, 5, 5)), 3.0);
        assert!(read.is_value_on(Coord::new(5, 5, 5)));
        assert_eq!(read.get_value(Coord::new(dim + 1, 1, 1)), -3.0);
        assert!(!read.is_value_on(Coord::new(dim + 1, 1, 1)));
        assert_eq!(read.get_value(Coord::new(-5, -5, -5)), 7.0);
        assert_eq!(read.get_value(Coord::new(-100, 3, 3)), -7.0);
        assert!(!read.is_value_on(Coord::new(-100, 3, 3)));
    }

    #[test]
    fn test_truncated_stream_is_rejected() {
        let mut tree = Tree::new(5.0f32);
        tree.set_value_on(Coord::new(1, 2, 3), 1.0);
        let mut bytes = Vec::new();
        assert!(write_tree(&tree, &mut bytes).unwrap());

        let cut = bytes.len() / 2;
        let mut read = Tree::new(0.0f32);
        let err = read_tree(&mut read, &mut bytes[..cut].as_ref());
        assert!(err.is_err());
    }

    #[test]
    fn test_unaligned_origin_is_rejected() {
        // Hand-build a stream whose single tile origin is unaligned.
        use crate::core::ByteConversion;
        use byteorder::{BigEndian, WriteBytesExt};
        let mut bytes = Vec::new();
        5.0f32.write_as_be(&mut bytes).unwrap();
        bytes.write_u32::<BigEndian>(1).unwrap(); // one tile
        bytes.write_u32::<BigEndian>(0).unwrap();
        bytes.write_i32::<BigEndian>(17).unwrap(); // unaligned x
        bytes.write_i32::<BigEndian>(0).unwrap();
        bytes.write_i32::<BigEndian>(0).unwrap();
        1.0f32.write_as_be(&mut bytes).unwrap();
        bytes.write_u8(1).unwrap();

        let mut read = Tree::new(0.0f32);
        let err = read_tree(&mut read, &mut bytes.as_slice());
        assert_eq!(
            err.unwrap_err().kind(),
            std::io::ErrorKind::InvalidData
        );
    }
}
