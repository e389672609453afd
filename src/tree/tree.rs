use std::io::{Read, Write};

use crate::core::{Coord, CoordBBox, VoxelValue};

use super::{LeafNode, ReadAccessor, RootNode, ValueAccessor};

/// A sparse tree over the full signed 32-bit index space.
///
/// Four fixed levels: root, 32^3 and 16^3 internal nodes, 8^3 leaves.
/// Reads anywhere return the background unless a tile or voxel overrides
/// it; writes materialize only the path they touch. Spatially coherent
/// access should go through [`ValueAccessor`].
pub struct Tree<T: VoxelValue> {
    root: RootNode<T>,
}

pub type FloatTree = Tree<f32>;
pub type DoubleTree = Tree<f64>;
pub type Int32Tree = Tree<i32>;
pub type BoolTree = Tree<bool>;

impl<T: VoxelValue> Tree<T> {
    /// Number of levels, root included.
    pub const LEVEL_COUNT: u32 = RootNode::<T>::DEPTH + 1;

    pub fn new(background: T) -> Self {
        Self {
            root: RootNode::new(background),
        }
    }

    pub fn root(&self) -> &RootNode<T> {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut RootNode<T> {
        &mut self.root
    }

    pub fn background(&self) -> T {
        self.root.background()
    }

    /// A caching accessor with read and write access to this tree.
    pub fn accessor(&mut self) -> ValueAccessor<'_, T> {
        ValueAccessor::new(self)
    }

    /// A caching read-only accessor; any number may coexist.
    pub fn read_accessor(&self) -> ReadAccessor<'_, T> {
        ReadAccessor::new(self)
    }

    // ---- reads ------------------------------------------------------

    pub fn get_value(&self, xyz: Coord) -> T {
        self.root.get_value(xyz)
    }

    pub fn is_value_on(&self, xyz: Coord) -> bool {
        self.root.is_value_on(xyz)
    }

    pub fn probe_value(&self, xyz: Coord, value: &mut T) -> bool {
        self.root.probe_value(xyz, value)
    }

    pub fn value_depth(&self, xyz: Coord) -> i32 {
        self.root.value_depth(xyz)
    }

    pub fn probe_leaf(&mut self, xyz: Coord) -> Option<&mut LeafNode<T>> {
        self.root.probe_leaf(xyz)
    }

    pub fn probe_const_leaf(&self, xyz: Coord) -> Option<&LeafNode<T>> {
        self.root.probe_const_leaf(xyz)
    }

    pub fn touch_leaf(&mut self, xyz: Coord) -> &mut LeafNode<T> {
        self.root.touch_leaf(xyz)
    }

    // ---- writes -----------------------------------------------------

    pub fn set_value_on(&mut self, xyz: Coord, value: T) {
        self.root.set_value_on(xyz, value);
    }

    pub fn set_value_only(&mut self, xyz: Coord, value: T) {
        self.root.set_value_only(xyz, value);
    }

    pub fn set_value_off(&mut self, xyz: Coord, value: T) {
        self.root.set_value_off(xyz, value);
    }

    pub fn set_active_state(&mut self, xyz: Coord, on: bool) {
        self.root.set_active_state(xyz, on);
    }

    pub fn set_value_on_min(&mut self, xyz: Coord, value: T) {
        self.root.set_value_on_min(xyz, value);
    }

    pub fn set_value_on_max(&mut self, xyz: Coord, value: T) {
        self.root.set_value_on_max(xyz, value);
    }

    pub fn set_value_on_sum(&mut self, xyz: Coord, addend: T) {
        self.root.set_value_on_sum(xyz, addend);
    }

    pub fn fill(&mut self, bbox: &CoordBBox, value: T, active: bool) {
        self.root.fill(bbox, value, active);
    }

    // ---- maintenance ------------------------------------------------

    pub fn set_background(&mut self, background: T) {
        self.root.set_background(background);
    }

    pub fn erase_background_tiles(&mut self) -> usize {
        self.root.erase_background_tiles()
    }

    pub fn clear(&mut self) {
        self.root.clear();
    }

    pub fn prune(&mut self, tolerance: T) {
        self.root.prune(tolerance);
    }

    pub fn prune_inactive(&mut self) {
        let background = self.background();
        self.root.prune_inactive(background);
    }

    pub fn prune_inactive_with(&mut self, value: T) {
        self.root.prune_inactive(value);
    }

    pub fn prune_level_set(&mut self) {
        self.root.prune_level_set();
    }

    // ---- bulk algorithms --------------------------------------------

    pub fn signed_flood_fill(&mut self) {
        self.root.signed_flood_fill_default();
    }

    pub fn signed_flood_fill_with(&mut self, outside: T, inside: T) {
        self.root.signed_flood_fill(outside, inside);
    }

    pub fn voxelize_active_tiles(&mut self) {
        self.root.voxelize_active_tiles();
    }

    pub fn merge(&mut self, other: &mut Self) {
        self.root.merge(&mut other.root);
    }

    pub fn topology_union(&mut self, other: &Self) {
        self.root.topology_union(&other.root);
    }

    pub fn combine<F>(&mut self, other: &mut Self, op: &mut F, prune: bool)
    where
        F: FnMut(T, bool, T, bool) -> (T, bool),
    {
        self.root.combine(&mut other.root, op, prune);
    }

    pub fn combine2<F>(&mut self, a: &Self, b: &Self, op: &mut F, prune: bool)
    where
        F: FnMut(T, bool, T, bool) -> (T, bool),
    {
        self.root.combine2(&a.root, &b.root, op, prune);
    }

    pub fn has_same_topology(&self, other: &Self) -> bool {
        self.root.has_same_topology(&other.root)
    }

    // ---- counts and extents -----------------------------------------

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    pub fn leaf_count(&self) -> u64 {
        self.root.leaf_count()
    }

    pub fn active_voxel_count(&self) -> u64 {
        self.root.on_voxel_count()
    }

    pub fn has_active_tiles(&self) -> bool {
        self.root.has_active_tiles()
    }

    pub fn eval_active_bbox(&self) -> CoordBBox {
        let mut bbox = CoordBBox::empty();
        self.root.eval_active_bbox(&mut bbox);
        bbox
    }

    pub fn for_each_leaf_mut(&mut self, f: &mut dyn FnMut(&mut LeafNode<T>)) {
        self.root.for_each_leaf_mut(f);
    }

    // ---- topology and buffer streams --------------------------------

    /// Writes the topology stream; false means the tree was empty.
    pub fn write_topology<W: Write>(&self, writer: &mut W) -> std::io::Result<bool> {
        self.root.write_topology(writer)
    }

    /// Reads a topology stream over this tree; false means the stream
    /// held an empty tree (only its background was adopted).
    pub fn read_topology<R: Read>(&mut self, reader: &mut R) -> std::io::Result<bool> {
        self.root.read_topology(reader)
    }

    pub fn write_buffers<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        self.root.write_buffers(writer)
    }

    pub fn read_buffers<R: Read>(&mut self, reader: &mut R) -> std::io::Result<()> {
        self.root.read_buffers(reader)
    }

    /// Prints a per-level summary, for debugging.
    pub fn dump(&self) {
        println!("=== Tree Dump ===");
        println!("background: {}", self.background());
        println!("root entries: {} children, {} tiles ({} active)",
            self.root.child_count(),
            self.root.tile_count(),
            self.root.active_tile_count(),
        );
        println!("leaves: {}", self.leaf_count());
        println!("active voxels: {}", self.active_voxel_count());
        println!("=== End of Tree Dump ===");
    }
}

#[cfg(test)]
mod tests {
    use glam::IVec3;

    use super::*;

    /// Rasterizes the narrow band of a sphere: voxels within `half_width`
    /// of the surface carry signed distances and are active.
    fn rasterize_sphere_band(tree: &mut Tree<f32>, center: IVec3, radius: i32, half_width: i32) {
        let r = radius + half_width;
        for x in center.x - r..=center.x + r {
            for y in center.y - r..=center.y + r {
                for z in center.z - r..=center.z + r {
                    let d = IVec3::new(x, y, z) - center;
                    let dist = (d.as_vec3()).length() - radius as f32;
                    if dist.abs() <= half_width as f32 {
                        tree.set_value_on(Coord::new(x, y, z), dist);
                    }
                }
            }
        }
    }

    #[test]
    fn test_signed_flood_fill_sphere() {
        let mut tree = Tree::new(2.0f32);
        let center = IVec3::new(30, 30, 30);
        rasterize_sphere_band(&mut tree, center, 20, 2);

        let band_voxel = Coord::new(30, 30, 50);
        let band_value = tree.get_value(band_voxel);
        assert!(tree.is_value_on(band_voxel));

        // Before the fill the inactive interior reads +background.
        let c = Coord::new(30, 30, 30);
        assert_eq!(tree.get_value(c), 2.0);

        tree.signed_flood_fill();

        // The band is untouched; the interior flipped to -background and
        // stays inactive.
        assert_eq!(tree.get_value(band_voxel), band_value);
        assert!(tree.is_value_on(band_voxel));
        assert_eq!(tree.get_value(c), -2.0);
        assert!(!tree.is_value_on(c));
        assert_eq!(tree.get_value(Coord::new(35, 28, 33)), -2.0);
        // Outside stays positive.
        assert_eq!(tree.get_value(Coord::new(30, 30, 100)), 2.0);
        assert_eq!(tree.get_value(Coord::new(-50, 30, 30)), 2.0);
        assert_eq!(tree.background(), 2.0);
    }

    #[test]
    fn test_empty_tree() {
        let tree = Tree::new(5.0f32);
        assert_eq!(tree.get_value(Coord::new(5, 10, 20)), 5.0);
        assert_eq!(tree.active_voxel_count(), 0);
        assert_eq!(tree.leaf_count(), 0);
        assert_eq!(tree.value_depth(Coord::ZERO), -1);
        assert!(tree.is_empty());
    }

    #[test]
    fn test_read_after_write() {
        let mut tree = Tree::new(5.0f32);
        tree.set_value_on(Coord::new(5, 10, 20), 10.0);
        assert_eq!(tree.get_value(Coord::new(5, 10, 20)), 10.0);
        assert!(tree.is_value_on(Coord::new(5, 10, 20)));
        assert_eq!(tree.value_depth(Coord::new(5, 10, 20)), 3);
        assert_eq!(tree.active_voxel_count(), 1);
    }

    #[test]
    fn test_fill_prune_scenario() {
        let mut tree = Tree::new(0.0f32);
        tree.fill(&CoordBBox::new(Coord::ZERO, Coord::splat(15)), 1.0, true);
        assert_eq!(tree.active_voxel_count(), 4096);
        tree.prune(0.0);
        assert_eq!(tree.active_voxel_count(), 4096);
        assert_eq!(tree.leaf_count(), 0);
    }

    #[test]
    fn test_prune_is_idempotent() {
        let mut tree = Tree::new(0.0f32);
        tree.fill(&CoordBBox::new(Coord::ZERO, Coord::splat(31)), 1.0, true);
        tree.set_value_on(Coord::new(40, 0, 0), 2.0);
        tree.prune(0.0);
        let count = tree.active_voxel_count();
        let leaves = tree.leaf_count();
        let bbox = tree.eval_active_bbox();
        tree.prune(0.0);
        assert_eq!(tree.active_voxel_count(), count);
        assert_eq!(tree.leaf_count(), leaves);
        assert_eq!(tree.eval_active_bbox(), bbox);
    }

    #[test]
    fn test_prune_inactive() {
        let mut tree = Tree::new(0.0f32);
        tree.fill(&CoordBBox::new(Coord::ZERO, Coord::splat(7)), 3.0, false);
        assert_eq!(tree.leaf_count(), 0);
        tree.set_value_off(Coord::new(64, 0, 0), 4.0);
        tree.prune_inactive();
        assert_eq!(tree.leaf_count(), 0);
        assert_eq!(tree.active_voxel_count(), 0);
        // Everything inactive collapsed to background tiles and vanished.
        assert!(tree.is_empty());
        assert_eq!(tree.get_value(Coord::new(3, 3, 3)), 0.0);
    }

    #[test]
    fn test_eval_active_bbox() {
        let mut tree = Tree::new(0.0f32);
        tree.set_value_on(Coord::new(-5, 2, 9), 1.0);
        tree.set_value_on(Coord::new(100, -40, 3), 1.0);
        let bbox = tree.eval_active_bbox();
        assert_eq!(bbox.min, Coord::new(-5, -40, 3));
        assert_eq!(bbox.max, Coord::new(100, 2, 9));
    }

    #[test]
    fn test_random_read_after_write() {
        use rand::Rng;

        let mut rng = rand::rng();
        let mut tree = Tree::new(0.0f32);
        let mut written = Vec::new();
        for _ in 0..1000 {
            let p = Coord::new(
                rng.random_range(-10000..10000),
                rng.random_range(-10000..10000),
                rng.random_range(-10000..10000),
            );
            let v = rng.random_range(1..1000) as f32;
            tree.set_value_on(p, v);
            written.push((p, v));
        }
        // Later writes may overwrite earlier ones; check in reverse.
        let mut seen = std::collections::HashSet::new();
        for &(p, v) in written.iter().rev() {
            if seen.insert(p) {
                assert_eq!(tree.get_value(p), v);
                assert!(tree.is_value_on(p));
            }
        }
        assert_eq!(tree.active_voxel_count(), seen.len() as u64);
    }

    #[test]
    fn test_value_accessor_equivalence() {
        let mut tree = Tree::new(0.0f32);
        let points = [
            Coord::new(0, 0, 0),
            Coord::new(7, 7, 7),
            Coord::new(8, 0, 0),
            Coord::new(127, 127, 127),
            Coord::new(128, 0, 0),
            Coord::new(-1, -1, -1),
            Coord::new(5000, -3000, 20000),
        ];
        for (i, &p) in points.iter().enumerate() {
            tree.set_value_on(p, i as f32);
        }
        let expected: Vec<(f32, bool)> = points
            .iter()
            .map(|&p| (tree.get_value(p), tree.is_value_on(p)))
            .collect();
        let mut acc = tree.accessor();
        for (&p, &(v, on)) in points.iter().zip(expected.iter()) {
            assert_eq!(acc.get_value(p), v);
            assert_eq!(acc.is_value_on(p), on);
        }
        // Off-path coordinates agree as well.
        assert_eq!(acc.get_value(Coord::new(9999, 9999, 9999)), 0.0);
    }
}
