use std::cell::Cell;
use std::ptr::NonNull;

use crate::core::{Coord, VoxelValue};

use super::root::RootEntry;
use super::{Internal1, Internal2, LeafNode, Tree, TreeNode};

/// Caching accessor with read and write access to a tree.
///
/// The accessor remembers the nodes along the last accessed path and
/// restarts descent from the deepest cached node still containing the
/// queried coordinate, so spatially coherent access streams skip the root
/// table lookup almost always.
///
/// Holding the accessor exclusively borrows the tree: no other code can
/// delete or restructure nodes while cached pointers exist. The accessor's
/// own writes only ever refine tiles into freshly boxed children, which
/// never moves or frees a cached node.
pub struct ValueAccessor<'t, T: VoxelValue> {
    tree: &'t mut Tree<T>,
    key2: Coord,
    node2: Option<NonNull<Internal2<T>>>,
    key1: Coord,
    node1: Option<NonNull<Internal1<T>>>,
    key0: Coord,
    leaf: Option<NonNull<LeafNode<T>>>,
}

impl<'t, T: VoxelValue> ValueAccessor<'t, T> {
    pub fn new(tree: &'t mut Tree<T>) -> Self {
        Self {
            tree,
            key2: Coord::MAX,
            node2: None,
            key1: Coord::MAX,
            node1: None,
            key0: Coord::MAX,
            leaf: None,
        }
    }

    /// Drops every cached node; the next access descends from the root.
    pub fn clear_cache(&mut self) {
        self.node2 = None;
        self.node1 = None;
        self.leaf = None;
    }

    #[inline(always)]
    fn leaf_key(xyz: Coord) -> Coord {
        xyz.align_down(LeafNode::<T>::DIM)
    }

    #[inline(always)]
    fn node1_key(xyz: Coord) -> Coord {
        xyz.align_down(Internal1::<T>::DIM)
    }

    #[inline(always)]
    fn node2_key(xyz: Coord) -> Coord {
        xyz.align_down(Internal2::<T>::DIM)
    }

    #[inline]
    fn cached_leaf_mut(&mut self, xyz: Coord) -> Option<&mut LeafNode<T>> {
        if self.key0 == Self::leaf_key(xyz) {
            // Safety: the pointer was cached from a live node of the
            // exclusively borrowed tree, and nothing can have removed it.
            self.leaf.map(|mut p| unsafe { p.as_mut() })
        } else {
            None
        }
    }

    #[inline]
    fn cached_node1_mut(&mut self, xyz: Coord) -> Option<&mut Internal1<T>> {
        if self.key1 == Self::node1_key(xyz) {
            self.node1.map(|mut p| unsafe { p.as_mut() })
        } else {
            None
        }
    }

    #[inline]
    fn cached_node2_mut(&mut self, xyz: Coord) -> Option<&mut Internal2<T>> {
        if self.key2 == Self::node2_key(xyz) {
            self.node2.map(|mut p| unsafe { p.as_mut() })
        } else {
            None
        }
    }

    /// Descends to `xyz` from the deepest valid cached node, refreshing
    /// the cache on the way down. Returns the value and active state.
    fn cache_path(&mut self, xyz: Coord) -> (T, bool) {
        if self.key1 == Self::node1_key(xyz) && self.node1.is_some() {
            let node1 = self.node1.expect("checked above");
            return self.descend_node1(node1, xyz);
        }
        if self.key2 == Self::node2_key(xyz) && self.node2.is_some() {
            let node2 = self.node2.expect("checked above");
            return self.descend_node2(node2, xyz);
        }
        let key2 = Self::node2_key(xyz);
        let background = self.tree.background();
        match self.tree.root_mut().find_entry_mut(key2) {
            None => {
                self.clear_cache();
                (background, false)
            }
            Some(RootEntry::Tile(t)) => {
                let tile = *t;
                self.clear_cache();
                (tile.value, tile.active)
            }
            Some(RootEntry::Child(c)) => {
                let node2 = NonNull::from(&mut **c);
                self.key2 = key2;
                self.node2 = Some(node2);
                self.descend_node2(node2, xyz)
            }
        }
    }

    fn descend_node2(&mut self, mut node2: NonNull<Internal2<T>>, xyz: Coord) -> (T, bool) {
        let n = Internal2::<T>::coord_to_offset(xyz);
        // Safety: cached pointers target boxed nodes of the exclusively
        // borrowed tree; boxes do not move when the map rebalances.
        let node = unsafe { node2.as_mut() };
        match node.child_mut(n) {
            None => {
                let tile = node.tile_at(n);
                self.node1 = None;
                self.leaf = None;
                (tile.value, tile.active)
            }
            Some(child) => {
                let node1 = NonNull::from(child);
                self.key1 = Self::node1_key(xyz);
                self.node1 = Some(node1);
                self.descend_node1(node1, xyz)
            }
        }
    }

    fn descend_node1(&mut self, mut node1: NonNull<Internal1<T>>, xyz: Coord) -> (T, bool) {
        let n = Internal1::<T>::coord_to_offset(xyz);
        let node = unsafe { node1.as_mut() };
        match node.child_mut(n) {
            None => {
                let tile = node.tile_at(n);
                self.leaf = None;
                (tile.value, tile.active)
            }
            Some(leaf) => {
                self.key0 = Self::leaf_key(xyz);
                self.leaf = Some(NonNull::from(&mut *leaf));
                let i = LeafNode::<T>::coord_to_offset(xyz);
                (leaf.value(i), leaf.is_on(i))
            }
        }
    }

    /// Runs a point mutation starting from the deepest valid cached node,
    /// then refreshes the cache along the new path.
    fn write_through<F1, F2, FR>(&mut self, xyz: Coord, on_node1: F1, on_node2: F2, on_root: FR)
    where
        F1: FnOnce(&mut Internal1<T>),
        F2: FnOnce(&mut Internal2<T>),
        FR: FnOnce(&mut Tree<T>),
    {
        if let Some(node) = self.cached_node1_mut(xyz) {
            on_node1(node);
        } else if let Some(node) = self.cached_node2_mut(xyz) {
            on_node2(node);
        } else {
            on_root(self.tree);
        }
        self.cache_path(xyz);
    }

    // ---- reads ------------------------------------------------------

    pub fn get_value(&mut self, xyz: Coord) -> T {
        if let Some(leaf) = self.cached_leaf_mut(xyz) {
            return leaf.value(LeafNode::<T>::coord_to_offset(xyz));
        }
        self.cache_path(xyz).0
    }

    pub fn is_value_on(&mut self, xyz: Coord) -> bool {
        if let Some(leaf) = self.cached_leaf_mut(xyz) {
            return leaf.is_on(LeafNode::<T>::coord_to_offset(xyz));
        }
        self.cache_path(xyz).1
    }

    pub fn probe_value(&mut self, xyz: Coord, value: &mut T) -> bool {
        if let Some(leaf) = self.cached_leaf_mut(xyz) {
            let i = LeafNode::<T>::coord_to_offset(xyz);
            *value = leaf.value(i);
            return leaf.is_on(i);
        }
        let (v, on) = self.cache_path(xyz);
        *value = v;
        on
    }

    // ---- writes -----------------------------------------------------

    pub fn set_value(&mut self, xyz: Coord, value: T) {
        self.set_value_on(xyz, value);
    }

    pub fn set_value_on(&mut self, xyz: Coord, value: T) {
        if let Some(leaf) = self.cached_leaf_mut(xyz) {
            leaf.set_on(LeafNode::<T>::coord_to_offset(xyz), value);
            return;
        }
        self.write_through(
            xyz,
            |n| TreeNode::set_value_on(n, xyz, value),
            |n| TreeNode::set_value_on(n, xyz, value),
            |t| t.set_value_on(xyz, value),
        );
    }

    pub fn set_value_only(&mut self, xyz: Coord, value: T) {
        if let Some(leaf) = self.cached_leaf_mut(xyz) {
            leaf.set_value(LeafNode::<T>::coord_to_offset(xyz), value);
            return;
        }
        self.write_through(
            xyz,
            |n| TreeNode::set_value_only(n, xyz, value),
            |n| TreeNode::set_value_only(n, xyz, value),
            |t| t.set_value_only(xyz, value),
        );
    }

    pub fn set_value_off(&mut self, xyz: Coord, value: T) {
        if let Some(leaf) = self.cached_leaf_mut(xyz) {
            leaf.set_off(LeafNode::<T>::coord_to_offset(xyz), value);
            return;
        }
        self.write_through(
            xyz,
            |n| TreeNode::set_value_off(n, xyz, value),
            |n| TreeNode::set_value_off(n, xyz, value),
            |t| t.set_value_off(xyz, value),
        );
    }

    pub fn set_active_state(&mut self, xyz: Coord, on: bool) {
        if let Some(leaf) = self.cached_leaf_mut(xyz) {
            leaf.set_active(LeafNode::<T>::coord_to_offset(xyz), on);
            return;
        }
        self.write_through(
            xyz,
            |n| TreeNode::set_active_state(n, xyz, on),
            |n| TreeNode::set_active_state(n, xyz, on),
            |t| t.set_active_state(xyz, on),
        );
    }

    // ---- leaves -----------------------------------------------------

    pub fn touch_leaf(&mut self, xyz: Coord) -> &mut LeafNode<T> {
        if self.key0 != Self::leaf_key(xyz) || self.leaf.is_none() {
            if let Some(node) = self.cached_node1_mut(xyz) {
                TreeNode::touch_leaf(node, xyz);
            } else if let Some(node) = self.cached_node2_mut(xyz) {
                TreeNode::touch_leaf(node, xyz);
            } else {
                self.tree.touch_leaf(xyz);
            }
            self.cache_path(xyz);
        }
        let mut leaf = self.leaf.expect("touch_leaf always caches the leaf");
        unsafe { leaf.as_mut() }
    }

    pub fn probe_leaf(&mut self, xyz: Coord) -> Option<&mut LeafNode<T>> {
        if self.key0 != Self::leaf_key(xyz) || self.leaf.is_none() {
            self.cache_path(xyz);
        }
        if self.key0 == Self::leaf_key(xyz) {
            self.leaf.map(|mut p| unsafe { p.as_mut() })
        } else {
            None
        }
    }

    pub fn tree(&self) -> &Tree<T> {
        self.tree
    }
}

/// Caching read-only accessor over a shared tree. Any number may coexist;
/// each owns its cache (interior mutability, no synchronization), so one
/// accessor must not be shared across threads while in use.
pub struct ReadAccessor<'t, T: VoxelValue> {
    tree: &'t Tree<T>,
    key2: Cell<Coord>,
    node2: Cell<Option<NonNull<Internal2<T>>>>,
    key1: Cell<Coord>,
    node1: Cell<Option<NonNull<Internal1<T>>>>,
    key0: Cell<Coord>,
    leaf: Cell<Option<NonNull<LeafNode<T>>>>,
}

impl<'t, T: VoxelValue> ReadAccessor<'t, T> {
    pub fn new(tree: &'t Tree<T>) -> Self {
        Self {
            tree,
            key2: Cell::new(Coord::MAX),
            node2: Cell::new(None),
            key1: Cell::new(Coord::MAX),
            node1: Cell::new(None),
            key0: Cell::new(Coord::MAX),
            leaf: Cell::new(None),
        }
    }

    pub fn clear_cache(&self) {
        self.node2.set(None);
        self.node1.set(None);
        self.leaf.set(None);
    }

    fn probe(&self, xyz: Coord) -> (T, bool) {
        if self.key0.get() == xyz.align_down(LeafNode::<T>::DIM) {
            if let Some(leaf) = self.leaf.get() {
                // Safety: the cache only ever holds nodes of `self.tree`,
                // which is borrowed shared for the accessor's lifetime.
                let leaf = unsafe { leaf.as_ref() };
                let i = LeafNode::<T>::coord_to_offset(xyz);
                return (leaf.value(i), leaf.is_on(i));
            }
        }
        if self.key1.get() == xyz.align_down(Internal1::<T>::DIM) {
            if let Some(node1) = self.node1.get() {
                return self.descend_node1(unsafe { node1.as_ref() }, xyz);
            }
        }
        if self.key2.get() == xyz.align_down(Internal2::<T>::DIM) {
            if let Some(node2) = self.node2.get() {
                return self.descend_node2(unsafe { node2.as_ref() }, xyz);
            }
        }
        let key2 = xyz.align_down(Internal2::<T>::DIM);
        match self.tree.root().find_entry(key2) {
            None => {
                self.clear_cache();
                (self.tree.background(), false)
            }
            Some(RootEntry::Tile(t)) => {
                self.clear_cache();
                (t.value, t.active)
            }
            Some(RootEntry::Child(c)) => {
                self.key2.set(key2);
                self.node2.set(Some(NonNull::from(&**c)));
                self.descend_node2(c, xyz)
            }
        }
    }

    fn descend_node2(&self, node: &Internal2<T>, xyz: Coord) -> (T, bool) {
        let n = Internal2::<T>::coord_to_offset(xyz);
        match node.child(n) {
            None => {
                let tile = node.tile_at(n);
                self.node1.set(None);
                self.leaf.set(None);
                (tile.value, tile.active)
            }
            Some(child) => {
                self.key1.set(xyz.align_down(Internal1::<T>::DIM));
                self.node1.set(Some(NonNull::from(child)));
                self.descend_node1(child, xyz)
            }
        }
    }

    fn descend_node1(&self, node: &Internal1<T>, xyz: Coord) -> (T, bool) {
        let n = Internal1::<T>::coord_to_offset(xyz);
        match node.child(n) {
            None => {
                let tile = node.tile_at(n);
                self.leaf.set(None);
                (tile.value, tile.active)
            }
            Some(leaf) => {
                self.key0.set(xyz.align_down(LeafNode::<T>::DIM));
                self.leaf.set(Some(NonNull::from(leaf)));
                let i = LeafNode::<T>::coord_to_offset(xyz);
                (leaf.value(i), leaf.is_on(i))
            }
        }
    }

    pub fn get_value(&self, xyz: Coord) -> T {
        self.probe(xyz).0
    }

    pub fn is_value_on(&self, xyz: Coord) -> bool {
        self.probe(xyz).1
    }

    pub fn probe_value(&self, xyz: Coord, value: &mut T) -> bool {
        let (v, on) = self.probe(xyz);
        *value = v;
        on
    }

    pub fn probe_const_leaf(&self, xyz: Coord) -> Option<&'t LeafNode<T>> {
        self.tree.probe_const_leaf(xyz)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CoordBBox;

    #[test]
    fn test_accessor_reads_match_tree() {
        let mut tree = Tree::new(1.5f32);
        tree.set_value_on(Coord::new(1, 2, 3), 4.0);
        tree.fill(
            &CoordBBox::new(Coord::new(64, 0, 0), Coord::new(127, 63, 63)),
            -2.0,
            true,
        );
        tree.set_value_off(Coord::new(-100, -100, -100), 9.0);

        let probes = [
            Coord::new(1, 2, 3),
            Coord::new(1, 2, 4),
            Coord::new(100, 10, 10),
            Coord::new(-100, -100, -100),
            Coord::new(0, 0, 4096),
        ];
        let mut acc = tree.accessor();
        for &p in probes.iter() {
            let direct_value = acc.tree().get_value(p);
            let direct_on = acc.tree().is_value_on(p);
            assert_eq!(acc.get_value(p), direct_value, "value at {p}");
            assert_eq!(acc.is_value_on(p), direct_on, "state at {p}");
            // Ask twice; the cached answer must agree.
            assert_eq!(acc.get_value(p), direct_value);
        }
    }

    #[test]
    fn test_accessor_write_then_read() {
        let mut tree = Tree::new(0.0f32);
        let mut acc = tree.accessor();
        for z in 0..32 {
            acc.set_value(Coord::new(0, 0, z), z as f32);
        }
        for z in 0..32 {
            assert_eq!(acc.get_value(Coord::new(0, 0, z)), z as f32);
        }
        drop(acc);
        assert_eq!(tree.active_voxel_count(), 32);
        assert_eq!(tree.get_value(Coord::new(0, 0, 17)), 17.0);
    }

    #[test]
    fn test_accessor_touch_and_probe_leaf() {
        let mut tree = Tree::new(0.0f32);
        let mut acc = tree.accessor();
        assert!(acc.probe_leaf(Coord::new(3, 3, 3)).is_none());
        acc.touch_leaf(Coord::new(3, 3, 3));
        assert!(acc.probe_leaf(Coord::new(3, 3, 3)).is_some());
        drop(acc);
        assert_eq!(tree.leaf_count(), 1);
        assert_eq!(tree.active_voxel_count(), 0);
    }

    #[test]
    fn test_accessor_set_value_off_and_active_state() {
        let mut tree = Tree::new(0.0f32);
        let mut acc = tree.accessor();
        acc.set_value_on(Coord::new(5, 5, 5), 2.0);
        acc.set_active_state(Coord::new(5, 5, 5), false);
        assert!(!acc.is_value_on(Coord::new(5, 5, 5)));
        assert_eq!(acc.get_value(Coord::new(5, 5, 5)), 2.0);
        acc.set_value_off(Coord::new(5, 5, 6), 7.0);
        assert_eq!(acc.get_value(Coord::new(5, 5, 6)), 7.0);
        assert!(!acc.is_value_on(Coord::new(5, 5, 6)));
        acc.set_value_only(Coord::new(5, 5, 5), 3.0);
        assert_eq!(acc.get_value(Coord::new(5, 5, 5)), 3.0);
        assert!(!acc.is_value_on(Coord::new(5, 5, 5)));
    }

    #[test]
    fn test_read_accessors_coexist() {
        let mut tree = Tree::new(0.0f32);
        tree.set_value_on(Coord::new(9, 9, 9), 1.0);
        let a = tree.read_accessor();
        let b = tree.read_accessor();
        assert_eq!(a.get_value(Coord::new(9, 9, 9)), 1.0);
        assert_eq!(b.get_value(Coord::new(9, 9, 9)), 1.0);
        assert!(a.is_value_on(Coord::new(9, 9, 9)));
        assert_eq!(a.get_value(Coord::new(9, 9, 10)), 0.0);
    }
}
