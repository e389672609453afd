use std::ptr::NonNull;

use rayon::prelude::*;
use rustc_hash::FxHashMap;

use crate::core::{Coord, VoxelValue};

use super::{LeafNode, Tree, TreeNode};

/// Flat index of every leaf in a tree, with optional per-leaf shadow
/// buffers for race-free parallel writes.
///
/// The manager walks the tree once and stores a pointer per leaf in
/// deterministic (root key, then slot) order. While it lives, it holds the
/// tree's exclusive borrow, so the leaf set cannot change under it except
/// through the manager itself; after a structural change made elsewhere,
/// construct a new manager or call [`rebuild_leaf_array`].
///
/// Buffer index 0 is the live leaf buffer; 1..=K are shadows. A worker pool
/// may mutate distinct shadow buffers (or distinct leaves) concurrently;
/// the coordinator then promotes a shadow generation with
/// [`swap_leaf_buffer`].
///
/// [`rebuild_leaf_array`]: LeafManager::rebuild_leaf_array
/// [`swap_leaf_buffer`]: LeafManager::swap_leaf_buffer
pub struct LeafManager<'t, T: VoxelValue> {
    tree: &'t mut Tree<T>,
    leaves: Vec<NonNull<LeafNode<T>>>,
    origin_index: FxHashMap<Coord, usize>,
    aux: Vec<Box<[T]>>,
    aux_per_leaf: usize,
}

// Safety: the pointer array refers to distinct boxed leaves of the
// exclusively borrowed tree; parallel access hands each worker a disjoint
// leaf.
unsafe impl<T: VoxelValue + Send> Send for LeafManager<'_, T> {}
unsafe impl<T: VoxelValue + Sync> Sync for LeafManager<'_, T> {}

impl<'t, T: VoxelValue> LeafManager<'t, T> {
    pub fn new(tree: &'t mut Tree<T>, aux_buffers_per_leaf: usize) -> Self {
        let mut manager = Self {
            tree,
            leaves: Vec::new(),
            origin_index: FxHashMap::default(),
            aux: Vec::new(),
            aux_per_leaf: 0,
        };
        manager.rebuild_leaf_array();
        manager.rebuild_aux_buffers(aux_buffers_per_leaf);
        manager
    }

    /// Re-walks the tree and rebuilds the flat leaf index. Any existing
    /// shadow buffers are rebuilt to match the new leaf set.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, name = "leaf_manager::rebuild"))]
    pub fn rebuild_leaf_array(&mut self) {
        self.leaves.clear();
        self.origin_index.clear();
        let leaves = &mut self.leaves;
        self.tree.for_each_leaf_mut(&mut |leaf| {
            leaves.push(NonNull::from(leaf));
        });
        for (i, leaf) in self.leaves.iter().enumerate() {
            let origin = unsafe { leaf.as_ref() }.origin();
            self.origin_index.insert(origin, i);
        }
        if self.aux_per_leaf > 0 {
            self.rebuild_aux_buffers(self.aux_per_leaf);
        }
    }

    /// (Re)allocates `count` shadow buffers per leaf, each initialized by
    /// copying the live buffer.
    pub fn rebuild_aux_buffers(&mut self, count: usize) {
        self.aux_per_leaf = count;
        self.aux.clear();
        self.aux.reserve(count * self.leaves.len());
        for leaf in self.leaves.iter() {
            let live = unsafe { leaf.as_ref() }.buffer();
            for _ in 0..count {
                self.aux.push(live.to_vec().into_boxed_slice());
            }
        }
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    pub fn aux_buffer_count(&self) -> usize {
        self.aux_per_leaf
    }

    pub fn leaf(&self, i: usize) -> &LeafNode<T> {
        unsafe { self.leaves[i].as_ref() }
    }

    pub fn leaf_mut(&mut self, i: usize) -> &mut LeafNode<T> {
        unsafe { self.leaves[i].as_mut() }
    }

    /// Index of the leaf with the given origin, if any.
    pub fn leaf_index_of(&self, origin: Coord) -> Option<usize> {
        self.origin_index.get(&origin).copied()
    }

    /// Buffer `b` of leaf `i`: 0 is the live buffer, 1..=K the shadows.
    pub fn get_buffer(&mut self, i: usize, b: usize) -> &mut [T] {
        assert!(b <= self.aux_per_leaf, "buffer index {b} out of range");
        if b == 0 {
            unsafe { self.leaves[i].as_mut() }.buffer_mut()
        } else {
            &mut self.aux[i * self.aux_per_leaf + (b - 1)]
        }
    }

    /// Swaps the live buffer of every leaf with its shadow `k` (1-based).
    pub fn swap_leaf_buffer(&mut self, k: usize) {
        assert!(k >= 1 && k <= self.aux_per_leaf, "no aux buffer {k}");
        for i in 0..self.leaves.len() {
            let aux = &mut self.aux[i * self.aux_per_leaf + (k - 1)];
            unsafe { self.leaves[i].as_mut() }.swap_buffer(aux);
        }
    }

    /// Copies every live buffer into its shadow `k` (1-based).
    pub fn sync_aux_buffer(&mut self, k: usize) {
        assert!(k >= 1 && k <= self.aux_per_leaf, "no aux buffer {k}");
        for i in 0..self.leaves.len() {
            let live = unsafe { self.leaves[i].as_ref() }.buffer();
            let aux = &mut self.aux[i * self.aux_per_leaf + (k - 1)];
            aux.copy_from_slice(live);
        }
    }

    /// Synchronizes every shadow buffer with its live buffer.
    pub fn sync_all_buffers(&mut self) {
        for k in 1..=self.aux_per_leaf {
            self.sync_aux_buffer(k);
        }
    }

    /// Applies `f` to every leaf sequentially.
    pub fn foreach<F>(&mut self, mut f: F)
    where
        F: FnMut(usize, &mut LeafNode<T>),
    {
        for i in 0..self.leaves.len() {
            let mut p = self.leaves[i];
            f(i, unsafe { p.as_mut() });
        }
    }

    /// Applies `f` to every leaf in parallel over the pool's threads. Each
    /// invocation owns its leaf exclusively.
    pub fn foreach_par<F>(&mut self, f: F)
    where
        F: Fn(usize, &mut LeafNode<T>) + Send + Sync,
        T: Send + Sync,
    {
        let leaves = SharedLeaves(&self.leaves);
        (0..self.leaves.len()).into_par_iter().for_each(|i| {
            // Safety: indices are distinct, so each closure call gets a
            // unique leaf; the manager holds the tree's exclusive borrow.
            let mut p = leaves.get(i);
            f(i, unsafe { p.as_mut() });
        });
    }

    pub fn tree(&self) -> &Tree<T> {
        &*self.tree
    }

    pub fn tree_mut(&mut self) -> &mut Tree<T> {
        self.tree
    }
}

struct SharedLeaves<'a, T>(&'a [NonNull<LeafNode<T>>]);

impl<T> SharedLeaves<'_, T> {
    fn get(&self, i: usize) -> NonNull<LeafNode<T>> {
        self.0[i]
    }
}

unsafe impl<T: Send> Send for SharedLeaves<'_, T> {}
unsafe impl<T: Sync> Sync for SharedLeaves<'_, T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CoordBBox;

    fn three_leaf_tree() -> Tree<f32> {
        let mut tree = Tree::new(0.0f32);
        tree.set_value_on(Coord::new(0, 0, 0), 1.0);
        tree.set_value_on(Coord::new(10, 0, 0), 2.0);
        tree.set_value_on(Coord::new(0, 200, 0), 3.0);
        tree
    }

    #[test]
    fn test_leaf_count_identity() {
        let mut tree = three_leaf_tree();
        let by_walk = tree.leaf_count();
        let manager = LeafManager::new(&mut tree, 0);
        assert_eq!(manager.leaf_count() as u64, by_walk);
        assert_eq!(manager.leaf_count(), 3);
    }

    #[test]
    fn test_origin_lookup() {
        let mut tree = three_leaf_tree();
        let manager = LeafManager::new(&mut tree, 0);
        let i = manager.leaf_index_of(Coord::new(8, 0, 0)).unwrap();
        assert_eq!(manager.leaf(i).origin(), Coord::new(8, 0, 0));
        assert!(manager.leaf_index_of(Coord::new(16, 0, 0)).is_none());
    }

    #[test]
    fn test_aux_swap_and_sync() {
        let mut tree = three_leaf_tree();
        let mut manager = LeafManager::new(&mut tree, 2);
        let i = manager.leaf_index_of(Coord::new(0, 0, 0)).unwrap();
        let off = LeafNode::<f32>::coord_to_offset(Coord::new(0, 0, 0));

        // Shadows start as copies of the live buffer.
        assert_eq!(manager.get_buffer(i, 1)[off], 1.0);

        // Write into shadow 1, then promote it.
        manager.get_buffer(i, 1)[off] = 42.0;
        manager.swap_leaf_buffer(1);
        drop(manager);
        assert_eq!(tree.get_value(Coord::new(0, 0, 0)), 42.0);

        // The old live buffer is now shadow 1; sync overwrites it again.
        let mut manager = LeafManager::new(&mut tree, 1);
        let i = manager.leaf_index_of(Coord::new(0, 0, 0)).unwrap();
        manager.get_buffer(i, 1)[off] = 7.0;
        manager.sync_aux_buffer(1);
        assert_eq!(manager.get_buffer(i, 1)[off], 42.0);
    }

    #[test]
    fn test_parallel_foreach_disjoint_writes() {
        let mut tree = three_leaf_tree();
        let mut manager = LeafManager::new(&mut tree, 0);
        manager.foreach_par(|i, leaf| {
            let marker = (i + 1) as f32 * 100.0;
            leaf.set_on(0, marker);
        });
        let mut seen = Vec::new();
        manager.foreach(|_, leaf| seen.push(leaf.value(0)));
        seen.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(seen, vec![100.0, 200.0, 300.0]);
    }

    #[test]
    fn test_rebuild_after_structural_change() {
        let mut tree = three_leaf_tree();
        let mut manager = LeafManager::new(&mut tree, 0);
        assert_eq!(manager.leaf_count(), 3);
        manager.tree_mut().set_value_on(Coord::new(-50, -50, -50), 4.0);
        manager.rebuild_leaf_array();
        assert_eq!(manager.leaf_count(), 4);
        // Fill an 8^3 region inactive and prune it away.
        manager
            .tree_mut()
            .fill(&CoordBBox::new(Coord::ZERO, Coord::splat(7)), 0.0, false);
        manager.tree_mut().prune(0.0);
        manager.rebuild_leaf_array();
        assert_eq!(manager.leaf_count(), 3);
    }
}
