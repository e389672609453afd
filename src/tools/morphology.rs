use std::ptr::NonNull;

use crate::core::{Coord, VoxelValue};
use crate::tree::{LeafManager, LeafMask, LeafNode, Tree, TreeNode};

const DIM: i32 = 8;
const LOG2DIM: usize = 3;

/// Offsets of the six face neighbors, in the slot order used by the
/// per-leaf neighbor cache.
const NEIGHBORS: [(i32, i32, i32); 6] = [
    (-1, 0, 0),
    (1, 0, 0),
    (0, -1, 0),
    (0, 1, 0),
    (0, 0, -1),
    (0, 0, 1),
];

/// Topologically dilates the active voxels of the leaf level by `count`
/// steps along ±x, ±y and ±z. Values are never modified, only active
/// states; active tiles are left alone.
pub fn dilate_voxels<T: VoxelValue>(tree: &mut Tree<T>, count: usize) {
    let mut manager = LeafManager::new(tree, 0);
    dilate_voxels_with(&mut manager, count);
}

/// As [`dilate_voxels`], reusing a caller-owned leaf manager. The manager's
/// leaf array is rebuilt after each pass to pick up newly allocated leaves.
pub fn dilate_voxels_with<T: VoxelValue>(manager: &mut LeafManager<'_, T>, count: usize) {
    for _ in 0..count {
        Morphology::new(manager).dilate();
        manager.rebuild_leaf_array();
    }
}

/// Topologically erodes the active voxels of the leaf level by `count`
/// steps, then collapses emptied leaves via `prune_level_set`.
pub fn erode_voxels<T: VoxelValue>(tree: &mut Tree<T>, count: usize) {
    let mut manager = LeafManager::new(tree, 0);
    erode_voxels_with(&mut manager, count);
}

/// As [`erode_voxels`], reusing a caller-owned leaf manager.
pub fn erode_voxels_with<T: VoxelValue>(manager: &mut LeafManager<'_, T>, count: usize) {
    for _ in 0..count {
        Morphology::new(manager).erode();
        manager.tree_mut().prune_level_set();
        manager.rebuild_leaf_array();
    }
}

/// One neighbor slot of the per-leaf cache: resolved lazily on first use
/// and reset when the sweep moves to the next leaf.
struct Neighbor<T: VoxelValue> {
    slot_id: usize,
    leaf: Option<NonNull<LeafNode<T>>>,
    is_on: bool,
    init: bool,
}

impl<T: VoxelValue> Neighbor<T> {
    fn new(slot_id: usize) -> Self {
        Self {
            slot_id,
            leaf: None,
            is_on: false,
            init: true,
        }
    }

    fn clear(&mut self) {
        self.leaf = None;
        self.is_on = false;
        self.init = true;
    }

    /// Maps a z-row index of the current leaf to the facing row of this
    /// neighbor: rows swap sides along the crossed axis and stay put along
    /// z, where the shifted word already carries the offset.
    fn remap(&self, index: usize) -> usize {
        match self.slot_id {
            0 => index + 56,
            1 => index - 56,
            2 => index + 7,
            3 => index - 7,
            _ => index,
        }
    }

    /// ORs `word` into row `index` of the neighbor leaf, materializing the
    /// leaf unless the region is covered by an active tile (in which case
    /// the dilation is already absorbed).
    fn scatter(&mut self, tree: &mut Tree<T>, origin: Coord, index: usize, word: u8) {
        if self.init {
            self.init = false;
            let (dx, dy, dz) = NEIGHBORS[self.slot_id];
            let target = origin.offset_by(dx * DIM, dy * DIM, dz * DIM);
            self.leaf = match tree.probe_leaf(target) {
                Some(leaf) => Some(NonNull::from(leaf)),
                None => {
                    if tree.is_value_on(target) {
                        None
                    } else {
                        Some(NonNull::from(tree.touch_leaf(target)))
                    }
                }
            };
        }
        if let Some(mut leaf) = self.leaf {
            // Safety: the pointer targets a boxed leaf of the exclusively
            // borrowed tree; touch_leaf never moves existing leaves.
            let mask = unsafe { leaf.as_mut() }.value_mask_mut();
            *mask.word_mut(self.remap(index)) |= word;
        }
    }

    /// Reads row `index` of the neighbor leaf's live mask; absent regions
    /// read as all-on under an active tile and all-off otherwise.
    fn gather(&mut self, tree: &Tree<T>, origin: Coord, index: usize) -> u8 {
        if self.init {
            self.init = false;
            let (dx, dy, dz) = NEIGHBORS[self.slot_id];
            let target = origin.offset_by(dx * DIM, dy * DIM, dz * DIM);
            self.leaf = tree
                .probe_const_leaf(target)
                .map(|leaf| NonNull::from(leaf));
            self.is_on = self.leaf.is_none() && tree.is_value_on(target);
        }
        match self.leaf {
            Some(leaf) => unsafe { leaf.as_ref() }.value_mask().word(self.remap(index)),
            None => {
                if self.is_on {
                    !0
                } else {
                    0
                }
            }
        }
    }
}

/// Shared state of one dilation or erosion pass.
struct Morphology<'m, 't, T: VoxelValue> {
    manager: &'m mut LeafManager<'t, T>,
}

impl<'m, 't, T: VoxelValue> Morphology<'m, 't, T> {
    fn new(manager: &'m mut LeafManager<'t, T>) -> Self {
        Self { manager }
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, name = "morphology::dilate"))]
    fn dilate(&mut self) {
        let leaf_count = self.manager.leaf_count();

        // Snapshot every leaf's mask; dilation reads the snapshot and
        // writes the live masks.
        let saved_masks: Vec<LeafMask> = (0..leaf_count)
            .map(|i| self.manager.leaf(i).value_mask().clone())
            .collect();
        let origins: Vec<Coord> = (0..leaf_count).map(|i| self.manager.leaf(i).origin()).collect();

        let mut nn: [Neighbor<T>; 6] = neighbors();
        for leaf_idx in 0..leaf_count {
            let old_mask = &saved_masks[leaf_idx];
            let origin = origins[leaf_idx];
            for x in 0..DIM as usize {
                for y in 0..DIM as usize {
                    let n = (x << LOG2DIM) | y;
                    let old_word = old_mask.word(n);
                    if old_word == 0 {
                        continue; // no active voxels in this z-row
                    }

                    // ±x into this leaf or the x-neighbors.
                    if x > 0 {
                        let leaf = self.manager.leaf_mut(leaf_idx);
                        *leaf.value_mask_mut().word_mut(n - 8) |= old_word;
                    } else {
                        nn[0].scatter(self.manager.tree_mut(), origin, n, old_word);
                    }
                    if x < DIM as usize - 1 {
                        let leaf = self.manager.leaf_mut(leaf_idx);
                        *leaf.value_mask_mut().word_mut(n + 8) |= old_word;
                    } else {
                        nn[1].scatter(self.manager.tree_mut(), origin, n, old_word);
                    }

                    // ±y into this leaf or the y-neighbors.
                    if y > 0 {
                        let leaf = self.manager.leaf_mut(leaf_idx);
                        *leaf.value_mask_mut().word_mut(n - 1) |= old_word;
                    } else {
                        nn[2].scatter(self.manager.tree_mut(), origin, n, old_word);
                    }
                    if y < DIM as usize - 1 {
                        let leaf = self.manager.leaf_mut(leaf_idx);
                        *leaf.value_mask_mut().word_mut(n + 1) |= old_word;
                    } else {
                        nn[3].scatter(self.manager.tree_mut(), origin, n, old_word);
                    }

                    // z within the word, plus the two overflow bits.
                    {
                        let leaf = self.manager.leaf_mut(leaf_idx);
                        *leaf.value_mask_mut().word_mut(n) |= (old_word >> 1) | (old_word << 1);
                    }
                    let w = old_word << (DIM - 1);
                    if w != 0 {
                        nn[4].scatter(self.manager.tree_mut(), origin, n, w);
                    }
                    let w = old_word >> (DIM - 1);
                    if w != 0 {
                        nn[5].scatter(self.manager.tree_mut(), origin, n, w);
                    }
                }
            }
            for neighbor in nn.iter_mut() {
                neighbor.clear();
            }
        }
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, name = "morphology::erode"))]
    fn erode(&mut self) {
        let leaf_count = self.manager.leaf_count();

        // Erosion is the dual pass: all writes go to the snapshot while
        // every read (own rows and neighbor rows) comes from the untouched
        // live masks, then the snapshots replace the live masks wholesale.
        // Reading from progressively eroded masks would let neighboring
        // leaves erode each other's boundaries.
        let mut saved_masks: Vec<LeafMask> = (0..leaf_count)
            .map(|i| self.manager.leaf(i).value_mask().clone())
            .collect();
        let origins: Vec<Coord> = (0..leaf_count).map(|i| self.manager.leaf(i).origin()).collect();

        let mut nn: [Neighbor<T>; 6] = neighbors();
        for leaf_idx in 0..leaf_count {
            let origin = origins[leaf_idx];
            for x in 0..DIM as usize {
                for y in 0..DIM as usize {
                    let n = (x << LOG2DIM) | y;
                    let mut w = saved_masks[leaf_idx].word(n);
                    if w == 0 {
                        continue;
                    }

                    // Erode along z first; it uses the original word.
                    let tree = self.manager.tree();
                    let below = nn[4].gather(tree, origin, n) >> (DIM - 1);
                    let above = nn[5].gather(tree, origin, n) << (DIM - 1);
                    w &= (w << 1 | below) & (w >> 1 | above);

                    let live = self.manager.leaf(leaf_idx).value_mask();
                    w &= if x == 0 {
                        nn[0].gather(self.manager.tree(), origin, n)
                    } else {
                        live.word(n - 8)
                    };
                    let live = self.manager.leaf(leaf_idx).value_mask();
                    w &= if x == DIM as usize - 1 {
                        nn[1].gather(self.manager.tree(), origin, n)
                    } else {
                        live.word(n + 8)
                    };
                    let live = self.manager.leaf(leaf_idx).value_mask();
                    w &= if y == 0 {
                        nn[2].gather(self.manager.tree(), origin, n)
                    } else {
                        live.word(n - 1)
                    };
                    let live = self.manager.leaf(leaf_idx).value_mask();
                    w &= if y == DIM as usize - 1 {
                        nn[3].gather(self.manager.tree(), origin, n)
                    } else {
                        live.word(n + 1)
                    };

                    *saved_masks[leaf_idx].word_mut(n) = w;
                }
            }
            for neighbor in nn.iter_mut() {
                neighbor.clear();
            }
        }

        for (i, mask) in saved_masks.into_iter().enumerate() {
            self.manager.leaf_mut(i).set_value_mask(mask);
        }
    }
}

fn neighbors<T: VoxelValue>() -> [Neighbor<T>; 6] {
    [
        Neighbor::new(0),
        Neighbor::new(1),
        Neighbor::new(2),
        Neighbor::new(3),
        Neighbor::new(4),
        Neighbor::new(5),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CoordBBox;

    #[test]
    fn test_dilate_single_voxel_makes_cross() {
        let mut tree = Tree::new(0.0f32);
        tree.set_value_on(Coord::new(0, 0, 0), 1.0);
        dilate_voxels(&mut tree, 1);
        assert_eq!(tree.active_voxel_count(), 7);
        for p in [
            Coord::new(0, 0, 0),
            Coord::new(1, 0, 0),
            Coord::new(-1, 0, 0),
            Coord::new(0, 1, 0),
            Coord::new(0, -1, 0),
            Coord::new(0, 0, 1),
            Coord::new(0, 0, -1),
        ] {
            assert!(tree.is_value_on(p), "expected {p} active");
        }
        assert!(!tree.is_value_on(Coord::new(1, 1, 0)));
    }

    #[test]
    fn test_dilate_does_not_change_values() {
        let mut tree = Tree::new(5.0f32);
        tree.set_value_on(Coord::new(3, 3, 3), -1.0);
        dilate_voxels(&mut tree, 1);
        assert_eq!(tree.get_value(Coord::new(3, 3, 3)), -1.0);
        // Newly active voxels keep whatever value they held (background).
        assert_eq!(tree.get_value(Coord::new(4, 3, 3)), 5.0);
        assert!(tree.is_value_on(Coord::new(4, 3, 3)));
    }

    #[test]
    fn test_dilate_crosses_leaf_boundaries() {
        let mut tree = Tree::new(0.0f32);
        tree.set_value_on(Coord::new(7, 0, 0), 1.0);
        tree.set_value_on(Coord::new(0, 0, 7), 1.0);
        let leaves_before = tree.leaf_count();
        assert_eq!(leaves_before, 1);
        dilate_voxels(&mut tree, 1);
        assert!(tree.is_value_on(Coord::new(8, 0, 0)));
        assert!(tree.is_value_on(Coord::new(0, 0, 8)));
        assert!(tree.leaf_count() >= 3);
    }

    #[test]
    fn test_dilate_monotone_and_iterated() {
        let mut tree = Tree::new(0.0f32);
        tree.set_value_on(Coord::new(0, 0, 0), 1.0);
        dilate_voxels(&mut tree, 2);
        // Count of the discrete L1 ball of radius 2: 1 + 6 + 18 = 25.
        assert_eq!(tree.active_voxel_count(), 25);
        assert!(tree.is_value_on(Coord::new(0, 0, 0)));
        assert!(tree.is_value_on(Coord::new(2, 0, 0)));
        assert!(tree.is_value_on(Coord::new(1, 1, 0)));
        assert!(!tree.is_value_on(Coord::new(2, 1, 0)));
    }

    #[test]
    fn test_erode_reverts_dilation_on_single_voxel() {
        let mut tree = Tree::new(0.0f32);
        tree.set_value_on(Coord::new(4, 4, 4), 1.0);
        dilate_voxels(&mut tree, 1);
        erode_voxels(&mut tree, 1);
        assert_eq!(tree.active_voxel_count(), 1);
        assert!(tree.is_value_on(Coord::new(4, 4, 4)));
    }

    #[test]
    fn test_erode_shrinks_box_faces() {
        let mut tree = Tree::new(0.0f32);
        tree.fill(&CoordBBox::new(Coord::ZERO, Coord::splat(4)), 1.0, true);
        tree.voxelize_active_tiles();
        assert_eq!(tree.active_voxel_count(), 125);
        erode_voxels(&mut tree, 1);
        // A 5^3 box erodes to 3^3.
        assert_eq!(tree.active_voxel_count(), 27);
        assert!(tree.is_value_on(Coord::new(2, 2, 2)));
        assert!(!tree.is_value_on(Coord::new(0, 2, 2)));
    }

    #[test]
    fn test_erode_across_leaf_boundary() {
        // An x-run spanning two leaves: eroding must consult the neighbor
        // leaf, not treat the boundary as empty.
        let mut tree = Tree::new(0.0f32);
        tree.fill(&CoordBBox::new(Coord::new(5, 4, 4), Coord::new(10, 6, 6)), 1.0, true);
        tree.voxelize_active_tiles();
        erode_voxels(&mut tree, 1);
        // The interior row at y=z=5 survives, shortened by one at each end.
        assert!(tree.is_value_on(Coord::new(7, 5, 5)));
        assert!(tree.is_value_on(Coord::new(8, 5, 5)));
        assert!(!tree.is_value_on(Coord::new(5, 5, 5)));
        assert!(!tree.is_value_on(Coord::new(10, 5, 5)));
        assert_eq!(tree.active_voxel_count(), 4);
    }
}
