use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::core::{Coord, CoordBBox, VoxelValue};

use super::{Internal2, LeafNode, Tile, TreeNode};

/// One entry of the root table.
pub(crate) enum RootEntry<T> {
    Tile(Tile<T>),
    Child(Box<Internal2<T>>),
}

/// The unbounded top of the tree: an ordered map from aligned origins to
/// tiles or child subtrees, plus the background value returned for every
/// coordinate with no entry.
///
/// An absent key is equivalent to an inactive tile holding the background;
/// maintenance operations erase such tiles whenever they appear. Keys are
/// aligned to the child dimension and ordered lexicographically, which
/// makes z-adjacent children neighbors in iteration order (the signed
/// flood fill depends on this).
pub struct RootNode<T: VoxelValue> {
    table: BTreeMap<Coord, RootEntry<T>>,
    background: T,
}

impl<T: VoxelValue> RootNode<T> {
    /// Side length of a child cube, i.e. the key alignment.
    pub const CHILD_DIM: i32 = Internal2::<T>::DIM;
    /// Number of tree levels below the root.
    pub const DEPTH: u32 = <Internal2<T> as TreeNode<T>>::LEVEL + 1;

    pub fn new(background: T) -> Self {
        Self {
            table: BTreeMap::new(),
            background,
        }
    }

    #[inline(always)]
    pub fn coord_to_key(xyz: Coord) -> Coord {
        xyz.align_down(Self::CHILD_DIM)
    }

    pub fn background(&self) -> T {
        self.background
    }

    pub(crate) fn find_entry(&self, key: Coord) -> Option<&RootEntry<T>> {
        debug_assert!(key.is_aligned(Self::CHILD_DIM), "unaligned root key {key}");
        self.table.get(&key)
    }

    pub(crate) fn find_entry_mut(&mut self, key: Coord) -> Option<&mut RootEntry<T>> {
        debug_assert!(key.is_aligned(Self::CHILD_DIM), "unaligned root key {key}");
        self.table.get_mut(&key)
    }

    fn is_background_tile(&self, entry: &RootEntry<T>) -> bool {
        match entry {
            RootEntry::Tile(t) => !t.active && t.value.approx_eq(self.background),
            RootEntry::Child(_) => false,
        }
    }

    // ---- reads ------------------------------------------------------

    pub fn get_value(&self, xyz: Coord) -> T {
        match self.find_entry(Self::coord_to_key(xyz)) {
            None => self.background,
            Some(RootEntry::Tile(t)) => t.value,
            Some(RootEntry::Child(c)) => c.get_value(xyz),
        }
    }

    pub fn is_value_on(&self, xyz: Coord) -> bool {
        match self.find_entry(Self::coord_to_key(xyz)) {
            None => false,
            Some(RootEntry::Tile(t)) => t.active,
            Some(RootEntry::Child(c)) => c.is_value_on(xyz),
        }
    }

    /// Writes the value at `xyz` into `value` (the background when absent)
    /// and returns its active state.
    pub fn probe_value(&self, xyz: Coord, value: &mut T) -> bool {
        match self.find_entry(Self::coord_to_key(xyz)) {
            None => {
                *value = self.background;
                false
            }
            Some(RootEntry::Tile(t)) => {
                *value = t.value;
                t.active
            }
            Some(RootEntry::Child(c)) => c.probe_value(xyz, value),
        }
    }

    /// Length of the path storing the value at `xyz`: -1 for background,
    /// 0 for a root tile, up to `DEPTH` for a leaf voxel.
    pub fn value_depth(&self, xyz: Coord) -> i32 {
        match self.find_entry(Self::coord_to_key(xyz)) {
            None => -1,
            Some(RootEntry::Tile(_)) => 0,
            Some(RootEntry::Child(c)) => Self::DEPTH as i32 - c.value_level(xyz) as i32,
        }
    }

    pub fn probe_leaf(&mut self, xyz: Coord) -> Option<&mut LeafNode<T>> {
        match self.find_entry_mut(Self::coord_to_key(xyz)) {
            Some(RootEntry::Child(c)) => c.probe_leaf(xyz),
            _ => None,
        }
    }

    pub fn probe_const_leaf(&self, xyz: Coord) -> Option<&LeafNode<T>> {
        match self.find_entry(Self::coord_to_key(xyz)) {
            Some(RootEntry::Child(c)) => c.probe_const_leaf(xyz),
            _ => None,
        }
    }

    /// Returns the leaf containing `xyz`, materializing the path to it.
    pub fn touch_leaf(&mut self, xyz: Coord) -> &mut LeafNode<T> {
        let key = Self::coord_to_key(xyz);
        let background = self.background;
        let entry = self
            .table
            .entry(key)
            .or_insert_with(|| RootEntry::Child(Box::new(Internal2::new(key, background, false))));
        if let RootEntry::Tile(t) = entry {
            let t = *t;
            *entry = RootEntry::Child(Box::new(Internal2::new(key, t.value, t.active)));
        }
        match entry {
            RootEntry::Child(c) => c.touch_leaf(xyz),
            RootEntry::Tile(_) => unreachable!(),
        }
    }

    // ---- writes -----------------------------------------------------

    /// Shared descent for the point mutations: recurse into an existing
    /// child, or materialize one from the tile (or the background when the
    /// key is absent and `vacant` allows it) before recursing.
    fn modify_path<P, A>(&mut self, xyz: Coord, vacant: bool, tile_pred: P, apply: A)
    where
        P: FnOnce(Tile<T>) -> bool,
        A: Fn(&mut Internal2<T>),
    {
        let key = Self::coord_to_key(xyz);
        let background = self.background;
        match self.table.entry(key) {
            Entry::Vacant(e) => {
                if vacant {
                    let mut child = Internal2::new(key, background, false);
                    apply(&mut child);
                    e.insert(RootEntry::Child(Box::new(child)));
                }
            }
            Entry::Occupied(mut e) => {
                let tile = match e.get_mut() {
                    RootEntry::Child(c) => {
                        apply(c);
                        None
                    }
                    RootEntry::Tile(t) => Some(*t),
                };
                if let Some(t) = tile {
                    if tile_pred(t) {
                        let mut child = Internal2::new(key, t.value, t.active);
                        apply(&mut child);
                        e.insert(RootEntry::Child(Box::new(child)));
                    }
                }
            }
        }
    }

    pub fn set_value_on(&mut self, xyz: Coord, value: T) {
        self.modify_path(
            xyz,
            true,
            |t| !t.active || t.value != value,
            |c| c.set_value_on(xyz, value),
        );
    }

    pub fn set_value_only(&mut self, xyz: Coord, value: T) {
        self.modify_path(
            xyz,
            true,
            |t| t.value != value,
            |c| c.set_value_only(xyz, value),
        );
    }

    pub fn set_value_off(&mut self, xyz: Coord, value: T) {
        // Writing the background over an absent region changes nothing.
        let vacant = !self.background.approx_eq(value);
        self.modify_path(
            xyz,
            vacant,
            |t| t.active || t.value != value,
            |c| c.set_value_off(xyz, value),
        );
    }

    pub fn set_active_state(&mut self, xyz: Coord, on: bool) {
        // An absent coordinate is already inactive.
        self.modify_path(
            xyz,
            on,
            |t| t.active != on,
            |c| c.set_active_state(xyz, on),
        );
    }

    pub fn set_value_on_min(&mut self, xyz: Coord, value: T) {
        self.modify_path(
            xyz,
            true,
            |t| !t.active || t.value > value,
            |c| c.set_value_on_min(xyz, value),
        );
    }

    pub fn set_value_on_max(&mut self, xyz: Coord, value: T) {
        self.modify_path(
            xyz,
            true,
            |t| !t.active || t.value < value,
            |c| c.set_value_on_max(xyz, value),
        );
    }

    pub fn set_value_on_sum(&mut self, xyz: Coord, addend: T) {
        self.modify_path(
            xyz,
            true,
            |t| !t.active || addend != T::zero(),
            |c| c.set_value_on_sum(xyz, addend),
        );
    }

    pub fn fill(&mut self, bbox: &CoordBBox, value: T, active: bool) {
        if bbox.is_empty() {
            return;
        }
        let dim = Self::CHILD_DIM;
        let mut x = bbox.min.x;
        while x <= bbox.max.x {
            let x_tile_max = (x & !(dim - 1)) + dim - 1;
            let mut y = bbox.min.y;
            while y <= bbox.max.y {
                let y_tile_max = (y & !(dim - 1)) + dim - 1;
                let mut z = bbox.min.z;
                while z <= bbox.max.z {
                    let xyz = Coord::new(x, y, z);
                    let tile_min = Self::coord_to_key(xyz);
                    let tile_max = tile_min.offset_by(dim - 1, dim - 1, dim - 1);
                    if xyz == tile_min
                        && bbox.max.x >= tile_max.x
                        && bbox.max.y >= tile_max.y
                        && bbox.max.z >= tile_max.z
                    {
                        // The box covers this whole child cube.
                        self.table
                            .insert(tile_min, RootEntry::Tile(Tile::new(value, active)));
                    } else {
                        let background = self.background;
                        let entry = self.table.entry(tile_min).or_insert_with(|| {
                            RootEntry::Child(Box::new(Internal2::new(
                                tile_min, background, false,
                            )))
                        });
                        if let RootEntry::Tile(t) = entry {
                            let t = *t;
                            *entry = RootEntry::Child(Box::new(Internal2::new(
                                tile_min, t.value, t.active,
                            )));
                        }
                        if let RootEntry::Child(c) = entry {
                            let sub = CoordBBox::new(xyz, bbox.max.min_component(tile_max));
                            c.fill(&sub, value, active);
                        }
                    }
                    z = tile_max.z + 1;
                }
                y = y_tile_max + 1;
            }
            x = x_tile_max + 1;
        }
    }

    // ---- maintenance ------------------------------------------------

    /// Replaces the background: inactive values approximately equal to
    /// `±old` become `±new`. Active values are never modified.
    pub fn set_background(&mut self, background: T) {
        if background == self.background {
            return;
        }
        let old = self.background;
        for entry in self.table.values_mut() {
            match entry {
                RootEntry::Child(c) => c.reset_background(old, background),
                RootEntry::Tile(t) => {
                    if t.active {
                        continue;
                    }
                    if t.value.approx_eq(old) {
                        t.value = background;
                    } else if t.value.approx_eq(old.negated()) {
                        t.value = background.negated();
                    }
                }
            }
        }
        self.background = background;
    }

    /// Removes every inactive tile whose value equals the background;
    /// such tiles are indistinguishable from absent keys.
    pub fn erase_background_tiles(&mut self) -> usize {
        let background = self.background;
        let before = self.table.len();
        self.table.retain(|_, entry| match entry {
            RootEntry::Tile(t) => t.active || !t.value.approx_eq(background),
            RootEntry::Child(_) => true,
        });
        before - self.table.len()
    }

    pub fn num_background_tiles(&self) -> usize {
        self.table
            .values()
            .filter(|e| self.is_background_tile(e))
            .count()
    }

    pub fn clear(&mut self) {
        self.table.clear();
    }

    fn prune_entries<F>(&mut self, mut op: F)
    where
        F: FnMut(&mut Internal2<T>) -> Option<(T, bool)>,
    {
        for entry in self.table.values_mut() {
            if let RootEntry::Child(c) = entry {
                if let Some((value, active)) = op(c) {
                    *entry = RootEntry::Tile(Tile::new(value, active));
                }
            }
        }
        self.erase_background_tiles();
    }

    pub fn prune(&mut self, tolerance: T) {
        self.prune_entries(|c| c.prune(tolerance));
    }

    pub fn prune_inactive(&mut self, value: T) {
        self.prune_entries(|c| c.prune_inactive(value));
    }

    pub fn prune_level_set(&mut self) {
        let outside = self.background;
        self.prune_entries(|c| c.prune_level_set(outside));
    }

    // ---- bulk algorithms --------------------------------------------

    /// Signed flood fill with `(background, -background)`.
    pub fn signed_flood_fill_default(&mut self) {
        let outside = self.background;
        self.signed_flood_fill(outside, outside.negated());
    }

    /// Propagates the sign of the narrow band into all inactive regions:
    /// children flood themselves, then a z-scan over the sorted child keys
    /// inserts inside tiles between z-adjacent children whose facing
    /// boundary values are both negative.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, name = "root::signed_flood_fill"))]
    pub fn signed_flood_fill(&mut self, outside: T, inside: T) {
        self.background = outside;

        let mut node_keys: Vec<Coord> = Vec::new();
        for (key, entry) in self.table.iter_mut() {
            if let RootEntry::Child(c) = entry {
                c.signed_flood_fill(outside, inside);
                node_keys.push(*key);
            }
        }

        // BTreeMap iteration already yields the keys sorted.
        let dim = Self::CHILD_DIM;
        for pair in node_keys.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            let d = b - a;
            if d.x != 0 || d.y != 0 || d.z == dim {
                continue; // not a z-scanline gap between neighbors
            }
            let lo = match self.table.get(&a) {
                Some(RootEntry::Child(c)) => c.last_value(),
                _ => continue,
            };
            let hi = match self.table.get(&b) {
                Some(RootEntry::Child(c)) => c.first_value(),
                _ => continue,
            };
            if !lo.is_negative() || !hi.is_negative() {
                continue; // the scanline between them is not inside
            }
            let mut c = a.offset_by(0, 0, dim);
            while c.z != b.z {
                self.table
                    .insert(c, RootEntry::Tile(Tile::new(inside, false)));
                c.z += dim;
            }
        }
    }

    pub fn voxelize_active_tiles(&mut self) {
        let keys: Vec<Coord> = self.table.keys().copied().collect();
        for key in keys {
            let entry = self.table.get_mut(&key).expect("key collected above");
            if let RootEntry::Tile(t) = entry {
                if !t.active {
                    continue;
                }
                let t = *t;
                *entry = RootEntry::Child(Box::new(Internal2::new(key, t.value, true)));
            }
            if let RootEntry::Child(c) = entry {
                c.voxelize_active_tiles();
            }
        }
    }

    // ---- structural combiners ---------------------------------------

    /// Steals `other`'s subtrees: absent keys take the other entry, tiles
    /// are replaced by stolen children, child/child pairs merge
    /// recursively. `other` is emptied.
    pub fn merge(&mut self, other: &mut Self) {
        let other_background = other.background;
        let background = self.background;
        for (key, oentry) in std::mem::take(&mut other.table) {
            match oentry {
                RootEntry::Child(oc) => match self.table.entry(key) {
                    Entry::Vacant(e) => {
                        e.insert(RootEntry::Child(oc));
                    }
                    Entry::Occupied(mut e) => {
                        let merged = match e.get_mut() {
                            RootEntry::Child(c) => {
                                c.merge(*oc, other_background, background);
                                None
                            }
                            RootEntry::Tile(_) => Some(oc),
                        };
                        if let Some(oc) = merged {
                            e.insert(RootEntry::Child(oc));
                        }
                    }
                },
                RootEntry::Tile(t) => {
                    // This side wins where a key already exists.
                    self.table.entry(key).or_insert(RootEntry::Tile(t));
                }
            }
        }
    }

    /// Unions `other`'s active topology into this tree. Values on this
    /// side are untouched; refined regions take this side's tile values.
    pub fn topology_union(&mut self, other: &Self) {
        let background = self.background;
        for (key, oentry) in other.table.iter() {
            match oentry {
                RootEntry::Child(oc) => match self.table.entry(*key) {
                    Entry::Vacant(e) => {
                        let child = Internal2::topology_copy_from(oc, background);
                        e.insert(RootEntry::Child(Box::new(child)));
                    }
                    Entry::Occupied(mut e) => {
                        let tile = match e.get_mut() {
                            RootEntry::Child(c) => {
                                c.topology_union(oc);
                                None
                            }
                            RootEntry::Tile(t) => Some(*t),
                        };
                        if let Some(t) = tile {
                            let mut child = Internal2::topology_copy_from(oc, t.value);
                            if t.active {
                                child.set_values_on();
                            }
                            e.insert(RootEntry::Child(Box::new(child)));
                        }
                    }
                },
                RootEntry::Tile(ot) if ot.active => match self.table.entry(*key) {
                    Entry::Vacant(e) => {
                        e.insert(RootEntry::Tile(Tile::new(background, true)));
                    }
                    Entry::Occupied(mut e) => match e.get_mut() {
                        RootEntry::Child(c) => c.set_values_on(),
                        RootEntry::Tile(t) => t.active = true,
                    },
                },
                RootEntry::Tile(_) => {}
            }
        }
    }

    /// Pointwise combination of this tree (A) with `other` (B); `other` is
    /// emptied. With `prune` set, combined children collapse eagerly.
    pub fn combine<F>(&mut self, other: &mut Self, op: &mut F, prune: bool)
    where
        F: FnMut(T, bool, T, bool) -> (T, bool),
    {
        let other_background = other.background;
        let background = self.background;

        let mut keys: BTreeSet<Coord> = self.table.keys().copied().collect();
        keys.extend(other.table.keys().copied());

        let mut other_table = std::mem::take(&mut other.table);
        for key in keys {
            let oentry = other_table
                .remove(&key)
                .unwrap_or(RootEntry::Tile(Tile::new(other_background, false)));
            let entry = self
                .table
                .entry(key)
                .or_insert(RootEntry::Tile(Tile::new(background, false)));
            match oentry {
                RootEntry::Tile(ot) => match entry {
                    RootEntry::Child(c) => c.combine_with_tile(ot.value, ot.active, false, op),
                    RootEntry::Tile(t) => {
                        let (v, on) = op(t.value, t.active, ot.value, ot.active);
                        *t = Tile::new(v, on);
                    }
                },
                RootEntry::Child(mut oc) => {
                    let tile = match entry {
                        RootEntry::Tile(t) => Some(*t),
                        RootEntry::Child(_) => None,
                    };
                    match tile {
                        None => {
                            if let RootEntry::Child(c) = entry {
                                c.combine(*oc, op);
                            }
                        }
                        Some(t) => {
                            // This side is constant; fold it into the other
                            // child with swapped arguments, then adopt it.
                            oc.combine_with_tile(t.value, t.active, true, op);
                            *entry = RootEntry::Child(oc);
                        }
                    }
                }
            }
            if prune {
                if let RootEntry::Child(c) = entry {
                    if let Some((v, on)) = c.prune(T::zero()) {
                        *entry = RootEntry::Tile(Tile::new(v, on));
                    }
                }
            }
        }

        let (new_background, _) = op(background, false, other_background, false);
        self.background = new_background;
    }

    /// Rebuilds this tree as the pointwise combination of `a` and `b`,
    /// which are left untouched.
    pub fn combine2<F>(&mut self, a: &Self, b: &Self, op: &mut F, prune: bool)
    where
        F: FnMut(T, bool, T, bool) -> (T, bool),
    {
        self.table.clear();
        let (background, _) = op(a.background, false, b.background, false);
        self.background = background;

        let mut keys: BTreeSet<Coord> = a.table.keys().copied().collect();
        keys.extend(b.table.keys().copied());

        for key in keys {
            let a_tile = Tile::new(a.background, false);
            let b_tile = Tile::new(b.background, false);
            let mut entry = match (a.table.get(&key), b.table.get(&key)) {
                (Some(RootEntry::Child(ac)), Some(RootEntry::Child(bc))) => {
                    RootEntry::Child(Box::new(Internal2::combine2(ac, bc, op)))
                }
                (Some(RootEntry::Child(ac)), ob) => {
                    let bt = match ob {
                        Some(RootEntry::Tile(t)) => *t,
                        _ => b_tile,
                    };
                    RootEntry::Child(Box::new(Internal2::combine2_with_tile(
                        ac, bt.value, bt.active, false, op,
                    )))
                }
                (oa, Some(RootEntry::Child(bc))) => {
                    let at = match oa {
                        Some(RootEntry::Tile(t)) => *t,
                        _ => a_tile,
                    };
                    RootEntry::Child(Box::new(Internal2::combine2_with_tile(
                        bc, at.value, at.active, true, op,
                    )))
                }
                (oa, ob) => {
                    let at = match oa {
                        Some(RootEntry::Tile(t)) => *t,
                        _ => a_tile,
                    };
                    let bt = match ob {
                        Some(RootEntry::Tile(t)) => *t,
                        _ => b_tile,
                    };
                    let (v, on) = op(at.value, at.active, bt.value, bt.active);
                    RootEntry::Tile(Tile::new(v, on))
                }
            };
            if prune {
                if let RootEntry::Child(c) = &mut entry {
                    if let Some((v, on)) = c.prune(T::zero()) {
                        entry = RootEntry::Tile(Tile::new(v, on));
                    }
                }
            }
            self.table.insert(key, entry);
        }
    }

    /// Topology equality up to background tiles on either side.
    pub fn has_same_topology(&self, other: &Self) -> bool {
        let mut other_keys: BTreeSet<Coord> = other.table.keys().copied().collect();
        for (key, entry) in self.table.iter() {
            if self.is_background_tile(entry) {
                continue;
            }
            match (entry, other.table.get(key)) {
                (RootEntry::Child(a), Some(RootEntry::Child(b))) => {
                    if !a.has_same_topology(b) {
                        return false;
                    }
                }
                (RootEntry::Tile(a), Some(RootEntry::Tile(b))) => {
                    if a.active != b.active {
                        return false;
                    }
                }
                _ => return false,
            }
            other_keys.remove(key);
        }
        // Whatever remains on the other side must be background tiles.
        other_keys.iter().all(|key| {
            other
                .table
                .get(key)
                .is_some_and(|e| other.is_background_tile(e))
        })
    }

    // ---- counts and extents -----------------------------------------

    pub fn leaf_count(&self) -> u64 {
        self.table
            .values()
            .map(|e| match e {
                RootEntry::Child(c) => c.leaf_count(),
                RootEntry::Tile(_) => 0,
            })
            .sum()
    }

    pub fn on_voxel_count(&self) -> u64 {
        self.table
            .values()
            .map(|e| match e {
                RootEntry::Child(c) => c.on_voxel_count(),
                RootEntry::Tile(t) => {
                    if t.active {
                        <Internal2<T> as TreeNode<T>>::NUM_VOXELS
                    } else {
                        0
                    }
                }
            })
            .sum()
    }

    pub fn child_count(&self) -> usize {
        self.table
            .values()
            .filter(|e| matches!(e, RootEntry::Child(_)))
            .count()
    }

    pub fn tile_count(&self) -> usize {
        self.table.len() - self.child_count()
    }

    pub fn active_tile_count(&self) -> usize {
        self.table
            .values()
            .filter(|e| matches!(e, RootEntry::Tile(t) if t.active))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn has_active_tiles(&self) -> bool {
        self.table.values().any(|e| match e {
            RootEntry::Child(c) => c.has_active_tiles(),
            RootEntry::Tile(t) => t.active,
        })
    }

    pub fn min_index(&self) -> Coord {
        self.table.keys().next().copied().unwrap_or(Coord::ZERO)
    }

    pub fn max_index(&self) -> Coord {
        self.table
            .keys()
            .next_back()
            .map(|k| k.offset_by(Self::CHILD_DIM - 1, Self::CHILD_DIM - 1, Self::CHILD_DIM - 1))
            .unwrap_or(Coord::ZERO)
    }

    pub fn eval_active_bbox(&self, bbox: &mut CoordBBox) {
        for (key, entry) in self.table.iter() {
            match entry {
                RootEntry::Child(c) => c.eval_active_bbox(bbox),
                RootEntry::Tile(t) => {
                    if t.active {
                        bbox.expand_cube(*key, Self::CHILD_DIM);
                    }
                }
            }
        }
    }

    pub fn for_each_leaf_mut(&mut self, f: &mut dyn FnMut(&mut LeafNode<T>)) {
        for entry in self.table.values_mut() {
            if let RootEntry::Child(c) = entry {
                c.for_each_leaf_mut(f);
            }
        }
    }

    // ---- topology and buffer streams --------------------------------

    /// Writes the topology stream. Returns false for an empty tree, whose
    /// stream consists of the background and two zero counts only.
    pub fn write_topology<W: Write>(&self, writer: &mut W) -> std::io::Result<bool> {
        self.background.write_as_be(writer)?;
        let num_tiles = self.tile_count() as u32;
        let num_children = self.child_count() as u32;
        writer.write_u32::<BigEndian>(num_tiles)?;
        writer.write_u32::<BigEndian>(num_children)?;
        if num_tiles == 0 && num_children == 0 {
            return Ok(false);
        }
        for (key, entry) in self.table.iter() {
            if let RootEntry::Tile(t) = entry {
                write_coord(writer, *key)?;
                t.value.write_as_be(writer)?;
                writer.write_u8(t.active as u8)?;
            }
        }
        for (key, entry) in self.table.iter() {
            if let RootEntry::Child(c) = entry {
                write_coord(writer, *key)?;
                c.write_topology(writer)?;
            }
        }
        Ok(true)
    }

    /// Replaces this tree with the topology read from `reader`. Returns
    /// false (leaving only the stored background) if the stream holds an
    /// empty tree.
    pub fn read_topology<R: Read>(&mut self, reader: &mut R) -> std::io::Result<bool> {
        self.table.clear();
        self.background = T::read_from_be(reader)?;
        let num_tiles = reader.read_u32::<BigEndian>()?;
        let num_children = reader.read_u32::<BigEndian>()?;
        if num_tiles == 0 && num_children == 0 {
            return Ok(false);
        }
        for _ in 0..num_tiles {
            let origin = read_aligned_coord(reader, Self::CHILD_DIM)?;
            let value = T::read_from_be(reader)?;
            let active = reader.read_u8()? != 0;
            self.table
                .insert(origin, RootEntry::Tile(Tile::new(value, active)));
        }
        for _ in 0..num_children {
            let origin = read_aligned_coord(reader, Self::CHILD_DIM)?;
            let child = Internal2::read_topology(reader, origin, self.background)?;
            self.table.insert(origin, RootEntry::Child(Box::new(child)));
        }
        Ok(true)
    }

    pub fn write_buffers<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        for entry in self.table.values() {
            if let RootEntry::Child(c) = entry {
                c.write_buffers(writer)?;
            }
        }
        Ok(())
    }

    pub fn read_buffers<R: Read>(&mut self, reader: &mut R) -> std::io::Result<()> {
        for entry in self.table.values_mut() {
            if let RootEntry::Child(c) = entry {
                c.read_buffers(reader)?;
            }
        }
        Ok(())
    }
}

fn write_coord<W: Write>(writer: &mut W, c: Coord) -> std::io::Result<()> {
    writer.write_i32::<BigEndian>(c.x)?;
    writer.write_i32::<BigEndian>(c.y)?;
    writer.write_i32::<BigEndian>(c.z)
}

fn read_aligned_coord<R: Read>(reader: &mut R, dim: i32) -> std::io::Result<Coord> {
    let x = reader.read_i32::<BigEndian>()?;
    let y = reader.read_i32::<BigEndian>()?;
    let z = reader.read_i32::<BigEndian>()?;
    let c = Coord::new(x, y, z);
    if !c.is_aligned(dim) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("root origin {c} is not aligned to {dim}"),
        ));
    }
    Ok(c)
}
