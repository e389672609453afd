use std::io::{Read, Write};

use crate::core::{Coord, CoordBBox, MaskWord, NodeMask, VoxelValue};

use super::{LeafNode, TreeNode};

/// A constant value plus active flag covering a whole subtree cube.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Tile<T> {
    pub value: T,
    pub active: bool,
}

impl<T> Tile<T> {
    #[inline(always)]
    pub const fn new(value: T, active: bool) -> Self {
        Self { value, active }
    }
}

/// One slot of an internal node: either a homogeneous constant or an owned
/// child subtree. A tile's active state lives in the node's value mask, so
/// the slot itself carries the value only.
pub enum Slot<T, C> {
    Tile(T),
    Child(Box<C>),
}

/// Inner node subdividing its cube into `(1 << LOG2DIM)^3` child slots.
///
/// The child mask records which slots hold children; the value mask records
/// the active state of tile slots (bits under the child mask stay off).
/// Exactly one of the two interpretations holds per slot.
pub struct InternalNode<T, C, W: MaskWord> {
    origin: Coord,
    slots: Vec<Slot<T, C>>,
    child_mask: NodeMask<W>,
    value_mask: NodeMask<W>,
}

/// Internal node directly above the leaves: 16^3 slots, 128^3 voxels.
pub type Internal1<T> = InternalNode<T, LeafNode<T>, u16>;
/// Internal node below the root: 32^3 slots, 4096^3 voxels.
pub type Internal2<T> = InternalNode<T, Internal1<T>, u32>;

impl<T: VoxelValue, C: TreeNode<T>, W: MaskWord> InternalNode<T, C, W> {
    pub const LOG2DIM: u32 = W::LOG2;
    pub const TOTAL_LOG2: u32 = W::LOG2 + C::TOTAL_LOG2;
    pub const DIM: i32 = 1 << Self::TOTAL_LOG2;
    pub const NUM_SLOTS: usize = 1 << (3 * W::LOG2);

    #[inline(always)]
    pub fn coord_to_offset(xyz: Coord) -> usize {
        let dim_mask = Self::DIM - 1;
        ((((xyz.x & dim_mask) >> C::TOTAL_LOG2) as usize) << (2 * Self::LOG2DIM))
            | ((((xyz.y & dim_mask) >> C::TOTAL_LOG2) as usize) << Self::LOG2DIM)
            | (((xyz.z & dim_mask) >> C::TOTAL_LOG2) as usize)
    }

    /// Origin of the child cube addressed by slot `n`.
    #[inline]
    pub fn offset_to_origin(&self, n: usize) -> Coord {
        let fan_mask = (1usize << Self::LOG2DIM) - 1;
        let x = (n >> (2 * Self::LOG2DIM)) as i32;
        let y = ((n >> Self::LOG2DIM) & fan_mask) as i32;
        let z = (n & fan_mask) as i32;
        self.origin.offset_by(
            x << C::TOTAL_LOG2,
            y << C::TOTAL_LOG2,
            z << C::TOTAL_LOG2,
        )
    }

    #[inline(always)]
    pub fn bbox(&self) -> CoordBBox {
        CoordBBox::cube(self.origin, Self::DIM)
    }

    pub fn child_mask(&self) -> &NodeMask<W> {
        &self.child_mask
    }

    pub fn value_mask(&self) -> &NodeMask<W> {
        &self.value_mask
    }

    /// Composite view of a tile slot. Panics if the slot holds a child.
    #[inline]
    pub(crate) fn tile_at(&self, n: usize) -> Tile<T> {
        match &self.slots[n] {
            Slot::Tile(value) => Tile::new(*value, self.value_mask.is_on(n)),
            Slot::Child(_) => panic!("slot {n} holds a child, not a tile"),
        }
    }

    #[inline]
    pub(crate) fn child(&self, n: usize) -> Option<&C> {
        match &self.slots[n] {
            Slot::Child(c) => Some(c),
            Slot::Tile(_) => None,
        }
    }

    #[inline]
    pub(crate) fn child_mut(&mut self, n: usize) -> Option<&mut C> {
        match &mut self.slots[n] {
            Slot::Child(c) => Some(c),
            Slot::Tile(_) => None,
        }
    }

    #[inline]
    fn expect_child(&self, n: usize) -> &C {
        self.child(n).expect("child mask bit set on a tile slot")
    }

    #[inline]
    fn expect_child_mut(&mut self, n: usize) -> &mut C {
        self.child_mut(n).expect("child mask bit set on a tile slot")
    }

    pub(crate) fn set_tile(&mut self, n: usize, value: T, active: bool) {
        self.slots[n] = Slot::Tile(value);
        self.child_mask.set_off(n);
        self.value_mask.set(n, active);
    }

    pub(crate) fn set_child(&mut self, n: usize, child: Box<C>) {
        self.slots[n] = Slot::Child(child);
        self.child_mask.set_on(n);
        self.value_mask.set_off(n);
    }

    /// Replaces the tile in slot `n` with a child initialized from it.
    fn refine_tile(&mut self, n: usize) -> &mut C {
        let tile = self.tile_at(n);
        let child = Box::new(C::new(self.offset_to_origin(n), tile.value, tile.active));
        self.set_child(n, child);
        self.expect_child_mut(n)
    }

    /// The child in slot `n`, materialized from its tile if needed.
    fn child_or_refine(&mut self, n: usize) -> &mut C {
        if self.child_mask.is_on(n) {
            self.expect_child_mut(n)
        } else {
            self.refine_tile(n)
        }
    }
}

impl<T: VoxelValue, C: TreeNode<T>, W: MaskWord> TreeNode<T> for InternalNode<T, C, W> {
    const LEVEL: u32 = C::LEVEL + 1;
    const LOG2DIM: u32 = W::LOG2;
    const TOTAL_LOG2: u32 = W::LOG2 + C::TOTAL_LOG2;
    const DIM: i32 = 1 << Self::TOTAL_LOG2;
    const NUM_VOXELS: u64 = 1 << (3 * Self::TOTAL_LOG2);

    fn new(origin: Coord, value: T, active: bool) -> Self {
        Self {
            origin: origin.align_down(Self::DIM),
            slots: (0..Self::NUM_SLOTS).map(|_| Slot::Tile(value)).collect(),
            child_mask: NodeMask::new(),
            value_mask: NodeMask::filled(active),
        }
    }

    fn topology_copy_from(other: &Self, value: T) -> Self {
        let slots = other
            .slots
            .iter()
            .map(|slot| match slot {
                Slot::Tile(_) => Slot::Tile(value),
                Slot::Child(c) => Slot::Child(Box::new(C::topology_copy_from(c, value))),
            })
            .collect();
        Self {
            origin: other.origin,
            slots,
            child_mask: other.child_mask.clone(),
            value_mask: other.value_mask.clone(),
        }
    }

    #[inline(always)]
    fn origin(&self) -> Coord {
        self.origin
    }

    fn get_value(&self, xyz: Coord) -> T {
        let n = Self::coord_to_offset(xyz);
        match &self.slots[n] {
            Slot::Tile(value) => *value,
            Slot::Child(c) => c.get_value(xyz),
        }
    }

    fn is_value_on(&self, xyz: Coord) -> bool {
        let n = Self::coord_to_offset(xyz);
        match &self.slots[n] {
            Slot::Tile(_) => self.value_mask.is_on(n),
            Slot::Child(c) => c.is_value_on(xyz),
        }
    }

    fn probe_value(&self, xyz: Coord, value: &mut T) -> bool {
        let n = Self::coord_to_offset(xyz);
        match &self.slots[n] {
            Slot::Tile(v) => {
                *value = *v;
                self.value_mask.is_on(n)
            }
            Slot::Child(c) => c.probe_value(xyz, value),
        }
    }

    fn value_level(&self, xyz: Coord) -> u32 {
        let n = Self::coord_to_offset(xyz);
        match &self.slots[n] {
            Slot::Tile(_) => Self::LEVEL,
            Slot::Child(c) => c.value_level(xyz),
        }
    }

    fn set_value_on(&mut self, xyz: Coord, value: T) {
        let n = Self::coord_to_offset(xyz);
        if let Slot::Child(c) = &mut self.slots[n] {
            c.set_value_on(xyz, value);
            return;
        }
        let tile = self.tile_at(n);
        if !tile.active || tile.value != value {
            self.refine_tile(n).set_value_on(xyz, value);
        }
    }

    fn set_value_only(&mut self, xyz: Coord, value: T) {
        let n = Self::coord_to_offset(xyz);
        if let Slot::Child(c) = &mut self.slots[n] {
            c.set_value_only(xyz, value);
            return;
        }
        if self.tile_at(n).value != value {
            self.refine_tile(n).set_value_only(xyz, value);
        }
    }

    fn set_value_off(&mut self, xyz: Coord, value: T) {
        let n = Self::coord_to_offset(xyz);
        if let Slot::Child(c) = &mut self.slots[n] {
            c.set_value_off(xyz, value);
            return;
        }
        let tile = self.tile_at(n);
        if tile.active || tile.value != value {
            self.refine_tile(n).set_value_off(xyz, value);
        }
    }

    fn set_active_state(&mut self, xyz: Coord, on: bool) {
        let n = Self::coord_to_offset(xyz);
        if let Slot::Child(c) = &mut self.slots[n] {
            c.set_active_state(xyz, on);
            return;
        }
        if self.tile_at(n).active != on {
            self.refine_tile(n).set_active_state(xyz, on);
        }
    }

    fn set_value_on_min(&mut self, xyz: Coord, value: T) {
        let n = Self::coord_to_offset(xyz);
        if let Slot::Child(c) = &mut self.slots[n] {
            c.set_value_on_min(xyz, value);
            return;
        }
        let tile = self.tile_at(n);
        if !tile.active || tile.value > value {
            self.refine_tile(n).set_value_on_min(xyz, value);
        }
    }

    fn set_value_on_max(&mut self, xyz: Coord, value: T) {
        let n = Self::coord_to_offset(xyz);
        if let Slot::Child(c) = &mut self.slots[n] {
            c.set_value_on_max(xyz, value);
            return;
        }
        let tile = self.tile_at(n);
        if !tile.active || tile.value < value {
            self.refine_tile(n).set_value_on_max(xyz, value);
        }
    }

    fn set_value_on_sum(&mut self, xyz: Coord, addend: T) {
        let n = Self::coord_to_offset(xyz);
        if let Slot::Child(c) = &mut self.slots[n] {
            c.set_value_on_sum(xyz, addend);
            return;
        }
        let tile = self.tile_at(n);
        if !tile.active || addend != T::zero() {
            self.refine_tile(n).set_value_on_sum(xyz, addend);
        }
    }

    fn set_values_on(&mut self) {
        for n in 0..Self::NUM_SLOTS {
            match &mut self.slots[n] {
                Slot::Child(c) => c.set_values_on(),
                Slot::Tile(_) => self.value_mask.set_on(n),
            }
        }
    }

    fn fill(&mut self, bbox: &CoordBBox, value: T, active: bool) {
        let clipped = bbox.intersection(&self.bbox());
        if clipped.is_empty() {
            return;
        }
        let child_dim = 1i32 << C::TOTAL_LOG2;
        let mut x = clipped.min.x;
        while x <= clipped.max.x {
            let x_tile_max = (x & !(child_dim - 1)) + child_dim - 1;
            let mut y = clipped.min.y;
            while y <= clipped.max.y {
                let y_tile_max = (y & !(child_dim - 1)) + child_dim - 1;
                let mut z = clipped.min.z;
                while z <= clipped.max.z {
                    let xyz = Coord::new(x, y, z);
                    let tile_min = xyz.align_down(child_dim);
                    let tile_max =
                        tile_min.offset_by(child_dim - 1, child_dim - 1, child_dim - 1);
                    let n = Self::coord_to_offset(xyz);
                    if xyz == tile_min
                        && clipped.max.x >= tile_max.x
                        && clipped.max.y >= tile_max.y
                        && clipped.max.z >= tile_max.z
                    {
                        // The box covers this whole slot.
                        self.set_tile(n, value, active);
                    } else {
                        let sub =
                            CoordBBox::new(xyz, clipped.max.min_component(tile_max));
                        self.child_or_refine(n).fill(&sub, value, active);
                    }
                    z = tile_max.z + 1;
                }
                y = y_tile_max + 1;
            }
            x = x_tile_max + 1;
        }
    }

    fn first_value(&self) -> T {
        match &self.slots[0] {
            Slot::Tile(v) => *v,
            Slot::Child(c) => c.first_value(),
        }
    }

    fn last_value(&self) -> T {
        match &self.slots[Self::NUM_SLOTS - 1] {
            Slot::Tile(v) => *v,
            Slot::Child(c) => c.last_value(),
        }
    }

    fn leaf_count(&self) -> u64 {
        self.slots
            .iter()
            .map(|slot| match slot {
                Slot::Child(c) => c.leaf_count(),
                Slot::Tile(_) => 0,
            })
            .sum()
    }

    fn on_voxel_count(&self) -> u64 {
        let tiles = self.value_mask.count_on() as u64 * C::NUM_VOXELS;
        tiles
            + self
                .slots
                .iter()
                .map(|slot| match slot {
                    Slot::Child(c) => c.on_voxel_count(),
                    Slot::Tile(_) => 0,
                })
                .sum::<u64>()
    }

    fn is_inactive(&self) -> bool {
        if !self.value_mask.is_off() {
            return false;
        }
        self.slots.iter().all(|slot| match slot {
            Slot::Child(c) => c.is_inactive(),
            Slot::Tile(_) => true,
        })
    }

    fn has_active_tiles(&self) -> bool {
        if !self.value_mask.is_off() {
            return true;
        }
        self.slots.iter().any(|slot| match slot {
            Slot::Child(c) => c.has_active_tiles(),
            Slot::Tile(_) => false,
        })
    }

    fn eval_active_bbox(&self, bbox: &mut CoordBBox) {
        let child_dim = 1i32 << C::TOTAL_LOG2;
        for n in 0..Self::NUM_SLOTS {
            match &self.slots[n] {
                Slot::Child(c) => c.eval_active_bbox(bbox),
                Slot::Tile(_) => {
                    if self.value_mask.is_on(n) {
                        bbox.expand_cube(self.offset_to_origin(n), child_dim);
                    }
                }
            }
        }
    }

    fn touch_leaf(&mut self, xyz: Coord) -> &mut LeafNode<T> {
        let n = Self::coord_to_offset(xyz);
        self.child_or_refine(n).touch_leaf(xyz)
    }

    fn probe_leaf(&mut self, xyz: Coord) -> Option<&mut LeafNode<T>> {
        let n = Self::coord_to_offset(xyz);
        match &mut self.slots[n] {
            Slot::Child(c) => c.probe_leaf(xyz),
            Slot::Tile(_) => None,
        }
    }

    fn probe_const_leaf(&self, xyz: Coord) -> Option<&LeafNode<T>> {
        let n = Self::coord_to_offset(xyz);
        match &self.slots[n] {
            Slot::Child(c) => c.probe_const_leaf(xyz),
            Slot::Tile(_) => None,
        }
    }

    fn for_each_leaf_mut(&mut self, f: &mut dyn FnMut(&mut LeafNode<T>)) {
        for slot in self.slots.iter_mut() {
            if let Slot::Child(c) = slot {
                c.for_each_leaf_mut(f);
            }
        }
    }

    fn prune(&mut self, tolerance: T) -> Option<(T, bool)> {
        for n in 0..Self::NUM_SLOTS {
            let collapse = match &mut self.slots[n] {
                Slot::Child(c) => c.prune(tolerance),
                Slot::Tile(_) => None,
            };
            if let Some((value, active)) = collapse {
                self.set_tile(n, value, active);
            }
        }
        if !self.child_mask.is_off() {
            return None;
        }
        let first = self.tile_at(0);
        for n in 1..Self::NUM_SLOTS {
            let tile = self.tile_at(n);
            if tile.active != first.active || !tile.value.within_tolerance(first.value, tolerance)
            {
                return None;
            }
        }
        Some((first.value, first.active))
    }

    fn prune_inactive(&mut self, value: T) -> Option<(T, bool)> {
        for n in 0..Self::NUM_SLOTS {
            let collapse = match &mut self.slots[n] {
                Slot::Child(c) => c.prune_inactive(value),
                Slot::Tile(_) => None,
            };
            if let Some((v, a)) = collapse {
                self.set_tile(n, v, a);
            }
        }
        if self.child_mask.is_off() && self.value_mask.is_off() {
            Some((value, false))
        } else {
            None
        }
    }

    fn prune_level_set(&mut self, outside: T) -> Option<(T, bool)> {
        for n in 0..Self::NUM_SLOTS {
            let collapse = match &mut self.slots[n] {
                Slot::Child(c) => c.prune_level_set(outside),
                Slot::Tile(_) => None,
            };
            if let Some((v, a)) = collapse {
                self.set_tile(n, v, a);
            }
        }
        if !self.child_mask.is_off() || !self.value_mask.is_off() {
            return None;
        }
        let first = self.tile_at(0);
        for n in 1..Self::NUM_SLOTS {
            if !self.tile_at(n).value.approx_eq(first.value) {
                return None;
            }
        }
        Some((first.value, false))
    }

    fn signed_flood_fill(&mut self, outside: T, inside: T) {
        for slot in self.slots.iter_mut() {
            if let Slot::Child(c) = slot {
                c.signed_flood_fill(outside, inside);
            }
        }
        // Scan at slot granularity; sign transitions are taken from the
        // child subtrees' boundary values.
        let first = match self.child_mask.first_on() {
            Some(n) => n,
            None => return,
        };
        let fan = 1usize << Self::LOG2DIM;
        let mut x_inside = self.expect_child(first).first_value().is_negative();
        for x in 0..fan {
            let x00 = x << (2 * Self::LOG2DIM);
            if self.child_mask.is_on(x00) {
                x_inside = self.expect_child(x00).last_value().is_negative();
            }
            let mut y_inside = x_inside;
            for y in 0..fan {
                let xy0 = x00 + (y << Self::LOG2DIM);
                if self.child_mask.is_on(xy0) {
                    y_inside = self.expect_child(xy0).last_value().is_negative();
                }
                let mut z_inside = y_inside;
                for z in 0..fan {
                    let xyz = xy0 + z;
                    if self.child_mask.is_on(xyz) {
                        z_inside = self.expect_child(xyz).last_value().is_negative();
                    } else if !self.value_mask.is_on(xyz) {
                        let fill = if z_inside { inside } else { outside };
                        self.set_tile(xyz, fill, false);
                    }
                }
            }
        }
    }

    fn voxelize_active_tiles(&mut self) {
        for n in 0..Self::NUM_SLOTS {
            if !self.child_mask.is_on(n) && self.value_mask.is_on(n) {
                let tile = self.tile_at(n);
                let origin = self.offset_to_origin(n);
                self.set_child(n, Box::new(C::new(origin, tile.value, true)));
            }
            if let Slot::Child(c) = &mut self.slots[n] {
                c.voxelize_active_tiles();
            }
        }
    }

    fn reset_background(&mut self, old: T, new: T) {
        for n in 0..Self::NUM_SLOTS {
            match &mut self.slots[n] {
                Slot::Child(c) => c.reset_background(old, new),
                Slot::Tile(v) => {
                    if !self.value_mask.is_on(n) {
                        if v.approx_eq(old) {
                            *v = new;
                        } else if v.approx_eq(old.negated()) {
                            *v = new.negated();
                        }
                    }
                }
            }
        }
    }

    fn merge(&mut self, other: Self, other_background: T, background: T) {
        let other_value_mask = other.value_mask;
        for (n, slot) in other.slots.into_iter().enumerate() {
            match slot {
                Slot::Child(oc) => {
                    if self.child_mask.is_on(n) {
                        self.expect_child_mut(n)
                            .merge(*oc, other_background, background);
                    } else {
                        self.set_child(n, oc);
                    }
                }
                Slot::Tile(value) => {
                    // Only other's active tiles contribute, and only over
                    // this node's inactive tiles.
                    if other_value_mask.is_on(n)
                        && !self.child_mask.is_on(n)
                        && !self.value_mask.is_on(n)
                    {
                        self.set_tile(n, value, true);
                    }
                }
            }
        }
    }

    fn topology_union(&mut self, other: &Self) {
        for n in 0..Self::NUM_SLOTS {
            match &other.slots[n] {
                Slot::Child(oc) => {
                    if self.child_mask.is_on(n) {
                        self.expect_child_mut(n).topology_union(oc);
                    } else {
                        let tile = self.tile_at(n);
                        let mut child = C::topology_copy_from(oc, tile.value);
                        if tile.active {
                            child.set_values_on();
                        }
                        self.set_child(n, Box::new(child));
                    }
                }
                Slot::Tile(_) => {
                    if other.value_mask.is_on(n) {
                        if self.child_mask.is_on(n) {
                            self.expect_child_mut(n).set_values_on();
                        } else {
                            self.value_mask.set_on(n);
                        }
                    }
                }
            }
        }
    }

    fn has_same_topology(&self, other: &Self) -> bool {
        if self.child_mask != other.child_mask || self.value_mask != other.value_mask {
            return false;
        }
        for n in 0..Self::NUM_SLOTS {
            if let (Slot::Child(a), Slot::Child(b)) = (&self.slots[n], &other.slots[n]) {
                if !a.has_same_topology(b) {
                    return false;
                }
            }
        }
        true
    }

    fn combine<F>(&mut self, other: Self, op: &mut F)
    where
        F: FnMut(T, bool, T, bool) -> (T, bool),
    {
        let other_value_mask = other.value_mask;
        for (n, slot) in other.slots.into_iter().enumerate() {
            match slot {
                Slot::Tile(value) => {
                    let active = other_value_mask.is_on(n);
                    if self.child_mask.is_on(n) {
                        self.expect_child_mut(n)
                            .combine_with_tile(value, active, false, op);
                    } else {
                        let mine = self.tile_at(n);
                        let (v, on) = op(mine.value, mine.active, value, active);
                        self.set_tile(n, v, on);
                    }
                }
                Slot::Child(mut oc) => {
                    if self.child_mask.is_on(n) {
                        self.expect_child_mut(n).combine(*oc, op);
                    } else {
                        // This side is constant; combine it into the other
                        // child with swapped argument order, then adopt it.
                        let mine = self.tile_at(n);
                        oc.combine_with_tile(mine.value, mine.active, true, op);
                        self.set_child(n, oc);
                    }
                }
            }
        }
    }

    fn combine_with_tile<F>(&mut self, value: T, active: bool, tile_is_a: bool, op: &mut F)
    where
        F: FnMut(T, bool, T, bool) -> (T, bool),
    {
        for n in 0..Self::NUM_SLOTS {
            if self.child_mask.is_on(n) {
                self.expect_child_mut(n)
                    .combine_with_tile(value, active, tile_is_a, op);
            } else {
                let mine = self.tile_at(n);
                let (v, on) = if tile_is_a {
                    op(value, active, mine.value, mine.active)
                } else {
                    op(mine.value, mine.active, value, active)
                };
                self.set_tile(n, v, on);
            }
        }
    }

    fn combine2<F>(a: &Self, b: &Self, op: &mut F) -> Self
    where
        F: FnMut(T, bool, T, bool) -> (T, bool),
    {
        let mut out = Self::new(a.origin, T::default(), false);
        for n in 0..Self::NUM_SLOTS {
            match (&a.slots[n], &b.slots[n]) {
                (Slot::Tile(av), Slot::Tile(bv)) => {
                    let (v, on) = op(*av, a.value_mask.is_on(n), *bv, b.value_mask.is_on(n));
                    out.set_tile(n, v, on);
                }
                (Slot::Child(ac), Slot::Tile(bv)) => {
                    let child =
                        C::combine2_with_tile(ac, *bv, b.value_mask.is_on(n), false, op);
                    out.set_child(n, Box::new(child));
                }
                (Slot::Tile(av), Slot::Child(bc)) => {
                    let child =
                        C::combine2_with_tile(bc, *av, a.value_mask.is_on(n), true, op);
                    out.set_child(n, Box::new(child));
                }
                (Slot::Child(ac), Slot::Child(bc)) => {
                    out.set_child(n, Box::new(C::combine2(ac, bc, op)));
                }
            }
        }
        out
    }

    fn combine2_with_tile<F>(child: &Self, value: T, active: bool, tile_is_a: bool, op: &mut F) -> Self
    where
        F: FnMut(T, bool, T, bool) -> (T, bool),
    {
        let mut out = Self::new(child.origin, T::default(), false);
        for n in 0..Self::NUM_SLOTS {
            match &child.slots[n] {
                Slot::Tile(cv) => {
                    let c_active = child.value_mask.is_on(n);
                    let (v, on) = if tile_is_a {
                        op(value, active, *cv, c_active)
                    } else {
                        op(*cv, c_active, value, active)
                    };
                    out.set_tile(n, v, on);
                }
                Slot::Child(cc) => {
                    let sub = C::combine2_with_tile(cc, value, active, tile_is_a, op);
                    out.set_child(n, Box::new(sub));
                }
            }
        }
        out
    }

    fn write_topology<Wr: Write>(&self, writer: &mut Wr) -> std::io::Result<()> {
        self.child_mask.save(writer)?;
        self.value_mask.save(writer)?;
        for n in 0..Self::NUM_SLOTS {
            if let Slot::Tile(v) = &self.slots[n] {
                v.write_as_be(writer)?;
            }
        }
        for n in 0..Self::NUM_SLOTS {
            if let Slot::Child(c) = &self.slots[n] {
                c.write_topology(writer)?;
            }
        }
        Ok(())
    }

    fn read_topology<R: Read>(reader: &mut R, origin: Coord, background: T) -> std::io::Result<Self> {
        let child_mask = NodeMask::<W>::load(reader)?;
        let value_mask = NodeMask::<W>::load(reader)?;
        let mut node = Self::new(origin, background, false);
        for n in 0..Self::NUM_SLOTS {
            if !child_mask.is_on(n) {
                let value = T::read_from_be(reader)?;
                node.set_tile(n, value, value_mask.is_on(n));
            }
        }
        for n in 0..Self::NUM_SLOTS {
            if child_mask.is_on(n) {
                let child_origin = node.offset_to_origin(n);
                let child = C::read_topology(reader, child_origin, background)?;
                node.set_child(n, Box::new(child));
            }
        }
        Ok(node)
    }

    fn write_buffers<Wr: Write>(&self, writer: &mut Wr) -> std::io::Result<()> {
        for slot in self.slots.iter() {
            if let Slot::Child(c) = slot {
                c.write_buffers(writer)?;
            }
        }
        Ok(())
    }

    fn read_buffers<R: Read>(&mut self, reader: &mut R) -> std::io::Result<()> {
        for slot in self.slots.iter_mut() {
            if let Slot::Child(c) = slot {
                c.read_buffers(reader)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets() {
        assert_eq!(Internal1::<f32>::DIM, 128);
        assert_eq!(Internal2::<f32>::DIM, 4096);
        assert_eq!(Internal1::<f32>::NUM_SLOTS, 4096);
        assert_eq!(Internal2::<f32>::NUM_SLOTS, 32768);
        assert_eq!(<Internal2<f32> as TreeNode<f32>>::LEVEL, 2);

        // (5, 10, 20) falls in leaf slot (0, 1, 2) of the first Internal1.
        let n = Internal1::<f32>::coord_to_offset(Coord::new(5, 10, 20));
        assert_eq!(n, (1 << 4) | 2);
        let node = Internal1::<f32>::new(Coord::ZERO, 0.0, false);
        assert_eq!(node.offset_to_origin(n), Coord::new(0, 8, 16));
    }

    #[test]
    fn test_refine_on_write() {
        let mut node = Internal1::<f32>::new(Coord::ZERO, 5.0, false);
        assert!(node.child_mask().is_off());
        node.set_value_on(Coord::new(5, 10, 20), 10.0);
        assert_eq!(node.child_mask().count_on(), 1);
        assert_eq!(node.get_value(Coord::new(5, 10, 20)), 10.0);
        // The rest of the refined leaf keeps the tile value, inactive.
        assert_eq!(node.get_value(Coord::new(5, 10, 21)), 5.0);
        assert!(!node.is_value_on(Coord::new(5, 10, 21)));
        assert_eq!(node.on_voxel_count(), 1);
        // Writes into sibling tiles leave them alone.
        assert_eq!(node.get_value(Coord::new(100, 0, 0)), 5.0);
    }

    #[test]
    fn test_write_on_matching_active_tile_is_noop() {
        let mut node = Internal1::<f32>::new(Coord::ZERO, 7.0, true);
        node.set_value_on(Coord::new(1, 2, 3), 7.0);
        assert!(node.child_mask().is_off());
    }

    #[test]
    fn test_fill_tiles_and_partials() {
        let mut node = Internal1::<f32>::new(Coord::ZERO, 0.0, false);
        // One full slot (8^3) plus a partial 4-wide slab of the next slot.
        node.fill(
            &CoordBBox::new(Coord::ZERO, Coord::new(11, 7, 7)),
            1.0,
            true,
        );
        assert_eq!(node.on_voxel_count(), 512 + 4 * 64);
        // The fully covered slot stays a tile.
        assert!(!node.child_mask().is_on(Internal1::<f32>::coord_to_offset(Coord::ZERO)));
        assert!(node
            .child_mask()
            .is_on(Internal1::<f32>::coord_to_offset(Coord::new(8, 0, 0))));
    }

    #[test]
    fn test_prune_collapses_uniform() {
        let mut node = Internal1::<f32>::new(Coord::ZERO, 0.0, false);
        node.fill(
            &CoordBBox::new(Coord::ZERO, Coord::new(15, 15, 15)),
            1.0,
            true,
        );
        assert!(node.prune(0.0).is_none());
        // Undo the fill and the node is uniform again.
        node.fill(
            &CoordBBox::new(Coord::ZERO, Coord::new(15, 15, 15)),
            0.0,
            false,
        );
        assert_eq!(node.prune(0.0), Some((0.0, false)));
    }

    #[test]
    fn test_voxelize_active_tiles() {
        let mut node = Internal1::<f32>::new(Coord::ZERO, 0.0, false);
        node.set_tile(Internal1::<f32>::coord_to_offset(Coord::ZERO), 3.0, true);
        node.voxelize_active_tiles();
        let leaf = node.probe_const_leaf(Coord::ZERO).unwrap();
        assert_eq!(leaf.on_voxel_count(), 512);
        assert_eq!(leaf.get_value(Coord::new(3, 3, 3)), 3.0);
        assert_eq!(node.on_voxel_count(), 512);
    }

    #[test]
    fn test_topology_union_monotone() {
        let mut a = Internal1::<f32>::new(Coord::ZERO, 0.0, false);
        let mut b = Internal1::<f32>::new(Coord::ZERO, 9.0, false);
        a.set_value_on(Coord::new(1, 1, 1), 1.0);
        b.set_value_on(Coord::new(1, 1, 2), 2.0);
        b.set_tile(Internal1::<f32>::coord_to_offset(Coord::new(8, 0, 0)), 9.0, true);
        a.topology_union(&b);
        assert!(a.is_value_on(Coord::new(1, 1, 1)));
        assert!(a.is_value_on(Coord::new(1, 1, 2)));
        assert!(a.is_value_on(Coord::new(9, 1, 1)));
        // Values on the a side are untouched.
        assert_eq!(a.get_value(Coord::new(1, 1, 2)), 0.0);
    }

    #[test]
    fn test_combine2_max() {
        let mut a = Internal1::<f32>::new(Coord::ZERO, 0.0, false);
        let mut b = Internal1::<f32>::new(Coord::ZERO, 0.0, false);
        a.set_value_on(Coord::new(0, 0, 0), 1.0);
        b.set_value_on(Coord::new(0, 0, 0), 2.0);
        b.set_value_on(Coord::new(0, 0, 1), -1.0);
        let mut op = |av: f32, aon: bool, bv: f32, bon: bool| (av.max(bv), aon | bon);
        let out = Internal1::combine2(&a, &b, &mut op);
        assert_eq!(out.get_value(Coord::new(0, 0, 0)), 2.0);
        assert_eq!(out.get_value(Coord::new(0, 0, 1)), 0.0);
        assert!(out.is_value_on(Coord::new(0, 0, 1)));
    }
}
