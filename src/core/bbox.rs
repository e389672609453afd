use std::fmt;

use super::Coord;

/// Inclusive axis-aligned box of voxel coordinates.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CoordBBox {
    pub min: Coord,
    pub max: Coord,
}

impl CoordBBox {
    #[inline(always)]
    pub const fn new(min: Coord, max: Coord) -> Self {
        Self { min, max }
    }

    /// The empty box; any intersection with it is empty and any expansion
    /// replaces it.
    #[inline(always)]
    pub const fn empty() -> Self {
        Self {
            min: Coord::MAX,
            max: Coord::MIN,
        }
    }

    #[inline(always)]
    pub const fn from_coord(c: Coord) -> Self {
        Self { min: c, max: c }
    }

    /// The cube with minimum corner `origin` and side length `dim`.
    #[inline(always)]
    pub const fn cube(origin: Coord, dim: i32) -> Self {
        Self {
            min: origin,
            max: Coord::new(origin.x + dim - 1, origin.y + dim - 1, origin.z + dim - 1),
        }
    }

    #[inline(always)]
    pub const fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    #[inline(always)]
    pub const fn contains(&self, c: Coord) -> bool {
        c.x >= self.min.x
            && c.x <= self.max.x
            && c.y >= self.min.y
            && c.y <= self.max.y
            && c.z >= self.min.z
            && c.z <= self.max.z
    }

    /// Grows the box to include `c`.
    #[inline]
    pub fn expand(&mut self, c: Coord) {
        self.min = self.min.min_component(c);
        self.max = self.max.max_component(c);
    }

    /// Grows the box to include the cube at `origin` with side `dim`.
    #[inline]
    pub fn expand_cube(&mut self, origin: Coord, dim: i32) {
        self.min = self.min.min_component(origin);
        self.max = self
            .max
            .max_component(origin.offset_by(dim - 1, dim - 1, dim - 1));
    }

    #[inline]
    pub fn intersection(&self, other: &Self) -> Self {
        Self {
            min: self.min.max_component(other.min),
            max: self.max.min_component(other.max),
        }
    }

    pub fn volume(&self) -> u64 {
        if self.is_empty() {
            return 0;
        }
        let dx = (self.max.x - self.min.x) as u64 + 1;
        let dy = (self.max.y - self.min.y) as u64 + 1;
        let dz = (self.max.z - self.min.z) as u64 + 1;
        dx * dy * dz
    }

    /// Iterates every coordinate in the box, x outermost and z innermost.
    pub fn iter(&self) -> impl Iterator<Item = Coord> + '_ {
        let min = self.min;
        let max = self.max;
        (min.x..=max.x).flat_map(move |x| {
            (min.y..=max.y).flat_map(move |y| (min.z..=max.z).map(move |z| Coord::new(x, y, z)))
        })
    }
}

impl fmt::Debug for CoordBBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?} -> {:?}]", self.min, self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cube() {
        let b = CoordBBox::cube(Coord::new(8, 8, 8), 8);
        assert_eq!(b.max, Coord::new(15, 15, 15));
        assert!(b.contains(Coord::new(8, 15, 10)));
        assert!(!b.contains(Coord::new(16, 8, 8)));
        assert_eq!(b.volume(), 512);
    }

    #[test]
    fn test_intersection() {
        let a = CoordBBox::new(Coord::ZERO, Coord::splat(15));
        let b = CoordBBox::new(Coord::splat(8), Coord::splat(31));
        let c = a.intersection(&b);
        assert_eq!(c, CoordBBox::new(Coord::splat(8), Coord::splat(15)));

        let d = CoordBBox::new(Coord::splat(16), Coord::splat(31));
        assert!(a.intersection(&d).is_empty());
    }

    #[test]
    fn test_empty_expand() {
        let mut b = CoordBBox::empty();
        assert!(b.is_empty());
        b.expand(Coord::new(1, 2, 3));
        assert_eq!(b, CoordBBox::from_coord(Coord::new(1, 2, 3)));
        b.expand_cube(Coord::new(-8, 0, 0), 8);
        assert_eq!(b.min, Coord::new(-8, 0, 0));
        assert_eq!(b.max, Coord::new(1, 2, 3));
    }

    #[test]
    fn test_iter_order() {
        let b = CoordBBox::new(Coord::ZERO, Coord::new(0, 1, 1));
        let v: Vec<Coord> = b.iter().collect();
        assert_eq!(
            v,
            vec![
                Coord::new(0, 0, 0),
                Coord::new(0, 0, 1),
                Coord::new(0, 1, 0),
                Coord::new(0, 1, 1),
            ]
        );
    }
}
