use std::fmt::{Debug, Display};

/// Fixed-width conversion between a value and its byte representation,
/// used by the topology and buffer streams.
pub trait ByteConversion: Sized {
    type ByteArray: AsRef<[u8]> + AsMut<[u8]> + Default;

    fn to_be_bytes(&self) -> Self::ByteArray;
    fn to_le_bytes(&self) -> Self::ByteArray;
    fn from_be_bytes(bytes: Self::ByteArray) -> Self;
    fn from_le_bytes(bytes: Self::ByteArray) -> Self;

    fn read_from_be<R: std::io::Read>(reader: &mut R) -> std::io::Result<Self> {
        let mut bytes = Self::ByteArray::default();
        reader.read_exact(bytes.as_mut())?;
        Ok(Self::from_be_bytes(bytes))
    }

    fn read_from_le<R: std::io::Read>(reader: &mut R) -> std::io::Result<Self> {
        let mut bytes = Self::ByteArray::default();
        reader.read_exact(bytes.as_mut())?;
        Ok(Self::from_le_bytes(bytes))
    }

    fn write_as_be<W: std::io::Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(self.to_be_bytes().as_ref())
    }

    fn write_as_le<W: std::io::Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(self.to_le_bytes().as_ref())
    }
}

/// Contract for tree value types.
///
/// The tree needs a zero, negation and sign (signed flood fill), exact and
/// approximate equality (background bookkeeping), tolerance comparison
/// (pruning), a total-enough ordering (`set_value_on_min`/`max`) and a sum
/// (`set_value_on_sum`). For `bool` the ordering makes min an AND and max
/// an OR, and sum is an OR.
pub trait VoxelValue:
    Default + Copy + Clone + PartialEq + PartialOrd + Display + Debug + ByteConversion
{
    fn zero() -> Self;
    fn negated(self) -> Self;
    fn approx_eq(self, other: Self) -> bool;
    fn within_tolerance(self, other: Self, tolerance: Self) -> bool;
    fn sum(self, other: Self) -> Self;

    #[inline(always)]
    fn is_negative(self) -> bool {
        self < Self::zero()
    }
}

macro_rules! impl_byte_conversion {
    ($($t:ty),+) => {
        $(
            impl ByteConversion for $t {
                type ByteArray = [u8; std::mem::size_of::<Self>()];

                #[inline(always)]
                fn to_be_bytes(&self) -> Self::ByteArray {
                    <$t>::to_be_bytes(*self)
                }

                #[inline(always)]
                fn to_le_bytes(&self) -> Self::ByteArray {
                    <$t>::to_le_bytes(*self)
                }

                #[inline(always)]
                fn from_be_bytes(bytes: Self::ByteArray) -> Self {
                    <$t>::from_be_bytes(bytes)
                }

                #[inline(always)]
                fn from_le_bytes(bytes: Self::ByteArray) -> Self {
                    <$t>::from_le_bytes(bytes)
                }
            }
        )+
    };
}

impl_byte_conversion!(i32, i64, f32, f64);

impl ByteConversion for bool {
    type ByteArray = [u8; 1];

    #[inline(always)]
    fn to_be_bytes(&self) -> Self::ByteArray {
        [*self as u8]
    }

    #[inline(always)]
    fn to_le_bytes(&self) -> Self::ByteArray {
        [*self as u8]
    }

    #[inline(always)]
    fn from_be_bytes(bytes: Self::ByteArray) -> Self {
        bytes[0] != 0
    }

    #[inline(always)]
    fn from_le_bytes(bytes: Self::ByteArray) -> Self {
        bytes[0] != 0
    }
}

macro_rules! impl_float_voxel {
    ($($t:ty => $eps:expr),+) => {
        $(
            impl VoxelValue for $t {
                #[inline(always)]
                fn zero() -> Self {
                    0.0
                }

                #[inline(always)]
                fn negated(self) -> Self {
                    -self
                }

                #[inline(always)]
                fn approx_eq(self, other: Self) -> bool {
                    (self - other).abs() <= $eps
                }

                #[inline(always)]
                fn within_tolerance(self, other: Self, tolerance: Self) -> bool {
                    (self - other).abs() <= tolerance
                }

                #[inline(always)]
                fn sum(self, other: Self) -> Self {
                    self + other
                }
            }
        )+
    };
}

macro_rules! impl_int_voxel {
    ($($t:ty),+) => {
        $(
            impl VoxelValue for $t {
                #[inline(always)]
                fn zero() -> Self {
                    0
                }

                #[inline(always)]
                fn negated(self) -> Self {
                    -self
                }

                #[inline(always)]
                fn approx_eq(self, other: Self) -> bool {
                    self == other
                }

                #[inline(always)]
                fn within_tolerance(self, other: Self, tolerance: Self) -> bool {
                    (self - other).abs() <= tolerance
                }

                #[inline(always)]
                fn sum(self, other: Self) -> Self {
                    self + other
                }
            }
        )+
    };
}

impl_float_voxel!(f32 => 1e-6, f64 => 1e-12);
impl_int_voxel!(i32, i64);

impl VoxelValue for bool {
    #[inline(always)]
    fn zero() -> Self {
        false
    }

    #[inline(always)]
    fn negated(self) -> Self {
        !self
    }

    #[inline(always)]
    fn approx_eq(self, other: Self) -> bool {
        self == other
    }

    #[inline(always)]
    fn within_tolerance(self, other: Self, _tolerance: Self) -> bool {
        self == other
    }

    #[inline(always)]
    fn sum(self, other: Self) -> Self {
        self | other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_round_trip() {
        let v = 0.234f32;
        assert_eq!(f32::from_be_bytes(ByteConversion::to_be_bytes(&v)), v);
        let mut buf = Vec::new();
        v.write_as_be(&mut buf).unwrap();
        assert_eq!(buf.len(), 4);
        assert_eq!(f32::read_from_be(&mut buf.as_slice()).unwrap(), v);
    }

    #[test]
    fn test_float_comparisons() {
        assert!(2.0f32.approx_eq(2.0 + 1e-8));
        assert!(!2.0f32.approx_eq(2.1));
        assert!(1.0f32.within_tolerance(1.4, 0.5));
        assert!(!1.0f32.within_tolerance(1.6, 0.5));
        assert!((-2.0f32).is_negative());
        assert!(!2.0f32.is_negative());
        assert_eq!(2.0f32.negated(), -2.0);
    }

    #[test]
    fn test_bool_semantics() {
        assert_eq!(bool::zero(), false);
        assert_eq!(true.negated(), false);
        assert_eq!(false.sum(true), true);
        // PartialOrd makes min an AND and max an OR.
        assert!(false < true);
    }
}
