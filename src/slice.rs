use std::sync::Arc;

use casey::snake;
use derive_more::{Deref, DerefMut, Display, From, Into};
use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::shape::ShapeError;

/// A strided index range along one dimension. `stop` is exclusive; `step` may be negative, in
/// which case the range walks down from `start` and `stop` may be `-1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("{start}:{stop}:{step}")]
pub struct Range {
    pub start: isize,
    pub stop: isize,
    pub step: isize,
}

impl Range {
    #[inline]
    pub const fn new(start: isize, stop: isize, step: isize) -> Self {
        Self { start, stop, step }
    }

    /// The whole of a dimension of `extent`.
    #[inline]
    pub const fn full(extent: usize) -> Self {
        Self::new(0, extent as isize, 1)
    }

    /// Number of indices this range selects, ignoring bounds.
    #[inline]
    pub fn len(&self) -> usize {
        let distance = (self.stop - self.start).unsigned_abs();
        let step = self.step.unsigned_abs();
        distance.div_ceil(step.max(1))
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks the range against a dimension of `extent`.
    pub fn check(&self, dim: usize, extent: usize) -> Result<(), ShapeError> {
        let extent_ = extent as isize;
        let Self { start, stop, step } = *self;
        let valid = match step {
            0 => false,
            step if step > 0 => 0 <= start && start < stop && stop <= extent_,
            _ => -1 <= stop && stop < start && start < extent_,
        };
        match valid {
            true => Ok(()),
            false => Err(ShapeError::Bounds {
                dim,
                range: *self,
                extent,
            }),
        }
    }
}

impl From<std::ops::Range<usize>> for Range {
    #[inline]
    fn from(value: std::ops::Range<usize>) -> Self {
        Self::new(value.start as isize, value.end as isize, 1)
    }
}

/// One entry of a [`Slice`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Axis {
    #[default]
    #[display("..")]
    Full,
    /// A single index; the dimension is kept with extent 1.
    #[display("{_0}")]
    One(usize),
    #[display("{_0}")]
    Range(Range),
}

impl From<usize> for Axis {
    #[inline]
    fn from(value: usize) -> Self {
        Self::One(value)
    }
}

impl From<std::ops::RangeFull> for Axis {
    #[inline]
    fn from(_: std::ops::RangeFull) -> Self {
        Self::Full
    }
}

impl From<std::ops::Range<usize>> for Axis {
    #[inline]
    fn from(value: std::ops::Range<usize>) -> Self {
        Self::Range(value.into())
    }
}

impl From<Range> for Axis {
    #[inline]
    fn from(value: Range) -> Self {
        Self::Range(value)
    }
}

impl Axis {
    /// Resolves the axis against a dimension of `extent`.
    #[inline]
    pub fn resolve(self, extent: usize) -> Range {
        match self {
            Axis::Full => Range::full(extent),
            Axis::One(index) => Range::new(index as isize, index as isize + 1, 1),
            Axis::Range(range) => range,
        }
    }
}

/// Per-dimension selection used by [`crate::array::Array::slice`].
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Deref, DerefMut, From, Into, Display)]
#[display("[{}]", _0.iter().format(", "))]
pub struct Slice(Arc<[Axis]>);

impl From<Vec<Axis>> for Slice {
    #[inline]
    fn from(value: Vec<Axis>) -> Self {
        Self(value.into())
    }
}

impl From<Vec<Range>> for Slice {
    #[inline]
    fn from(value: Vec<Range>) -> Self {
        Self(value.into_iter().map(Axis::Range).collect())
    }
}

impl From<&[Range]> for Slice {
    #[inline]
    fn from(value: &[Range]) -> Self {
        Self(value.iter().copied().map(Axis::Range).collect())
    }
}

macro_rules! impl_slice_from {
    ($t:ident) => {
        impl<$t: Into<Axis>> From<$t> for Slice {
            #[inline]
            fn from(snake!($t): $t) -> Self {
                Self([snake!($t).into()].into())
            }
        }
    };
    ($($t:ident),+) => {
        impl<$($t),+> From<($($t),+)> for Slice
        where
            $($t: Into<Axis>),+
        {
            #[inline]
            fn from(($(snake!($t)),+): ($($t),+)) -> Self {
                Self([$(snake!($t).into()),+].into())
            }
        }
    };
}

impl_slice_from!(T0);
impl_slice_from!(T0, T1);
impl_slice_from!(T0, T1, T2);
impl_slice_from!(T0, T1, T2, T3);
impl_slice_from!(T0, T1, T2, T3, T4);
impl_slice_from!(T0, T1, T2, T3, T4, T5);

impl Slice {
    /// Resolves every axis into a [`Range`] against `view`.
    pub fn resolve(&self, view: &[usize]) -> Result<Vec<Range>, ShapeError> {
        if self.len() != view.len() {
            return Err(ShapeError::SliceRank {
                expected: view.len(),
                got: self.len(),
            });
        }
        Ok(self
            .iter()
            .zip_eq(view)
            .map(|(&axis, &extent)| axis.resolve(extent))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::{Axis, Range, Slice};

    #[test]
    fn test_range_len() {
        assert_eq!(Range::new(0, 4, 1).len(), 4);
        assert_eq!(Range::new(0, 5, 2).len(), 3);
        assert_eq!(Range::new(3, -1, -1).len(), 4);
        assert_eq!(Range::new(4, 0, -3).len(), 2);
    }

    #[test]
    fn test_range_check() {
        assert!(Range::new(0, 4, 1).check(0, 4).is_ok());
        assert!(Range::new(3, -1, -1).check(0, 4).is_ok());
        assert!(Range::new(0, 5, 1).check(0, 4).is_err());
        assert!(Range::new(0, 4, 0).check(0, 4).is_err());
        assert!(Range::new(0, 4, -1).check(0, 4).is_err());
        assert!(Range::new(2, 2, 1).check(0, 4).is_err());
        assert!(Range::new(4, 0, -1).check(0, 4).is_err());
    }

    #[test]
    fn test_resolve() -> Result<(), Box<dyn Error>> {
        let slice = Slice::from((.., 1usize, 2usize..4));
        assert_eq!(slice[0], Axis::Full);
        assert_eq!(slice.to_string(), "[.., 1, 2:4:1]");

        let ranges = slice.resolve(&[3, 4, 5])?;
        assert_eq!(
            ranges,
            vec![Range::new(0, 3, 1), Range::new(1, 2, 1), Range::new(2, 4, 1)]
        );
        assert!(slice.resolve(&[3, 4]).is_err());
        Ok(())
    }
}
