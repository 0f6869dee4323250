use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::slice::Range;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShapeError {
    #[error("shape error: view must have at least one dimension")]
    Empty,
    #[error("shape error: view {0:?} contains a zero-sized dimension")]
    ZeroSized(Vec<usize>),
    #[error("shape error: view {0:?} and stride {1:?} differ in rank")]
    Rank(Vec<usize>, Vec<isize>),
    #[error("shape error: {0} is not broadcastable with {1}")]
    Broadcast(Shape, Shape),
    #[error("shape error: {0} is not broadcastable to {1:?}")]
    BroadcastTo(Shape, Vec<usize>),
    #[error("shape error: {0} and {1} are not compatible for matmul")]
    Matmul(Shape, Shape),
    #[error("bounds error: range {range} is out of bounds for dimension {dim} of extent {extent}")]
    Bounds {
        dim: usize,
        range: Range,
        extent: usize,
    },
    #[error("shape error: expected {expected} ranges, got {got}")]
    SliceRank { expected: usize, got: usize },
    #[error("shape error: {0:?} is not a permutation of 0..{1}")]
    Permute(Vec<usize>, usize),
    #[error("bounds error: dimension {dim} is out of range for rank {rank}")]
    Dim { dim: usize, rank: usize },
    #[error("shape error: cannot reshape {0} into {1:?}")]
    Reshape(Shape, Vec<usize>),
    #[error("shape error: cannot reshape non-contiguous {0} without a copy")]
    NonContiguous(Shape),
    #[error("shape error: {0} maps several elements onto one and cannot be written through")]
    Overlap(Shape),
    #[error("shape error: slice of {view:?} has view {expected:?}, got {got:?}")]
    Unslice {
        view: Vec<usize>,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
}

/// Logical layout of an array over a flat buffer: an element offset, the extent of each
/// dimension (the view) and the element step of each dimension (the stride).
///
/// A zero stride makes several logical indices alias one physical element, which is how
/// broadcasting avoids copies. Negative strides come from slices with a negative step.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Shape {
    offset: usize,
    view: Vec<usize>,
    stride: Vec<isize>,
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.view.iter().format(", "))?;
        if !self.is_contiguous() || self.offset != 0 {
            write!(f, ":[{}]+{}", self.stride.iter().format(", "), self.offset)?;
        }
        Ok(())
    }
}

impl Shape {
    /// Creates a contiguous, zero-offset shape.
    pub fn new(view: impl Into<Vec<usize>>) -> Result<Self, ShapeError> {
        let view = view.into();
        Self::check_view(&view)?;
        let stride = Self::contiguous_stride(&view);
        Ok(Self {
            offset: 0,
            view,
            stride,
        })
    }

    /// Creates an arbitrary view over a buffer.
    pub fn from_parts(
        offset: usize,
        view: impl Into<Vec<usize>>,
        stride: impl Into<Vec<isize>>,
    ) -> Result<Self, ShapeError> {
        let view = view.into();
        let stride = stride.into();
        Self::check_view(&view)?;
        if view.len() != stride.len() {
            return Err(ShapeError::Rank(view, stride));
        }
        Ok(Self {
            offset,
            view,
            stride,
        })
    }

    fn check_view(view: &[usize]) -> Result<(), ShapeError> {
        if view.is_empty() {
            return Err(ShapeError::Empty);
        }
        if view.contains(&0) {
            return Err(ShapeError::ZeroSized(view.to_vec()));
        }
        Ok(())
    }

    /// Row-major strides of `view`, rightmost dimension fastest.
    pub fn contiguous_stride(view: &[usize]) -> Vec<isize> {
        let mut stride = vec![0; view.len()];
        let mut step = 1isize;
        for (s, &v) in stride.iter_mut().zip(view).rev() {
            *s = step;
            step *= v as isize;
        }
        stride
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn view(&self) -> &[usize] {
        &self.view
    }

    #[inline]
    pub fn stride(&self) -> &[isize] {
        &self.stride
    }

    /// Number of dimensions.
    #[inline]
    pub fn len(&self) -> usize {
        self.view.len()
    }

    /// Always `false`; a shape has at least one dimension.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.view.is_empty()
    }

    /// Number of logical elements.
    #[inline]
    pub fn size(&self) -> usize {
        self.view.iter().product()
    }

    #[inline]
    pub fn is_contiguous(&self) -> bool {
        self.stride == Self::contiguous_stride(&self.view)
    }

    /// Returns `true` if distinct logical indices share a physical element, i.e. some
    /// dimension has been stretched by broadcasting.
    #[inline]
    pub fn is_overlapping(&self) -> bool {
        itertools::izip!(&self.view, &self.stride).any(|(&v, &s)| s == 0 && v > 1)
    }

    /// Physical element index of the `index`-th logical element (row-major order).
    #[inline]
    pub fn physical(&self, index: usize) -> usize {
        let mut index = index;
        let mut position = self.offset as isize;
        for (&v, &s) in self.view.iter().zip(&self.stride).rev() {
            position += (index % v) as isize * s;
            index /= v;
        }
        position as usize
    }

    /// Physical element indices of all logical elements, in row-major order.
    pub fn indices(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.size()).map(|index| self.physical(index))
    }

    /// One past the largest physical element index this shape can address.
    pub fn span(&self) -> usize {
        let delta: isize = self
            .view
            .iter()
            .zip(&self.stride)
            .map(|(&v, &s)| (v as isize - 1) * s.max(0))
            .sum();
        (self.offset as isize + delta + 1) as usize
    }

    /// Mutual broadcast compatibility: aligned from the right, each pair of extents must be
    /// equal or contain a 1. Unaligned leading dimensions always match.
    pub fn broadcastable(&self, rhs: &Shape) -> bool {
        broadcast_view(&self.view, &rhs.view).is_some()
    }

    /// One-way broadcast compatibility: `self` can be stretched to exactly `target`.
    pub fn broadcastable_to(&self, target: &[usize]) -> bool {
        self.len() <= target.len()
            && self
                .view
                .iter()
                .rev()
                .zip(target.iter().rev())
                .all(|(&x, &y)| x == y || x == 1)
    }

    /// Stretches `self` to `target` without copying: missing leading dimensions get extent 1
    /// and stride 0, then every extent-1 dimension facing a larger target gets stride 0.
    pub fn broadcast_to(&self, target: &[usize]) -> Result<Shape, ShapeError> {
        if !self.broadcastable_to(target) {
            return Err(ShapeError::BroadcastTo(self.clone(), target.to_vec()));
        }
        let pad = target.len() - self.len();
        let mut view = [vec![1; pad], self.view.clone()].concat();
        let mut stride = [vec![0; pad], self.stride.clone()].concat();
        for (v, s, &t) in itertools::izip!(view.iter_mut(), stride.iter_mut(), target) {
            if *v == 1 && t > 1 {
                *v = t;
                *s = 0;
            }
        }
        Ok(Shape {
            offset: self.offset,
            view,
            stride,
        })
    }

    /// Stretches `self` against `rhs`; the result has the mutual broadcast view.
    pub fn broadcast(&self, rhs: &Shape) -> Result<Shape, ShapeError> {
        match broadcast_view(&self.view, &rhs.view) {
            Some(view) => self.broadcast_to(&view),
            None => Err(ShapeError::Broadcast(self.clone(), rhs.clone())),
        }
    }

    /// Checks `self @ rhs`: both operands at least 2-D, inner extents equal, and batch
    /// dimensions mutually broadcastable.
    pub fn matmul_broadcastable(&self, rhs: &Shape) -> bool {
        if self.len() < 2 || rhs.len() < 2 {
            return false;
        }
        let (lb, lk) = self.view.split_at(self.len() - 1);
        let (rb, _) = rhs.view.split_at(rhs.len() - 2);
        let lb = &lb[..lb.len() - 1];
        lk[0] == rhs.view[rhs.len() - 2] && broadcast_view(lb, rb).is_some()
    }

    /// Selects a strided sub-range of every dimension without copying.
    pub fn slice(&self, ranges: &[Range]) -> Result<Shape, ShapeError> {
        if ranges.len() != self.len() {
            return Err(ShapeError::SliceRank {
                expected: self.len(),
                got: ranges.len(),
            });
        }
        let mut offset = self.offset as isize;
        let mut view = Vec::with_capacity(self.len());
        let mut stride = Vec::with_capacity(self.len());
        for (dim, (range, &v, &s)) in itertools::izip!(ranges, &self.view, &self.stride).enumerate()
        {
            range.check(dim, v)?;
            offset += range.start * s;
            view.push(range.len());
            stride.push(s * range.step);
        }
        Ok(Shape {
            offset: offset as usize,
            view,
            stride,
        })
    }

    /// Reorders dimensions: dimension `i` of the result is dimension `order[i]` of `self`.
    pub fn permute(&self, order: &[usize]) -> Result<Shape, ShapeError> {
        if !is_permutation(order, self.len()) {
            return Err(ShapeError::Permute(order.to_vec(), self.len()));
        }
        let view = order.iter().map(|&i| self.view[i]).collect();
        let stride = order.iter().map(|&i| self.stride[i]).collect();
        Ok(Shape {
            offset: self.offset,
            view,
            stride,
        })
    }

    /// Applies the inverse of `order`, undoing a [`Shape::permute`] with the same order.
    pub fn undo_permute(&self, order: &[usize]) -> Result<Shape, ShapeError> {
        if !is_permutation(order, self.len()) {
            return Err(ShapeError::Permute(order.to_vec(), self.len()));
        }
        self.permute(&invert_permutation(order))
    }

    /// Swaps two dimensions.
    pub fn transpose(&self, x: usize, y: usize) -> Result<Shape, ShapeError> {
        let rank = self.len();
        if let Some(&dim) = [x, y].iter().find(|&&dim| dim >= rank) {
            return Err(ShapeError::Dim { dim, rank });
        }
        let mut order = (0..rank).collect_vec();
        order.swap(x, y);
        self.permute(&order)
    }

    /// Drops one dimension.
    pub fn remove(&self, dim: usize) -> Result<Shape, ShapeError> {
        let rank = self.len();
        if dim >= rank {
            return Err(ShapeError::Dim { dim, rank });
        }
        if rank == 1 {
            return Err(ShapeError::Empty);
        }
        let mut shape = self.clone();
        shape.view.remove(dim);
        shape.stride.remove(dim);
        Ok(shape)
    }

    /// Reinterprets a contiguous shape under a new view, keeping its offset.
    ///
    /// Non-contiguous shapes are refused: their elements are not reachable through
    /// contiguous strides, so the caller has to materialize a copy first.
    pub fn reshape(&self, view: impl Into<Vec<usize>>) -> Result<Shape, ShapeError> {
        let view = view.into();
        Self::check_view(&view)?;
        if view.iter().product::<usize>() != self.size() {
            return Err(ShapeError::Reshape(self.clone(), view));
        }
        if !self.is_contiguous() {
            return Err(ShapeError::NonContiguous(self.clone()));
        }
        let stride = Self::contiguous_stride(&view);
        Ok(Shape {
            offset: self.offset,
            view,
            stride,
        })
    }
}

/// The mutual broadcast of two views, if any.
pub fn broadcast_view(lhs: &[usize], rhs: &[usize]) -> Option<Vec<usize>> {
    let rank = lhs.len().max(rhs.len());
    let pad = |view: &[usize]| [vec![1; rank - view.len()], view.to_vec()].concat();
    let (lhs, rhs) = (pad(lhs), pad(rhs));
    lhs.into_iter()
        .zip(rhs)
        .map(|(x, y)| match (x, y) {
            (x, y) if x == y => Some(x),
            (1, y) => Some(y),
            (x, 1) => Some(x),
            _ => None,
        })
        .collect()
}

fn is_permutation(order: &[usize], rank: usize) -> bool {
    order.len() == rank && order.iter().sorted().copied().eq(0..rank)
}

/// The permutation `inverse` such that `inverse[order[i]] == i`.
pub fn invert_permutation(order: &[usize]) -> Vec<usize> {
    let mut inverse = vec![0; order.len()];
    for (i, &j) in order.iter().enumerate() {
        inverse[j] = i;
    }
    inverse
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use itertools::Itertools;

    use super::{Shape, ShapeError, broadcast_view};
    use crate::slice::Range;

    fn random_view(rank: usize) -> Vec<usize> {
        (0..rank).map(|_| fastrand::usize(1..4)).collect()
    }

    #[test]
    fn test_contiguous() -> Result<(), Box<dyn Error>> {
        let shape = Shape::new([2, 3, 4])?;
        assert_eq!(shape.stride(), &[12, 4, 1]);
        assert!(shape.is_contiguous());
        assert_eq!(shape.size(), 24);
        assert_eq!(shape.indices().collect_vec(), (0..24).collect_vec());

        assert_eq!(Shape::new(Vec::<usize>::new()), Err(ShapeError::Empty));
        assert!(matches!(
            Shape::new([2, 0]),
            Err(ShapeError::ZeroSized(_))
        ));
        assert!(Shape::from_parts(0, [2, 3], [1]).is_err());
        Ok(())
    }

    #[test]
    fn test_broadcast_commutative() -> Result<(), Box<dyn Error>> {
        for _ in 0..256 {
            let lhs = random_view(fastrand::usize(1..5));
            let mut rhs = lhs.clone();
            // knock out some dimensions to 1 and drop some leading ones
            for v in rhs.iter_mut() {
                if fastrand::bool() {
                    *v = 1;
                }
            }
            let rhs = rhs[fastrand::usize(0..rhs.len())..].to_vec();

            let x = Shape::new(lhs.clone())?;
            let y = Shape::new(rhs.clone())?;
            assert!(x.broadcastable(&y));
            assert!(y.broadcastable(&x));
            assert_eq!(x.broadcast(&y)?.view(), y.broadcast(&x)?.view());
            assert_eq!(x.broadcast(&x)?, x);
        }
        Ok(())
    }

    #[test]
    fn test_broadcast_to_identity() -> Result<(), Box<dyn Error>> {
        for _ in 0..64 {
            let shape = Shape::new(random_view(fastrand::usize(1..5)))?;
            let shape = shape.transpose(0, shape.len() - 1)?;
            assert_eq!(shape.broadcast_to(shape.view())?, shape);
        }
        Ok(())
    }

    #[test]
    fn test_broadcast() -> Result<(), Box<dyn Error>> {
        let x = Shape::new([3, 1])?;
        let y = Shape::new([2, 1, 4])?;
        assert_eq!(broadcast_view(x.view(), y.view()), Some(vec![2, 3, 4]));

        let z = x.broadcast(&y)?;
        assert_eq!(z.view(), &[2, 3, 4]);
        assert_eq!(z.stride(), &[0, 1, 0]);
        assert!(!z.is_contiguous());
        assert!(z.is_overlapping());
        assert!(!x.is_overlapping());
        // a unit dimension with zero stride still maps one element
        assert!(!Shape::new([3])?.broadcast_to(&[1, 3])?.is_overlapping());
        assert_eq!(z.indices().take(5).collect_vec(), vec![0, 0, 0, 0, 1]);

        assert!(x.broadcastable_to(&[2, 3, 4]));
        assert!(!y.broadcastable_to(&[3, 4]));
        assert!(!Shape::new([3])?.broadcastable(&Shape::new([4])?));
        assert!(matches!(
            Shape::new([3])?.broadcast_to(&[4]),
            Err(ShapeError::BroadcastTo(_, _))
        ));
        Ok(())
    }

    #[test]
    fn test_matmul_broadcastable() -> Result<(), Box<dyn Error>> {
        let x = Shape::new([2, 2, 3])?;
        let y = Shape::new([1, 3, 4])?;
        assert!(x.matmul_broadcastable(&y));
        assert!(x.matmul_broadcastable(&Shape::new([3, 4])?));
        assert!(!x.matmul_broadcastable(&Shape::new([4, 3])?));
        assert!(!x.matmul_broadcastable(&Shape::new([3, 3, 4])?));
        assert!(!Shape::new([3])?.matmul_broadcastable(&y));
        Ok(())
    }

    #[test]
    fn test_slice() -> Result<(), Box<dyn Error>> {
        let shape = Shape::new([4, 6])?;
        let sliced = shape.slice(&[Range::new(1, 3, 1), Range::new(0, 6, 2)])?;
        assert_eq!(sliced.offset(), 6);
        assert_eq!(sliced.view(), &[2, 3]);
        assert_eq!(sliced.stride(), &[6, 2]);
        assert_eq!(sliced.indices().collect_vec(), vec![6, 8, 10, 12, 14, 16]);

        let reversed = shape.slice(&[Range::new(3, -1, -1), Range::new(5, 3, -1)])?;
        assert_eq!(reversed.view(), &[4, 2]);
        assert_eq!(reversed.stride(), &[-6, -1]);
        assert_eq!(reversed.physical(0), 23);
        assert_eq!(reversed.physical(7), 4);

        assert!(matches!(
            shape.slice(&[Range::new(0, 5, 1), Range::new(0, 6, 1)]),
            Err(ShapeError::Bounds { dim: 0, .. })
        ));
        assert!(shape.slice(&[Range::new(0, 4, 1)]).is_err());
        Ok(())
    }

    #[test]
    fn test_permute() -> Result<(), Box<dyn Error>> {
        let shape = Shape::new([2, 3, 4])?;
        let order = [2, 0, 1];
        let permuted = shape.permute(&order)?;
        assert_eq!(permuted.view(), &[4, 2, 3]);
        assert_eq!(permuted.stride(), &[1, 12, 4]);
        assert_eq!(permuted.undo_permute(&order)?, shape);

        assert!(shape.permute(&[0, 0, 1]).is_err());
        assert!(shape.permute(&[0, 1]).is_err());
        assert_eq!(shape.transpose(0, 2)?.view(), &[4, 3, 2]);
        Ok(())
    }

    #[test]
    fn test_remove() -> Result<(), Box<dyn Error>> {
        let shape = Shape::new([2, 1, 4])?;
        let removed = shape.remove(1)?;
        assert_eq!(removed.view(), &[2, 4]);
        assert_eq!(removed.stride(), &[4, 1]);
        assert!(Shape::new([3])?.remove(0).is_err());
        assert!(shape.remove(3).is_err());
        Ok(())
    }

    #[test]
    fn test_reshape() -> Result<(), Box<dyn Error>> {
        for _ in 0..64 {
            let shape = Shape::new(random_view(fastrand::usize(1..5)))?;
            let target = vec![shape.size()];
            let reshaped = shape.reshape(target.clone())?;
            assert_eq!(reshaped.size(), shape.size());
            assert_eq!(reshaped.view(), &target[..]);
        }

        let shape = Shape::new([2, 6])?;
        assert_eq!(shape.reshape([3, 4])?.stride(), &[4, 1]);
        assert!(matches!(
            shape.reshape([5, 2]),
            Err(ShapeError::Reshape(_, _))
        ));
        let transposed = shape.transpose(0, 1)?;
        assert!(matches!(
            transposed.reshape([12]),
            Err(ShapeError::NonContiguous(_))
        ));
        Ok(())
    }

    #[test]
    fn test_span() -> Result<(), Box<dyn Error>> {
        assert_eq!(Shape::new([2, 3])?.span(), 6);
        let sliced = Shape::new([4, 6])?.slice(&[Range::new(1, 3, 1), Range::new(0, 6, 2)])?;
        assert_eq!(sliced.span(), 17);
        Ok(())
    }
}
