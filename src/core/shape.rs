use std::fmt::{self, Display};

use derive_more::{Deref, From};

/// Extents of a buffer, outermost axis first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Deref, From)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Self(dims.into())
    }

    /// Shape of the given rank with every extent set to 1.
    pub fn ones(rank: usize) -> Self {
        Self(vec![1; rank])
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of elements. A rank 0 shape holds a single scalar.
    pub fn n_elements(&self) -> usize {
        self.0.iter().product()
    }

    /// Product of the extents before `axis`.
    pub(crate) fn outer(&self, axis: usize) -> usize {
        self.0[..axis].iter().product()
    }

    /// Product of the extents after `axis`.
    pub(crate) fn inner(&self, axis: usize) -> usize {
        self.0[axis + 1..].iter().product()
    }

    /// Same shape with the extent of `axis` replaced.
    pub fn with_extent(&self, axis: usize, extent: usize) -> Self {
        let mut dims = self.0.clone();
        dims[axis] = extent;
        Self(dims)
    }

    /// Same shape with `axis` removed.
    pub fn without_axis(&self, axis: usize) -> Self {
        let mut dims = self.0.clone();
        dims.remove(axis);
        Self(dims)
    }

    /// Splits off the `n_outer` outermost extents.
    pub fn split_outer(&self, n_outer: usize) -> (Shape, Shape) {
        let (outer, inner) = self.0.split_at(n_outer.min(self.rank()));
        (Self(outer.to_vec()), Self(inner.to_vec()))
    }

    /// `self` followed by `inner`.
    pub fn concat(&self, inner: &Shape) -> Self {
        let mut dims = self.0.clone();
        dims.extend_from_slice(&inner.0);
        Self(dims)
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Self(dims.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Self(dims.to_vec())
    }
}

impl Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "(")?;
        let mut iter = self.0.iter();
        if let Some(first) = iter.next() {
            write!(f, "{first}")?;
        }
        for extent in iter {
            write!(f, "x{extent}")?;
        }
        write!(f, ")")
    }
}
