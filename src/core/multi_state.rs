use derive_more::{Deref, DerefMut, From, IntoIterator};

use crate::core::{Field, Shape, StateBuffer};

/// Ordered list of [`StateBuffer`]s, for stages carrying several sub-tensors at once.
#[derive(Debug, Clone, Default, PartialEq, Deref, DerefMut, From, IntoIterator)]
pub struct MultiState(#[into_iterator(owned, ref, ref_mut)] Vec<StateBuffer>);

impl MultiState {
    pub fn new() -> Self {
        Self::default()
    }

    /// `n` buffers of the same shape.
    pub fn with_shape(n: usize, shape: &Shape) -> Self {
        Self((0..n).map(|_| StateBuffer::new(shape.clone())).collect())
    }

    pub fn shapes(&self) -> Vec<Shape> {
        self.0.iter().map(|state| state.shape().clone()).collect()
    }

    pub fn clear(&mut self, field: Field) {
        for state in &mut self.0 {
            state.clear(field);
        }
    }
}

impl FromIterator<StateBuffer> for MultiState {
    fn from_iter<T: IntoIterator<Item = StateBuffer>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
