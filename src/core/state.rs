use std::{iter, ops::Range};

use derive_more::Display;

use crate::{ShapeError, core::Shape};

/// One of the three arrays held by a [`StateBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Field {
    #[display("value")]
    Value,
    #[display("gradient")]
    Gradient,
    #[display("curvature")]
    Curvature,
}

/// A contiguous range of indices along one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display("axis {axis}, offset {offset}, len {len}")]
pub struct Window {
    pub axis: usize,
    pub len: usize,
    pub offset: usize,
}

impl Window {
    pub const fn new(axis: usize, len: usize, offset: usize) -> Self {
        Self { axis, len, offset }
    }

    /// Window covering the single index `index` of `axis`.
    pub const fn single(axis: usize, index: usize) -> Self {
        Self::new(axis, 1, index)
    }

    /// Shape of the window cut out of a buffer of shape `shape`.
    pub fn shape_in(&self, shape: &Shape) -> Result<Shape, ShapeError> {
        if self.axis >= shape.rank() {
            return Err(ShapeError::AxisOutOfRange {
                axis: self.axis,
                rank: shape.rank(),
            });
        }
        let extent = shape[self.axis];
        if self.offset + self.len > extent {
            return Err(ShapeError::WindowOutOfRange {
                axis: self.axis,
                len: self.len,
                offset: self.offset,
                extent,
            });
        }
        Ok(shape.with_extent(self.axis, self.len))
    }

    /// Pairs of (range in the full buffer, range in the window) covering the window, in
    /// row-major order.
    fn blocks(&self, shape: &Shape) -> impl Iterator<Item = (Range<usize>, Range<usize>)> {
        let outer = shape.outer(self.axis);
        let inner = shape.inner(self.axis);
        let extent = shape[self.axis];
        let block = self.len * inner;
        let offset = self.offset;
        (0..outer).map(move |p| {
            let full_start = (p * extent + offset) * inner;
            let window_start = p * block;
            (full_start..full_start + block, window_start..window_start + block)
        })
    }
}

/// Dense row-major `{value, gradient, curvature}` triple. All three arrays always have the shape
/// of the value.
#[derive(Debug, Clone, PartialEq)]
pub struct StateBuffer {
    shape: Shape,
    value: Vec<f32>,
    gradient: Vec<f32>,
    curvature: Vec<f32>,
}

impl Default for StateBuffer {
    /// A single zero scalar.
    fn default() -> Self {
        Self::new(Shape::default())
    }
}

impl StateBuffer {
    pub fn new(shape: impl Into<Shape>) -> Self {
        let shape = shape.into();
        let n = shape.n_elements();
        Self {
            shape,
            value: bytemuck::zeroed_vec(n),
            gradient: bytemuck::zeroed_vec(n),
            curvature: bytemuck::zeroed_vec(n),
        }
    }

    /// Buffer of the given rank with every extent set to 1. Used for lazily allocated buffers
    /// that the first module writing to them resizes.
    pub fn minimal(rank: usize) -> Self {
        Self::new(Shape::ones(rank))
    }

    pub fn from_values(shape: impl Into<Shape>, values: Vec<f32>) -> Result<Self, ShapeError> {
        let shape = shape.into();
        if values.len() != shape.n_elements() {
            return Err(ShapeError::LengthMismatch {
                shape,
                n_values: values.len(),
            });
        }
        let n = values.len();
        Ok(Self {
            shape,
            value: values,
            gradient: bytemuck::zeroed_vec(n),
            curvature: bytemuck::zeroed_vec(n),
        })
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn n_elements(&self) -> usize {
        self.value.len()
    }

    /// Resizes all three arrays. Contents are zeroed when the element count changes and kept
    /// otherwise.
    pub fn resize(&mut self, shape: &Shape) {
        if &self.shape == shape {
            return;
        }
        let n = shape.n_elements();
        if n != self.value.len() {
            for data in [&mut self.value, &mut self.gradient, &mut self.curvature] {
                data.clear();
                data.resize(n, 0.0);
            }
        }
        self.shape = shape.clone();
    }

    pub fn resize_as(&mut self, other: &StateBuffer) {
        self.resize(other.shape());
    }

    pub fn value(&self) -> &[f32] {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut [f32] {
        &mut self.value
    }

    pub fn gradient(&self) -> &[f32] {
        &self.gradient
    }

    pub fn gradient_mut(&mut self) -> &mut [f32] {
        &mut self.gradient
    }

    pub fn curvature(&self) -> &[f32] {
        &self.curvature
    }

    pub fn curvature_mut(&mut self) -> &mut [f32] {
        &mut self.curvature
    }

    pub fn field(&self, field: Field) -> &[f32] {
        match field {
            Field::Value => &self.value,
            Field::Gradient => &self.gradient,
            Field::Curvature => &self.curvature,
        }
    }

    pub fn field_mut(&mut self, field: Field) -> &mut [f32] {
        match field {
            Field::Value => &mut self.value,
            Field::Gradient => &mut self.gradient,
            Field::Curvature => &mut self.curvature,
        }
    }

    /// The value together with a mutable derivative array, for passes that read the value while
    /// accumulating into a derivative.
    pub fn split_mut(&mut self, field: Field) -> (&[f32], &mut [f32]) {
        match field {
            Field::Value => (&[], self.value.as_mut_slice()),
            Field::Gradient => (self.value.as_slice(), self.gradient.as_mut_slice()),
            Field::Curvature => (self.value.as_slice(), self.curvature.as_mut_slice()),
        }
    }

    pub fn clear(&mut self, field: Field) {
        bytemuck::fill_zeroes(self.field_mut(field));
    }

    pub fn clear_value(&mut self) {
        self.clear(Field::Value);
    }

    pub fn clear_gradient(&mut self) {
        self.clear(Field::Gradient);
    }

    pub fn clear_curvature(&mut self) {
        self.clear(Field::Curvature);
    }

    pub fn clear_all(&mut self) {
        self.clear_value();
        self.clear_gradient();
        self.clear_curvature();
    }

    /// Fills `field` with `x`.
    pub fn fill(&mut self, field: Field, x: f32) {
        self.field_mut(field).fill(x);
    }

    /// Resizes to `other`'s shape and copies its value.
    pub fn copy_value_from(&mut self, other: &StateBuffer) {
        self.resize_as(other);
        self.value.copy_from_slice(&other.value);
    }

    /// `self.field += other.field`. Shapes must hold the same number of elements.
    pub fn accumulate(&mut self, field: Field, other: &StateBuffer) -> Result<(), ShapeError> {
        if self.n_elements() != other.n_elements() {
            return Err(ShapeError::LengthMismatch {
                shape: self.shape.clone(),
                n_values: other.n_elements(),
            });
        }
        for (x, &dx) in iter::zip(self.field_mut(field), other.field(field)) {
            *x += dx;
        }
        Ok(())
    }

    /// Copy of the window, all three fields.
    pub fn narrow(&self, window: Window) -> Result<StateBuffer, ShapeError> {
        let shape = window.shape_in(&self.shape)?;
        let mut narrowed = StateBuffer::new(shape);
        for (full, part) in window.blocks(&self.shape) {
            narrowed.value[part.clone()].copy_from_slice(&self.value[full.clone()]);
            narrowed.gradient[part.clone()].copy_from_slice(&self.gradient[full.clone()]);
            narrowed.curvature[part].copy_from_slice(&self.curvature[full]);
        }
        Ok(narrowed)
    }

    /// Copy of slice `index` along `axis`, with `axis` removed from the shape.
    pub fn select(&self, axis: usize, index: usize) -> Result<StateBuffer, ShapeError> {
        let mut selected = self.narrow(Window::single(axis, index))?;
        selected.shape = selected.shape.without_axis(axis);
        Ok(selected)
    }

    /// Overwrites `field` inside the window with `src.field`. `src` must hold exactly as many
    /// elements as the window.
    pub fn store_window(
        &mut self,
        window: Window,
        field: Field,
        src: &StateBuffer,
    ) -> Result<(), ShapeError> {
        self.check_window_source(window, src)?;
        let shape = self.shape.clone();
        let dst = self.field_mut(field);
        for (full, part) in window.blocks(&shape) {
            dst[full].copy_from_slice(&src.field(field)[part]);
        }
        Ok(())
    }

    /// `field` inside the window `+= src.field`.
    pub fn add_window(
        &mut self,
        window: Window,
        field: Field,
        src: &StateBuffer,
    ) -> Result<(), ShapeError> {
        self.check_window_source(window, src)?;
        let shape = self.shape.clone();
        let dst = self.field_mut(field);
        for (full, part) in window.blocks(&shape) {
            for (x, &dx) in iter::zip(&mut dst[full], &src.field(field)[part]) {
                *x += dx;
            }
        }
        Ok(())
    }

    /// Writes `field` of slice `index` along axis 0 from `src`.
    pub fn store_selected(
        &mut self,
        index: usize,
        field: Field,
        src: &StateBuffer,
    ) -> Result<(), ShapeError> {
        self.store_window(Window::single(0, index), field, src)
    }

    /// Makes `self` the stack of `slices` along a new axis 0 and copies their `field`. The other
    /// fields are kept when the shape does not change.
    pub fn assign_stacked(&mut self, slices: &[StateBuffer], field: Field) -> Result<(), ShapeError> {
        let Some(first) = slices.first() else {
            return Ok(());
        };
        if let Some(other) = slices.iter().find(|s| s.shape() != first.shape()) {
            return Err(ShapeError::RaggedSlices {
                first: first.shape().clone(),
                other: other.shape().clone(),
            });
        }
        let shape = Shape::new([slices.len()]).concat(first.shape());
        self.resize(&shape);
        for (index, slice) in slices.iter().enumerate() {
            self.store_selected(index, field, slice)?;
        }
        Ok(())
    }

    fn check_window_source(&self, window: Window, src: &StateBuffer) -> Result<(), ShapeError> {
        let shape = window.shape_in(&self.shape)?;
        if shape.n_elements() != src.n_elements() {
            return Err(ShapeError::LengthMismatch {
                shape,
                n_values: src.n_elements(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counting(shape: impl Into<Shape>) -> StateBuffer {
        let shape = shape.into();
        let values = (0..shape.n_elements()).map(|i| i as f32).collect();
        StateBuffer::from_values(shape, values).unwrap()
    }

    #[test]
    fn resize_keeps_fields_in_step() {
        let mut state = StateBuffer::new([2, 3]);
        state.resize(&Shape::from([4, 5]));
        assert_eq!(state.value().len(), 20);
        assert_eq!(state.gradient().len(), 20);
        assert_eq!(state.curvature().len(), 20);
        assert_eq!(state.shape(), &Shape::from([4, 5]));
    }

    #[test]
    fn reshape_with_same_count_keeps_contents() {
        let mut state = counting([2, 3]);
        state.resize(&Shape::from([3, 2]));
        assert_eq!(state.value(), &[0., 1., 2., 3., 4., 5.]);
    }

    #[test]
    fn narrow_middle_axis() {
        let state = counting([2, 3, 2]);
        let narrowed = state.narrow(Window::new(1, 2, 1)).unwrap();
        assert_eq!(narrowed.shape(), &Shape::from([2, 2, 2]));
        assert_eq!(narrowed.value(), &[2., 3., 4., 5., 8., 9., 10., 11.]);
    }

    #[test]
    fn narrow_out_of_range() {
        let state = counting([2, 3]);
        assert_eq!(
            state.narrow(Window::new(1, 2, 2)),
            Err(ShapeError::WindowOutOfRange {
                axis: 1,
                len: 2,
                offset: 2,
                extent: 3
            })
        );
        assert_eq!(
            state.narrow(Window::new(2, 1, 0)),
            Err(ShapeError::AxisOutOfRange { axis: 2, rank: 2 })
        );
    }

    #[test]
    fn select_drops_axis() {
        let state = counting([3, 2]);
        let row = state.select(0, 2).unwrap();
        assert_eq!(row.shape(), &Shape::from([2]));
        assert_eq!(row.value(), &[4., 5.]);
        let column = state.select(1, 1).unwrap();
        assert_eq!(column.value(), &[1., 3., 5.]);
    }

    #[test]
    fn add_window_accumulates() {
        let mut state = StateBuffer::new([4]);
        let mut part = StateBuffer::new([2]);
        part.fill(Field::Gradient, 1.5);
        state.add_window(Window::new(0, 2, 1), Field::Gradient, &part).unwrap();
        state.add_window(Window::new(0, 2, 1), Field::Gradient, &part).unwrap();
        assert_eq!(state.gradient(), &[0., 3., 3., 0.]);
        assert_eq!(state.value(), &[0.; 4]);
    }

    #[test]
    fn stack_then_select_round_trips() {
        let slices = [counting([2]), counting([2])];
        let mut stacked = StateBuffer::default();
        stacked.assign_stacked(&slices, Field::Value).unwrap();
        assert_eq!(stacked.shape(), &Shape::from([2, 2]));
        assert_eq!(stacked.select(0, 1).unwrap().value(), slices[1].value());
    }

    #[test]
    fn stacking_ragged_slices_fails() {
        let slices = [counting([2]), counting([3])];
        let mut stacked = StateBuffer::default();
        assert!(matches!(
            stacked.assign_stacked(&slices, Field::Value),
            Err(ShapeError::RaggedSlices { .. })
        ));
    }

    #[test]
    fn accumulate_rejects_length_mismatch() {
        let mut a = StateBuffer::new([3]);
        let b = StateBuffer::new([2]);
        assert!(a.accumulate(Field::Gradient, &b).is_err());
    }
}
