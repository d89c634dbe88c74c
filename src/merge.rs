use tracing::trace;

use crate::{
    Error, Module, Result, ShapeError,
    core::{Field, Shape, StateBuffer, StateView, Window},
    module::Pass,
};

/// Concatenates its input with buffers produced elsewhere, typically the outputs of branches
/// earlier in the same chain, along one axis.
///
/// The input comes first, then the viewed buffers in order. Backward passes split the output
/// derivative and add each part to the buffer it came from.
#[derive(Debug)]
pub struct ConcatMerge {
    name: String,
    axis: usize,
    views: Vec<StateView>,
}

impl ConcatMerge {
    pub fn new(name: impl Into<String>, axis: usize, views: Vec<StateView>) -> Self {
        Self {
            name: name.into(),
            axis,
            views,
        }
    }

    pub fn axis(&self) -> usize {
        self.axis
    }

    pub fn views(&self) -> &[StateView] {
        &self.views
    }

    pub fn push_view(&mut self, view: StateView) {
        self.views.push(view);
    }

    /// Extent along the concatenation axis of every viewed buffer, checked against `input`.
    fn extents(&self, input: &Shape) -> Result<Vec<usize>> {
        if self.axis >= input.rank() {
            return Err(ShapeError::AxisOutOfRange {
                axis: self.axis,
                rank: input.rank(),
            }
            .into());
        }
        self.views
            .iter()
            .map(|view| {
                let shape = view.shape()?;
                let matches = shape.rank() == input.rank()
                    && shape.with_extent(self.axis, 0) == input.with_extent(self.axis, 0);
                if !matches {
                    return Err(Error::shape_mismatch(
                        &self.name,
                        format_args!("{input} outside axis {}", self.axis),
                        shape,
                    ));
                }
                Ok(shape[self.axis])
            })
            .collect()
    }

    fn backward(&mut self, pass: Pass, input: &mut StateBuffer, output: &StateBuffer) -> Result<()> {
        let field = pass.field();
        let extents = self.extents(input.shape())?;
        let mut offset = input.shape()[self.axis];
        let own = output.narrow(Window::new(self.axis, offset, 0))?;
        input.accumulate(field, &own)?;
        for (view, extent) in self.views.iter().zip(extents) {
            let part = output.narrow(Window::new(self.axis, extent, offset))?;
            view.accumulate(field, &part)?;
            offset += extent;
        }
        Ok(())
    }
}

impl Module for ConcatMerge {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&mut self, input: &StateBuffer, output: &mut StateBuffer) -> Result<()> {
        let shape = self.size_forward(input.shape())?;
        trace!(module = %self.name, %shape, "concatenate");
        output.resize(&shape);
        let mut offset = input.shape()[self.axis];
        output.store_window(Window::new(self.axis, offset, 0), Field::Value, input)?;
        for view in &self.views {
            let part = view.load()?;
            let extent = part.shape()[self.axis];
            output.store_window(Window::new(self.axis, extent, offset), Field::Value, &part)?;
            offset += extent;
        }
        Ok(())
    }

    fn backpropagate(&mut self, input: &mut StateBuffer, output: &StateBuffer) -> Result<()> {
        self.backward(Pass::Gradient, input, output)
    }

    fn curvature_backpropagate(
        &mut self,
        input: &mut StateBuffer,
        output: &StateBuffer,
    ) -> Result<()> {
        self.backward(Pass::Curvature, input, output)
    }

    /// Uses the shapes the viewed buffers hold at the time of the call.
    fn size_forward(&self, input: &Shape) -> Result<Shape> {
        let extents = self.extents(input)?;
        let extent = input[self.axis] + extents.iter().sum::<usize>();
        Ok(input.with_extent(self.axis, extent))
    }

    fn size_backward(&self, output: &Shape) -> Result<Shape> {
        let extents = self.extents(output)?;
        let taken: usize = extents.iter().sum();
        match output[self.axis].checked_sub(taken) {
            Some(extent) => Ok(output.with_extent(self.axis, extent)),
            None => Err(Error::shape_mismatch(
                &self.name,
                format_args!("at least {taken} along axis {}", self.axis),
                output,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StateArena;

    #[test]
    fn concatenates_then_splits_derivatives() {
        let mut arena = StateArena::new();
        let side = arena.alloc(StateBuffer::from_values([1, 2], vec![7.0, 8.0]).unwrap());
        let mut merge = ConcatMerge::new("merge", 0, vec![arena.view(side).unwrap()]);

        let mut input = StateBuffer::from_values([2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let mut output = StateBuffer::default();
        merge.evaluate(&input, &mut output).unwrap();
        assert_eq!(output.shape(), &Shape::from([3, 2]));
        assert_eq!(output.value(), &[1.0, 2.0, 3.0, 4.0, 7.0, 8.0]);

        output
            .gradient_mut()
            .copy_from_slice(&[1.0, 1.0, 2.0, 2.0, 3.0, 3.0]);
        merge.backpropagate(&mut input, &output).unwrap();
        assert_eq!(input.gradient(), &[1.0, 1.0, 2.0, 2.0]);
        assert_eq!(arena.get(side).unwrap().gradient(), &[3.0, 3.0]);
        assert_eq!(
            merge.size_backward(&Shape::from([3, 2])),
            Ok(Shape::from([2, 2]))
        );
        assert!(arena.get(side).unwrap().field(Field::Curvature).iter().all(|&c| c == 0.0));
    }

    #[test]
    fn mismatched_side_shape() {
        let mut arena = StateArena::new();
        let side = arena.alloc(StateBuffer::new([1, 3]));
        let merge = ConcatMerge::new("merge", 0, vec![arena.view(side).unwrap()]);
        assert!(matches!(
            merge.size_forward(&Shape::from([2, 2])),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn cannot_be_cloned() {
        let merge = ConcatMerge::new("merge", 0, Vec::new());
        assert_eq!(
            merge.try_clone().err(),
            Some(Error::CloneUnsupported("merge".into()))
        );
    }
}
