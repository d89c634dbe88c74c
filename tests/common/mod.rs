#![allow(dead_code)]

use std::{cell::Cell, iter, rc::Rc};

use approx::assert_abs_diff_eq;
use layerflow::{Module, Result, StateBuffer};

/// `y = factor * x`, element-wise, counting its evaluations.
#[derive(Debug, Clone)]
pub struct Scale {
    name: String,
    factor: f32,
    order: Option<usize>,
    reuse: bool,
    calls: Rc<Cell<usize>>,
}

impl Scale {
    pub fn new(factor: f32) -> Self {
        Self {
            name: format!("x{factor}"),
            factor,
            order: None,
            reuse: true,
            calls: Rc::default(),
        }
    }

    pub fn with_order(factor: f32, order: usize) -> Self {
        Self {
            order: Some(order),
            ..Self::new(factor)
        }
    }

    /// Keeps its input alive after `evaluate` (`buffer_reuse_hint() == false`).
    pub fn pinned(self) -> Self {
        Self {
            reuse: false,
            ..self
        }
    }

    /// Shared counter of `evaluate` calls, also seen by clones.
    pub fn calls(&self) -> Rc<Cell<usize>> {
        Rc::clone(&self.calls)
    }
}

impl Module for Scale {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&mut self, input: &StateBuffer, output: &mut StateBuffer) -> Result<()> {
        self.calls.set(self.calls.get() + 1);
        output.resize_as(input);
        for (y, &x) in iter::zip(output.value_mut(), input.value()) {
            *y = self.factor * x;
        }
        Ok(())
    }

    fn backpropagate(&mut self, input: &mut StateBuffer, output: &StateBuffer) -> Result<()> {
        for (dx, &dy) in iter::zip(input.gradient_mut(), output.gradient()) {
            *dx += self.factor * dy;
        }
        Ok(())
    }

    fn curvature_backpropagate(
        &mut self,
        input: &mut StateBuffer,
        output: &StateBuffer,
    ) -> Result<()> {
        for (ddx, &ddy) in iter::zip(input.curvature_mut(), output.curvature()) {
            *ddx += self.factor * self.factor * ddy;
        }
        Ok(())
    }

    fn buffer_reuse_hint(&self) -> bool {
        self.reuse
    }

    fn replicable_order(&self) -> Option<usize> {
        self.order
    }

    fn try_clone(&self) -> Result<Box<dyn Module>> {
        Ok(Box::new(self.clone()))
    }
}

pub fn vector(values: &[f32]) -> StateBuffer {
    StateBuffer::from_values([values.len()], values.to_vec()).unwrap()
}

pub fn assert_close(actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len());
    for (&a, &e) in iter::zip(actual, expected) {
        assert_abs_diff_eq!(a, e, epsilon = 1e-6);
    }
}
