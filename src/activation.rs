use std::{
    fmt::{self, Debug},
    iter,
};

use crate::{
    Error, Module, Result,
    core::{Field, StateBuffer},
};

#[derive(Clone, Copy)]
pub struct DynActivationFunction {
    name: &'static str,
    apply: fn(f32) -> f32,
    deriv: fn(f32) -> f32,
}

impl Debug for DynActivationFunction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Debug::fmt(self.name, f)
    }
}

impl DynActivationFunction {
    pub fn new<Phi: ActivationFunction>(_: Phi) -> Self {
        Self {
            name: Phi::NAME,
            apply: Phi::apply,
            deriv: Phi::deriv,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn apply(&self, x: f32) -> f32 {
        (self.apply)(x)
    }

    pub fn deriv(&self, x: f32) -> f32 {
        (self.deriv)(x)
    }
}

pub trait ActivationFunction: Send + Sync + 'static {
    const NAME: &'static str;

    fn apply(x: f32) -> f32;

    /// Derivative at the input `x`.
    fn deriv(x: f32) -> f32;
}

pub mod activation_functions {
    use super::ActivationFunction;

    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct Identity;
    impl ActivationFunction for Identity {
        const NAME: &'static str = "identity";

        fn apply(x: f32) -> f32 {
            x
        }

        fn deriv(_: f32) -> f32 {
            1.0
        }
    }

    fn sigmoid(x: f32) -> f32 {
        1.0 / (1.0 + f32::exp(-x))
    }

    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct Sigmoid;
    impl ActivationFunction for Sigmoid {
        const NAME: &'static str = "sigmoid";

        fn apply(x: f32) -> f32 {
            sigmoid(x)
        }

        fn deriv(x: f32) -> f32 {
            sigmoid(x) * (1.0 - sigmoid(x))
        }
    }

    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct Tanh;
    impl ActivationFunction for Tanh {
        const NAME: &'static str = "tanh";

        fn apply(x: f32) -> f32 {
            f32::tanh(x)
        }

        fn deriv(x: f32) -> f32 {
            1.0 - f32::tanh(x).powi(2)
        }
    }

    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct Rectifier;
    impl ActivationFunction for Rectifier {
        const NAME: &'static str = "rectifier";

        fn apply(x: f32) -> f32 {
            x.max(0.0)
        }

        fn deriv(x: f32) -> f32 {
            if x > 0.0 { 1.0 } else { 0.0 }
        }
    }
}

/// Element-wise nonlinearity. Works on inputs of any rank.
#[derive(Debug, Clone)]
pub struct Activation {
    name: String,
    phi: DynActivationFunction,
}

impl Activation {
    pub fn new(phi: impl ActivationFunction) -> Self {
        let phi = DynActivationFunction::new(phi);
        Self {
            name: phi.name().to_owned(),
            phi,
        }
    }

    pub fn named(name: impl Into<String>, phi: impl ActivationFunction) -> Self {
        Self {
            name: name.into(),
            phi: DynActivationFunction::new(phi),
        }
    }

    pub fn phi(&self) -> DynActivationFunction {
        self.phi
    }

    fn check_pair(&self, input: &StateBuffer, output: &StateBuffer) -> Result<()> {
        if input.n_elements() != output.n_elements() {
            return Err(Error::shape_mismatch(
                &self.name,
                input.shape(),
                output.shape(),
            ));
        }
        Ok(())
    }
}

impl Module for Activation {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&mut self, input: &StateBuffer, output: &mut StateBuffer) -> Result<()> {
        output.resize_as(input);
        for (y, &x) in iter::zip(output.value_mut(), input.value()) {
            *y = self.phi.apply(x);
        }
        Ok(())
    }

    fn backpropagate(&mut self, input: &mut StateBuffer, output: &StateBuffer) -> Result<()> {
        self.check_pair(input, output)?;
        let (x, dx) = input.split_mut(Field::Gradient);
        for ((dx, &x), &dy) in iter::zip(iter::zip(dx, x), output.gradient()) {
            *dx += dy * self.phi.deriv(x);
        }
        Ok(())
    }

    fn curvature_backpropagate(
        &mut self,
        input: &mut StateBuffer,
        output: &StateBuffer,
    ) -> Result<()> {
        self.check_pair(input, output)?;
        let (x, ddx) = input.split_mut(Field::Curvature);
        for ((ddx, &x), &ddy) in iter::zip(iter::zip(ddx, x), output.curvature()) {
            *ddx += ddy * self.phi.deriv(x).powi(2);
        }
        Ok(())
    }

    fn replicable_order(&self) -> Option<usize> {
        Some(1)
    }

    fn try_clone(&self) -> Result<Box<dyn Module>> {
        Ok(Box::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::{activation_functions::*, *};

    #[test]
    fn rectifier_passes_gradient_only_where_positive() {
        let mut relu = Activation::new(Rectifier);
        let mut input = StateBuffer::from_values([3], vec![-1.0, 0.5, 2.0]).unwrap();
        let mut output = StateBuffer::default();
        relu.evaluate(&input, &mut output).unwrap();
        assert_eq!(output.value(), &[0.0, 0.5, 2.0]);
        output.gradient_mut().fill(2.0);
        relu.backpropagate(&mut input, &output).unwrap();
        relu.backpropagate(&mut input, &output).unwrap();
        assert_eq!(input.gradient(), &[0.0, 4.0, 4.0]);
    }

    #[test]
    fn curvature_uses_squared_derivative() {
        let mut tanh = Activation::new(Tanh);
        let mut input = StateBuffer::from_values([2], vec![0.0, 1.0]).unwrap();
        let mut output = StateBuffer::default();
        tanh.evaluate(&input, &mut output).unwrap();
        output.curvature_mut().fill(1.0);
        tanh.curvature_backpropagate(&mut input, &output).unwrap();
        assert_relative_eq!(input.curvature()[0], 1.0);
        assert_relative_eq!(input.curvature()[1], (1.0 - 1.0f32.tanh().powi(2)).powi(2));
    }

    #[test]
    fn keeps_input_shape() {
        let mut sigmoid = Activation::named("squash", Sigmoid);
        let input = StateBuffer::new([2, 3]);
        let mut output = StateBuffer::default();
        sigmoid.evaluate(&input, &mut output).unwrap();
        assert_eq!(output.shape(), input.shape());
        assert!(output.value().iter().all(|&y| y == 0.5));
        assert_eq!(sigmoid.name(), "squash");
    }

    #[test]
    fn mismatched_output_leaves_input_untouched() {
        let mut tanh = Activation::new(Tanh);
        let mut input = StateBuffer::from_values([3], vec![0.1, 0.2, 0.3]).unwrap();
        let mut output = StateBuffer::new([2]);
        output.gradient_mut().fill(1.0);
        output.curvature_mut().fill(1.0);
        assert!(matches!(
            tanh.backpropagate(&mut input, &output),
            Err(Error::ShapeMismatch { .. })
        ));
        assert!(matches!(
            tanh.curvature_backpropagate(&mut input, &output),
            Err(Error::ShapeMismatch { .. })
        ));
        assert!(input.gradient().iter().all(|&g| g == 0.0));
        assert!(input.curvature().iter().all(|&c| c == 0.0));
    }
}
