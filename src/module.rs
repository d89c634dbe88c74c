use std::{fmt::Debug, iter};

use crate::{
    Error, Initializer, Result,
    core::{Field, MultiState, Shape, StateBuffer},
};

/// Conversions into trait objects, implemented for every sized module. Lets default methods of
/// [`Module`] hand out `self` as `&dyn Module` or `Box<dyn Module>`.
pub trait AsModule {
    fn as_module(&self) -> &dyn Module;

    fn into_module(self: Box<Self>) -> Box<dyn Module>;
}

impl<M: Module + 'static> AsModule for M {
    fn as_module(&self) -> &dyn Module {
        self
    }

    fn into_module(self: Box<Self>) -> Box<dyn Module> {
        self
    }
}

/// A unary transform with a value pass, a gradient pass and a curvature pass.
///
/// `evaluate(input, output)` computes `output.value` from `input.value`, resizing `output` as
/// needed. `backpropagate(input, output)` reads `output.gradient` and *accumulates* into
/// `input.gradient` (and into any parameter gradients the module owns); it is only valid right
/// after `evaluate` on the same pair. `curvature_backpropagate` does the same for the diagonal
/// second derivative held in `curvature`.
pub trait Module: AsModule + Debug {
    fn name(&self) -> &str;

    fn evaluate(&mut self, input: &StateBuffer, output: &mut StateBuffer) -> Result<()> {
        let _ = (input, output);
        Err(Error::unimplemented(self.name(), "evaluate"))
    }

    fn backpropagate(&mut self, input: &mut StateBuffer, output: &StateBuffer) -> Result<()> {
        let _ = (input, output);
        Err(Error::unimplemented(self.name(), "backpropagate"))
    }

    fn curvature_backpropagate(
        &mut self,
        input: &mut StateBuffer,
        output: &StateBuffer,
    ) -> Result<()> {
        let _ = (input, output);
        Err(Error::unimplemented(self.name(), "curvature_backpropagate"))
    }

    fn evaluate_multi(&mut self, input: &MultiState, output: &mut MultiState) -> Result<()> {
        check_multi(self.name(), input, output)?;
        for (input, output) in iter::zip(input.iter(), output.iter_mut()) {
            self.evaluate(input, output)?;
        }
        Ok(())
    }

    fn backpropagate_multi(&mut self, input: &mut MultiState, output: &MultiState) -> Result<()> {
        check_multi(self.name(), input, output)?;
        for (input, output) in iter::zip(input.iter_mut(), output.iter()) {
            self.backpropagate(input, output)?;
        }
        Ok(())
    }

    fn curvature_backpropagate_multi(
        &mut self,
        input: &mut MultiState,
        output: &MultiState,
    ) -> Result<()> {
        check_multi(self.name(), input, output)?;
        for (input, output) in iter::zip(input.iter_mut(), output.iter()) {
            self.curvature_backpropagate(input, output)?;
        }
        Ok(())
    }

    /// Output shape for an input of shape `input`.
    fn size_forward(&self, input: &Shape) -> Result<Shape> {
        Ok(input.clone())
    }

    /// Input shape that produces an output of shape `output`.
    fn size_backward(&self, output: &Shape) -> Result<Shape> {
        Ok(output.clone())
    }

    fn initialize_parameters(&mut self, init: &mut Initializer) {
        let _ = init;
    }

    /// Whether the input buffer is dead once `evaluate` has returned, so that later stages may
    /// overwrite it. Modules that read their input again during the backward pass still return
    /// `true`: the memory-optimized chain recomputes what it overwrote. `false` pins the input.
    fn buffer_reuse_hint(&self) -> bool {
        true
    }

    fn try_clone(&self) -> Result<Box<dyn Module>> {
        Err(Error::CloneUnsupported(self.name().to_owned()))
    }

    /// Branches keep their result to themselves; the enclosing chain passes their input on.
    fn is_branch(&self) -> bool {
        false
    }

    /// Innermost last module. Containers forward to their last child.
    fn last_module(&self) -> &dyn Module {
        self.as_module()
    }

    /// Modules contained in this one, in evaluation order.
    fn children(&self) -> &[Box<dyn Module>] {
        &[]
    }

    /// Native input rank, for modules that [`ReplicatedModule`](crate::ReplicatedModule) can
    /// lift to higher ranks.
    fn replicable_order(&self) -> Option<usize> {
        None
    }

    /// Zeroes `field` of every hidden buffer, including those of nested containers.
    fn clear_hidden(&mut self, field: Field) -> Result<()> {
        let _ = field;
        Ok(())
    }

    /// Memory-optimized form of the module. Containers compile their children.
    fn compile(self: Box<Self>) -> Result<Box<dyn Module>> {
        Ok(self.into_module())
    }

    fn describe(&self) -> String {
        self.name().to_owned()
    }

    /// `" -> name -> (dims)"` for an input of shape `input`.
    fn pretty(&self, input: &Shape) -> Result<String> {
        Ok(format!(" -> {} -> {}", self.name(), self.size_forward(input)?))
    }
}

fn check_multi(name: &str, input: &MultiState, output: &MultiState) -> Result<()> {
    if input.is_empty() || input.len() != output.len() {
        return Err(Error::shape_mismatch(
            name,
            format_args!("{} non-empty states on both sides", input.len()),
            format_args!("{} on the output side", output.len()),
        ));
    }
    Ok(())
}

/// Which derivative a backward pass propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pass {
    Gradient,
    Curvature,
}

impl Pass {
    pub(crate) fn field(self) -> Field {
        match self {
            Pass::Gradient => Field::Gradient,
            Pass::Curvature => Field::Curvature,
        }
    }

    pub(crate) fn run(
        self,
        module: &mut dyn Module,
        input: &mut StateBuffer,
        output: &StateBuffer,
    ) -> Result<()> {
        match self {
            Pass::Gradient => module.backpropagate(input, output),
            Pass::Curvature => module.curvature_backpropagate(input, output),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Bare;

    impl Module for Bare {
        fn name(&self) -> &str {
            "bare"
        }
    }

    #[derive(Debug)]
    struct Negate;

    impl Module for Negate {
        fn name(&self) -> &str {
            "negate"
        }

        fn evaluate(&mut self, input: &StateBuffer, output: &mut StateBuffer) -> Result<()> {
            output.resize_as(input);
            for (y, &x) in iter::zip(output.value_mut(), input.value()) {
                *y = -x;
            }
            Ok(())
        }
    }

    #[test]
    fn defaults() {
        let mut bare = Bare;
        let mut state = StateBuffer::new([2]);
        let out = StateBuffer::new([2]);
        assert_eq!(
            bare.backpropagate(&mut state, &out),
            Err(Error::UnimplementedOp {
                module: "bare".into(),
                op: "backpropagate"
            })
        );
        assert_eq!(bare.size_forward(&Shape::from([3, 4])), Ok(Shape::from([3, 4])));
        assert_eq!(bare.size_backward(&Shape::from([3])), Ok(Shape::from([3])));
        assert!(bare.buffer_reuse_hint());
        assert!(!bare.is_branch());
        assert_eq!(bare.last_module().name(), "bare");
        assert_eq!(
            bare.try_clone().err(),
            Some(Error::CloneUnsupported("bare".into()))
        );
        assert_eq!(bare.pretty(&Shape::from([2])).unwrap(), " -> bare -> (2)");
    }

    #[test]
    fn multi_state_applies_per_position() {
        let mut negate = Negate;
        let input: MultiState = [
            StateBuffer::from_values([2], vec![1., 2.]).unwrap(),
            StateBuffer::from_values([1], vec![3.]).unwrap(),
        ]
        .into_iter()
        .collect();
        let mut output = MultiState::with_shape(2, &Shape::from([1]));
        negate.evaluate_multi(&input, &mut output).unwrap();
        assert_eq!(output[0].value(), &[-1., -2.]);
        assert_eq!(output[1].value(), &[-3.]);
    }

    #[test]
    fn multi_state_length_mismatch() {
        let mut negate = Negate;
        let input = MultiState::with_shape(2, &Shape::from([1]));
        let mut output = MultiState::with_shape(3, &Shape::from([1]));
        assert!(matches!(
            negate.evaluate_multi(&input, &mut output),
            Err(Error::ShapeMismatch { .. })
        ));
        let mut empty = MultiState::new();
        assert!(matches!(
            negate.evaluate_multi(&MultiState::new(), &mut empty),
            Err(Error::ShapeMismatch { .. })
        ));
    }
}
