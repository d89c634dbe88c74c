use std::slice;

use tracing::trace;

use crate::{
    Error, Initializer, Module, Result,
    core::{Field, Shape, StateBuffer},
    module::Pass,
};

/// Lifts a module with a native input rank (its operating order `k`) to inputs of higher rank.
///
/// Inputs of rank `k` go straight to the base module. Higher ranks are split along axis 0 and
/// each slice is processed the same way until rank `k` is reached; results are stacked back
/// along axis 0. The base module is assumed to keep the rank of its input.
///
/// Before the backward pass of each slice, the base is evaluated on that slice again, so bases
/// that cache activations (chains with hidden buffers) see the slice they are differentiated
/// on. A backward pass over `n` slices therefore also makes `n` extra `evaluate` calls on the
/// base. Bases that only read the `input`/`output` pair they are handed can skip this with
/// [`with_replay(false)`](Self::with_replay).
#[derive(Debug)]
pub struct ReplicatedModule {
    name: String,
    base: Box<dyn Module>,
    order: usize,
    replay: bool,
}

impl ReplicatedModule {
    /// Wraps `base` using its declared [`replicable_order`](Module::replicable_order).
    pub fn new(base: impl Module + 'static) -> Result<Self> {
        Self::from_boxed(Box::new(base))
    }

    pub fn from_boxed(base: Box<dyn Module>) -> Result<Self> {
        match base.replicable_order() {
            Some(order) => Self::with_order_boxed(base, order),
            None => Err(Error::NotReplicable(base.name().to_owned())),
        }
    }

    /// Wraps `base` with an explicit operating order.
    pub fn with_order(base: impl Module + 'static, order: usize) -> Result<Self> {
        Self::with_order_boxed(Box::new(base), order)
    }

    pub fn with_order_boxed(base: Box<dyn Module>, order: usize) -> Result<Self> {
        if order == 0 {
            return Err(Error::NotReplicable(base.name().to_owned()));
        }
        Ok(Self {
            name: format!("replicated {}", base.name()),
            base,
            order,
            replay: true,
        })
    }

    /// Whether backward passes over slices evaluate the base on each slice first.
    pub fn with_replay(mut self, replay: bool) -> Self {
        self.replay = replay;
        self
    }

    pub fn replays(&self) -> bool {
        self.replay
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn base(&self) -> &dyn Module {
        self.base.as_ref()
    }

    fn check_rank(&self, rank: usize) -> Result<()> {
        if rank < self.order {
            return Err(Error::OrderMismatch {
                module: self.name.clone(),
                order: self.order,
                rank,
            });
        }
        Ok(())
    }

    fn evaluate_slices(&mut self, input: &StateBuffer, output: &mut StateBuffer) -> Result<()> {
        if input.rank() == self.order {
            return self.base.evaluate(input, output);
        }
        let n = input.shape()[0];
        if n == 0 {
            let shape = self.size_forward(input.shape())?;
            output.resize(&shape);
            return Ok(());
        }
        let reuse_output = output.rank() == input.rank() && output.shape()[0] == n;
        let mut slices = Vec::with_capacity(n);
        for i in 0..n {
            let x = input.select(0, i)?;
            let mut y = if reuse_output {
                output.select(0, i)?
            } else {
                StateBuffer::default()
            };
            self.evaluate_slices(&x, &mut y)?;
            slices.push(y);
        }
        output.assign_stacked(&slices, Field::Value)?;
        Ok(())
    }

    fn backward_slices(
        &mut self,
        pass: Pass,
        input: &mut StateBuffer,
        output: &StateBuffer,
    ) -> Result<()> {
        if input.rank() == self.order {
            if !self.replay {
                return pass.run(self.base.as_mut(), input, output);
            }
            let mut replayed = output.clone();
            self.base.evaluate(input, &mut replayed)?;
            return pass.run(self.base.as_mut(), input, &replayed);
        }
        let n = input.shape()[0];
        if output.rank() != input.rank() || output.shape()[0] != n {
            return Err(Error::shape_mismatch(
                &self.name,
                format_args!("an output with {n} slices along axis 0"),
                output.shape(),
            ));
        }
        let field = pass.field();
        for i in 0..n {
            let mut x = input.select(0, i)?;
            let y = output.select(0, i)?;
            self.backward_slices(pass, &mut x, &y)?;
            input.store_selected(i, field, &x)?;
        }
        Ok(())
    }

    fn backward(&mut self, pass: Pass, input: &mut StateBuffer, output: &StateBuffer) -> Result<()> {
        self.check_rank(input.rank())?;
        if input.rank() == self.order {
            return pass.run(self.base.as_mut(), input, output);
        }
        trace!(module = %self.name, ?pass, shape = %input.shape(), "backward over slices");
        self.backward_slices(pass, input, output)
    }
}

impl Module for ReplicatedModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&mut self, input: &StateBuffer, output: &mut StateBuffer) -> Result<()> {
        self.check_rank(input.rank())?;
        trace!(module = %self.name, shape = %input.shape(), "evaluate");
        self.evaluate_slices(input, output)
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

    fn size_forward(&self, input: &Shape) -> Result<Shape> {
        self.check_rank(input.rank())?;
        let (outer, inner) = input.split_outer(input.rank() - self.order);
        Ok(outer.concat(&self.base.size_forward(&inner)?))
    }

    fn size_backward(&self, output: &Shape) -> Result<Shape> {
        self.check_rank(output.rank())?;
        let (outer, inner) = output.split_outer(output.rank() - self.order);
        Ok(outer.concat(&self.base.size_backward(&inner)?))
    }

    fn initialize_parameters(&mut self, init: &mut Initializer) {
        self.base.initialize_parameters(init);
    }

    fn buffer_reuse_hint(&self) -> bool {
        self.base.buffer_reuse_hint()
    }

    fn try_clone(&self) -> Result<Box<dyn Module>> {
        Ok(Box::new(Self {
            name: self.name.clone(),
            base: self.base.try_clone()?,
            order: self.order,
            replay: self.replay,
        }))
    }

    fn children(&self) -> &[Box<dyn Module>] {
        slice::from_ref(&self.base)
    }

    fn clear_hidden(&mut self, field: Field) -> Result<()> {
        self.base.clear_hidden(field)
    }

    fn compile(self: Box<Self>) -> Result<Box<dyn Module>> {
        let Self {
            name,
            base,
            order,
            replay,
        } = *self;
        Ok(Box::new(Self {
            name,
            base: base.compile()?,
            order,
            replay,
        }))
    }

    fn describe(&self) -> String {
        format!("{} over rank {}: {}", self.name, self.order, self.base.describe())
    }
}
