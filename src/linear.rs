use std::iter;

use faer::{linalg::matmul::matmul, prelude::*};

use crate::{
    Error, Initializer, Module, PrettyPrintLinear, Result,
    core::{Field, Shape, StateBuffer},
};

/// Fully connected layer `y = W x + b` on rank 1 states.
///
/// Owns its parameters together with their accumulated gradients and curvatures. Weights are
/// stored column-major, `n_outputs` rows by `n_inputs` columns.
#[derive(Debug, Clone)]
pub struct Linear {
    name: String,
    n_inputs: usize,
    n_outputs: usize,
    w: Vec<f32>,
    b: Vec<f32>,
    dw: Vec<f32>,
    db: Vec<f32>,
    ddw: Vec<f32>,
    ddb: Vec<f32>,
}

impl Linear {
    /// Zero-initialized layer.
    pub fn new(name: impl Into<String>, n_inputs: usize, n_outputs: usize) -> Self {
        let n_weights = n_inputs * n_outputs;
        Self {
            name: name.into(),
            n_inputs,
            n_outputs,
            w: bytemuck::zeroed_vec(n_weights),
            b: bytemuck::zeroed_vec(n_outputs),
            dw: bytemuck::zeroed_vec(n_weights),
            db: bytemuck::zeroed_vec(n_outputs),
            ddw: bytemuck::zeroed_vec(n_weights),
            ddb: bytemuck::zeroed_vec(n_outputs),
        }
    }

    /// Layer with `W[i, j] = f(i, j)` and a zero bias.
    pub fn from_fn(
        name: impl Into<String>,
        n_inputs: usize,
        n_outputs: usize,
        mut f: impl FnMut(usize, usize) -> f32,
    ) -> Self {
        let mut linear = Self::new(name, n_inputs, n_outputs);
        for j in 0..n_inputs {
            for i in 0..n_outputs {
                linear.w[j * n_outputs + i] = f(i, j);
            }
        }
        linear
    }

    pub fn n_inputs(&self) -> usize {
        self.n_inputs
    }

    pub fn n_outputs(&self) -> usize {
        self.n_outputs
    }

    pub fn weights(&self) -> MatRef<'_, f32> {
        MatRef::from_column_major_slice(&self.w, self.n_outputs, self.n_inputs)
    }

    pub fn weight_gradient(&self) -> MatRef<'_, f32> {
        MatRef::from_column_major_slice(&self.dw, self.n_outputs, self.n_inputs)
    }

    pub fn weight_curvature(&self) -> MatRef<'_, f32> {
        MatRef::from_column_major_slice(&self.ddw, self.n_outputs, self.n_inputs)
    }

    pub fn bias(&self) -> ColRef<'_, f32> {
        ColRef::from_slice(&self.b)
    }

    pub fn bias_mut(&mut self) -> ColMut<'_, f32> {
        ColMut::from_slice_mut(&mut self.b)
    }

    pub fn bias_gradient(&self) -> ColRef<'_, f32> {
        ColRef::from_slice(&self.db)
    }

    pub fn bias_curvature(&self) -> ColRef<'_, f32> {
        ColRef::from_slice(&self.ddb)
    }

    pub fn pretty_print(&self) -> PrettyPrintLinear<'_> {
        PrettyPrintLinear::new(&self.name, self.weights(), self.bias())
    }

    /// Zeroes the accumulated parameter gradients or curvatures.
    pub fn clear_parameter_derivatives(&mut self, field: Field) {
        match field {
            Field::Value => (),
            Field::Gradient => {
                bytemuck::fill_zeroes(&mut self.dw);
                bytemuck::fill_zeroes(&mut self.db);
            }
            Field::Curvature => {
                bytemuck::fill_zeroes(&mut self.ddw);
                bytemuck::fill_zeroes(&mut self.ddb);
            }
        }
    }

    fn check_input(&self, input: &Shape) -> Result<()> {
        if input.dims() != [self.n_inputs] {
            return Err(Error::shape_mismatch(
                &self.name,
                Shape::new([self.n_inputs]),
                input,
            ));
        }
        Ok(())
    }

    fn check_output(&self, output: &Shape) -> Result<()> {
        if output.dims() != [self.n_outputs] {
            return Err(Error::shape_mismatch(
                &self.name,
                Shape::new([self.n_outputs]),
                output,
            ));
        }
        Ok(())
    }
}

impl Module for Linear {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&mut self, input: &StateBuffer, output: &mut StateBuffer) -> Result<()> {
        self.check_input(input.shape())?;
        output.resize(&Shape::new([self.n_outputs]));
        let w = MatRef::from_column_major_slice(&self.w, self.n_outputs, self.n_inputs);
        // y = W * x
        matmul(
            ColMut::from_slice_mut(output.value_mut()),
            faer::Accum::Replace,
            w,
            ColRef::from_slice(input.value()),
            1.0,
            Par::Seq,
        );
        // y += b
        for (y, &b) in iter::zip(output.value_mut(), &self.b) {
            *y += b;
        }
        Ok(())
    }

    fn backpropagate(&mut self, input: &mut StateBuffer, output: &StateBuffer) -> Result<()> {
        self.check_input(input.shape())?;
        self.check_output(output.shape())?;
        let n_outputs = self.n_outputs;
        let dy = output.gradient();
        let (x, dx) = input.split_mut(Field::Gradient);
        // dW += dy * x^T; db += dy
        for (j, &xj) in x.iter().enumerate() {
            for (i, &dyi) in dy.iter().enumerate() {
                self.dw[j * n_outputs + i] += dyi * xj;
            }
        }
        for (db, &dyi) in iter::zip(&mut self.db, dy) {
            *db += dyi;
        }
        // dx += W^T * dy
        let w = MatRef::from_column_major_slice(&self.w, n_outputs, self.n_inputs);
        matmul(
            ColMut::from_slice_mut(dx),
            faer::Accum::Add,
            w.transpose(),
            ColRef::from_slice(dy),
            1.0,
            Par::Seq,
        );
        Ok(())
    }

    /// Gauss-Newton curvature: squared weights and squared inputs.
    fn curvature_backpropagate(
        &mut self,
        input: &mut StateBuffer,
        output: &StateBuffer,
    ) -> Result<()> {
        self.check_input(input.shape())?;
        self.check_output(output.shape())?;
        let n_outputs = self.n_outputs;
        let ddy = output.curvature();
        let (x, ddx) = input.split_mut(Field::Curvature);
        for (j, (&xj, ddxj)) in iter::zip(x, ddx).enumerate() {
            let column = j * n_outputs..(j + 1) * n_outputs;
            for ((&w, ddw), &ddyi) in iter::zip(
                iter::zip(&self.w[column.clone()], &mut self.ddw[column]),
                ddy,
            ) {
                *ddw += ddyi * xj * xj;
                *ddxj += ddyi * w * w;
            }
        }
        for (ddb, &ddyi) in iter::zip(&mut self.ddb, ddy) {
            *ddb += ddyi;
        }
        Ok(())
    }

    fn size_forward(&self, input: &Shape) -> Result<Shape> {
        self.check_input(input)?;
        Ok(Shape::new([self.n_outputs]))
    }

    fn size_backward(&self, output: &Shape) -> Result<Shape> {
        self.check_output(output)?;
        Ok(Shape::new([self.n_inputs]))
    }

    fn initialize_parameters(&mut self, init: &mut Initializer) {
        init.fill(self.n_inputs, &mut self.w);
        init.fill(self.n_inputs, &mut self.b);
    }

    fn replicable_order(&self) -> Option<usize> {
        Some(1)
    }

    fn try_clone(&self) -> Result<Box<dyn Module>> {
        Ok(Box::new(self.clone()))
    }

    fn describe(&self) -> String {
        format!("{} ({} -> {})", self.name, self.n_inputs, self.n_outputs)
    }
}
