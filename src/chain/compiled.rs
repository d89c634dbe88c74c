use tracing::{debug, trace};

use crate::{
    DescribeModules, Error, Initializer, Module, Result,
    chain::{
        ChainOptions, ModuleChain,
        route::{self, Dst, Src, Step},
    },
    core::{Field, MultiState, Shape, StateArena, StateBuffer, StateHandle, StateView, Window},
    module::Pass,
};

/// A step of the fixed plan, with the index of the main path value it reads.
#[derive(Debug, Clone, Copy)]
struct Planned {
    step: Step,
    value: usize,
}

/// Memory-optimized form of a [`ModuleChain`], made by
/// [`ModuleChain::optimize_evaluate`].
///
/// The main path runs through a rotation of buffers: a step writes into the free buffer and, if
/// its module's [`buffer_reuse_hint`](Module::buffer_reuse_hint) allows, frees the buffer it read
/// from. With every hint set the whole chain needs two buffers however long it is. A pinned
/// input stays out of the rotation and a new buffer joins it.
///
/// Overwritten values are recomputed during the backward passes: before running the backward
/// pass of a step, the steps before it are evaluated again. Branches are compiled on their own
/// and never share buffers with their parent.
#[derive(Debug)]
pub struct CompiledChain {
    options: ChainOptions,
    modules: Vec<Box<dyn Module>>,
    arena: StateArena,
    plan: Vec<Planned>,
    /// Buffers of the rotation, pinned ones included.
    rotation: Vec<StateHandle>,
    retained: Option<StateHandle>,
    narrowed: Option<StateHandle>,
}

impl CompiledChain {
    pub(crate) fn compile(chain: ModuleChain) -> Result<Self> {
        if chain.is_empty() && !chain.options().branch {
            return Err(Error::EmptyChain(chain.options().name.clone()));
        }
        let parts = chain.into_parts();
        let modules = parts
            .modules
            .into_iter()
            .map(|module| module.compile())
            .collect::<Result<Vec<_>>>()?;
        let mut arena = StateArena::new();
        // The retained output keeps its storage so that views into it stay valid.
        let retained = parts
            .retained
            .map(|handle| parts.arena.shared(handle).map(|slot| arena.adopt(slot)))
            .transpose()?;
        let narrowed = parts
            .options
            .narrow
            .map(|_| arena.alloc(StateBuffer::default()));
        let mut compiled = Self {
            options: parts.options,
            modules,
            arena,
            plan: Vec::new(),
            rotation: Vec::new(),
            retained,
            narrowed,
        };
        compiled.plan();
        debug!(
            chain = %compiled.options.name,
            steps = compiled.plan.len(),
            buffers = compiled.rotation.len(),
            "compiled chain"
        );
        Ok(compiled)
    }

    pub fn options(&self) -> &ChainOptions {
        &self.options
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn modules(&self) -> &[Box<dyn Module>] {
        &self.modules
    }

    pub fn find(&self, name: &str) -> Option<&dyn Module> {
        route::find(&self.modules, name)
    }

    /// Number of buffers the main path rotates through.
    pub fn n_buffers(&self) -> usize {
        self.rotation.len()
    }

    pub fn output_view(&self) -> Option<StateView> {
        self.retained.and_then(|handle| self.arena.view(handle).ok())
    }

    fn entry(&self) -> Src {
        self.narrowed.map_or(Src::Input, Src::Hidden)
    }

    fn narrowing(&self) -> Option<(Window, StateHandle)> {
        self.options.narrow.zip(self.narrowed)
    }

    fn plan(&mut self) {
        let destination = self.retained.map_or(Dst::Output, Dst::Hidden);
        let n = self.modules.len();
        let ends_on_main_path = self.modules.last().is_some_and(|m| !m.is_branch());
        // Branches write nowhere the parent reads; they all share one scratch output.
        let sink = self
            .modules
            .iter()
            .any(|m| m.is_branch())
            .then(|| self.arena.alloc(StateBuffer::default()));
        let mut live = self.entry();
        let mut free: Option<StateHandle> = None;
        let mut value = 0;
        for i in 0..n {
            let module = &self.modules[i];
            if module.is_branch() {
                if let Some(sink) = sink {
                    self.plan.push(Planned {
                        step: Step::Apply {
                            module: i,
                            src: live,
                            dst: Dst::Hidden(sink),
                        },
                        value,
                    });
                }
                continue;
            }
            let dst = if i + 1 == n && ends_on_main_path {
                destination
            } else {
                let handle = match free.take() {
                    Some(handle) => handle,
                    None => {
                        let handle = self.arena.alloc(StateBuffer::default());
                        self.rotation.push(handle);
                        handle
                    }
                };
                Dst::Hidden(handle)
            };
            self.plan.push(Planned {
                step: Step::Apply {
                    module: i,
                    src: live,
                    dst,
                },
                value,
            });
            match live {
                Src::Hidden(handle) if self.rotation.contains(&handle) => {
                    if module.buffer_reuse_hint() {
                        free = Some(handle);
                    } else {
                        trace!(module = module.name(), %handle, "input pinned");
                    }
                }
                _ => (),
            }
            if let Dst::Hidden(handle) = dst {
                live = Src::Hidden(handle);
            }
            value += 1;
        }
        if !ends_on_main_path {
            self.plan.push(Planned {
                step: Step::PassThrough {
                    src: live,
                    dst: destination,
                },
                value,
            });
        }
    }

    fn is_rotation(&self, src: Src) -> Option<StateHandle> {
        match src {
            Src::Hidden(handle) if self.rotation.contains(&handle) => Some(handle),
            _ => None,
        }
    }

    fn is_rotation_dst(&self, dst: Dst) -> Option<StateHandle> {
        match dst {
            Dst::Hidden(handle) if self.rotation.contains(&handle) => Some(handle),
            _ => None,
        }
    }

    /// Evaluates `plan[index]`.
    fn run_forward(
        &mut self,
        index: usize,
        input: &StateBuffer,
        output: &mut StateBuffer,
    ) -> Result<()> {
        match self.plan[index].step {
            Step::Apply { module, src, dst } => {
                let module = &mut self.modules[module];
                route::forward_pair(&self.arena, input, output, src, dst, |x, y| {
                    module.evaluate(x, y)
                })
            }
            Step::PassThrough { src, dst } => {
                route::forward_pair(&self.arena, input, output, src, dst, |x, y| {
                    y.copy_value_from(x);
                    Ok(())
                })
            }
        }
    }

    /// Restores the value read by `plan[index]` by evaluating the main path up to it.
    fn replay(&mut self, index: usize, input: &StateBuffer, output: &mut StateBuffer) -> Result<()> {
        route::gather(&self.arena, self.narrowing(), input)?;
        for i in 0..index {
            let is_main = match self.plan[i].step {
                Step::Apply { module, .. } => !self.modules[module].is_branch(),
                Step::PassThrough { .. } => true,
            };
            if is_main {
                self.run_forward(i, input, output)?;
            }
        }
        Ok(())
    }

    fn backward(&mut self, pass: Pass, input: &mut StateBuffer, output: &StateBuffer) -> Result<()> {
        if self.modules.is_empty() && !self.options.branch {
            return Err(route::empty_chain(&self.options.name));
        }
        let field = pass.field();
        if !self.options.branch {
            self.clear_hidden(field)?;
        }
        debug!(chain = %self.options.name, ?pass, "backward, memory-optimized");
        // Derivative of the main path value last read, carried across rotation buffers that
        // get reused in between.
        let mut carry: Option<(usize, Vec<f32>)> = None;
        // Forward replays write into the caller's output only when it is the destination of the
        // step being replayed, and then with the value it already holds.
        let mut scratch = output.clone();
        for index in (0..self.plan.len()).rev() {
            let Planned { step, value } = self.plan[index];
            self.replay(index, input, &mut scratch)?;
            if matches!(step, Step::Apply { .. }) {
                self.run_forward(index, input, &mut scratch)?;
            }
            if let Some(handle) = self.is_rotation_dst(step.dst()) {
                let mut dst = self.arena.get_mut(handle)?;
                match &carry {
                    Some((v, derivative)) if *v == value + 1 => {
                        load_field(&self.options.name, &mut dst, field, derivative)?
                    }
                    _ => dst.clear(field),
                }
            }
            let rotation_src = self.is_rotation(step.src());
            if let Some(handle) = rotation_src {
                let mut src = self.arena.get_mut(handle)?;
                match &carry {
                    Some((v, derivative)) if *v == value => {
                        load_field(&self.options.name, &mut src, field, derivative)?
                    }
                    _ => src.clear(field),
                }
            }
            match step {
                Step::Apply { module, src, dst } => {
                    let module = &mut self.modules[module];
                    trace!(module = module.name(), ?pass, "backward step");
                    route::backward_pair(&self.arena, input, output, src, dst, |x, y| {
                        pass.run(module.as_mut(), x, y)
                    })?;
                }
                Step::PassThrough { src, dst } => {
                    route::backward_pair(&self.arena, input, output, src, dst, |x, y| {
                        Ok(x.accumulate(field, y)?)
                    })?;
                }
            }
            carry = match rotation_src {
                Some(handle) => Some((value, self.arena.get(handle)?.field(field).to_vec())),
                None => None,
            };
        }
        route::scatter(&self.arena, self.narrowing(), field, input)
    }
}

fn load_field(name: &str, state: &mut StateBuffer, field: Field, data: &[f32]) -> Result<()> {
    let target = state.field_mut(field);
    if target.len() != data.len() {
        return Err(Error::shape_mismatch(
            name,
            format_args!("{} elements", data.len()),
            format_args!("{} elements", target.len()),
        ));
    }
    target.copy_from_slice(data);
    Ok(())
}

impl Module for CompiledChain {
    fn name(&self) -> &str {
        &self.options.name
    }

    fn evaluate(&mut self, input: &StateBuffer, output: &mut StateBuffer) -> Result<()> {
        if self.modules.is_empty() && !self.options.branch {
            return Err(route::empty_chain(&self.options.name));
        }
        debug!(chain = %self.options.name, shape = %input.shape(), "evaluate, memory-optimized");
        route::gather(&self.arena, self.narrowing(), input)?;
        for index in 0..self.plan.len() {
            self.run_forward(index, input, output)?;
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

    fn evaluate_multi(&mut self, _: &MultiState, _: &mut MultiState) -> Result<()> {
        Err(Error::ModeConflict(self.options.name.clone()))
    }

    fn backpropagate_multi(&mut self, _: &mut MultiState, _: &MultiState) -> Result<()> {
        Err(Error::ModeConflict(self.options.name.clone()))
    }

    fn curvature_backpropagate_multi(&mut self, _: &mut MultiState, _: &MultiState) -> Result<()> {
        Err(Error::ModeConflict(self.options.name.clone()))
    }

    fn size_forward(&self, input: &Shape) -> Result<Shape> {
        route::size_forward(&self.modules, self.options.narrow, input)
    }

    fn size_backward(&self, output: &Shape) -> Result<Shape> {
        route::size_backward(&self.modules, self.options.narrow, output)
    }

    fn initialize_parameters(&mut self, init: &mut Initializer) {
        for module in &mut self.modules {
            module.initialize_parameters(init);
        }
    }

    fn try_clone(&self) -> Result<Box<dyn Module>> {
        let modules = self
            .modules
            .iter()
            .map(|module| module.try_clone())
            .collect::<Result<Vec<_>>>()?;
        let chain = ModuleChain::from_modules(self.options.clone(), modules);
        Ok(Box::new(chain.optimize_evaluate()?))
    }

    fn is_branch(&self) -> bool {
        self.options.branch
    }

    fn last_module(&self) -> &dyn Module {
        match self.modules.last() {
            Some(module) => module.last_module(),
            None => self,
        }
    }

    fn children(&self) -> &[Box<dyn Module>] {
        &self.modules
    }

    fn clear_hidden(&mut self, field: Field) -> Result<()> {
        route::clear_hidden(&self.arena, &mut self.modules, field)
    }

    fn describe(&self) -> String {
        DescribeModules::new(&self.options.name, &self.modules).to_string()
    }

    fn pretty(&self, input: &Shape) -> Result<String> {
        let inner = route::pretty(&self.modules, self.options.narrow, input)?;
        if self.options.branch {
            Ok(format!(" -> [{}{} ]", self.options.name, inner))
        } else {
            Ok(inner)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Activation, activation_functions::Identity};

    #[derive(Debug)]
    struct Pinning;

    impl Module for Pinning {
        fn name(&self) -> &str {
            "pinning"
        }

        fn buffer_reuse_hint(&self) -> bool {
            false
        }
    }

    fn identities(n: usize) -> ModuleChain {
        let mut chain = ModuleChain::new("net");
        for _ in 0..n {
            chain.push(Activation::new(Identity));
        }
        chain
    }

    #[test]
    fn long_chain_uses_two_buffers() {
        let compiled = identities(6).optimize_evaluate().unwrap();
        assert_eq!(compiled.n_buffers(), 2);
        assert_eq!(identities(2).optimize_evaluate().unwrap().n_buffers(), 1);
    }

    #[test]
    fn pinned_input_adds_a_buffer() {
        let chain = identities(2)
            .with(Pinning)
            .with(Activation::new(Identity))
            .with(Activation::new(Identity));
        let compiled = chain.optimize_evaluate().unwrap();
        assert_eq!(compiled.n_buffers(), 3);
    }

    #[test]
    fn consecutive_steps_never_share_a_buffer() {
        let compiled = identities(5).optimize_evaluate().unwrap();
        for planned in &compiled.plan {
            if let (Src::Hidden(x), Dst::Hidden(y)) = (planned.step.src(), planned.step.dst()) {
                assert_ne!(x, y);
            }
        }
    }

    #[test]
    fn multi_state_is_a_mode_conflict() {
        let mut compiled = identities(2).optimize_evaluate().unwrap();
        let input = MultiState::with_shape(1, &Shape::from([2]));
        let mut output = MultiState::with_shape(1, &Shape::from([2]));
        assert_eq!(
            compiled.evaluate_multi(&input, &mut output),
            Err(Error::ModeConflict("net".into()))
        );
    }
}
