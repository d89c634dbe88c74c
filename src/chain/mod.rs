//! Sequential composition of modules.

mod compiled;
mod route;

pub use compiled::*;

use tracing::{debug, trace, warn};

use crate::{
    DescribeModules, Error, Initializer, Module, Result,
    core::{Field, MultiState, Shape, StateArena, StateBuffer, StateHandle, StateView, Window},
    module::Pass,
};

use route::{Dst, Src, Step};

#[derive(Debug, Clone, Default)]
pub struct ChainOptions {
    pub name: String,
    /// A branch keeps its result in a buffer of its own instead of writing to the caller's
    /// output. Its enclosing chain feeds the branch's input on to the next module.
    pub branch: bool,
    /// Window of the input the chain runs on. Gradients are added back into the window.
    pub narrow: Option<Window>,
}

impl ChainOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn branch(mut self) -> Self {
        self.branch = true;
        self
    }

    pub fn narrow(mut self, axis: usize, len: usize, offset: usize) -> Self {
        self.narrow = Some(Window::new(axis, len, offset));
        self
    }
}

/// Ordered list of modules run one after the other.
///
/// Every module but the last writes into a hidden buffer owned by the chain, allocated the first
/// time it is needed. Backward passes walk the modules in reverse and read the same buffers, so
/// each module sees the pair it was evaluated on.
#[derive(Debug)]
pub struct ModuleChain {
    options: ChainOptions,
    modules: Vec<Box<dyn Module>>,
    arena: StateArena,
    hiddens: Vec<Option<StateHandle>>,
    /// Output of a branch.
    retained: Option<StateHandle>,
    /// Entry buffer of a narrowing chain.
    narrowed: Option<StateHandle>,
}

impl ModuleChain {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_options(ChainOptions::new(name))
    }

    pub fn branch(name: impl Into<String>) -> Self {
        Self::with_options(ChainOptions::new(name).branch())
    }

    pub fn with_options(options: ChainOptions) -> Self {
        let mut arena = StateArena::new();
        let retained = options
            .branch
            .then(|| arena.alloc(StateBuffer::default()));
        let narrowed = options.narrow.map(|_| arena.alloc(StateBuffer::default()));
        Self {
            options,
            modules: Vec::new(),
            arena,
            hiddens: Vec::new(),
            retained,
            narrowed,
        }
    }

    pub fn from_modules(options: ChainOptions, modules: Vec<Box<dyn Module>>) -> Self {
        let mut chain = Self::with_options(options);
        for module in modules {
            chain.push_boxed(module);
        }
        chain
    }

    pub fn push(&mut self, module: impl Module + 'static) -> &mut Self {
        self.push_boxed(Box::new(module))
    }

    pub fn push_boxed(&mut self, module: Box<dyn Module>) -> &mut Self {
        self.modules.push(module);
        self.hiddens.push(None);
        self
    }

    /// Builder form of [`push`](Self::push).
    pub fn with(mut self, module: impl Module + 'static) -> Self {
        self.push(module);
        self
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

    pub fn module_mut(&mut self, index: usize) -> Option<&mut (dyn Module + 'static)> {
        self.modules.get_mut(index).map(|module| module.as_mut())
    }

    /// Finds a module by name, searching nested containers depth first.
    pub fn find(&self, name: &str) -> Option<&dyn Module> {
        route::find(&self.modules, name)
    }

    /// Number of hidden buffers allocated so far.
    pub fn n_hidden_allocated(&self) -> usize {
        self.hiddens.iter().flatten().count()
    }

    /// View of the output a branch retains, for modules further down the enclosing chain that
    /// consume it. `None` for chains that are not branches.
    pub fn output_view(&self) -> Option<StateView> {
        self.retained.and_then(|handle| self.arena.view(handle).ok())
    }

    /// Switches to the memory-optimized form. Children are compiled as well.
    pub fn optimize_evaluate(self) -> Result<CompiledChain> {
        CompiledChain::compile(self)
    }

    pub(crate) fn into_parts(self) -> ChainParts {
        ChainParts {
            options: self.options,
            modules: self.modules,
            arena: self.arena,
            retained: self.retained,
        }
    }

    fn hidden(&mut self, index: usize, rank: usize) -> StateHandle {
        match self.hiddens[index] {
            Some(handle) => handle,
            None => {
                let handle = self.arena.alloc(StateBuffer::minimal(rank));
                trace!(chain = %self.options.name, index, %handle, "allocated hidden buffer");
                self.hiddens[index] = Some(handle);
                handle
            }
        }
    }

    fn entry(&self) -> Src {
        self.narrowed.map_or(Src::Input, Src::Hidden)
    }

    fn destination(&self) -> Dst {
        self.retained.map_or(Dst::Output, Dst::Hidden)
    }

    fn narrowing(&self) -> Option<(Window, StateHandle)> {
        self.options.narrow.zip(self.narrowed)
    }

    /// Buffers each module reads and writes. A branch reads the running buffer without
    /// replacing it, so the module after it reads the same buffer.
    fn plan(&mut self, rank: usize) -> Vec<Step> {
        let n = self.modules.len();
        let destination = self.destination();
        let mut current = self.entry();
        let mut steps = Vec::with_capacity(n + 1);
        for i in 0..n {
            let is_branch = self.modules[i].is_branch();
            let dst = if i + 1 == n && !is_branch {
                destination
            } else {
                Dst::Hidden(self.hidden(i, rank))
            };
            steps.push(Step::Apply {
                module: i,
                src: current,
                dst,
            });
            if let (false, Dst::Hidden(handle)) = (is_branch, dst) {
                current = Src::Hidden(handle);
            }
        }
        if self.modules.last().is_none_or(|module| module.is_branch()) {
            steps.push(Step::PassThrough {
                src: current,
                dst: destination,
            });
        }
        steps
    }

    fn backward(&mut self, pass: Pass, input: &mut StateBuffer, output: &StateBuffer) -> Result<()> {
        if self.modules.is_empty() && !self.options.branch {
            return Err(route::empty_chain(&self.options.name));
        }
        let field = pass.field();
        if !self.options.branch {
            self.clear_hidden(field)?;
        }
        debug!(chain = %self.options.name, ?pass, "backward");
        let steps = self.plan(input.rank());
        for step in steps.iter().rev() {
            match *step {
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
        }
        route::scatter(&self.arena, self.narrowing(), field, input)
    }
}

/// A chain taken apart for compilation.
pub(crate) struct ChainParts {
    pub(crate) options: ChainOptions,
    pub(crate) modules: Vec<Box<dyn Module>>,
    pub(crate) arena: StateArena,
    pub(crate) retained: Option<StateHandle>,
}

impl Module for ModuleChain {
    fn name(&self) -> &str {
        &self.options.name
    }

    fn evaluate(&mut self, input: &StateBuffer, output: &mut StateBuffer) -> Result<()> {
        if self.modules.is_empty() && !self.options.branch {
            return Err(route::empty_chain(&self.options.name));
        }
        debug!(chain = %self.options.name, shape = %input.shape(), "evaluate");
        let steps = self.plan(input.rank());
        route::gather(&self.arena, self.narrowing(), input)?;
        for step in &steps {
            match *step {
                Step::Apply { module, src, dst } => {
                    let module = &mut self.modules[module];
                    trace!(module = module.name(), "evaluate step");
                    route::forward_pair(&self.arena, input, output, src, dst, |x, y| {
                        module.evaluate(x, y)
                    })?;
                }
                Step::PassThrough { src, dst } => {
                    if !self.modules.is_empty() {
                        warn!(chain = %self.options.name, "chain ends with a branch, copying its input through");
                    }
                    route::forward_pair(&self.arena, input, output, src, dst, |x, y| {
                        y.copy_value_from(x);
                        Ok(())
                    })?;
                }
            }
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

    /// Hidden buffers only hold the last position, so every position is evaluated again right
    /// before its backward pass.
    fn backpropagate_multi(&mut self, input: &mut MultiState, output: &MultiState) -> Result<()> {
        replay_multi(self, Pass::Gradient, input, output)
    }

    fn curvature_backpropagate_multi(
        &mut self,
        input: &mut MultiState,
        output: &MultiState,
    ) -> Result<()> {
        replay_multi(self, Pass::Curvature, input, output)
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

    /// Deep copy of the modules with fresh hidden buffers.
    fn try_clone(&self) -> Result<Box<dyn Module>> {
        let modules = self
            .modules
            .iter()
            .map(|module| module.try_clone())
            .collect::<Result<Vec<_>>>()?;
        Ok(Box::new(Self::from_modules(self.options.clone(), modules)))
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

    fn compile(self: Box<Self>) -> Result<Box<dyn Module>> {
        Ok(Box::new(self.optimize_evaluate()?))
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

pub(crate) fn replay_multi(
    module: &mut dyn Module,
    pass: Pass,
    input: &mut MultiState,
    output: &MultiState,
) -> Result<()> {
    if input.is_empty() || input.len() != output.len() {
        return Err(Error::shape_mismatch(
            module.name(),
            format_args!("{} non-empty states on both sides", input.len()),
            format_args!("{} on the output side", output.len()),
        ));
    }
    for (input, output) in input.iter_mut().zip(output.iter()) {
        let mut replayed = output.clone();
        module.evaluate(input, &mut replayed)?;
        pass.run(module, input, &replayed)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Activation, Linear, activation_functions::Identity};

    #[test]
    fn empty_chain_refuses_to_run() {
        let mut chain = ModuleChain::new("empty");
        let input = StateBuffer::new([2]);
        let mut output = StateBuffer::default();
        assert_eq!(
            chain.evaluate(&input, &mut output),
            Err(Error::EmptyChain("empty".into()))
        );
    }

    #[test]
    fn hidden_buffers_one_fewer_than_modules() {
        let mut chain = ModuleChain::new("net")
            .with(Linear::new("a", 3, 3))
            .with(Activation::new(Identity))
            .with(Linear::new("b", 3, 1));
        let input = StateBuffer::new([3]);
        let mut output = StateBuffer::default();
        chain.evaluate(&input, &mut output).unwrap();
        assert_eq!(chain.n_hidden_allocated(), 2);
        assert_eq!(output.shape(), &Shape::from([1]));
    }

    #[test]
    fn plan_skips_branches() {
        let mut chain = ModuleChain::new("net")
            .with(Activation::new(Identity))
            .with(ModuleChain::branch("side").with(Activation::new(Identity)))
            .with(Activation::new(Identity));
        let steps = chain.plan(1);
        let h0 = chain.hiddens[0].unwrap();
        let h1 = chain.hiddens[1].unwrap();
        assert_eq!(
            steps,
            vec![
                Step::Apply {
                    module: 0,
                    src: Src::Input,
                    dst: Dst::Hidden(h0)
                },
                Step::Apply {
                    module: 1,
                    src: Src::Hidden(h0),
                    dst: Dst::Hidden(h1)
                },
                Step::Apply {
                    module: 2,
                    src: Src::Hidden(h0),
                    dst: Dst::Output
                },
            ]
        );
    }

    #[test]
    fn trailing_branch_passes_input_through() {
        let mut chain = ModuleChain::new("net")
            .with(Activation::new(Identity))
            .with(ModuleChain::branch("side").with(Activation::new(Identity)));
        let steps = chain.plan(1);
        let h0 = chain.hiddens[0].unwrap();
        assert_eq!(
            steps.last(),
            Some(&Step::PassThrough {
                src: Src::Hidden(h0),
                dst: Dst::Output
            })
        );
    }

    #[test]
    fn last_module_and_find_descend() {
        let chain = ModuleChain::new("net")
            .with(Linear::new("fc", 2, 2))
            .with(ModuleChain::new("inner").with(Activation::named("act", Identity)));
        assert_eq!(chain.last_module().name(), "act");
        assert_eq!(chain.find("act").map(|m| m.name()), Some("act"));
        assert_eq!(chain.find("fc").map(|m| m.name()), Some("fc"));
        assert!(chain.find("missing").is_none());
        assert_eq!(ModuleChain::new("empty").last_module().name(), "empty");
    }

    #[test]
    fn describe_lists_nested_chains() {
        let chain = ModuleChain::new("net")
            .with(Linear::new("fc", 2, 3))
            .with(ModuleChain::new("inner").with(Activation::new(Identity)));
        assert_eq!(
            chain.describe(),
            "Module net contains 2 modules:\n 0: fc (2 -> 3)\n 1: Module inner contains 1 modules:\n     0: identity"
        );
    }
}
