//! Buffer routing shared by the standard and the memory-optimized chain.

use crate::{
    Error, Module, Result,
    core::{Field, Shape, StateArena, StateBuffer, StateHandle, Window},
};

/// Where a step reads its input from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Src {
    /// The caller's input buffer.
    Input,
    Hidden(StateHandle),
}

/// Where a step writes its output to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dst {
    /// The caller's output buffer.
    Output,
    Hidden(StateHandle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Apply { module: usize, src: Src, dst: Dst },
    /// Copies the running value to the chain's destination. Emitted when the chain ends with a
    /// branch or has no modules at all.
    PassThrough { src: Src, dst: Dst },
}

impl Step {
    pub(crate) fn src(&self) -> Src {
        match *self {
            Step::Apply { src, .. } | Step::PassThrough { src, .. } => src,
        }
    }

    pub(crate) fn dst(&self) -> Dst {
        match *self {
            Step::Apply { dst, .. } | Step::PassThrough { dst, .. } => dst,
        }
    }
}

/// Runs `f` on the `(input, output)` pair a forward step reads and writes.
///
/// Arena buffers are borrowed for the duration of `f`; a step reading and writing the same
/// buffer fails with [`Error::AliasConflict`].
pub(crate) fn forward_pair<R>(
    arena: &StateArena,
    input: &StateBuffer,
    output: &mut StateBuffer,
    src: Src,
    dst: Dst,
    f: impl FnOnce(&StateBuffer, &mut StateBuffer) -> Result<R>,
) -> Result<R> {
    match (src, dst) {
        (Src::Input, Dst::Output) => f(input, output),
        (Src::Input, Dst::Hidden(y)) => f(input, &mut *arena.get_mut(y)?),
        (Src::Hidden(x), Dst::Output) => f(&*arena.get(x)?, output),
        (Src::Hidden(x), Dst::Hidden(y)) => {
            let x = arena.get(x)?;
            let mut y = arena.get_mut(y)?;
            f(&x, &mut y)
        }
    }
}

/// Backward counterpart of [`forward_pair`]: the input is written, the output is read.
pub(crate) fn backward_pair<R>(
    arena: &StateArena,
    input: &mut StateBuffer,
    output: &StateBuffer,
    src: Src,
    dst: Dst,
    f: impl FnOnce(&mut StateBuffer, &StateBuffer) -> Result<R>,
) -> Result<R> {
    match (src, dst) {
        (Src::Input, Dst::Output) => f(input, output),
        (Src::Input, Dst::Hidden(y)) => f(input, &*arena.get(y)?),
        (Src::Hidden(x), Dst::Output) => f(&mut *arena.get_mut(x)?, output),
        (Src::Hidden(x), Dst::Hidden(y)) => {
            let mut x = arena.get_mut(x)?;
            let y = arena.get(y)?;
            f(&mut x, &y)
        }
    }
}

/// Copies the narrowed window of `input` into the chain's entry buffer.
pub(crate) fn gather(
    arena: &StateArena,
    narrow: Option<(Window, StateHandle)>,
    input: &StateBuffer,
) -> Result<()> {
    if let Some((window, entry)) = narrow {
        let part = input.narrow(window)?;
        arena.get_mut(entry)?.copy_value_from(&part);
    }
    Ok(())
}

/// Adds `field` of the chain's entry buffer back into the narrowed window of `input`.
pub(crate) fn scatter(
    arena: &StateArena,
    narrow: Option<(Window, StateHandle)>,
    field: Field,
    input: &mut StateBuffer,
) -> Result<()> {
    if let Some((window, entry)) = narrow {
        input.add_window(window, field, &*arena.get(entry)?)?;
    }
    Ok(())
}

/// Main path output shape: modules in order, branches skipped.
pub(crate) fn size_forward(
    modules: &[Box<dyn Module>],
    narrow: Option<Window>,
    input: &Shape,
) -> Result<Shape> {
    let mut shape = match narrow {
        Some(window) => window.shape_in(input)?,
        None => input.clone(),
    };
    for module in modules.iter().filter(|m| !m.is_branch()) {
        shape = module.size_forward(&shape)?;
    }
    Ok(shape)
}

/// Main path input shape: modules in reverse order, branches skipped. A narrowing window
/// expands back to the smallest extent that contains it.
pub(crate) fn size_backward(
    modules: &[Box<dyn Module>],
    narrow: Option<Window>,
    output: &Shape,
) -> Result<Shape> {
    let mut shape = output.clone();
    for module in modules.iter().rev().filter(|m| !m.is_branch()) {
        shape = module.size_backward(&shape)?;
    }
    match narrow {
        Some(window) if window.axis < shape.rank() => {
            Ok(shape.with_extent(window.axis, window.offset + window.len))
        }
        Some(window) => Err(crate::ShapeError::AxisOutOfRange {
            axis: window.axis,
            rank: shape.rank(),
        }
        .into()),
        None => Ok(shape),
    }
}

/// Concatenated `" -> name -> (dims)"` of every module, advancing the shape along the main path.
pub(crate) fn pretty(
    modules: &[Box<dyn Module>],
    narrow: Option<Window>,
    input: &Shape,
) -> Result<String> {
    let mut shape = match narrow {
        Some(window) => window.shape_in(input)?,
        None => input.clone(),
    };
    let mut s = String::new();
    for module in modules {
        s += &module.pretty(&shape)?;
        if !module.is_branch() {
            shape = module.size_forward(&shape)?;
        }
    }
    Ok(s)
}

/// Depth-first search for a module named `name`, the container itself excluded.
pub(crate) fn find<'a>(modules: &'a [Box<dyn Module>], name: &str) -> Option<&'a dyn Module> {
    modules.iter().find_map(|module| {
        if module.name() == name {
            Some(module.as_ref())
        } else {
            find(module.children(), name)
        }
    })
}

pub(crate) fn clear_hidden(
    arena: &StateArena,
    modules: &mut [Box<dyn Module>],
    field: Field,
) -> Result<()> {
    arena.clear(field)?;
    for module in modules {
        module.clear_hidden(field)?;
    }
    Ok(())
}

pub(crate) fn empty_chain(name: &str) -> Error {
    Error::EmptyChain(name.to_owned())
}
