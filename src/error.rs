use std::fmt::Display;

use thiserror::Error;

use crate::core::{Shape, StateHandle};

/// Geometry errors raised by buffers and views.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShapeError {
    #[error("axis {axis} is out of range for a rank {rank} buffer")]
    AxisOutOfRange { axis: usize, rank: usize },

    #[error("window of {len} at offset {offset} exceeds extent {extent} of axis {axis}")]
    WindowOutOfRange {
        axis: usize,
        len: usize,
        offset: usize,
        extent: usize,
    },

    #[error("{n_values} values cannot fill a buffer of shape {shape}")]
    LengthMismatch { shape: Shape, n_values: usize },

    #[error("cannot resize a view of shape {view} to {requested}")]
    ViewResize { view: Shape, requested: Shape },

    #[error("cannot stack slices of shapes {first} and {other}")]
    RaggedSlices { first: Shape, other: Shape },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("module '{module}' does not implement {op}")]
    UnimplementedOp { module: String, op: &'static str },

    #[error("shape mismatch in '{module}': expected {expected}, got {actual}")]
    ShapeMismatch {
        module: String,
        expected: String,
        actual: String,
    },

    #[error("cannot run '{0}': the chain has no modules")]
    EmptyChain(String),

    #[error("module '{0}' has no operating order and cannot be replicated")]
    NotReplicable(String),

    #[error("module '{module}' operates on rank {order} but the input has rank {rank}")]
    OrderMismatch {
        module: String,
        order: usize,
        rank: usize,
    },

    #[error("'{0}' is memory-optimized and only supports single-state passes")]
    ModeConflict(String),

    #[error("module '{0}' cannot be cloned")]
    CloneUnsupported(String),

    #[error(transparent)]
    Shape(#[from] ShapeError),

    #[error("buffer {0} is already borrowed by another role")]
    AliasConflict(StateHandle),

    #[error("no buffer {0} in this arena")]
    UnknownHandle(StateHandle),

    #[error("view into buffer {0} outlived its owner")]
    DanglingView(StateHandle),
}

impl Error {
    pub(crate) fn unimplemented(module: &str, op: &'static str) -> Self {
        Self::UnimplementedOp {
            module: module.to_owned(),
            op,
        }
    }

    pub(crate) fn shape_mismatch(module: &str, expected: impl Display, actual: impl Display) -> Self {
        Self::ShapeMismatch {
            module: module.to_owned(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
