pub use faer;

pub mod core;

mod activation;
mod chain;
mod error;
mod linear;
mod merge;
mod module;
mod params;
mod pretty_print;
mod replicated;

pub use activation::*;
pub use chain::*;
pub use error::*;
pub use linear::*;
pub use merge::*;
pub use module::*;
pub use params::*;
pub use pretty_print::*;
pub use replicated::*;

pub use crate::core::{Field, MultiState, Shape, StateArena, StateBuffer, StateHandle, StateView, Window};
