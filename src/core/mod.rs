//! Buffers and geometry every module reads and writes.

mod arena;
mod multi_state;
mod shape;
mod state;

pub use arena::*;
pub use multi_state::*;
pub use shape::*;
pub use state::*;
