//! Intermediate representation for method bodies.
//!
//! Each decoded body becomes an SSA-form arena graph that the optimizer
//! rewrites in place and the scheduler lowers back to stack code.

mod types;
pub use types::*;

pub mod builder;
pub use builder::{decode_body, BodyInput};
