//! Lowering from SSA back to stack code.
//!
//! | Module       | Provides                                                |
//! |--------------|---------------------------------------------------------|
//! | [`greedy`]   | per-block stack scheduling and the conflict graph      |
//! | [`alloc`]    | local register assignment from the conflict graph      |
//! | [`phis`]     | phi removal: schedule, allocate, copy on split edges    |
//! | [`layout`]   | final block order, branch inversion, backward targets   |
//! | [`frame`]    | `max_stack` / `max_scope` by replaying scheduled code   |
//! | [`appease`]  | kills and coercions for the legacy verifier             |
//!
//! After [`phis::remove_phis`] a body holds real instructions only: every
//! value is either consumed from the operand stack where it was produced,
//! or stored with `setlocal` and reloaded with `getlocal`.

pub mod alloc;
pub mod appease;
pub mod frame;
pub mod greedy;
pub mod layout;
pub mod phis;

pub use alloc::alloc_locals;
pub use appease::appease;
pub use frame::compute_frame_counts;
pub use greedy::{schedule, ConflictGraph, Locals, Schedule};
pub use layout::layout;
pub use phis::remove_phis;
