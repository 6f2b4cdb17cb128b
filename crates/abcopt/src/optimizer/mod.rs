//! Optimization passes over a method's IR.
//!
//! Each pass is a self-contained sub-module working on one
//! [`MethodBody`](crate::ir::MethodBody). The per-method order is driven
//! from [`crate::optimize`]:
//!
//! ```text
//! sccp ─► dvn ─► cfg_simplify ─┬─► fold ─► casts ─► (sched)
//!                              └─ changed: sccp ─► dvn ─┘
//! ```

// ── Analyses ─────────────────────────────────────────────────────────────────
pub mod infer;
pub mod lattice;

// ── Passes ───────────────────────────────────────────────────────────────────
pub mod casts;
pub mod cfg_simplify;
pub mod dce;
pub mod dvn;
pub mod fold;
pub mod peephole;
pub mod sccp;

pub mod utils;
