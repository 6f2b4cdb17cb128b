//! Graph analyses shared by the optimizer and the scheduler.
//!
//! | Module          | Provides                                        |
//! |-----------------|-------------------------------------------------|
//! | [`dfs`]         | reverse postorder, postorder numbers, preds     |
//! | [`dominators`]  | immediate dominators and dominance queries      |
//! | [`loops`]       | backedges, loop edges, natural loop bodies      |
//! | [`uses`]        | def → use indexing over every operand class     |
//!
//! Every analysis is recomputed on demand; nothing is cached on the graph
//! except the postorder numbers written by [`dfs()`].

pub mod dfs;
pub mod dominators;
pub mod loops;
pub mod uses;

pub use dfs::{dfs, dfs_from, preds};
pub use dominators::{dominates, idoms};
pub use loops::{find_loops, is_backedge, is_loop};
pub use uses::{find_uses, Uses};
