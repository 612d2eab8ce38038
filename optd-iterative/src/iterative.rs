//! The iterative optimizer: a memo that keeps one expression per group so that rules can rewrite a
//! plan locally, and a driver that applies rules until nothing changes.

mod lookup;
mod memo;
mod optimizer;

pub use lookup::{expand, resolve_group_references, Lookup};
pub use memo::{GroupId, Memo};
pub use optimizer::{IterativeOptimizer, IterativeOptimizerOptions, OptimizerContext};
