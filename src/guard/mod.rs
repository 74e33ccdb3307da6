//! Guard pipeline core: per-request budget state, the interception pipeline,
//! and the toolset wrapper.
//!
//! The [`GuardPipeline`] orchestrates classification, decision, budget
//! checks, timeout-bounded execution, and audit emission around each wrapped
//! tool. A [`GuardContext`] is the only mutable state shared across the
//! invocations of one logical request.

pub mod context;
pub mod pipeline;
pub mod wrapper;

pub use context::{BudgetBreach, GuardContext};
pub use pipeline::{GuardError, GuardOptions, GuardPipeline};
pub use wrapper::GuardedTool;
