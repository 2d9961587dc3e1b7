//! Static capability introspection: derive a stable contract for a compiled
//! tool, diff two contracts with severity classification, and
//! generate/check a lockfile across a whole registry.

pub mod contract;
pub mod diff;
pub mod lockfile;

pub use contract::ToolContract;
pub use diff::{ContractChange, Severity, diff, top_actionable};
pub use lockfile::{CheckResult, Lockfile};
